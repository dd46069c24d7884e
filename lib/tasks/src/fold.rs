// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Serial reductions over an error-aware parallel mapping run.
//!
//! Each operation maps its inputs on a bounded worker pool (see
//! [`crate::map`]) and folds the results on the calling task. The first error,
//! whether reported by the mapped function, the fold step, or the cancellation
//! handle, stops dispatch of new inputs; results already in flight are drained
//! without being applied so the workers can terminate, and the recorded error
//! is returned.
//!
//! [`search`] uses the sentinel convention: a mapped function returns its
//! match paired with [`SearchSuccess`] to stop the sweep, and the sweep
//! reports [`SearchFailure`] if the inputs run out first.

use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::error::{Cancelled, SearchFailure, SearchSuccess};
use crate::map::{fallible_inner, Fallible};
use crate::{Error, Result};

/// Maps every input and materializes the results into a `Vec` in input order.
/// Returns the first error instead, if any.
pub async fn collect<I, R, F, Fut>(pool: usize, func: F, inputs: Vec<I>) -> Result<Vec<R>>
where
    I: Send + 'static,
    R: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Fallible<R>> + Send + 'static,
{
    collect_with_cancellation(&CancellationToken::new(), pool, func, inputs).await
}

/// [`collect`] observing a cancellation handle.
pub async fn collect_with_cancellation<I, R, F, Fut>(
    token: &CancellationToken,
    pool: usize,
    func: F,
    inputs: Vec<I>,
) -> Result<Vec<R>>
where
    I: Send + 'static,
    R: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Fallible<R>> + Send + 'static,
{
    let capacity = inputs.len();
    inject_inner(
        token,
        true,
        pool,
        Vec::with_capacity(capacity),
        func,
        |acc, value| {
            acc.push(value);
            Ok(())
        },
        inputs,
    )
    .await
}

/// [`collect`] with results gathered in completion order.
pub async fn collect_unordered<I, R, F, Fut>(pool: usize, func: F, inputs: Vec<I>) -> Result<Vec<R>>
where
    I: Send + 'static,
    R: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Fallible<R>> + Send + 'static,
{
    collect_unordered_with_cancellation(&CancellationToken::new(), pool, func, inputs).await
}

/// [`collect_unordered`] observing a cancellation handle.
pub async fn collect_unordered_with_cancellation<I, R, F, Fut>(
    token: &CancellationToken,
    pool: usize,
    func: F,
    inputs: Vec<I>,
) -> Result<Vec<R>>
where
    I: Send + 'static,
    R: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Fallible<R>> + Send + 'static,
{
    let capacity = inputs.len();
    inject_inner(
        token,
        false,
        pool,
        Vec::with_capacity(capacity),
        func,
        |acc, value| {
            acc.push(value);
            Ok(())
        },
        inputs,
    )
    .await
}

/// Folds mapped results into a caller-supplied accumulator. The fold step
/// runs serially on the calling task, in input order.
pub async fn inject<I, R, A, F, Fut, G>(
    pool: usize,
    initial: A,
    func: F,
    fold: G,
    inputs: Vec<I>,
) -> Result<A>
where
    I: Send + 'static,
    R: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Fallible<R>> + Send + 'static,
    G: FnMut(&mut A, R) -> Result<()>,
{
    inject_inner(&CancellationToken::new(), true, pool, initial, func, fold, inputs).await
}

/// [`inject`] observing a cancellation handle.
pub async fn inject_with_cancellation<I, R, A, F, Fut, G>(
    token: &CancellationToken,
    pool: usize,
    initial: A,
    func: F,
    fold: G,
    inputs: Vec<I>,
) -> Result<A>
where
    I: Send + 'static,
    R: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Fallible<R>> + Send + 'static,
    G: FnMut(&mut A, R) -> Result<()>,
{
    inject_inner(token, true, pool, initial, func, fold, inputs).await
}

/// [`inject`] folding in completion order.
pub async fn inject_unordered<I, R, A, F, Fut, G>(
    pool: usize,
    initial: A,
    func: F,
    fold: G,
    inputs: Vec<I>,
) -> Result<A>
where
    I: Send + 'static,
    R: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Fallible<R>> + Send + 'static,
    G: FnMut(&mut A, R) -> Result<()>,
{
    inject_inner(&CancellationToken::new(), false, pool, initial, func, fold, inputs).await
}

/// [`inject_unordered`] observing a cancellation handle.
pub async fn inject_unordered_with_cancellation<I, R, A, F, Fut, G>(
    token: &CancellationToken,
    pool: usize,
    initial: A,
    func: F,
    fold: G,
    inputs: Vec<I>,
) -> Result<A>
where
    I: Send + 'static,
    R: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Fallible<R>> + Send + 'static,
    G: FnMut(&mut A, R) -> Result<()>,
{
    inject_inner(token, false, pool, initial, func, fold, inputs).await
}

/// [`inject`] with the accumulator starting at `R::default()`.
pub async fn reduce<I, R, F, Fut, G>(pool: usize, func: F, fold: G, inputs: Vec<I>) -> Result<R>
where
    I: Send + 'static,
    R: Default + Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Fallible<R>> + Send + 'static,
    G: FnMut(&mut R, R) -> Result<()>,
{
    inject_inner(&CancellationToken::new(), true, pool, R::default(), func, fold, inputs).await
}

/// [`reduce`] observing a cancellation handle.
pub async fn reduce_with_cancellation<I, R, F, Fut, G>(
    token: &CancellationToken,
    pool: usize,
    func: F,
    fold: G,
    inputs: Vec<I>,
) -> Result<R>
where
    I: Send + 'static,
    R: Default + Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Fallible<R>> + Send + 'static,
    G: FnMut(&mut R, R) -> Result<()>,
{
    inject_inner(token, true, pool, R::default(), func, fold, inputs).await
}

/// [`reduce`] folding in completion order.
pub async fn reduce_unordered<I, R, F, Fut, G>(
    pool: usize,
    func: F,
    fold: G,
    inputs: Vec<I>,
) -> Result<R>
where
    I: Send + 'static,
    R: Default + Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Fallible<R>> + Send + 'static,
    G: FnMut(&mut R, R) -> Result<()>,
{
    inject_inner(&CancellationToken::new(), false, pool, R::default(), func, fold, inputs).await
}

/// [`reduce_unordered`] observing a cancellation handle.
pub async fn reduce_unordered_with_cancellation<I, R, F, Fut, G>(
    token: &CancellationToken,
    pool: usize,
    func: F,
    fold: G,
    inputs: Vec<I>,
) -> Result<R>
where
    I: Send + 'static,
    R: Default + Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Fallible<R>> + Send + 'static,
    G: FnMut(&mut R, R) -> Result<()>,
{
    inject_inner(token, false, pool, R::default(), func, fold, inputs).await
}

/// Sweeps the inputs until a callback reports [`SearchSuccess`], returning the
/// value it paired with the sentinel. Exhaustion yields [`SearchFailure`]; any
/// other error aborts the sweep and is returned as-is.
pub async fn search<I, R, F, Fut>(pool: usize, func: F, inputs: Vec<I>) -> Result<R>
where
    I: Send + 'static,
    R: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Fallible<R>> + Send + 'static,
{
    search_inner(&CancellationToken::new(), true, pool, func, inputs).await
}

/// [`search`] observing a cancellation handle.
pub async fn search_with_cancellation<I, R, F, Fut>(
    token: &CancellationToken,
    pool: usize,
    func: F,
    inputs: Vec<I>,
) -> Result<R>
where
    I: Send + 'static,
    R: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Fallible<R>> + Send + 'static,
{
    search_inner(token, true, pool, func, inputs).await
}

/// [`search`] examining results in completion order.
pub async fn search_unordered<I, R, F, Fut>(pool: usize, func: F, inputs: Vec<I>) -> Result<R>
where
    I: Send + 'static,
    R: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Fallible<R>> + Send + 'static,
{
    search_inner(&CancellationToken::new(), false, pool, func, inputs).await
}

/// [`search_unordered`] observing a cancellation handle.
pub async fn search_unordered_with_cancellation<I, R, F, Fut>(
    token: &CancellationToken,
    pool: usize,
    func: F,
    inputs: Vec<I>,
) -> Result<R>
where
    I: Send + 'static,
    R: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Fallible<R>> + Send + 'static,
{
    search_inner(token, false, pool, func, inputs).await
}

/// Runs `func` over every input for its effect, discarding values. Returns
/// the first error unchanged, sentinels included.
pub async fn for_each<I, F, Fut>(pool: usize, func: F, inputs: Vec<I>) -> Result<()>
where
    I: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    for_each_inner(&CancellationToken::new(), true, pool, func, inputs).await
}

/// [`for_each`] observing a cancellation handle.
pub async fn for_each_with_cancellation<I, F, Fut>(
    token: &CancellationToken,
    pool: usize,
    func: F,
    inputs: Vec<I>,
) -> Result<()>
where
    I: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    for_each_inner(token, true, pool, func, inputs).await
}

/// [`for_each`] without ordering overhead.
pub async fn for_each_unordered<I, F, Fut>(pool: usize, func: F, inputs: Vec<I>) -> Result<()>
where
    I: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    for_each_inner(&CancellationToken::new(), false, pool, func, inputs).await
}

/// [`for_each_unordered`] observing a cancellation handle.
pub async fn for_each_unordered_with_cancellation<I, F, Fut>(
    token: &CancellationToken,
    pool: usize,
    func: F,
    inputs: Vec<I>,
) -> Result<()>
where
    I: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    for_each_inner(token, false, pool, func, inputs).await
}

async fn for_each_inner<I, F, Fut>(
    token: &CancellationToken,
    ordered: bool,
    pool: usize,
    func: F,
    inputs: Vec<I>,
) -> Result<()>
where
    I: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let wrapped = move |input: I| {
        let applied = func(input);
        async move {
            match applied.await {
                Ok(()) => Fallible::ok(()),
                Err(error) => Fallible::new((), Some(error)),
            }
        }
    };
    inject_inner(token, ordered, pool, (), wrapped, |_, ()| Ok(()), inputs).await
}

async fn inject_inner<I, R, A, F, Fut, G>(
    token: &CancellationToken,
    ordered: bool,
    pool: usize,
    mut acc: A,
    func: F,
    mut fold: G,
    inputs: Vec<I>,
) -> Result<A>
where
    I: Send + 'static,
    R: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Fallible<R>> + Send + 'static,
    G: FnMut(&mut A, R) -> Result<()>,
{
    let mut results = fallible_inner(token.clone(), ordered, pool, func, inputs);
    let mut failure: Option<Error> = None;
    while let Some(item) = results.recv().await {
        if failure.is_some() {
            // Keep draining so in-flight workers can finish.
            continue;
        }
        let (value, error) = item.into_parts();
        if let Some(error) = error {
            failure = Some(error);
            continue;
        }
        if token.is_cancelled() {
            failure = Some(Cancelled.into());
            continue;
        }
        if let Err(error) = fold(&mut acc, value) {
            failure = Some(error);
        }
    }
    if let Some(error) = failure {
        return Err(error);
    }
    if token.is_cancelled() {
        return Err(Cancelled.into());
    }
    Ok(acc)
}

async fn search_inner<I, R, F, Fut>(
    token: &CancellationToken,
    ordered: bool,
    pool: usize,
    func: F,
    inputs: Vec<I>,
) -> Result<R>
where
    I: Send + 'static,
    R: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Fallible<R>> + Send + 'static,
{
    let mut results = fallible_inner(token.clone(), ordered, pool, func, inputs);
    let mut outcome: Option<(R, Error)> = None;
    let mut cancelled = false;
    while let Some(item) = results.recv().await {
        if outcome.is_some() || cancelled {
            continue;
        }
        if token.is_cancelled() {
            cancelled = true;
            continue;
        }
        let (value, error) = item.into_parts();
        if let Some(error) = error {
            outcome = Some((value, error));
        }
    }
    match outcome {
        Some((value, error)) if error.downcast_ref::<SearchSuccess>().is_some() => Ok(value),
        Some((_, error)) => Err(error),
        None if cancelled || token.is_cancelled() => Err(Cancelled.into()),
        None => Err(SearchFailure.into()),
    }
}
