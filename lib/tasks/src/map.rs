// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Bounded parallel mapping over a finite input set.
//!
//! A call to [`map`] or [`map_unordered`] starts `min(P, K)` worker tasks for
//! `K` inputs and a pool size of `P`, plus one dispatcher task. Workers pull
//! inputs from a shared bounded queue, run the user function, and push results
//! toward the consumer; every suspension point also watches the cancellation
//! handle, so a cancelled run winds down as soon as each task reaches its next
//! await.
//!
//! The ordered variants re-sequence out-of-order completions through a
//! `P`-slot ring buffer and only feed a new input once a result has been
//! consumed, which keeps at most `P` indices in flight and the buffer
//! collision-free.
//!
//! The error-aware variants ([`map_err`], [`map_err_unordered`]) carry a
//! [`Fallible`] payload and stop dispatching new inputs after the first
//! reported error; already-dispatched inputs still complete and are delivered.
//!
//! Dropping a result receiver also tears the pipeline down: worker sends fail
//! and every task exits. Cancellation remains the preferred early-exit signal
//! since it does not wait for in-flight results to be consumed.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::Error;

/// Worker-pool size used when the caller passes `0`.
pub const DEFAULT_POOL_SIZE: usize = 10;

fn effective_pool(pool: usize) -> usize {
    if pool == 0 {
        DEFAULT_POOL_SIZE
    } else {
        pool
    }
}

/// A value paired with an optional error, the payload of the error-aware
/// mapping variants.
///
/// Unlike `Result`, both sides can be populated at once: a search callback
/// returns its match alongside [`crate::error::SearchSuccess`] to stop the
/// sweep while keeping the value.
#[derive(Debug)]
pub struct Fallible<T> {
    /// The mapped value. Meaningful whenever `error` is `None`, and for the
    /// sentinel conventions that pair a value with an error.
    pub value: T,
    /// The error reported by the user function, if any.
    pub error: Option<Error>,
}

impl<T> Fallible<T> {
    /// A successful result.
    pub fn ok(value: T) -> Self {
        Self { value, error: None }
    }

    /// A result carrying both a value and an optional error.
    pub fn new(value: T, error: Option<Error>) -> Self {
        Self { value, error }
    }

    /// Splits the pair.
    pub fn into_parts(self) -> (T, Option<Error>) {
        (self.value, self.error)
    }

    /// True if an error is attached.
    pub fn is_err(&self) -> bool {
        self.error.is_some()
    }
}

/// An input or result tagged with its position in the original input order.
struct Job<T> {
    payload: T,
    index: usize,
}

/// Applies `func` to every input on a pool of `pool` workers and returns the
/// results in input order.
///
/// The receiver must be consumed to completion unless the run is cancelled;
/// see [`map_with_cancellation`]. A `pool` of `0` selects
/// [`DEFAULT_POOL_SIZE`].
pub fn map<I, R, F, Fut>(pool: usize, func: F, inputs: Vec<I>) -> mpsc::Receiver<R>
where
    I: Send + 'static,
    R: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
{
    map_with_cancellation(&CancellationToken::new(), pool, func, inputs)
}

/// [`map`] observing a cancellation handle.
///
/// Cancel the token if the receiver will not be drained, so the workers and
/// the dispatcher stop in bounded time.
pub fn map_with_cancellation<I, R, F, Fut>(
    token: &CancellationToken,
    pool: usize,
    func: F,
    inputs: Vec<I>,
) -> mpsc::Receiver<R>
where
    I: Send + 'static,
    R: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
{
    map_ordered_inner(token.clone(), pool, func, inputs, None)
}

/// [`map`] with results delivered in completion order.
pub fn map_unordered<I, R, F, Fut>(pool: usize, func: F, inputs: Vec<I>) -> mpsc::Receiver<R>
where
    I: Send + 'static,
    R: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
{
    map_unordered_with_cancellation(&CancellationToken::new(), pool, func, inputs)
}

/// [`map_unordered`] observing a cancellation handle.
pub fn map_unordered_with_cancellation<I, R, F, Fut>(
    token: &CancellationToken,
    pool: usize,
    func: F,
    inputs: Vec<I>,
) -> mpsc::Receiver<R>
where
    I: Send + 'static,
    R: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
{
    map_unordered_inner(token.clone(), pool, func, inputs, None)
}

/// Error-aware [`map`]: results arrive in input order and the first reported
/// error stops dispatch of further inputs.
pub fn map_err<I, R, F, Fut>(pool: usize, func: F, inputs: Vec<I>) -> FallibleResults<R>
where
    I: Send + 'static,
    R: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Fallible<R>> + Send + 'static,
{
    map_err_with_cancellation(&CancellationToken::new(), pool, func, inputs)
}

/// [`map_err`] observing a cancellation handle.
pub fn map_err_with_cancellation<I, R, F, Fut>(
    token: &CancellationToken,
    pool: usize,
    func: F,
    inputs: Vec<I>,
) -> FallibleResults<R>
where
    I: Send + 'static,
    R: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Fallible<R>> + Send + 'static,
{
    FallibleResults {
        results: fallible_inner(token.clone(), true, pool, func, inputs),
        token: token.clone(),
    }
}

/// Error-aware [`map_unordered`].
pub fn map_err_unordered<I, R, F, Fut>(pool: usize, func: F, inputs: Vec<I>) -> FallibleResults<R>
where
    I: Send + 'static,
    R: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Fallible<R>> + Send + 'static,
{
    map_err_unordered_with_cancellation(&CancellationToken::new(), pool, func, inputs)
}

/// [`map_err_unordered`] observing a cancellation handle.
pub fn map_err_unordered_with_cancellation<I, R, F, Fut>(
    token: &CancellationToken,
    pool: usize,
    func: F,
    inputs: Vec<I>,
) -> FallibleResults<R>
where
    I: Send + 'static,
    R: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Fallible<R>> + Send + 'static,
{
    FallibleResults {
        results: fallible_inner(token.clone(), false, pool, func, inputs),
        token: token.clone(),
    }
}

/// Pull handle over an error-aware mapping run.
pub struct FallibleResults<R> {
    results: mpsc::Receiver<Fallible<R>>,
    token: CancellationToken,
}

impl<R> FallibleResults<R> {
    /// Pulls the next result.
    ///
    /// `None` means the sequence is exhausted: every dispatched input has
    /// reported, or the cancellation handle fired. Results produced before an
    /// abort may or may not be delivered.
    pub async fn next(&mut self) -> Option<Fallible<R>> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => None,
            item = self.results.recv() => item,
        }
    }
}

/// Runs the engine with a [`Fallible`] payload and an error side channel
/// sized to the input count, so the dispatcher can stop feeding after the
/// first reported error.
pub(crate) fn fallible_inner<I, R, F, Fut>(
    token: CancellationToken,
    ordered: bool,
    pool: usize,
    func: F,
    inputs: Vec<I>,
) -> mpsc::Receiver<Fallible<R>>
where
    I: Send + 'static,
    R: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Fallible<R>> + Send + 'static,
{
    let (error_tx, error_rx) = flume::bounded::<()>(inputs.len().max(1));
    let func = Arc::new(func);
    let wrapped = move |input: I| {
        let func = Arc::clone(&func);
        let error_tx = error_tx.clone();
        async move {
            let result = (*func)(input).await;
            if result.is_err() {
                // Capacity covers one signal per input, so this cannot drop
                // a signal while the dispatcher is still listening.
                let _ = error_tx.try_send(());
            }
            result
        }
    };
    if ordered {
        map_ordered_inner(token, pool, wrapped, inputs, Some(error_rx))
    } else {
        map_unordered_inner(token, pool, wrapped, inputs, Some(error_rx))
    }
}

/// Resolves when the error signal fires. A missing signal channel never
/// resolves; a disconnected one resolves, which only happens once every
/// worker has already exited.
async fn signalled(signal: Option<&flume::Receiver<()>>) {
    match signal {
        Some(signal) => {
            let _ = signal.recv_async().await;
        }
        None => std::future::pending().await,
    }
}

/// Sends one result to the consumer unless cancellation wins the race.
/// Returns false when the run should stop (cancelled or consumer gone).
async fn emit<R>(results: &mpsc::Sender<R>, token: &CancellationToken, value: R) -> bool {
    tokio::select! {
        biased;
        _ = token.cancelled() => false,
        sent = results.send(value) => sent.is_ok(),
    }
}

fn spawn_worker<I, R, F, Fut>(
    input: flume::Receiver<I>,
    output: mpsc::Sender<R>,
    func: Arc<F>,
    token: CancellationToken,
) where
    I: Send + 'static,
    R: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let item = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                item = input.recv_async() => match item {
                    Ok(item) => item,
                    Err(_) => break,
                },
            };
            let result = (*func)(item).await;
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                sent = output.send(result) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }
        }
    });
}

fn map_unordered_inner<I, R, F, Fut>(
    token: CancellationToken,
    pool: usize,
    func: F,
    inputs: Vec<I>,
    error_signal: Option<flume::Receiver<()>>,
) -> mpsc::Receiver<R>
where
    I: Send + 'static,
    R: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
{
    let pool = effective_pool(pool);
    let workers = pool.min(inputs.len());
    let (input_tx, input_rx) = flume::bounded::<I>(pool);
    let (output_tx, output_rx) = mpsc::channel::<R>(pool);

    let func = Arc::new(func);
    for _ in 0..workers {
        spawn_worker(
            input_rx.clone(),
            output_tx.clone(),
            Arc::clone(&func),
            token.clone(),
        );
    }
    // The workers own the only sender clones now; the channel closes once
    // they all exit.
    drop(output_tx);
    drop(input_rx);

    tokio::spawn(async move {
        for item in inputs {
            tokio::select! {
                biased;
                _ = signalled(error_signal.as_ref()) => {
                    trace!(target: "dynamo_tasks::map", "error reported, dispatch stopped");
                    break;
                }
                _ = token.cancelled() => {
                    trace!(target: "dynamo_tasks::map", "cancelled, dispatch stopped");
                    break;
                }
                sent = input_tx.send_async(item) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }
        }
        // Dropping the sender closes the input queue; workers drain what is
        // buffered and exit.
    });

    output_rx
}

fn map_ordered_inner<I, R, F, Fut>(
    token: CancellationToken,
    pool: usize,
    func: F,
    inputs: Vec<I>,
    error_signal: Option<flume::Receiver<()>>,
) -> mpsc::Receiver<R>
where
    I: Send + 'static,
    R: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
{
    let pool = effective_pool(pool);
    let total = inputs.len();
    let workers = pool.min(total);
    let (input_tx, input_rx) = flume::bounded::<Job<I>>(pool);
    let (worker_tx, mut worker_rx) = mpsc::channel::<Job<R>>(pool);
    let (results_tx, results_rx) = mpsc::channel::<R>(pool);

    let func = Arc::new(func);
    let tagged = Arc::new(move |job: Job<I>| {
        let func = Arc::clone(&func);
        async move {
            Job {
                payload: (*func)(job.payload).await,
                index: job.index,
            }
        }
    });
    for _ in 0..workers {
        spawn_worker(
            input_rx.clone(),
            worker_tx.clone(),
            Arc::clone(&tagged),
            token.clone(),
        );
    }
    drop(worker_tx);
    drop(input_rx);

    tokio::spawn(async move {
        let mut buffer: Vec<Option<R>> = std::iter::repeat_with(|| None).take(pool).collect();
        let mut source = inputs.into_iter().enumerate();
        let mut input_tx = Some(input_tx);

        // Fill the pool. The queue capacity equals the pool size, so these
        // sends cannot block on a full buffer.
        for _ in 0..workers {
            let Some((index, payload)) = source.next() else {
                break;
            };
            let Some(tx) = &input_tx else { break };
            if tx.send_async(Job { payload, index }).await.is_err() {
                break;
            }
        }
        let mut dispatched = workers;
        if dispatched >= total {
            // Every input is buffered or in flight; close so workers exit
            // when the queue drains.
            input_tx = None;
        }

        // `limit` shrinks to the dispatched count when the error signal
        // fires: in-flight inputs still complete, new ones are not fed.
        let mut limit = total;
        let mut read = 0usize;
        let mut next_emit = 0usize;

        'collect: while read < limit {
            let job = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    input_tx = None;
                    break 'collect;
                }
                job = worker_rx.recv() => match job {
                    Some(job) => job,
                    None => break 'collect,
                },
            };
            read += 1;

            // Emit in sequence, or hold out-of-order completions in the ring
            // buffer. At most `pool` indices are in flight, so the slot for
            // `index % pool` is always vacant.
            if job.index == next_emit {
                if !emit(&results_tx, &token, job.payload).await {
                    break 'collect;
                }
                next_emit += 1;
            } else {
                buffer[job.index % pool] = Some(job.payload);
            }
            while let Some(ready) = buffer[next_emit % pool].take() {
                if !emit(&results_tx, &token, ready).await {
                    break 'collect;
                }
                next_emit += 1;
            }

            // Top the pool back off: one new input per consumed result keeps
            // the in-flight window at `pool`.
            while dispatched < limit && next_emit + pool > dispatched {
                let Some((index, payload)) = source.next() else {
                    break;
                };
                let Some(tx) = &input_tx else { break };
                let mut stop = false;
                tokio::select! {
                    biased;
                    _ = signalled(error_signal.as_ref()) => {
                        trace!(target: "dynamo_tasks::map", "error reported, dispatch stopped");
                        limit = dispatched;
                    }
                    _ = token.cancelled() => {
                        stop = true;
                    }
                    sent = tx.send_async(Job { payload, index }) => {
                        if sent.is_err() {
                            stop = true;
                        } else {
                            dispatched += 1;
                        }
                    }
                }
                if stop {
                    input_tx = None;
                    break 'collect;
                }
                if dispatched >= limit {
                    input_tx = None;
                }
            }
        }
        // Dropping our channel ends tears the rest down: workers stop when
        // the input queue closes or their result send fails, and the consumer
        // sees the result stream close.
    });

    results_rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::{sleep, Duration};

    async fn drain<R>(mut rx: mpsc::Receiver<R>) -> Vec<R> {
        let mut out = Vec::new();
        while let Some(value) = rx.recv().await {
            out.push(value);
        }
        out
    }

    #[tokio::test]
    async fn ordered_map_preserves_input_order() {
        let inputs: Vec<i64> = (1..=60).collect();
        let rx = map(5, |n: i64| async move { (n + 10).to_string() }, inputs);
        let out = drain(rx).await;
        let expected: Vec<String> = (11..=70).map(|n| n.to_string()).collect();
        assert_eq!(out, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn unordered_map_yields_every_result() {
        let inputs: Vec<u64> = (1..=30).collect();
        let rx = map_unordered(
            4,
            |n: u64| async move {
                sleep(Duration::from_millis((n % 7) * 10)).await;
                n * 2
            },
            inputs,
        );
        let mut out = drain(rx).await;
        out.sort_unstable();
        let expected: Vec<u64> = (1..=30).map(|n| n * 2).collect();
        assert_eq!(out, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn pool_bound_holds() {
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let inputs: Vec<u32> = (0..9).collect();
        let rx = {
            let current = Arc::clone(&current);
            let peak = Arc::clone(&peak);
            map(3, move |n: u32| {
                let current = Arc::clone(&current);
                let peak = Arc::clone(&peak);
                async move {
                    let live = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(live, Ordering::SeqCst);
                    sleep(Duration::from_millis(20)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    n
                }
            }, inputs)
        };
        let out = drain(rx).await;
        assert_eq!(out.len(), 9);
        assert_eq!(peak.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_pool_size_selects_default() {
        let peak = Arc::new(AtomicUsize::new(0));
        let current = Arc::new(AtomicUsize::new(0));
        let inputs: Vec<u32> = (0..30).collect();
        let rx = {
            let current = Arc::clone(&current);
            let peak = Arc::clone(&peak);
            map_unordered(0, move |n: u32| {
                let current = Arc::clone(&current);
                let peak = Arc::clone(&peak);
                async move {
                    let live = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(live, Ordering::SeqCst);
                    sleep(Duration::from_millis(50)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    n
                }
            }, inputs)
        };
        let out = drain(rx).await;
        assert_eq!(out.len(), 30);
        assert_eq!(peak.load(Ordering::SeqCst), DEFAULT_POOL_SIZE);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_closes_the_stream_early() {
        let token = CancellationToken::new();
        let inputs: Vec<u32> = (0..40).collect();
        let mut rx = map_with_cancellation(
            &token,
            4,
            |n: u32| async move {
                sleep(Duration::from_millis(50)).await;
                n
            },
            inputs,
        );

        let mut received = 0usize;
        while rx.recv().await.is_some() {
            received += 1;
            if received == 4 {
                token.cancel();
            }
        }
        assert!(received < 40, "received {received} results after cancel");
    }

    #[tokio::test]
    async fn empty_input_closes_immediately() {
        let mut rx = map(3, |n: u32| async move { n }, Vec::new());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn pool_larger_than_input_is_fine() {
        let rx = map(100, |n: u32| async move { n + 1 }, vec![1, 2, 3, 4, 5]);
        assert_eq!(drain(rx).await, vec![2, 3, 4, 5, 6]);
    }

    #[tokio::test(start_paused = true)]
    async fn map_err_stops_dispatch_after_first_error() {
        let inputs: Vec<u32> = (1..=60).collect();
        let mut results = map_err(
            2,
            |n: u32| async move {
                sleep(Duration::from_millis(10)).await;
                if n == 5 {
                    Fallible::new(0, Some(anyhow::anyhow!("boom")))
                } else {
                    Fallible::ok(n)
                }
            },
            inputs,
        );

        let mut values = Vec::new();
        let mut first_error = None;
        let mut received = 0usize;
        while let Some(item) = results.next().await {
            received += 1;
            let (value, error) = item.into_parts();
            if let Some(error) = error {
                if first_error.is_none() {
                    first_error = Some(error);
                }
            } else {
                values.push(value);
            }
        }

        let error = first_error.expect("expected an error");
        assert_eq!(error.to_string(), "boom");
        assert!(received < 60, "dispatch kept running: {received} results");
        // Ordered delivery: everything before the failing input arrives first.
        assert_eq!(&values[..4], &[1, 2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn map_err_unordered_reports_every_dispatched_input_once() {
        let inputs: Vec<u32> = (1..=20).collect();
        let mut results = map_err_unordered(
            5,
            |n: u32| async move {
                sleep(Duration::from_millis(((n % 3) * 10) as u64)).await;
                Fallible::ok(n)
            },
            inputs,
        );
        let mut seen = Vec::new();
        while let Some(item) = results.next().await {
            assert!(!item.is_err());
            seen.push(item.value);
        }
        seen.sort_unstable();
        let expected: Vec<u32> = (1..=20).collect();
        assert_eq!(seen, expected);
    }
}
