// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Single-flight call coalescing with optional result caching.
//!
//! A [`Coalescer`] wraps a parameterless async call so that at most one
//! invocation runs at a time. Callers that arrive while a call is in flight
//! register a one-shot waiter slot and all receive the same result when the
//! background pump finishes. With [`Coalescer::with_cache`], successful
//! results are also kept for `ttl`: within that window callers are served
//! from cache without any task being spawned, and for a further `grace`
//! window the stale value is still served while a single refresh runs in the
//! background.
//!
//! Failures are fanned out to every registered waiter as a [`SharedError`]
//! but are never cached; a stale value outlives a failed refresh until it
//! ages past `ttl + grace` or is flushed.
//!
//! Results are delivered by `Clone`. Treat values that the coalesced call
//! shares across callers (for example through an `Arc`) as read-only.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::oneshot;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::{Cancelled, RunnerTimedOut, SharedError};
use crate::Result;

type CoalescedFn<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<T>> + Send + Sync>;

/// What the pump hands to each waiter: the shared success value or the shared
/// failure.
type Delivery<T> = std::result::Result<T, SharedError>;

/// Coalesces invocations of an async call; see the module docs.
pub struct Coalescer<T> {
    func: CoalescedFn<T>,
    state: Arc<Mutex<State<T>>>,
    ttl: Duration,
    grace: Duration,
}

struct State<T> {
    running: bool,
    /// Bumped on every idle-to-running transition; lets a late abort detect
    /// that its waiter list belongs to a finished flight.
    generation: u64,
    next_waiter: u64,
    waiters: Vec<Waiter<T>>,
    /// Successful result plus the instant it was stored. Freshness is judged
    /// by the timestamp alone.
    cached: Option<(T, Instant)>,
}

struct Waiter<T> {
    id: u64,
    slot: oneshot::Sender<Delivery<T>>,
}

impl<T> State<T> {
    fn fresh_value(&self, window: Duration) -> Option<T>
    where
        T: Clone,
    {
        self.cached
            .as_ref()
            .filter(|(_, stored_at)| stored_at.elapsed() <= window)
            .map(|(value, _)| value.clone())
    }
}

impl<T> Coalescer<T>
where
    T: Clone + Send + 'static,
{
    /// Coalesces `func` without caching.
    pub fn new<F, Fut>(func: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        Self::with_cache(func, Duration::ZERO, Duration::ZERO)
    }

    /// Coalesces `func` and caches successful results.
    ///
    /// A result younger than `ttl` is served directly. One older than `ttl`
    /// but within `ttl + grace` is still served, and a single background
    /// refresh is started. Both durations zero disables caching.
    pub fn with_cache<F, Fut>(func: F, ttl: Duration, grace: Duration) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        Self {
            func: Arc::new(move || func().boxed()),
            state: Arc::new(Mutex::new(State {
                running: false,
                generation: 0,
                next_waiter: 0,
                waiters: Vec::new(),
                cached: None,
            })),
            ttl,
            grace,
        }
    }

    /// Runs or joins the in-flight call and waits for its result.
    pub async fn run(&self) -> Result<T> {
        self.run_inner(None, None, false).await
    }

    /// Returns immediately: the cached or already-available result, or
    /// [`RunnerTimedOut`]. Starts the call if none is running.
    pub async fn try_run(&self) -> Result<T> {
        self.run_inner(None, Some(Duration::ZERO), false).await
    }

    /// [`Coalescer::run`] bounded by `timeout`; expires with
    /// [`RunnerTimedOut`]. A zero timeout behaves like
    /// [`Coalescer::try_run`].
    pub async fn run_with_timeout(&self, timeout: Duration) -> Result<T> {
        self.run_inner(None, Some(timeout), false).await
    }

    /// [`Coalescer::run`] observing a cancellation handle; aborts with
    /// [`Cancelled`].
    pub async fn run_with_cancellation(&self, token: &CancellationToken) -> Result<T> {
        self.run_inner(Some(token), None, false).await
    }

    /// A view of this coalescer that never reads the cache. Results of calls
    /// it triggers are still stored for other callers.
    pub fn no_cache(&self) -> Uncached<'_, T> {
        Uncached { inner: self }
    }

    /// Drops the cached result, if any. The next cache-reading call will run
    /// or join the underlying function.
    pub fn flush(&self) {
        if self.caching_enabled() {
            let mut state = self.state.lock().expect("coalescer state poisoned");
            state.cached = None;
        }
    }

    /// True while an invocation is in flight.
    pub fn is_running(&self) -> bool {
        self.state.lock().expect("coalescer state poisoned").running
    }

    fn caching_enabled(&self) -> bool {
        !self.ttl.is_zero() || !self.grace.is_zero()
    }

    async fn run_inner(
        &self,
        token: Option<&CancellationToken>,
        timeout: Option<Duration>,
        bypass_cache: bool,
    ) -> Result<T> {
        let (generation, id, slot) = {
            let mut state = self.state.lock().expect("coalescer state poisoned");

            if !bypass_cache && !self.ttl.is_zero() {
                if let Some(value) = state.fresh_value(self.ttl) {
                    return Ok(value);
                }
            }

            if !bypass_cache && !self.grace.is_zero() {
                if let Some(value) = state.fresh_value(self.ttl + self.grace) {
                    // Within the grace window: serve stale, make sure exactly
                    // one refresh is under way.
                    if state.running {
                        return Ok(value);
                    }
                    if token.is_some_and(CancellationToken::is_cancelled) {
                        return Err(Cancelled.into());
                    }
                    state.running = true;
                    state.generation += 1;
                    self.spawn_pump();
                    return Ok(value);
                }
            }

            let (tx, rx) = oneshot::channel();
            let id = state.next_waiter;
            state.next_waiter += 1;
            if state.running {
                state.waiters.push(Waiter { id, slot: tx });
            } else {
                if token.is_some_and(CancellationToken::is_cancelled) {
                    return Err(Cancelled.into());
                }
                state.running = true;
                state.generation += 1;
                state.waiters.push(Waiter { id, slot: tx });
                self.spawn_pump();
            }
            (state.generation, id, rx)
        };

        if let Some(timeout) = timeout {
            if timeout.is_zero() {
                // Non-blocking poll: a result can only be ready if the pump
                // completed between releasing the lock and this check.
                let mut slot = slot;
                return match slot.try_recv() {
                    Ok(delivery) => delivered(delivery),
                    Err(_) => {
                        self.abort(generation, id);
                        if token.is_some_and(CancellationToken::is_cancelled) {
                            Err(Cancelled.into())
                        } else {
                            Err(RunnerTimedOut.into())
                        }
                    }
                };
            }
            return tokio::select! {
                biased;
                delivery = slot => finish(delivery),
                _ = wait_cancelled(token) => {
                    self.abort(generation, id);
                    Err(Cancelled.into())
                }
                _ = tokio::time::sleep(timeout) => {
                    self.abort(generation, id);
                    Err(RunnerTimedOut.into())
                }
            };
        }

        tokio::select! {
            biased;
            delivery = slot => finish(delivery),
            _ = wait_cancelled(token) => {
                self.abort(generation, id);
                Err(Cancelled.into())
            }
        }
    }

    fn spawn_pump(&self) {
        let func = Arc::clone(&self.func);
        let state = Arc::clone(&self.state);
        let caching = self.caching_enabled();
        tokio::spawn(async move {
            let outcome = match AssertUnwindSafe((*func)()).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(panic) => Err(anyhow::anyhow!(
                    "coalesced call panicked: {}",
                    panic_message(panic.as_ref())
                )),
            };
            let delivery: Delivery<T> = outcome.map_err(|error| SharedError(Arc::new(error)));

            let mut state = state.lock().expect("coalescer state poisoned");
            if caching {
                if let Ok(value) = &delivery {
                    state.cached = Some((value.clone(), Instant::now()));
                }
            }
            trace!(
                target: "dynamo_tasks::coalesce",
                waiters = state.waiters.len(),
                ok = delivery.is_ok(),
                "fanning out coalesced result"
            );
            for waiter in state.waiters.drain(..) {
                // A waiter that timed out or was cancelled dropped its
                // receiver; that is its loss, not an error.
                let _ = waiter.slot.send(delivery.clone());
            }
            state.running = false;
        });
    }

    /// Best-effort removal of a waiter that gave up. If the lock is
    /// contended the pump is about to deliver anyway and the dropped
    /// receiver absorbs the result.
    fn abort(&self, generation: u64, id: u64) {
        let Ok(mut state) = self.state.try_lock() else {
            return;
        };
        if state.generation != generation || state.waiters.is_empty() {
            return;
        }
        if let Some(position) = state.waiters.iter().position(|waiter| waiter.id == id) {
            // Waiter order does not matter; fan-out iterates the lot.
            state.waiters.swap_remove(position);
        }
    }
}

/// Cache-bypassing view returned by [`Coalescer::no_cache`].
pub struct Uncached<'a, T> {
    inner: &'a Coalescer<T>,
}

impl<T> Uncached<'_, T>
where
    T: Clone + Send + 'static,
{
    /// [`Coalescer::run`] without reading the cache.
    pub async fn run(&self) -> Result<T> {
        self.inner.run_inner(None, None, true).await
    }

    /// [`Coalescer::try_run`] without reading the cache.
    pub async fn try_run(&self) -> Result<T> {
        self.inner.run_inner(None, Some(Duration::ZERO), true).await
    }

    /// [`Coalescer::run_with_timeout`] without reading the cache.
    pub async fn run_with_timeout(&self, timeout: Duration) -> Result<T> {
        self.inner.run_inner(None, Some(timeout), true).await
    }

    /// [`Coalescer::run_with_cancellation`] without reading the cache.
    pub async fn run_with_cancellation(&self, token: &CancellationToken) -> Result<T> {
        self.inner.run_inner(Some(token), None, true).await
    }
}

fn finish<T>(delivery: std::result::Result<Delivery<T>, oneshot::error::RecvError>) -> Result<T> {
    match delivery {
        Ok(delivery) => delivered(delivery),
        // The pump dropped the slot without sending, which only happens if it
        // was torn down mid-flight.
        Err(_) => Err(anyhow::anyhow!("coalesced call ended without a result")),
    }
}

fn delivered<T>(delivery: Delivery<T>) -> Result<T> {
    delivery.map_err(Into::into)
}

async fn wait_cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}
