// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Counting mutual exclusion with timed and cancellable acquisition.
//!
//! All state lives in one bounded queue pre-filled with `limit` tokens:
//! acquiring takes a token off the queue, releasing puts one back. No
//! ordering among blocked acquirers is guaranteed. Acquisition is not tied to
//! a guard; callers pair [`TimedMutex::release`] with each successful
//! acquire themselves.

use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::Cancelled;
use crate::Result;

/// A mutex-like primitive admitting up to `limit` concurrent holders.
#[derive(Debug)]
pub struct TimedMutex {
    tokens_tx: flume::Sender<()>,
    tokens_rx: flume::Receiver<()>,
}

impl TimedMutex {
    /// A plain mutex: one holder at a time.
    #[must_use]
    pub fn new() -> Self {
        Self::with_limit(1)
    }

    /// A mutex admitting up to `limit` holders. A `limit` of zero is coerced
    /// to one.
    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        let limit = limit.max(1);
        let (tokens_tx, tokens_rx) = flume::bounded(limit);
        for _ in 0..limit {
            tokens_tx.send(()).expect("filling a fresh token queue");
        }
        Self {
            tokens_tx,
            tokens_rx,
        }
    }

    /// Blocks until a token is available.
    pub async fn acquire(&self) {
        self.tokens_rx
            .recv_async()
            .await
            .expect("token queue closed");
    }

    /// Takes a token if one is available right now.
    pub fn try_acquire(&self) -> bool {
        self.tokens_rx.try_recv().is_ok()
    }

    /// Blocks up to `timeout` for a token; reports whether one was acquired.
    /// A zero timeout is a single attempt.
    pub async fn acquire_with_timeout(&self, timeout: Duration) -> bool {
        if timeout.is_zero() {
            return self.try_acquire();
        }
        tokio::select! {
            token = self.tokens_rx.recv_async() => {
                token.expect("token queue closed");
                true
            }
            _ = tokio::time::sleep(timeout) => false,
        }
    }

    /// Blocks for a token until the handle is cancelled, reporting
    /// [`Cancelled`] on abort.
    pub async fn acquire_with_cancellation(&self, token: &CancellationToken) -> Result<()> {
        tokio::select! {
            entry = self.tokens_rx.recv_async() => {
                entry.expect("token queue closed");
                Ok(())
            }
            _ = token.cancelled() => Err(Cancelled.into()),
        }
    }

    /// Returns one token.
    ///
    /// # Panics
    ///
    /// Releasing more tokens than were acquired overflows the pool and
    /// panics; it is always a caller bug.
    pub fn release(&self) {
        if self.tokens_tx.try_send(()).is_err() {
            panic!("release of an unheld timed mutex");
        }
    }
}

impl Default for TimedMutex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{sleep, Instant};

    #[tokio::test(start_paused = true)]
    async fn acquire_with_timeout_expires_after_the_full_wait() {
        let mutex = TimedMutex::new();
        mutex.acquire().await;

        let started = Instant::now();
        let acquired = mutex.acquire_with_timeout(Duration::from_secs(1)).await;
        assert!(!acquired);
        assert_eq!(started.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn capacity_bounds_concurrent_holders() {
        let mutex = TimedMutex::with_limit(3);
        assert!(mutex.try_acquire());
        assert!(mutex.try_acquire());
        assert!(mutex.try_acquire());
        assert!(!mutex.try_acquire());

        mutex.release();
        assert!(mutex.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_waits_for_a_release() {
        let mutex = std::sync::Arc::new(TimedMutex::new());
        mutex.acquire().await;

        let releaser = {
            let mutex = std::sync::Arc::clone(&mutex);
            tokio::spawn(async move {
                sleep(Duration::from_millis(50)).await;
                mutex.release();
            })
        };

        let started = Instant::now();
        mutex.acquire().await;
        assert_eq!(started.elapsed(), Duration::from_millis(50));
        releaser.await.expect("releaser");
    }

    #[tokio::test(start_paused = true)]
    async fn acquisition_can_be_cancelled() {
        let mutex = TimedMutex::new();
        mutex.acquire().await;

        let token = CancellationToken::new();
        let canceller = {
            let token = token.clone();
            tokio::spawn(async move {
                sleep(Duration::from_millis(10)).await;
                token.cancel();
            })
        };

        let err = mutex
            .acquire_with_cancellation(&token)
            .await
            .expect_err("expected cancellation");
        assert!(err.downcast_ref::<Cancelled>().is_some());
        canceller.await.expect("canceller");
    }

    #[tokio::test]
    async fn cancellable_acquire_succeeds_when_a_token_is_free() {
        let mutex = TimedMutex::new();
        let token = CancellationToken::new();
        mutex
            .acquire_with_cancellation(&token)
            .await
            .expect("token available");
        assert!(!mutex.try_acquire());
    }

    #[tokio::test]
    async fn zero_timeout_is_a_single_attempt() {
        let mutex = TimedMutex::new();
        mutex.acquire().await;
        assert!(!mutex.acquire_with_timeout(Duration::ZERO).await);
    }

    #[tokio::test]
    async fn zero_limit_is_coerced_to_one() {
        let mutex = TimedMutex::with_limit(0);
        assert!(mutex.try_acquire());
        assert!(!mutex.try_acquire());
    }

    #[tokio::test]
    #[should_panic(expected = "release of an unheld timed mutex")]
    async fn over_release_panics() {
        let mutex = TimedMutex::new();
        mutex.release();
    }
}
