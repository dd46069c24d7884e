// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Fixed error identities surfaced by this crate.
//!
//! Every identity here is a zero-sized type so that callers can match it by
//! downcast through an [`anyhow::Error`] chain, e.g.
//! `err.downcast_ref::<SearchSuccess>().is_some()`. User errors are never
//! wrapped or rewritten; they travel through the toolkit as-is.

use std::sync::Arc;

/// Returned by a search callback to stop the sweep and accept its value.
///
/// [`crate::fold::search`] translates this into a successful result; every
/// other operation propagates it unchanged like any user error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("search concluded successfully")]
pub struct SearchSuccess;

/// Returned by [`crate::fold::search`] when the input is exhausted without a
/// callback reporting [`SearchSuccess`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("failed to locate element")]
pub struct SearchFailure;

/// Timed out waiting for a coalesced result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("runner timed out")]
pub struct RunnerTimedOut;

/// The operation observed its cancellation handle while waiting.
///
/// Distinct from [`RunnerTimedOut`]: a timeout is a bound the caller chose, a
/// cancellation is an external signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("operation cancelled")]
pub struct Cancelled;

/// A single failure fanned out to every waiter of a coalesced call.
///
/// The underlying error is shared, not cloned, so all callers observe the
/// same chain. Downcast to [`SharedError`] and follow `0` to inspect it.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct SharedError(pub Arc<anyhow::Error>);

impl SharedError {
    /// The shared underlying error.
    #[must_use]
    pub fn inner(&self) -> &anyhow::Error {
        &self.0
    }
}
