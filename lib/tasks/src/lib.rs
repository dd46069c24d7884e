// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Cancel-correct concurrency utilities.
//!
//! # Overview
//!
//! Three independent primitives, each built around precise failure and
//! cancellation semantics rather than raw throughput:
//!
//! - [`map`]: parallel mapping over a finite input set on a bounded worker
//!   pool, with ordered or completion-ordered results, abort on first error,
//!   and cooperative cancellation. [`fold`] layers serial reductions
//!   (`collect`, `inject`, `reduce`, `search`, `for_each`) on top.
//! - [`coalesce`]: single-flight execution of a parameterless call, with
//!   optional TTL caching and stale-while-revalidate grace.
//! - [`mutex`]: a counting mutual-exclusion primitive whose acquisition
//!   supports infinite, zero, bounded, and cancellable waits.
//!
//! Cancellation is cooperative and flows through
//! [`CancellationToken`]: a cancelled operation returns as soon as its next
//! suspension point observes the token; work already inside a user function
//! is never forcibly stopped.
//!
//! User errors travel as [`anyhow::Error`] and are surfaced unchanged. The
//! toolkit's own conditions are fixed identities in [`error`], matched by
//! downcast.

pub use anyhow::{Context as ErrorContext, Error, Result};
pub use tokio_util::sync::CancellationToken;

pub mod coalesce;
pub mod error;
pub mod fold;
pub mod map;
pub mod mutex;

pub use coalesce::{Coalescer, Uncached};
pub use error::{Cancelled, RunnerTimedOut, SearchFailure, SearchSuccess, SharedError};
pub use map::{Fallible, FallibleResults, DEFAULT_POOL_SIZE};
pub use mutex::TimedMutex;
