// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! End-to-end exercises of the public toolkit surface: the primitives
//! composed the way a service would use them together.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dynamo_tasks::map::Fallible;
use dynamo_tasks::{fold, map, Coalescer, SearchSuccess, TimedMutex};
use futures::FutureExt;
use tokio::time::{sleep, Duration};

#[tokio::test(start_paused = true)]
async fn mapped_workers_share_one_coalesced_lookup() {
    let resolutions = Arc::new(AtomicUsize::new(0));
    // Cached so that workers arriving after the first flight completes are
    // served the stored value instead of starting a new one.
    let resolver = {
        let resolutions = Arc::clone(&resolutions);
        Arc::new(Coalescer::<String>::with_cache(
            move || {
                let resolutions = Arc::clone(&resolutions);
                async move {
                    resolutions.fetch_add(1, Ordering::SeqCst);
                    sleep(Duration::from_millis(50)).await;
                    Ok("shard-map-v1".to_string())
                }
                .boxed()
            },
            Duration::from_secs(5),
            Duration::ZERO,
        ))
    };

    let inputs: Vec<u32> = (0..20).collect();
    let rx = {
        let resolver = Arc::clone(&resolver);
        map::map_unordered(
            5,
            move |shard: u32| {
                let resolver = Arc::clone(&resolver);
                async move {
                    let config = resolver.run().await.expect("resolver");
                    format!("{config}/{shard}")
                }
            },
            inputs,
        )
    };

    let mut rx = rx;
    let mut results = Vec::new();
    while let Some(line) = rx.recv().await {
        results.push(line);
    }
    assert_eq!(results.len(), 20);
    assert!(results.iter().all(|line| line.starts_with("shard-map-v1/")));
    assert_eq!(resolutions.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn a_mutex_bounds_the_critical_section_inside_a_sweep() {
    let gate = Arc::new(TimedMutex::with_limit(2));
    let inside = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let result = {
        let gate = Arc::clone(&gate);
        let inside = Arc::clone(&inside);
        let peak = Arc::clone(&peak);
        fold::for_each_unordered(
            8,
            move |_item: u32| {
                let gate = Arc::clone(&gate);
                let inside = Arc::clone(&inside);
                let peak = Arc::clone(&peak);
                async move {
                    gate.acquire().await;
                    let live = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(live, Ordering::SeqCst);
                    sleep(Duration::from_millis(10)).await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                    gate.release();
                    Ok(())
                }
            },
            (0..16).collect(),
        )
        .await
    };

    result.expect("sweep should succeed");
    assert!(peak.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn search_finds_a_needle_collected_in_parallel() {
    let candidates = fold::collect(
        4,
        |n: u32| async move { Fallible::ok(n * 7) },
        (1..=30).collect(),
    )
    .await
    .expect("collect");

    let needle = fold::search_unordered(
        4,
        |candidate: u32| async move {
            if candidate % 10 == 0 && candidate % 7 == 0 {
                Fallible::new(candidate, Some(SearchSuccess.into()))
            } else {
                Fallible::ok(0)
            }
        },
        candidates,
    )
    .await
    .expect("a multiple of 70 exists");
    assert_eq!(needle % 70, 0);
}
