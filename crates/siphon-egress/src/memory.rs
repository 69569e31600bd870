// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! In-memory egress queue.
//!
//! An unbounded channel fronted by atomic counters. The producing side is
//! the engine's notification path; the consuming side is the uploader
//! task owned by the binary. Counters are plain atomics so the hot path
//! never takes a lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::warn;

use crate::traits::TelemetrySink;

// =============================================================================
// MemoryQueue
// =============================================================================

/// Unbounded in-memory telemetry queue.
#[derive(Debug)]
pub struct MemoryQueue {
    tx: mpsc::UnboundedSender<String>,
    stats: Arc<QueueStats>,
}

impl MemoryQueue {
    /// Creates a queue, returning the sink half and the receiver the
    /// uploader drains.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Arc::new(Self {
            tx,
            stats: Arc::new(QueueStats::default()),
        });
        (queue, rx)
    }

    /// Returns a handle to the queue statistics.
    pub fn stats(&self) -> Arc<QueueStats> {
        Arc::clone(&self.stats)
    }
}

impl TelemetrySink for MemoryQueue {
    fn enqueue(&self, payload: String) {
        match self.tx.send(payload) {
            Ok(()) => {
                self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                // Receiver gone: the uploader has shut down ahead of the
                // engine. Drop and account.
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("Egress receiver closed; telemetry envelope dropped");
            }
        }
    }
}

// =============================================================================
// QueueStats
// =============================================================================

/// Counters for the in-memory queue.
#[derive(Debug, Default)]
pub struct QueueStats {
    enqueued: AtomicU64,
    dropped: AtomicU64,
}

impl QueueStats {
    /// Number of envelopes accepted into the queue.
    pub fn enqueued(&self) -> u64 {
        self.enqueued.load(Ordering::Relaxed)
    }

    /// Number of envelopes dropped because the receiver was gone.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Tests
// =============================================================================
