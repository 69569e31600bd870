// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Egress sink abstraction.
//!
//! The engine treats the upload path as fire-and-forget: notification
//! encoding happens synchronously on the notification path and the
//! resulting JSON payload is handed over without waiting. Implementations
//! must not block; backpressure is their problem, not the engine's.

use std::fmt::Debug;

/// Sink for encoded telemetry envelopes.
///
/// # Contract
///
/// `enqueue` is infallible from the caller's perspective. An
/// implementation that cannot accept a payload drops it and accounts for
/// the drop itself; the engine never retries an envelope.
pub trait TelemetrySink: Send + Sync + Debug {
    /// Hands one JSON envelope to the egress path without blocking.
    fn enqueue(&self, payload: String);
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Debug, Default)]
    struct CountingSink {
        count: AtomicU64,
    }

    impl TelemetrySink for CountingSink {
        fn enqueue(&self, _payload: String) {
            self.count.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn sink_is_object_safe() {
        let sink: Box<dyn TelemetrySink> = Box::<CountingSink>::default();
        sink.enqueue("{}".to_string());
    }
}
