// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Process-wide shutdown token.
//!
//! A cheap, clonable flag the engine polls at mutator entry points and
//! at the top of every reconciliation tick. The binary's shutdown
//! coordinator sets it when the process receives a termination signal.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Clonable handle to the process-wide shutdown flag.
#[derive(Debug, Clone, Default)]
pub struct ShutdownToken {
    requested: Arc<AtomicBool>,
}

impl ShutdownToken {
    /// Creates a token with shutdown not requested.
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks shutdown as requested. Idempotent.
    pub fn request_shutdown(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    /// Returns `true` once shutdown has been requested.
    pub fn is_shutdown_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}
