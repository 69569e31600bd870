// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Egress queue for the Siphon OPC UA bridge.
//!
//! The engine encodes every value-change notification into a JSON
//! envelope and hands it to a [`TelemetrySink`]. The in-memory
//! [`MemoryQueue`] is the default sink; the binary drains its receiver
//! into the upload path.

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod memory;
pub mod traits;

pub use memory::{MemoryQueue, QueueStats};
pub use traits::TelemetrySink;
