//! Core types for the office kernel.
//!
//! This module provides foundational types used throughout the system:
//! - **IDs**: Strongly-typed identifiers (ProcessId, ThreadId, JobNodeId)
//! - **Errors**: Application error types with thiserror derives
//! - **Config**: Configuration structures for the monitor, teams and logging

mod config;
mod errors;
mod ids;

pub use config::{Config, MonitorConfig, ObservabilityConfig, TeamConfig};
pub use errors::{Error, Result};
pub use ids::{JobNodeId, ProcessId, ThreadId};
