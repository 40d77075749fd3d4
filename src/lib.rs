//! # Office Kernel - job execution kernel
//!
//! Runs the jobs of an office inside nested scopes:
//! - Processes, each an invocation of the office with its own managed objects
//! - Threads, lines of execution within a process that can join each other
//! - Job sequences, flows walked job by job within a thread
//! - Managed objects sourced (synchronously or asynchronously) on first use,
//!   coordinated with their dependencies and recycled when their scope ends
//! - Asset monitors parking job nodes until an object or thread is ready,
//!   with timeouts swept in the background
//! - Escalation of failures to flow, thread, process or top-level handlers
//! - Teams deciding where jobs run (inline or on tokio's blocking pool)
//!
//! ## Architecture
//!
//! ```text
//!                    ┌──────────────────────────────────────┐
//!   invoke_process → │               Kernel                 │
//!                    │  ┌─────────┐   ┌──────────────────┐  │
//!                    │  │ Office  │   │ Process registry │  │
//!                    │  │MetaData │   │  (DashMap)       │  │
//!                    │  └─────────┘   └──────────────────┘  │
//!                    │  ┌─────────┐   ┌──────────────────┐  │
//!                    │  │  Asset  │ ← │  Monitor sweep   │  │
//!                    │  │ Manager │   │  (tokio task)    │  │
//!                    │  └─────────┘   └──────────────────┘  │
//!                    └──────────────┬───────────────────────┘
//!                                   ↓ ActivationSet
//!                          Teams (passive / worker)
//! ```

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod kernel;
pub mod types;

// Internal utilities
pub mod observability;

pub use kernel::{
    Failure, FailureMatcher, FlowConfig, JobConfig, JobContext, Kernel, KernelStats,
    ManagedObjectConfig, OfficeBuilder, PassiveTeam, ProcessHandle, ProcessOutcome, WorkerTeam,
};
pub use types::{Config, Error, Result};
