//! Tetora Core - dispatch engine
//!
//! The pipeline from "a task has been accepted" to "a task result has been
//! produced and durably recorded", plus the subsystems that keep that
//! pipeline safe and observable:
//! - Admission: global/child semaphores, spawn tracker, depth cap
//! - Budget: pre-execution admission and auto-downgrade
//! - Circuit: per-provider failure breakers across the fallback chain
//! - Store: embedded SQLite persistence (history, sessions, SLA, memory)
//! - Dispatch: the orchestration of one task
//! - Cron: 5-field schedule parsing and firing
//! - Workflow: DAG execution through the dispatcher
//! - Sla: periodic success-rate / latency aggregation
//! - Metrics / Audit: in-process observability

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod admission;
pub mod audit;
pub mod budget;
pub mod circuit;
pub mod config;
pub mod cron;
pub mod dispatch;
pub mod error;
pub mod metrics;
pub mod shutdown;
pub mod sla;
pub mod store;
pub mod workflow;

pub use admission::{AdmissionController, SpawnTracker};
pub use budget::{AlertLevel, AlertTracker, BudgetDecision, BudgetGovernor};
pub use circuit::{CircuitBreaker, CircuitRegistry, CircuitState};
pub use config::TetoraConfig;
pub use dispatch::{Dispatcher, Task, TaskResult, TaskStatus};
pub use error::{Error, Result};
pub use shutdown::ShutdownController;
pub use store::Store;
