//! hostwatch kernel
//!
//! Pings a fixed set of hosts and escalates alarms per host:
//! - debounced first failure, then voice calls, then SMS once the call
//!   budget is spent
//! - durable per-host state in one JSON document, guarded by a lock file
//! - HTTP gateways for calls and SMS behind `NotificationDispatcher`

pub mod config;
pub mod escalation;
pub mod lock;
pub mod models;
pub mod notify;
pub mod probe;
pub mod runner;
pub mod store;

pub use escalation::{EscalationEngine, Evaluation, Thresholds};
pub use models::{Directive, HostRecord, HostState, Observation};
pub use notify::{DispatchError, HttpDispatcher, NotificationDispatcher};
pub use runner::{RunReport, Runner};
pub use store::{HostRecordStore, RecordPatch, StoreError};
