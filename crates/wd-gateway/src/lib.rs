//! # wd-gateway
//!
//! The Warden task router and its operator surface.
//!
//! Agents never call tools directly. They submit a [`TaskRequest`] to the
//! [`Gateway`], which runs it through a fixed pipeline: throttle, input
//! inspection, registry lookup, budget reservation, policy, credential
//! lease, executor dispatch, output inspection, budget commit. Every stage
//! is recorded in the hash-chained audit log before the next one starts,
//! and any failure unwinds what the request holds.
//!
//! Operators act through the [`OverrideController`] (kill switch,
//! throttling, escalation resolution, budget overrides, policy reload,
//! schedule overrides, dual-control registry changes). Both sides are
//! exposed over MCP by [`WardenServer`].

pub mod alerts;
pub mod bundle;
pub mod clock;
pub mod config;
pub mod error;
pub mod escalation;
pub mod executor;
pub mod override_ctl;
pub mod request;
pub mod router;
pub mod scheduler;
pub mod server;
pub mod throttle;

pub use alerts::{Alert, AlertDispatcher, AlertSink, JsonlAlertSink, TracingAlertSink};
pub use bundle::{BundleDocument, PolicyBundle};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::GatewayConfig;
pub use error::{GatewayError, ReasonCode};
pub use escalation::{EscalationQueue, PendingEscalation, Resolution};
pub use executor::{
    AuthorizedTask, CommandExecutor, Executor, ExecutorError, ExecutorSet, HttpExecutor,
};
pub use override_ctl::OverrideController;
pub use request::{TaskDecision, TaskRequest, TaskResponse};
pub use router::{Gateway, GatewayParts, KillSwitchReport};
pub use scheduler::{Schedule, ScheduleConfig, ScheduleStatus, Scheduler};
pub use server::WardenServer;
pub use throttle::Throttle;
