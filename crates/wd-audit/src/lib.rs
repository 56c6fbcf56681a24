//! # wd-audit
//!
//! Immutable, hash-chained audit log for the Warden gateway.
//!
//! Every stage of the task pipeline (throttle, inspection, policy, vault,
//! dispatch, budget) and every operator action is recorded as an
//! [`AuditEvent`]. Each event carries a sequence number, the hash of the
//! previous event, and its own hash computed over its content plus that
//! previous hash. Editing, inserting, or dropping any past event breaks the
//! chain and is caught by [`AuditLog::verify`].
//!
//! ## Quick Example
//!
//! ```rust,no_run
//! use wd_audit::{AuditDecision, AuditEvent, AuditLog, AuditStage};
//!
//! let log = AuditLog::open("/tmp/warden-audit.jsonl").unwrap();
//! let mut event = AuditEvent::new(AuditStage::Policy, "agent-1", "policy_decision", AuditDecision::Allow)
//!     .with_reason("rule 'ci-read' matched");
//! let seq = log.append(&mut event).unwrap();
//! assert_eq!(seq, event.sequence);
//! ```

pub mod error;
pub mod event;
pub mod hasher;
pub mod log;
pub mod sink;

pub use error::AuditError;
pub use event::{AuditDecision, AuditEvent, AuditStage, GENESIS_HASH};
pub use log::{AuditLog, AuditPage, DEFAULT_RETAINED_EVENTS};
pub use sink::{AuditSink, FileSink, MemorySink};
