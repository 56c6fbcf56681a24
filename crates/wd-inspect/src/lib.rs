//! # wd-inspect
//!
//! Staged inspection of agent input and executor output.
//!
//! A [`Pipeline`] is an ordered list of [`InspectionStage`]s. Each stage
//! returns pass or deny; the first deny ends the run and is terminal for the
//! request (fail closed). Stages are built from [`InspectionRules`], plain
//! data that ships alongside the policy rules, so new patterns roll out with
//! a policy reload rather than a redeploy.
//!
//! Input stages: size bound, injection patterns, input schema.
//! Output stages: secret scan, output schema, exfiltration allow-list.

pub mod error;
pub mod pipeline;
pub mod rules;
pub mod stages;

pub use error::InspectError;
pub use pipeline::{Inspector, InspectionReport, InspectionVerdict, Pipeline};
pub use rules::{InspectionRules, JsonType, SchemaRule};
pub use stages::{DenyKind, InspectionStage, StageOutcome, Subject};
