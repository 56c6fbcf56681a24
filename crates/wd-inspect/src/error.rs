// error.rs — Error types for building inspection pipelines.
//
// Inspection itself never errors: a stage that cannot decide denies. These
// errors only arise when compiling rules, and a bundle that fails to compile
// is rejected as a whole.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum InspectError {
    /// A regex in one of the pattern lists does not compile.
    #[error("invalid {list} pattern '{pattern}': {source}")]
    InvalidPattern {
        list: &'static str,
        pattern: String,
        source: regex::Error,
    },

    /// A schema rule's resource/action glob does not compile.
    #[error("invalid schema glob '{pattern}': {reason}")]
    InvalidGlob { pattern: String, reason: String },
}
