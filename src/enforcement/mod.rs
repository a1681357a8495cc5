//! Step enforcement: the machinery that keeps completions honest.
//!
//! - [`evidence`] - typed evidence payloads for documented steps, validated
//!   for schema conformance and substantive depth
//! - [`skip`] - skip-reason validation (minimum length, shallow-pattern
//!   rejection)
//! - [`gate_exec`] - direct execution of hard-gate commands with a timeout

pub mod evidence;
pub mod gate_exec;
pub mod skip;

pub use evidence::validate_evidence_depth;
pub use gate_exec::{GateCommandResult, GateRunner};
pub use skip::{validate_flexible_reason, validate_skip_reasoning};
