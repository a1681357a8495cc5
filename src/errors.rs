//! Typed error hierarchy for the warden orchestrator.
//!
//! Four top-level enums cover the subsystems:
//! - `DefinitionError` - workflow document loading and structural validation
//! - `EngineError` - phase state machine operations
//! - `TokenError` - phase token issuance (verification failures are opaque)
//! - `BrokerError` - tool brokering failures

use thiserror::Error;

/// Errors raised while loading or validating a workflow definition.
///
/// These are fail-fast: a definition that produces any of them is never
/// partially usable.
#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("Workflow file not found: {path}")]
    NotFound { path: std::path::PathBuf },

    #[error("Invalid YAML in {path}: {source}")]
    Yaml {
        path: std::path::PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Workflow file is empty: {path}")]
    Empty { path: std::path::PathBuf },

    #[error("Workflow structure invalid: {}", problems.join("; "))]
    Structural { problems: Vec<String> },
}

/// Errors from the phase state machine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("No active workflow")]
    NoActiveWorkflow,

    #[error("Active workflow already exists: {workflow_id}. Complete or abandon it first.")]
    ActiveWorkflowExists { workflow_id: String },

    #[error("Workflow is {status} and cannot be modified")]
    TerminalWorkflow { status: String },

    #[error("Item not found: {item_id}")]
    ItemNotFound { item_id: String },

    #[error("Item '{item_id}' exists but is not in current phase '{phase_id}'")]
    ItemNotInCurrentPhase { item_id: String, phase_id: String },

    #[error("Item {item_id} cannot be started (status: {status})")]
    ItemNotStartable { item_id: String, status: String },

    #[error("Unknown phase: {phase_id}")]
    UnknownPhase { phase_id: String },

    #[error("{0} exceeds maximum length of {1} characters (got {2})")]
    InputTooLong(&'static str, usize, usize),

    #[error("Failed to persist state at {path}: {source}")]
    Persist {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from issuing phase tokens.
///
/// Verification failures are deliberately not represented here: `verify`
/// collapses every failure mode to `false` so clients cannot distinguish
/// expired from tampered tokens. The specific reason goes to the log.
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("Signing secret is empty")]
    EmptySecret,

    #[error("Phase not found: {phase_id}")]
    UnknownPhase { phase_id: String },

    #[error("Failed to encode token: {0}")]
    Encode(#[source] jsonwebtoken::errors::Error),
}

/// Errors from the tool broker.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Invalid or expired phase token")]
    InvalidToken,

    #[error("Tool '{tool}' not allowed in phase {phase}")]
    ToolForbidden { tool: String, phase: String },

    #[error("No backend registered for tool '{tool}'")]
    ToolNotRegistered { tool: String },

    #[error("Tool '{tool}' timed out after {timeout_secs}s")]
    BackendTimeout { tool: String, timeout_secs: u64 },

    #[error("Tool '{tool}' failed: {message}")]
    Backend { tool: String, message: String },
}
