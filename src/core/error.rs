//! Error taxonomy.
//!
//! Build-time errors ([`Error`]) abort a run before any real-world state is
//! touched. Per-resource errors ([`InspectionError`], [`ApplyError`]) are
//! recorded in the run report and handled by the failure policy.

use std::time::Duration;
use thiserror::Error;

/// Main error type for cairn.
#[derive(Error, Debug)]
pub enum Error {
    /// (kind, name) or alias declared twice in one run
    #[error("duplicate resource: {0}")]
    DuplicateResource(String),

    /// No topological order exists
    #[error("dependency cycle: {}", .cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    /// Kind string not recognised, or no provider registered for it
    #[error("unknown resource kind: {0}")]
    UnknownResourceKind(String),

    /// A constraint or output reference names no declared resource
    #[error("resource '{resource}' references unknown resource '{reference}'")]
    UnknownDependency { resource: String, reference: String },

    /// Attributes do not match the kind's schema
    #[error("resource '{resource}': {message}")]
    InvalidAttribute { resource: String, message: String },

    /// Template resolution failed
    #[error(transparent)]
    Template(#[from] TemplateError),

    /// Config parse or validation errors
    #[error("config error: {0}")]
    Config(String),

    /// IO errors (config, state directory)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A convergence run finished unsuccessfully
    #[error("{failed} resource(s) failed, {skipped} skipped")]
    RunFailed { failed: usize, skipped: usize },
}

/// Result type alias for cairn operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn invalid(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidAttribute {
            resource: resource.into(),
            message: message.into(),
        }
    }
}

/// Template resolution errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("unclosed template at position {0}")]
    Unclosed(usize),

    #[error("unknown param: {0}")]
    UnknownParam(String),

    #[error("invalid output reference: {0}")]
    InvalidOutputRef(String),

    #[error("output '{key}' of '{resource}' is not available")]
    UnresolvedOutput { resource: String, key: String },

    #[error("unknown template variable: {0}")]
    UnknownVariable(String),
}

/// Failure while observing a resource's real-world state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InspectionError {
    #[error("inspection timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("query failed (exit {exit_code}): {stderr}")]
    Query { exit_code: i32, stderr: String },

    #[error("cloud API error: {0}")]
    Cloud(String),

    #[error("render error: {0}")]
    Render(String),

    #[error("{provider} provider cannot handle {kind} resources")]
    KindMismatch { provider: &'static str, kind: String },

    #[error("{0}")]
    Other(String),
}

/// Failure while mutating a resource.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApplyError {
    #[error("apply timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("exit code {exit_code}: {stderr}")]
    Command { exit_code: i32, stderr: String },

    #[error("cloud API error: {0}")]
    Cloud(String),

    #[error("IO error on {path}: {message}")]
    Io { path: String, message: String },

    #[error("{0}")]
    Other(String),
}
