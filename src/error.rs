use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the control surface (`configure`, `start`, `stop`, ...).
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to bind port {port}: {source}")]
    PortBind {
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("mock for node {0} is busy starting or stopping")]
    Busy(String),
    #[error("no mock configured for node {0}")]
    NotConfigured(String),
    #[error("invalid mock configuration: {0}")]
    InvalidConfig(String),
    #[error("lifecycle task for node {node_id} failed: {reason}")]
    Internal { node_id: String, reason: String },
}

impl EngineError {
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::PortBind { .. } => "port_bind_error",
            EngineError::Busy(_) => "busy",
            EngineError::NotConfigured(_) => "not_configured",
            EngineError::InvalidConfig(_) => "invalid_config",
            EngineError::Internal { .. } => "internal",
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Why a condition script did not produce a verdict.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ScriptError {
    #[error("{0}")]
    Thrown(String),
    #[error("script timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
    #[error("script is {size} bytes, limit is {limit}")]
    TooLarge { size: usize, limit: usize },
    #[error("script engine failure: {0}")]
    Engine(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RenderError {
    #[error("invalid status code {0}")]
    Status(u16),
    #[error("invalid header {name}: {reason}")]
    Header { name: String, reason: String },
    #[error("unterminated placeholder at byte {0}")]
    UnterminatedPlaceholder(usize),
    #[error("unknown placeholder {{{{{0}}}}}")]
    UnknownPlaceholder(String),
}

/// Terminal failure class of one served request, as recorded in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    RouteNotFound,
    NoVariantMatched,
    ConditionScriptError,
    RenderError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::RouteNotFound => "route_not_found",
            ErrorKind::NoVariantMatched => "no_variant_matched",
            ErrorKind::ConditionScriptError => "condition_script_error",
            ErrorKind::RenderError => "render_error",
        }
    }
}
