//! Scripted mock-server engine.
//!
//! A [`Registry`] owns one mock instance per host node. Each running instance listens on its
//! own port, matches requests against its path pattern and method, walks its response
//! variants in ascending `order` running each condition script in the [`Sandbox`], renders
//! the first match, and records one [`LogEntry`] per request in the [`LogPipeline`].

pub mod admin;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod logs;
pub mod matcher;
pub mod metrics;
pub mod models;
pub mod registry;
pub mod renderer;
pub mod request;
pub mod sandbox;
pub mod selector;
pub mod templating;

pub use config::{EngineSettings, NodeSpec, load_nodes};
pub use error::{EngineError, EngineResult, ErrorKind, RenderError, ScriptError};
pub use logs::LogPipeline;
pub use models::{
    InstanceState, InstanceStatus, LogEntry, MethodFilter, MockConfig, Protocol, RequestSummary,
    ResponseVariant,
};
pub use registry::Registry;
pub use sandbox::{ConditionEvaluator, Sandbox, ScriptRun};
