//! Engine tunables shared by every mock instance, and the host's node file.

use crate::models::MockConfig;
use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Address mock instances bind to.
    pub bind_host: IpAddr,

    /// Wall-clock budget for one condition script evaluation.
    pub script_timeout: Duration,

    /// Condition scripts larger than this are rejected without running.
    pub max_script_bytes: usize,

    /// Heap ceiling of one interpreter runtime.
    pub memory_limit_bytes: usize,

    /// Interpreter stack ceiling; deep recursion fails with a stack overflow.
    pub max_stack_bytes: usize,

    /// Evaluations allowed to run at once across all instances.
    pub max_concurrent_scripts: usize,

    /// How long `stop` waits for in-flight requests before aborting the listener task.
    pub drain_timeout: Duration,

    /// Buffered entries per live log subscriber.
    pub log_stream_capacity: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            bind_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            script_timeout: Duration::from_millis(300),
            max_script_bytes: 64 * 1024,
            memory_limit_bytes: 32 * 1024 * 1024,
            max_stack_bytes: 256 * 1024,
            max_concurrent_scripts: 32,
            drain_timeout: Duration::from_secs(5),
            log_stream_capacity: 100,
        }
    }
}

/// One entry of the node file handed to the binary by the host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeSpec {
    pub node_id: String,
    #[serde(default)]
    pub enabled: bool,
    pub config: MockConfig,
}

/// Reads the node file; `.yaml`/`.yml` files are parsed as YAML, anything else as JSON.
/// A missing file means no nodes.
pub fn load_nodes(path: &Path) -> anyhow::Result<Vec<NodeSpec>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read node file {}", path.display()))?;
    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );
    let nodes = if is_yaml {
        serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse YAML node file {}", path.display()))?
    } else {
        serde_json::from_str(&content)
            .with_context(|| format!("failed to parse JSON node file {}", path.display()))?
    };
    Ok(nodes)
}
