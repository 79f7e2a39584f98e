//! Node id → mock instance map and the start/stop lifecycle.
//!
//! ```text
//! Stopped → Starting → Running → Stopping → Stopped
//!              ↓          ↓
//!            Error      Error
//! ```
//!
//! The map lock is never held across an await: transitions into `Starting`/`Stopping` are
//! claimed under the lock, the slow part (bind, drain) runs unlocked in a spawned task, and that
//! task writes the final state under the lock again, whether or not the caller is still waiting.
//! Concurrent calls that find a slot mid-transition get `Busy`.

use crate::config::EngineSettings;
use crate::dispatcher::{self, InstanceContext, MockSnapshot};
use crate::error::{EngineError, EngineResult};
use crate::logs::LogPipeline;
use crate::models::{InstanceState, InstanceStatus, LogEntry, MockConfig};
use crate::sandbox::{ConditionEvaluator, Sandbox};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, oneshot};
use tokio::task::{JoinError, JoinHandle};
use uuid::Uuid;

#[derive(Clone)]
pub struct Registry {
    inner: Arc<Inner>,
}

struct Inner {
    settings: EngineSettings,
    instances: Mutex<HashMap<String, Slot>>,
    logs: Arc<LogPipeline>,
    evaluator: Arc<dyn ConditionEvaluator>,
    generation: AtomicU64,
}

struct Slot {
    instance_id: Uuid,
    snapshot: Arc<ArcSwap<MockSnapshot>>,
    state: InstanceState,
    bound_port: Option<u16>,
    last_error: Option<String>,
    listener: Option<Listener>,
}

struct Listener {
    generation: u64,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl Slot {
    fn status(&self, node_id: &str) -> InstanceStatus {
        InstanceStatus {
            node_id: node_id.to_string(),
            instance_id: self.instance_id,
            state: self.state,
            port: self
                .bound_port
                .unwrap_or_else(|| self.snapshot.load().config.port),
            error: self.last_error.clone(),
        }
    }
}

impl Registry {
    pub fn new(settings: EngineSettings) -> Self {
        let sandbox = Arc::new(Sandbox::new(&settings));
        Self::with_evaluator(settings, sandbox)
    }

    pub fn with_evaluator(settings: EngineSettings, evaluator: Arc<dyn ConditionEvaluator>) -> Self {
        let logs = Arc::new(LogPipeline::new(settings.log_stream_capacity));
        Self {
            inner: Arc::new(Inner {
                settings,
                instances: Mutex::new(HashMap::new()),
                logs,
                evaluator,
                generation: AtomicU64::new(1),
            }),
        }
    }

    /// Creates or replaces a node's mock configuration.
    ///
    /// A running instance picks up the new route and variants on its next request;
    /// a changed port applies on the next start.
    pub fn configure(&self, node_id: &str, config: MockConfig) -> EngineResult<InstanceStatus> {
        let snapshot = Arc::new(MockSnapshot::compile(config)?);
        let mut instances = self.inner.instances.lock();
        match instances.get_mut(node_id) {
            Some(slot) => {
                let previous_port = slot.snapshot.load().config.port;
                if slot.state == InstanceState::Running && previous_port != snapshot.config.port {
                    tracing::info!(
                        "Port of {} changed {} -> {}, applies on restart",
                        node_id,
                        previous_port,
                        snapshot.config.port
                    );
                }
                slot.snapshot.store(snapshot);
                tracing::info!("Reconfigured mock for node {}", node_id);
                Ok(slot.status(node_id))
            }
            None => {
                let slot = Slot {
                    instance_id: Uuid::new_v4(),
                    snapshot: Arc::new(ArcSwap::new(snapshot)),
                    state: InstanceState::Stopped,
                    bound_port: None,
                    last_error: None,
                    listener: None,
                };
                let status = slot.status(node_id);
                instances.insert(node_id.to_string(), slot);
                tracing::info!("Configured mock for node {}", node_id);
                Ok(status)
            }
        }
    }

    pub async fn start(&self, node_id: &str) -> EngineResult<InstanceStatus> {
        let (ctx, port) = {
            let mut instances = self.inner.instances.lock();
            let slot = instances
                .get_mut(node_id)
                .ok_or_else(|| EngineError::NotConfigured(node_id.to_string()))?;
            match slot.state {
                InstanceState::Running => return Ok(slot.status(node_id)),
                InstanceState::Starting | InstanceState::Stopping => {
                    return Err(EngineError::Busy(node_id.to_string()));
                }
                InstanceState::Stopped | InstanceState::Error => {}
            }
            slot.state = InstanceState::Starting;
            slot.last_error = None;
            let ctx = InstanceContext {
                node_id: Arc::from(node_id),
                instance_id: slot.instance_id,
                snapshot: slot.snapshot.clone(),
                logs: self.inner.logs.clone(),
                evaluator: self.inner.evaluator.clone(),
            };
            (ctx, slot.snapshot.load().config.port)
        };

        // The transition finishes in its own task, so a caller that goes away cannot strand it.
        let task = tokio::spawn(self.inner.clone().finish_start(node_id.to_string(), ctx, port));
        joined(node_id, task.await)
    }

    /// Closes the listener at once, then waits up to `drain_timeout` for in-flight requests.
    pub async fn stop(&self, node_id: &str) -> EngineResult<InstanceStatus> {
        let listener = {
            let mut instances = self.inner.instances.lock();
            let slot = instances
                .get_mut(node_id)
                .ok_or_else(|| EngineError::NotConfigured(node_id.to_string()))?;
            match slot.state {
                InstanceState::Stopped => return Ok(slot.status(node_id)),
                InstanceState::Starting | InstanceState::Stopping => {
                    return Err(EngineError::Busy(node_id.to_string()));
                }
                InstanceState::Running | InstanceState::Error => {}
            }
            slot.state = InstanceState::Stopping;
            slot.listener.take()
        };

        let task = tokio::spawn(self.inner.clone().finish_stop(node_id.to_string(), listener));
        joined(node_id, task.await)
    }

    pub fn status(&self, node_id: &str) -> EngineResult<InstanceStatus> {
        self.inner
            .instances
            .lock()
            .get(node_id)
            .map(|slot| slot.status(node_id))
            .ok_or_else(|| EngineError::NotConfigured(node_id.to_string()))
    }

    pub fn list(&self) -> Vec<InstanceStatus> {
        let mut statuses: Vec<_> = self
            .inner
            .instances
            .lock()
            .iter()
            .map(|(node_id, slot)| slot.status(node_id))
            .collect();
        statuses.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        statuses
    }

    pub fn config(&self, node_id: &str) -> EngineResult<MockConfig> {
        self.inner
            .instances
            .lock()
            .get(node_id)
            .map(|slot| slot.snapshot.load().config.clone())
            .ok_or_else(|| EngineError::NotConfigured(node_id.to_string()))
    }

    /// Stops and forgets a node's mock together with its logs. Unknown nodes are a no-op.
    pub async fn remove(&self, node_id: &str) -> EngineResult<()> {
        match self.stop(node_id).await {
            Ok(_) => {}
            Err(EngineError::NotConfigured(_)) => return Ok(()),
            Err(e) => return Err(e),
        }
        let mut instances = self.inner.instances.lock();
        if let Some(slot) = instances.get(node_id) {
            if slot.state != InstanceState::Stopped {
                return Err(EngineError::Busy(node_id.to_string()));
            }
            self.inner.logs.forget(slot.instance_id);
            instances.remove(node_id);
            tracing::info!("Removed mock for node {}", node_id);
        }
        Ok(())
    }

    /// Stops every running instance, used on host shutdown.
    pub async fn stop_all(&self) {
        let node_ids: Vec<String> = self.inner.instances.lock().keys().cloned().collect();
        for node_id in node_ids {
            if let Err(e) = self.stop(&node_id).await {
                tracing::warn!("Failed to stop mock for {}: {}", node_id, e);
            }
        }
    }

    pub fn query_logs(&self, node_id: &str, keyword: Option<&str>) -> EngineResult<Vec<LogEntry>> {
        let instance_id = self.instance_id(node_id)?;
        Ok(self.inner.logs.query(instance_id, keyword))
    }

    pub fn clear_logs(&self, node_id: &str) {
        if let Ok(instance_id) = self.instance_id(node_id) {
            self.inner.logs.clear_all(instance_id);
        }
    }

    /// Returns whether the entry existed.
    pub fn delete_log(&self, node_id: &str, entry_id: u64) -> EngineResult<bool> {
        let instance_id = self.instance_id(node_id)?;
        Ok(self.inner.logs.delete_one(instance_id, entry_id))
    }

    /// Live feed of new entries; callers filter on the returned instance id.
    pub fn subscribe_logs(
        &self,
        node_id: &str,
    ) -> EngineResult<(Uuid, broadcast::Receiver<Arc<LogEntry>>)> {
        let instance_id = self.instance_id(node_id)?;
        Ok((instance_id, self.inner.logs.subscribe()))
    }

    fn instance_id(&self, node_id: &str) -> EngineResult<Uuid> {
        self.inner
            .instances
            .lock()
            .get(node_id)
            .map(|slot| slot.instance_id)
            .ok_or_else(|| EngineError::NotConfigured(node_id.to_string()))
    }
}

fn joined(
    node_id: &str,
    result: Result<EngineResult<InstanceStatus>, JoinError>,
) -> EngineResult<InstanceStatus> {
    result.unwrap_or_else(|e| {
        Err(EngineError::Internal {
            node_id: node_id.to_string(),
            reason: e.to_string(),
        })
    })
}

impl Inner {
    async fn finish_start(
        self: Arc<Self>,
        node_id: String,
        ctx: InstanceContext,
        port: u16,
    ) -> EngineResult<InstanceStatus> {
        let addr = SocketAddr::new(self.settings.bind_host, port);
        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(source) => {
                let err = EngineError::PortBind { port, source };
                tracing::error!("Failed to start mock for {}: {}", node_id, err);
                if let Some(slot) = self.instances.lock().get_mut(&node_id) {
                    slot.state = InstanceState::Error;
                    slot.last_error = Some(err.to_string());
                }
                return Err(err);
            }
        };
        let bound_port = listener.local_addr().map(|a| a.port()).unwrap_or(port);

        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let app = dispatcher::router(ctx);
        let weak: Weak<Inner> = Arc::downgrade(&self);
        let task_node = node_id.clone();
        let task = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(e) = result
                && let Some(inner) = weak.upgrade()
            {
                inner.listener_failed(&task_node, generation, e.to_string());
            }
        });

        let mut instances = self.instances.lock();
        let slot = instances
            .get_mut(&node_id)
            .ok_or_else(|| EngineError::NotConfigured(node_id.clone()))?;
        slot.state = InstanceState::Running;
        slot.bound_port = Some(bound_port);
        slot.listener = Some(Listener {
            generation,
            shutdown: shutdown_tx,
            task,
        });
        tracing::info!("Mock for node {} running on http://{}:{}", node_id, addr.ip(), bound_port);
        Ok(slot.status(&node_id))
    }

    async fn finish_stop(
        self: Arc<Self>,
        node_id: String,
        listener: Option<Listener>,
    ) -> EngineResult<InstanceStatus> {
        if let Some(listener) = listener {
            self.drain(&node_id, listener).await;
        }

        let mut instances = self.instances.lock();
        let slot = instances
            .get_mut(&node_id)
            .ok_or_else(|| EngineError::NotConfigured(node_id.clone()))?;
        slot.state = InstanceState::Stopped;
        slot.bound_port = None;
        slot.last_error = None;
        tracing::info!("Mock for node {} stopped", node_id);
        Ok(slot.status(&node_id))
    }

    async fn drain(&self, node_id: &str, listener: Listener) {
        let _ = listener.shutdown.send(());
        let mut task = listener.task;
        if tokio::time::timeout(self.settings.drain_timeout, &mut task)
            .await
            .is_err()
        {
            tracing::warn!(
                "Mock for {} did not drain within {:?}, aborting listener",
                node_id,
                self.settings.drain_timeout
            );
            task.abort();
            let _ = task.await;
        }
    }

    fn listener_failed(&self, node_id: &str, generation: u64, message: String) {
        let mut instances = self.instances.lock();
        let Some(slot) = instances.get_mut(node_id) else {
            return;
        };
        let current = slot.listener.as_ref().map(|l| l.generation);
        if slot.state == InstanceState::Running && current == Some(generation) {
            tracing::error!("Listener for {} failed: {}", node_id, message);
            slot.state = InstanceState::Error;
            slot.bound_port = None;
            slot.last_error = Some(message);
        }
    }
}
