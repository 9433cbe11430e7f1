use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use crate::envelope::{MessageKind, PluginMessage};
use crate::error::PluginError;

/// The host side of one worker's message channel plus its task handle.
pub struct WorkerHandle {
    pub worker_id: Uuid,
    pub plugin_id: String,
    to_worker: UnboundedSender<PluginMessage>,
    /// Taken once by the message bridge when it attaches its dispatch
    /// listener.
    from_worker: Mutex<Option<UnboundedReceiver<PluginMessage>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerHandle {
    pub fn new(
        plugin_id: impl Into<String>,
        to_worker: UnboundedSender<PluginMessage>,
        from_worker: UnboundedReceiver<PluginMessage>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            worker_id: Uuid::new_v4(),
            plugin_id: plugin_id.into(),
            to_worker,
            from_worker: Mutex::new(Some(from_worker)),
            task: Mutex::new(Some(task)),
        }
    }

    /// Post a message into the worker's inbox.
    pub fn post(&self, msg: PluginMessage) -> Result<(), PluginError> {
        self.to_worker
            .send(msg)
            .map_err(|_| PluginError::WorkerGone(self.plugin_id.clone()))
    }

    /// Take the worker→host receiver. Only the first caller gets it.
    pub fn take_receiver(&self) -> Option<UnboundedReceiver<PluginMessage>> {
        self.from_worker.lock().take()
    }

    pub fn is_alive(&self) -> bool {
        !self.to_worker.is_closed()
    }

    /// Terminate the worker task and close its channel.
    pub fn terminate(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        debug!(worker_id = %self.worker_id, plugin_id = %self.plugin_id, "worker terminated");
    }
}

/// The external worker-spawning primitive. The substrate only ever talks to
/// workers through handles produced here.
pub trait WorkerSpawner: Send + Sync + 'static {
    fn spawn(&self, plugin_id: &str, entry_path: &str) -> Result<Arc<WorkerHandle>, PluginError>;
}

type Behavior = Arc<dyn Fn(&PluginMessage) -> Option<PluginMessage> + Send + Sync>;

/// Task-backed spawner for tests and single-process deployments: each worker
/// is a tokio task driven by a scripted behavior over its inbox.
#[derive(Clone)]
pub struct TaskWorkerSpawner {
    behavior: Behavior,
    fail_spawn: Arc<AtomicBool>,
    /// Every message delivered to any worker spawned here, in arrival order.
    received: Arc<Mutex<Vec<PluginMessage>>>,
}

impl TaskWorkerSpawner {
    pub fn with_behavior(behavior: Behavior) -> Self {
        Self {
            behavior,
            fail_spawn: Arc::new(AtomicBool::new(false)),
            received: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Workers that answer every INVOKE with a successful echo of its params.
    pub fn echo() -> Self {
        Self::with_behavior(Arc::new(|msg: &PluginMessage| match msg.kind {
            MessageKind::Invoke => Some(msg.reply(
                MessageKind::InvokeResult,
                json!({"success": true, "data": msg.payload.get("params").cloned()}),
            )),
            _ => None,
        }))
    }

    /// Workers that never reply. Timeout tests.
    pub fn silent() -> Self {
        Self::with_behavior(Arc::new(|_msg: &PluginMessage| None))
    }

    /// Messages seen by workers spawned from this spawner.
    pub fn received(&self) -> Vec<PluginMessage> {
        self.received.lock().clone()
    }

    /// Make subsequent spawns fail (reload-failure tests).
    pub fn set_fail_spawn(&self, fail: bool) {
        self.fail_spawn.store(fail, Ordering::SeqCst);
    }
}

impl WorkerSpawner for TaskWorkerSpawner {
    fn spawn(&self, plugin_id: &str, entry_path: &str) -> Result<Arc<WorkerHandle>, PluginError> {
        if self.fail_spawn.load(Ordering::SeqCst) {
            return Err(PluginError::SpawnFailed {
                plugin_id: plugin_id.to_string(),
                message: format!("cannot load {}", entry_path),
            });
        }

        let (host_tx, mut worker_rx) = mpsc::unbounded_channel::<PluginMessage>();
        let (worker_tx, host_rx) = mpsc::unbounded_channel::<PluginMessage>();

        let behavior = Arc::clone(&self.behavior);
        let received = Arc::clone(&self.received);
        let task = tokio::spawn(async move {
            while let Some(msg) = worker_rx.recv().await {
                received.lock().push(msg.clone());
                if let Some(reply) = behavior(&msg) {
                    if worker_tx.send(reply).is_err() {
                        break;
                    }
                }
            }
        });

        debug!(plugin_id, entry_path, "worker spawned");
        Ok(Arc::new(WorkerHandle::new(plugin_id, host_tx, host_rx, task)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echo_worker_replies_with_same_id() {
        let spawner = TaskWorkerSpawner::echo();
        let worker = spawner.spawn("p", "entry.bin").unwrap();
        let mut rx = worker.take_receiver().expect("receiver");

        let msg = PluginMessage::new(
            MessageKind::Invoke,
            "p",
            json!({"method": "svc.get", "params": {"x": 1}}),
        );
        worker.post(msg.clone()).unwrap();

        let reply = rx.recv().await.expect("reply");
        assert_eq!(reply.id, msg.id);
        assert_eq!(reply.payload["data"]["x"], 1);
    }

    #[tokio::test]
    async fn terminate_closes_the_channel() {
        let spawner = TaskWorkerSpawner::echo();
        let worker = spawner.spawn("p", "entry.bin").unwrap();
        assert!(worker.is_alive());
        worker.terminate();
        // The aborted task drops its inbox; sends now fail.
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(worker
            .post(PluginMessage::new(MessageKind::Shutdown, "p", json!({})))
            .is_err());
    }

    #[tokio::test]
    async fn failing_spawner_errors() {
        let spawner = TaskWorkerSpawner::echo();
        spawner.set_fail_spawn(true);
        assert!(matches!(
            spawner.spawn("p", "entry.bin"),
            Err(PluginError::SpawnFailed { .. })
        ));
    }
}
