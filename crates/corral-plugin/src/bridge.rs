use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::envelope::PluginMessage;
use crate::error::PluginError;
use crate::spawn::WorkerHandle;

type Subscriber = Arc<dyn Fn(Uuid, &PluginMessage) + Send + Sync>;
type CloseHandler = Box<dyn FnOnce() + Send>;

struct DispatchEntry {
    /// While false the worker is detached: its messages are dropped and a
    /// channel close is not reported.
    active: Arc<AtomicBool>,
    close: Arc<Mutex<Option<CloseHandler>>>,
}

/// Routes framed worker messages: pending-request resolution by message id
/// first, then fan-out to every registered subscriber.
///
/// The dispatch listener is attached lazily, once per worker. Detaching
/// flips the worker to inert without consuming its channel, so a later
/// attach (reload rollback) resumes delivery.
#[derive(Default)]
pub struct MessageBridge {
    pending: Arc<Mutex<HashMap<Uuid, oneshot::Sender<PluginMessage>>>>,
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
    dispatchers: Arc<Mutex<HashMap<Uuid, DispatchEntry>>>,
}

impl MessageBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber invoked for every inbound message from any
    /// attached worker.
    pub fn subscribe(&self, subscriber: Subscriber) {
        self.subscribers.lock().push(subscriber);
    }

    /// Attach the dispatch listener to `worker`, or re-activate a detached
    /// one. `on_close` fires when the worker's channel closes while
    /// attached (an unexpected termination, as far as the bridge can tell).
    pub fn attach(&self, worker: &WorkerHandle, on_close: Option<CloseHandler>) {
        let worker_id = worker.worker_id;
        {
            let dispatchers = self.dispatchers.lock();
            if let Some(entry) = dispatchers.get(&worker_id) {
                entry.active.store(true, Ordering::Release);
                *entry.close.lock() = on_close;
                return;
            }
        }
        let Some(mut rx) = worker.take_receiver() else {
            return;
        };

        let active = Arc::new(AtomicBool::new(true));
        let close = Arc::new(Mutex::new(on_close));
        {
            let mut dispatchers = self.dispatchers.lock();
            dispatchers.insert(
                worker_id,
                DispatchEntry { active: Arc::clone(&active), close: Arc::clone(&close) },
            );
        }

        let pending = Arc::clone(&self.pending);
        let subscribers = Arc::clone(&self.subscribers);
        let dispatchers = Arc::clone(&self.dispatchers);
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if !active.load(Ordering::Acquire) {
                    trace!(worker_id = %worker_id, "dropping message from detached worker");
                    continue;
                }
                trace!(worker_id = %worker_id, kind = ?msg.kind, "bridge dispatch");
                if let Some(tx) = pending.lock().remove(&msg.id) {
                    let _ = tx.send(msg);
                    continue;
                }
                let subs: Vec<Subscriber> = subscribers.lock().clone();
                for sub in subs {
                    sub(worker_id, &msg);
                }
            }
            debug!(worker_id = %worker_id, "worker channel closed");
            let handler = close.lock().take();
            if active.load(Ordering::Acquire) {
                if let Some(handler) = handler {
                    handler();
                }
            }
            dispatchers.lock().remove(&worker_id);
        });
    }

    /// Stop delivering for `worker_id` and suppress its close handler.
    pub fn detach(&self, worker_id: Uuid) {
        let dispatchers = self.dispatchers.lock();
        if let Some(entry) = dispatchers.get(&worker_id) {
            entry.active.store(false, Ordering::Release);
        }
    }

    /// Post `msg` and await the correlated reply, or fail with `Timeout`
    /// after `timeout`. The pending entry is cleared either way.
    pub async fn send_and_wait(
        &self,
        worker: &WorkerHandle,
        msg: PluginMessage,
        timeout: Duration,
    ) -> Result<PluginMessage, PluginError> {
        let (tx, rx) = oneshot::channel();
        let id = msg.id;
        self.pending.lock().insert(id, tx);

        if let Err(e) = worker.post(msg) {
            self.pending.lock().remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => {
                self.pending.lock().remove(&id);
                Err(PluginError::WorkerGone(worker.plugin_id.clone()))
            }
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(PluginError::Timeout { elapsed_ms: timeout.as_millis() as u64 })
            }
        }
    }
}
