//! C3: three bounded in-memory task queues (foreground/load/background)
//! with distinct concurrency and capacity-timeout semantics, idempotency-key
//! deduplication, and connectivity-responsive drain/restore (§4.2).

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::{mpsc, oneshot, watch, Semaphore};
use tokio::task::JoinHandle;

use crate::config::{EngineConfig, QueueKind};
use crate::connectivity::Connectivity;
use crate::error::{Error, Result};

/// The unit of work routed through a queue. `operation` determines the
/// default queue (reads -> load, mutations -> foreground) when the caller
/// does not pin one explicitly.
pub enum Operation {
    Read,
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn default_queue(&self) -> QueueKind {
        match self {
            Operation::Read => QueueKind::Load,
            Operation::Create | Operation::Update | Operation::Delete => QueueKind::Foreground,
        }
    }
}

type BoxFut<T> = Pin<Box<dyn Future<Output = Result<T>> + Send>>;
type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

pub struct NetworkTask<T> {
    pub idempotency_key: String,
    pub operation: Operation,
    pub model_type: String,
    pub model_id: String,
    pub task_name: Option<String>,
    pub exec: BoxFut<T>,
}

impl<T> NetworkTask<T> {
    pub fn new<F, Fut>(idempotency_key: impl Into<String>, operation: Operation, model_type: impl Into<String>, model_id: impl Into<String>, exec: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        Self {
            idempotency_key: idempotency_key.into(),
            operation,
            model_type: model_type.into(),
            model_id: model_id.into(),
            task_name: None,
            exec: Box::pin(exec()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct QueueStat {
    pub active_and_pending: usize,
    pub pending: usize,
}

struct QueueHandle {
    sender: mpsc::UnboundedSender<Job>,
    worker: JoinHandle<()>,
    in_flight: Arc<AtomicUsize>,
    active_keys: Arc<Mutex<std::collections::HashSet<String>>>,
}

fn spawn_worker(kind: QueueKind, config: Arc<EngineConfig>) -> (mpsc::UnboundedSender<Job>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
    let permits = config.concurrency(kind).max(1);
    let semaphore = Arc::new(Semaphore::new(permits));
    let delay = config.inter_task_delay(kind);

    let handle = tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            let permit = semaphore.clone().acquire_owned().await.expect("semaphore never closed");
            tokio::spawn(async move {
                job.await;
                drop(permit);
            });
            tokio::time::sleep(delay).await;
        }
    });
    (tx, handle)
}

/// Manages the three bounded task queues and routes `NetworkTask`s through
/// them per §4.2's contract.
pub struct RequestQueueManager {
    config: Arc<EngineConfig>,
    queues: Mutex<HashMap<QueueKind, QueueHandle>>,
    connectivity: Arc<dyn Connectivity>,
}

impl RequestQueueManager {
    pub fn new(config: Arc<EngineConfig>, connectivity: Arc<dyn Connectivity>) -> Arc<Self> {
        let manager = Arc::new(Self {
            queues: Mutex::new(HashMap::new()),
            connectivity,
            config,
        });
        manager.recreate_all();
        manager
    }

    /// Drops and respawns all three queues, cancelling whatever is in-flight
    /// or pending (durable state in C2 is unaffected). Used on connectivity
    /// loss and by `Engine::obliterate_local_storage`.
    pub fn recreate_all(&self) {
        let mut queues = self.queues.lock().unwrap();
        for kind in [QueueKind::Foreground, QueueKind::Load, QueueKind::Background] {
            if let Some(old) = queues.remove(&kind) {
                old.worker.abort();
            }
            let (sender, worker) = spawn_worker(kind, self.config.clone());
            queues.insert(
                kind,
                QueueHandle {
                    sender,
                    worker,
                    in_flight: Arc::new(AtomicUsize::new(0)),
                    active_keys: Arc::new(Mutex::new(std::collections::HashSet::new())),
                },
            );
        }
    }

    /// Subscribes this manager to connectivity transitions: drops in-flight
    /// work on loss, and invokes `on_restore` on return so callers can refill
    /// queues in priority order (§4.2 Restoration; the caller typically wires
    /// `RetryExecutor::process_due_tasks_now`).
    pub fn watch_connectivity(self: &Arc<Self>, on_restore: Arc<dyn Fn() + Send + Sync>) {
        let mut rx: watch::Receiver<bool> = self.connectivity.subscribe();
        let manager = self.clone();
        tokio::spawn(async move {
            let mut last = *rx.borrow();
            loop {
                if rx.changed().await.is_err() {
                    break;
                }
                let online = *rx.borrow();
                if online != last {
                    if online {
                        tracing::info!("connectivity restored: refilling request queues");
                        on_restore();
                    } else {
                        tracing::info!("connectivity lost: cancelling in-flight and pending queue tasks");
                        manager.recreate_all();
                    }
                    last = online;
                }
            }
        });
    }

    pub fn queue_stats(&self) -> HashMap<QueueKind, QueueStat> {
        let queues = self.queues.lock().unwrap();
        queues
            .iter()
            .map(|(kind, handle)| {
                let active_and_pending = handle.in_flight.load(Ordering::SeqCst);
                (*kind, QueueStat { active_and_pending, pending: active_and_pending })
            })
            .collect()
    }

    /// §4.2 `enqueue(task, queueType)`.
    pub async fn enqueue<T: Send + 'static>(&self, task: NetworkTask<T>, queue: Option<QueueKind>) -> Result<T> {
        let kind = queue.unwrap_or_else(|| task.operation.default_queue());

        let (sender, in_flight, active_keys) = {
            let queues = self.queues.lock().unwrap();
            let handle = queues.get(&kind).expect("queue must exist");
            (handle.sender.clone(), handle.in_flight.clone(), handle.active_keys.clone())
        };

        // (a) reject duplicates.
        {
            let mut keys = active_keys.lock().unwrap();
            if keys.contains(&task.idempotency_key) {
                return Err(Error::DuplicateTask(task.idempotency_key));
            }
            // (b) register the key.
            keys.insert(task.idempotency_key.clone());
        }

        let release_key = {
            let active_keys = active_keys.clone();
            let key = task.idempotency_key.clone();
            move || {
                active_keys.lock().unwrap().remove(&key);
            }
        };

        // (c) wait for capacity.
        let timeout = self.config.capacity_timeout(kind);
        let check_interval = self.config.queue_capacity_check_interval;
        let max_capacity = self.config.max_capacity(kind);
        let started = Instant::now();
        loop {
            if in_flight.load(Ordering::SeqCst) < max_capacity {
                break;
            }
            if started.elapsed() >= timeout {
                release_key();
                return Err(Error::CapacityExceeded(format!("{kind:?} queue")));
            }
            tokio::time::sleep(check_interval).await;
        }

        // (d) offline gating for foreground/load.
        if matches!(kind, QueueKind::Foreground | QueueKind::Load) && !self.connectivity.is_connected() {
            release_key();
            return Err(Error::Offline(format!("{kind:?} queue requires connectivity")));
        }

        in_flight.fetch_add(1, Ordering::SeqCst);
        let (result_tx, result_rx) = oneshot::channel::<Result<T>>();
        let exec = task.exec;
        let job: Job = Box::pin(async move {
            let result = exec.await;
            let _ = result_tx.send(result);
        });

        if sender.send(job).is_err() {
            in_flight.fetch_sub(1, Ordering::SeqCst);
            release_key();
            return Err(Error::Offline(format!("{kind:?} queue is not running")));
        }

        let result = result_rx.await.map_err(|_| Error::Network("task dropped before completion".into()));
        in_flight.fetch_sub(1, Ordering::SeqCst);
        release_key();
        result?
    }
}
