//! Keyed, bounded registries of concurrently running tasks.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::info;

use crate::error::BucketError;
use crate::executor::Executor;
use crate::task::{Task, TaskHandle, TaskKind};

/// Settings shared by every task in one bucket, bound at construction.
#[derive(Debug, Clone)]
pub struct BucketConfig {
    /// How long a task may live before it is declared exhausted.
    pub life_span: Duration,
    /// How long a delayed task sleeps before its body runs.
    pub run_after: Duration,
    /// Maximum number of concurrently held tasks. Must be >= 1.
    pub max_bucket: usize,
    /// Emit per-task debug logging.
    pub verbose: bool,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            life_span: Duration::from_secs(2),
            run_after: Duration::ZERO,
            max_bucket: 16,
            verbose: false,
        }
    }
}

impl From<&bucketconf::BucketSettings> for BucketConfig {
    fn from(settings: &bucketconf::BucketSettings) -> Self {
        Self {
            life_span: settings.life_span(),
            run_after: settings.run_after(),
            max_bucket: settings.max_bucket,
            verbose: settings.verbose,
        }
    }
}

/// Shared bucket state; tasks hold a `Weak` back-reference to it.
pub(crate) struct BucketCore {
    name: String,
    config: BucketConfig,
    executor: Arc<dyn Executor>,
    tasks: Mutex<HashMap<String, TaskHandle>>,
    panic_acks_tx: mpsc::Sender<String>,
    panic_acks_rx: tokio::sync::Mutex<mpsc::Receiver<String>>,
}

impl BucketCore {
    /// Remove one task by id. Removing an id that is not present is a
    /// loud failure, not a no-op.
    pub(crate) fn remove_task(&self, id: &str) -> Result<(), BucketError> {
        let mut tasks = self.tasks.lock().unwrap();
        tasks
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| BucketError::RemoveMissing(id.to_string()))
    }

    /// Post one panic acknowledgement, tagged with the acknowledging
    /// task's id so a rescuer can match it against its snapshot. The
    /// channel is buffered to `max_bucket`, so a task never blocks here
    /// even when no rescue is currently receiving.
    pub(crate) fn acknowledge_panic(&self, id: &str) {
        let _ = self.panic_acks_tx.try_send(id.to_string());
    }

    pub(crate) fn len(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }
}

/// A named, bounded pool of running tasks sharing one config and executor.
///
/// Cheap to clone; all clones share the same registry.
#[derive(Clone)]
pub struct Bucket {
    core: Arc<BucketCore>,
}

impl Bucket {
    /// Create a bucket. Panics if `max_bucket` is zero; `bucketconf`
    /// validates this for file-loaded settings.
    pub fn new(name: impl Into<String>, config: BucketConfig, executor: Arc<dyn Executor>) -> Self {
        assert!(config.max_bucket >= 1, "max_bucket must be >= 1");
        let (panic_acks_tx, panic_acks_rx) = mpsc::channel(config.max_bucket);
        Self {
            core: Arc::new(BucketCore {
                name: name.into(),
                config,
                executor,
                tasks: Mutex::new(HashMap::new()),
                panic_acks_tx,
                panic_acks_rx: tokio::sync::Mutex::new(panic_acks_rx),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Insert a task and launch it. Rejects duplicates and, once
    /// `max_bucket` tasks are held, returns [`BucketError::BufferFull`];
    /// a rejected fill leaves no partial state.
    ///
    /// Must be called from within a tokio runtime.
    pub fn fill(&self, kind: TaskKind, id: &str, payload: Value) -> Result<(), BucketError> {
        let mut tasks = self.core.tasks.lock().unwrap();
        if tasks.contains_key(id) {
            return Err(BucketError::DuplicateId(id.to_string()));
        }
        if tasks.len() > self.core.config.max_bucket - 1 {
            return Err(BucketError::BufferFull);
        }

        let (handle, task) = Task::new(
            kind,
            id,
            payload,
            &self.core.config,
            Arc::clone(&self.core.executor),
            Arc::downgrade(&self.core),
        );
        tasks.insert(id.to_string(), handle);
        drop(tasks);

        tokio::spawn(task.run());
        Ok(())
    }

    /// Send a task its quit signal and remove it. The task fires no
    /// further callbacks once quit.
    pub fn drain(&self, id: &str) -> Result<(), BucketError> {
        let mut tasks = self.core.tasks.lock().unwrap();
        let handle = tasks
            .get(id)
            .ok_or_else(|| BucketError::NotFound(id.to_string()))?;
        let _ = handle.quit_tx.try_send(());
        tasks.remove(id);
        Ok(())
    }

    /// Signal panic to every currently held task and wait until each one
    /// that accepted the signal has acknowledged. Returns how many tasks
    /// were signaled.
    ///
    /// Acknowledgements are tagged with the task id and matched against
    /// the snapshot taken here, so acks left over from tasks outside the
    /// snapshot (a body that panicked on its own earlier) never satisfy
    /// this call's accounting. A snapshotted task that terminates through
    /// another branch still acknowledges its pending signal during
    /// cleanup.
    pub async fn rescue(&self) -> usize {
        let mut acks = self.core.panic_acks_rx.lock().await;
        // Anything parked here predates the snapshot below; clear it so a
        // backlog of earlier organic panics cannot exhaust the buffer.
        while acks.try_recv().is_ok() {}

        let mut remaining: HashSet<String> = {
            let tasks = self.core.tasks.lock().unwrap();
            tasks
                .iter()
                .filter(|(_, handle)| handle.panic_tx.try_send(()).is_ok())
                .map(|(id, _)| id.clone())
                .collect()
        };
        let signaled = remaining.len();
        info!(bucket = %self.core.name, tasks = signaled, "rescuing bucket");

        while !remaining.is_empty() {
            match acks.recv().await {
                // Acks from tasks outside the snapshot are stale; discard.
                Some(id) => {
                    remaining.remove(&id);
                }
                None => break,
            }
        }
        signaled
    }

    pub fn len(&self) -> usize {
        self.core.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
