//! One scheduled unit of work.
//!
//! A task owns nothing but its run loop: the bucket keeps a [`TaskHandle`]
//! (the quit/panic signal senders) and the spawned loop keeps a weak
//! back-reference to the bucket for self-removal, so dropping a bucket never
//! leaks a reference cycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time;
use tracing::{debug, error};

use crate::bucket::{BucketConfig, BucketCore};
use crate::error::{BucketError, TaskError};
use crate::executor::Executor;

/// Whether the body starts at once or after the configured delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Immediate,
    Delayed,
}

/// The bucket's grip on a running task: signal senders only.
pub(crate) struct TaskHandle {
    pub(crate) quit_tx: mpsc::Sender<()>,
    pub(crate) panic_tx: mpsc::Sender<()>,
}

pub(crate) struct Task {
    id: String,
    kind: TaskKind,
    payload: Value,
    life_span: Duration,
    run_after: Duration,
    verbose: bool,
    executor: Arc<dyn Executor>,
    owner: Weak<BucketCore>,
    is_quit: Arc<AtomicBool>,
    quit_rx: mpsc::Receiver<()>,
    panic_rx: mpsc::Receiver<()>,
}

impl Task {
    pub(crate) fn new(
        kind: TaskKind,
        id: &str,
        payload: Value,
        config: &BucketConfig,
        executor: Arc<dyn Executor>,
        owner: Weak<BucketCore>,
    ) -> (TaskHandle, Task) {
        let (quit_tx, quit_rx) = mpsc::channel(1);
        let (panic_tx, panic_rx) = mpsc::channel(1);

        let handle = TaskHandle { quit_tx, panic_tx };
        let task = Task {
            id: id.to_string(),
            kind,
            payload,
            life_span: config.life_span,
            run_after: config.run_after,
            verbose: config.verbose,
            executor,
            owner,
            is_quit: Arc::new(AtomicBool::new(false)),
            quit_rx,
            panic_rx,
        };
        (handle, task)
    }

    /// Drive the task to exactly one terminal state.
    ///
    /// The body runs in its own tokio task so a panicking executor is
    /// isolated; the loop races it against the lifespan deadline and the
    /// external quit/panic signals. Every terminal outcome except quit
    /// removes the task from the owning bucket.
    pub(crate) async fn run(mut self) {
        let deadline = time::sleep(self.life_span);
        tokio::pin!(deadline);

        let mut body = tokio::spawn({
            let executor = Arc::clone(&self.executor);
            let id = self.id.clone();
            let payload = self.payload.clone();
            let is_quit = Arc::clone(&self.is_quit);
            let kind = self.kind;
            let run_after = self.run_after;
            let verbose = self.verbose;
            async move {
                if kind == TaskKind::Delayed {
                    if verbose {
                        debug!(task.id = %id, "waiting {:?} before body", run_after);
                    }
                    time::sleep(run_after).await;
                    // A drain may have landed during the delay.
                    if is_quit.load(Ordering::SeqCst) {
                        return Ok(());
                    }
                }
                executor.on_execute(&id, &payload).await
            }
        });

        let mut task_err: Option<TaskError> = None;
        let mut cleanup = true;

        tokio::select! {
            () = &mut deadline => {
                if self.verbose {
                    debug!(task.id = %self.id, "lifespan {:?} exceeded", self.life_span);
                }
                body.abort();
                task_err = Some(TaskError::DeadlineExceeded);
                if let Err(e) = self.executor.on_task_exhausted(&self.id, &self.payload).await {
                    task_err = Some(TaskError::Exhausted(e.to_string()));
                }
            }
            joined = &mut body => match joined {
                Ok(Ok(())) => {
                    if self.verbose {
                        debug!(task.id = %self.id, "finished, dispatching on_finish");
                    }
                    if let Err(e) = self.executor.on_finish(&self.id, &self.payload).await {
                        task_err = Some(TaskError::Finish(e.to_string()));
                    }
                }
                Ok(Err(exec_err)) => {
                    if self.verbose {
                        debug!(task.id = %self.id, error = %exec_err, "executed with error");
                    }
                    let wrapped = TaskError::Execute(exec_err.to_string());
                    match self
                        .executor
                        .on_execute_error(&self.id, &self.payload, &wrapped)
                        .await
                    {
                        Ok(()) => task_err = Some(wrapped),
                        Err(e) => task_err = Some(TaskError::ExecuteErr(e.to_string())),
                    }
                }
                Err(join_err) if join_err.is_panic() => {
                    // An unhandled fault in the executor takes the same
                    // path as an external rescue signal.
                    task_err = self.dispatch_panic().await;
                }
                Err(_) => {}
            },
            _ = self.panic_rx.recv() => {
                body.abort();
                task_err = self.dispatch_panic().await;
            }
            _ = self.quit_rx.recv() => {
                if self.verbose {
                    debug!(task.id = %self.id, "quit signal received");
                }
                self.is_quit.store(true, Ordering::SeqCst);
                // The drainer performs the removal; nothing more to do here.
                cleanup = false;
            }
        }

        if let Some(err) = &task_err {
            debug!(task.id = %self.id, task.err = %err, "task reached terminal state with error");
        }

        if cleanup {
            if let Err(e) = self.remove_from_owner() {
                error!(task.id = %self.id, error = %e, "task cleanup failed");
            }
        }

        // A rescue may have signaled us while another branch was already
        // ready; the rescuer still waits on this task's acknowledgement.
        // Checked after removal: the map lock orders any rescue snapshot
        // that counted us before this point.
        if self.panic_rx.try_recv().is_ok() {
            if let Some(owner) = self.owner.upgrade() {
                owner.acknowledge_panic(&self.id);
            }
        }
    }

    /// Run `on_panic`, then acknowledge on the bucket's panic channel.
    async fn dispatch_panic(&self) -> Option<TaskError> {
        let err = match self.executor.on_panic(&self.id, &self.payload).await {
            Ok(()) => None,
            Err(e) => Some(TaskError::Panic(e.to_string())),
        };
        if let Some(owner) = self.owner.upgrade() {
            owner.acknowledge_panic(&self.id);
        }
        err
    }

    fn remove_from_owner(&self) -> Result<(), BucketError> {
        let owner = self
            .owner
            .upgrade()
            .ok_or_else(|| BucketError::BucketGone(self.id.clone()))?;
        owner.remove_task(&self.id)?;
        if self.verbose {
            debug!(task.id = %self.id, remaining = owner.len(), "task removed from bucket");
        }
        Ok(())
    }
}
