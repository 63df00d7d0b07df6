//! The executor seam: caller-supplied lifecycle callbacks.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::TaskError;

/// Lifecycle callbacks for one class of tasks.
///
/// A bucket holds one executor and dispatches it for every task it runs.
/// All callbacks are optional (default to no-ops) and may return errors,
/// which the task records as its terminal error.
///
/// Exactly one of `on_finish`, `on_execute_error`, `on_task_exhausted`, or
/// `on_panic` fires per task that reaches a terminal state; a drained
/// (quit) task fires none of them.
#[async_trait]
pub trait Executor: Send + Sync + 'static {
    /// The task body. May block on I/O; it runs in its own tokio task and
    /// is cancelled when the lifespan expires.
    async fn on_execute(&self, id: &str, payload: &Value) -> anyhow::Result<()> {
        let _ = (id, payload);
        Ok(())
    }

    /// The body completed without error.
    async fn on_finish(&self, id: &str, payload: &Value) -> anyhow::Result<()> {
        let _ = (id, payload);
        Ok(())
    }

    /// The lifespan expired before the body completed.
    async fn on_task_exhausted(&self, id: &str, payload: &Value) -> anyhow::Result<()> {
        let _ = (id, payload);
        Ok(())
    }

    /// The body completed with an error; `execute_err` is the wrapped form.
    async fn on_execute_error(
        &self,
        id: &str,
        payload: &Value,
        execute_err: &TaskError,
    ) -> anyhow::Result<()> {
        let _ = (id, payload, execute_err);
        Ok(())
    }

    /// The task was rescued, or its body panicked.
    async fn on_panic(&self, id: &str, payload: &Value) -> anyhow::Result<()> {
        let _ = (id, payload);
        Ok(())
    }
}
