//! Typed errors for the bucket engine and group coordination.
//!
//! The `Display` strings here are load-bearing: handler replies carry them
//! verbatim in `Ret.err`, and `BucketError::BufferFull`'s text doubles as
//! the public overflow sentinel.

use thiserror::Error;

/// Errors from bucket fill/drain/remove operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BucketError {
    /// The bucket already holds `max_bucket` tasks. Exact text is the
    /// overflow sentinel checked by [`crate::Group::fill`].
    #[error("task buffer exceeded")]
    BufferFull,

    #[error("task with id {0} already exists")]
    DuplicateId(String),

    #[error("task with id {0} is not found")]
    NotFound(String),

    #[error("task with id {0} does not exist, unable to remove")]
    RemoveMissing(String),

    /// The owning bucket was dropped while a task was still cleaning up.
    #[error("bucket dropped while task {0} was draining")]
    BucketGone(String),
}

/// A task's recorded terminal error.
///
/// Callback failures are wrapped as `"<kind>: <message>"` where the kind
/// names the callback that failed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TaskError {
    /// The lifespan expired before the body finished.
    #[error("context deadline exceeded")]
    DeadlineExceeded,

    /// `on_execute` returned an error.
    #[error("onExecute: {0}")]
    Execute(String),

    /// `on_execute_error` itself returned an error.
    #[error("onExecuteErr: {0}")]
    ExecuteErr(String),

    /// `on_finish` returned an error.
    #[error("onFinish: {0}")]
    Finish(String),

    /// `on_task_exhausted` returned an error.
    #[error("onTaskExhausted: {0}")]
    Exhausted(String),

    /// Whatever `on_panic` returned, unwrapped.
    #[error("{0}")]
    Panic(String),
}

/// Errors from group-level fill and peer selection.
#[derive(Debug, Error)]
pub enum GroupError {
    #[error("bucket {0} is not configured")]
    UnknownBucket(String),

    /// No peer is currently dialed and registered.
    #[error("no peer available")]
    NoPeerAvailable,

    /// The selected peer's occupancy report has no entry for the bucket.
    #[error("task not found in info")]
    TaskNotInInfo,

    #[error(transparent)]
    Bucket(#[from] BucketError),

    #[error("payload encode failed: {0}")]
    Encode(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_full_sentinel_text() {
        assert_eq!(BucketError::BufferFull.to_string(), "task buffer exceeded");
    }

    #[test]
    fn duplicate_id_mentions_exists() {
        let err = BucketError::DuplicateId("z".to_string());
        assert!(err.to_string().contains("exists"));
    }

    #[test]
    fn task_error_wrapping_kinds() {
        assert_eq!(
            TaskError::DeadlineExceeded.to_string(),
            "context deadline exceeded"
        );
        assert_eq!(
            TaskError::Execute("boom".to_string()).to_string(),
            "onExecute: boom"
        );
        assert_eq!(
            TaskError::ExecuteErr("boom".to_string()).to_string(),
            "onExecuteErr: boom"
        );
        assert_eq!(
            TaskError::Finish("boom".to_string()).to_string(),
            "onFinish: boom"
        );
        assert_eq!(
            TaskError::Exhausted("boom".to_string()).to_string(),
            "onTaskExhausted: boom"
        );
    }

    #[test]
    fn group_error_passthrough() {
        let err = GroupError::from(BucketError::BufferFull);
        assert_eq!(err.to_string(), "task buffer exceeded");
        assert_eq!(GroupError::NoPeerAvailable.to_string(), "no peer available");
        assert_eq!(
            GroupError::TaskNotInInfo.to_string(),
            "task not found in info"
        );
    }
}
