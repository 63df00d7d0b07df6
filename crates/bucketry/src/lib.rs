//! bucketry - distributed in-memory task bucket scheduler
//!
//! Each node runs a set of named, bounded task pools ("buckets"). A task is a
//! user-supplied [`Executor`] callback with a unique id, a JSON payload, and a
//! lifetime limit; it runs in its own tokio task with panic isolation and
//! deterministic lifecycle callbacks.
//!
//! Nodes join a symmetric mesh over a TCP control plane (see `bucketproto`).
//! When a local bucket is saturated, [`Group::fill`] forwards the task to the
//! peer reporting the lightest load for that bucket. Forwarding is
//! fire-and-forget: success means the request was queued to the peer, not
//! that the peer ran it.

pub mod bucket;
pub mod error;
pub mod executor;
pub mod group;
pub mod net;
pub mod task;

pub use bucket::{Bucket, BucketConfig};
pub use error::{BucketError, GroupError, TaskError};
pub use executor::Executor;
pub use group::Group;
pub use task::TaskKind;
