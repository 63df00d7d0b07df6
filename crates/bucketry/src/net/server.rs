//! The peer-facing server: accept loop, allow-list, per-connection pumps.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use bucketproto::{Req, Ret, TaskInfo};

use crate::bucket::Bucket;
use crate::net::{handlers, is_addr_allowed, split_stream, write_pump};

/// One accepted connection, as seen by the protocol handlers: its remote
/// address and the outbound reply queue.
pub(crate) struct ServerConn {
    pub(crate) addr: String,
    ret_tx: mpsc::UnboundedSender<Ret>,
}

impl ServerConn {
    /// Enqueue a reply. Never blocks; the queue is unbounded.
    pub(crate) fn push_ret(&self, ret: Ret) {
        let _ = self.ret_tx.send(ret);
    }
}

/// Shared server state: the listener config, the registered-connections
/// map, and the local bucket registry it reports on.
pub(crate) struct ServerState {
    port: String,
    members: Vec<String>,
    reg_conns: DashMap<String, DateTime<Utc>>,
    buckets: Arc<HashMap<String, Bucket>>,
    pub(crate) debug: bool,
}

impl ServerState {
    pub(crate) fn new(
        port: String,
        members: Vec<String>,
        buckets: Arc<HashMap<String, Bucket>>,
        debug: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            port,
            members,
            reg_conns: DashMap::new(),
            buckets,
            debug,
        })
    }

    pub(crate) fn is_registered(&self, addr: &str) -> bool {
        self.reg_conns.contains_key(addr)
    }

    /// Insert `addr` into the registered set. Returns the registration
    /// time, or `None` if the address was already registered.
    pub(crate) fn register(&self, addr: &str) -> Option<DateTime<Utc>> {
        match self.reg_conns.entry(addr.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => None,
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let now = Utc::now();
                entry.insert(now);
                Some(now)
            }
        }
    }

    pub(crate) fn deregister(&self, addr: &str) {
        self.reg_conns.remove(addr);
    }

    pub(crate) fn bucket(&self, name: &str) -> Option<&Bucket> {
        self.buckets.get(name)
    }

    /// Occupancy of every local bucket, for PONG replies.
    pub(crate) fn bucket_info(&self) -> Vec<TaskInfo> {
        self.buckets
            .iter()
            .map(|(name, bucket)| TaskInfo {
                key: name.clone(),
                len: bucket.len(),
            })
            .collect()
    }

    /// Bind and accept until cancelled. Unauthorized connections are
    /// dropped on the floor; authorized ones get their own driver task.
    pub(crate) async fn run(self: Arc<Self>, cancel: CancellationToken) -> anyhow::Result<()> {
        let listener = TcpListener::bind(format!("0.0.0.0:{}", self.port))
            .await
            .with_context(|| format!("failed to bind peer server on port {}", self.port))?;
        info!(port = %self.port, "peer server listening");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                accepted = listener.accept() => {
                    let (stream, remote) = accepted.context("accept failed")?;
                    if !is_addr_allowed(&remote.ip().to_string(), &self.members) {
                        warn!(peer = %remote, "closing unauthorized connection");
                        continue;
                    }
                    let state = Arc::clone(&self);
                    let conn_cancel = cancel.child_token();
                    tokio::spawn(async move {
                        state.drive_conn(stream, remote.to_string(), conn_cancel).await;
                    });
                }
            }
        }
    }

    /// Per-connection driver: spawns the reply pump and the request
    /// consumer, then reads lines until the peer goes away. EOF
    /// deregisters the connection; other read errors only tear it down.
    async fn drive_conn(self: Arc<Self>, stream: TcpStream, addr: String, cancel: CancellationToken) {
        let (sink, mut lines) = split_stream(stream);
        let (ret_tx, ret_rx) = mpsc::unbounded_channel::<Ret>();
        let (req_tx, mut req_rx) = mpsc::unbounded_channel::<Req>();

        tokio::spawn(write_pump(ret_rx, sink, addr.clone(), cancel.clone()));

        {
            let state = Arc::clone(&self);
            let conn = ServerConn {
                addr: addr.clone(),
                ret_tx,
            };
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        req = req_rx.recv() => {
                            let Some(req) = req else { return };
                            if let Err(e) = handlers::resolve(&state, &conn, &req) {
                                if state.debug {
                                    debug!(peer = %conn.addr, error = %e, "request not resolved");
                                }
                            }
                        }
                    }
                }
            });
        }

        loop {
            match lines.next().await {
                Some(Ok(line)) => match bucketproto::from_line::<Req>(&line) {
                    Ok(req) => {
                        let _ = req_tx.send(req);
                    }
                    Err(e) => {
                        if self.debug {
                            debug!(peer = %addr, error = %e, "dropping unparsable request");
                        }
                    }
                },
                Some(Err(e)) => {
                    if self.debug {
                        debug!(peer = %addr, error = %e, "read error");
                    }
                    break;
                }
                None => {
                    self.deregister(&addr);
                    if self.debug {
                        debug!(peer = %addr, "connection closed");
                    }
                    break;
                }
            }
        }
        cancel.cancel();
    }
}
