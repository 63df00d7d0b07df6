//! The outbound half of the mesh: one client per configured peer.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use futures::StreamExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use bucketproto::{Req, Ret, TaskInfo};

use crate::net::{handlers, split_stream, write_pump};

/// Connection state of one peer.
///
/// `Up` is gated on the peer acknowledging our registration, not on the
/// dial alone; discovery leaves a `Registering` peer alone until the REG
/// reply arrives or the connection drops.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PeerState {
    Down = 0,
    Registering = 1,
    Up = 2,
}

impl PeerState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => PeerState::Registering,
            2 => PeerState::Up,
            _ => PeerState::Down,
        }
    }

    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            PeerState::Down => "down",
            PeerState::Registering => "registering",
            PeerState::Up => "up",
        }
    }
}

impl std::fmt::Display for PeerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Dials one peer, keeps its connection driven, and caches the occupancy
/// the peer last reported. Reconnection is the discovery loop's job: any
/// read failure just flips the state back to `Down`.
pub(crate) struct PeerClient {
    pub(crate) addr: String,
    pub(crate) debug: bool,
    state: AtomicU8,
    infos: Mutex<Vec<TaskInfo>>,
    req_tx: Mutex<Option<mpsc::UnboundedSender<Req>>>,
}

impl PeerClient {
    pub(crate) fn new(addr: impl Into<String>, debug: bool) -> Arc<Self> {
        Arc::new(Self {
            addr: addr.into(),
            debug,
            state: AtomicU8::new(PeerState::Down as u8),
            infos: Mutex::new(Vec::new()),
            req_tx: Mutex::new(None),
        })
    }

    pub(crate) fn state(&self) -> PeerState {
        PeerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_state(&self, state: PeerState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// The peer acknowledged our registration.
    pub(crate) fn mark_up(&self) {
        self.set_state(PeerState::Up);
    }

    /// Replace the cached occupancy report.
    pub(crate) fn update_info(&self, infos: Vec<TaskInfo>) {
        *self.infos.lock().unwrap() = infos;
    }

    /// Last-known occupancy of `bucket` on this peer, if reported.
    pub(crate) fn occupancy(&self, bucket: &str) -> Option<usize> {
        self.infos
            .lock()
            .unwrap()
            .iter()
            .find(|info| info.key == bucket)
            .map(|info| info.len)
    }

    /// Enqueue an outbound request. Returns false when no connection is
    /// currently established.
    pub(crate) fn push_req(&self, req: Req) -> bool {
        match self.req_tx.lock().unwrap().as_ref() {
            Some(tx) => tx.send(req).is_ok(),
            None => false,
        }
    }

    /// Dial the peer and launch the reader plus both queue pumps. On any
    /// read failure the reader cancels the pumps and marks the peer down;
    /// the next discovery tick re-dials.
    pub(crate) async fn dial(self: &Arc<Self>) -> anyhow::Result<()> {
        let stream = TcpStream::connect(&self.addr).await?;
        let (sink, mut lines) = split_stream(stream);

        let (req_tx, req_rx) = mpsc::unbounded_channel::<Req>();
        let (ret_tx, mut ret_rx) = mpsc::unbounded_channel::<Ret>();
        *self.req_tx.lock().unwrap() = Some(req_tx);
        self.set_state(PeerState::Registering);
        if self.debug {
            debug!(peer = %self.addr, state = %self.state(), "connection established");
        }

        let cancel = CancellationToken::new();
        tokio::spawn(write_pump(req_rx, sink, self.addr.clone(), cancel.clone()));

        {
            let peer = Arc::clone(self);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        ret = ret_rx.recv() => {
                            let Some(ret) = ret else { return };
                            if let Err(e) = handlers::resolve_ret(&peer, &ret) {
                                if peer.debug {
                                    debug!(peer = %peer.addr, error = %e, "reply not resolved");
                                }
                            }
                        }
                    }
                }
            });
        }

        {
            let peer = Arc::clone(self);
            tokio::spawn(async move {
                loop {
                    match lines.next().await {
                        Some(Ok(line)) => match bucketproto::from_line::<Ret>(&line) {
                            Ok(ret) => {
                                let _ = ret_tx.send(ret);
                            }
                            Err(e) => {
                                if peer.debug {
                                    debug!(peer = %peer.addr, error = %e, "dropping unparsable reply");
                                }
                            }
                        },
                        Some(Err(e)) => {
                            if peer.debug {
                                debug!(peer = %peer.addr, error = %e, "read error");
                            }
                            break;
                        }
                        None => {
                            if peer.debug {
                                debug!(peer = %peer.addr, "server closed connection");
                            }
                            break;
                        }
                    }
                }
                cancel.cancel();
                peer.disconnected();
            });
        }

        Ok(())
    }

    fn disconnected(&self) {
        self.set_state(PeerState::Down);
        self.req_tx.lock().unwrap().take();
    }
}
