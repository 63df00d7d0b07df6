//! The node-level assembly: local buckets, peer clients, discovery, server.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use bucketproto::{Command, Req};

use crate::bucket::Bucket;
use crate::error::{BucketError, GroupError};
use crate::net::client::{PeerClient, PeerState};
use crate::net::server::ServerState;
use crate::task::TaskKind;

/// How often discovery dials missing peers and pings established ones.
const DISCOVERY_INTERVAL: Duration = Duration::from_millis(100);

/// All configured peers of this node.
pub(crate) struct PeerSet {
    peers: Mutex<HashMap<String, Arc<PeerClient>>>,
}

impl PeerSet {
    fn new(addrs: &[String], debug: bool) -> Self {
        let peers = addrs
            .iter()
            .map(|addr| (addr.clone(), PeerClient::new(addr.clone(), debug)))
            .collect();
        Self {
            peers: Mutex::new(peers),
        }
    }

    /// One discovery tick: dial every down peer (and register on success),
    /// ping every established one. Registering peers are left alone until
    /// their REG reply arrives or the connection drops.
    pub(crate) async fn dial_all(&self) {
        let snapshot: Vec<Arc<PeerClient>> =
            self.peers.lock().unwrap().values().cloned().collect();

        for peer in snapshot {
            match peer.state() {
                PeerState::Down => match peer.dial().await {
                    Ok(()) => {
                        if peer.debug {
                            debug!(peer = %peer.addr, "dial success, registering");
                        }
                        peer.push_req(Req::command(Command::Reg));
                    }
                    Err(e) => {
                        if peer.debug {
                            debug!(peer = %peer.addr, error = %e, "unable to dial");
                        }
                    }
                },
                PeerState::Registering => {}
                PeerState::Up => {
                    peer.push_req(Req::command(Command::Ping));
                }
            }
        }
    }

    /// The up peer with the lowest cached occupancy for `task`. An up peer
    /// whose report lacks the bucket is an error, never a silent pick.
    pub(crate) fn best(&self, task: &str) -> Result<Arc<PeerClient>, GroupError> {
        let peers = self.peers.lock().unwrap();
        let mut best: Option<(Arc<PeerClient>, usize)> = None;
        for peer in peers.values() {
            if peer.state() != PeerState::Up {
                continue;
            }
            let len = peer.occupancy(task).ok_or(GroupError::TaskNotInInfo)?;
            if best.as_ref().map_or(true, |(_, best_len)| len < *best_len) {
                best = Some((Arc::clone(peer), len));
            }
        }
        best.map(|(peer, _)| peer).ok_or(GroupError::NoPeerAvailable)
    }
}

async fn discover(peers: Arc<PeerSet>, cancel: CancellationToken) {
    let mut ticker = time::interval(DISCOVERY_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => peers.dial_all().await,
        }
    }
}

/// One node of the mesh: its buckets, its peers, and its server.
///
/// Forwarding is fire-and-forget: a [`Group::fill`] that overflowed
/// locally reports success as soon as the TASK request is queued to the
/// chosen peer. There is no end-to-end acknowledgement back to the caller;
/// the peer's reply is only debug-logged.
pub struct Group {
    buckets: Arc<HashMap<String, Bucket>>,
    peers: Arc<PeerSet>,
    server: Arc<ServerState>,
    cancel: CancellationToken,
}

impl Group {
    /// Assemble a node. `peers` must not contain the local address; the
    /// same list doubles as the server's inbound allow-list.
    pub fn new(
        buckets: HashMap<String, Bucket>,
        peers: Vec<String>,
        server_port: impl Into<String>,
        debug: bool,
    ) -> Self {
        let buckets = Arc::new(buckets);
        let server = ServerState::new(
            server_port.into(),
            peers.clone(),
            Arc::clone(&buckets),
            debug,
        );
        Self {
            buckets,
            peers: Arc::new(PeerSet::new(&peers, debug)),
            server,
            cancel: CancellationToken::new(),
        }
    }

    pub fn get_bucket(&self, name: &str) -> Option<&Bucket> {
        self.buckets.get(name)
    }

    /// Run discovery and the peer server until the server fails or
    /// [`Group::stop_work`] is called.
    pub async fn start_work(&self) -> anyhow::Result<()> {
        info!("starting group work");
        let discovery = tokio::spawn(discover(
            Arc::clone(&self.peers),
            self.cancel.child_token(),
        ));
        let result = Arc::clone(&self.server).run(self.cancel.child_token()).await;
        discovery.abort();
        result
    }

    /// Signal discovery and the server to stop.
    pub fn stop_work(&self) {
        info!("stopping group work");
        self.cancel.cancel();
    }

    /// Fill locally; when the bucket reports it is full, forward the task
    /// to the least-loaded up peer instead. Every other local failure
    /// propagates unchanged.
    pub fn fill(&self, task: &str, pid: &str, payload: Value) -> Result<(), GroupError> {
        let bucket = self
            .buckets
            .get(task)
            .ok_or_else(|| GroupError::UnknownBucket(task.to_string()))?;

        match bucket.fill(TaskKind::Immediate, pid, payload.clone()) {
            Ok(()) => Ok(()),
            Err(BucketError::BufferFull) => {
                let peer = self.peers.best(task)?;
                let data = serde_json::to_string(&payload)?;
                if !peer.push_req(Req::task(task, pid, data)) {
                    return Err(GroupError::NoPeerAvailable);
                }
                debug!(task.id = %pid, bucket = %task, peer = %peer.addr, "bucket full, forwarded to peer");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bucketproto::TaskInfo;

    fn up_peer(addr: &str, infos: Vec<TaskInfo>) -> Arc<PeerClient> {
        let peer = PeerClient::new(addr, false);
        peer.set_state(PeerState::Up);
        peer.update_info(infos);
        peer
    }

    fn info(key: &str, len: usize) -> TaskInfo {
        TaskInfo {
            key: key.to_string(),
            len,
        }
    }

    fn set_of(peers: Vec<Arc<PeerClient>>) -> PeerSet {
        PeerSet {
            peers: Mutex::new(
                peers
                    .into_iter()
                    .map(|p| (p.addr.clone(), p))
                    .collect(),
            ),
        }
    }

    #[test]
    fn best_picks_lowest_occupancy() {
        let set = set_of(vec![
            up_peer("10.0.0.2:4770", vec![info("mail", 5)]),
            up_peer("10.0.0.3:4770", vec![info("mail", 1)]),
            up_peer("10.0.0.4:4770", vec![info("mail", 3)]),
        ]);
        let best = set.best("mail").unwrap();
        assert_eq!(best.addr, "10.0.0.3:4770");
    }

    #[test]
    fn best_skips_down_peers() {
        let idle = PeerClient::new("10.0.0.2:4770", false);
        idle.update_info(vec![info("mail", 0)]);
        let set = set_of(vec![idle, up_peer("10.0.0.3:4770", vec![info("mail", 7)])]);

        let best = set.best("mail").unwrap();
        assert_eq!(best.addr, "10.0.0.3:4770");
    }

    #[test]
    fn best_without_up_peers_errors() {
        let set = set_of(vec![PeerClient::new("10.0.0.2:4770", false)]);
        assert!(matches!(
            set.best("mail"),
            Err(GroupError::NoPeerAvailable)
        ));
    }

    #[test]
    fn best_with_missing_info_errors() {
        let set = set_of(vec![up_peer("10.0.0.2:4770", vec![info("billing", 0)])]);
        assert!(matches!(set.best("mail"), Err(GroupError::TaskNotInInfo)));
    }
}
