//! TCP control plane: line framing, peer server, peer client.
//!
//! One JSON message per `\n`-terminated line over a plain TCP stream. Each
//! connection is split into a sink and a stream half; outbound messages go
//! through an unbounded FIFO drained by [`write_pump`], inbound lines are
//! parsed by the connection's reader and handed to a consumer queue. Pumps
//! block when idle and stop on cancellation.

pub(crate) mod client;
pub(crate) mod handlers;
pub(crate) mod server;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Hard cap on one wire line; a peer sending more is misbehaving.
pub(crate) const MAX_LINE_LEN: usize = 1 << 20;

pub(crate) type WireSink = SplitSink<Framed<TcpStream, LinesCodec>, String>;
pub(crate) type WireStream = SplitStream<Framed<TcpStream, LinesCodec>>;

pub(crate) fn split_stream(stream: TcpStream) -> (WireSink, WireStream) {
    Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LEN)).split()
}

/// Host portion of a `host:port` address.
pub(crate) fn host_of(addr: &str) -> &str {
    addr.rsplit_once(':').map(|(host, _)| host).unwrap_or(addr)
}

/// The allow-list is IP-only: the remote IP must match the host portion of
/// some configured peer. A peer that has not dialed us yet is still allowed
/// in - membership is by address, not by connection state.
pub(crate) fn is_addr_allowed(remote_ip: &str, members: &[String]) -> bool {
    members.iter().any(|member| host_of(member) == remote_ip)
}

/// Drain one outbound FIFO onto the wire, preserving enqueue order.
///
/// Write failures are logged and the pump keeps going; the reader is the
/// authority on connection death and will cancel us.
pub(crate) async fn write_pump<W: Serialize>(
    mut queue: mpsc::UnboundedReceiver<W>,
    mut sink: WireSink,
    addr: String,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            msg = queue.recv() => {
                let Some(msg) = msg else { return };
                let line = match bucketproto::to_line(&msg) {
                    Ok(line) => line,
                    Err(e) => {
                        debug!(peer = %addr, error = %e, "dropping unencodable message");
                        continue;
                    }
                };
                if let Err(e) = sink.send(line).await {
                    debug!(peer = %addr, error = %e, "write failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_of_splits_on_last_colon() {
        assert_eq!(host_of("127.0.0.1:4770"), "127.0.0.1");
        assert_eq!(host_of("node-a.internal:4770"), "node-a.internal");
        assert_eq!(host_of("bare-host"), "bare-host");
    }

    #[test]
    fn allow_list_matches_host_only() {
        let members = vec![
            "10.0.0.2:4770".to_string(),
            "10.0.0.3:4771".to_string(),
        ];
        // Ephemeral source ports do not matter, only the IP.
        assert!(is_addr_allowed("10.0.0.2", &members));
        assert!(is_addr_allowed("10.0.0.3", &members));
        assert!(!is_addr_allowed("10.0.0.4", &members));
        assert!(!is_addr_allowed("", &[]));
    }
}
