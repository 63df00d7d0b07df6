//! Protocol handlers: server-side REG/PING/TASK, client-side reply resolvers.

use anyhow::bail;
use serde_json::Value;
use tracing::debug;

use bucketproto::{Command, Req, Ret, TaskInfo};

use crate::net::client::PeerClient;
use crate::net::server::{ServerConn, ServerState};
use crate::task::TaskKind;

/// Route one inbound request to its handler.
pub(crate) fn resolve(state: &ServerState, conn: &ServerConn, req: &Req) -> anyhow::Result<()> {
    match Command::parse(&req.cmd)? {
        Command::Reg => register(state, conn),
        Command::Ping => ping(state, conn),
        Command::Task => accept_task(state, conn, req),
        other => bail!("unresolved command: {other}"),
    }
}

fn register(state: &ServerState, conn: &ServerConn) -> anyhow::Result<()> {
    match state.register(&conn.addr) {
        Some(registered_at) => {
            if state.debug {
                debug!(peer = %conn.addr, "connection registered");
            }
            conn.push_ret(Ret::data(
                Command::Reg,
                format!("{} registered at {}", conn.addr, registered_at.to_rfc3339()),
            ));
            Ok(())
        }
        None => {
            let msg = format!("connection to {} is already established", conn.addr);
            conn.push_ret(Ret::err(Command::Regd, &msg));
            bail!(msg)
        }
    }
}

fn ping(state: &ServerState, conn: &ServerConn) -> anyhow::Result<()> {
    if !state.is_registered(&conn.addr) {
        conn.push_ret(Ret::err(
            Command::Ureg,
            format!("{} has not registered yet", conn.addr),
        ));
        bail!("{} is not registered", conn.addr);
    }
    if state.debug {
        debug!(peer = %conn.addr, "ping");
    }
    let report = serde_json::to_string(&state.bucket_info())?;
    conn.push_ret(Ret::data(Command::Pong, report));
    Ok(())
}

fn accept_task(state: &ServerState, conn: &ServerConn, req: &Req) -> anyhow::Result<()> {
    if !state.is_registered(&conn.addr) {
        conn.push_ret(Ret::err(
            Command::Ureg,
            format!("{} has not registered yet", conn.addr),
        ));
        bail!("{} is not registered", conn.addr);
    }
    if state.debug {
        debug!(peer = %conn.addr, task.id = %req.pid, bucket = %req.group, "accepting forwarded task");
    }

    let payload: Value = match serde_json::from_str(&req.data) {
        Ok(payload) => payload,
        Err(e) => {
            conn.push_ret(Ret::err(Command::Task, e.to_string()));
            return Err(e.into());
        }
    };

    let Some(bucket) = state.bucket(&req.group) else {
        let msg = format!("bucket {} is not configured", req.group);
        conn.push_ret(Ret::err(Command::Task, &msg));
        bail!(msg);
    };

    match bucket.fill(TaskKind::Immediate, &req.pid, payload) {
        Ok(()) => {
            conn.push_ret(Ret::data(Command::Task, "success"));
            Ok(())
        }
        Err(e) => {
            conn.push_ret(Ret::err(Command::Task, e.to_string()));
            Err(e.into())
        }
    }
}

/// Route one inbound reply on a peer client connection.
pub(crate) fn resolve_ret(peer: &PeerClient, ret: &Ret) -> anyhow::Result<()> {
    match Command::parse(&ret.cmd)? {
        Command::Pong => {
            pong(peer, ret);
            Ok(())
        }
        Command::Task => {
            if peer.debug {
                debug!(peer = %peer.addr, data = %ret.data, err = %ret.err, "task reply");
            }
            Ok(())
        }
        Command::Reg => {
            if peer.debug {
                debug!(peer = %peer.addr, data = %ret.data, "registration acknowledged");
            }
            peer.mark_up();
            Ok(())
        }
        Command::Regd => {
            // The server still holds our previous registration; that
            // counts as registered.
            if peer.debug {
                debug!(peer = %peer.addr, "already registered");
            }
            peer.mark_up();
            Ok(())
        }
        other => bail!("unresolved command: {other}"),
    }
}

/// Replace the peer's cached occupancy. Parse failures are logged and
/// swallowed; the previous report stays in effect.
fn pong(peer: &PeerClient, ret: &Ret) {
    match serde_json::from_str::<Vec<TaskInfo>>(&ret.data) {
        Ok(infos) => {
            if peer.debug {
                debug!(peer = %peer.addr, buckets = infos.len(), "occupancy report");
            }
            peer.update_info(infos);
        }
        Err(e) => {
            debug!(peer = %peer.addr, error = %e, "ignoring malformed occupancy report");
        }
    }
}
