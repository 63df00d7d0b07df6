//! bucketproto - Wire protocol types for the bucketry peer control plane
//!
//! Peers exchange newline-delimited JSON over a plain TCP stream: one message
//! per line, terminated by a single `\n`. The framing is symmetric but the
//! record types are directional - a server receives [`Req`] and sends [`Ret`],
//! a client the reverse.
//!
//! ## Wire Format
//!
//! ```text
//! {"cmd":"REG","pid":"","group":"","data":""}\n
//! {"cmd":"PONG","data":"[{\"key\":\"mail\",\"len\":2}]"}\n
//! ```
//!
//! Commands are short literal strings (see [`Command`]). `Req.data` and
//! `Ret.data` carry JSON-encoded payloads as strings so that routing never
//! requires decoding the inner payload.

use serde::{Deserialize, Serialize};

/// Register with a peer server.
pub const REG: &str = "REG";
/// Occupancy probe; answered with [`PONG`].
pub const PING: &str = "PING";
/// Forward a task for remote execution.
pub const TASK: &str = "TASK";
/// Occupancy report answering a [`PING`].
pub const PONG: &str = "PONG";
/// Reserved for external tooling; the core never emits it.
pub const KILL: &str = "KILL";
/// Reply to any command sent before registration.
pub const UREG: &str = "UREG";
/// Reply to a duplicate registration attempt.
pub const REGD: &str = "REGD";

/// Commands understood by the control plane.
///
/// The wire carries the literal strings; this enum exists so that handlers
/// dispatch on a tag instead of comparing strings everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Reg,
    Ping,
    Task,
    Pong,
    Kill,
    Ureg,
    Regd,
}

impl Command {
    /// Parse a wire string into a Command
    pub fn parse(s: &str) -> Result<Self, ProtoError> {
        match s {
            REG => Ok(Command::Reg),
            PING => Ok(Command::Ping),
            TASK => Ok(Command::Task),
            PONG => Ok(Command::Pong),
            KILL => Ok(Command::Kill),
            UREG => Ok(Command::Ureg),
            REGD => Ok(Command::Regd),
            other => Err(ProtoError::UnresolvedCommand(other.to_string())),
        }
    }

    /// The literal string sent on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Reg => REG,
            Command::Ping => PING,
            Command::Task => TASK,
            Command::Pong => PONG,
            Command::Kill => KILL,
            Command::Ureg => UREG,
            Command::Regd => REGD,
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A request, sent client-to-server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Req {
    pub cmd: String,
    #[serde(default)]
    pub pid: String,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub data: String,
}

impl Req {
    /// A bare command request (REG, PING).
    pub fn command(cmd: Command) -> Self {
        Self {
            cmd: cmd.as_str().to_string(),
            ..Default::default()
        }
    }

    /// A TASK forward: `data` must already be JSON-encoded.
    pub fn task(group: impl Into<String>, pid: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            cmd: TASK.to_string(),
            pid: pid.into(),
            group: group.into(),
            data: data.into(),
        }
    }
}

/// A return, sent server-to-client. A non-empty `err` signals a
/// protocol-level failure for the matching command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ret {
    pub cmd: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub data: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub err: String,
}

impl Ret {
    /// A successful return carrying data.
    pub fn data(cmd: Command, data: impl Into<String>) -> Self {
        Self {
            cmd: cmd.as_str().to_string(),
            data: data.into(),
            err: String::new(),
        }
    }

    /// A failure return.
    pub fn err(cmd: Command, err: impl Into<String>) -> Self {
        Self {
            cmd: cmd.as_str().to_string(),
            data: String::new(),
            err: err.into(),
        }
    }

    /// Whether this return signals a failure.
    pub fn is_err(&self) -> bool {
        !self.err.is_empty()
    }
}

/// Per-bucket occupancy, reported in PONG data as a JSON array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub key: String,
    pub len: usize,
}

/// Serialize a message to its wire line (without the `\n` terminator;
/// the line codec appends it).
pub fn to_line<T: Serialize>(msg: &T) -> Result<String, ProtoError> {
    Ok(serde_json::to_string(msg)?)
}

/// Parse one received line into a message, tolerating a trailing terminator.
pub fn from_line<T: serde::de::DeserializeOwned>(line: &str) -> Result<T, ProtoError> {
    Ok(serde_json::from_str(line.trim_end_matches(['\r', '\n']))?)
}

/// Errors during wire encode/decode
#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error("unresolved command: {0}")]
    UnresolvedCommand(String),
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn command_roundtrip() {
        for cmd in [
            Command::Reg,
            Command::Ping,
            Command::Task,
            Command::Pong,
            Command::Kill,
            Command::Ureg,
            Command::Regd,
        ] {
            assert_eq!(Command::parse(cmd.as_str()).unwrap(), cmd);
        }
        assert!(matches!(
            Command::parse("NOPE"),
            Err(ProtoError::UnresolvedCommand(_))
        ));
    }

    #[test]
    fn req_line_roundtrip() {
        let req = Req::task("mail", "job-42", r#"{"v":1}"#);
        let line = to_line(&req).unwrap();
        assert!(!line.contains('\n'));

        let parsed: Req = from_line(&line).unwrap();
        assert_eq!(parsed, req);
        assert_eq!(parsed.cmd, TASK);
        assert_eq!(parsed.group, "mail");
    }

    #[test]
    fn req_missing_fields_default_empty() {
        let parsed: Req = from_line(r#"{"cmd":"PING"}"#).unwrap();
        assert_eq!(parsed.cmd, PING);
        assert_eq!(parsed.pid, "");
        assert_eq!(parsed.group, "");
        assert_eq!(parsed.data, "");
    }

    #[test]
    fn ret_omits_empty_fields() {
        let ret = Ret::data(Command::Task, "success");
        let line = to_line(&ret).unwrap();
        assert!(!line.contains("err"));

        let ret = Ret::err(Command::Ureg, "10.0.0.1:9000 has not registered yet");
        let line = to_line(&ret).unwrap();
        assert!(!line.contains("data"));
        assert!(from_line::<Ret>(&line).unwrap().is_err());
    }

    #[test]
    fn from_line_tolerates_terminator() {
        let parsed: Ret = from_line("{\"cmd\":\"PONG\",\"data\":\"[]\"}\r\n").unwrap();
        assert_eq!(parsed.cmd, PONG);
        assert!(!parsed.is_err());
    }

    #[test]
    fn task_info_report_roundtrip() {
        let infos = vec![
            TaskInfo {
                key: "mail".to_string(),
                len: 3,
            },
            TaskInfo {
                key: "billing".to_string(),
                len: 0,
            },
        ];
        let encoded = serde_json::to_string(&infos).unwrap();
        assert!(encoded.contains(r#""key":"mail""#));

        let decoded: Vec<TaskInfo> = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, infos);
    }
}
