//! Control-plane behavior over real loopback TCP: registration, occupancy
//! reporting, task acceptance, and cross-node overflow forwarding.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bucketproto::{Command, Req, Ret, TaskInfo};
use bucketry::{Bucket, BucketConfig, Executor, Group, GroupError};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::time::sleep;
use tokio_util::codec::{Framed, LinesCodec};

static PORT: AtomicU16 = AtomicU16::new(14770);

fn next_port() -> String {
    PORT.fetch_add(1, Ordering::SeqCst).to_string()
}

/// Executor whose body runs long enough to keep its bucket occupied, while
/// recording every (id, payload) it was asked to execute.
struct MeshRecorder {
    seen: Mutex<Vec<(String, Value)>>,
}

impl MeshRecorder {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            seen: Mutex::new(Vec::new()),
        })
    }

    fn seen(&self) -> Vec<(String, Value)> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Executor for MeshRecorder {
    async fn on_execute(&self, id: &str, payload: &Value) -> anyhow::Result<()> {
        self.seen
            .lock()
            .unwrap()
            .push((id.to_string(), payload.clone()));
        sleep(Duration::from_secs(10)).await;
        Ok(())
    }
}

fn node(
    bucket_name: &str,
    max_bucket: usize,
    recorder: &Arc<MeshRecorder>,
    port: &str,
    peers: Vec<String>,
) -> Arc<Group> {
    let config = BucketConfig {
        life_span: Duration::from_secs(5),
        max_bucket,
        ..Default::default()
    };
    let mut buckets = HashMap::new();
    buckets.insert(
        bucket_name.to_string(),
        Bucket::new(bucket_name, config, Arc::clone(recorder) as Arc<dyn Executor>),
    );
    Arc::new(Group::new(buckets, peers, port.to_string(), true))
}

fn spawn_node(group: &Arc<Group>) {
    let group = Arc::clone(group);
    tokio::spawn(async move {
        let _ = group.start_work().await;
    });
}

async fn connect(port: &str) -> Framed<TcpStream, LinesCodec> {
    // Give the freshly spawned server a moment to bind.
    for _ in 0..50 {
        if let Ok(stream) = TcpStream::connect(format!("127.0.0.1:{port}")).await {
            return Framed::new(stream, LinesCodec::new());
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("server on port {port} never came up");
}

async fn roundtrip(framed: &mut Framed<TcpStream, LinesCodec>, req: &Req) -> Ret {
    framed
        .send(bucketproto::to_line(req).unwrap())
        .await
        .expect("send");
    let line = framed
        .next()
        .await
        .expect("connection stayed open")
        .expect("read");
    bucketproto::from_line(&line).expect("parse ret")
}

#[tokio::test]
async fn registration_and_occupancy_roundtrip() {
    let port = next_port();
    let recorder = MeshRecorder::new();
    // The peer entry only feeds the allow-list here; nothing listens on it.
    let group = node("mail", 4, &recorder, &port, vec!["127.0.0.1:9".to_string()]);
    spawn_node(&group);

    let mut framed = connect(&port).await;

    // Commands before registration are refused.
    let ret = roundtrip(&mut framed, &Req::command(Command::Ping)).await;
    assert_eq!(ret.cmd, bucketproto::UREG);
    assert!(ret.is_err());

    // First registration is acknowledged with a timestamp.
    let ret = roundtrip(&mut framed, &Req::command(Command::Reg)).await;
    assert_eq!(ret.cmd, bucketproto::REG);
    assert!(ret.data.contains("registered at"), "got: {}", ret.data);

    // Re-registering the same connection is a duplicate.
    let ret = roundtrip(&mut framed, &Req::command(Command::Reg)).await;
    assert_eq!(ret.cmd, bucketproto::REGD);
    assert!(ret.err.contains("already established"));

    // A registered peer gets the occupancy report.
    let ret = roundtrip(&mut framed, &Req::command(Command::Ping)).await;
    assert_eq!(ret.cmd, bucketproto::PONG);
    let infos: Vec<TaskInfo> = serde_json::from_str(&ret.data).unwrap();
    assert_eq!(infos.len(), 1);
    assert_eq!(infos[0].key, "mail");
    assert_eq!(infos[0].len, 0);

    group.stop_work();
}

#[tokio::test]
async fn forwarded_task_lands_in_bucket() {
    let port = next_port();
    let recorder = MeshRecorder::new();
    let group = node("mail", 4, &recorder, &port, vec!["127.0.0.1:9".to_string()]);
    spawn_node(&group);

    let mut framed = connect(&port).await;
    roundtrip(&mut framed, &Req::command(Command::Reg)).await;

    let payload = json!({"v": 1});
    let req = Req::task("mail", "m-1", serde_json::to_string(&payload).unwrap());
    let ret = roundtrip(&mut framed, &req).await;
    assert_eq!(ret.cmd, bucketproto::TASK);
    assert_eq!(ret.data, "success");
    assert!(!ret.is_err());

    assert_eq!(group.get_bucket("mail").unwrap().len(), 1);

    // The body starts asynchronously after the reply is queued.
    let mut executed = false;
    for _ in 0..50 {
        if recorder.seen() == vec![("m-1".to_string(), payload.clone())] {
            executed = true;
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }
    assert!(executed, "task body never started: {:?}", recorder.seen());

    // Unknown buckets are refused with a wire error.
    let req = Req::task("ghost", "m-2", "{}".to_string());
    let ret = roundtrip(&mut framed, &req).await;
    assert_eq!(ret.cmd, bucketproto::TASK);
    assert!(ret.err.contains("not configured"), "got: {}", ret.err);

    group.stop_work();
}

#[tokio::test]
async fn overflow_forwards_to_lightest_peer() {
    let port_a = next_port();
    let port_b = next_port();
    let addr_a = format!("127.0.0.1:{port_a}");
    let addr_b = format!("127.0.0.1:{port_b}");

    let recorder_a = MeshRecorder::new();
    let recorder_b = MeshRecorder::new();
    let node_a = node("work", 1, &recorder_a, &port_a, vec![addr_b.clone()]);
    let node_b = node("work", 4, &recorder_b, &port_b, vec![addr_a.clone()]);
    spawn_node(&node_a);
    spawn_node(&node_b);

    // Saturate A's bucket locally.
    node_a
        .fill("work", "a1", json!({"slot": 1}))
        .expect("local fill");
    assert_eq!(node_a.get_bucket("work").unwrap().len(), 1);

    // The second fill overflows to B once discovery has registered and
    // pinged; retry while the mesh warms up.
    let payload = json!({"v": 1, "origin": "a"});
    let mut forwarded = false;
    for _ in 0..50 {
        match node_a.fill("work", "a2", payload.clone()) {
            Ok(()) => {
                forwarded = true;
                break;
            }
            Err(GroupError::NoPeerAvailable) | Err(GroupError::TaskNotInInfo) => {
                sleep(Duration::from_millis(100)).await;
            }
            Err(e) => panic!("unexpected fill error: {e}"),
        }
    }
    assert!(forwarded, "mesh never became ready");

    // B must be running the task with the same id and payload.
    let mut landed = false;
    for _ in 0..50 {
        if recorder_b
            .seen()
            .contains(&("a2".to_string(), payload.clone()))
        {
            landed = true;
            break;
        }
        sleep(Duration::from_millis(50)).await;
    }
    assert!(landed, "task never landed on the peer: {:?}", recorder_b.seen());
    assert_eq!(node_b.get_bucket("work").unwrap().len(), 1);

    // A never ran it locally.
    assert!(recorder_a
        .seen()
        .iter()
        .all(|(id, _)| id != "a2"));

    node_a.stop_work();
    node_b.stop_work();
}

#[tokio::test]
async fn fill_unknown_bucket_errors() {
    let recorder = MeshRecorder::new();
    let group = node("mail", 4, &recorder, &next_port(), Vec::new());
    let err = group.fill("ghost", "x", Value::Null).unwrap_err();
    assert!(matches!(err, GroupError::UnknownBucket(_)));
}
