//! The `archipelago` binary: JSON lines in on stdin, JSON lines out on stdout.

#![cfg(unix)]

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::time::timeout;

fn spawn() -> Child {
    Command::new(env!("CARGO_BIN_EXE_archipelago"))
        .env("ARCHIPELAGO_JOIN_DISTANCE", "64")
        .env("ARCHIPELAGO_LEAVE_DISTANCE", "80")
        .env("ARCHIPELAGO_FLUSH_FREQUENCY", "0.05")
        .env("RUST_LOG", "warn")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .expect("binary starts")
}

async fn next_subject(lines: &mut tokio::io::Lines<BufReader<ChildStdout>>, subject: &str) -> serde_json::Value {
    loop {
        let line = lines.next_line().await.unwrap().expect("stdout closed");
        let json: serde_json::Value = serde_json::from_str(&line).unwrap();
        if json["subject"] == subject {
            return json["payload"].clone();
        }
    }
}

#[tokio::test]
async fn interrupt_stops_a_running_service() {
    let mut child = spawn();
    let mut stdin = child.stdin.take().unwrap();
    let mut lines = BufReader::new(child.stdout.take().unwrap()).lines();

    stdin
        .write_all(b"{\"type\":\"heartbeat\",\"peer_id\":\"a\",\"position\":{\"x\":0,\"y\":0,\"z\":0}}\n")
        .await
        .unwrap();
    stdin.flush().await.unwrap();

    let payload = timeout(Duration::from_secs(10), next_subject(&mut lines, "client-proto.a.island_changed"))
        .await
        .expect("island_changed in time");
    assert_eq!(payload["island_id"], "I1");

    // stdin stays open, so only the signal can end the loop.
    let pid = child.id().expect("still running").to_string();
    let killed = Command::new("kill").args(["-INT", &pid]).status().await.unwrap();
    assert!(killed.success());

    let status = timeout(Duration::from_secs(10), child.wait())
        .await
        .expect("exits after SIGINT")
        .unwrap();
    assert!(status.success(), "exit status {status:?}");
    drop(stdin);
}

#[tokio::test]
async fn closing_stdin_flushes_and_exits() {
    let mut child = spawn();
    let mut stdin = child.stdin.take().unwrap();
    let mut lines = BufReader::new(child.stdout.take().unwrap()).lines();

    stdin.write_all(b"not json\n").await.unwrap();
    stdin
        .write_all(b"{\"type\":\"heartbeat\",\"peer_id\":\"b\",\"position\":{\"x\":5,\"y\":0,\"z\":5}}\n")
        .await
        .unwrap();
    drop(stdin);

    let payload = timeout(Duration::from_secs(10), next_subject(&mut lines, "client-proto.b.island_changed"))
        .await
        .expect("island_changed in time");
    assert_eq!(payload["conn_str"], "p2p:I1:b");

    let status = timeout(Duration::from_secs(10), child.wait()).await.unwrap().unwrap();
    assert!(status.success());
}
