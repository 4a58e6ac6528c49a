use std::path::Path;
use std::time::Duration;

use pipe_rpc::rpc::{execute, spawn, ConnectionOptions, RpcError};

const BIN: &str = env!("CARGO_BIN_EXE_pipe_rpc");

fn options() -> ConnectionOptions {
    ConnectionOptions {
        call_timeout: Some(Duration::from_secs(10)),
        ..Default::default()
    }
}

#[tokio::test]
async fn spawned_child_answers_calls() {
    let proxy = spawn(BIN, None, ["echo-stdio"], options())
        .await
        .expect("spawn");

    let (a, b, c) = tokio::join!(proxy.call(b"alpha"), proxy.call(b""), proxy.call(b"gamma"));
    assert_eq!(&a.unwrap()[..], b"alpha");
    assert!(b.unwrap().is_empty());
    assert_eq!(&c.unwrap()[..], b"gamma");

    let connection = proxy.connection().clone();
    proxy.close().await;
    assert!(connection.is_closed());
}

#[tokio::test]
async fn large_payload_survives_chunking() {
    let proxy = spawn(BIN, None, ["echo-stdio"], options())
        .await
        .expect("spawn");

    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    let reply = proxy.call(&payload).await.unwrap();
    assert_eq!(&reply[..], &payload[..]);
    proxy.close().await;
}

#[tokio::test]
async fn spawn_rejects_relative_path() {
    let res = spawn("pipe_rpc", None, Vec::<String>::new(), options()).await;
    assert!(matches!(res, Err(RpcError::InvalidPath { .. })));
}

#[tokio::test]
async fn execute_captures_status_and_output() {
    let sh = Path::new("/bin/sh");
    let output = execute(sh, ["-c", "printf out; printf err >&2; exit 3"])
        .await
        .unwrap();
    assert_eq!(output.status, 3);
    assert_eq!(output.stdout, "out");
    assert_eq!(output.stderr, "err");
}

#[tokio::test]
async fn execute_rejects_missing_program() {
    let res = execute("/definitely/not/here", ["x"]).await;
    assert!(matches!(res, Err(RpcError::InvalidPath { .. })));
}
