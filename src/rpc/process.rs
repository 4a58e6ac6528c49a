//! Child-process transports and the serving side of a connection.

use std::ffi::OsStr;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Command;
use tracing::{debug, info};

use crate::rpc::connection::{Connection, ConnectionOptions, Listener, Role};
use crate::rpc::error::{Result, RpcError};
use crate::rpc::proxy::Proxy;
use crate::rpc::registry::validate_path;
use crate::rpc::transport::{PipeTransport, StdioTransport, Transport};

/// Result of running a program to completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecOutput {
    /// Exit code, or -1 if the process was killed by a signal.
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Launches `executable` and returns a proxy over a connection on its
/// stdin/stdout. The child's stderr is inherited. Closing the last proxy
/// kills the child.
pub async fn spawn<I, S>(
    executable: impl AsRef<Path>,
    listener: Option<Arc<dyn Listener>>,
    args: I,
    options: ConnectionOptions,
) -> Result<Proxy>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let executable = validate_path(executable.as_ref())?;

    let mut child = Command::new(&executable)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()?;

    let writer = child.stdin.take().ok_or(RpcError::MissingStdio("stdin"))?;
    let reader = child
        .stdout
        .take()
        .ok_or(RpcError::MissingStdio("stdout"))?;

    let label = match child.id() {
        Some(pid) => format!("{} (pid {})", executable.display(), pid),
        None => executable.display().to_string(),
    };
    info!(child = %label, "spawned");

    let transport = StdioTransport::new(child, writer, reader, label);
    let connection = Connection::open(Box::new(transport), listener, options);
    Ok(connection.create_proxy())
}

/// Runs `executable` to completion and captures its output. Not
/// multiplexed.
pub async fn execute<I, S>(executable: impl AsRef<Path>, args: I) -> Result<ExecOutput>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let executable = validate_path(executable.as_ref())?;
    let output = Command::new(&executable)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await?;

    debug!(program = %executable.display(), status = ?output.status, "program exited");
    Ok(ExecOutput {
        status: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Serves `listener` as the accepting side over an already-open stream,
/// such as an accepted socket or this process's own stdin/stdout. Resolves
/// when the peer hangs up.
pub async fn serve_stream<R, W>(
    reader: R,
    writer: W,
    label: impl Into<String>,
    listener: Arc<dyn Listener>,
    options: ConnectionOptions,
) -> Connection
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let transport = PipeTransport::new(reader, writer, label);
    serve_transport(Box::new(transport), listener, options).await
}

/// Serves `listener` as the accepting side over `transport` until the peer
/// hangs up.
pub async fn serve_transport(
    transport: Box<dyn Transport>,
    listener: Arc<dyn Listener>,
    mut options: ConnectionOptions,
) -> Connection {
    options.role = Role::Acceptor;
    let connection = Connection::open(transport, Some(listener), options);
    connection.closed().await;
    connection
}
