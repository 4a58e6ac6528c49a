use anyhow::Context;
use std::path::Path;
use std::sync::Arc;
use tokio::net::UnixListener;
use tracing::{debug, info};

use crate::cli::{Command, Config};
use crate::rpc::{
    self, listener_fn, ConnectionOptions, ConnectionRegistry, Frame, Listener, Proxy,
    SocketTransport,
};

pub async fn run(config: Config) -> anyhow::Result<()> {
    match config.command {
        Command::Call { socket, payloads } => {
            let registry = ConnectionRegistry::new(config.options);
            let proxy = registry
                .connect(&socket, None, None)
                .await
                .with_context(|| format!("connecting to {}", socket.display()))?;
            call_all(&proxy, &payloads).await
        }
        Command::Spawn {
            executable,
            payload,
            args,
        } => {
            let proxy = rpc::spawn(&executable, None, &args, config.options)
                .await
                .with_context(|| format!("spawning {}", executable.display()))?;
            call_all(&proxy, &payload).await
        }
        Command::Exec {
            executable,
            json,
            args,
        } => {
            let output = rpc::execute(&executable, &args)
                .await
                .with_context(|| format!("running {}", executable.display()))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&output)?);
            } else {
                print!("{}", output.stdout);
                eprint!("{}", output.stderr);
                println!("exit status: {}", output.status);
            }
            Ok(())
        }
        Command::Serve { socket } => serve_socket(&socket, config.options).await,
        Command::EchoStdio => {
            rpc::serve_stream(
                tokio::io::stdin(),
                tokio::io::stdout(),
                "stdio",
                echo_listener(),
                config.options,
            )
            .await;
            Ok(())
        }
    }
}

async fn call_all(proxy: &Proxy, payloads: &[String]) -> anyhow::Result<()> {
    // Issue every call before awaiting any so they are in flight together.
    let mut calls = Vec::with_capacity(payloads.len());
    for payload in payloads {
        calls.push(proxy.begin_call(payload.as_bytes()).await?);
    }
    for (payload, call) in payloads.iter().zip(calls) {
        let reply = call
            .response()
            .await
            .with_context(|| format!("call {:?}", payload))?;
        println!("{}", String::from_utf8_lossy(&reply));
    }
    proxy.close().await;
    Ok(())
}

async fn serve_socket(socket: &Path, options: ConnectionOptions) -> anyhow::Result<()> {
    let listener = UnixListener::bind(socket)
        .with_context(|| format!("binding {}", socket.display()))?;
    info!(socket = %socket.display(), "serving");

    loop {
        let (stream, _) = listener.accept().await?;
        let label = format!("unix:{} (accepted)", socket.display());
        let options = options.clone();
        tokio::spawn(async move {
            let transport = SocketTransport::from_stream(stream, label);
            let connection =
                rpc::serve_transport(Box::new(transport), echo_listener(), options).await;
            info!(connection = %connection.label(), "peer disconnected");
        });
    }
}

/// Replies to every peer call with its own payload.
pub fn echo_listener() -> Arc<dyn Listener> {
    listener_fn(|frame: Frame| async move {
        debug!(call_id = frame.call_id, len = frame.payload.len(), "echoing");
        Ok(Some(frame.payload.to_vec()))
    })
}
