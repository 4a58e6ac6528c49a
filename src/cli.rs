use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use crate::rpc::ConnectionOptions;

#[derive(Debug, Clone)]
pub struct Config {
    pub command: Command,
    pub options: ConnectionOptions,
}

#[derive(Parser, Debug)]
#[command(name = "pipe_rpc")]
#[command(about = "Multiplexed calls over Unix sockets and child process pipes", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
    /// Fail calls that get no response within this many milliseconds.
    #[arg(long, global = true)]
    timeout_ms: Option<u64>,
    /// Largest frame (envelope included) accepted from the peer.
    #[arg(long, global = true, default_value_t = u32::MAX)]
    max_frame_len: u32,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Connect to a Unix socket and send each payload as a call.
    Call {
        #[arg(long)]
        socket: PathBuf,
        #[arg(required = true)]
        payloads: Vec<String>,
    },
    /// Spawn a program and call it over its stdin/stdout.
    Spawn {
        executable: PathBuf,
        #[arg(long)]
        payload: Vec<String>,
        #[arg(last = true)]
        args: Vec<String>,
    },
    /// Run a program to completion and report its output.
    Exec {
        executable: PathBuf,
        #[arg(long)]
        json: bool,
        #[arg(last = true)]
        args: Vec<String>,
    },
    /// Answer calls on a Unix socket by echoing the payload back.
    Serve {
        #[arg(long)]
        socket: PathBuf,
    },
    /// Answer calls on stdin/stdout by echoing the payload back.
    EchoStdio,
}

impl Cli {
    pub fn from_args() -> Self {
        Self::parse()
    }

    pub fn into_config(self) -> Config {
        Config {
            command: self.command,
            options: ConnectionOptions {
                call_timeout: self.timeout_ms.map(Duration::from_millis),
                max_frame_len: self.max_frame_len,
                ..Default::default()
            },
        }
    }
}
