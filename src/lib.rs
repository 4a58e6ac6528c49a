//! Correlated request/response calls and unsolicited peer calls multiplexed
//! over a single byte stream (Unix socket or child stdio).
//!
//! ```no_run
//! # async fn demo() -> pipe_rpc::rpc::Result<()> {
//! use pipe_rpc::rpc::ConnectionRegistry;
//!
//! let registry = ConnectionRegistry::default();
//! let proxy = registry.connect("/run/helper.sock", None, None).await?;
//! let reply = proxy.call(b"PING").await?;
//! proxy.close().await;
//! # let _ = reply;
//! # Ok(())
//! # }
//! ```

pub mod app;
pub mod cli;
pub mod rpc;
