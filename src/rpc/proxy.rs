use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;

use crate::rpc::connection::{Connection, PendingCall};
use crate::rpc::error::{Result, RpcError};

/// One call site's share of a [`Connection`].
///
/// Proxies over the same connection are interchangeable. The transport stays
/// open until every proxy has been closed or dropped.
pub struct Proxy {
    connection: Connection,
    closed: AtomicBool,
}

impl Proxy {
    pub(crate) fn new(connection: Connection) -> Self {
        Proxy {
            connection,
            closed: AtomicBool::new(false),
        }
    }

    /// Sends `payload` and waits for the correlated response.
    pub async fn call(&self, payload: &[u8]) -> Result<Bytes> {
        self.begin_call(payload).await?.response().await
    }

    /// Sends `payload` and returns a handle to the outstanding call, whose
    /// ID can be passed to [`Proxy::cancel`].
    pub async fn begin_call(&self, payload: &[u8]) -> Result<PendingCall> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RpcError::ProxyClosed);
        }
        self.connection.begin_call(payload).await
    }

    pub fn cancel(&self, call_id: u32) -> bool {
        self.connection.cancel(call_id)
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Releases this proxy's share. If it was the last one, waits until the
    /// transport has been torn down. Closing twice is a no-op.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.connection.release() {
            self.connection.closed().await;
        }
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.connection.release();
        }
    }
}
