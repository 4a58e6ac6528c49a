//! Address-keyed cache of open connections.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::rpc::connection::{Connection, ConnectionOptions, Listener};
use crate::rpc::error::{Result, RpcError};
use crate::rpc::proxy::Proxy;
use crate::rpc::transport::SocketTransport;

type ConnectionMap = Arc<Mutex<HashMap<PathBuf, Connection>>>;
type Gate = Arc<tokio::sync::Mutex<()>>;

/// Repeat connects to an address already open reuse its connection. Each
/// registry is independent; create one per process (or per test) and pass
/// it to the call sites that need it.
pub struct ConnectionRegistry {
    connections: ConnectionMap,
    // One gate per address being connected, held across the socket connect
    // so concurrent connects to that address open a single transport.
    connecting: Mutex<HashMap<PathBuf, Gate>>,
    options: ConnectionOptions,
}

impl ConnectionRegistry {
    pub fn new(options: ConnectionOptions) -> Self {
        ConnectionRegistry {
            connections: Arc::new(Mutex::new(HashMap::new())),
            connecting: Mutex::new(HashMap::new()),
            options,
        }
    }

    /// Returns a proxy over the connection to the Unix socket at `address`,
    /// opening it if needed.
    ///
    /// `on_disconnect` and `listener` only take effect when a new connection
    /// is opened; a reused connection keeps the ones it was created with.
    pub async fn connect(
        &self,
        address: impl AsRef<Path>,
        on_disconnect: Option<Box<dyn FnOnce() + Send>>,
        listener: Option<Arc<dyn Listener>>,
    ) -> Result<Proxy> {
        let address = validate_path(address.as_ref())?;

        let gate = self.gate(&address);
        let result = {
            let _guard = gate.lock().await;
            self.connect_locked(address.clone(), on_disconnect, listener).await
        };

        let mut gates = self.connecting.lock();
        // Only the map and this call still hold the gate: nobody is waiting.
        if Arc::strong_count(&gate) == 2 {
            gates.remove(&address);
        }
        result
    }

    fn gate(&self, address: &Path) -> Gate {
        let mut gates = self.connecting.lock();
        Arc::clone(gates.entry(address.to_path_buf()).or_default())
    }

    async fn connect_locked(
        &self,
        address: PathBuf,
        on_disconnect: Option<Box<dyn FnOnce() + Send>>,
        listener: Option<Arc<dyn Listener>>,
    ) -> Result<Proxy> {
        if let Some(proxy) = self.reuse(&address) {
            debug!(address = %address.display(), "reusing connection");
            return Ok(proxy);
        }

        let transport = SocketTransport::connect(&address).await?;
        let connection = Connection::open(Box::new(transport), listener, self.options.clone());
        info!(address = %address.display(), "connected");

        self.connections
            .lock()
            .insert(address.clone(), connection.clone());

        let connections = Arc::clone(&self.connections);
        let registered = connection.id();
        connection.on_close(move || {
            let mut map = connections.lock();
            if matches!(map.get(&address), Some(current) if current.id() == registered) {
                map.remove(&address);
            }
            drop(map);
            if let Some(on_disconnect) = on_disconnect {
                on_disconnect();
            }
        });

        Ok(connection.create_proxy())
    }

    /// Open connection for `address`, if any.
    pub fn get(&self, address: impl AsRef<Path>) -> Option<Connection> {
        self.connections.lock().get(address.as_ref()).cloned()
    }

    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn reuse(&self, address: &Path) -> Option<Proxy> {
        let map = self.connections.lock();
        map.get(address)
            .and_then(|connection| connection.try_create_proxy())
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        ConnectionRegistry::new(ConnectionOptions::default())
    }
}

/// Checks that `path` is absolute and exists. Runs before any I/O is
/// attempted.
pub fn validate_path(path: &Path) -> Result<PathBuf> {
    if !path.is_absolute() {
        return Err(RpcError::InvalidPath {
            path: path.to_path_buf(),
            reason: "not an absolute path",
        });
    }
    if !path.exists() {
        return Err(RpcError::InvalidPath {
            path: path.to_path_buf(),
            reason: "no such file",
        });
    }
    Ok(path.to_path_buf())
}
