pub mod connection;
pub mod envelope;
pub mod error;
pub mod process;
pub mod proxy;
pub mod reassembler;
pub mod registry;
pub mod transport;

pub use connection::{listener_fn, Connection, ConnectionOptions, Listener, PendingCall, Role};
pub use envelope::{encode, Envelope, Frame, ENVELOPE_LEN};
pub use error::{Result, RpcError};
pub use process::{execute, serve_stream, serve_transport, spawn, ExecOutput};
pub use proxy::Proxy;
pub use registry::{validate_path, ConnectionRegistry};
pub use transport::{PipeTransport, SocketTransport, StdioTransport, Transport};
