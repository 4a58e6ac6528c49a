//! Byte-stream transports a [`Connection`](crate::rpc::Connection) runs over.
//!
//! A transport is split once into a read half, drained by the connection's
//! reader task, and a write half that the connection drives exclusively.
use async_trait::async_trait;
use bytes::BytesMut;
use std::io;
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::process::{Child, ChildStdin, ChildStdout};

const READ_CHUNK: usize = 8 * 1024;

#[async_trait]
pub trait TransportReader: Send {
    /// Next chunk of bytes in whatever size the stream delivers them.
    /// `None` means the peer closed its side.
    async fn read_chunk(&mut self) -> io::Result<Option<BytesMut>>;
}

#[async_trait]
pub trait TransportWriter: Send {
    async fn write(&mut self, bytes: &[u8]) -> io::Result<()>;
    async fn flush(&mut self) -> io::Result<()>;
    /// Tears the transport down. Called at most once.
    async fn close(&mut self) -> io::Result<()>;
}

pub trait Transport: Send {
    fn describe(&self) -> String;
    fn split(self: Box<Self>) -> (Box<dyn TransportReader>, Box<dyn TransportWriter>);
}

/// Reads from any `AsyncRead`.
pub struct StreamReader<R> {
    inner: R,
    buf: BytesMut,
}

impl<R> StreamReader<R> {
    pub fn new(inner: R) -> Self {
        StreamReader {
            inner,
            buf: BytesMut::with_capacity(READ_CHUNK),
        }
    }
}

#[async_trait]
impl<R> TransportReader for StreamReader<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn read_chunk(&mut self) -> io::Result<Option<BytesMut>> {
        self.buf.reserve(READ_CHUNK);
        let n = self.inner.read_buf(&mut self.buf).await?;
        if n == 0 {
            return Ok(None);
        }
        // Hands the filled bytes off without copying; spare capacity stays
        // behind for the next read.
        Ok(Some(self.buf.split()))
    }
}

/// Writes to any `AsyncWrite`; closing shuts the write side down.
pub struct StreamWriter<W> {
    inner: W,
}

impl<W> StreamWriter<W> {
    pub fn new(inner: W) -> Self {
        StreamWriter { inner }
    }
}

#[async_trait]
impl<W> TransportWriter for StreamWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.inner.write_all(bytes).await
    }

    async fn flush(&mut self) -> io::Result<()> {
        self.inner.flush().await
    }

    async fn close(&mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }
}

/// Unix domain socket transport.
pub struct SocketTransport {
    stream: UnixStream,
    label: String,
}

impl SocketTransport {
    pub async fn connect(path: &Path) -> io::Result<Self> {
        let stream = UnixStream::connect(path).await?;
        Ok(SocketTransport {
            stream,
            label: format!("unix:{}", path.display()),
        })
    }

    /// Wraps a stream accepted from a `UnixListener`.
    pub fn from_stream(stream: UnixStream, label: impl Into<String>) -> Self {
        SocketTransport {
            stream,
            label: label.into(),
        }
    }
}

impl Transport for SocketTransport {
    fn describe(&self) -> String {
        self.label.clone()
    }

    fn split(self: Box<Self>) -> (Box<dyn TransportReader>, Box<dyn TransportWriter>) {
        let (read, write): (OwnedReadHalf, OwnedWriteHalf) = self.stream.into_split();
        (
            Box::new(StreamReader::new(read)),
            Box::new(StreamWriter::new(write)),
        )
    }
}

/// Transport over a spawned child's stdin/stdout. Closing it also kills the
/// child.
pub struct StdioTransport {
    writer: ChildStdin,
    reader: ChildStdout,
    child: Child,
    label: String,
}

impl StdioTransport {
    pub fn new(child: Child, writer: ChildStdin, reader: ChildStdout, label: String) -> Self {
        StdioTransport {
            writer,
            reader,
            child,
            label,
        }
    }
}

impl Transport for StdioTransport {
    fn describe(&self) -> String {
        self.label.clone()
    }

    fn split(self: Box<Self>) -> (Box<dyn TransportReader>, Box<dyn TransportWriter>) {
        let StdioTransport {
            writer,
            reader,
            child,
            ..
        } = *self;
        (
            Box::new(StreamReader::new(reader)),
            Box::new(ChildWriter {
                stdin: StreamWriter::new(writer),
                child,
            }),
        )
    }
}

struct ChildWriter {
    stdin: StreamWriter<ChildStdin>,
    child: Child,
}

#[async_trait]
impl TransportWriter for ChildWriter {
    async fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stdin.write(bytes).await
    }

    async fn flush(&mut self) -> io::Result<()> {
        self.stdin.flush().await
    }

    async fn close(&mut self) -> io::Result<()> {
        // The child may already be gone; closing stdin can then fail with a
        // broken pipe, which is not worth reporting.
        let _ = self.stdin.close().await;
        if self.child.try_wait()?.is_none() {
            self.child.kill().await?;
        }
        Ok(())
    }
}

/// Transport over an arbitrary reader/writer pair, e.g. this process's own
/// stdin/stdout or an in-memory duplex.
pub struct PipeTransport<R, W> {
    reader: R,
    writer: W,
    label: String,
}

impl<R, W> PipeTransport<R, W> {
    pub fn new(reader: R, writer: W, label: impl Into<String>) -> Self {
        PipeTransport {
            reader,
            writer,
            label: label.into(),
        }
    }
}

impl<R, W> Transport for PipeTransport<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    fn describe(&self) -> String {
        self.label.clone()
    }

    fn split(self: Box<Self>) -> (Box<dyn TransportReader>, Box<dyn TransportWriter>) {
        (
            Box::new(StreamReader::new(self.reader)),
            Box::new(StreamWriter::new(self.writer)),
        )
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{duplex, DuplexStream};

    /// In-memory transport that counts how often it was closed.
    pub(crate) struct InMemoryTransport {
        stream: DuplexStream,
        pub(crate) closes: Arc<AtomicUsize>,
    }

    impl InMemoryTransport {
        /// Returns the transport and the raw peer end of the pipe.
        pub(crate) fn pair() -> (Self, DuplexStream) {
            let (a, b) = duplex(64 * 1024);
            (
                InMemoryTransport {
                    stream: a,
                    closes: Arc::new(AtomicUsize::new(0)),
                },
                b,
            )
        }
    }

    struct CountingWriter {
        inner: StreamWriter<tokio::io::WriteHalf<DuplexStream>>,
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl TransportWriter for CountingWriter {
        async fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
            self.inner.write(bytes).await
        }

        async fn flush(&mut self) -> io::Result<()> {
            self.inner.flush().await
        }

        async fn close(&mut self) -> io::Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            self.inner.close().await
        }
    }

    impl Transport for InMemoryTransport {
        fn describe(&self) -> String {
            "memory".to_string()
        }

        fn split(self: Box<Self>) -> (Box<dyn TransportReader>, Box<dyn TransportWriter>) {
            let (read, write) = tokio::io::split(self.stream);
            (
                Box::new(StreamReader::new(read)),
                Box::new(CountingWriter {
                    inner: StreamWriter::new(write),
                    closes: self.closes,
                }),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn stream_reader_returns_none_at_eof() {
        let (a, mut b) = duplex(64);
        let mut reader = StreamReader::new(a);

        b.write_all(b"hello").await.unwrap();
        drop(b);

        let chunk = reader.read_chunk().await.expect("read failed");
        assert_eq!(chunk.as_deref(), Some(&b"hello"[..]));
        assert!(reader.read_chunk().await.expect("read failed").is_none());
    }

    #[tokio::test]
    async fn pipe_transport_round_trips_bytes() {
        let (a, b) = duplex(64);
        let (peer_read, mut peer_write) = tokio::io::split(b);
        let (read, write) = tokio::io::split(a);
        let transport: Box<dyn Transport> = Box::new(PipeTransport::new(read, write, "pipe"));
        assert_eq!(transport.describe(), "pipe");

        let (mut reader, mut writer) = transport.split();
        writer.write(b"out").await.unwrap();
        writer.flush().await.unwrap();

        let mut peer_reader = StreamReader::new(peer_read);
        let got = peer_reader.read_chunk().await.unwrap().unwrap();
        assert_eq!(&got[..], b"out");

        peer_write.write_all(b"in").await.unwrap();
        let got = reader.read_chunk().await.unwrap().unwrap();
        assert_eq!(&got[..], b"in");

        writer.close().await.unwrap();
        assert!(peer_reader.read_chunk().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn chunks_do_not_alias_each_other() {
        let (a, mut b) = duplex(64);
        let mut reader = StreamReader::new(a);

        b.write_all(b"first").await.unwrap();
        let first = reader.read_chunk().await.unwrap().unwrap();
        b.write_all(b"second").await.unwrap();
        let second = reader.read_chunk().await.unwrap().unwrap();

        assert_eq!(&first[..], b"first");
        assert_eq!(&second[..], b"second");
    }

    #[tokio::test]
    async fn socket_transport_wraps_an_accepted_stream() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.sock");
        let listener = tokio::net::UnixListener::bind(&path).unwrap();

        let client: Box<dyn Transport> = Box::new(SocketTransport::connect(&path).await.unwrap());
        let (accepted, _) = listener.accept().await.unwrap();
        let server: Box<dyn Transport> =
            Box::new(SocketTransport::from_stream(accepted, "accepted"));
        assert_eq!(server.describe(), "accepted");

        let (mut server_reader, _server_writer) = server.split();
        let (_client_reader, mut client_writer) = client.split();
        client_writer.write(b"hi").await.unwrap();
        client_writer.flush().await.unwrap();
        let got = server_reader.read_chunk().await.unwrap().unwrap();
        assert_eq!(&got[..], b"hi");
    }
}
