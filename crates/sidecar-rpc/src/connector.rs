//! Byte-stream endpoints the client can (re)connect to.

use std::io;
#[cfg(unix)]
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Opens a fresh duplex stream to the worker.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> io::Result<(BoxedReader, BoxedWriter)>;

    /// Human-readable endpoint, used in errors and logs.
    fn endpoint(&self) -> String;
}

#[cfg(unix)]
#[derive(Debug, Clone)]
pub struct UnixSocketConnector {
    path: PathBuf,
}

#[cfg(unix)]
impl UnixSocketConnector {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[cfg(unix)]
#[async_trait]
impl Connector for UnixSocketConnector {
    async fn connect(&self) -> io::Result<(BoxedReader, BoxedWriter)> {
        let stream = tokio::net::UnixStream::connect(&self.path).await?;
        let (reader, writer) = stream.into_split();
        Ok((Box::new(reader), Box::new(writer)))
    }

    fn endpoint(&self) -> String {
        self.path.display().to_string()
    }
}

#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> io::Result<(BoxedReader, BoxedWriter)> {
        let stream = tokio::net::TcpStream::connect(&self.addr).await?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        Ok((Box::new(reader), Box::new(writer)))
    }

    fn endpoint(&self) -> String {
        self.addr.clone()
    }
}
