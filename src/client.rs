use std::{future::Future, io, time::Duration};

use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    time::timeout,
};

use crate::protocol::{
    self, CONNECT_TIMEOUT, Opcode, READ_TIMEOUT, SETTLE_DELAY, TCPGECKO_PORT, ZERO_BLOCK_MARKER,
};

// ─── Errors ─────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("not connected to a TCPGecko server")]
    NotConnected,
    #[error("client is already connected")]
    AlreadyConnected,
    #[error("connect timed out")]
    ConnectTimeout,
    #[error("connect failed: {0}")]
    ConnectFailed(#[source] io::Error),
    #[error("timed out waiting for the server")]
    TransactionTimeout,
    #[error("connection reset by the server")]
    ConnectionReset,
    #[error("server accepted fewer bytes than were sent")]
    ShortWrite,
    #[error("invalid address range: end {end:#010x} must be greater than start {start:#010x}")]
    InvalidRange { start: u32, end: u32 },
    #[error("transport error: {0}")]
    Io(#[source] io::Error),
}

impl ClientError {
    /// Transport hiccups that a polling caller should ride out. Everything
    /// else is a misuse of the client.
    pub fn is_transient(&self) -> bool {
        match self {
            ClientError::ConnectTimeout
            | ClientError::ConnectFailed(_)
            | ClientError::TransactionTimeout
            | ClientError::ConnectionReset
            | ClientError::ShortWrite
            | ClientError::Io(_) => true,
            ClientError::NotConnected
            | ClientError::AlreadyConnected
            | ClientError::InvalidRange { .. } => false,
        }
    }
}

impl From<io::Error> for ClientError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => ClientError::TransactionTimeout,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::NotConnected => ClientError::ConnectionReset,
            io::ErrorKind::WriteZero => ClientError::ShortWrite,
            _ => ClientError::Io(err),
        }
    }
}

// ─── Seam for the tracker ───────────────────────────────────────────────────

/// Anything that can service a memory-range read. [`GeckoClient`] is the real
/// implementation; tests script their own.
pub trait MemoryReader: Send + 'static {
    fn read_memory_range(
        &mut self,
        start: u32,
        end: u32,
    ) -> impl Future<Output = Result<Vec<u8>, ClientError>> + Send;
}

// ─── Client ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub port: u16,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub settle_delay: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            port: TCPGECKO_PORT,
            connect_timeout: CONNECT_TIMEOUT,
            read_timeout: READ_TIMEOUT,
            settle_delay: SETTLE_DELAY,
        }
    }
}

#[derive(Debug, Default)]
pub enum Session {
    #[default]
    Disconnected,
    Connected(TcpStream),
}

/// TCPGecko client owning at most one TCP session. Every transaction takes
/// `&mut self`, so transactions on a session never overlap.
///
/// A transaction that fails part way drops the session, since a late reply
/// would otherwise be read as the start of the next response. The next
/// transaction reopens it against the host given to [`GeckoClient::connect`].
#[derive(Debug, Default)]
pub struct GeckoClient {
    config: ClientConfig,
    session: Session,
    host: Option<String>,
}

impl GeckoClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            session: Session::Disconnected,
            host: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.session, Session::Connected(_))
    }

    pub async fn connect(&mut self, host: &str) -> Result<(), ClientError> {
        if self.is_connected() {
            return Err(ClientError::AlreadyConnected);
        }

        let stream = self.open_stream(host).await?;
        self.session = Session::Connected(stream);
        self.host = Some(host.to_string());
        tracing::info!(%host, port = self.config.port, "connected to TCPGecko");
        Ok(())
    }

    /// Close the session and forget the host. Later transactions fail with
    /// [`ClientError::NotConnected`] until the next `connect`.
    pub async fn disconnect(&mut self) {
        self.host = None;
        if let Session::Connected(mut stream) = std::mem::take(&mut self.session) {
            if let Err(e) = stream.shutdown().await {
                tracing::debug!(error = %e, "error while closing session");
            }
            tracing::info!("disconnected from TCPGecko");
        }
    }

    pub async fn get_server_version_hash(&mut self) -> Result<Option<u32>, ClientError> {
        let read_timeout = self.config.read_timeout;
        let stream = self.ensure_session().await?;
        if let Err(e) = send(stream, &[Opcode::GetVersionHash.as_byte()], read_timeout).await {
            self.drop_session(&e);
            return Err(e);
        }

        let mut buf = [0u8; 4];
        match timeout(read_timeout, stream.read_exact(&mut buf)).await {
            Err(_) => {
                self.drop_session(&ClientError::TransactionTimeout);
                Ok(None)
            }
            Ok(Err(e)) => {
                let e = ClientError::from(e);
                self.drop_session(&e);
                Err(e)
            }
            Ok(Ok(_)) => Ok(Some(u32::from_be_bytes(buf))),
        }
    }

    /// Read `end - start` bytes of target memory. Any failure mid-response
    /// discards what was already received.
    pub async fn read_memory_range(&mut self, start: u32, end: u32) -> Result<Vec<u8>, ClientError> {
        if end <= start {
            return Err(ClientError::InvalidRange { start, end });
        }
        let size = usize::try_from(end - start).map_err(|_| ClientError::InvalidRange { start, end })?;

        let read_timeout = self.config.read_timeout;
        let stream = self.ensure_session().await?;
        let data = match send(stream, &protocol::encode_read_request(start, end), read_timeout).await {
            Ok(()) => read_response(stream, size, read_timeout).await,
            Err(e) => Err(e),
        };
        if let Err(e) = &data {
            tracing::debug!(start, size, error = %e, "memory read failed");
            self.drop_session(e);
        }
        data
    }

    async fn open_stream(&self, host: &str) -> Result<TcpStream, ClientError> {
        let port = self.config.port;
        let stream = match timeout(self.config.connect_timeout, TcpStream::connect((host, port))).await
        {
            Err(_) => {
                tracing::debug!(%host, port, "connect timed out");
                return Err(ClientError::ConnectTimeout);
            }
            Ok(Err(e)) => {
                tracing::debug!(%host, port, error = %e, "connect failed");
                return Err(ClientError::ConnectFailed(e));
            }
            Ok(Ok(stream)) => stream,
        };
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(error = %e, "could not disable Nagle");
        }
        tokio::time::sleep(self.config.settle_delay).await;
        Ok(stream)
    }

    /// The open session, reopened first if a failed transaction dropped it.
    async fn ensure_session(&mut self) -> Result<&mut TcpStream, ClientError> {
        if !self.is_connected()
            && let Some(host) = self.host.clone()
        {
            let stream = self.open_stream(&host).await?;
            tracing::debug!(%host, "reopened TCPGecko session");
            self.session = Session::Connected(stream);
        }
        match &mut self.session {
            Session::Connected(stream) => Ok(stream),
            Session::Disconnected => Err(ClientError::NotConnected),
        }
    }

    fn drop_session(&mut self, cause: &ClientError) {
        if let Session::Connected(_) = std::mem::take(&mut self.session) {
            tracing::debug!(error = %cause, "dropping TCPGecko session");
        }
    }
}

impl MemoryReader for GeckoClient {
    fn read_memory_range(
        &mut self,
        start: u32,
        end: u32,
    ) -> impl Future<Output = Result<Vec<u8>, ClientError>> + Send {
        GeckoClient::read_memory_range(self, start, end)
    }
}

// ─── Wire helpers ───────────────────────────────────────────────────────────

async fn with_deadline<T>(
    deadline: Duration,
    fut: impl Future<Output = io::Result<T>>,
) -> Result<T, ClientError> {
    timeout(deadline, fut)
        .await
        .map_err(|_| ClientError::TransactionTimeout)?
        .map_err(ClientError::from)
}

async fn send(
    stream: &mut (impl AsyncWrite + Unpin),
    frame: &[u8],
    deadline: Duration,
) -> Result<(), ClientError> {
    with_deadline(deadline, stream.write_all(frame)).await?;
    with_deadline(deadline, stream.flush()).await
}

/// Decode a chunked `READ_MEMORY` response of `size` bytes.
pub async fn read_response(
    stream: &mut (impl AsyncRead + Unpin),
    size: usize,
    deadline: Duration,
) -> Result<Vec<u8>, ClientError> {
    let mut out = Vec::new();
    for len in protocol::block_lengths(size) {
        read_block(stream, len, &mut out, deadline).await?;
    }
    Ok(out)
}

async fn read_block(
    stream: &mut (impl AsyncRead + Unpin),
    len: usize,
    out: &mut Vec<u8>,
    deadline: Duration,
) -> Result<(), ClientError> {
    let marker = with_deadline(deadline, stream.read_u8()).await?;
    let offset = out.len();
    out.resize(offset + len, 0);
    if marker != ZERO_BLOCK_MARKER {
        with_deadline(deadline, stream.read_exact(&mut out[offset..])).await?;
    }
    Ok(())
}

// ─── Tests ──────────────────────────────────────────────────────────────────
