//! Exact-byte transport over a duplex stream.
//!
//! `read_exact` and `write_exact` are the only primitives the protocol uses.
//! Everything else in this module is built on top of them.

use crate::error::{Result, TransferError};
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use super::framing::{
    ChunkPlan, Command, StringKind, TransferHeader, decode_filename, decode_size, decode_string_len,
    encode_command, encode_header, encode_size, encode_string,
};

/// A live connection owned by one session
pub struct Connection<S> {
    stream: S,
    peer: Option<SocketAddr>,
    io_timeout: Option<Duration>,
    idle_timeout: Option<Duration>,
}

impl Connection<TcpStream> {
    /// Wrap an accepted or connected TCP stream
    pub fn from_tcp(stream: TcpStream) -> Self {
        let peer = stream.peer_addr().ok();
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("Could not set TCP_NODELAY: {}", e);
        }
        let mut conn = Self::new(stream);
        conn.peer = peer;
        conn
    }
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            peer: None,
            io_timeout: None,
            idle_timeout: None,
        }
    }

    /// Deadline for each read/write inside an exchange
    pub fn with_io_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.io_timeout = timeout;
        self
    }

    /// Deadline for waiting on the next command
    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Label for log lines
    pub fn peer_label(&self) -> String {
        self.peer
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| "<local>".to_string())
    }

    /// Fill `buf` completely, or fail with `ConnectionClosed` on early EOF
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let timeout = self.io_timeout;
        self.read_with_deadline(buf, timeout).await
    }

    /// Like `read_exact`, bounded by the idle timeout instead
    pub async fn read_exact_idle(&mut self, buf: &mut [u8]) -> Result<()> {
        let timeout = self.idle_timeout;
        self.read_with_deadline(buf, timeout).await
    }

    /// Hand every byte to the transport and flush it
    pub async fn write_exact(&mut self, bytes: &[u8]) -> Result<()> {
        let stream = &mut self.stream;
        with_deadline(self.io_timeout, async move {
            stream
                .write_all(bytes)
                .await
                .map_err(TransferError::ConnectionError)?;
            stream.flush().await.map_err(TransferError::ConnectionError)
        })
        .await
    }

    async fn read_with_deadline(
        &mut self,
        buf: &mut [u8],
        timeout: Option<Duration>,
    ) -> Result<()> {
        let stream = &mut self.stream;
        with_deadline(timeout, async move {
            stream
                .read_exact(buf)
                .await
                .map(|_| ())
                .map_err(TransferError::from_read)
        })
        .await
    }

    /// Read the next command token, waiting up to the idle timeout
    pub async fn read_command(&mut self) -> Result<Command> {
        let mut prefix = [0u8; 4];
        self.read_exact_idle(&mut prefix).await?;
        let len = decode_string_len(prefix, StringKind::Token)?;

        let mut token = vec![0u8; len];
        self.read_exact(&mut token).await?;
        Command::from_token(&token)
    }

    pub async fn read_string(&mut self, kind: StringKind) -> Result<Vec<u8>> {
        let mut prefix = [0u8; 4];
        self.read_exact(&mut prefix).await?;
        let len = decode_string_len(prefix, kind)?;

        let mut buf = vec![0u8; len];
        self.read_exact(&mut buf).await?;
        Ok(buf)
    }

    /// A non-UTF-8 name yields `InvalidFileName` with the stream still in sync
    pub async fn read_filename(&mut self) -> Result<String> {
        let raw = self.read_string(StringKind::Filename).await?;
        decode_filename(raw)
    }

    pub async fn read_size(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf).await?;
        Ok(decode_size(buf))
    }

    pub async fn write_command(&mut self, command: Command) -> Result<()> {
        self.write_exact(&encode_command(command)).await
    }

    pub async fn write_string(&mut self, value: &str) -> Result<()> {
        self.write_exact(&encode_string(value)?).await
    }

    pub async fn write_size(&mut self, size: u32) -> Result<()> {
        self.write_exact(&encode_size(size)).await
    }

    pub async fn write_header(&mut self, header: &TransferHeader) -> Result<()> {
        self.write_exact(&encode_header(header)?).await
    }

    /// Consume and drop a payload of `size` bytes, keeping the stream in sync
    pub async fn discard(&mut self, size: u32, chunk_size: usize) -> Result<()> {
        let mut buffer = vec![0u8; chunk_size.max(1)];
        for n in ChunkPlan::new(size, chunk_size) {
            self.read_exact(&mut buffer[..n]).await?;
        }
        Ok(())
    }

    /// Close the write half so the peer observes EOF
    pub async fn shutdown(&mut self) -> Result<()> {
        self.stream
            .shutdown()
            .await
            .map_err(TransferError::ConnectionError)
    }
}

async fn with_deadline<T, F>(timeout: Option<Duration>, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| TransferError::Timeout(limit))?,
        None => fut.await,
    }
}
