use crate::config::ServerConfig;
use crate::error::{Result, TransferError};
use crate::{ServerEvent, SessionState};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::connection::Connection;
use super::constants::SIZE_NOT_FOUND;
use super::framing::{ChunkPlan, Command, TransferHeader, transfer_size};
use super::storage::{PendingFile, StorageDirectory};
use super::utils::format_transfer_speed;

/// Pause after a failed accept (e.g. out of file descriptors)
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Why a session ended
#[derive(Debug)]
pub enum SessionEnd {
    /// Client sent `Quit`
    Quit,
    /// Client closed the stream between exchanges
    PeerClosed,
    /// An exchange failed and the connection was dropped
    Failed(TransferError),
}

impl SessionEnd {
    fn describe(&self) -> String {
        match self {
            SessionEnd::Quit => "quit".to_string(),
            SessionEnd::PeerClosed => "peer closed".to_string(),
            SessionEnd::Failed(e) => e.to_string(),
        }
    }
}

/// Outcome of one connection
#[derive(Debug)]
pub struct SessionSummary {
    pub uploads: usize,
    pub downloads: usize,
    pub end: SessionEnd,
}

/// Per-connection settings shared by every session
#[derive(Clone)]
pub struct SessionContext {
    storage: StorageDirectory,
    chunk_size: usize,
    event_tx: Option<mpsc::Sender<ServerEvent>>,
}

impl SessionContext {
    pub fn new(storage: StorageDirectory, chunk_size: usize) -> Self {
        Self {
            storage,
            chunk_size: chunk_size.max(1),
            event_tx: None,
        }
    }

    pub fn with_events(mut self, event_tx: mpsc::Sender<ServerEvent>) -> Self {
        self.event_tx = Some(event_tx);
        self
    }

    /// Never waits on the observer; events that do not fit are dropped
    fn emit(&self, event: ServerEvent) {
        let Some(tx) = &self.event_tx else {
            return;
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!("Event channel full, dropping {:?}", event);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Event channel closed");
            }
        }
    }

    /// Serve one connection until Quit, disconnect or a failed exchange
    pub async fn handle_connection<S>(&self, mut conn: Connection<S>) -> SessionSummary
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let peer = conn.peer_label();
        let mut uploads = 0;
        let mut downloads = 0;
        let mut state = SessionState::Idle;
        debug!("[{}] {:?}", peer, state);

        self.emit(ServerEvent::ClientConnected { peer: peer.clone() });
        state = SessionState::AwaitingCommand;
        debug!("[{}] {:?}", peer, state);

        let end = loop {
            let command = match conn.read_command().await {
                Ok(command) => command,
                Err(TransferError::ConnectionClosed) => break SessionEnd::PeerClosed,
                Err(e) => break SessionEnd::Failed(e),
            };

            let result = match command {
                Command::Upload => {
                    state = SessionState::Uploading;
                    debug!("[{}] {:?}", peer, state);
                    self.handle_upload(&mut conn, &peer).await.map(|stored| {
                        uploads += usize::from(stored);
                    })
                }
                Command::Download => {
                    state = SessionState::Downloading;
                    debug!("[{}] {:?}", peer, state);
                    self.handle_download(&mut conn, &peer).await.map(|sent| {
                        downloads += usize::from(sent);
                    })
                }
                Command::Quit => break SessionEnd::Quit,
            };

            // Handlers only return errors that leave the stream unusable
            if let Err(e) = result {
                break SessionEnd::Failed(e);
            }
            state = SessionState::AwaitingCommand;
            debug!("[{}] {:?}", peer, state);
        };
        state = SessionState::Closed;
        debug!("[{}] {:?}", peer, state);

        match &end {
            SessionEnd::Failed(e) => warn!("[{}] Session ended: {}", peer, e),
            other => info!("[{}] Session ended: {}", peer, other.describe()),
        }
        self.emit(ServerEvent::ClientDisconnected {
            peer,
            uploads,
            downloads,
            reason: end.describe(),
        });

        SessionSummary {
            uploads,
            downloads,
            end,
        }
    }

    /// Returns whether the file was stored
    async fn handle_upload<S>(&self, conn: &mut Connection<S>, peer: &str) -> Result<bool>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        // A name that cannot be decoded still has its payload drained
        let name = match conn.read_filename().await {
            Err(e) if e.is_fatal() => return Err(e),
            name => name,
        };
        let size = conn.read_size().await?;
        let header = TransferHeader::new(
            match &name {
                Ok(name) => name.clone(),
                Err(TransferError::InvalidFileName(lossy)) => lossy.clone(),
                Err(other) => other.to_string(),
            },
            size,
        );
        info!(
            "[{}] Receiving file: {} ({} bytes)",
            peer, header.filename, header.size
        );

        let staged = match name {
            Ok(name) => self.storage.begin_write(&name).await,
            Err(e) => Err(e),
        };
        let sink = match staged {
            Ok(pending) => Sink::Staged(pending),
            Err(e) => {
                warn!("[{}] Discarding upload of {:?}: {}", peer, header.filename, e);
                Sink::Discard(e)
            }
        };

        let start_time = Instant::now();
        let sink = match self.receive_payload(conn, &header, sink).await {
            Ok(sink) => sink,
            Err(e) => {
                error!(
                    "[{}] Upload of {} broke off: {}",
                    peer, header.filename, e
                );
                self.emit(ServerEvent::UploadFailed {
                    peer: peer.to_string(),
                    file_name: header.filename,
                    error: e.to_string(),
                });
                return Err(e);
            }
        };

        let outcome = match sink {
            Sink::Staged(pending) => pending.commit().await,
            Sink::Discard(e) => Err(e),
        };

        match outcome {
            Ok(path) => {
                let elapsed = start_time.elapsed().as_secs_f64();
                info!(
                    "[{}] Stored {} ({} bytes, {})",
                    peer,
                    path.display(),
                    header.size,
                    format_transfer_speed(u64::from(header.size), elapsed)
                );
                self.emit(ServerEvent::UploadCompleted {
                    peer: peer.to_string(),
                    file_name: header.filename,
                    path,
                    bytes: u64::from(header.size),
                });
                Ok(true)
            }
            Err(e) => {
                self.emit(ServerEvent::UploadRejected {
                    peer: peer.to_string(),
                    file_name: header.filename,
                    reason: e.to_string(),
                });
                Ok(false)
            }
        }
    }

    /// Read exactly `header.size` bytes into the sink.
    ///
    /// A local write failure turns the sink into a discard so the payload is
    /// still consumed in full; only transport failures are returned.
    async fn receive_payload<S>(
        &self,
        conn: &mut Connection<S>,
        header: &TransferHeader,
        mut sink: Sink,
    ) -> Result<Sink>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut buffer = vec![0u8; self.chunk_size];

        for n in ChunkPlan::new(header.size, self.chunk_size) {
            if let Err(e) = conn.read_exact(&mut buffer[..n]).await {
                sink.abort().await;
                return Err(e);
            }

            if let Sink::Staged(pending) = &mut sink {
                if let Err(e) = pending.write_chunk(&buffer[..n]).await {
                    warn!("Write to {:?} failed: {}", pending.target(), e);
                    sink.abort().await;
                    sink = Sink::Discard(e);
                }
            }
        }

        Ok(sink)
    }

    /// Returns whether file content was sent
    async fn handle_download<S>(&self, conn: &mut Connection<S>, peer: &str) -> Result<bool>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let file_name = match conn.read_filename().await {
            Ok(name) => name,
            Err(TransferError::InvalidFileName(lossy)) => {
                warn!("[{}] Undecodable download name {:?}", peer, lossy);
                conn.write_size(SIZE_NOT_FOUND).await?;
                self.emit(ServerEvent::DownloadNotFound {
                    peer: peer.to_string(),
                    file_name: lossy,
                });
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        let opened = match self.storage.open_existing(&file_name).await {
            Ok(Some((file, len))) => match transfer_size(len) {
                Ok(size) => Some((file, size)),
                Err(e) => {
                    warn!("[{}] Cannot serve {}: {}", peer, file_name, e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!("[{}] Cannot serve {:?}: {}", peer, file_name, e);
                None
            }
        };

        let Some((mut file, size)) = opened else {
            info!("[{}] Requested file not found: {}", peer, file_name);
            conn.write_size(SIZE_NOT_FOUND).await?;
            self.emit(ServerEvent::DownloadNotFound {
                peer: peer.to_string(),
                file_name,
            });
            return Ok(false);
        };

        info!("[{}] Sending file: {} ({} bytes)", peer, file_name, size);
        let start_time = Instant::now();

        let sent = async {
            conn.write_size(size).await?;
            let mut buffer = vec![0u8; self.chunk_size];
            for n in ChunkPlan::new(size, self.chunk_size) {
                file.read_exact(&mut buffer[..n])
                    .await
                    .map_err(TransferError::Storage)?;
                conn.write_exact(&buffer[..n]).await?;
            }
            Ok::<_, TransferError>(())
        }
        .await;

        match sent {
            Ok(()) => {
                let elapsed = start_time.elapsed().as_secs_f64();
                info!(
                    "[{}] Sent {} ({})",
                    peer,
                    file_name,
                    format_transfer_speed(u64::from(size), elapsed)
                );
                self.emit(ServerEvent::DownloadCompleted {
                    peer: peer.to_string(),
                    file_name,
                    bytes: u64::from(size),
                });
                Ok(true)
            }
            Err(e) => {
                // Size is already announced, so any failure desyncs the peer
                error!("[{}] Download of {} broke off: {}", peer, file_name, e);
                self.emit(ServerEvent::DownloadFailed {
                    peer: peer.to_string(),
                    file_name,
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }
}

enum Sink {
    Staged(PendingFile),
    Discard(TransferError),
}

impl Sink {
    async fn abort(&mut self) {
        let taken = std::mem::replace(self, Sink::Discard(TransferError::ConnectionClosed));
        if let Sink::Staged(pending) = taken {
            pending.abort().await;
        }
    }
}

/// TCP transfer server
pub struct Server {
    listener: TcpListener,
    config: ServerConfig,
    context: SessionContext,
    limit: Arc<Semaphore>,
}

impl Server {
    /// Validate the config, open storage and bind the listening socket
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        config.validate()?;
        let storage = StorageDirectory::open(&config.storage_dir).await?;
        let listener = TcpListener::bind(config.socket_addr())
            .await
            .map_err(TransferError::ConnectionError)?;

        info!(
            "Server listening on {} (storage: {:?}, max connections: {})",
            listener.local_addr().map_err(TransferError::ConnectionError)?,
            storage.root(),
            config.max_connections
        );

        Ok(Self {
            listener,
            context: SessionContext::new(storage, config.chunk_size),
            limit: Arc::new(Semaphore::new(config.max_connections)),
            config,
        })
    }

    /// Send lifecycle events to `event_tx`
    pub fn with_events(mut self, event_tx: mpsc::Sender<ServerEvent>) -> Self {
        self.context = self.context.with_events(event_tx);
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(TransferError::ConnectionError)
    }

    /// Accept connections until the process exits
    pub async fn run(self) -> Result<()> {
        self.run_until(CancellationToken::new()).await
    }

    /// Accept connections until `shutdown` is cancelled.
    ///
    /// Sessions already running are left to finish on their own.
    pub async fn run_until(self, shutdown: CancellationToken) -> Result<()> {
        loop {
            // Wait for a free slot before taking another connection off the backlog
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = self.limit.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let (stream, remote_addr) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Accept failed: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                },
            };

            info!("Client connected: {}", remote_addr);
            let context = self.context.clone();
            let conn = Connection::from_tcp(stream)
                .with_io_timeout(self.config.io_timeout())
                .with_idle_timeout(self.config.idle_timeout());

            tokio::spawn(async move {
                let _permit = permit;
                context.handle_connection(conn).await;
            });
        }

        info!("Server stopped accepting connections");
        Ok(())
    }
}
