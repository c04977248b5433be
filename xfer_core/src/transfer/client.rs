use crate::SessionState;
use crate::config::ClientConfig;
use crate::error::{Result, TransferError};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{info, warn};

use super::connection::Connection;
use super::constants::{MAX_FILENAME_LENGTH, SIZE_NOT_FOUND};
use super::framing::{ChunkPlan, Command, TransferHeader, encode_header, transfer_size};
use super::storage::StorageDirectory;
use super::utils::format_transfer_speed;

/// One line of user intent for the interactive loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientRequest {
    Upload(PathBuf),
    Download(String),
    Quit,
}

impl ClientRequest {
    /// Parse `upload <path>`, `download <name>` or `quit`. Keywords are
    /// case-insensitive; the argument is the rest of the line, trimmed.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        let (keyword, arg) = match line.split_once(char::is_whitespace) {
            Some((keyword, rest)) => (keyword, rest.trim()),
            None => (line, ""),
        };

        match (keyword.to_ascii_lowercase().as_str(), arg.is_empty()) {
            ("upload" | "u", false) => Some(ClientRequest::Upload(PathBuf::from(arg))),
            ("download" | "d", false) => Some(ClientRequest::Download(arg.to_string())),
            ("quit" | "q" | "exit", true) => Some(ClientRequest::Quit),
            _ => None,
        }
    }
}

/// Client side of one persistent connection
pub struct Client<S = TcpStream> {
    conn: Connection<S>,
    downloads: StorageDirectory,
    chunk_size: usize,
    state: SessionState,
}

impl Client<TcpStream> {
    pub async fn connect(config: &ClientConfig) -> Result<Self> {
        config.validate()?;
        let addr = config.socket_addr();
        info!("Connecting to {}", addr);

        let stream = TcpStream::connect(addr)
            .await
            .map_err(TransferError::ConnectionError)?;
        let conn = Connection::from_tcp(stream).with_io_timeout(config.io_timeout());

        info!("Connected to server {}", addr);
        Self::with_connection(conn, config).await
    }
}

impl<S> Client<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Run the client over an already established connection
    pub async fn with_connection(conn: Connection<S>, config: &ClientConfig) -> Result<Self> {
        let downloads = StorageDirectory::open(&config.download_dir).await?;
        Ok(Self {
            conn,
            downloads,
            chunk_size: config.chunk_size.max(1),
            state: SessionState::AwaitingCommand,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn download_dir(&self) -> &Path {
        self.downloads.root()
    }

    /// Upload a local file under its own file name. Returns the byte count.
    pub async fn upload(&mut self, local_path: impl AsRef<Path>) -> Result<u32> {
        let local_path = local_path.as_ref();
        let remote_name = local_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| TransferError::InvalidFileName(local_path.display().to_string()))?
            .to_string();
        self.upload_as(local_path, &remote_name).await
    }

    /// Upload a local file under `remote_name`
    pub async fn upload_as(
        &mut self,
        local_path: impl AsRef<Path>,
        remote_name: &str,
    ) -> Result<u32> {
        self.ensure_open()?;
        let local_path = local_path.as_ref();

        let mut file = match File::open(local_path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(TransferError::LocalFileNotFound(local_path.to_path_buf()));
            }
            Err(e) => return Err(TransferError::Storage(e)),
        };
        let metadata = file.metadata().await.map_err(TransferError::Storage)?;
        if !metadata.is_file() {
            return Err(TransferError::LocalFileNotFound(local_path.to_path_buf()));
        }

        // Everything that can be rejected locally is checked before the
        // command goes out
        let header = TransferHeader::new(remote_name, transfer_size(metadata.len())?);
        let header_bytes = encode_header(&header)?;

        info!(
            "Uploading {} as {} ({} bytes)",
            local_path.display(),
            remote_name,
            header.size
        );
        self.state = SessionState::Uploading;
        let start_time = Instant::now();

        let result = async {
            self.conn.write_command(Command::Upload).await?;
            self.conn.write_exact(&header_bytes).await?;

            let mut buffer = vec![0u8; self.chunk_size];
            for n in ChunkPlan::new(header.size, self.chunk_size) {
                // A file that shrank mid-upload cannot fill the announced size
                file.read_exact(&mut buffer[..n])
                    .await
                    .map_err(TransferError::Storage)?;
                self.conn.write_exact(&buffer[..n]).await?;
            }
            Ok::<_, TransferError>(())
        }
        .await;

        // Past the command token any failure leaves the server mid-exchange
        self.finish_exchange(&result, true);
        result?;

        info!(
            "Uploaded {} ({})",
            remote_name,
            format_transfer_speed(
                u64::from(header.size),
                start_time.elapsed().as_secs_f64()
            )
        );
        Ok(header.size)
    }

    /// Download `file_name` into the download directory; returns the local path
    pub async fn download(&mut self, file_name: &str) -> Result<PathBuf> {
        self.ensure_open()?;
        if file_name.len() > MAX_FILENAME_LENGTH {
            return Err(TransferError::InvalidFileName(file_name.to_string()));
        }
        // Local name must be usable before anything is requested
        self.downloads.resolve(file_name)?;

        self.state = SessionState::Downloading;
        let start_time = Instant::now();
        let result = self.receive_download(file_name).await;

        let fatal = matches!(&result, Err(e) if e.is_fatal());
        self.finish_exchange(&result, fatal);

        let (path, size) = result?;
        info!(
            "Downloaded {} to {} ({} bytes, {})",
            file_name,
            path.display(),
            size,
            format_transfer_speed(u64::from(size), start_time.elapsed().as_secs_f64())
        );
        Ok(path)
    }

    async fn receive_download(&mut self, file_name: &str) -> Result<(PathBuf, u32)> {
        self.conn.write_command(Command::Download).await?;
        self.conn.write_string(file_name).await?;

        let size = self.conn.read_size().await?;
        if size == SIZE_NOT_FOUND {
            return Err(TransferError::RemoteFileNotFound(file_name.to_string()));
        }
        info!("Receiving file: {} ({} bytes)", file_name, size);

        let mut pending = match self.downloads.begin_write(file_name).await {
            Ok(pending) => pending,
            Err(e) => {
                warn!("Cannot store {}: {}", file_name, e);
                self.conn.discard(size, self.chunk_size).await?;
                return Err(e);
            }
        };

        let mut buffer = vec![0u8; self.chunk_size];
        let mut plan = ChunkPlan::new(size, self.chunk_size);
        while let Some(n) = plan.next() {
            if let Err(e) = self.conn.read_exact(&mut buffer[..n]).await {
                pending.abort().await;
                return Err(e);
            }
            if let Err(e) = pending.write_chunk(&buffer[..n]).await {
                pending.abort().await;
                let rest: usize = plan.sum();
                self.conn.discard(rest as u32, self.chunk_size).await?;
                return Err(e);
            }
        }

        let path = pending.commit().await?;
        Ok((path, size))
    }

    /// Send `Quit` and close the connection
    pub async fn quit(mut self) -> Result<()> {
        if self.state.is_closed() {
            return Ok(());
        }
        self.state = SessionState::Closed;
        self.conn.write_command(Command::Quit).await?;
        if let Err(e) = self.conn.shutdown().await {
            warn!("Shutdown after Quit failed: {}", e);
        }
        info!("Disconnected");
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state.is_closed() {
            return Err(TransferError::ConnectionClosed);
        }
        Ok(())
    }

    fn finish_exchange<T>(&mut self, result: &Result<T>, close_on_error: bool) {
        self.state = match result {
            Err(e) if close_on_error => {
                warn!("Connection closed after failed exchange: {}", e);
                SessionState::Closed
            }
            _ => SessionState::AwaitingCommand,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_requests() {
        assert_eq!(
            ClientRequest::parse("upload notes.txt"),
            Some(ClientRequest::Upload(PathBuf::from("notes.txt")))
        );
        assert_eq!(
            ClientRequest::parse("  Download   my file.txt "),
            Some(ClientRequest::Download("my file.txt".to_string()))
        );
        assert_eq!(ClientRequest::parse("quit"), Some(ClientRequest::Quit));
        assert_eq!(ClientRequest::parse("q"), Some(ClientRequest::Quit));
    }

    #[test]
    fn test_parse_rejects_incomplete() {
        assert_eq!(ClientRequest::parse("upload"), None);
        assert_eq!(ClientRequest::parse("download   "), None);
        assert_eq!(ClientRequest::parse("quit now"), None);
        assert_eq!(ClientRequest::parse("delete x"), None);
        assert_eq!(ClientRequest::parse(""), None);
    }

    #[tokio::test]
    async fn test_missing_local_file_keeps_connection() {
        let dir = tempfile::tempdir().unwrap();
        let (a, _b) = tokio::io::duplex(64);
        let config = ClientConfig {
            download_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let mut client = Client::with_connection(Connection::new(a), &config)
            .await
            .unwrap();

        let err = client.upload(dir.path().join("absent.txt")).await.unwrap_err();
        assert!(matches!(err, TransferError::LocalFileNotFound(_)));
        assert_eq!(client.state(), SessionState::AwaitingCommand);
    }

    #[tokio::test]
    async fn test_transport_failure_closes_client() {
        let dir = tempfile::tempdir().unwrap();
        let (a, b) = tokio::io::duplex(64);
        let config = ClientConfig {
            download_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let mut client = Client::with_connection(Connection::new(a), &config)
            .await
            .unwrap();
        drop(b);

        let err = client.download("anything").await.unwrap_err();
        assert!(err.is_fatal());
        assert!(client.state().is_closed());

        let again = client.download("anything").await.unwrap_err();
        assert!(matches!(again, TransferError::ConnectionClosed));
    }
}
