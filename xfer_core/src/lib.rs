//! Core of the xfer file-transfer service.
//!
//! A server stores and serves files from one flat directory; a client keeps
//! one TCP connection open and runs Upload, Download and Quit exchanges over
//! it. Each exchange is framed by [`transfer::framing`] and carried by a
//! [`transfer::Connection`] that only ever reads or writes exact byte counts.

use std::path::PathBuf;

pub mod config;
pub mod error;
pub mod transfer;

pub use config::{ClientConfig, ServerConfig};
pub use error::TransferError;
pub use transfer::{
    Client, ClientRequest, Command, Connection, Server, SessionEnd, SessionSummary,
    StorageDirectory, TransferHeader,
};

/// Where one side of a connection is in the protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    AwaitingCommand,
    Uploading,
    Downloading,
    /// Terminal
    Closed,
}

impl SessionState {
    pub fn is_closed(&self) -> bool {
        matches!(self, SessionState::Closed)
    }
}

/// Report from the server to whoever is watching it (CLI, tests)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    ClientConnected {
        peer: String,
    },

    /// File is stored with exactly `bytes` bytes
    UploadCompleted {
        peer: String,
        file_name: String,
        path: PathBuf,
        bytes: u64,
    },

    /// Payload was received and discarded; the session continues
    UploadRejected {
        peer: String,
        file_name: String,
        reason: String,
    },

    /// Transfer broke off; nothing was stored and the session ends
    UploadFailed {
        peer: String,
        file_name: String,
        error: String,
    },

    DownloadCompleted {
        peer: String,
        file_name: String,
        bytes: u64,
    },

    /// Not-found sentinel was sent
    DownloadNotFound {
        peer: String,
        file_name: String,
    },

    DownloadFailed {
        peer: String,
        file_name: String,
        error: String,
    },

    ClientDisconnected {
        peer: String,
        uploads: usize,
        downloads: usize,
        reason: String,
    },
}
