//! TCP file transfer.
//!
//! This module provides:
//! - Framing of commands, filenames and sizes
//! - An exact-read/exact-write connection wrapper with deadlines
//! - A staged storage directory with path sanitization
//! - The server accept loop and per-connection handler
//! - The client side of Upload/Download/Quit

pub mod client;
pub mod connection;
pub mod constants;
pub mod framing;
pub mod server;
pub mod storage;
pub mod utils;

// Re-export public API
pub use client::{Client, ClientRequest};
pub use connection::Connection;
pub use constants::{CHUNK_SIZE, SIZE_NOT_FOUND, TRANSFER_PORT};
pub use framing::{ChunkPlan, Command, TransferHeader};
pub use server::{Server, SessionContext, SessionEnd, SessionSummary};
pub use storage::{PendingFile, StorageDirectory};
