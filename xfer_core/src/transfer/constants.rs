/// Default TCP port for the transfer server
pub const TRANSFER_PORT: u16 = 8080;

/// Default bind/connect address (loopback)
pub const TRANSFER_ADDRESS: &str = "127.0.0.1";

/// Payload chunk size (4KB)
pub const CHUNK_SIZE: usize = 4096;

/// Upper bound accepted for a configured chunk size (1MB)
pub const MAX_CHUNK_SIZE: usize = 1024 * 1024;

/// Maximum length of a command token on the wire
pub const MAX_TOKEN_LENGTH: usize = 16;

/// Maximum filename length (bytes)
pub const MAX_FILENAME_LENGTH: usize = 255;

/// Size reply meaning "remote file not found"
pub const SIZE_NOT_FOUND: u32 = u32::MAX;

/// Largest payload a header can announce
pub const MAX_TRANSFER_SIZE: u32 = SIZE_NOT_FOUND - 1;

/// Default cap on concurrently served connections
pub const MAX_CONNECTIONS: usize = 64;

/// Default timeout for a single read/write inside an exchange (seconds)
pub const IO_TIMEOUT_SECS: u64 = 30;

/// Prefix of in-progress upload files inside a storage directory
pub const STAGING_PREFIX: &str = ".xfer-partial-";
