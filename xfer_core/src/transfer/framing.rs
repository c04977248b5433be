//! Wire layout of the transfer protocol.
//!
//! Every exchange starts with a command token. Strings (command tokens and
//! filenames) are framed as a 4-byte big-endian length followed by the raw
//! bytes. Sizes are 4 raw bytes, big-endian. Payloads follow a size with no
//! per-chunk framing.
//!
//! Nothing here touches sockets or files.

use crate::error::{Result, TransferError};
use std::fmt;

use super::constants::{MAX_FILENAME_LENGTH, MAX_TOKEN_LENGTH, MAX_TRANSFER_SIZE};

/// Protocol command, sent as the first token of every exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Upload,
    Download,
    Quit,
}

impl Command {
    /// Literal text of the command on the wire
    pub fn as_token(&self) -> &'static str {
        match self {
            Command::Upload => "Upload",
            Command::Download => "Download",
            Command::Quit => "Quit",
        }
    }

    /// Parse a token by exact, case-sensitive match
    pub fn from_token(token: &[u8]) -> Result<Self> {
        match token {
            b"Upload" => Ok(Command::Upload),
            b"Download" => Ok(Command::Download),
            b"Quit" => Ok(Command::Quit),
            other => Err(TransferError::ProtocolMismatch(format!(
                "unknown command token {:?}",
                String::from_utf8_lossy(other)
            ))),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_token())
    }
}

/// Filename and exact payload length announced before an upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferHeader {
    pub filename: String,
    pub size: u32,
}

impl TransferHeader {
    pub fn new(filename: impl Into<String>, size: u32) -> Self {
        Self {
            filename: filename.into(),
            size,
        }
    }
}

/// Length limit applied to a string field when decoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringKind {
    Token,
    Filename,
}

impl StringKind {
    pub fn max_len(&self) -> usize {
        match self {
            StringKind::Token => MAX_TOKEN_LENGTH,
            StringKind::Filename => MAX_FILENAME_LENGTH,
        }
    }
}

pub fn encode_size(size: u32) -> [u8; 4] {
    size.to_be_bytes()
}

pub fn decode_size(bytes: [u8; 4]) -> u32 {
    u32::from_be_bytes(bytes)
}

/// Length-prefixed string field
pub fn encode_string(value: &str) -> Result<Vec<u8>> {
    let bytes = value.as_bytes();
    let len = u32::try_from(bytes.len())
        .map_err(|_| TransferError::ProtocolMismatch("string field too long".to_string()))?;

    let mut buf = Vec::with_capacity(4 + bytes.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(bytes);
    Ok(buf)
}

pub fn encode_command(command: Command) -> Vec<u8> {
    let token = command.as_token().as_bytes();
    let mut buf = Vec::with_capacity(4 + token.len());
    buf.extend_from_slice(&(token.len() as u32).to_be_bytes());
    buf.extend_from_slice(token);
    buf
}

/// Filename field followed by the size field
pub fn encode_header(header: &TransferHeader) -> Result<Vec<u8>> {
    if header.filename.len() > MAX_FILENAME_LENGTH {
        return Err(TransferError::InvalidFileName(header.filename.clone()));
    }
    let mut buf = encode_string(&header.filename)?;
    buf.extend_from_slice(&encode_size(header.size));
    Ok(buf)
}

/// Validate a string length prefix before reading the body.
///
/// Rejecting here keeps a hostile peer from making the reader allocate an
/// arbitrary buffer.
pub fn decode_string_len(prefix: [u8; 4], kind: StringKind) -> Result<usize> {
    let len = u32::from_be_bytes(prefix) as usize;
    if len > kind.max_len() {
        return Err(TransferError::ProtocolMismatch(format!(
            "{:?} field too large: {} bytes (max {})",
            kind,
            len,
            kind.max_len()
        )));
    }
    Ok(len)
}

/// Filenames that are not UTF-8 cannot name a stored file. The field has
/// been consumed in full, so the error does not end the session.
pub fn decode_filename(bytes: Vec<u8>) -> Result<String> {
    String::from_utf8(bytes).map_err(|e| {
        TransferError::InvalidFileName(String::from_utf8_lossy(e.as_bytes()).into_owned())
    })
}

/// Check that a local file length can be announced in a header
pub fn transfer_size(len: u64) -> Result<u32> {
    match u32::try_from(len) {
        Ok(size) if size <= MAX_TRANSFER_SIZE => Ok(size),
        _ => Err(TransferError::FileTooLarge(len)),
    }
}

/// Lazy sequence of chunk lengths covering a payload of `size` bytes
#[derive(Debug, Clone)]
pub struct ChunkPlan {
    remaining: u64,
    chunk_size: usize,
}

impl ChunkPlan {
    /// `chunk_size` must be non-zero; configs are validated before use,
    /// a zero here is clamped to 1.
    pub fn new(size: u32, chunk_size: usize) -> Self {
        Self {
            remaining: u64::from(size),
            chunk_size: chunk_size.max(1),
        }
    }
}

impl Iterator for ChunkPlan {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.remaining == 0 {
            return None;
        }
        let n = std::cmp::min(self.remaining, self.chunk_size as u64) as usize;
        self.remaining -= n as u64;
        Some(n)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.remaining.div_ceil(self.chunk_size as u64) as usize;
        (n, Some(n))
    }
}

impl ExactSizeIterator for ChunkPlan {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::constants::{CHUNK_SIZE, SIZE_NOT_FOUND};

    #[test]
    fn test_command_tokens() {
        for cmd in [Command::Upload, Command::Download, Command::Quit] {
            assert_eq!(Command::from_token(cmd.as_token().as_bytes()).unwrap(), cmd);
        }
    }

    #[test]
    fn test_command_is_case_sensitive() {
        assert!(matches!(
            Command::from_token(b"upload"),
            Err(TransferError::ProtocolMismatch(_))
        ));
        assert!(Command::from_token(b"QUIT").is_err());
        assert!(Command::from_token(b"").is_err());
    }

    #[test]
    fn test_encode_command_layout() {
        let buf = encode_command(Command::Quit);
        assert_eq!(buf, b"\x00\x00\x00\x04Quit");
    }

    #[test]
    fn test_size_is_big_endian() {
        assert_eq!(encode_size(0x0102_0304), [1, 2, 3, 4]);
        assert_eq!(decode_size([0, 0, 0x10, 0x01]), 4097);
    }

    #[test]
    fn test_header_layout() {
        let buf = encode_header(&TransferHeader::new("a.txt", 4097)).unwrap();
        assert_eq!(&buf[..4], &[0, 0, 0, 5]);
        assert_eq!(&buf[4..9], b"a.txt");
        assert_eq!(&buf[9..], &[0, 0, 0x10, 0x01]);
    }

    #[test]
    fn test_header_rejects_long_filename() {
        let header = TransferHeader::new("x".repeat(MAX_FILENAME_LENGTH + 1), 1);
        assert!(matches!(
            encode_header(&header),
            Err(TransferError::InvalidFileName(_))
        ));
    }

    #[test]
    fn test_string_len_limits() {
        assert_eq!(
            decode_string_len(8u32.to_be_bytes(), StringKind::Token).unwrap(),
            8
        );
        let err = decode_string_len(1_000_000u32.to_be_bytes(), StringKind::Filename).unwrap_err();
        assert!(err.to_string().contains("too large"), "{}", err);
    }

    #[test]
    fn test_filename_must_be_utf8() {
        assert_eq!(decode_filename(b"ok.bin".to_vec()).unwrap(), "ok.bin");
        let err = decode_filename(vec![b'a', 0xff, 0xfe]).unwrap_err();
        assert!(matches!(err, TransferError::InvalidFileName(_)), "{:?}", err);
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_transfer_size_excludes_sentinel() {
        assert_eq!(transfer_size(0).unwrap(), 0);
        assert_eq!(transfer_size(u64::from(MAX_TRANSFER_SIZE)).unwrap(), MAX_TRANSFER_SIZE);
        assert!(transfer_size(u64::from(SIZE_NOT_FOUND)).is_err());
        assert!(transfer_size(u64::MAX).is_err());
    }

    #[test]
    fn test_chunk_plan_empty() {
        assert_eq!(ChunkPlan::new(0, CHUNK_SIZE).count(), 0);
    }

    #[test]
    fn test_chunk_plan_boundaries() {
        let exact: Vec<usize> = ChunkPlan::new(4096, CHUNK_SIZE).collect();
        assert_eq!(exact, vec![4096]);

        let over: Vec<usize> = ChunkPlan::new(4097, CHUNK_SIZE).collect();
        assert_eq!(over, vec![4096, 1]);

        let small: Vec<usize> = ChunkPlan::new(10, CHUNK_SIZE).collect();
        assert_eq!(small, vec![10]);
    }

    #[test]
    fn test_chunk_plan_len_matches_ceil() {
        for size in [1u32, 4095, 4096, 4097, 8192, 100_000] {
            let plan = ChunkPlan::new(size, CHUNK_SIZE);
            let expected = (size as usize).div_ceil(CHUNK_SIZE);
            assert_eq!(plan.len(), expected, "size {}", size);
            assert_eq!(plan.clone().count(), expected);
            assert_eq!(plan.sum::<usize>(), size as usize);
        }
    }
}
