use crate::error::{Result, TransferError};
use crate::transfer::constants::{MAX_FILENAME_LENGTH, STAGING_PREFIX};
use std::path::Path;
use tokio::fs::{File, OpenOptions};

/// Map a client-supplied name onto a single safe path component.
///
/// Directory parts are discarded, so `../../etc/passwd` becomes `passwd`.
/// Names that collapse to nothing usable are rejected instead of renamed.
pub fn sanitize_file_name(file_name: &str) -> Result<String> {
    // 1. Split by both / and \ so either platform's separators are stripped
    let last = file_name
        .rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or_default();

    // 2. Drop control characters (NUL included)
    let clean_name: String = last.chars().filter(|c| !c.is_control()).collect();

    if clean_name.trim().is_empty() || clean_name == "." || clean_name == ".." {
        return Err(TransferError::InvalidFileName(file_name.to_string()));
    }

    // 3. Windows reserved device names
    // See: https://learn.microsoft.com/en-us/windows/win32/fileio/naming-a-file
    let reserved_names = [
        "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7",
        "COM8", "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
    ];
    if reserved_names
        .iter()
        .any(|&r| clean_name.eq_ignore_ascii_case(r))
    {
        return Err(TransferError::InvalidFileName(file_name.to_string()));
    }

    // 4. Staging files belong to the server
    if clean_name.starts_with(STAGING_PREFIX) {
        return Err(TransferError::InvalidFileName(file_name.to_string()));
    }

    if clean_name.len() > MAX_FILENAME_LENGTH {
        return Err(TransferError::InvalidFileName(file_name.to_string()));
    }

    Ok(clean_name)
}

/// Create a new file with owner-only permissions (0o600 on Unix)
pub async fn open_secure_file(path: &Path) -> std::io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);

    options.open(path).await
}

/// Format transfer speed from bytes and elapsed time
pub fn format_transfer_speed(bytes_transferred: u64, elapsed_secs: f64) -> String {
    if elapsed_secs <= 0.0 {
        return "instant".to_string();
    }

    let speed_bps = bytes_transferred as f64 / elapsed_secs;
    if speed_bps > 1_000_000.0 {
        format!("{:.2} MB/s", speed_bps / 1_000_000.0)
    } else if speed_bps > 1_000.0 {
        format!("{:.1} KB/s", speed_bps / 1_000.0)
    } else {
        format!("{:.0} B/s", speed_bps)
    }
}
