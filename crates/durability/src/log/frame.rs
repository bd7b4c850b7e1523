//! File log framing.
//!
//! # File Layout
//!
//! ```text
//! ┌────────────────────────────────────┐
//! │ Header (8 bytes): "TXLG" + version │
//! ├────────────────────────────────────┤
//! │ Frame 1                            │
//! ├────────────────────────────────────┤
//! │ Frame 2                            │
//! ├────────────────────────────────────┤
//! │ ...                                │
//! └────────────────────────────────────┘
//! ```
//!
//! # Frame Layout
//!
//! ```text
//! ┌─────────────────┬────────────────┬───────────────────────┬──────────┐
//! │ Length (4 bytes)│ Format Ver (1) │ Payload (rmp-encoded) │ CRC32 (4)│
//! └─────────────────┴────────────────┴───────────────────────┴──────────┘
//! ```
//!
//! The length covers the version byte, the payload and the CRC.

use crc32fast::Hasher;

/// Magic bytes identifying a log file: "TXLG"
pub const LOG_MAGIC: [u8; 4] = *b"TXLG";

/// Current file format version
pub const LOG_FORMAT_VERSION: u32 = 1;

/// Size of the file header in bytes
pub const LOG_HEADER_SIZE: usize = 8;

/// Current frame format version
pub const FRAME_FORMAT_VERSION: u8 = 1;

/// Build the file header.
pub fn header_bytes() -> [u8; LOG_HEADER_SIZE] {
    let mut bytes = [0u8; LOG_HEADER_SIZE];
    bytes[0..4].copy_from_slice(&LOG_MAGIC);
    bytes[4..8].copy_from_slice(&LOG_FORMAT_VERSION.to_le_bytes());
    bytes
}

/// Check a file header.
pub fn check_header(bytes: &[u8]) -> Result<(), FrameError> {
    if bytes.len() < LOG_HEADER_SIZE {
        return Err(FrameError::InsufficientData);
    }
    if bytes[0..4] != LOG_MAGIC {
        return Err(FrameError::InvalidFormat);
    }
    let mut version = [0u8; 4];
    version.copy_from_slice(&bytes[4..8]);
    let version = u32::from_le_bytes(version);
    if version != LOG_FORMAT_VERSION {
        return Err(FrameError::UnsupportedVersion(version as u8));
    }
    Ok(())
}

/// Wrap a payload in a frame.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(1 + payload.len());
    body.push(FRAME_FORMAT_VERSION);
    body.extend_from_slice(payload);

    let crc = compute_crc(&body);

    let total_len = body.len() + 4;
    let mut frame = Vec::with_capacity(4 + total_len);
    frame.extend_from_slice(&(total_len as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

/// Decode one frame from the front of `bytes`.
///
/// Returns (payload, bytes_consumed) on success.
pub fn decode_frame(bytes: &[u8]) -> Result<(&[u8], usize), FrameError> {
    if bytes.len() < 4 {
        return Err(FrameError::InsufficientData);
    }

    let mut len = [0u8; 4];
    len.copy_from_slice(&bytes[0..4]);
    let length = u32::from_le_bytes(len) as usize;

    // Minimum: 1 byte format version + 4 bytes CRC
    if length < 5 {
        return Err(FrameError::InvalidFormat);
    }
    if bytes.len() < 4 + length {
        return Err(FrameError::InsufficientData);
    }

    let body = &bytes[4..4 + length - 4];
    let mut crc = [0u8; 4];
    crc.copy_from_slice(&bytes[4 + length - 4..4 + length]);
    let stored_crc = u32::from_le_bytes(crc);

    let computed_crc = compute_crc(body);
    if computed_crc != stored_crc {
        return Err(FrameError::ChecksumMismatch {
            expected: stored_crc,
            computed: computed_crc,
        });
    }

    if body[0] != FRAME_FORMAT_VERSION {
        return Err(FrameError::UnsupportedVersion(body[0]));
    }

    Ok((&body[1..], 4 + length))
}

fn compute_crc(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Frame parsing errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// Not enough data to parse a frame
    #[error("Insufficient data to parse frame")]
    InsufficientData,

    /// Frame format is invalid
    #[error("Invalid frame format")]
    InvalidFormat,

    /// Checksum verification failed
    #[error("Checksum mismatch: expected {expected:08x}, computed {computed:08x}")]
    ChecksumMismatch {
        /// Expected checksum from frame
        expected: u32,
        /// Computed checksum
        computed: u32,
    },

    /// Unsupported format version
    #[error("Unsupported format version: {0}")]
    UnsupportedVersion(u8),
}
