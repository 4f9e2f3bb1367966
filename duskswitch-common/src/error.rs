//! Error types shared by the daemon and its device backends

use std::io;
use thiserror::Error;

/// Errors raised while encoding or decoding Tuya frames
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("frame truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("bad frame prefix {0:#010x}")]
    BadPrefix(u32),

    #[error("bad frame suffix {0:#010x}")]
    BadSuffix(u32),

    #[error("CRC mismatch: frame says {expected:#010x}, computed {actual:#010x}")]
    CrcMismatch { expected: u32, actual: u32 },

    #[error("Message too large: {0} bytes exceeds maximum of {1} bytes")]
    FrameTooLarge(usize, usize),

    #[error("device key must be 16 bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("ciphertext is not block aligned ({0} bytes)")]
    Unaligned(usize),

    #[error("invalid PKCS#7 padding")]
    BadPadding,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Errors reported by a device client
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("device {0} not found on the local network")]
    NotFound(String),

    #[error("invalid device address {0}")]
    InvalidAddress(String),

    #[error("device {0} is not connected")]
    NotConnected(String),

    #[error("{step} timed out after {after_ms}ms")]
    Timeout { step: &'static str, after_ms: u64 },

    #[error("device rejected command with return code {0}")]
    Rejected(u32),

    #[error("Connection closed unexpectedly")]
    ConnectionClosed,

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Other error: {0}")]
    Other(String),
}
