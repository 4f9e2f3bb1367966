//! Tuya local protocol, version 3.3
//!
//! Every message, on TCP and in UDP broadcasts, is one frame:
//!
//! ```text
//! 000055AA | seq u32 | command u32 | len u32 | [return code u32] payload | crc32 u32 | 0000AA55
//! ```
//!
//! All integers are big endian. `len` counts everything after itself, so it
//! includes the CRC and the suffix. Frames sent by a device carry a return
//! code in front of the payload; frames sent by a client do not.
//!
//! Payloads are JSON encrypted with AES-128-ECB (PKCS#7) under the device's
//! local key. Version 3.3 prefixes most encrypted payloads with `"3.3"` and
//! twelve zero bytes. Discovery broadcasts use a fixed key shared by all
//! devices.

use aes::cipher::{generic_array::GenericArray, BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::ProtocolError;

pub const PREFIX: u32 = 0x0000_55AA;
pub const SUFFIX: u32 = 0x0000_AA55;
pub const HEADER_LEN: usize = 16;
pub const TRAILER_LEN: usize = 8;

/// Maximum accepted frame size (64KB)
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

pub const VERSION: &[u8; 3] = b"3.3";
const VERSION_HEADER_LEN: usize = 15;

pub const DEVICE_PORT: u16 = 6668;
pub const BROADCAST_PORT: u16 = 6666;
pub const ENCRYPTED_BROADCAST_PORT: u16 = 6667;

/// Data point holding the on/off switch of lights and plugs
pub const POWER_DPS: u8 = 20;

// md5("yGAdlopoPVldABfn")
const BROADCAST_KEY: [u8; 16] = [
    0x6c, 0x1e, 0xc8, 0xe2, 0xbb, 0x9b, 0xb5, 0x9a, 0xb5, 0x0b, 0x0d, 0xaf, 0x64, 0x9b, 0x41, 0x0a,
];

/// Command codes used by the daemon
pub mod command {
    pub const CONTROL: u32 = 0x07;
    pub const STATUS: u32 = 0x08;
    pub const HEART_BEAT: u32 = 0x09;
    pub const DP_QUERY: u32 = 0x0a;
    pub const UDP_NEW: u32 = 0x13;
}

/// One protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub seq: u32,
    pub command: u32,
    pub return_code: Option<u32>,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a client frame (no return code)
    pub fn new(seq: u32, command: u32, payload: Vec<u8>) -> Self {
        Self {
            seq,
            command,
            return_code: None,
            payload,
        }
    }

    /// Attach a return code, as devices do
    pub fn with_return_code(mut self, code: u32) -> Self {
        self.return_code = Some(code);
        self
    }

    pub fn encode(&self) -> Vec<u8> {
        let body_len = self.payload.len() + if self.return_code.is_some() { 4 } else { 0 };
        let len = (body_len + TRAILER_LEN) as u32;

        let mut out = Vec::with_capacity(HEADER_LEN + len as usize);
        out.extend_from_slice(&PREFIX.to_be_bytes());
        out.extend_from_slice(&self.seq.to_be_bytes());
        out.extend_from_slice(&self.command.to_be_bytes());
        out.extend_from_slice(&len.to_be_bytes());
        if let Some(code) = self.return_code {
            out.extend_from_slice(&code.to_be_bytes());
        }
        out.extend_from_slice(&self.payload);

        let crc = crc32fast::hash(&out);
        out.extend_from_slice(&crc.to_be_bytes());
        out.extend_from_slice(&SUFFIX.to_be_bytes());
        out
    }

    /// Decode the first frame in `buf`, returning it with the number of bytes consumed
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), ProtocolError> {
        if buf.len() < HEADER_LEN + TRAILER_LEN {
            return Err(ProtocolError::Truncated {
                needed: HEADER_LEN + TRAILER_LEN,
                available: buf.len(),
            });
        }

        let prefix = read_u32(buf, 0);
        if prefix != PREFIX {
            return Err(ProtocolError::BadPrefix(prefix));
        }

        let seq = read_u32(buf, 4);
        let command = read_u32(buf, 8);
        let len = read_u32(buf, 12) as usize;

        if len < TRAILER_LEN {
            return Err(ProtocolError::Truncated {
                needed: TRAILER_LEN,
                available: len,
            });
        }
        let total = HEADER_LEN + len;
        if total > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge(total, MAX_FRAME_SIZE));
        }
        if buf.len() < total {
            return Err(ProtocolError::Truncated {
                needed: total,
                available: buf.len(),
            });
        }

        let crc_at = total - TRAILER_LEN;
        let expected = read_u32(buf, crc_at);
        let actual = crc32fast::hash(&buf[..crc_at]);
        if expected != actual {
            return Err(ProtocolError::CrcMismatch { expected, actual });
        }

        let suffix = read_u32(buf, crc_at + 4);
        if suffix != SUFFIX {
            return Err(ProtocolError::BadSuffix(suffix));
        }

        let (return_code, payload) = split_return_code(&buf[HEADER_LEN..crc_at]);
        Ok((
            Self {
                seq,
                command,
                return_code,
                payload,
            },
            total,
        ))
    }
}

/// Read exactly one frame from an async stream
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await?;

    let prefix = read_u32(&header, 0);
    if prefix != PREFIX {
        return Err(ProtocolError::BadPrefix(prefix));
    }

    let total = HEADER_LEN + read_u32(&header, 12) as usize;
    if total > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(total, MAX_FRAME_SIZE));
    }

    let mut buf = header.to_vec();
    buf.resize(total, 0);
    reader.read_exact(&mut buf[HEADER_LEN..]).await?;

    Frame::decode(&buf).map(|(frame, _)| frame)
}

// Device frames put a small return code before the payload. A payload that
// starts with JSON or the version tag has high bytes set and is left alone.
fn split_return_code(body: &[u8]) -> (Option<u32>, Vec<u8>) {
    if body.len() >= 4 {
        let code = read_u32(body, 0);
        if code & 0xFFFF_FF00 == 0 {
            return (Some(code), body[4..].to_vec());
        }
    }
    (None, body.to_vec())
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

/// AES-128-ECB with PKCS#7 padding
pub struct Cipher {
    aes: Aes128,
}

impl Cipher {
    pub fn new(key: &[u8]) -> Result<Self, ProtocolError> {
        if key.len() != 16 {
            return Err(ProtocolError::InvalidKeyLength(key.len()));
        }
        Ok(Self {
            aes: Aes128::new(GenericArray::from_slice(key)),
        })
    }

    /// Cipher for discovery broadcasts
    pub fn broadcast() -> Self {
        Self {
            aes: Aes128::new(GenericArray::from_slice(&BROADCAST_KEY)),
        }
    }

    pub fn encrypt(&self, plain: &[u8]) -> Vec<u8> {
        let pad = 16 - plain.len() % 16;
        let mut data = Vec::with_capacity(plain.len() + pad);
        data.extend_from_slice(plain);
        data.resize(plain.len() + pad, pad as u8);

        for block in data.chunks_exact_mut(16) {
            self.aes.encrypt_block(GenericArray::from_mut_slice(block));
        }
        data
    }

    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        if data.is_empty() || data.len() % 16 != 0 {
            return Err(ProtocolError::Unaligned(data.len()));
        }

        let mut out = data.to_vec();
        for block in out.chunks_exact_mut(16) {
            self.aes.decrypt_block(GenericArray::from_mut_slice(block));
        }

        let pad = out[out.len() - 1] as usize;
        if pad == 0 || pad > 16 || out[out.len() - pad..].iter().any(|&b| b as usize != pad) {
            return Err(ProtocolError::BadPadding);
        }
        out.truncate(out.len() - pad);
        Ok(out)
    }
}

impl fmt::Debug for Cipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Cipher { .. }")
    }
}

/// JSON body of control commands and status reports
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DpsMessage {
    #[serde(rename = "devId", default, skip_serializing_if = "Option::is_none")]
    pub dev_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<Value>,
    #[serde(default)]
    pub dps: BTreeMap<String, Value>,
}

impl DpsMessage {
    /// Command setting one boolean data point
    pub fn set_bool(device_id: &str, dps: u8, value: bool, timestamp: i64) -> Self {
        let mut map = BTreeMap::new();
        map.insert(dps.to_string(), Value::Bool(value));
        Self {
            dev_id: Some(device_id.to_string()),
            uid: Some(device_id.to_string()),
            t: Some(Value::String(timestamp.to_string())),
            dps: map,
        }
    }

    pub fn bool_dps(&self, dps: u8) -> Option<bool> {
        self.dps.get(&dps.to_string()).and_then(Value::as_bool)
    }
}

/// Encrypt a message into a frame
pub fn seal(
    cipher: &Cipher,
    seq: u32,
    command: u32,
    message: &DpsMessage,
) -> Result<Frame, ProtocolError> {
    let json = serde_json::to_vec(message)?;
    let encrypted = cipher.encrypt(&json);

    // 3.3 queries go out without the version header
    let payload = if command == command::DP_QUERY {
        encrypted
    } else {
        let mut payload = Vec::with_capacity(VERSION_HEADER_LEN + encrypted.len());
        payload.extend_from_slice(VERSION);
        payload.extend_from_slice(&[0u8; VERSION_HEADER_LEN - 3]);
        payload.extend_from_slice(&encrypted);
        payload
    };

    Ok(Frame::new(seq, command, payload))
}

/// Decrypt a frame payload into its JSON bytes
pub fn open_payload(cipher: &Cipher, payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let body = if payload.starts_with(VERSION) {
        &payload[VERSION_HEADER_LEN.min(payload.len())..]
    } else {
        payload
    };

    match body.first() {
        None => Ok(Vec::new()),
        Some(b'{') => Ok(body.to_vec()),
        Some(_) => cipher.decrypt(body),
    }
}

/// Decrypt and parse a frame's message, `None` for an empty payload
pub fn open(cipher: &Cipher, frame: &Frame) -> Result<Option<DpsMessage>, ProtocolError> {
    let json = open_payload(cipher, &frame.payload)?;
    if json.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_slice(&json)?))
}

/// Discovery broadcast announced by a device
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Broadcast {
    #[serde(rename = "gwId")]
    pub gw_id: String,
    pub ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl Broadcast {
    /// Encode as a device would, encrypted for port 6667 or plain for 6666
    pub fn to_datagram(&self, encrypted: bool) -> Result<Vec<u8>, ProtocolError> {
        let json = serde_json::to_vec(self)?;
        let payload = if encrypted {
            Cipher::broadcast().encrypt(&json)
        } else {
            json
        };
        Ok(Frame::new(0, command::UDP_NEW, payload)
            .with_return_code(0)
            .encode())
    }
}

pub fn parse_broadcast(datagram: &[u8]) -> Result<Broadcast, ProtocolError> {
    let (frame, _) = Frame::decode(datagram)?;
    let json = open_payload(&Cipher::broadcast(), &frame.payload)?;
    Ok(serde_json::from_slice(&json)?)
}
