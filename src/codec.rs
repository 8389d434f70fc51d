//! Wire codec for the device protocol.
//!
//! Text frames are JSON: either a bare array (a file listing) or an envelope
//! object discriminated by its `type` field. Binary frames carry one file
//! chunk as a big-endian `u32` index followed by the payload.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::{
    correlation::CallKind,
    error::{GatewayError, Result},
    models::{Ack, DeviceStatus, FileEntry, Scalar},
};

pub const CHUNK_INDEX_LEN: usize = 4;

/// A decoded text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Listing(Vec<FileEntry>),
    Envelope(Envelope),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Status(DeviceStatus),
    FileStart { filename: String, size: u64 },
    FileEnd,
    Error { message: String },
    /// Generic `success`; which command it answers is implicit.
    Success { message: Option<String> },
    /// An ack whose `type` names the command it answers.
    CommandAck { kind: CallKind, ack: Ack },
    Unknown,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum RawEnvelope {
    #[serde(rename = "STATUS")]
    Status(DeviceStatus),
    #[serde(rename = "FILE_START")]
    FileStart {
        filename: String,
        #[serde(default)]
        size: u64,
    },
    #[serde(rename = "FILE_END")]
    FileEnd,
    #[serde(rename = "ERROR")]
    Error {
        #[serde(default)]
        message: Option<String>,
    },
    #[serde(rename = "success")]
    Success {
        #[serde(default)]
        message: Option<String>,
    },
    #[serde(rename = "DELETE_FILE")]
    DeleteFile(EchoAck),
    #[serde(rename = "DELETE_ALL_FILES")]
    DeleteAllFiles(EchoAck),
    #[serde(rename = "DISCONNECT")]
    Disconnect(EchoAck),
    #[serde(other)]
    Unknown,
}

// a missing `success` on an echo means the device did not confirm
#[derive(Deserialize)]
struct EchoAck {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    message: Option<String>,
}

impl EchoAck {
    fn into_envelope(self, kind: CallKind) -> Envelope {
        Envelope::CommandAck {
            kind,
            ack: Ack {
                success: self.success,
                message: self.message,
            },
        }
    }
}

impl From<RawEnvelope> for Envelope {
    fn from(raw: RawEnvelope) -> Self {
        match raw {
            RawEnvelope::Status(status) => Envelope::Status(status),
            RawEnvelope::FileStart { filename, size } => Envelope::FileStart { filename, size },
            RawEnvelope::FileEnd => Envelope::FileEnd,
            RawEnvelope::Error { message } => Envelope::Error {
                message: message.unwrap_or_else(|| "unspecified device error".to_string()),
            },
            RawEnvelope::Success { message } => Envelope::Success { message },
            RawEnvelope::DeleteFile(echo) => echo.into_envelope(CallKind::DeleteFile),
            RawEnvelope::DeleteAllFiles(echo) => echo.into_envelope(CallKind::DeleteAllFiles),
            RawEnvelope::Disconnect(echo) => echo.into_envelope(CallKind::Disconnect),
            RawEnvelope::Unknown => Envelope::Unknown,
        }
    }
}

/// Requests the gateway sends to a device.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Request {
    Status,
    ListFiles,
    DeleteFile {
        filename: String,
    },
    DeleteAllFiles,
    Disconnect,
    RequestFile {
        filename: String,
    },
    FileStartAck,
    Complete {
        #[serde(rename = "fileId")]
        file_id: Scalar,
    },
}

/// One indexed slice of a file being downloaded.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub index: u32,
    pub payload: Bytes,
}

pub fn decode_text(text: &str) -> Result<Inbound> {
    if text.trim_start().starts_with('[') {
        let listing = serde_json::from_str::<Vec<FileEntry>>(text)
            .map_err(|e| GatewayError::Protocol(format!("bad file listing: {e}")))?;
        return Ok(Inbound::Listing(listing));
    }

    let raw = serde_json::from_str::<RawEnvelope>(text)
        .map_err(|e| GatewayError::Protocol(format!("bad envelope: {e}")))?;
    Ok(Inbound::Envelope(raw.into()))
}

/// Returns `None` for frames too short to carry any payload.
pub fn decode_binary(data: Bytes) -> Option<Chunk> {
    if data.len() <= CHUNK_INDEX_LEN {
        return None;
    }
    let mut index = [0u8; CHUNK_INDEX_LEN];
    index.copy_from_slice(&data[..CHUNK_INDEX_LEN]);
    Some(Chunk {
        index: u32::from_be_bytes(index),
        payload: data.slice(CHUNK_INDEX_LEN..),
    })
}

pub fn encode_request(request: &Request) -> Result<String> {
    Ok(serde_json::to_string(request)?)
}

/// Device side of the binary frame layout, used by simulators and tests.
pub fn encode_chunk(index: u32, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(CHUNK_INDEX_LEN + payload.len());
    buf.put_u32(index);
    buf.put_slice(payload);
    buf.freeze()
}
