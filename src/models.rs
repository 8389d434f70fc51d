use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A scalar the device reports verbatim; firmwares disagree on whether
/// numbers are sent as numbers or strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Bool(b) => write!(f, "{b}"),
            Scalar::Int(i) => write!(f, "{i}"),
            Scalar::Float(x) => write!(f, "{x}"),
            Scalar::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for Scalar {
    fn from(s: &str) -> Self {
        Scalar::Text(s.to_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime: Option<Scalar>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heap: Option<Scalar>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wifi_rssi: Option<Scalar>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wifi_ip: Option<Scalar>,
    pub connected: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub size: u64,
    /// Opaque id the device uses for delete and completion acks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Scalar>,
}

impl FileEntry {
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
            id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DownloadedFile {
    pub filename: String,
    pub data: Bytes,
}

/// Acknowledgment of a delete or disconnect command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSummary {
    pub id: String,
    pub connection_id: String,
    pub connected_at: String,
    pub has_status: bool,
    pub cached_files: usize,
}

pub(crate) fn format_datetime(datetime: DateTime<Utc>) -> String {
    datetime.to_rfc3339()
}
