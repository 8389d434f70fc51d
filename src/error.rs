use std::time::Duration;

use axum::http::StatusCode;

use crate::correlation::CallKind;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("IO error: {0}")]
    IOError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Device {0} is not connected")]
    DeviceNotConnected(String),

    #[error("A {kind} request is already in flight for device {device}")]
    RequestInFlight { device: String, kind: CallKind },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Device reported an error: {0}")]
    DeviceReported(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("No response to {kind} after {after:?}")]
    Timeout { kind: CallKind, after: Duration },

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Error: could not get $HOME value")]
    NoHomeDir,

    #[error("Could not serialize config")]
    ConfigSerializationFail(#[from] toml::ser::Error),

    #[error("Could not parse config file")]
    ConfigParseError(#[from] Box<figment::Error>),
}

impl GatewayError {
    /// Status code the HTTP layer answers with for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::DeviceNotConnected(_) | GatewayError::FileNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            GatewayError::RequestInFlight { .. } => StatusCode::CONFLICT,
            GatewayError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::DeviceReported(_)
            | GatewayError::ConnectionClosed
            | GatewayError::Protocol(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caller_errors_map_to_http_statuses() {
        assert_eq!(
            GatewayError::DeviceNotConnected("esp-1".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            GatewayError::RequestInFlight {
                device: "esp-1".into(),
                kind: CallKind::Status
            }
            .status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            GatewayError::Timeout {
                kind: CallKind::File,
                after: Duration::from_secs(1)
            }
            .status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            GatewayError::ConnectionClosed.status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            GatewayError::NoHomeDir.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
