//! Gateway for embedded devices that keep a persistent WebSocket open to us.
//!
//! Each device gets one [`registry::Connection`] and one receive loop reading
//! its socket. Callers talk to devices through [`Gateway`], which correlates
//! requests with the device's replies through a [`CorrelationTable`].

pub mod api;
pub mod codec;
pub mod config;
pub mod correlation;
pub mod error;
pub mod http_server;
pub mod link;
pub mod models;
pub mod receiver;
pub mod registry;
pub mod transfer;

use std::{sync::Arc, time::Duration};

pub use config::Config;
pub use correlation::{CallKind, CorrelationTable};
pub use error::{GatewayError, Result};
pub use registry::DeviceRegistry;

use crate::{
    registry::Connection,
    transfer::{LogProgress, ProgressSink},
};

#[derive(Clone)]
pub struct Gateway {
    pub registry: DeviceRegistry,
    pub calls: CorrelationTable,
    pub config: Arc<Config>,
    progress: Arc<dyn ProgressSink>,
}

impl Gateway {
    pub fn new(config: Config) -> Self {
        Self::from_parts(
            DeviceRegistry::new(),
            CorrelationTable::new(),
            Arc::new(LogProgress),
            config,
        )
    }

    pub fn from_parts(
        registry: DeviceRegistry,
        calls: CorrelationTable,
        progress: Arc<dyn ProgressSink>,
        config: Config,
    ) -> Self {
        Self {
            registry,
            calls,
            config: Arc::new(config),
            progress,
        }
    }

    pub fn with_progress(mut self, progress: impl ProgressSink + 'static) -> Self {
        self.progress = Arc::new(progress);
        self
    }

    pub fn request_timeout(&self) -> Duration {
        self.config.request_timeout()
    }

    pub fn download_timeout(&self) -> Duration {
        self.config.download_timeout()
    }

    fn connection(&self, device_id: &str) -> Result<Arc<Connection>> {
        self.registry
            .get(device_id)
            .ok_or_else(|| GatewayError::DeviceNotConnected(device_id.to_string()))
    }
}
