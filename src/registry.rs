//! Live device connections, keyed by device id.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use chrono::{DateTime, Utc};
use log::{debug, trace};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::{
    codec::{self, Request},
    correlation::CallKind,
    error::{GatewayError, Result},
    link::{Frame, FrameStream, Link},
    models::{format_datetime, DeviceStatus, DeviceSummary, FileEntry, Scalar},
};

pub type ConnectionId = Uuid;

/// Handle for one accepted device link.
///
/// Only the receive loop reads the inbound half; callers share the outbound
/// queue. The cached status and listing are refreshed from device replies.
pub struct Connection {
    device_id: String,
    id: ConnectionId,
    connected_at: DateTime<Utc>,
    outbound: mpsc::Sender<Frame>,
    inbound: Mutex<Option<FrameStream>>,
    loop_started: AtomicBool,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
    status: RwLock<Option<DeviceStatus>>,
    files: RwLock<Vec<FileEntry>>,
    // delete/disconnect kinds in the order they were sent, newest last
    issued: Mutex<Vec<CallKind>>,
}

impl Connection {
    pub fn new(device_id: &str, link: Link) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            device_id: device_id.to_string(),
            id: Uuid::new_v4(),
            connected_at: Utc::now(),
            outbound: link.outbound,
            inbound: Mutex::new(Some(link.inbound)),
            loop_started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            shutdown,
            status: RwLock::new(None),
            files: RwLock::new(Vec::new()),
            issued: Mutex::new(Vec::new()),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Hands out the inbound stream exactly once.
    pub(crate) fn take_inbound(&self) -> Option<FrameStream> {
        if self.loop_started.swap(true, Ordering::AcqRel) {
            return None;
        }
        self.inbound.lock().take()
    }

    pub fn loop_started(&self) -> bool {
        self.loop_started.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Flips the connection to closed. Only the first caller gets `true`.
    pub(crate) fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn signal_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub async fn send(&self, request: &Request) -> Result<()> {
        if self.is_closed() {
            return Err(GatewayError::ConnectionClosed);
        }
        let text = codec::encode_request(request)?;
        trace!("-> {}: {text}", self.device_id);
        self.outbound
            .send(Frame::Text(text))
            .await
            .map_err(|_| GatewayError::ConnectionClosed)
    }

    /// Queues a close frame without waiting; a full or closed queue is ignored
    /// since the writer shuts down once every sender is gone anyway.
    pub(crate) fn close_socket(&self) {
        if let Err(e) = self.outbound.try_send(Frame::Close) {
            debug!("could not queue close for {}: {e}", self.device_id);
        }
    }

    pub fn status(&self) -> Option<DeviceStatus> {
        self.status.read().clone()
    }

    pub(crate) fn set_status(&self, status: DeviceStatus) {
        *self.status.write() = Some(status);
    }

    pub fn files(&self) -> Vec<FileEntry> {
        self.files.read().clone()
    }

    pub(crate) fn set_files(&self, files: Vec<FileEntry>) {
        *self.files.write() = files;
    }

    pub(crate) fn clear_files(&self) {
        self.files.write().clear();
    }

    pub(crate) fn remove_file(&self, name: &str) -> bool {
        let mut files = self.files.write();
        let before = files.len();
        files.retain(|f| f.name != name);
        files.len() != before
    }

    /// Id to echo back in `COMPLETE`: the listing's id when known, else the name.
    pub(crate) fn completion_id(&self, name: &str) -> Scalar {
        self.files
            .read()
            .iter()
            .find(|f| f.name == name)
            .and_then(|f| f.id.clone())
            .unwrap_or_else(|| Scalar::Text(name.to_string()))
    }

    pub(crate) fn note_issued(&self, kind: CallKind) {
        let mut issued = self.issued.lock();
        issued.retain(|k| *k != kind);
        issued.push(kind);
    }

    pub(crate) fn forget_issued(&self, kind: CallKind) {
        self.issued.lock().retain(|k| *k != kind);
    }

    /// Issued command kinds, most recent first.
    pub(crate) fn issued_newest_first(&self) -> Vec<CallKind> {
        self.issued.lock().iter().rev().copied().collect()
    }

    pub fn summary(&self) -> DeviceSummary {
        DeviceSummary {
            id: self.device_id.clone(),
            connection_id: self.id.to_string(),
            connected_at: format_datetime(self.connected_at),
            has_status: self.status.read().is_some(),
            cached_files: self.files.read().len(),
        }
    }
}

#[derive(Clone, Default)]
pub struct DeviceRegistry {
    devices: Arc<RwLock<HashMap<String, Arc<Connection>>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a fresh handle for `device_id`, returning it together with the
    /// handle it replaced, if any. The caller is responsible for tearing the
    /// replaced one down.
    pub fn add(&self, device_id: &str, link: Link) -> (Arc<Connection>, Option<Arc<Connection>>) {
        let connection = Arc::new(Connection::new(device_id, link));
        let replaced = self
            .devices
            .write()
            .insert(device_id.to_string(), connection.clone());
        (connection, replaced)
    }

    /// Drops the handle for `device_id` and asks its receive loop to stop; the
    /// loop then fails the handle's pending calls on its way out.
    pub fn remove(&self, device_id: &str) -> Option<Arc<Connection>> {
        let removed = self.devices.write().remove(device_id);
        if let Some(connection) = &removed {
            connection.clear_files();
            connection.signal_shutdown();
        }
        removed
    }

    /// Removes `connection` only while it is still the registered handle for
    /// its device.
    pub fn remove_if_current(&self, connection: &Connection) -> bool {
        let mut devices = self.devices.write();
        let current = devices
            .get(connection.device_id())
            .is_some_and(|c| c.id() == connection.id());
        if current {
            devices.remove(connection.device_id());
        }
        drop(devices);
        connection.clear_files();
        current
    }

    pub fn get(&self, device_id: &str) -> Option<Arc<Connection>> {
        self.devices.read().get(device_id).cloned()
    }

    pub fn list(&self) -> Vec<Arc<Connection>> {
        let mut connections: Vec<_> = self.devices.read().values().cloned().collect();
        connections.sort_by(|a, b| a.device_id().cmp(b.device_id()));
        connections
    }

    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }
}
