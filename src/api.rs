//! Caller-facing operations. Each one looks up the device, opens a pending
//! call, sends the request and waits for the receive loop to answer it.

use std::time::Duration;

use log::{debug, info};

use crate::{
    codec::Request,
    correlation::{CallKind, Reply},
    error::{GatewayError, Result},
    models::{Ack, DeviceStatus, DeviceSummary, DownloadedFile, FileEntry},
    registry::Connection,
    Gateway,
};

impl Gateway {
    pub async fn status(&self, device_id: &str) -> Result<DeviceStatus> {
        let connection = self.connection(device_id)?;
        match self
            .call(&connection, CallKind::Status, Request::Status, self.request_timeout())
            .await?
        {
            Reply::Status(status) => Ok(status),
            other => Err(unexpected(CallKind::Status, &other)),
        }
    }

    pub async fn list_files(&self, device_id: &str) -> Result<Vec<FileEntry>> {
        let connection = self.connection(device_id)?;
        match self
            .call(
                &connection,
                CallKind::ListFiles,
                Request::ListFiles,
                self.request_timeout(),
            )
            .await?
        {
            Reply::Listing(files) => Ok(files),
            other => Err(unexpected(CallKind::ListFiles, &other)),
        }
    }

    /// Fetches `filename` through the chunked transfer. When a listing is
    /// cached, names missing from it are refused without asking the device.
    pub async fn download(&self, device_id: &str, filename: &str) -> Result<DownloadedFile> {
        let connection = self.connection(device_id)?;
        let cached = connection.files();
        if !cached.is_empty() && !cached.iter().any(|f| f.name == filename) {
            return Err(GatewayError::FileNotFound(filename.to_string()));
        }

        let request = Request::RequestFile {
            filename: filename.to_string(),
        };
        match self
            .call(&connection, CallKind::File, request, self.download_timeout())
            .await?
        {
            Reply::File(file) => Ok(file),
            other => Err(unexpected(CallKind::File, &other)),
        }
    }

    pub async fn delete_file(&self, device_id: &str, filename: &str) -> Result<Ack> {
        let connection = self.connection(device_id)?;
        let request = Request::DeleteFile {
            filename: filename.to_string(),
        };
        let ack = self.command(&connection, CallKind::DeleteFile, request).await?;
        connection.remove_file(filename);
        info!("{device_id}: deleted {filename}");
        Ok(ack)
    }

    pub async fn delete_all_files(&self, device_id: &str) -> Result<Ack> {
        let connection = self.connection(device_id)?;
        let ack = self
            .command(&connection, CallKind::DeleteAllFiles, Request::DeleteAllFiles)
            .await?;
        connection.clear_files();
        info!("{device_id}: deleted all files");
        Ok(ack)
    }

    /// Asks the device to hang up; on success the socket is closed and the
    /// device leaves the registry.
    pub async fn disconnect(&self, device_id: &str) -> Result<Ack> {
        let connection = self.connection(device_id)?;
        let ack = self
            .command(&connection, CallKind::Disconnect, Request::Disconnect)
            .await?;
        self.terminate(&connection, "disconnect requested");
        Ok(ack)
    }

    pub fn cached_status(&self, device_id: &str) -> Result<Option<DeviceStatus>> {
        Ok(self.connection(device_id)?.status())
    }

    pub fn cached_files(&self, device_id: &str) -> Result<Vec<FileEntry>> {
        Ok(self.connection(device_id)?.files())
    }

    pub fn connected_devices(&self) -> Vec<DeviceSummary> {
        self.registry.list().iter().map(|c| c.summary()).collect()
    }

    async fn command(&self, connection: &Connection, kind: CallKind, request: Request) -> Result<Ack> {
        match self
            .call(connection, kind, request, self.request_timeout())
            .await?
        {
            Reply::Ack(ack) if ack.success => Ok(ack),
            Reply::Ack(ack) => Err(GatewayError::DeviceReported(
                ack.message
                    .unwrap_or_else(|| format!("device declined {kind}")),
            )),
            other => Err(unexpected(kind, &other)),
        }
    }

    async fn call(
        &self,
        connection: &Connection,
        kind: CallKind,
        request: Request,
        timeout: Duration,
    ) -> Result<Reply> {
        let pending = self.calls.register(connection, kind)?;
        if kind.is_command() {
            connection.note_issued(kind);
        }
        debug!("{}: sending {kind}", connection.device_id());
        let result = match connection.send(&request).await {
            Ok(()) => pending.wait(timeout).await,
            // dropping the pending call frees its slot
            Err(e) => Err(e),
        };
        if kind.is_command() {
            connection.forget_issued(kind);
        }
        result
    }
}

fn unexpected(kind: CallKind, reply: &Reply) -> GatewayError {
    GatewayError::Protocol(format!("unexpected reply to {kind}: {reply:?}"))
}
