//! Per-device receive loop: the only reader of a device's socket.

use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use log::{debug, info, trace, warn};

use crate::{
    codec::{self, Envelope, Inbound, Request},
    correlation::{CallKind, Reply},
    error::{GatewayError, Result},
    link::{Frame, FrameStream, Link},
    models::Ack,
    registry::Connection,
    transfer::{ProgressEvent, TransferSession},
    Gateway,
};

impl Gateway {
    /// Registers a freshly accepted link under `device_id` and starts its
    /// receive loop. A previous connection for the same id is torn down.
    pub fn accept(&self, device_id: &str, link: Link) -> Arc<Connection> {
        let (connection, replaced) = self.registry.add(device_id, link);
        info!("device {device_id} connected as {}", connection.id());

        if let Some(old) = replaced {
            warn!(
                "device {device_id} reconnected, evicting connection {}",
                old.id()
            );
            self.terminate(&old, "replaced by a newer connection");
        }

        self.start_receive_loop(&connection);
        connection
    }

    /// Spawns the receive loop for `connection`. Returns false if one was
    /// already started; a handle never gets a second reader.
    pub fn start_receive_loop(&self, connection: &Arc<Connection>) -> bool {
        let Some(inbound) = connection.take_inbound() else {
            debug!(
                "receive loop for {} already started",
                connection.device_id()
            );
            return false;
        };

        let gateway = self.clone();
        let connection = connection.clone();
        tokio::spawn(async move { gateway.receive_loop(connection, inbound).await });
        true
    }

    /// Tears down `connection` once: fails its pending calls, drops it from the
    /// registry if still current and stops its loop. Later calls are no-ops.
    pub(crate) fn terminate(&self, connection: &Connection, reason: &str) {
        if !connection.mark_closed() {
            return;
        }
        let device_id = connection.device_id();

        connection.signal_shutdown();
        connection.close_socket();
        let was_current = self.registry.remove_if_current(connection);
        let failed = self
            .calls
            .fail_connection(connection, || GatewayError::ConnectionClosed);

        info!(
            "device {device_id} ({}) disconnected: {reason}; failed {failed} pending call(s)",
            connection.id()
        );
        if !was_current {
            trace!("{} was no longer the registered handle", connection.id());
        }
    }

    async fn receive_loop(self, connection: Arc<Connection>, mut inbound: FrameStream) {
        let device_id = connection.device_id().to_string();
        let mut shutdown = connection.shutdown_signal();
        let mut transfer: Option<TransferSession> = None;
        debug!("receive loop for {device_id} started");

        let reason = loop {
            let frame = tokio::select! {
                biased;
                _ = shutdown.wait_for(|closed| *closed) => break "closed locally".to_string(),
                frame = inbound.next() => frame,
            };
            // evicted while the read was in flight; the frame belongs to nobody
            if connection.is_closed() {
                break "closed locally".to_string();
            }

            let outcome = match frame {
                None => break "socket closed".to_string(),
                Some(Err(e)) => break format!("read error: {e}"),
                Some(Ok(Frame::Close)) => break "close frame received".to_string(),
                Some(Ok(Frame::Text(text))) => {
                    self.handle_text(&connection, &text, &mut transfer).await
                }
                Some(Ok(Frame::Binary(data))) => {
                    self.handle_binary(&connection, data, &mut transfer);
                    Ok(())
                }
            };

            if let Err(e) = outcome {
                break format!("write failed: {e}");
            }
        };

        if let Some(session) = transfer.take() {
            warn!(
                "{device_id}: discarding transfer of {} after {} of {} bytes",
                session.filename(),
                session.received_bytes(),
                session.declared_size()
            );
        }
        self.terminate(&connection, &reason);
        debug!("receive loop for {device_id} finished");
    }

    // Err only when the connection can no longer be written to.
    async fn handle_text(
        &self,
        connection: &Connection,
        text: &str,
        transfer: &mut Option<TransferSession>,
    ) -> Result<()> {
        let device_id = connection.device_id();
        trace!("<- {device_id}: {text}");

        let inbound = match codec::decode_text(text) {
            Ok(inbound) => inbound,
            Err(e) => {
                warn!("{device_id}: ignoring frame: {e}");
                return Ok(());
            }
        };

        let envelope = match inbound {
            Inbound::Listing(files) => {
                debug!("{device_id}: listing with {} file(s)", files.len());
                connection.set_files(files.clone());
                if !self
                    .calls
                    .resolve(connection, CallKind::ListFiles, Reply::Listing(files))
                {
                    debug!("{device_id}: unsolicited listing cached");
                }
                return Ok(());
            }
            Inbound::Envelope(envelope) => envelope,
        };

        match envelope {
            Envelope::Status(status) => {
                connection.set_status(status.clone());
                self.calls
                    .resolve(connection, CallKind::Status, Reply::Status(status));
            }
            Envelope::Error { message } => {
                warn!("{device_id} reported an error: {message}");
                if let Some(session) = transfer.take() {
                    debug!("{device_id}: aborting transfer of {}", session.filename());
                }
                let failed = self
                    .calls
                    .fail_connection(connection, || GatewayError::DeviceReported(message.clone()));
                debug!("{device_id}: failed {failed} pending call(s)");
            }
            Envelope::Success { message } => {
                let ack = Ack {
                    success: true,
                    message,
                };
                self.resolve_latest_command(connection, ack);
            }
            Envelope::CommandAck { kind, ack } => {
                connection.forget_issued(kind);
                if !self.calls.resolve(connection, kind, Reply::Ack(ack)) {
                    warn!("{device_id}: late {kind} ack dropped");
                }
            }
            Envelope::FileStart { filename, size } => {
                info!("{device_id}: receiving {filename} ({size} bytes)");
                let session = TransferSession::new(filename, size);
                if let Some(previous) = transfer.replace(session) {
                    warn!(
                        "{device_id}: FILE_START while {} was in progress, dropping it",
                        previous.filename()
                    );
                }
                connection.send(&Request::FileStartAck).await?;
            }
            Envelope::FileEnd => return self.finish_transfer(connection, transfer.take()).await,
            Envelope::Unknown => debug!("{device_id}: ignoring unknown envelope"),
        }
        Ok(())
    }

    // a bare `success` answers the newest delete/disconnect still waiting
    fn resolve_latest_command(&self, connection: &Connection, ack: Ack) {
        let device_id = connection.device_id();
        for kind in connection.issued_newest_first() {
            connection.forget_issued(kind);
            if self.calls.resolve(connection, kind, Reply::Ack(ack.clone())) {
                return;
            }
        }
        warn!("{device_id}: success with nothing waiting");
    }

    async fn finish_transfer(
        &self,
        connection: &Connection,
        session: Option<TransferSession>,
    ) -> Result<()> {
        let device_id = connection.device_id();
        let Some(session) = session else {
            warn!("{device_id}: FILE_END without FILE_START");
            self.calls.reject(
                connection,
                CallKind::File,
                GatewayError::Protocol("FILE_END without FILE_START".into()),
            );
            return Ok(());
        };

        let declared = session.declared_size();
        match session.assemble() {
            Ok(file) => {
                if file.data.len() as u64 != declared {
                    warn!(
                        "{device_id}: {} assembled to {} bytes, device announced {declared}",
                        file.filename,
                        file.data.len()
                    );
                }
                let file_id = connection.completion_id(&file.filename);
                let acked = connection.send(&Request::Complete { file_id }).await;
                info!("{device_id}: received {}", file.filename);
                let filename = file.filename.clone();
                if !self
                    .calls
                    .resolve(connection, CallKind::File, Reply::File(file))
                {
                    warn!("{device_id}: nobody waiting for {filename}");
                }
                acked
            }
            Err(e) => {
                warn!("{device_id}: transfer failed: {e}");
                self.calls.reject(connection, CallKind::File, e);
                Ok(())
            }
        }
    }

    fn handle_binary(
        &self,
        connection: &Connection,
        data: Bytes,
        transfer: &mut Option<TransferSession>,
    ) {
        let device_id = connection.device_id();
        let Some(chunk) = codec::decode_binary(data) else {
            trace!("{device_id}: ignoring empty binary frame");
            return;
        };
        let Some(session) = transfer.as_mut() else {
            warn!("{device_id}: chunk {} outside of a transfer", chunk.index);
            return;
        };

        if session.insert(chunk) {
            debug!("{device_id}: duplicate chunk overwritten");
        }
        self.progress.on_progress(ProgressEvent {
            device_id: device_id.to_string(),
            filename: session.filename().to_string(),
            percent: session.percent(),
            received: session.received_bytes(),
            total: session.declared_size(),
        });
    }
}
