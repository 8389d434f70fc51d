//! Request correlation: one single-resolution slot per (device, request kind).

use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use log::trace;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;

use crate::{
    error::{GatewayError, Result},
    models::{Ack, DeviceStatus, DownloadedFile, FileEntry},
    registry::{Connection, ConnectionId},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallKind {
    Status,
    ListFiles,
    DeleteFile,
    DeleteAllFiles,
    Disconnect,
    File,
}

impl CallKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallKind::Status => "STATUS",
            CallKind::ListFiles => "LIST_FILES",
            CallKind::DeleteFile => "DELETE_FILE",
            CallKind::DeleteAllFiles => "DELETE_ALL_FILES",
            CallKind::Disconnect => "DISCONNECT",
            CallKind::File => "FILE",
        }
    }

    /// Kinds answered by a bare `success` envelope.
    pub fn is_command(&self) -> bool {
        matches!(
            self,
            CallKind::DeleteFile | CallKind::DeleteAllFiles | CallKind::Disconnect
        )
    }
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Value a pending call resolves with.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Status(DeviceStatus),
    Listing(Vec<FileEntry>),
    File(DownloadedFile),
    Ack(Ack),
}

struct Slot {
    ticket: u64,
    connection: ConnectionId,
    tx: oneshot::Sender<Result<Reply>>,
}

#[derive(Default)]
struct Inner {
    // device id -> kind -> slot
    slots: Mutex<HashMap<String, HashMap<CallKind, Slot>>>,
    next_ticket: AtomicU64,
}

#[derive(Clone, Default)]
pub struct CorrelationTable {
    inner: Arc<Inner>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a slot for `kind` on the connection's device.
    ///
    /// Fails with [`GatewayError::RequestInFlight`] when the device already has
    /// an outstanding call of that kind, and with
    /// [`GatewayError::ConnectionClosed`] once the connection is terminating.
    /// The closed check happens under the table lock, so a registration can
    /// never slip in behind [`fail_connection`](Self::fail_connection).
    pub fn register(&self, connection: &Connection, kind: CallKind) -> Result<PendingCall> {
        let device_id = connection.device_id();
        let (tx, rx) = oneshot::channel();
        let ticket = self.inner.next_ticket.fetch_add(1, Ordering::Relaxed);

        {
            let mut slots = self.inner.slots.lock();
            if connection.is_closed() {
                return Err(GatewayError::ConnectionClosed);
            }
            let device_slots = slots.entry(device_id.to_string()).or_default();
            if device_slots.contains_key(&kind) {
                return Err(GatewayError::RequestInFlight {
                    device: device_id.to_string(),
                    kind,
                });
            }
            device_slots.insert(
                kind,
                Slot {
                    ticket,
                    connection: connection.id(),
                    tx,
                },
            );
        }

        trace!("registered {kind} call for device {device_id}");
        Ok(PendingCall {
            table: self.clone(),
            device_id: device_id.to_string(),
            kind,
            ticket,
            rx,
        })
    }

    /// Completes the slot with `reply`. Returns false when nothing issued on
    /// `connection` was waiting; a newer connection's call is left alone.
    pub fn resolve(&self, connection: &Connection, kind: CallKind, reply: Reply) -> bool {
        self.complete(connection, kind, Ok(reply))
    }

    pub fn reject(&self, connection: &Connection, kind: CallKind, error: GatewayError) -> bool {
        self.complete(connection, kind, Err(error))
    }

    /// Rejects every outstanding call for the device. Returns how many were failed.
    pub fn fail_all<F>(&self, device_id: &str, error: F) -> usize
    where
        F: Fn() -> GatewayError,
    {
        let drained = self.inner.slots.lock().remove(device_id);
        let Some(drained) = drained else {
            return 0;
        };
        let count = drained.len();
        for (_, slot) in drained {
            let _ = slot.tx.send(Err(error()));
        }
        count
    }

    /// Rejects the outstanding calls that were issued on `connection`, leaving
    /// calls made on a newer connection for the same device untouched.
    pub fn fail_connection<F>(&self, connection: &Connection, error: F) -> usize
    where
        F: Fn() -> GatewayError,
    {
        let drained: Vec<Slot> = {
            let mut slots = self.inner.slots.lock();
            let Some(device_slots) = slots.get_mut(connection.device_id()) else {
                return 0;
            };
            let kinds: Vec<CallKind> = device_slots
                .iter()
                .filter(|(_, slot)| slot.connection == connection.id())
                .map(|(kind, _)| *kind)
                .collect();
            let drained = kinds
                .iter()
                .filter_map(|kind| device_slots.remove(kind))
                .collect();
            if device_slots.is_empty() {
                slots.remove(connection.device_id());
            }
            drained
        };

        let count = drained.len();
        for slot in drained {
            let _ = slot.tx.send(Err(error()));
        }
        count
    }

    pub fn is_pending(&self, device_id: &str, kind: CallKind) -> bool {
        self.inner
            .slots
            .lock()
            .get(device_id)
            .is_some_and(|device_slots| device_slots.contains_key(&kind))
    }

    pub fn pending_count(&self, device_id: &str) -> usize {
        self.inner
            .slots
            .lock()
            .get(device_id)
            .map_or(0, |device_slots| device_slots.len())
    }

    fn complete(&self, connection: &Connection, kind: CallKind, result: Result<Reply>) -> bool {
        let device_id = connection.device_id();
        let slot = {
            let mut slots = self.inner.slots.lock();
            let Some(device_slots) = slots.get_mut(device_id) else {
                return false;
            };
            let owned = device_slots
                .get(&kind)
                .is_some_and(|slot| slot.connection == connection.id());
            let slot = if owned { device_slots.remove(&kind) } else { None };
            if device_slots.is_empty() {
                slots.remove(device_id);
            }
            slot
        };

        match slot {
            // the receiver may have been dropped by a cancelled caller
            Some(slot) => slot.tx.send(result).is_ok(),
            None => {
                trace!("no {kind} call waiting for device {device_id}");
                false
            }
        }
    }

    // removes the slot only if it still belongs to `ticket`
    fn forget(&self, device_id: &str, kind: CallKind, ticket: u64) {
        let mut slots = self.inner.slots.lock();
        let Some(device_slots) = slots.get_mut(device_id) else {
            return;
        };
        if device_slots.get(&kind).is_some_and(|slot| slot.ticket == ticket) {
            device_slots.remove(&kind);
        }
        if device_slots.is_empty() {
            slots.remove(device_id);
        }
    }
}

/// Awaitable side of a registered slot. Dropping it before resolution
/// frees the slot so the kind can be requested again.
pub struct PendingCall {
    table: CorrelationTable,
    device_id: String,
    kind: CallKind,
    ticket: u64,
    rx: oneshot::Receiver<Result<Reply>>,
}

impl PendingCall {
    pub fn kind(&self) -> CallKind {
        self.kind
    }

    pub async fn wait(mut self, timeout: Duration) -> Result<Reply> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(GatewayError::ConnectionClosed),
            Err(_) => {
                self.table.forget(&self.device_id, self.kind, self.ticket);
                // a resolution that won the race against the timer still counts
                match self.rx.try_recv() {
                    Ok(result) => result,
                    Err(_) => Err(GatewayError::Timeout {
                        kind: self.kind,
                        after: timeout,
                    }),
                }
            }
        }
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        self.table.forget(&self.device_id, self.kind, self.ticket);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{link::memory_pair, registry::Connection};

    const WAIT: Duration = Duration::from_secs(5);

    fn connection(device_id: &str) -> Connection {
        let (link, _device) = memory_pair(8);
        Connection::new(device_id, link)
    }

    #[tokio::test]
    async fn resolve_completes_the_waiting_call() {
        let table = CorrelationTable::new();
        let conn = connection("esp-1");
        let call = table.register(&conn, CallKind::Status).unwrap();

        assert!(table.resolve(&conn, CallKind::Status, Reply::Status(DeviceStatus::default())));
        assert_eq!(
            call.wait(WAIT).await.unwrap(),
            Reply::Status(DeviceStatus::default())
        );
        assert_eq!(table.pending_count("esp-1"), 0);
    }

    #[tokio::test]
    async fn second_call_of_same_kind_is_refused() {
        let table = CorrelationTable::new();
        let conn = connection("esp-1");
        let first = table.register(&conn, CallKind::ListFiles).unwrap();

        let second = table.register(&conn, CallKind::ListFiles);
        assert!(matches!(
            second,
            Err(GatewayError::RequestInFlight {
                kind: CallKind::ListFiles,
                ..
            })
        ));

        // other kinds and other devices are independent
        let _status = table.register(&conn, CallKind::Status).unwrap();
        let _other = table.register(&connection("esp-2"), CallKind::ListFiles).unwrap();

        assert!(table.resolve(&conn, CallKind::ListFiles, Reply::Listing(vec![])));
        assert_eq!(first.wait(WAIT).await.unwrap(), Reply::Listing(vec![]));
    }

    #[tokio::test]
    async fn completions_without_a_slot_are_dropped() {
        let table = CorrelationTable::new();
        let conn = connection("esp-1");
        assert!(!table.resolve(&conn, CallKind::Status, Reply::Listing(vec![])));
        assert!(!table.reject(&conn, CallKind::Status, GatewayError::ConnectionClosed));

        let call = table.register(&conn, CallKind::Status).unwrap();
        assert!(table.reject(&conn, CallKind::Status, GatewayError::DeviceReported("x".into())));
        // the second completion is a no-op
        assert!(!table.resolve(&conn, CallKind::Status, Reply::Listing(vec![])));
        assert!(matches!(
            call.wait(WAIT).await,
            Err(GatewayError::DeviceReported(_))
        ));
    }

    #[tokio::test]
    async fn fail_all_rejects_everything_for_the_device() {
        let table = CorrelationTable::new();
        let conn = connection("esp-1");
        let other = connection("esp-2");
        let status = table.register(&conn, CallKind::Status).unwrap();
        let file = table.register(&conn, CallKind::File).unwrap();
        let untouched = table.register(&other, CallKind::Status).unwrap();

        assert_eq!(
            table.fail_all("esp-1", || GatewayError::DeviceReported("boom".into())),
            2
        );
        assert_eq!(table.pending_count("esp-1"), 0);
        assert!(matches!(status.wait(WAIT).await, Err(GatewayError::DeviceReported(_))));
        assert!(matches!(file.wait(WAIT).await, Err(GatewayError::DeviceReported(_))));
        assert!(table.is_pending("esp-2", CallKind::Status));
        drop(untouched);
        assert!(!table.is_pending("esp-2", CallKind::Status));
    }

    #[tokio::test]
    async fn fail_connection_spares_newer_connections() {
        let table = CorrelationTable::new();
        let old = connection("esp-1");
        let new = connection("esp-1");
        let stale = table.register(&old, CallKind::Status).unwrap();
        let fresh = table.register(&new, CallKind::ListFiles).unwrap();

        assert_eq!(table.fail_connection(&old, || GatewayError::ConnectionClosed), 1);
        assert!(matches!(stale.wait(WAIT).await, Err(GatewayError::ConnectionClosed)));
        assert!(table.is_pending("esp-1", CallKind::ListFiles));
        drop(fresh);
    }

    #[tokio::test]
    async fn replies_from_an_older_connection_are_not_delivered() {
        let table = CorrelationTable::new();
        let old = connection("esp-1");
        let new = connection("esp-1");
        let call = table.register(&new, CallKind::Status).unwrap();

        assert!(!table.resolve(&old, CallKind::Status, Reply::Listing(vec![])));
        assert!(!table.reject(&old, CallKind::Status, GatewayError::ConnectionClosed));
        assert!(table.is_pending("esp-1", CallKind::Status));

        assert!(table.resolve(&new, CallKind::Status, Reply::Status(DeviceStatus::default())));
        assert_eq!(
            call.wait(WAIT).await.unwrap(),
            Reply::Status(DeviceStatus::default())
        );
    }

    #[tokio::test]
    async fn closed_connection_refuses_registration() {
        let table = CorrelationTable::new();
        let conn = connection("esp-1");
        assert!(conn.mark_closed());
        assert!(matches!(
            table.register(&conn, CallKind::Status),
            Err(GatewayError::ConnectionClosed)
        ));
        assert_eq!(table.pending_count("esp-1"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_call_times_out_and_frees_the_slot() {
        let table = CorrelationTable::new();
        let conn = connection("esp-1");
        let call = table.register(&conn, CallKind::Status).unwrap();

        let result = call.wait(Duration::from_secs(30)).await;
        assert!(matches!(
            result,
            Err(GatewayError::Timeout {
                kind: CallKind::Status,
                ..
            })
        ));
        assert!(!table.is_pending("esp-1", CallKind::Status));
        assert!(table.register(&conn, CallKind::Status).is_ok());
    }

    #[tokio::test]
    async fn dropped_call_does_not_remove_its_successor() {
        let table = CorrelationTable::new();
        let conn = connection("esp-1");
        let first = table.register(&conn, CallKind::Status).unwrap();
        assert!(table.resolve(&conn, CallKind::Status, Reply::Listing(vec![])));

        let second = table.register(&conn, CallKind::Status).unwrap();
        drop(first);
        assert!(table.is_pending("esp-1", CallKind::Status));
        drop(second);
        assert!(!table.is_pending("esp-1", CallKind::Status));
    }
}
