use std::collections::BTreeMap;

use bytes::{Bytes, BytesMut};
use log::{debug, error};
use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;

use crate::{
    codec::Chunk,
    error::{GatewayError, Result},
    models::DownloadedFile,
};

/// Reassembly state for one in-progress download. Chunks may arrive in any
/// order; a repeated index replaces the earlier payload.
#[derive(Debug)]
pub struct TransferSession {
    filename: String,
    declared_size: u64,
    chunks: BTreeMap<u32, Bytes>,
    received: u64,
}

impl TransferSession {
    pub fn new(filename: impl Into<String>, declared_size: u64) -> Self {
        Self {
            filename: filename.into(),
            declared_size,
            chunks: BTreeMap::new(),
            received: 0,
        }
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn declared_size(&self) -> u64 {
        self.declared_size
    }

    pub fn received_bytes(&self) -> u64 {
        self.received
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Returns true when the chunk replaced one with the same index.
    pub fn insert(&mut self, chunk: Chunk) -> bool {
        self.received += chunk.payload.len() as u64;
        match self.chunks.insert(chunk.index, chunk.payload) {
            Some(previous) => {
                self.received -= previous.len() as u64;
                true
            }
            None => false,
        }
    }

    /// Received bytes over the declared size, clamped to 0..=100.
    pub fn percent(&self) -> u8 {
        if self.declared_size == 0 {
            return 100;
        }
        let percent = self.received.saturating_mul(100) / self.declared_size;
        percent.min(100) as u8
    }

    /// Concatenates the chunks in index order. Indices must run 0, 1, 2, ...
    /// without holes.
    pub fn assemble(self) -> Result<DownloadedFile> {
        let mut data = BytesMut::with_capacity(self.received as usize);
        for (expected, (index, payload)) in self.chunks.iter().enumerate() {
            if *index as usize != expected {
                return Err(GatewayError::Protocol(format!(
                    "missing chunk {expected} of {}",
                    self.filename
                )));
            }
            data.extend_from_slice(payload);
        }

        Ok(DownloadedFile {
            filename: self.filename,
            data: data.freeze(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub device_id: String,
    pub filename: String,
    pub percent: u8,
    pub received: u64,
    pub total: u64,
}

/// Receives chunk progress. Implementations must not block; delivery failures
/// are theirs to swallow.
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, event: ProgressEvent);
}

/// Default sink, reports progress through the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn on_progress(&self, event: ProgressEvent) {
        debug!(
            "{}: {} at {}% ({}/{})",
            event.device_id, event.filename, event.percent, event.received, event.total
        );
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn on_progress(&self, _event: ProgressEvent) {}
}

impl ProgressSink for UnboundedSender<ProgressEvent> {
    fn on_progress(&self, event: ProgressEvent) {
        if let Err(e) = self.send(event) {
            error!("got error sending {:?} to progress listener", e.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tokio::sync::mpsc::unbounded_channel;

    fn chunk(index: u32, payload: &'static [u8]) -> Chunk {
        Chunk {
            index,
            payload: Bytes::from_static(payload),
        }
    }

    proptest! {
        #[test]
        fn assembly_ignores_arrival_order(order in Just(vec![0u32, 1, 2]).prop_shuffle()) {
            let parts: [&'static [u8]; 3] = [b"AA", b"B", b"CCC"];
            let mut session = TransferSession::new("x.bin", 6);
            for index in order {
                session.insert(chunk(index, parts[index as usize]));
            }
            prop_assert_eq!(session.percent(), 100);
            let file = session.assemble().unwrap();
            prop_assert_eq!(file.data.as_ref(), b"AABCCC");
        }

        #[test]
        fn percent_never_exceeds_hundred(declared in 0u64..64, sizes in proptest::collection::vec(1usize..32, 0..8)) {
            let mut session = TransferSession::new("x.bin", declared);
            for (i, size) in sizes.into_iter().enumerate() {
                session.insert(Chunk { index: i as u32, payload: Bytes::from(vec![0u8; size]) });
                prop_assert!(session.percent() <= 100);
            }
        }
    }

    #[test]
    fn duplicate_index_overwrites() {
        let mut session = TransferSession::new("a.txt", 4);
        assert!(!session.insert(chunk(0, b"xx")));
        assert!(session.insert(chunk(0, b"ab")));
        assert!(!session.insert(chunk(1, b"cd")));
        assert_eq!(session.received_bytes(), 4);
        assert_eq!(session.chunk_count(), 2);
        assert_eq!(session.assemble().unwrap().data.as_ref(), b"abcd");
    }

    #[test]
    fn gap_is_a_protocol_error() {
        let mut session = TransferSession::new("a.txt", 6);
        session.insert(chunk(0, b"ab"));
        session.insert(chunk(2, b"ef"));
        assert!(matches!(
            session.assemble(),
            Err(GatewayError::Protocol(msg)) if msg.contains("missing chunk 1")
        ));

        let mut session = TransferSession::new("a.txt", 2);
        session.insert(chunk(1, b"ab"));
        assert!(session.assemble().is_err());
    }

    #[test]
    fn percent_tracks_declared_size() {
        let mut session = TransferSession::new("a.txt", 10);
        assert_eq!(session.percent(), 0);
        session.insert(chunk(0, b"abcd"));
        assert_eq!(session.percent(), 40);
        session.insert(chunk(1, b"efghijklmnop"));
        assert_eq!(session.percent(), 100);

        assert_eq!(TransferSession::new("empty", 0).percent(), 100);
    }

    #[test]
    fn empty_transfer_assembles_to_nothing() {
        let file = TransferSession::new("empty.txt", 0).assemble().unwrap();
        assert_eq!(file.filename, "empty.txt");
        assert!(file.data.is_empty());
    }

    #[test]
    fn closed_channel_sink_does_not_panic() {
        let (tx, rx) = unbounded_channel();
        drop(rx);
        tx.on_progress(ProgressEvent {
            device_id: "esp-1".into(),
            filename: "a.txt".into(),
            percent: 50,
            received: 5,
            total: 10,
        });
    }

    #[test]
    fn log_sink_accepts_a_finished_transfer() {
        LogProgress.on_progress(ProgressEvent {
            device_id: "esp-1".into(),
            filename: "a.txt".into(),
            percent: 100,
            received: 10,
            total: 10,
        });
    }
}
