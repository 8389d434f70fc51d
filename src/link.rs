//! Message-oriented duplex transport between the gateway and one device.
//!
//! A [`Link`] is a bounded outbound queue plus an inbound stream of whole
//! frames. The WebSocket adapter owns the socket's write half on a dedicated
//! task; [`memory_pair`] gives tests a scripted device on the other end.

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures::{stream::BoxStream, SinkExt, StreamExt};
use log::{debug, trace};
use tokio::sync::mpsc;

use crate::codec;

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
    Close,
}

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("transport error: {0}")]
    Transport(String),
}

pub type FrameStream = BoxStream<'static, Result<Frame, LinkError>>;

pub struct Link {
    pub outbound: mpsc::Sender<Frame>,
    pub inbound: FrameStream,
}

/// Adapts an upgraded socket. Pings are answered by the socket layer and never
/// surface as frames.
pub fn websocket_link(socket: WebSocket, queue: usize) -> Link {
    let (mut sink, stream) = socket.split();
    let (outbound, mut rx) = mpsc::channel::<Frame>(queue);

    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let message = match frame {
                Frame::Text(text) => Message::Text(text),
                Frame::Binary(data) => Message::Binary(data.to_vec()),
                Frame::Close => Message::Close(None),
            };
            let closing = matches!(message, Message::Close(_));
            if let Err(e) = sink.send(message).await {
                debug!("websocket write failed: {e}");
                break;
            }
            if closing {
                break;
            }
        }
        let _ = sink.close().await;
        trace!("websocket writer finished");
    });

    let inbound = stream
        .filter_map(|message| async move {
            match message {
                Ok(Message::Text(text)) => Some(Ok(Frame::Text(text))),
                Ok(Message::Binary(data)) => Some(Ok(Frame::Binary(Bytes::from(data)))),
                Ok(Message::Close(_)) => Some(Ok(Frame::Close)),
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => None,
                Err(e) => Some(Err(LinkError::Transport(e.to_string()))),
            }
        })
        .boxed();

    Link { outbound, inbound }
}

/// In-process link: the gateway gets a [`Link`], the caller plays the device.
pub fn memory_pair(queue: usize) -> (Link, DeviceEnd) {
    let (outbound, from_gateway) = mpsc::channel(queue);
    let (to_gateway, inbound_rx) = mpsc::channel(queue);

    let inbound = futures::stream::unfold(inbound_rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    })
    .boxed();

    (
        Link { outbound, inbound },
        DeviceEnd {
            tx: to_gateway,
            rx: from_gateway,
        },
    )
}

/// Device side of a [`memory_pair`]. Dropping it ends the gateway's inbound
/// stream, which the gateway treats like a closed socket.
pub struct DeviceEnd {
    tx: mpsc::Sender<Result<Frame, LinkError>>,
    rx: mpsc::Receiver<Frame>,
}

impl DeviceEnd {
    pub async fn send_text(&self, text: impl Into<String>) -> bool {
        self.tx.send(Ok(Frame::Text(text.into()))).await.is_ok()
    }

    pub async fn send_json(&self, value: &serde_json::Value) -> bool {
        self.send_text(value.to_string()).await
    }

    pub async fn send_chunk(&self, index: u32, payload: &[u8]) -> bool {
        self.send_binary(codec::encode_chunk(index, payload)).await
    }

    pub async fn send_binary(&self, data: Bytes) -> bool {
        self.tx.send(Ok(Frame::Binary(data))).await.is_ok()
    }

    pub async fn close(&self) -> bool {
        self.tx.send(Ok(Frame::Close)).await.is_ok()
    }

    /// Injects a read failure into the gateway's inbound stream.
    pub async fn fail(&self, reason: &str) -> bool {
        self.tx
            .send(Err(LinkError::Transport(reason.to_string())))
            .await
            .is_ok()
    }

    /// Next frame the gateway sent, or `None` once the gateway dropped its sender.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    /// Next text frame decoded as JSON; binary and close frames are skipped.
    pub async fn recv_json(&mut self) -> Option<serde_json::Value> {
        loop {
            match self.rx.recv().await? {
                Frame::Text(text) => return serde_json::from_str(&text).ok(),
                other => trace!("device end skipping {other:?}"),
            }
        }
    }
}
