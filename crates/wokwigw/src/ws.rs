//! Relay adapters for an upgraded axum WebSocket.
//!
//! Binary messages are the data path. Text messages are diagnostics from the simulator and are
//! only logged. Ping/pong is answered by axum itself.

use std::net::SocketAddr;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};

use crate::{
    relay::{FrameSink, FrameSource},
    RelayError,
};

pub struct WsSource {
    stream: SplitStream<WebSocket>,
    remote: SocketAddr,
}

pub struct WsSink {
    sink: SplitSink<WebSocket, Message>,
}

/// Split an upgraded socket into relay halves.
pub fn split(socket: WebSocket, remote: SocketAddr) -> (WsSource, WsSink) {
    let (sink, stream) = socket.split();
    (WsSource { stream, remote }, WsSink { sink })
}

#[async_trait]
impl FrameSource for WsSource {
    async fn recv(&mut self) -> Result<Option<Vec<u8>>, RelayError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Binary(frame))) => return Ok(Some(frame)),
                Some(Ok(Message::Text(text))) => {
                    tracing::info!(remote = %self.remote, "incoming message: {text:?}");
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Err(err)) => return Err(RelayError::WebSocket(err)),
            }
        }
    }
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), RelayError> {
        self.sink
            .send(Message::Binary(frame))
            .await
            .map_err(RelayError::WebSocket)
    }

    async fn close(&mut self) {
        let _ = self.sink.close().await;
    }
}
