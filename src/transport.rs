//! WebSocket transport to the console.
//!
//! The underlying sink is owned by a single writer task; everything that
//! needs to transmit (supervisor, heartbeat task, capture task) holds a
//! cloned [`Sender`] feeding it through an unbounded channel, so multi-byte
//! frames can never interleave. Only the supervisor receives.

use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("websocket error: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("connection closed")]
    Closed,
}

#[derive(Debug)]
pub(crate) enum Outbound {
    Binary(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

/// Cloneable handle for queueing outbound binary frames.
#[derive(Clone)]
pub struct Sender {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl Sender {
    /// Queue an encoded wire frame. Fails once the writer task has died,
    /// which is how senders observe a lost connection.
    pub fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        self.tx
            .send(Outbound::Binary(frame))
            .map_err(|_| TransportError::Closed)
    }

    #[cfg(test)]
    pub(crate) fn test_channel() -> (Sender, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Sender { tx }, rx)
    }
}

pub struct Transport {
    tx: mpsc::UnboundedSender<Outbound>,
    stream: futures_util::stream::SplitStream<WsStream>,
    writer: JoinHandle<()>,
}

impl Transport {
    /// Open the WebSocket and start the writer task.
    pub async fn connect(url: &str) -> Result<Transport, TransportError> {
        let (ws, _) = connect_async(url).await?;
        let (mut sink, stream) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();

        let writer = tokio::spawn(async move {
            while let Some(out) = rx.recv().await {
                let result = match out {
                    Outbound::Binary(bytes) => sink.send(WsMessage::Binary(bytes)).await,
                    Outbound::Pong(payload) => sink.send(WsMessage::Pong(payload)).await,
                    Outbound::Close => {
                        let _ = sink.send(WsMessage::Close(None)).await;
                        break;
                    }
                };
                if let Err(e) = result {
                    tracing::debug!("websocket send failed: {e}");
                    break;
                }
            }
        });

        Ok(Transport { tx, stream, writer })
    }

    pub fn sender(&self) -> Sender {
        Sender {
            tx: self.tx.clone(),
        }
    }

    /// Receive the next binary frame. Text frames are ignored, pings are
    /// answered through the writer queue.
    pub async fn recv(&mut self) -> Result<Vec<u8>, TransportError> {
        loop {
            match self.stream.next().await {
                Some(Ok(WsMessage::Binary(bytes))) => return Ok(bytes),
                Some(Ok(WsMessage::Ping(payload))) => {
                    let _ = self.tx.send(Outbound::Pong(payload));
                }
                Some(Ok(WsMessage::Close(_))) | None => return Err(TransportError::Closed),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }

    /// Attempt a normal close handshake, bounded so shutdown cannot hang.
    pub async fn close(self) {
        let _ = self.tx.send(Outbound::Close);
        let _ = tokio::time::timeout(Duration::from_secs(2), self.writer).await;
    }
}
