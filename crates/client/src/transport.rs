use async_trait::async_trait;
use coinpulse_core::SyncError;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

/// A frame received from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    /// Transport ping, already answered. Only proves the server is alive.
    Ping,
}

/// An open socket, reduced to text frames.
///
/// `incoming` ends when the remote side closes. Dropping `outgoing` closes
/// the socket.
pub struct Connection {
    pub outgoing: mpsc::Sender<String>,
    pub incoming: mpsc::Receiver<Frame>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Connection, SyncError>;
}

/// WebSocket transport over tokio-tungstenite.
pub struct WsConnector {
    buffer: usize,
}

impl WsConnector {
    pub fn new() -> Self {
        Self { buffer: 64 }
    }
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Connection, SyncError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| SyncError::ConnectionLost(format!("{}: {}", url, e)))?;
        debug!(url, "WebSocket connected");

        let (mut write, mut read) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<String>(self.buffer);
        let (in_tx, in_rx) = mpsc::channel::<Frame>(self.buffer);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = read.next() => match frame {
                        Some(Ok(Message::Text(text))) => {
                            if in_tx.send(Frame::Text(text)).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = write.send(Message::Pong(payload)).await;
                            // A full queue already holds proof of life.
                            let _ = in_tx.try_send(Frame::Ping);
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            debug!("WebSocket closed by server");
                            break;
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "WebSocket error");
                            break;
                        }
                        Some(Ok(_)) => {}
                    },
                    out = out_rx.recv() => match out {
                        Some(text) => {
                            if let Err(e) = write.send(Message::Text(text)).await {
                                warn!(error = %e, "WebSocket send failed");
                                break;
                            }
                        }
                        None => {
                            let _ = write.send(Message::Close(None)).await;
                            break;
                        }
                    },
                }
            }
        });

        Ok(Connection {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}
