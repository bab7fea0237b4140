use async_trait::async_trait;
use courier_core::error::CoreError;
use courier_core::transport::{SocketChannels, SocketConnector};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

/// Opens relay websockets and bridges them onto a pair of text channels.
pub struct WsConnector {
    connect_timeout: Duration,
}

impl WsConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl SocketConnector for WsConnector {
    async fn connect(&self, url: &str) -> Result<SocketChannels, CoreError> {
        let (stream, _) = match timeout(self.connect_timeout, connect_async(url)).await {
            Ok(Ok(connected)) => connected,
            Ok(Err(err)) => return Err(CoreError::Transport(format!("{}: {}", url, err))),
            Err(_) => {
                return Err(CoreError::Timeout(format!(
                    "connect {} after {:?}",
                    url, self.connect_timeout
                )))
            }
        };
        log::info!("connected to relay {}", url);
        let (mut sink, mut source) = stream.split();
        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<String>();
        let (incoming_tx, incoming) = mpsc::unbounded_channel::<String>();

        let writer_url = url.to_string();
        tokio::spawn(async move {
            while let Some(text) = outgoing_rx.recv().await {
                if let Err(err) = sink.send(Message::Text(text)).await {
                    log::warn!("write to {} failed: {}", writer_url, err);
                    break;
                }
            }
            // Sender dropped: the engine is done with this socket.
            let _ = sink.close().await;
        });

        let reader_url = url.to_string();
        tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        if incoming_tx.send(text).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => {
                        log::info!("relay {} closed connection", reader_url);
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        log::warn!("websocket error from {}: {}", reader_url, err);
                        break;
                    }
                }
            }
            log::debug!("reader for {} finished", reader_url);
        });

        Ok(SocketChannels { outgoing, incoming })
    }
}
