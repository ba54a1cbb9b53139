/// WebSocket client transport
///
/// `PeerLink::connect_ws` opens a WebSocket to a sync hub and pumps it into
/// an ordinary `PeerLink`, so a `SyncBridge` runs over the network exactly as
/// it does in process. Outbound messages are written as JSON text frames;
/// inbound text frames are decoded, and undecodable ones are logged and
/// skipped. The link's inbound side closes when the socket does.
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::error::TransportError;
use crate::messages::SyncMessage;
use crate::sync::PeerLink;

impl PeerLink {
    /// Connect to a hub at `url` (for example `ws://127.0.0.1:8080/ws`)
    pub async fn connect_ws(url: &str) -> Result<PeerLink, TransportError> {
        let (socket, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        log::info!("Connected to sync hub at {}", url);

        let (mut sink, mut stream) = socket.split();
        let (outbound, mut to_hub) = mpsc::unbounded_channel::<SyncMessage>();
        let (from_hub, inbound) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(message) = to_hub.recv().await {
                let text = match message.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        log::error!("Failed to encode {}: {}", message.kind(), e);
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::text(text)).await {
                    log::debug!("Hub socket write failed: {}", e);
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let hub = url.to_string();
        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => match SyncMessage::from_json(text.as_str()) {
                        Ok(message) => {
                            if from_hub.send(message).is_err() {
                                break;
                            }
                        }
                        Err(e) => log::warn!("Dropping message from {}: {}", hub, e),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        log::warn!("Hub socket error: {}", e);
                        break;
                    }
                }
            }
            log::info!("Disconnected from sync hub at {}", hub);
        });

        Ok(PeerLink::new(outbound, inbound))
    }
}
