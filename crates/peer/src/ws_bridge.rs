use crate::bridge::{BridgeEvent, UiCommand};
use crate::peer::Peer;
use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Relays [`BridgeEvent`]s to a UI over a WebSocket and feeds its
/// [`UiCommand`]s back to the peer.
pub struct WsBridge {
    pub url: String,
    pub peer: Arc<Peer>,
}

impl WsBridge {
    pub async fn run(
        self,
        mut events: mpsc::UnboundedReceiver<BridgeEvent>,
        mut shutdown: oneshot::Receiver<()>,
    ) -> Result<()> {
        info!("Starting WebSocket bridge to {}", self.url);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("WS bridge shutdown signal received");
                    break;
                }
                result = self.connect_and_process(&mut events) => {
                    if let Err(e) = result {
                        warn!(error = %e, "WS bridge error");
                    }
                    warn!("WS connection lost. Reconnecting in 5s...");
                }
            }

            // Nobody is listening while disconnected; the peer state is
            // re-posted on the next connect.
            let reconnect = sleep(RECONNECT_DELAY);
            tokio::pin!(reconnect);
            loop {
                tokio::select! {
                    _ = &mut reconnect => break,
                    _ = &mut shutdown => return Ok(()),
                    event = events.recv() => {
                        if event.is_none() {
                            return Ok(());
                        }
                    }
                }
            }
        }

        Ok(())
    }

    async fn connect_and_process(
        &self,
        events: &mut mpsc::UnboundedReceiver<BridgeEvent>,
    ) -> Result<()> {
        let (ws_stream, _) = connect_async(&self.url)
            .await
            .context("Failed to connect to UI")?;

        info!("Connected to UI at {}", self.url);
        let (mut write, mut read) = ws_stream.split();

        self.peer.post_multiaddrs();
        self.peer.post_pins();

        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else {
                        return Ok(());
                    };
                    let json = serde_json::to_string(&event)?;
                    write.send(Message::Text(json)).await?;
                }
                msg_opt = read.next() => {
                    let msg = match msg_opt {
                        Some(Ok(m)) => m,
                        _ => return Ok(()),
                    };

                    match msg {
                        Message::Text(text) => self.handle_command(&text),
                        Message::Ping(payload) => write.send(Message::Pong(payload)).await?,
                        Message::Close(_) => return Ok(()),
                        _ => {}
                    }
                }
            }
        }
    }

    fn handle_command(&self, text: &str) {
        match serde_json::from_str::<UiCommand>(text) {
            Ok(UiCommand::Unknown) => debug!(message = %text, "Ignoring unknown UI command"),
            Ok(command) => {
                let peer = self.peer.clone();
                tokio::spawn(async move { peer.dispatch(command).await });
            }
            Err(e) => debug!(error = %e, "Ignoring malformed UI command"),
        }
    }
}
