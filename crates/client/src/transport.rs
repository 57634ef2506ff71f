//! Socket transport for ticket push channels
//!
//! A connected socket is exposed to the multiplexer as a pair of text
//! channels. Dropping the outbound sender closes the socket; the inbound
//! receiver yields `None` once the far end has closed.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

use fleety_shared::{SubscriptionKey, WidgetError, WidgetResult};

/// Text frame pipes of one open socket
pub struct SocketLink {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<String>,
}

/// Opens push sockets for subscription keys
#[async_trait]
pub trait SocketConnector: Send + Sync + 'static {
    async fn connect(&self, key: &SubscriptionKey) -> WidgetResult<SocketLink>;
}

// =============================================================================
// WebSocket connector
// =============================================================================

/// Connector speaking WebSocket to the support backend
#[derive(Debug, Clone)]
pub struct TungsteniteConnector {
    ws_base: String,
    connect_timeout: Duration,
}

impl TungsteniteConnector {
    pub fn new(ws_base: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            ws_base: ws_base.into().trim_end_matches('/').to_string(),
            connect_timeout,
        }
    }

    /// Socket URL of one ticket channel
    pub fn channel_url(&self, key: &SubscriptionKey) -> String {
        format!(
            "{}/tickets/{}/{}/ws",
            self.ws_base, key.project_id, key.ticket_slug
        )
    }
}

#[async_trait]
impl SocketConnector for TungsteniteConnector {
    async fn connect(&self, key: &SubscriptionKey) -> WidgetResult<SocketLink> {
        let url = self.channel_url(key);
        debug!(url = %url, "Connecting to ticket channel");

        let (stream, _response) = tokio::time::timeout(self.connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| WidgetError::Transport(format!("Timed out connecting to {}", url)))?
            .map_err(WidgetError::transport)?;

        let (mut sink, mut source) = stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();

        let channel = key.to_string();
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    warn!(channel = %channel, error = %e, "Failed to send on ticket channel");
                    break;
                }
            }
            let _ = sink.send(Message::Close(None)).await;
            let _ = sink.close().await;
        });

        let channel = key.to_string();
        tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        if in_tx.send(text.as_str().to_owned()).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(channel = %channel, error = %e, "WebSocket error");
                        break;
                    }
                }
            }
        });

        Ok(SocketLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

// =============================================================================
// In-process connector
// =============================================================================

/// Connector whose sockets are in-process channels.
///
/// Used to drive push channels without a server: frames are injected with
/// [`MemoryConnector::push`] and server-side closes with
/// [`MemoryConnector::disconnect`].
#[derive(Default)]
pub struct MemoryConnector {
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    connects: HashMap<SubscriptionKey, usize>,
    peers: HashMap<SubscriptionKey, Vec<MemoryPeer>>,
    refuse_next: usize,
    refuse_all: bool,
}

struct MemoryPeer {
    to_client: mpsc::UnboundedSender<String>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Refuse every connection until called again with `false`
    pub fn refuse_all(&self, refuse: bool) {
        self.lock().refuse_all = refuse;
    }

    /// Refuse the next `count` connections
    pub fn refuse_next(&self, count: usize) {
        self.lock().refuse_next = count;
    }

    /// Connection attempts made for a key, refused ones included
    pub fn connect_count(&self, key: &SubscriptionKey) -> usize {
        self.lock().connects.get(key).copied().unwrap_or(0)
    }

    /// Sockets for a key whose client side is still attached
    pub fn open_connections(&self, key: &SubscriptionKey) -> usize {
        self.lock()
            .peers
            .get(key)
            .map(|peers| peers.iter().filter(|p| !p.to_client.is_closed()).count())
            .unwrap_or(0)
    }

    /// Deliver a text frame on the newest open socket for a key
    pub fn push(&self, key: &SubscriptionKey, text: impl Into<String>) -> bool {
        let state = self.lock();
        match state
            .peers
            .get(key)
            .and_then(|peers| peers.iter().rev().find(|p| !p.to_client.is_closed()))
        {
            Some(peer) => peer.to_client.send(text.into()).is_ok(),
            None => false,
        }
    }

    /// Close every socket for a key from the server side
    pub fn disconnect(&self, key: &SubscriptionKey) {
        self.lock().peers.remove(key);
    }

    /// Frames the client sent on any socket for a key
    pub fn received(&self, key: &SubscriptionKey) -> Vec<String> {
        let mut state = self.lock();
        let mut frames = Vec::new();
        if let Some(peers) = state.peers.get_mut(key) {
            for peer in peers.iter_mut() {
                while let Ok(text) = peer.from_client.try_recv() {
                    frames.push(text);
                }
            }
        }
        frames
    }
}

#[async_trait]
impl SocketConnector for MemoryConnector {
    async fn connect(&self, key: &SubscriptionKey) -> WidgetResult<SocketLink> {
        let mut state = self.lock();
        *state.connects.entry(key.clone()).or_insert(0) += 1;

        if state.refuse_all {
            return Err(WidgetError::Transport("connection refused".to_string()));
        }
        if state.refuse_next > 0 {
            state.refuse_next -= 1;
            return Err(WidgetError::Transport("connection refused".to_string()));
        }

        let (to_client, inbound) = mpsc::unbounded_channel();
        let (outbound, from_client) = mpsc::unbounded_channel();
        state.peers.entry(key.clone()).or_default().push(MemoryPeer {
            to_client,
            from_client,
        });

        Ok(SocketLink { outbound, inbound })
    }
}
