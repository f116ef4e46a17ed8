/// Transport layer: one full-duplex text stream per session socket
use crate::auth::AccessToken;
use crate::error::{ChatError, Result};
use crate::protocol::SessionId;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

/// Something the transport reported
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Text(String),
    /// Remote closed the stream
    Closed(Option<String>),
    /// Network failure; the stream is unusable
    Error(String),
}

/// Channel pair bound to an open transport. Dropping `outbound` closes the
/// stream; `inbound` yields events until the stream ends.
pub struct TransportLink {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Opens transports for session sockets
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, session: &SessionId, token: Option<&AccessToken>) -> Result<TransportLink>;
}

/// WebSocket connector: `{server_url}/ws?sessionId={id}[&token=..]`
pub struct WebSocketConnector {
    server_url: String,
}

impl WebSocketConnector {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn url_for(&self, session: &SessionId, token: Option<&AccessToken>) -> String {
        let mut url = format!(
            "{}/ws?sessionId={}",
            self.server_url,
            urlencoding::encode(session.as_str())
        );
        if let Some(token) = token {
            url.push_str("&token=");
            url.push_str(&urlencoding::encode(&token.token));
        }
        url
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, session: &SessionId, token: Option<&AccessToken>) -> Result<TransportLink> {
        let url = self.url_for(session, token);
        debug!("Opening WebSocket for session {}", session);
        let (ws_stream, _) = connect_async(url.as_str()).await.map_err(|e| match e {
            // Covers wss:// when no TLS stack is compiled in
            WsError::Url(e) => ChatError::Config(format!("Unusable WebSocket url: {}", e)),
            e => ChatError::Transport(format!("WebSocket connect failed: {}", e)),
        })?;

        let (out_tx, out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<TransportEvent>();
        let label = session.clone();
        tokio::spawn(async move {
            pump_websocket(ws_stream, out_rx, in_tx).await;
            debug!("WebSocket pump for session {} finished", label);
        });

        Ok(TransportLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

/// Shuttle frames between the socket and the link channels until either side ends
async fn pump_websocket(
    ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut out_rx: mpsc::UnboundedReceiver<String>,
    in_tx: mpsc::UnboundedSender<TransportEvent>,
) {
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    loop {
        tokio::select! {
            outgoing = out_rx.recv() => match outgoing {
                Some(text) => {
                    if let Err(e) = ws_sender.send(WsMessage::Text(text)).await {
                        let _ = in_tx.send(TransportEvent::Error(e.to_string()));
                        break;
                    }
                }
                None => {
                    // Owner dropped the link
                    let _ = ws_sender.send(WsMessage::Close(None)).await;
                    break;
                }
            },
            incoming = ws_receiver.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    if in_tx.send(TransportEvent::Text(text)).is_err() {
                        let _ = ws_sender.send(WsMessage::Close(None)).await;
                        break;
                    }
                }
                Some(Ok(WsMessage::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => {
                        let _ = in_tx.send(TransportEvent::Text(text));
                    }
                    Err(_) => warn!("Dropping non UTF-8 binary frame"),
                },
                Some(Ok(WsMessage::Close(frame))) => {
                    let reason = frame.map(|f| f.reason.to_string());
                    let _ = in_tx.send(TransportEvent::Closed(reason));
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    let _ = in_tx.send(TransportEvent::Error(e.to_string()));
                    break;
                }
                None => {
                    let _ = in_tx.send(TransportEvent::Closed(None));
                    break;
                }
            },
        }
    }
}

/// Server half of an in-process transport
pub struct MemoryPeer {
    pub session: SessionId,
    pub token: Option<AccessToken>,
    /// Frames the client sent
    pub from_client: mpsc::UnboundedReceiver<String>,
    /// Push events to the client
    pub to_client: mpsc::UnboundedSender<TransportEvent>,
}

impl MemoryPeer {
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.to_client.send(TransportEvent::Text(text.into())).is_ok()
    }

    pub fn send_json(&self, value: &serde_json::Value) -> bool {
        self.send_text(value.to_string())
    }

    /// Simulate the server dropping the connection
    pub fn drop_connection(&self, reason: &str) {
        let _ = self.to_client.send(TransportEvent::Closed(Some(reason.to_string())));
    }

    pub async fn next_frame(&mut self) -> Option<String> {
        self.from_client.recv().await
    }
}

/// In-process connector: every `connect` hands a [`MemoryPeer`] to whoever
/// holds the accept side. Used by the test suite and for offline runs.
pub struct MemoryConnector {
    peers: mpsc::UnboundedSender<MemoryPeer>,
    refuse: AtomicU32,
    attempts: AtomicUsize,
    last_error: Mutex<Option<String>>,
}

impl MemoryConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MemoryPeer>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                peers: tx,
                refuse: AtomicU32::new(0),
                attempts: AtomicUsize::new(0),
                last_error: Mutex::new(None),
            },
            rx,
        )
    }

    /// Make the next `n` connect calls fail with a transport error
    pub fn refuse_next(&self, n: u32) {
        self.refuse.store(n, Ordering::SeqCst);
    }

    /// Total connect calls so far, refused ones included
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|e| e.clone())
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, session: &SessionId, token: Option<&AccessToken>) -> Result<TransportLink> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .refuse
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            let msg = format!("connection refused for {}", session);
            if let Ok(mut last) = self.last_error.lock() {
                *last = Some(msg.clone());
            }
            return Err(ChatError::Transport(msg));
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let peer = MemoryPeer {
            session: session.clone(),
            token: token.cloned(),
            from_client: out_rx,
            to_client: in_tx,
        };
        self.peers
            .send(peer)
            .map_err(|_| ChatError::Transport("memory server is gone".to_string()))?;
        Ok(TransportLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
