/// Connection manager: one session socket per active session
use crate::auth::TokenProvider;
use crate::config::Config;
use crate::connection::socket::{
    ConnectionState, SessionSocket, SocketCommand, SocketObserver, SocketSettings,
};
use crate::connection::transport::Connector;
use crate::error::{ChatError, Result};
use crate::events::{EventHandler, FailureReason, SessionEvent};
use crate::protocol::{ClientFrame, InboundEnvelope, OutgoingMessage, SessionId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Bookkeeping for the socket currently installed under a session id
struct SocketEntry {
    instance: Uuid,
    state: ConnectionState,
    /// Present only while Open
    outbound: Option<mpsc::UnboundedSender<String>>,
    control: mpsc::Sender<SocketCommand>,
    state_tx: watch::Sender<ConnectionState>,
    _task: JoinHandle<()>,
}

#[derive(Default, Clone)]
struct SessionHandlers {
    message: Vec<EventHandler>,
    history: Vec<EventHandler>,
    state: Vec<EventHandler>,
}

struct Shared {
    settings: SocketSettings,
    connector: Arc<dyn Connector>,
    tokens: Arc<dyn TokenProvider>,
    sockets: Mutex<HashMap<SessionId, SocketEntry>>,
    handlers: Mutex<HashMap<SessionId, SessionHandlers>>,
}

impl Shared {
    fn sockets(&self) -> MutexGuard<'_, HashMap<SessionId, SocketEntry>> {
        self.sockets.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn handlers(&self) -> MutexGuard<'_, HashMap<SessionId, SessionHandlers>> {
        self.handlers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_current(&self, session: &SessionId, instance: Uuid) -> bool {
        self.sockets()
            .get(session)
            .map(|e| e.instance == instance)
            .unwrap_or(false)
    }

    fn handlers_for(&self, session: &SessionId) -> SessionHandlers {
        self.handlers().get(session).cloned().unwrap_or_default()
    }
}

/// Adapter handed to socket drivers; holds the shared state weakly so a
/// lingering driver never keeps a dropped manager alive
struct ManagerObserver {
    shared: std::sync::Weak<Shared>,
}

impl SocketObserver for ManagerObserver {
    fn on_transition(
        &self,
        session: &SessionId,
        instance: Uuid,
        state: ConnectionState,
        outbound: Option<mpsc::UnboundedSender<String>>,
    ) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };
        {
            let mut sockets = shared.sockets();
            match sockets.get_mut(session) {
                Some(entry) if entry.instance == instance => {
                    entry.state = state;
                    entry.outbound = outbound;
                    entry.state_tx.send_replace(state);
                }
                _ => return false,
            }
        }

        let event = SessionEvent::StateChanged { state };
        for handler in shared.handlers_for(session).state {
            handler(&event);
        }
        true
    }

    fn on_envelope(&self, session: &SessionId, instance: Uuid, envelope: InboundEnvelope) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        if !shared.is_current(session, instance) {
            return;
        }
        let handlers = shared.handlers_for(session);
        match envelope {
            InboundEnvelope::Message(message) => {
                if &message.session_id != session {
                    warn!(
                        "Session {}: dropping message {} addressed to {}",
                        session, message.id, message.session_id
                    );
                    return;
                }
                let event = SessionEvent::Message { message };
                for handler in &handlers.message {
                    handler(&event);
                }
            }
            InboundEnvelope::HistoryBatch { messages, has_more } => {
                let event = SessionEvent::History { messages, has_more };
                for handler in &handlers.history {
                    handler(&event);
                }
            }
            other => debug!("Session {}: unrouted {}", session, other),
        }
    }

    fn on_failed(&self, session: &SessionId, instance: Uuid, reason: FailureReason) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        if !shared.is_current(session, instance) {
            return;
        }
        let handlers = shared.handlers_for(session);
        let event = SessionEvent::Failed { reason };
        for handler in handlers
            .message
            .iter()
            .chain(handlers.history.iter())
            .chain(handlers.state.iter())
        {
            handler(&event);
        }
    }
}

/// Owns the session-id -> socket map. Construct one per application and
/// pass clones to whoever needs it; clones share the same sessions.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    pub fn new(config: &Config, connector: Arc<dyn Connector>, tokens: Arc<dyn TokenProvider>) -> Self {
        let settings = SocketSettings {
            backoff: config.backoff(),
            max_attempts: config.max_reconnect_attempts,
            auth_timeout: config.auth_timeout,
            connect_timeout: config.connect_timeout,
        };
        Self {
            shared: Arc::new(Shared {
                settings,
                connector,
                tokens,
                sockets: Mutex::new(HashMap::new()),
                handlers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Ensure a socket is running for `session`. Returns `false` when a live
    /// socket already exists and nothing was started.
    pub fn connect(&self, session: &SessionId) -> bool {
        let mut sockets = self.shared.sockets();
        if let Some(entry) = sockets.get(session) {
            if entry.state.is_live() {
                debug!("Session {} already has socket {}", session, entry.instance);
                return false;
            }
        }
        let entry = self.spawn_socket(session);
        info!("Session {}: starting socket {}", session, entry.instance);
        sockets.insert(session.clone(), entry);
        true
    }

    /// Replace any socket for `session` with a fresh instance; handlers stay registered
    pub fn reconnect(&self, session: &SessionId) {
        let mut sockets = self.shared.sockets();
        if let Some(old) = sockets.remove(session) {
            let _ = old.control.try_send(SocketCommand::Close);
        }
        let entry = self.spawn_socket(session);
        info!("Session {}: manual reconnect with socket {}", session, entry.instance);
        sockets.insert(session.clone(), entry);
    }

    /// Tear down the socket and forget every handler for `session`
    pub fn disconnect(&self, session: &SessionId) {
        let removed = self.shared.sockets().remove(session);
        self.shared.handlers().remove(session);
        if let Some(entry) = removed {
            info!("Session {}: disconnecting socket {}", session, entry.instance);
            let _ = entry.control.try_send(SocketCommand::Close);
            entry.state_tx.send_replace(ConnectionState::Idle);
        }
    }

    /// Disconnect every tracked session (application-wide logout)
    pub fn disconnect_all(&self) {
        let sessions = self.sessions();
        for session in &sessions {
            self.disconnect(session);
        }
        self.shared.handlers().clear();
        info!("Disconnected {} sessions", sessions.len());
    }

    /// Post a message on an open session
    pub fn send(&self, session: &SessionId, message: OutgoingMessage) -> Result<()> {
        let outbound = {
            let sockets = self.shared.sockets();
            match sockets.get(session) {
                Some(entry) if entry.state == ConnectionState::Open => entry.outbound.clone(),
                _ => None,
            }
        };
        let Some(outbound) = outbound else {
            return Err(ChatError::NotConnected(session.clone()));
        };
        let frame = ClientFrame::from(message).encode()?;
        outbound
            .send(frame)
            .map_err(|_| ChatError::Transport(format!("session {} transport closed", session)))
    }

    pub fn on_message<F>(&self, session: &SessionId, handler: F)
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.shared
            .handlers()
            .entry(session.clone())
            .or_default()
            .message
            .push(Arc::new(handler));
    }

    pub fn on_history<F>(&self, session: &SessionId, handler: F)
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.shared
            .handlers()
            .entry(session.clone())
            .or_default()
            .history
            .push(Arc::new(handler));
    }

    pub fn on_state_change<F>(&self, session: &SessionId, handler: F)
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.shared
            .handlers()
            .entry(session.clone())
            .or_default()
            .state
            .push(Arc::new(handler));
    }

    pub fn state(&self, session: &SessionId) -> Option<ConnectionState> {
        self.shared.sockets().get(session).map(|e| e.state)
    }

    /// Identity of the socket currently installed for `session`
    pub fn socket_instance(&self, session: &SessionId) -> Option<Uuid> {
        self.shared.sockets().get(session).map(|e| e.instance)
    }

    pub fn sessions(&self) -> Vec<SessionId> {
        self.shared.sockets().keys().cloned().collect()
    }

    /// Wait until `session` is Open. Fails if the socket fails, is removed,
    /// or `limit` elapses first.
    pub async fn wait_open(&self, session: &SessionId, limit: Duration) -> Result<()> {
        let mut rx = {
            let sockets = self.shared.sockets();
            match sockets.get(session) {
                Some(entry) => entry.state_tx.subscribe(),
                None => return Err(ChatError::NotConnected(session.clone())),
            }
        };

        let wait = async {
            loop {
                let state = *rx.borrow_and_update();
                match state {
                    ConnectionState::Open => return Ok(()),
                    ConnectionState::Failed => {
                        return Err(ChatError::Transport(format!("session {} failed", session)))
                    }
                    _ => {}
                }
                if rx.changed().await.is_err() {
                    return Err(ChatError::NotConnected(session.clone()));
                }
            }
        };
        tokio::time::timeout(limit, wait)
            .await
            .map_err(|_| ChatError::Timeout(format!("session {} did not open", session)))?
    }

    fn spawn_socket(&self, session: &SessionId) -> SocketEntry {
        let instance = Uuid::new_v4();
        let (control_tx, control_rx) = mpsc::channel(1);
        // The driver's first transition is Idle -> Connecting; record it up
        // front so a second connect() in the meantime sees a live socket
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        let observer = Arc::new(ManagerObserver {
            shared: Arc::downgrade(&self.shared),
        });
        let socket = SessionSocket::new(
            session.clone(),
            instance,
            self.shared.settings,
            self.shared.connector.clone(),
            self.shared.tokens.clone(),
            observer,
            control_rx,
        );
        let task = tokio::spawn(socket.run());
        SocketEntry {
            instance,
            state: ConnectionState::Connecting,
            outbound: None,
            control: control_tx,
            state_tx,
            _task: task,
        }
    }
}
