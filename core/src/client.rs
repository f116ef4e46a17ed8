/// Top-level session lifecycle: wires rooms to connections and history
use crate::auth::{HttpTokenProvider, TokenProvider};
use crate::config::Config;
use crate::connection::{ConnectionManager, Connector, WebSocketConnector};
use crate::error::Result;
use crate::events::SessionEvent;
use crate::history::{
    CursorPaginator, HistorySource, HttpHistorySource, RoomHistory, ScrollAnchorController,
};
use crate::protocol::{OutgoingMessage, SessionId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{info, warn};

/// Owns the connection manager and every open room. Construct once per
/// logged-in user.
pub struct ChatClient {
    config: Config,
    manager: ConnectionManager,
    paginator: Arc<CursorPaginator>,
    rooms: Mutex<HashMap<SessionId, Arc<RoomHistory>>>,
}

impl ChatClient {
    pub fn new(
        config: Config,
        connector: Arc<dyn Connector>,
        tokens: Arc<dyn TokenProvider>,
        history: Arc<dyn HistorySource>,
    ) -> Self {
        let manager = ConnectionManager::new(&config, connector, tokens);
        let paginator = Arc::new(CursorPaginator::new(history, config.page_cooldown));
        Self {
            config,
            manager,
            paginator,
            rooms: Mutex::new(HashMap::new()),
        }
    }

    /// Client talking to the real relay and REST endpoints
    pub fn from_config(config: Config) -> Result<Self> {
        config.validate()?;
        let connector = Arc::new(WebSocketConnector::new(config.server_url.clone()));
        let tokens = Arc::new(HttpTokenProvider::new(
            config.api_url.clone(),
            config.user_token.clone(),
            config.connect_timeout,
        ));
        let history = Arc::new(HttpHistorySource::new(
            config.api_url.clone(),
            config.user_token.clone(),
            config.connect_timeout,
        ));
        Ok(Self::new(config, connector, tokens, history))
    }

    fn rooms(&self) -> MutexGuard<'_, HashMap<SessionId, Arc<RoomHistory>>> {
        self.rooms.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Open a room: connect its socket, route live traffic into its
    /// transcript, and load the newest page
    pub async fn open_room(
        &self,
        session: &SessionId,
        anchor: Arc<dyn ScrollAnchorController>,
    ) -> Result<Arc<RoomHistory>> {
        if let Some(room) = self.room(session) {
            self.manager.connect(session);
            return Ok(room);
        }

        let room = Arc::new(RoomHistory::new(
            session.clone(),
            self.paginator.clone(),
            anchor,
            self.config.page_size,
        ));
        self.rooms().insert(session.clone(), room.clone());

        let live = room.clone();
        self.manager.on_message(session, move |event| {
            if let SessionEvent::Message { message } = event {
                live.on_live(message.clone());
            }
        });
        let batches = room.clone();
        self.manager.on_history(session, move |event| {
            if let SessionEvent::History { messages, .. } = event {
                batches.on_batch(messages.clone());
            }
        });
        let label = session.clone();
        self.manager.on_state_change(session, move |event| {
            if let SessionEvent::Failed { reason } = event {
                warn!("Room {} disconnected: {}", label, reason);
            }
        });

        self.manager.connect(session);
        info!("Opened room {}", session);

        if let Err(e) = room.load_initial().await {
            warn!("Room {}: initial history load failed: {}", session, e);
            self.close_room(session);
            return Err(e);
        }
        Ok(room)
    }

    /// Close a room and discard its transcript
    pub fn close_room(&self, session: &SessionId) {
        self.manager.disconnect(session);
        if self.rooms().remove(session).is_some() {
            info!("Closed room {}", session);
        }
    }

    /// Close every room (application-wide logout)
    pub fn logout(&self) {
        self.manager.disconnect_all();
        self.rooms().clear();
    }

    pub fn room(&self, session: &SessionId) -> Option<Arc<RoomHistory>> {
        self.rooms().get(session).cloned()
    }

    pub fn send(&self, session: &SessionId, message: OutgoingMessage) -> Result<()> {
        self.manager.send(session, message)
    }
}
