/// Message history: pagination, the transcript, and scroll anchoring
pub mod anchor;
pub mod paginator;
pub mod transcript;

pub use anchor::{NoopAnchor, ScrollAnchorController, ScrollAnchorHint, Viewport};
pub use paginator::{
    Cursor, CursorPaginator, HistoryQuery, HistoryResponse, HistorySource, HttpHistorySource,
    TranscriptPage,
};
pub use transcript::TranscriptStore;

use crate::error::Result;
use crate::protocol::{ChatMessage, SessionId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// History of one open room: seeds from the newest page, pulls older pages
/// on demand, and folds in live messages
pub struct RoomHistory {
    session: SessionId,
    paginator: Arc<CursorPaginator>,
    anchor: Arc<dyn ScrollAnchorController>,
    page_size: usize,
    store: Mutex<TranscriptStore>,
    loading: AtomicBool,
}

impl RoomHistory {
    pub fn new(
        session: SessionId,
        paginator: Arc<CursorPaginator>,
        anchor: Arc<dyn ScrollAnchorController>,
        page_size: usize,
    ) -> Self {
        Self {
            store: Mutex::new(TranscriptStore::new(session.clone())),
            session,
            paginator,
            anchor,
            page_size,
            loading: AtomicBool::new(false),
        }
    }

    fn store(&self) -> MutexGuard<'_, TranscriptStore> {
        self.store.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn session(&self) -> &SessionId {
        &self.session
    }

    /// Load the newest page. Live messages that arrived while the request was
    /// in flight are kept.
    pub async fn load_initial(&self) -> Result<usize> {
        let page = self
            .paginator
            .fetch_page(&self.session, None, self.page_size)
            .await?;
        let mut store = self.store();
        let arrived_meanwhile = store.snapshot();
        store.seed(page);
        for message in arrived_meanwhile {
            store.append(message);
        }
        Ok(store.len())
    }

    /// Fetch the next older page and pin the previous top. `Ok(None)` when
    /// there is nothing more to load or a load is already running.
    pub async fn load_older(&self) -> Result<Option<ScrollAnchorHint>> {
        let cursor = {
            let store = self.store();
            if !store.has_more() {
                return Ok(None);
            }
            store.oldest().map(Cursor::from_message)
        };
        if self.loading.swap(true, Ordering::SeqCst) {
            debug!("History {}: older page already loading", self.session);
            return Ok(None);
        }
        let _loading = LoadingFlag(&self.loading);

        let page = self
            .paginator
            .fetch_page(&self.session, cursor.as_ref(), self.page_size)
            .await?;
        let hint = self.store().prepend(page);
        if let Some(hint) = &hint {
            self.anchor.pin(&hint.anchor_message_id, hint.previous_offset_px);
        }
        Ok(hint)
    }

    /// Fold in a live message; `false` if it was a replay
    pub fn on_live(&self, message: ChatMessage) -> bool {
        self.store().append(message)
    }

    /// Fold in a server-pushed history batch
    pub fn on_batch(&self, messages: Vec<ChatMessage>) -> Option<ScrollAnchorHint> {
        let hint = self.store().merge_batch(messages);
        if let Some(hint) = &hint {
            self.anchor.pin(&hint.anchor_message_id, hint.previous_offset_px);
        }
        hint
    }

    pub fn observe_viewport(&self, viewport: Viewport) {
        self.store().observe_viewport(viewport);
    }

    pub fn snapshot(&self) -> Vec<ChatMessage> {
        self.store().snapshot()
    }

    pub fn has_more(&self) -> bool {
        self.store().has_more()
    }

    pub fn is_loading(&self) -> bool {
        self.loading.load(Ordering::SeqCst)
    }
}

struct LoadingFlag<'a>(&'a AtomicBool);

impl Drop for LoadingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
