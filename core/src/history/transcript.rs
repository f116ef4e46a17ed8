/// In-memory transcript of one open room
use crate::history::anchor::{ScrollAnchorHint, Viewport};
use crate::history::paginator::TranscriptPage;
use crate::protocol::{ChatMessage, MessageId, SessionId};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

type OrderKey = (DateTime<Utc>, MessageId);

/// Ordered, id-deduplicated message log. Iteration is always ascending by
/// (timestamp, id) no matter how entries arrived.
#[derive(Debug, Clone)]
pub struct TranscriptStore {
    session: SessionId,
    entries: BTreeMap<OrderKey, ChatMessage>,
    index: HashMap<MessageId, DateTime<Utc>>,
    has_more: bool,
    viewport: Option<Viewport>,
}

impl TranscriptStore {
    pub fn new(session: SessionId) -> Self {
        Self {
            session,
            entries: BTreeMap::new(),
            index: HashMap::new(),
            has_more: true,
            viewport: None,
        }
    }

    pub fn session(&self) -> &SessionId {
        &self.session
    }

    /// Replace all content with `page`
    pub fn seed(&mut self, page: TranscriptPage) {
        self.entries.clear();
        self.index.clear();
        self.viewport = None;
        self.has_more = page.has_more;
        let inserted = self.insert_all(page.messages);
        debug!("Transcript {} seeded with {} messages", self.session, inserted);
    }

    /// Merge an older page in front of the current content. Returns the
    /// anchor that was on top before the merge, if there was any content.
    pub fn prepend(&mut self, page: TranscriptPage) -> Option<ScrollAnchorHint> {
        let hint = self.current_anchor();
        self.has_more = page.has_more;
        let inserted = self.insert_all(page.messages);
        debug!("Transcript {}: prepended {} messages", self.session, inserted);
        hint
    }

    /// Insert one live message; `false` if it was already present
    pub fn append(&mut self, message: ChatMessage) -> bool {
        self.insert(message)
    }

    /// Merge a server-pushed batch. Yields a hint only when something landed
    /// above the previous top.
    pub fn merge_batch(&mut self, messages: Vec<ChatMessage>) -> Option<ScrollAnchorHint> {
        let hint = self.current_anchor();
        let top_before = self.entries.keys().next().cloned();
        let mut landed_above = false;
        for message in messages {
            let key = message.order_key();
            if self.insert(message) {
                if let Some(top) = &top_before {
                    landed_above |= &key < top;
                }
            }
        }
        if landed_above {
            hint
        } else {
            None
        }
    }

    /// Ordered copy of the transcript
    pub fn snapshot(&self) -> Vec<ChatMessage> {
        self.entries.values().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChatMessage> {
        self.entries.values()
    }

    /// Record what the user is looking at; the next prepend anchors on it
    pub fn observe_viewport(&mut self, viewport: Viewport) {
        self.viewport = Some(viewport);
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.index.contains_key(id)
    }

    pub fn oldest(&self) -> Option<&ChatMessage> {
        self.entries.values().next()
    }

    pub fn newest(&self) -> Option<&ChatMessage> {
        self.entries.values().next_back()
    }

    fn current_anchor(&self) -> Option<ScrollAnchorHint> {
        if let Some(viewport) = &self.viewport {
            if self.contains(&viewport.top_message_id) {
                return Some(ScrollAnchorHint {
                    anchor_message_id: viewport.top_message_id.clone(),
                    previous_offset_px: viewport.offset_px,
                });
            }
        }
        self.oldest().map(|m| ScrollAnchorHint {
            anchor_message_id: m.id.clone(),
            previous_offset_px: 0.0,
        })
    }

    fn insert_all(&mut self, messages: Vec<ChatMessage>) -> usize {
        let mut inserted = 0;
        for message in messages {
            if self.insert(message) {
                inserted += 1;
            }
        }
        inserted
    }

    fn insert(&mut self, message: ChatMessage) -> bool {
        if message.session_id != self.session {
            warn!(
                "Transcript {}: rejecting message {} from session {}",
                self.session, message.id, message.session_id
            );
            return false;
        }
        if self.index.contains_key(&message.id) {
            return false;
        }
        self.index.insert(message.id.clone(), message.timestamp);
        self.entries.insert(message.order_key(), message);
        true
    }
}
