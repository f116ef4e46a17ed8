/// Backward cursor pagination over a room's history
use crate::error::{ChatError, Result};
use crate::http::JsonClient;
use crate::protocol::{ChatMessage, MessageId, SessionId};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Points just past the oldest message already loaded
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Cursor {
    timestamp: DateTime<Utc>,
    message_id: MessageId,
}

impl Cursor {
    pub fn from_message(message: &ChatMessage) -> Self {
        Self {
            timestamp: message.timestamp,
            message_id: message.id.clone(),
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Query-string form understood by the history endpoint
    pub fn as_param(&self) -> String {
        self.timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true)
    }

    fn admits(&self, message: &ChatMessage) -> bool {
        (message.timestamp, &message.id) < (self.timestamp, &self.message_id)
    }
}

/// One page of history, oldest message first
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptPage {
    pub messages: Vec<ChatMessage>,
    pub has_more: bool,
    pub next_cursor: Option<Cursor>,
}

impl TranscriptPage {
    /// Build a page from messages in any order
    pub fn new(mut messages: Vec<ChatMessage>, has_more: bool) -> Self {
        messages.sort_by(|a, b| (a.timestamp, &a.id).cmp(&(b.timestamp, &b.id)));
        let mut seen = HashSet::new();
        messages.retain(|m| seen.insert(m.id.clone()));
        let next_cursor = messages.first().map(Cursor::from_message);
        Self {
            messages,
            has_more,
            next_cursor,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HistoryQuery {
    pub session: SessionId,
    pub before: Option<Cursor>,
    pub limit: usize,
}

/// Raw answer of the paged-query endpoint
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryResponse {
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default, alias = "hasMore")]
    pub has_more: Option<bool>,
}

/// The external paged-query endpoint
#[async_trait]
pub trait HistorySource: Send + Sync {
    async fn fetch(&self, query: &HistoryQuery) -> Result<HistoryResponse>;
}

/// `GET {api}/api/sessions/{id}/messages?limit=N[&before=T]`
pub struct HttpHistorySource {
    client: JsonClient,
    api_url: String,
    user_token: Option<String>,
}

impl HttpHistorySource {
    pub fn new(api_url: impl Into<String>, user_token: Option<String>, timeout: Duration) -> Self {
        Self {
            client: JsonClient::new(timeout),
            api_url: api_url.into().trim_end_matches('/').to_string(),
            user_token,
        }
    }

    pub fn url_for(&self, query: &HistoryQuery) -> String {
        let mut url = format!(
            "{}/api/sessions/{}/messages?limit={}",
            self.api_url,
            urlencoding::encode(query.session.as_str()),
            query.limit
        );
        if let Some(before) = &query.before {
            url.push_str("&before=");
            url.push_str(&urlencoding::encode(&before.as_param()));
        }
        url
    }
}

#[async_trait]
impl HistorySource for HttpHistorySource {
    async fn fetch(&self, query: &HistoryQuery) -> Result<HistoryResponse> {
        let url = self.url_for(query);
        self.client.get_json(&url, self.user_token.as_deref()).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RequestKey {
    before: Option<Cursor>,
    limit: usize,
}

type Waiter = oneshot::Sender<Result<TranscriptPage>>;

struct Completed {
    key: RequestKey,
    at: Instant,
    page: TranscriptPage,
}

#[derive(Default)]
struct PagerState {
    in_flight: HashMap<RequestKey, Vec<Waiter>>,
    last: Option<Completed>,
}

/// Fetches history pages. Concurrent calls for the same cursor share one
/// round-trip, and requests inside the cooldown after a completed fetch are
/// answered from that fetch or refused.
pub struct CursorPaginator {
    source: Arc<dyn HistorySource>,
    cooldown: Duration,
    sessions: Mutex<HashMap<SessionId, PagerState>>,
}

enum Role {
    Leader,
    Follower(oneshot::Receiver<Result<TranscriptPage>>),
}

impl CursorPaginator {
    pub fn new(source: Arc<dyn HistorySource>, cooldown: Duration) -> Self {
        Self {
            source,
            cooldown,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<SessionId, PagerState>> {
        self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fetch `page_size` messages strictly older than `before`, or the newest
    /// page when `before` is `None`
    pub async fn fetch_page(
        &self,
        session: &SessionId,
        before: Option<&Cursor>,
        page_size: usize,
    ) -> Result<TranscriptPage> {
        if page_size == 0 {
            return Err(ChatError::History("page size must be at least 1".to_string()));
        }
        let key = RequestKey {
            before: before.cloned(),
            limit: page_size,
        };

        let role = {
            let mut sessions = self.sessions();
            let state = sessions.entry(session.clone()).or_default();
            if let Some(waiters) = state.in_flight.get_mut(&key) {
                let (tx, rx) = oneshot::channel();
                waiters.push(tx);
                Role::Follower(rx)
            } else {
                if let Some(last) = &state.last {
                    if last.at.elapsed() < self.cooldown {
                        if last.key == key {
                            debug!("History {}: serving cached page inside cooldown", session);
                            return Ok(last.page.clone());
                        }
                        return Err(ChatError::RateLimited);
                    }
                }
                state.in_flight.insert(key.clone(), Vec::new());
                Role::Leader
            }
        };

        if let Role::Follower(rx) = role {
            debug!("History {}: joining in-flight request", session);
            return match rx.await {
                Ok(shared) => shared,
                Err(_) => Err(ChatError::History("shared request was abandoned".to_string())),
            };
        }

        let mut guard = InFlightGuard {
            paginator: self,
            session,
            key: Some(key.clone()),
        };

        let query = HistoryQuery {
            session: session.clone(),
            before: key.before.clone(),
            limit: page_size,
        };
        let result = self
            .source
            .fetch(&query)
            .await
            .map(|response| build_page(&query, response));

        let waiters = guard.finish(result.as_ref().ok());
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
        if let Err(e) = &result {
            warn!("History {}: fetch failed: {}", session, e);
        }
        result
    }
}

/// Clears the in-flight slot even if the leading call is dropped mid-fetch
struct InFlightGuard<'a> {
    paginator: &'a CursorPaginator,
    session: &'a SessionId,
    key: Option<RequestKey>,
}

impl InFlightGuard<'_> {
    fn finish(&mut self, page: Option<&TranscriptPage>) -> Vec<Waiter> {
        let Some(key) = self.key.take() else {
            return Vec::new();
        };
        let mut sessions = self.paginator.sessions();
        let Some(state) = sessions.get_mut(self.session) else {
            return Vec::new();
        };
        let waiters = state.in_flight.remove(&key).unwrap_or_default();
        if let Some(page) = page {
            state.last = Some(Completed {
                key,
                at: Instant::now(),
                page: page.clone(),
            });
        }
        waiters
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        // Dropping the waiters wakes followers with an error
        let _ = self.finish(None);
    }
}

fn build_page(query: &HistoryQuery, response: HistoryResponse) -> TranscriptPage {
    let delivered = response.messages.len().min(query.limit);
    let exhausted = response.has_more == Some(false);
    let has_more = delivered == query.limit && !exhausted;

    let admitted: Vec<ChatMessage> = response
        .messages
        .into_iter()
        .filter(|m| m.session_id == query.session)
        .filter(|m| query.before.as_ref().map(|c| c.admits(m)).unwrap_or(true))
        .collect();
    // Oversized answers keep only the newest `limit` messages
    let mut messages = TranscriptPage::new(admitted, has_more).messages;
    if messages.len() > query.limit {
        let excess = messages.len() - query.limit;
        messages.drain(..excess);
    }
    TranscriptPage::new(messages, has_more)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ContentType;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn msg(id: &str, t: i64) -> ChatMessage {
        ChatMessage {
            id: MessageId::from(id),
            session_id: SessionId::from("room"),
            author_id: "u".to_string(),
            content_type: ContentType::Text,
            content: String::new(),
            timestamp: Utc.timestamp_opt(t, 0).unwrap(),
        }
    }

    /// Serves a fixed history newest-first, counting calls
    struct FakeSource {
        history: Vec<ChatMessage>,
        calls: AtomicUsize,
        delay: Duration,
        claim_more: Option<bool>,
        /// Ignore the requested limit and send everything older than the cursor
        oversize: bool,
        fail_with: Option<ChatError>,
    }

    impl FakeSource {
        fn new(count: i64) -> Self {
            Self {
                history: (0..count).map(|i| msg(&format!("m{:03}", i), i * 10)).collect(),
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
                claim_more: None,
                oversize: false,
                fail_with: None,
            }
        }
    }

    #[async_trait]
    impl HistorySource for FakeSource {
        async fn fetch(&self, query: &HistoryQuery) -> Result<HistoryResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if let Some(e) = &self.fail_with {
                return Err(e.clone());
            }
            let mut older: Vec<ChatMessage> = self
                .history
                .iter()
                .filter(|m| query.before.as_ref().map(|c| m.timestamp < c.timestamp()).unwrap_or(true))
                .cloned()
                .collect();
            older.reverse();
            if !self.oversize {
                older.truncate(query.limit);
            }
            Ok(HistoryResponse {
                messages: older,
                has_more: self.claim_more,
            })
        }
    }

    #[tokio::test]
    async fn test_pages_walk_backwards() {
        let source = Arc::new(FakeSource::new(25));
        let pager = CursorPaginator::new(source.clone(), Duration::ZERO);
        let room = SessionId::from("room");

        let first = pager.fetch_page(&room, None, 10).await.unwrap();
        assert_eq!(first.messages.len(), 10);
        assert_eq!(first.messages[0].id, MessageId::from("m015"));
        assert_eq!(first.messages[9].id, MessageId::from("m024"));
        assert!(first.has_more);

        let second = pager
            .fetch_page(&room, first.next_cursor.as_ref(), 10)
            .await
            .unwrap();
        assert_eq!(second.messages[9].id, MessageId::from("m014"));
        assert!(second.has_more);

        let third = pager
            .fetch_page(&room, second.next_cursor.as_ref(), 10)
            .await
            .unwrap();
        assert_eq!(third.messages.len(), 5);
        assert!(!third.has_more);
    }

    #[tokio::test]
    async fn test_short_page_means_no_more() {
        let mut source = FakeSource::new(3);
        source.claim_more = Some(true);
        let pager = CursorPaginator::new(Arc::new(source), Duration::ZERO);
        let page = pager.fetch_page(&SessionId::from("room"), None, 10).await.unwrap();
        assert_eq!(page.messages.len(), 3);
        assert!(!page.has_more);
    }

    #[tokio::test]
    async fn test_source_exhaustion_wins() {
        let mut source = FakeSource::new(10);
        source.claim_more = Some(false);
        let pager = CursorPaginator::new(Arc::new(source), Duration::ZERO);
        let page = pager.fetch_page(&SessionId::from("room"), None, 10).await.unwrap();
        assert!(!page.has_more);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_same_cursor_single_call() {
        let mut source = FakeSource::new(30);
        source.delay = Duration::from_millis(200);
        let source = Arc::new(source);
        let pager = CursorPaginator::new(source.clone(), Duration::from_millis(500));
        let room = SessionId::from("room");

        let (a, b) = tokio::join!(
            pager.fetch_page(&room, None, 10),
            pager.fetch_page(&room, None, 10)
        );
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_failure_keeps_error_kind() {
        for failure in [ChatError::RateLimited, ChatError::AuthRejected("expired".into())] {
            let mut source = FakeSource::new(30);
            source.delay = Duration::from_millis(200);
            source.fail_with = Some(failure);
            let source = Arc::new(source);
            let pager = CursorPaginator::new(source.clone(), Duration::from_millis(500));
            let room = SessionId::from("room");

            let (a, b) = tokio::join!(
                pager.fetch_page(&room, None, 10),
                pager.fetch_page(&room, None, 10)
            );
            assert_eq!(source.calls.load(Ordering::SeqCst), 1);
            for result in [a, b] {
                match (result, source.fail_with.as_ref()) {
                    (Err(ChatError::RateLimited), Some(ChatError::RateLimited)) => {}
                    (Err(ChatError::AuthRejected(got)), Some(ChatError::AuthRejected(want))) => {
                        assert_eq!(&got, want)
                    }
                    (other, _) => panic!("unexpected {:?}", other),
                }
            }

            // A failed fetch starts no cooldown
            assert!(matches!(
                pager.fetch_page(&room, None, 5).await,
                Err(ChatError::RateLimited) | Err(ChatError::AuthRejected(_))
            ));
            assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        }
    }

    #[tokio::test]
    async fn test_oversized_answer_is_truncated() {
        let mut source = FakeSource::new(12);
        source.oversize = true;
        let pager = CursorPaginator::new(Arc::new(source), Duration::ZERO);
        let page = pager.fetch_page(&SessionId::from("room"), None, 5).await.unwrap();
        assert_eq!(page.messages.len(), 5);
        assert_eq!(page.messages[0].id, MessageId::from("m007"));
        assert_eq!(page.messages[4].id, MessageId::from("m011"));
        assert_eq!(page.next_cursor, Some(Cursor::from_message(&page.messages[0])));
        assert!(page.has_more);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_serves_cache_or_rate_limits() {
        let source = Arc::new(FakeSource::new(30));
        let pager = CursorPaginator::new(source.clone(), Duration::from_millis(500));
        let room = SessionId::from("room");

        let first = pager.fetch_page(&room, None, 10).await.unwrap();
        let again = pager.fetch_page(&room, None, 10).await.unwrap();
        assert_eq!(first, again);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        let older = pager.fetch_page(&room, first.next_cursor.as_ref(), 10).await;
        assert!(matches!(older, Err(ChatError::RateLimited)));

        tokio::time::advance(Duration::from_millis(600)).await;
        let older = pager
            .fetch_page(&room, first.next_cursor.as_ref(), 10)
            .await
            .unwrap();
        assert_eq!(older.messages.len(), 10);
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_sessions_do_not_share_cooldown() {
        let source = Arc::new(FakeSource::new(30));
        let pager = CursorPaginator::new(source.clone(), Duration::from_secs(60));
        pager.fetch_page(&SessionId::from("room"), None, 5).await.unwrap();
        // Different session, same source: filtered down to nothing but not rate limited
        let other = pager.fetch_page(&SessionId::from("lobby"), None, 5).await.unwrap();
        assert!(other.messages.is_empty());
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_page_sorted_oldest_first_with_cursor() {
        let page = TranscriptPage::new(vec![msg("b", 20), msg("a", 10), msg("b", 20)], true);
        assert_eq!(page.messages.len(), 2);
        assert_eq!(page.messages[0].id, MessageId::from("a"));
        assert_eq!(page.next_cursor, Some(Cursor::from_message(&msg("a", 10))));
    }

    #[test]
    fn test_history_url() {
        let source = HttpHistorySource::new("http://api/", None, Duration::from_secs(5));
        let cursor = Cursor::from_message(&msg("a", 0));
        let query = HistoryQuery {
            session: SessionId::from("room"),
            before: Some(cursor),
            limit: 20,
        };
        assert_eq!(
            source.url_for(&query),
            "http://api/api/sessions/room/messages?limit=20&before=1970-01-01T00%3A00%3A00Z"
        );
    }
}
