/// Session socket: the per-session connection lifecycle
///
/// `SocketMachine` holds the transition rules and nothing else, so the
/// lifecycle can be checked without a network. `SessionSocket` drives the
/// machine against a real transport, one task per socket instance.
use crate::auth::{AccessToken, TokenProvider};
use crate::backoff::BackoffPolicy;
use crate::connection::transport::{Connector, TransportEvent, TransportLink};
use crate::error::ChatError;
use crate::events::FailureReason;
use crate::protocol::{ClientFrame, InboundEnvelope, SessionId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Lifecycle state of one session socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Authenticating,
    Open,
    Closing,
    Reconnecting,
    Failed,
}

impl ConnectionState {
    /// States in which the socket is alive or on its way to being alive
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting
                | ConnectionState::Authenticating
                | ConnectionState::Open
                | ConnectionState::Reconnecting
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Inputs to the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketInput {
    OpenRequested,
    TransportOpened,
    AuthAccepted,
    AuthRejected(String),
    /// Opening the transport failed with a non-retryable error
    Unrecoverable(String),
    AuthTimedOut,
    TransportLost(String),
    RetryTimerFired,
    CloseRequested,
    Closed,
}

/// What the driver must do after a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketAction {
    Connect,
    SendCredentials,
    Ready,
    ScheduleRetry(Duration),
    Fail(FailureReason),
    Shutdown,
    Finished,
}

#[derive(Debug, Clone)]
pub struct SocketMachine {
    state: ConnectionState,
    reconnect_attempt: u32,
    max_attempts: u32,
    backoff: BackoffPolicy,
}

impl SocketMachine {
    pub fn new(backoff: BackoffPolicy, max_attempts: u32) -> Self {
        Self {
            state: ConnectionState::Idle,
            reconnect_attempt: 0,
            max_attempts,
            backoff,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn reconnect_attempt(&self) -> u32 {
        self.reconnect_attempt
    }

    /// Apply `input`. Returns `None` when the input has no meaning in the
    /// current state; the state is then left untouched.
    pub fn handle(&mut self, input: SocketInput) -> Option<SocketAction> {
        use ConnectionState::*;

        let action = match (self.state, input) {
            (Idle | Failed, SocketInput::OpenRequested) => {
                self.reconnect_attempt = 0;
                self.state = Connecting;
                SocketAction::Connect
            }
            (Connecting, SocketInput::TransportOpened) => {
                self.state = Authenticating;
                SocketAction::SendCredentials
            }
            (Authenticating, SocketInput::AuthAccepted) => {
                self.reconnect_attempt = 0;
                self.state = Open;
                SocketAction::Ready
            }
            // From Connecting only via the token issuer, before any transport exists
            (Connecting | Authenticating, SocketInput::AuthRejected(reason)) => {
                self.state = Failed;
                SocketAction::Fail(FailureReason::AuthRejected { reason })
            }
            (Connecting, SocketInput::Unrecoverable(reason)) => {
                self.state = Failed;
                SocketAction::Fail(FailureReason::Unrecoverable { reason })
            }
            (Authenticating, SocketInput::AuthTimedOut) => self.lose("auth handshake timed out"),
            (Connecting | Authenticating | Open, SocketInput::TransportLost(reason)) => {
                self.lose(&reason)
            }
            (Reconnecting, SocketInput::RetryTimerFired) => {
                self.state = Connecting;
                SocketAction::Connect
            }
            (Connecting | Authenticating | Open | Reconnecting | Failed, SocketInput::CloseRequested) => {
                self.state = Closing;
                SocketAction::Shutdown
            }
            (Closing, SocketInput::Closed) => {
                self.state = Idle;
                SocketAction::Finished
            }
            _ => return None,
        };
        Some(action)
    }

    fn lose(&mut self, reason: &str) -> SocketAction {
        if self.reconnect_attempt >= self.max_attempts {
            self.state = ConnectionState::Failed;
            return SocketAction::Fail(FailureReason::RetriesExhausted {
                attempts: self.reconnect_attempt,
            });
        }
        let delay = self.backoff.next_delay(self.reconnect_attempt);
        self.reconnect_attempt += 1;
        self.state = ConnectionState::Reconnecting;
        debug!(
            "Connection lost ({}), retry {} in {:?}",
            reason, self.reconnect_attempt, delay
        );
        SocketAction::ScheduleRetry(delay)
    }
}

/// Receives everything a socket driver reports. Each call carries the
/// socket's instance id; a stale instance gets `false` back and must stop.
pub trait SocketObserver: Send + Sync {
    fn on_transition(
        &self,
        session: &SessionId,
        instance: Uuid,
        state: ConnectionState,
        outbound: Option<mpsc::UnboundedSender<String>>,
    ) -> bool;

    fn on_envelope(&self, session: &SessionId, instance: Uuid, envelope: InboundEnvelope);

    fn on_failed(&self, session: &SessionId, instance: Uuid, reason: FailureReason);
}

/// Commands from the owner of a socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketCommand {
    Close,
}

#[derive(Debug, Clone, Copy)]
pub struct SocketSettings {
    pub backoff: BackoffPolicy,
    pub max_attempts: u32,
    pub auth_timeout: Duration,
    pub connect_timeout: Duration,
}

pub struct SessionSocket {
    session: SessionId,
    instance: Uuid,
    machine: SocketMachine,
    settings: SocketSettings,
    connector: Arc<dyn Connector>,
    tokens: Arc<dyn TokenProvider>,
    observer: Arc<dyn SocketObserver>,
    control: mpsc::Receiver<SocketCommand>,
    link: Option<TransportLink>,
    /// Token presented on the current connection
    token: Option<AccessToken>,
    retry_delay: Duration,
}

impl SessionSocket {
    pub fn new(
        session: SessionId,
        instance: Uuid,
        settings: SocketSettings,
        connector: Arc<dyn Connector>,
        tokens: Arc<dyn TokenProvider>,
        observer: Arc<dyn SocketObserver>,
        control: mpsc::Receiver<SocketCommand>,
    ) -> Self {
        Self {
            session,
            instance,
            machine: SocketMachine::new(settings.backoff, settings.max_attempts),
            settings,
            connector,
            tokens,
            observer,
            control,
            link: None,
            token: None,
            retry_delay: Duration::ZERO,
        }
    }

    pub fn instance(&self) -> Uuid {
        self.instance
    }

    /// Run the lifecycle until the socket is closed, fails, or is superseded
    pub async fn run(mut self) {
        let mut input = SocketInput::OpenRequested;
        loop {
            let Some(action) = self.machine.handle(input.clone()) else {
                warn!(
                    "Session {}: ignoring {:?} in state {}",
                    self.session,
                    input,
                    self.machine.state()
                );
                return;
            };

            let state = self.machine.state();
            let outbound = match state {
                ConnectionState::Open => self.link.as_ref().map(|l| l.outbound.clone()),
                _ => None,
            };
            if !self
                .observer
                .on_transition(&self.session, self.instance, state, outbound)
            {
                debug!(
                    "Session {}: socket {} superseded, stopping",
                    self.session, self.instance
                );
                return;
            }
            debug!("Session {} -> {}", self.session, state);

            input = match action {
                SocketAction::Connect => self.open_transport().await,
                SocketAction::SendCredentials => self.authenticate().await,
                SocketAction::Ready => {
                    info!("Session {} open", self.session);
                    self.pump().await
                }
                SocketAction::ScheduleRetry(delay) => {
                    self.link = None;
                    self.retry_delay = delay;
                    info!(
                        "Session {}: reconnect attempt {} in {:?}",
                        self.session,
                        self.machine.reconnect_attempt(),
                        delay
                    );
                    self.wait_retry().await
                }
                SocketAction::Fail(reason) => {
                    self.link = None;
                    if let FailureReason::AuthRejected { .. } = reason {
                        self.tokens.invalidate(&self.session);
                    }
                    error!("Session {} failed: {}", self.session, reason);
                    self.observer.on_failed(&self.session, self.instance, reason);
                    return;
                }
                SocketAction::Shutdown => {
                    // Dropping the link closes the transport
                    self.link = None;
                    SocketInput::Closed
                }
                SocketAction::Finished => return,
            };
        }
    }

    async fn open_transport(&mut self) -> SocketInput {
        let session = self.session.clone();
        let tokens = self.tokens.clone();
        let connector = self.connector.clone();
        let connect_timeout = self.settings.connect_timeout;

        let attempt = async move {
            let token = tokens.access_token(&session).await?;
            let link = timeout(connect_timeout, connector.connect(&session, Some(&token)))
                .await
                .map_err(|_| ChatError::Timeout("transport open timed out".to_string()))??;
            Ok::<_, ChatError>((token, link))
        };

        tokio::select! {
            result = attempt => match result {
                Ok((token, link)) => {
                    self.token = Some(token);
                    self.link = Some(link);
                    SocketInput::TransportOpened
                }
                Err(ChatError::AuthRejected(reason)) => SocketInput::AuthRejected(reason),
                Err(e) if e.is_retryable() => SocketInput::TransportLost(e.to_string()),
                Err(e) => SocketInput::Unrecoverable(e.to_string()),
            },
            _ = self.control.recv() => SocketInput::CloseRequested,
        }
    }

    async fn authenticate(&mut self) -> SocketInput {
        let Some(token) = self.token.as_ref() else {
            return SocketInput::AuthRejected("no credential available".to_string());
        };
        let frame = match (ClientFrame::Auth {
            token: token.token.clone(),
        })
        .encode()
        {
            Ok(frame) => frame,
            Err(e) => return SocketInput::TransportLost(e.to_string()),
        };
        let Some(link) = self.link.as_mut() else {
            return SocketInput::TransportLost("transport missing".to_string());
        };
        if link.outbound.send(frame).is_err() {
            return SocketInput::TransportLost("transport closed before auth".to_string());
        }

        let deadline = Instant::now() + self.settings.auth_timeout;
        loop {
            tokio::select! {
                event = link.inbound.recv() => match event {
                    Some(TransportEvent::Text(text)) => match InboundEnvelope::decode(&text) {
                        Ok(InboundEnvelope::AuthAck { success: true, .. }) => return SocketInput::AuthAccepted,
                        Ok(InboundEnvelope::AuthAck { success: false, reason }) => {
                            return SocketInput::AuthRejected(reason.unwrap_or_else(|| "rejected".to_string()))
                        }
                        Ok(InboundEnvelope::Error { reason }) => return SocketInput::AuthRejected(reason),
                        Ok(other) => debug!("Session {}: dropping {} received before auth", self.session, other),
                        Err(e) => warn!("Session {}: {}", self.session, e),
                    },
                    Some(TransportEvent::Closed(reason)) => {
                        return SocketInput::TransportLost(reason.unwrap_or_else(|| "closed during auth".to_string()))
                    }
                    Some(TransportEvent::Error(e)) => return SocketInput::TransportLost(e),
                    None => return SocketInput::TransportLost("transport ended during auth".to_string()),
                },
                _ = sleep_until(deadline) => return SocketInput::AuthTimedOut,
                _ = self.control.recv() => return SocketInput::CloseRequested,
            }
        }
    }

    async fn pump(&mut self) -> SocketInput {
        let Some(link) = self.link.as_mut() else {
            return SocketInput::TransportLost("transport missing".to_string());
        };
        loop {
            tokio::select! {
                event = link.inbound.recv() => match event {
                    Some(TransportEvent::Text(text)) => match InboundEnvelope::decode(&text) {
                        Ok(InboundEnvelope::AuthAck { .. }) => {
                            debug!("Session {}: duplicate auth ack ignored", self.session)
                        }
                        Ok(InboundEnvelope::Error { reason }) => {
                            warn!("Session {}: server error: {}", self.session, reason)
                        }
                        Ok(envelope) => self.observer.on_envelope(&self.session, self.instance, envelope),
                        Err(e) => warn!("Session {}: {}", self.session, e),
                    },
                    Some(TransportEvent::Closed(reason)) => {
                        return SocketInput::TransportLost(reason.unwrap_or_else(|| "closed by server".to_string()))
                    }
                    Some(TransportEvent::Error(e)) => return SocketInput::TransportLost(e),
                    None => return SocketInput::TransportLost("transport ended".to_string()),
                },
                _ = self.control.recv() => return SocketInput::CloseRequested,
            }
        }
    }

    async fn wait_retry(&mut self) -> SocketInput {
        tokio::select! {
            _ = sleep(self.retry_delay) => SocketInput::RetryTimerFired,
            _ = self.control.recv() => SocketInput::CloseRequested,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine(max: u32) -> SocketMachine {
        SocketMachine::new(
            BackoffPolicy::new(Duration::from_millis(100), Duration::from_millis(1000)),
            max,
        )
    }

    fn open(m: &mut SocketMachine) {
        assert_eq!(m.handle(SocketInput::OpenRequested), Some(SocketAction::Connect));
        assert_eq!(m.handle(SocketInput::TransportOpened), Some(SocketAction::SendCredentials));
        assert_eq!(m.handle(SocketInput::AuthAccepted), Some(SocketAction::Ready));
        assert_eq!(m.state(), ConnectionState::Open);
    }

    #[test]
    fn test_happy_path_and_close() {
        let mut m = machine(5);
        open(&mut m);
        assert_eq!(m.handle(SocketInput::CloseRequested), Some(SocketAction::Shutdown));
        assert_eq!(m.state(), ConnectionState::Closing);
        assert_eq!(m.handle(SocketInput::Closed), Some(SocketAction::Finished));
        assert_eq!(m.state(), ConnectionState::Idle);
    }

    #[test]
    fn test_no_skipping_states() {
        let mut m = machine(5);
        assert_eq!(m.handle(SocketInput::AuthAccepted), None);
        assert_eq!(m.handle(SocketInput::TransportOpened), None);
        assert_eq!(m.state(), ConnectionState::Idle);
        m.handle(SocketInput::OpenRequested);
        assert_eq!(m.handle(SocketInput::AuthAccepted), None);
        assert_eq!(m.state(), ConnectionState::Connecting);
    }

    #[test]
    fn test_auth_rejection_is_terminal() {
        let mut m = machine(5);
        m.handle(SocketInput::OpenRequested);
        m.handle(SocketInput::TransportOpened);
        let action = m.handle(SocketInput::AuthRejected("expired".into()));
        assert_eq!(
            action,
            Some(SocketAction::Fail(FailureReason::AuthRejected {
                reason: "expired".into()
            }))
        );
        assert_eq!(m.state(), ConnectionState::Failed);
        assert_eq!(m.handle(SocketInput::RetryTimerFired), None);
        assert_eq!(m.handle(SocketInput::TransportLost("x".into())), None);
        // An explicit open starts over
        assert_eq!(m.handle(SocketInput::OpenRequested), Some(SocketAction::Connect));
    }

    #[test]
    fn test_issuer_rejection_fails_from_connecting() {
        let mut m = machine(5);
        m.handle(SocketInput::OpenRequested);
        assert_eq!(
            m.handle(SocketInput::AuthRejected("issuer said 401".into())),
            Some(SocketAction::Fail(FailureReason::AuthRejected {
                reason: "issuer said 401".into()
            }))
        );
        assert_eq!(m.state(), ConnectionState::Failed);
        assert_eq!(m.handle(SocketInput::RetryTimerFired), None);
    }

    #[test]
    fn test_unrecoverable_connect_fails_without_retry() {
        let mut m = machine(5);
        m.handle(SocketInput::OpenRequested);
        assert_eq!(
            m.handle(SocketInput::Unrecoverable("bad url".into())),
            Some(SocketAction::Fail(FailureReason::Unrecoverable {
                reason: "bad url".into()
            }))
        );
        assert_eq!(m.state(), ConnectionState::Failed);
        assert_eq!(m.reconnect_attempt(), 0);
        // Only meaningful while connecting
        let mut live = machine(5);
        open(&mut live);
        assert_eq!(live.handle(SocketInput::Unrecoverable("late".into())), None);
        assert_eq!(live.state(), ConnectionState::Open);
    }

    #[test]
    fn test_backoff_then_cap() {
        let mut m = machine(2);
        m.handle(SocketInput::OpenRequested);
        assert_eq!(
            m.handle(SocketInput::TransportLost("refused".into())),
            Some(SocketAction::ScheduleRetry(Duration::from_millis(100)))
        );
        assert_eq!(m.handle(SocketInput::RetryTimerFired), Some(SocketAction::Connect));
        assert_eq!(
            m.handle(SocketInput::TransportLost("refused".into())),
            Some(SocketAction::ScheduleRetry(Duration::from_millis(200)))
        );
        m.handle(SocketInput::RetryTimerFired);
        assert_eq!(
            m.handle(SocketInput::TransportLost("refused".into())),
            Some(SocketAction::Fail(FailureReason::RetriesExhausted { attempts: 2 }))
        );
        assert_eq!(m.state(), ConnectionState::Failed);
    }

    #[test]
    fn test_attempts_reset_on_open() {
        let mut m = machine(5);
        m.handle(SocketInput::OpenRequested);
        m.handle(SocketInput::TransportLost("a".into()));
        m.handle(SocketInput::RetryTimerFired);
        m.handle(SocketInput::TransportLost("b".into()));
        assert_eq!(m.reconnect_attempt(), 2);
        m.handle(SocketInput::RetryTimerFired);
        m.handle(SocketInput::TransportOpened);
        m.handle(SocketInput::AuthAccepted);
        assert_eq!(m.reconnect_attempt(), 0);
        assert_eq!(
            m.handle(SocketInput::TransportLost("c".into())),
            Some(SocketAction::ScheduleRetry(Duration::from_millis(100)))
        );
    }

    #[test]
    fn test_auth_timeout_retries() {
        let mut m = machine(5);
        m.handle(SocketInput::OpenRequested);
        m.handle(SocketInput::TransportOpened);
        assert!(matches!(
            m.handle(SocketInput::AuthTimedOut),
            Some(SocketAction::ScheduleRetry(_))
        ));
        assert_eq!(m.state(), ConnectionState::Reconnecting);
    }

    #[test]
    fn test_close_from_reconnecting() {
        let mut m = machine(5);
        m.handle(SocketInput::OpenRequested);
        m.handle(SocketInput::TransportLost("a".into()));
        assert_eq!(m.handle(SocketInput::CloseRequested), Some(SocketAction::Shutdown));
        assert_eq!(m.handle(SocketInput::RetryTimerFired), None);
    }
}
