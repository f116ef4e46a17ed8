/// End-to-end socket tests against a local WebSocket server
extern crate chatlink_core;

use chatlink_core::auth::StaticTokenProvider;
use chatlink_core::connection::WebSocketConnector;
use chatlink_core::{
    Config, ConnectionManager, ConnectionState, FailureReason, OutgoingMessage, SessionEvent,
    SessionId,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as WsMessage;

#[tokio::test]
async fn test_websocket_round_trip() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<String>();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

        // Credentials first
        let Some(Ok(WsMessage::Text(auth))) = ws.next().await else {
            panic!("expected auth frame");
        };
        let _ = seen_tx.send(auth.to_string());
        ws.send(WsMessage::Text(json!({"type": "auth_ack", "success": true}).to_string().into()))
            .await
            .unwrap();
        ws.send(WsMessage::Text(
            json!({
                "type": "message",
                "id": "m1",
                "sessionId": "lobby",
                "authorId": "server",
                "content": "welcome",
                "timestamp": "2024-05-01T10:00:00Z",
            })
            .to_string()
            .into(),
        ))
        .await
        .unwrap();

        while let Some(Ok(frame)) = ws.next().await {
            if let WsMessage::Text(text) = frame {
                let _ = seen_tx.send(text.to_string());
            }
        }
    });

    let manager = ConnectionManager::new(
        &Config::default(),
        Arc::new(WebSocketConnector::new(format!("ws://{}", addr))),
        Arc::new(StaticTokenProvider::new("t0k3n")),
    );
    let lobby = SessionId::from("lobby");
    let (msg_tx, mut msg_rx) = mpsc::unbounded_channel();
    manager.on_message(&lobby, move |event| {
        let _ = msg_tx.send(event.clone());
    });

    manager.connect(&lobby);
    manager.wait_open(&lobby, Duration::from_secs(5)).await.unwrap();

    let auth: serde_json::Value = serde_json::from_str(&seen_rx.recv().await.unwrap()).unwrap();
    assert_eq!(auth, json!({"type": "auth", "token": "t0k3n"}));

    match timeout(Duration::from_secs(5), msg_rx.recv()).await.unwrap().unwrap() {
        SessionEvent::Message { message } => {
            assert_eq!(message.id.as_str(), "m1");
            assert_eq!(message.content, "welcome");
        }
        other => panic!("unexpected {:?}", other),
    }

    manager.send(&lobby, OutgoingMessage::text("hello server")).unwrap();
    let sent: serde_json::Value = serde_json::from_str(
        &timeout(Duration::from_secs(5), seen_rx.recv()).await.unwrap().unwrap(),
    )
    .unwrap();
    assert_eq!(sent["content"], "hello server");
    assert_eq!(manager.state(&lobby), Some(ConnectionState::Open));

    manager.disconnect(&lobby);
    assert!(manager.sessions().is_empty());
}

#[tokio::test]
async fn test_unreachable_server_schedules_retry() {
    // Bind then drop to get a port nothing listens on
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let config = Config {
        backoff_base: Duration::from_secs(30),
        backoff_cap: Duration::from_secs(60),
        ..Default::default()
    };
    let manager = ConnectionManager::new(
        &config,
        Arc::new(WebSocketConnector::new(format!("ws://{}", addr))),
        Arc::new(StaticTokenProvider::new("t0k3n")),
    );
    let session = SessionId::from("nowhere");
    let (state_tx, mut state_rx) = mpsc::unbounded_channel();
    manager.on_state_change(&session, move |event| {
        let _ = state_tx.send(event.clone());
    });

    manager.connect(&session);
    let reached = timeout(Duration::from_secs(5), async {
        while let Some(event) = state_rx.recv().await {
            if event
                == (SessionEvent::StateChanged {
                    state: ConnectionState::Reconnecting,
                })
            {
                return true;
            }
        }
        false
    })
    .await
    .unwrap();
    assert!(reached);
    manager.disconnect(&session);
}

#[tokio::test]
async fn test_secure_url_fails_without_retrying() {
    // Something is listening, so only the missing TLS stack can fail the connect
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let manager = ConnectionManager::new(
        &Config::default(),
        Arc::new(WebSocketConnector::new(format!("wss://{}", addr))),
        Arc::new(StaticTokenProvider::new("t0k3n")),
    );
    let session = SessionId::from("secure");
    let (tx, mut rx) = mpsc::unbounded_channel();
    manager.on_state_change(&session, move |event| {
        let _ = tx.send(event.clone());
    });

    manager.connect(&session);
    let failure = timeout(Duration::from_secs(5), async {
        while let Some(event) = rx.recv().await {
            match event {
                SessionEvent::StateChanged {
                    state: ConnectionState::Reconnecting,
                } => panic!("retried a connect that cannot succeed"),
                SessionEvent::Failed { reason } => return reason,
                _ => {}
            }
        }
        panic!("no failure reported");
    })
    .await
    .unwrap();
    assert!(matches!(failure, FailureReason::Unrecoverable { .. }));
    assert_eq!(manager.state(&session), Some(ConnectionState::Failed));
}
