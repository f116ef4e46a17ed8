/// Minimal JSON-over-HTTP client for the REST collaborators
use crate::error::{ChatError, Result};
use http::header::{ACCEPT, AUTHORIZATION};
use http_body_util::{BodyExt, Empty};
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

type HttpClient = Client<HttpConnector, Empty<bytes::Bytes>>;

/// Shared GET client used by the history source and the token provider
#[derive(Clone)]
pub struct JsonClient {
    client: HttpClient,
    timeout: Duration,
}

impl JsonClient {
    pub fn new(timeout: Duration) -> Self {
        let client = Client::builder(TokioExecutor::new()).build_http();
        Self { client, timeout }
    }

    /// GET `url`, optionally with a bearer credential, and decode the JSON body
    pub async fn get_json<T: DeserializeOwned>(&self, url: &str, bearer: Option<&str>) -> Result<T> {
        let mut builder = Request::builder()
            .method(Method::GET)
            .uri(url)
            .header(ACCEPT, "application/json");
        if let Some(token) = bearer {
            builder = builder.header(AUTHORIZATION, format!("Bearer {}", token));
        }
        let req = builder
            .body(Empty::<bytes::Bytes>::new())
            .map_err(|e| ChatError::Config(format!("Invalid request for {}: {}", url, e)))?;

        debug!("GET {}", url);
        let resp = tokio::time::timeout(self.timeout, self.client.request(req))
            .await
            .map_err(|_| ChatError::Timeout(format!("GET {} timed out", url)))?
            .map_err(|e| ChatError::Transport(format!("GET {} failed: {}", url, e)))?;

        let status = resp.status();
        let body = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| ChatError::Transport(format!("Failed to read body: {}", e)))?
            .to_bytes();

        match status {
            s if s.is_success() => serde_json::from_slice(&body).map_err(ChatError::Serialization),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ChatError::AuthRejected(
                String::from_utf8_lossy(&body).trim().to_string(),
            )),
            StatusCode::TOO_MANY_REQUESTS => Err(ChatError::RateLimited),
            s => Err(ChatError::Transport(format!(
                "GET {} returned {}: {}",
                url,
                s,
                String::from_utf8_lossy(&body).trim()
            ))),
        }
    }
}
