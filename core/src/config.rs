/// Configuration management
use crate::backoff::BackoffPolicy;
use crate::error::{ChatError, Result};
use crate::protocol::SessionId;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_SERVER_URL: &str = "ws://localhost:8080";
const DEFAULT_API_URL: &str = "http://localhost:8080";

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Base WebSocket URL of the relay server
    pub server_url: String,

    /// Base HTTP URL for history pages and token issuance
    pub api_url: String,

    /// Bearer credential of the logged-in user
    pub user_token: Option<String>,

    /// First reconnect delay
    pub backoff_base: Duration,

    /// Upper bound on reconnect delay
    pub backoff_cap: Duration,

    /// Spread reconnect delays by +/-20%
    pub backoff_jitter: bool,

    /// Reconnect attempts before a socket is declared failed
    pub max_reconnect_attempts: u32,

    /// Bounded wait for the auth acknowledgement
    pub auth_timeout: Duration,

    /// Bounded wait for the transport to open
    pub connect_timeout: Duration,

    /// Messages per history page
    pub page_size: usize,

    /// Minimum spacing between history requests of one session
    pub page_cooldown: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            api_url: DEFAULT_API_URL.to_string(),
            user_token: None,
            backoff_base: Duration::from_millis(1000),
            backoff_cap: Duration::from_millis(30_000),
            backoff_jitter: false,
            max_reconnect_attempts: 5,
            auth_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            page_size: 20,
            page_cooldown: Duration::from_millis(500),
        }
    }
}

impl Config {
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.backoff_base, self.backoff_cap).with_jitter(self.backoff_jitter)
    }

    /// Reject settings the connection layer cannot honour
    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 {
            return Err(ChatError::Config("page size must be at least 1".to_string()));
        }
        if self.backoff_cap < self.backoff_base {
            return Err(ChatError::Config(
                "backoff cap must not be below backoff base".to_string(),
            ));
        }
        if self.auth_timeout.is_zero() || self.connect_timeout.is_zero() {
            return Err(ChatError::Config("timeouts must be non-zero".to_string()));
        }
        // No TLS stack is compiled in, so wss:// and https:// cannot connect
        if !self.server_url.starts_with("ws://") {
            return Err(ChatError::Config(format!(
                "server url must be ws://, got {}",
                self.server_url
            )));
        }
        if !self.api_url.starts_with("http://") {
            return Err(ChatError::Config(format!(
                "api url must be http://, got {}",
                self.api_url
            )));
        }
        Ok(())
    }

    /// Create config from command line arguments; returns the session to open
    pub fn from_args(args: &[String]) -> Result<(Self, SessionId)> {
        if args.len() < 2 {
            return Err(ChatError::Config(format!(
                "Usage: {} <session-id> [--server <ws-url>] [--api <http-url>] [--token <token>] [--page-size <n>] [--max-retries <n>] [--jitter]",
                args.first().map(String::as_str).unwrap_or("chatlink")
            )));
        }

        let session = SessionId::from(args[1].as_str());
        let mut config = Config::default();

        let mut i = 2;
        while i < args.len() {
            match args[i].as_str() {
                "--server" => {
                    config.server_url = flag_value(args, i, "--server")?.to_string();
                    i += 2;
                }
                "--api" => {
                    config.api_url = flag_value(args, i, "--api")?.to_string();
                    i += 2;
                }
                "--token" => {
                    config.user_token = Some(flag_value(args, i, "--token")?.to_string());
                    i += 2;
                }
                "--page-size" => {
                    config.page_size = flag_value(args, i, "--page-size")?
                        .parse::<usize>()
                        .map_err(|_| {
                            ChatError::Config("--page-size must be a positive number".to_string())
                        })?;
                    i += 2;
                }
                "--max-retries" => {
                    config.max_reconnect_attempts = flag_value(args, i, "--max-retries")?
                        .parse::<u32>()
                        .map_err(|_| {
                            ChatError::Config("--max-retries must be a number".to_string())
                        })?;
                    i += 2;
                }
                "--jitter" => {
                    config.backoff_jitter = true;
                    i += 1;
                }
                other => {
                    return Err(ChatError::Config(format!("Unknown argument: {}", other)));
                }
            }
        }

        // Env overrides
        if let Ok(url) = std::env::var("CHATLINK_SERVER_URL") {
            config.server_url = url;
        }
        if let Ok(url) = std::env::var("CHATLINK_API_URL") {
            config.api_url = url;
        }
        if let Ok(token) = std::env::var("CHATLINK_TOKEN") {
            config.user_token = Some(token);
        }

        config.validate()?;
        Ok((config, session))
    }
}

fn flag_value<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a str> {
    args.get(i + 1)
        .map(String::as_str)
        .ok_or_else(|| ChatError::Config(format!("{} requires an argument", flag)))
}
