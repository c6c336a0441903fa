//! HTTP client for talking to a sandbox's worker server.

use std::time::Duration;

use crate::error::{Error, Result};

/// Header carrying the session credential on every worker request.
pub const SESSION_API_KEY_HEADER: &str = "X-Session-API-Key";

/// Path of the worker's liveness endpoint.
pub const ALIVE_PATH: &str = "/alive";

/// Result of a single liveness request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The worker answered with a 2xx status.
    Alive,
    /// The worker answered, but not with success.
    NotReady(u16),
    /// Connection refused, timed out, or otherwise failed at the transport level.
    Unreachable(String),
}

/// Client for one worker's HTTP API.
#[derive(Debug, Clone)]
pub struct WorkerClient {
    http: reqwest::Client,
    base_url: String,
    session_api_key: Option<String>,
}

impl WorkerClient {
    /// Creates a client for the worker at `base_url`.
    ///
    /// `request_timeout` bounds each individual request.
    pub fn new(
        base_url: impl Into<String>,
        session_api_key: Option<String>,
        request_timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .connect_timeout(request_timeout)
            .no_proxy()
            .build()
            .map_err(|e| Error::Config(format!("failed to build worker HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            session_api_key,
        })
    }

    /// Creates a client for a worker listening on `host:port`.
    pub fn for_port(
        host: &str,
        port: u16,
        session_api_key: Option<String>,
        request_timeout: Duration,
    ) -> Result<Self> {
        Self::new(
            format!("http://{}:{}", host, port),
            session_api_key,
            request_timeout,
        )
    }

    /// Base URL of the worker.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Full URL of the liveness endpoint.
    pub fn alive_url(&self) -> String {
        format!("{}{}", self.base_url, ALIVE_PATH)
    }

    /// Issues one liveness request.
    pub async fn check_alive(&self) -> ProbeOutcome {
        let mut request = self.http.get(self.alive_url());
        if let Some(key) = &self.session_api_key {
            request = request.header(SESSION_API_KEY_HEADER, key);
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => ProbeOutcome::Alive,
            Ok(response) => ProbeOutcome::NotReady(response.status().as_u16()),
            Err(e) if e.is_connect() => ProbeOutcome::Unreachable(format!("connect: {}", e)),
            Err(e) if e.is_timeout() => ProbeOutcome::Unreachable(format!("timeout: {}", e)),
            Err(e) => ProbeOutcome::Unreachable(e.to_string()),
        }
    }
}
