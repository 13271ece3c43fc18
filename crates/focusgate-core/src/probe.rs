//! Page-state probe over the Chrome DevTools Protocol.
//!
//! Every call performs a fresh target discovery, opens a new WebSocket to the
//! selected page, issues `DOM.getDocument` followed by `DOM.getOuterHTML` and
//! closes the socket again. Nothing is retried here; the enforcement loop
//! simply asks again on its next cycle.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use tokio::{net::TcpStream, time::timeout};
use tokio_tungstenite::{
    connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("debugger discovery at {endpoint} failed: {reason}")]
    Discovery { endpoint: String, reason: String },
    #[error("no page target with URL containing {0:?}")]
    TargetNotFound(String),
    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },
    #[error("unexpected protocol response: {0}")]
    ProtocolShape(String),
    #[error("browser returned error {code}: {message}")]
    Remote { code: i64, message: String },
    #[error("protocol transport failed: {0}")]
    Transport(String),
    #[error("{stage} did not complete within {limit:?}")]
    Timeout { stage: &'static str, limit: Duration },
}

/// Something that can report the rendered markup of the monitored page.
#[async_trait]
pub trait PageProbe: Send + Sync {
    async fn fetch_page_markup(&self) -> Result<String, ProbeError>;
}

/// One entry of the `/json` target list.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct DebugTarget {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub url: String,
    #[serde(rename = "webSocketDebuggerUrl", default)]
    pub debugger_url: Option<String>,
}

/// Debugger URL of the first page target whose URL contains `url_substring`.
#[must_use]
pub fn select_target<'a>(targets: &'a [DebugTarget], url_substring: &str) -> Option<&'a str> {
    targets
        .iter()
        .filter(|target| target.kind == "page" && target.url.contains(url_substring))
        .find_map(|target| target.debugger_url.as_deref())
}

/// `result.root.nodeId` of a `DOM.getDocument` response.
///
/// # Errors
///
/// Returns `ProtocolShape` if the field is missing or not an integer.
pub fn parse_root_node_id(result: &Value) -> Result<i64, ProbeError> {
    result
        .get("root")
        .and_then(|root| root.get("nodeId"))
        .and_then(Value::as_i64)
        .ok_or_else(|| ProbeError::ProtocolShape(format!("missing root.nodeId in {result}")))
}

/// `result.outerHTML` of a `DOM.getOuterHTML` response.
///
/// # Errors
///
/// Returns `ProtocolShape` if the field is missing or not a string.
pub fn parse_outer_html(result: &Value) -> Result<String, ProbeError> {
    result
        .get("outerHTML")
        .and_then(Value::as_str)
        .map(ToString::to_string)
        .ok_or_else(|| ProbeError::ProtocolShape(String::from("missing outerHTML")))
}

type CdpSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A single-use protocol connection to one page target.
struct CdpSession {
    socket: CdpSocket,
    limit: Duration,
}

impl CdpSession {
    async fn connect(url: &str, limit: Duration) -> Result<Self, ProbeError> {
        let (socket, _) = timeout(limit, connect_async(url))
            .await
            .map_err(|_| ProbeError::Timeout {
                stage: "connect",
                limit,
            })?
            .map_err(|e| ProbeError::Connect {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self { socket, limit })
    }

    /// Send one command and wait for the response carrying the same id.
    async fn call(
        &mut self,
        id: u64,
        method: &'static str,
        params: Option<Value>,
    ) -> Result<Value, ProbeError> {
        let limit = self.limit;
        timeout(limit, self.exchange(id, method, params))
            .await
            .map_err(|_| ProbeError::Timeout {
                stage: method,
                limit,
            })?
    }

    async fn exchange(
        &mut self,
        id: u64,
        method: &'static str,
        params: Option<Value>,
    ) -> Result<Value, ProbeError> {
        let mut request = json!({ "id": id, "method": method });
        if let Some(params) = params {
            request["params"] = params;
        }
        self.socket
            .send(Message::Text(request.to_string()))
            .await
            .map_err(|e| ProbeError::Transport(e.to_string()))?;

        loop {
            let frame = match self.socket.next().await {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => return Err(ProbeError::Transport(e.to_string())),
                None => return Err(ProbeError::Transport(String::from("connection closed"))),
            };
            let text = match frame {
                Message::Text(text) => text,
                Message::Close(_) => {
                    return Err(ProbeError::Transport(String::from("connection closed")))
                }
                _ => continue,
            };
            let response: Value = serde_json::from_str(&text)
                .map_err(|e| ProbeError::ProtocolShape(format!("invalid JSON: {e}")))?;

            // Events and stale replies carry no id or a different one.
            if response.get("id").and_then(Value::as_u64) != Some(id) {
                continue;
            }
            if let Some(error) = response.get("error") {
                return Err(ProbeError::Remote {
                    code: error.get("code").and_then(Value::as_i64).unwrap_or_default(),
                    message: error
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                });
            }
            return response
                .get("result")
                .cloned()
                .ok_or_else(|| ProbeError::ProtocolShape(format!("{method} returned no result")));
        }
    }

    async fn outer_html(&mut self) -> Result<String, ProbeError> {
        let document = self.call(1, "DOM.getDocument", None).await?;
        let node_id = parse_root_node_id(&document)?;
        let html = self
            .call(2, "DOM.getOuterHTML", Some(json!({ "nodeId": node_id })))
            .await?;
        parse_outer_html(&html)
    }

    async fn close(mut self) {
        if let Err(e) = self.socket.close(None).await {
            log::debug!("Closing DevTools socket failed: {e}");
        }
    }
}

/// Probe that talks to a local Chromium remote-debugging endpoint.
pub struct CdpProbe {
    http: reqwest::Client,
    endpoint: String,
    url_substring: String,
    limit: Duration,
}

impl CdpProbe {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(endpoint: &str, url_substring: &str, limit: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(limit)
            .build()
            .context("Failed to build DevTools HTTP client")?;
        Ok(Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            url_substring: url_substring.to_string(),
            limit,
        })
    }

    fn discovery_error(&self, reason: impl ToString) -> ProbeError {
        ProbeError::Discovery {
            endpoint: self.endpoint.clone(),
            reason: reason.to_string(),
        }
    }

    /// List the debugging targets the browser currently exposes.
    ///
    /// # Errors
    ///
    /// Returns `Discovery` if the endpoint is unreachable or answers garbage.
    pub async fn discover(&self) -> Result<Vec<DebugTarget>, ProbeError> {
        let response = self
            .http
            .get(format!("{}/json", self.endpoint))
            .send()
            .await
            .map_err(|e| self.discovery_error(e))?;
        if !response.status().is_success() {
            return Err(self.discovery_error(format!("HTTP {}", response.status())));
        }
        response
            .json::<Vec<DebugTarget>>()
            .await
            .map_err(|e| self.discovery_error(e))
    }
}

#[async_trait]
impl PageProbe for CdpProbe {
    async fn fetch_page_markup(&self) -> Result<String, ProbeError> {
        let targets = self.discover().await?;
        let debugger_url = select_target(&targets, &self.url_substring)
            .ok_or_else(|| ProbeError::TargetNotFound(self.url_substring.clone()))?;

        log::debug!("Attaching to DevTools target {debugger_url}");
        let mut session = CdpSession::connect(debugger_url, self.limit).await?;
        let markup = session.outer_html().await;
        session.close().await;
        markup
    }
}
