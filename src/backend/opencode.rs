use super::{BackendError, Message, Role, SessionBackend, SessionStatus};
use crate::config::BackendConfig;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

/// HTTP client for a running OpenCode server.
///
/// Endpoints used:
///   GET /session/status          -> {"<session id>": {"type": "idle"|"busy"|"retry"}, ...}
///   GET /session/{id}/message    -> [{info: {role, ...}, parts: [{type: "text", text: "..."}, ...]}, ...]
///
/// Both accept an optional `directory` query parameter that scopes the
/// request to one project.
pub struct OpencodeClient {
    client: reqwest::Client,
    base_url: String,
    directory: Option<String>,
}

impl OpencodeClient {
    pub fn new(config: &BackendConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("opencode-watch/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .no_proxy()
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            directory: config.directory.clone(),
        })
    }

    /// Base URL plus path segments. Each segment is percent-encoded, so a
    /// session ID cannot escape its path position.
    fn endpoint(&self, segments: &[&str]) -> Result<reqwest::Url, BackendError> {
        let invalid = |message: String| BackendError::InvalidUrl {
            url: self.base_url.clone(),
            message,
        };
        let mut url = reqwest::Url::parse(&self.base_url).map_err(|e| invalid(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|()| invalid("base URL cannot carry a path".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get_json(&self, url: reqwest::Url) -> Result<Value, BackendError> {
        let mut request = self.client.get(url.clone());
        if let Some(ref dir) = self.directory {
            request = request.query(&[("directory", dir)]);
        }

        let resp = request.send().await.map_err(|e| BackendError::Http {
            url: url.to_string(),
            source: e,
        })?;

        if !resp.status().is_success() {
            return Err(BackendError::Status {
                url: url.to_string(),
                status: resp.status().as_u16(),
            });
        }

        resp.json::<Value>().await.map_err(|e| BackendError::Decode {
            url: url.to_string(),
            message: e.to_string(),
        })
    }
}

#[async_trait]
impl SessionBackend for OpencodeClient {
    fn name(&self) -> &str {
        "opencode"
    }

    async fn status(&self, session_id: &str) -> Result<SessionStatus, BackendError> {
        let url = self.endpoint(&["session", "status"])?;
        let body = self.get_json(url.clone()).await?;
        if !body.is_object() {
            return Err(BackendError::Decode {
                url: url.to_string(),
                message: "expected a JSON object of session statuses".to_string(),
            });
        }
        Ok(parse_status(&body, session_id))
    }

    async fn messages(&self, session_id: &str) -> Result<Vec<Message>, BackendError> {
        let url = self.endpoint(&["session", session_id, "message"])?;
        let body = self.get_json(url.clone()).await?;
        parse_messages(&body).ok_or_else(|| BackendError::Decode {
            url: url.to_string(),
            message: "expected a JSON array of messages".to_string(),
        })
    }
}

/// Look up one session in the status map.
///
/// Sessions absent from the map, or with an unrecognized type, are `Unknown`.
fn parse_status(body: &Value, session_id: &str) -> SessionStatus {
    let kind = body
        .get(session_id)
        .and_then(|s| s.get("type").or_else(|| s.get("status")))
        .and_then(|t| t.as_str());

    match kind {
        Some("idle") => SessionStatus::Idle,
        Some("busy") | Some("retry") => SessionStatus::Active,
        _ => SessionStatus::Unknown,
    }
}

/// Convert the message array into `Message`s, preserving order.
///
/// Returns `None` when the body is not an array.
fn parse_messages(body: &Value) -> Option<Vec<Message>> {
    let arr = body.as_array()?;
    Some(arr.iter().map(parse_message).collect())
}

fn parse_message(msg: &Value) -> Message {
    // Role lives under `info` in server responses; flat exports put it at the top level.
    let role = msg
        .get("info")
        .and_then(|i| i.get("role"))
        .or_else(|| msg.get("role"))
        .and_then(|r| r.as_str())
        .map(Role::parse)
        .unwrap_or(Role::Other);

    let text = msg
        .get("parts")
        .and_then(|p| p.as_array())
        .map(|parts| {
            parts
                .iter()
                .filter_map(part_text)
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default();

    Message { role, text }
}

/// Text of a `text` part. Accepts both `{type, text}` and `{type, data: {text}}`.
fn part_text(part: &Value) -> Option<&str> {
    if part.get("type").and_then(|t| t.as_str()) != Some("text") {
        return None;
    }
    let data = part.get("data").unwrap_or(part);
    data.get("text").and_then(|t| t.as_str())
}
