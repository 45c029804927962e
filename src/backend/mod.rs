pub mod opencode;

use async_trait::async_trait;

/// Backend-reported execution state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// The session has stopped working and is waiting for input.
    Idle,
    /// The session is still generating or running tools.
    Active,
    /// The backend did not report a usable status.
    Unknown,
}

/// Author of a message in the session history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
    Other,
}

impl Role {
    /// Map a backend role string onto a `Role`.
    pub fn parse(s: &str) -> Self {
        match s {
            "user" => Role::User,
            "assistant" => Role::Assistant,
            _ => Role::Other,
        }
    }
}

/// One entry of the session history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub role: Role,
    pub text: String,
}

impl Message {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
        }
    }

    #[cfg(test)]
    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, text)
    }

    #[cfg(test)]
    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }
}

/// Status plus message history at one point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub status: SessionStatus,
    pub messages: Vec<Message>,
}

/// Errors produced while talking to the session backend.
///
/// All of them are treated as transient by the monitor loop.
#[derive(Debug)]
pub enum BackendError {
    /// The request could not be sent or timed out.
    Http { url: String, source: reqwest::Error },
    /// The backend answered with a non-success status code.
    Status { url: String, status: u16 },
    /// The response body was not in the expected shape.
    Decode { url: String, message: String },
    /// The configured base URL cannot be turned into an endpoint.
    InvalidUrl { url: String, message: String },
}

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendError::Http { url, source } => {
                write!(f, "request to {} failed: {}", url, source)
            }
            BackendError::Status { url, status } => {
                write!(f, "{} returned HTTP {}", url, status)
            }
            BackendError::Decode { url, message } => {
                write!(f, "unexpected response from {}: {}", url, message)
            }
            BackendError::InvalidUrl { url, message } => {
                write!(f, "invalid backend URL {}: {}", url, message)
            }
        }
    }
}

impl std::error::Error for BackendError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BackendError::Http { source, .. } => Some(source),
            BackendError::Status { .. }
            | BackendError::Decode { .. }
            | BackendError::InvalidUrl { .. } => None,
        }
    }
}

/// A task-execution backend that can be polled for a session's progress.
#[async_trait]
pub trait SessionBackend: Send + Sync {
    /// Human-readable backend name (e.g., "opencode").
    fn name(&self) -> &str;

    /// Current execution state of the session.
    async fn status(&self, session_id: &str) -> Result<SessionStatus, BackendError>;

    /// Full ordered message history of the session.
    async fn messages(&self, session_id: &str) -> Result<Vec<Message>, BackendError>;

    /// Take one observation.
    ///
    /// Status is optional: a failed status call degrades to `Unknown` so the
    /// content heuristics still run. Only a failed history fetch is an error.
    async fn observe(&self, session_id: &str) -> Result<Observation, BackendError> {
        let status = match self.status(session_id).await {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!(
                    backend = self.name(),
                    error = %e,
                    "session status unavailable, falling back to message content"
                );
                SessionStatus::Unknown
            }
        };
        let messages = self.messages(session_id).await?;
        Ok(Observation { status, messages })
    }
}
