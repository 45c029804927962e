/// Terminal-state notifications: message rendering and Telegram delivery.
use crate::credentials::TelegramCredentials;
use async_trait::async_trait;
use chrono::{DateTime, Local};
use std::time::Duration;

const TELEGRAM_API: &str = "https://api.telegram.org";

/// What the notification reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    Completed,
    Stuck,
    TimedOut,
    /// Generic progress update, not tied to a terminal state.
    Update,
}

/// A rendered-on-demand notification payload.
#[derive(Debug, Clone)]
pub struct Notification {
    pub kind: NotificationKind,
    pub task_name: String,
    pub at: DateTime<Local>,
    pub duration: Option<Duration>,
    pub message_count: Option<usize>,
}

impl Notification {
    pub fn new(kind: NotificationKind, task_name: impl Into<String>) -> Self {
        Self {
            kind,
            task_name: task_name.into(),
            at: Local::now(),
            duration: None,
            message_count: None,
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn with_message_count(mut self, count: usize) -> Self {
        self.message_count = Some(count);
        self
    }

    /// Telegram-Markdown text. Optional fields are left out when unset.
    pub fn render(&self) -> String {
        let (headline, time_label, footer) = match self.kind {
            NotificationKind::Completed => (
                "✅ *OpenCode task completed*",
                "Finished",
                "The task has finished. Please review the results.",
            ),
            NotificationKind::Stuck => (
                "⚠️ *OpenCode task may be stuck*",
                "Checked",
                "No new progress for a long time. The task may be done or hung; please check manually.",
            ),
            NotificationKind::TimedOut => (
                "⏰ *OpenCode task monitoring timed out*",
                "Checked",
                "The monitor gave up before the task finished; please check manually.",
            ),
            NotificationKind::Update => (
                "ℹ️ *OpenCode task update*",
                "Time",
                "There is new progress, take a look.",
            ),
        };

        let mut lines = vec![
            headline.to_string(),
            String::new(),
            format!("📋 Task: {}", escape_markdown(&self.task_name)),
            format!("🕐 {}: {}", time_label, self.at.format("%Y-%m-%d %H:%M:%S")),
        ];
        if let Some(d) = self.duration {
            lines.push(format!("⏱ Elapsed: {}", format_duration(d)));
        }
        if let Some(n) = self.message_count {
            lines.push(format!("💬 Messages: {n}"));
        }
        lines.push(String::new());
        lines.push(footer.to_string());
        lines.join("\n")
    }
}

/// Escape the characters legacy Telegram Markdown treats as markup.
fn escape_markdown(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '_' | '*' | '`' | '[') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Format as `1h 02m 03s`, `4m 05s`, or `7s`.
pub fn format_duration(d: Duration) -> String {
    let total = d.as_secs();
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    if h > 0 {
        format!("{h}h {m:02}m {s:02}s")
    } else if m > 0 {
        format!("{m}m {s:02}s")
    } else {
        format!("{s}s")
    }
}

/// Errors from notification delivery.
#[derive(Debug)]
pub enum NotifyError {
    /// No bot token could be resolved; delivery is skipped.
    MissingCredential,
    /// The request could not be built, sent, or timed out.
    Delivery { source: reqwest::Error },
    /// Telegram rejected the message.
    Status { status: u16, body: String },
}

impl std::fmt::Display for NotifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotifyError::MissingCredential => {
                write!(f, "no telegram bot token configured")
            }
            NotifyError::Delivery { source } => {
                write!(f, "failed to send telegram notification: {}", source)
            }
            NotifyError::Status { status, body } => {
                write!(f, "telegram returned HTTP {}: {}", status, body)
            }
        }
    }
}

impl std::error::Error for NotifyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            NotifyError::Delivery { source } => Some(source),
            NotifyError::MissingCredential | NotifyError::Status { .. } => None,
        }
    }
}

// The request URL embeds the bot token, so it is stripped before the error is logged.
impl From<reqwest::Error> for NotifyError {
    fn from(e: reqwest::Error) -> Self {
        NotifyError::Delivery {
            source: e.without_url(),
        }
    }
}

/// Destination for terminal-state notifications.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Sends notifications through the Telegram Bot API `sendMessage` call.
pub struct TelegramNotifier {
    credentials: Option<TelegramCredentials>,
    chat_id: String,
    timeout: Duration,
    api_base: String,
}

impl TelegramNotifier {
    pub fn new(
        credentials: Option<TelegramCredentials>,
        chat_id: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            credentials,
            chat_id: chat_id.into(),
            timeout,
            api_base: TELEGRAM_API.to_string(),
        }
    }

    /// Point at a different Bot API host.
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    pub fn is_configured(&self) -> bool {
        self.credentials.is_some()
    }

    fn build_client(&self, creds: &TelegramCredentials) -> Result<reqwest::Client, NotifyError> {
        let mut builder = reqwest::Client::builder().timeout(self.timeout);
        builder = match creds.proxy {
            Some(ref proxy) => builder.proxy(reqwest::Proxy::all(proxy.as_str())?),
            None => builder.no_proxy(),
        };
        Ok(builder.build()?)
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        let creds = self
            .credentials
            .as_ref()
            .ok_or(NotifyError::MissingCredential)?;
        let client = self.build_client(creds)?;

        let url = format!("{}/bot{}/sendMessage", self.api_base, creds.bot_token);
        let payload = serde_json::json!({
            "chat_id": &self.chat_id,
            "text": notification.render(),
            "parse_mode": "Markdown",
        });

        let resp = client.post(&url).json(&payload).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(NotifyError::Status {
                status: status.as_u16(),
                body,
            });
        }

        tracing::info!(chat_id = %self.chat_id, kind = ?notification.kind, "telegram notification sent");
        Ok(())
    }
}
