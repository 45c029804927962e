/// Completion detection: decide from one observation whether the task is done.
///
/// Two signals are used, strongest first:
/// - the backend reports the session idle and the assistant spoke last;
/// - the message count stopped growing and the assistant's last message
///   looks like a final report (long-form, or contains a completion keyword).
use crate::backend::{Message, Role, SessionStatus};
use crate::config::ClassifierConfig;

/// Built-in completion keywords. Matched case-sensitively as substrings.
pub const DEFAULT_KEYWORDS: &[&str] = &[
    "done", "Done", "DONE", "finished", "Finished", "completed", "Completed", "summary",
    "Summary", "fixed", "Fixed", "report", "Report", "完成", "总结", "优化", "修复", "报告",
    "✅", "✔",
];

/// Character count above which an assistant message counts as a final report.
pub const DEFAULT_LONG_FORM_THRESHOLD: usize = 800;

/// Why a session was judged complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionReason {
    /// Backend status idle with an assistant message last.
    IdleAssistant,
    /// No new messages, and the last assistant message carries a completion signal.
    StalledSignal,
}

impl CompletionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompletionReason::IdleAssistant => "idle+assistant",
            CompletionReason::StalledSignal => "stalled+signal",
        }
    }
}

impl std::fmt::Display for CompletionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classifier verdict for a single observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Completed(CompletionReason),
    InProgress,
}

pub struct CompletionClassifier {
    keywords: Vec<String>,
    long_form_threshold: usize,
}

impl CompletionClassifier {
    pub fn new(keywords: Vec<String>, long_form_threshold: usize) -> Self {
        Self {
            keywords,
            long_form_threshold,
        }
    }

    /// Build from config: `keywords` replaces the built-in set, `extra_keywords` extends it.
    pub fn from_config(config: &ClassifierConfig) -> Self {
        let mut keywords = match config.keywords {
            Some(ref kws) => kws.clone(),
            None => DEFAULT_KEYWORDS.iter().map(|k| k.to_string()).collect(),
        };
        for kw in &config.extra_keywords {
            if !keywords.contains(kw) {
                keywords.push(kw.clone());
            }
        }
        keywords.retain(|k| !k.is_empty());
        Self::new(keywords, config.long_form_threshold)
    }

    /// Add keywords to the set, skipping empties and duplicates.
    pub fn extend_keywords<I, S>(&mut self, extra: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for kw in extra {
            let kw = kw.into();
            if !kw.is_empty() && !self.keywords.contains(&kw) {
                self.keywords.push(kw);
            }
        }
    }

    pub fn keywords(&self) -> &[String] {
        &self.keywords
    }

    pub fn long_form_threshold(&self) -> usize {
        self.long_form_threshold
    }

    /// Whether a message's text looks like a final result.
    pub fn has_completion_signal(&self, text: &str) -> bool {
        if text.chars().count() > self.long_form_threshold {
            return true;
        }
        self.keywords.iter().any(|kw| text.contains(kw.as_str()))
    }

    /// Classify one observation against the message count from the previous poll.
    pub fn classify(
        &self,
        status: SessionStatus,
        messages: &[Message],
        last_message_count: usize,
    ) -> Classification {
        let Some(last) = messages.last() else {
            return Classification::InProgress;
        };
        if last.role != Role::Assistant {
            return Classification::InProgress;
        }

        if status == SessionStatus::Idle {
            return Classification::Completed(CompletionReason::IdleAssistant);
        }

        if messages.len() == last_message_count && self.has_completion_signal(&last.text) {
            return Classification::Completed(CompletionReason::StalledSignal);
        }

        Classification::InProgress
    }
}

impl Default for CompletionClassifier {
    fn default() -> Self {
        Self::from_config(&ClassifierConfig::default())
    }
}
