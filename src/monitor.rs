/// Polling controller: observe the session on a backoff schedule until it
/// completes, stalls, runs out of time, or is interrupted.
///
/// Backend failures are never fatal. They are logged and retried after a
/// fixed delay without touching the progress counters. Every terminal state
/// except `Interrupted` sends exactly one notification; notification failures
/// are logged and do not change the outcome.
use crate::backend::SessionBackend;
use crate::backoff;
use crate::classifier::{Classification, CompletionClassifier, CompletionReason};
use crate::config::MonitorConfig;
use crate::notify::{Notification, NotificationKind, Notifier, NotifyError};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Limits for one monitoring run.
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    /// Consecutive polls without new messages before the task is declared stuck.
    pub max_no_change: u32,
    /// Wall-clock budget for the whole run.
    pub max_duration: Duration,
    /// Wait after a failed backend poll.
    pub retry_delay: Duration,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self::from(&MonitorConfig::default())
    }
}

impl From<&MonitorConfig> for MonitorSettings {
    fn from(config: &MonitorConfig) -> Self {
        Self {
            max_no_change: config.max_no_change,
            max_duration: Duration::from_secs(config.max_duration_secs),
            retry_delay: Duration::from_secs(config.retry_delay_secs),
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalState {
    Completed(CompletionReason),
    Stuck,
    TimedOut,
    Interrupted,
}

impl TerminalState {
    fn notification_kind(&self) -> Option<NotificationKind> {
        match self {
            TerminalState::Completed(_) => Some(NotificationKind::Completed),
            TerminalState::Stuck => Some(NotificationKind::Stuck),
            TerminalState::TimedOut => Some(NotificationKind::TimedOut),
            TerminalState::Interrupted => None,
        }
    }
}

/// Result of a monitoring run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorOutcome {
    pub state: TerminalState,
    /// Number of iterations started, including failed polls.
    pub checks: u32,
    pub elapsed: Duration,
    /// Message count of the most recent successful observation, if any.
    pub message_count: Option<usize>,
}

impl MonitorOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self.state, TerminalState::Completed(_))
    }
}

/// Mutable per-run counters.
#[derive(Debug)]
struct PollState {
    check_count: u32,
    last_message_count: usize,
    no_change_count: u32,
    observed_count: Option<usize>,
    start: Instant,
}

impl PollState {
    fn new(start: Instant) -> Self {
        Self {
            check_count: 0,
            last_message_count: 0,
            no_change_count: 0,
            observed_count: None,
            start,
        }
    }

    /// Record the message count of a successful poll. Returns whether it changed.
    fn record_count(&mut self, current: usize) -> bool {
        self.observed_count = Some(current);
        if current != self.last_message_count {
            self.last_message_count = current;
            self.no_change_count = 0;
            true
        } else {
            self.no_change_count += 1;
            false
        }
    }
}

pub struct Monitor<'a> {
    backend: &'a dyn SessionBackend,
    notifier: &'a dyn Notifier,
    classifier: &'a CompletionClassifier,
    settings: MonitorSettings,
}

impl<'a> Monitor<'a> {
    pub fn new(
        backend: &'a dyn SessionBackend,
        notifier: &'a dyn Notifier,
        classifier: &'a CompletionClassifier,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            backend,
            notifier,
            classifier,
            settings,
        }
    }

    /// Watch `session_id` until a terminal state is reached.
    pub async fn run(
        &self,
        session_id: &str,
        task_name: &str,
        cancel: &CancellationToken,
    ) -> MonitorOutcome {
        info!(
            session_id,
            task = task_name,
            backend = self.backend.name(),
            max_no_change = self.settings.max_no_change,
            max_duration_secs = self.settings.max_duration.as_secs(),
            "monitoring started"
        );

        let mut state = PollState::new(Instant::now());
        let terminal = self.poll_until_terminal(session_id, &mut state, cancel).await;

        let outcome = MonitorOutcome {
            state: terminal,
            checks: state.check_count,
            elapsed: state.start.elapsed(),
            message_count: state.observed_count,
        };

        match outcome.state {
            TerminalState::Completed(reason) => info!(
                %reason,
                checks = outcome.checks,
                elapsed_secs = outcome.elapsed.as_secs(),
                messages = ?outcome.message_count,
                "task completed"
            ),
            TerminalState::Interrupted => warn!(checks = outcome.checks, "monitoring interrupted"),
            other => warn!(
                state = ?other,
                checks = outcome.checks,
                elapsed_secs = outcome.elapsed.as_secs(),
                messages = ?outcome.message_count,
                "monitoring stopped without a completion signal"
            ),
        }

        self.notify(task_name, &outcome).await;
        outcome
    }

    async fn poll_until_terminal(
        &self,
        session_id: &str,
        state: &mut PollState,
        cancel: &CancellationToken,
    ) -> TerminalState {
        loop {
            state.check_count += 1;

            let elapsed = state.start.elapsed();
            if elapsed > self.settings.max_duration {
                warn!(
                    elapsed_secs = elapsed.as_secs(),
                    max_duration_secs = self.settings.max_duration.as_secs(),
                    "monitoring deadline exceeded"
                );
                return TerminalState::TimedOut;
            }

            let polled = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = self.backend.observe(session_id) => Some(result),
            };
            let observation = match polled {
                None => return TerminalState::Interrupted,
                Some(Ok(obs)) => obs,
                Some(Err(e)) => {
                    warn!(
                        check = state.check_count,
                        error = %e,
                        retry_in_secs = self.settings.retry_delay.as_secs(),
                        "failed to poll session, retrying"
                    );
                    if self.pause(self.settings.retry_delay, cancel).await {
                        return TerminalState::Interrupted;
                    }
                    continue;
                }
            };

            let current = observation.messages.len();
            debug!(
                check = state.check_count,
                status = ?observation.status,
                messages = current,
                "observation"
            );

            if let Classification::Completed(reason) = self.classifier.classify(
                observation.status,
                &observation.messages,
                state.last_message_count,
            ) {
                state.observed_count = Some(current);
                return TerminalState::Completed(reason);
            }

            if state.record_count(current) {
                info!(messages = current, "new messages detected");
            }

            if state.no_change_count >= self.settings.max_no_change {
                warn!(
                    no_change = state.no_change_count,
                    "no new messages for too many checks, task may be stuck"
                );
                return TerminalState::Stuck;
            }

            let wait = backoff::next_interval(state.check_count);
            info!(
                check = state.check_count,
                messages = current,
                no_change = state.no_change_count,
                wait_secs = wait.as_secs(),
                "task in progress"
            );
            if self.pause(wait, cancel).await {
                return TerminalState::Interrupted;
            }
        }
    }

    /// Sleep for `wait`. Returns true if interrupted first.
    async fn pause(&self, wait: Duration, cancel: &CancellationToken) -> bool {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => true,
            _ = tokio::time::sleep(wait) => false,
        }
    }

    async fn notify(&self, task_name: &str, outcome: &MonitorOutcome) {
        let Some(kind) = outcome.state.notification_kind() else {
            return;
        };

        let mut notification = Notification::new(kind, task_name).with_duration(outcome.elapsed);
        if let Some(count) = outcome.message_count {
            notification = notification.with_message_count(count);
        }

        match self.notifier.send(&notification).await {
            Ok(()) => {}
            Err(NotifyError::MissingCredential) => {
                warn!("no telegram credentials configured, skipping notification");
            }
            Err(e) => error!(error = %e, "failed to send notification"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendError, Message, Observation, SessionStatus};
    use crate::notify::TelegramNotifier;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    type Script = Box<dyn Fn(u32) -> Result<Observation, BackendError> + Send + Sync>;

    /// Backend whose n-th observation (0-based) comes from a closure.
    struct ScriptedBackend {
        script: Script,
        calls: AtomicU32,
    }

    impl ScriptedBackend {
        fn new(
            script: impl Fn(u32) -> Result<Observation, BackendError> + Send + Sync + 'static,
        ) -> Self {
            Self {
                script: Box::new(script),
                calls: AtomicU32::new(0),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SessionBackend for ScriptedBackend {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn status(&self, _session_id: &str) -> Result<SessionStatus, BackendError> {
            unreachable!("monitor only calls observe")
        }

        async fn messages(&self, _session_id: &str) -> Result<Vec<Message>, BackendError> {
            unreachable!("monitor only calls observe")
        }

        async fn observe(&self, _session_id: &str) -> Result<Observation, BackendError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            (self.script)(n)
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<Notification>>,
        fail: bool,
    }

    impl RecordingNotifier {
        fn failing() -> Self {
            Self {
                fail: true,
                ..Default::default()
            }
        }

        fn sent(&self) -> Vec<Notification> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
            self.sent.lock().unwrap().push(notification.clone());
            if self.fail {
                return Err(NotifyError::Status {
                    status: 502,
                    body: "bad gateway".to_string(),
                });
            }
            Ok(())
        }
    }

    fn observation(status: SessionStatus, messages: Vec<Message>) -> Observation {
        Observation { status, messages }
    }

    fn working() -> Observation {
        observation(
            SessionStatus::Active,
            vec![
                Message::user("optimize the strategy"),
                Message::assistant("working on it"),
            ],
        )
    }

    fn backend_down() -> BackendError {
        BackendError::Status {
            url: "http://127.0.0.1:4096/session/status".to_string(),
            status: 503,
        }
    }

    #[test]
    fn poll_state_counters() {
        let mut state = PollState::new(Instant::now());
        assert!(state.record_count(3));
        assert_eq!(state.last_message_count, 3);
        assert_eq!(state.no_change_count, 0);

        assert!(!state.record_count(3));
        assert!(!state.record_count(3));
        assert_eq!(state.no_change_count, 2);
        assert_eq!(state.last_message_count, 3);

        assert!(state.record_count(5));
        assert_eq!(state.no_change_count, 0);
        assert_eq!(state.observed_count, Some(5));
    }

    #[test]
    fn settings_from_config() {
        let settings = MonitorSettings::default();
        assert_eq!(settings.max_no_change, 15);
        assert_eq!(settings.max_duration, Duration::from_secs(3600));
        assert_eq!(settings.retry_delay, Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn completes_when_idle_with_assistant_last() {
        let backend = ScriptedBackend::new(|n| {
            if n < 2 {
                Ok(working())
            } else {
                Ok(observation(
                    SessionStatus::Idle,
                    vec![Message::user("go"), Message::assistant("ok")],
                ))
            }
        });
        let notifier = RecordingNotifier::default();
        let classifier = CompletionClassifier::default();
        let monitor = Monitor::new(&backend, &notifier, &classifier, MonitorSettings::default());

        let outcome = monitor
            .run("ses_1", "backtest", &CancellationToken::new())
            .await;

        assert_eq!(
            outcome.state,
            TerminalState::Completed(CompletionReason::IdleAssistant)
        );
        assert!(outcome.is_success());
        assert_eq!(outcome.checks, 3);
        assert_eq!(outcome.message_count, Some(2));
        // Two 30s waits before the third check.
        assert_eq!(outcome.elapsed.as_secs(), 60);

        let sent = notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, NotificationKind::Completed);
        assert_eq!(sent[0].task_name, "backtest");
        assert_eq!(sent[0].message_count, Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_after_max_no_change_polls() {
        let backend = ScriptedBackend::new(|_| Ok(working()));
        let notifier = RecordingNotifier::default();
        let classifier = CompletionClassifier::default();
        let monitor = Monitor::new(&backend, &notifier, &classifier, MonitorSettings::default());

        let outcome = monitor
            .run("ses_1", "backtest", &CancellationToken::new())
            .await;

        assert_eq!(outcome.state, TerminalState::Stuck);
        assert!(!outcome.is_success());
        // First poll sees new messages, then 15 unchanged polls.
        assert_eq!(outcome.checks, 16);
        assert_eq!(backend.calls(), 16);

        let sent = notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, NotificationKind::Stuck);
        assert_eq!(sent[0].message_count, Some(2));
        assert!(sent[0].render().contains("may be stuck"));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_completion_signal_wins_over_stuck() {
        let backend = ScriptedBackend::new(|_| {
            Ok(observation(
                SessionStatus::Active,
                vec![Message::user("go"), Message::assistant("Summary: all fixed")],
            ))
        });
        let notifier = RecordingNotifier::default();
        let classifier = CompletionClassifier::default();
        let monitor = Monitor::new(&backend, &notifier, &classifier, MonitorSettings::default());

        let outcome = monitor.run("ses_1", "t", &CancellationToken::new()).await;

        // First poll: count changed 0 -> 2. Second poll: unchanged with keyword.
        assert_eq!(
            outcome.state,
            TerminalState::Completed(CompletionReason::StalledSignal)
        );
        assert_eq!(outcome.checks, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_without_polling_again() {
        // Message count grows every poll, so the task is never stuck.
        let backend = ScriptedBackend::new(|n| {
            let messages = (0..=n).map(|i| Message::user(format!("step {i}"))).collect();
            Ok(observation(SessionStatus::Active, messages))
        });
        let notifier = RecordingNotifier::default();
        let classifier = CompletionClassifier::default();
        let settings = MonitorSettings {
            max_duration: Duration::from_secs(100),
            ..Default::default()
        };
        let monitor = Monitor::new(&backend, &notifier, &classifier, settings);

        let outcome = monitor.run("ses_1", "t", &CancellationToken::new()).await;

        // Polls at t=0, 30, 60; the check at t=120 hits the deadline.
        assert_eq!(outcome.state, TerminalState::TimedOut);
        assert_eq!(backend.calls(), 3);
        assert_eq!(outcome.checks, 4);
        assert_eq!(outcome.message_count, Some(3));

        let sent = notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, NotificationKind::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried() {
        let backend = ScriptedBackend::new(|n| match n {
            0 | 1 => Err(backend_down()),
            _ => Ok(observation(
                SessionStatus::Idle,
                vec![Message::assistant("done")],
            )),
        });
        let notifier = RecordingNotifier::default();
        let classifier = CompletionClassifier::default();
        let monitor = Monitor::new(&backend, &notifier, &classifier, MonitorSettings::default());

        let outcome = monitor.run("ses_1", "t", &CancellationToken::new()).await;

        assert!(outcome.is_success());
        assert_eq!(outcome.checks, 3);
        assert_eq!(outcome.elapsed.as_secs(), 60);
        assert_eq!(notifier.sent().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn errors_do_not_advance_no_change_counter() {
        // Alternate failures with an unchanged history: only successful polls count.
        let backend = ScriptedBackend::new(|n| {
            if n % 2 == 1 {
                Err(backend_down())
            } else {
                Ok(working())
            }
        });
        let notifier = RecordingNotifier::default();
        let classifier = CompletionClassifier::default();
        let settings = MonitorSettings {
            max_no_change: 3,
            ..Default::default()
        };
        let monitor = Monitor::new(&backend, &notifier, &classifier, settings);

        let outcome = monitor.run("ses_1", "t", &CancellationToken::new()).await;

        // Successes on calls 0, 2, 4, 6: first changes the count, the next three do not.
        assert_eq!(outcome.state, TerminalState::Stuck);
        assert_eq!(backend.calls(), 7);
        assert_eq!(outcome.checks, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_before_any_observation_omits_count() {
        let backend = ScriptedBackend::new(|_| Err(backend_down()));
        let notifier = RecordingNotifier::default();
        let classifier = CompletionClassifier::default();
        let settings = MonitorSettings {
            max_duration: Duration::from_secs(45),
            ..Default::default()
        };
        let monitor = Monitor::new(&backend, &notifier, &classifier, settings);

        let outcome = monitor.run("ses_1", "t", &CancellationToken::new()).await;

        assert_eq!(outcome.state, TerminalState::TimedOut);
        assert_eq!(outcome.message_count, None);
        let sent = notifier.sent();
        assert_eq!(sent.len(), 1);
        assert!(!sent[0].render().contains("Messages"));
    }

    #[tokio::test(start_paused = true)]
    async fn interrupted_before_first_poll() {
        let backend = ScriptedBackend::new(|_| Ok(working()));
        let notifier = RecordingNotifier::default();
        let classifier = CompletionClassifier::default();
        let monitor = Monitor::new(&backend, &notifier, &classifier, MonitorSettings::default());

        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = monitor.run("ses_1", "t", &cancel).await;

        assert_eq!(outcome.state, TerminalState::Interrupted);
        assert_eq!(backend.calls(), 0);
        assert!(notifier.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn interrupted_during_sleep() {
        let backend = ScriptedBackend::new(|_| Ok(working()));
        let notifier = RecordingNotifier::default();
        let classifier = CompletionClassifier::default();
        let monitor = Monitor::new(&backend, &notifier, &classifier, MonitorSettings::default());

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(45)).await;
            trigger.cancel();
        });

        let outcome = monitor.run("ses_1", "t", &cancel).await;

        // Polls at t=0 and t=30; cancelled at t=45 while waiting for t=60.
        assert_eq!(outcome.state, TerminalState::Interrupted);
        assert_eq!(backend.calls(), 2);
        assert_eq!(outcome.elapsed.as_secs(), 45);
        assert!(notifier.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn notifier_failure_does_not_change_outcome() {
        let backend = ScriptedBackend::new(|_| {
            Ok(observation(
                SessionStatus::Idle,
                vec![Message::assistant("ok")],
            ))
        });
        let notifier = RecordingNotifier::failing();
        let classifier = CompletionClassifier::default();
        let monitor = Monitor::new(&backend, &notifier, &classifier, MonitorSettings::default());

        let outcome = monitor.run("ses_1", "t", &CancellationToken::new()).await;

        assert!(outcome.is_success());
        assert_eq!(notifier.sent().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_credentials_skip_notification() {
        let backend = ScriptedBackend::new(|_| Ok(working()));
        let notifier = TelegramNotifier::new(None, "1", Duration::from_secs(10));
        let classifier = CompletionClassifier::default();
        let settings = MonitorSettings {
            max_no_change: 1,
            ..Default::default()
        };
        let monitor = Monitor::new(&backend, &notifier, &classifier, settings);

        let outcome = monitor.run("ses_1", "t", &CancellationToken::new()).await;

        assert_eq!(outcome.state, TerminalState::Stuck);
        assert_eq!(outcome.checks, 2);
    }

    /// Backend without a status endpoint; the history never changes.
    struct StatuslessBackend {
        history: Vec<Message>,
        message_calls: AtomicU32,
    }

    impl StatuslessBackend {
        fn new(history: Vec<Message>) -> Self {
            Self {
                history,
                message_calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl SessionBackend for StatuslessBackend {
        fn name(&self) -> &str {
            "statusless"
        }

        async fn status(&self, _session_id: &str) -> Result<SessionStatus, BackendError> {
            Err(BackendError::Status {
                url: "http://127.0.0.1:4096/session/status".to_string(),
                status: 404,
            })
        }

        async fn messages(&self, _session_id: &str) -> Result<Vec<Message>, BackendError> {
            self.message_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.history.clone())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn completes_from_content_when_status_unavailable() {
        let backend = StatuslessBackend::new(vec![
            Message::user("go"),
            Message::assistant("✅ All fixed. Summary: done"),
        ]);
        let notifier = RecordingNotifier::default();
        let classifier = CompletionClassifier::default();
        let monitor = Monitor::new(&backend, &notifier, &classifier, MonitorSettings::default());

        let outcome = monitor.run("ses_1", "t", &CancellationToken::new()).await;

        assert_eq!(
            outcome.state,
            TerminalState::Completed(CompletionReason::StalledSignal)
        );
        assert_eq!(outcome.checks, 2);
        assert_eq!(backend.message_calls.load(Ordering::SeqCst), 2);
        assert_eq!(outcome.elapsed.as_secs(), 30);
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_when_status_unavailable_and_history_unchanged() {
        let backend = StatuslessBackend::new(vec![
            Message::user("go"),
            Message::assistant("still thinking"),
        ]);
        let notifier = RecordingNotifier::default();
        let classifier = CompletionClassifier::default();
        let settings = MonitorSettings {
            max_no_change: 3,
            ..Default::default()
        };
        let monitor = Monitor::new(&backend, &notifier, &classifier, settings);

        let outcome = monitor.run("ses_1", "t", &CancellationToken::new()).await;

        assert_eq!(outcome.state, TerminalState::Stuck);
        assert_eq!(outcome.checks, 4);
        assert_eq!(outcome.message_count, Some(2));
    }
}
