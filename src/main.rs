mod backend;
mod backoff;
mod classifier;
mod config;
mod credentials;
mod monitor;
mod notify;

use backend::opencode::OpencodeClient;
use classifier::CompletionClassifier;
use clap::Parser;
use config::WatchConfig;
use credentials::CredentialSources;
use monitor::{Monitor, MonitorSettings, TerminalState};
use notify::{Notification, NotificationKind, Notifier, TelegramNotifier};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Watch an OpenCode session until its task finishes, stalls, or times out,
/// then send a Telegram notification.
#[derive(Parser, Debug)]
#[command(name = "opencode-watch", version, about)]
pub struct Cli {
    /// OpenCode session ID to watch
    session_id: String,

    /// Task name shown in notifications
    task_name: String,

    /// Telegram chat ID to notify (default: from config)
    #[arg(long)]
    chat_id: Option<String>,

    /// Consecutive polls without new messages before giving up as stuck
    #[arg(long)]
    max_no_change: Option<u32>,

    /// Overall monitoring budget in seconds
    #[arg(long)]
    max_duration: Option<u64>,

    /// Seconds to wait after a failed poll
    #[arg(long)]
    retry_delay: Option<u64>,

    /// OpenCode server URL (default: http://127.0.0.1:4096)
    #[arg(long)]
    base_url: Option<String>,

    /// Project directory the OpenCode server should scope requests to
    #[arg(long)]
    directory: Option<String>,

    /// Extra completion keyword (repeatable)
    #[arg(long = "keyword", value_name = "WORD")]
    keywords: Vec<String>,

    /// Config file path
    #[arg(short, long, default_value = "opencode-watch.toml")]
    config: PathBuf,

    /// Print resolved settings, don't poll
    #[arg(long)]
    dry_run: bool,

    /// Send a test update notification and exit
    #[arg(long)]
    test_notify: bool,

    /// Extra logging (every observation)
    #[arg(short, long)]
    verbose: bool,

    /// Only warnings and errors
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

impl Cli {
    /// CLI flags take precedence over the config file.
    fn apply_overrides(&self, config: &mut WatchConfig) {
        if let Some(ref chat_id) = self.chat_id {
            config.notify.chat_id = chat_id.clone();
        }
        if let Some(n) = self.max_no_change {
            config.monitor.max_no_change = n;
        }
        if let Some(secs) = self.max_duration {
            config.monitor.max_duration_secs = secs;
        }
        if let Some(secs) = self.retry_delay {
            config.monitor.retry_delay_secs = secs;
        }
        if let Some(ref url) = self.base_url {
            config.backend.base_url = url.clone();
        }
        if let Some(ref dir) = self.directory {
            config.backend.directory = Some(dir.clone());
        }
    }
}

fn init_tracing(verbose: bool, quiet: bool) {
    let default_level = if verbose {
        "opencode_watch=debug"
    } else if quiet {
        "opencode_watch=warn"
    } else {
        "opencode_watch=info"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();
}

/// Cancel the token on Ctrl-C or SIGTERM.
fn spawn_signal_listener(cancel: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = term.recv() => {}
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to install SIGTERM handler");
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        tracing::info!("received shutdown signal");
        cancel.cancel();
    });
}

fn print_settings(
    cli: &Cli,
    config: &WatchConfig,
    classifier: &CompletionClassifier,
    notifier: &TelegramNotifier,
) {
    println!("opencode-watch v{}", env!("CARGO_PKG_VERSION"));
    println!("Config file:      {}", cli.config.display());
    println!("Session:          {}", cli.session_id);
    println!("Task:             {}", cli.task_name);
    println!("Backend:          {}", config.backend.base_url);
    if let Some(ref dir) = config.backend.directory {
        println!("Directory:        {dir}");
    }
    println!("Max no-change:    {}", config.monitor.max_no_change);
    println!("Max duration:     {}s", config.monitor.max_duration_secs);
    println!("Retry delay:      {}s", config.monitor.retry_delay_secs);
    println!("Long-form chars:  {}", classifier.long_form_threshold());
    println!("Keywords:         {}", classifier.keywords().join(", "));
    println!("Chat ID:          {}", config.notify.chat_id);
    println!("Bot API:          {}", config.notify.api_base);
    println!(
        "Telegram:         {}",
        if notifier.is_configured() {
            "configured"
        } else {
            "not configured (notifications skipped)"
        }
    );
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);
    tracing::debug!(?cli, "parsed CLI arguments");

    let mut config = match config::load_config(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };
    cli.apply_overrides(&mut config);

    let mut classifier = CompletionClassifier::from_config(&config.classifier);
    classifier.extend_keywords(cli.keywords.iter().cloned());

    let cwd = std::env::current_dir().unwrap_or_default();
    let telegram = credentials::resolve_telegram_config(&CredentialSources::discover(&cwd));
    if telegram.is_none() {
        tracing::warn!(
            "{} not found in environment or .env files; notifications will be skipped",
            credentials::TOKEN_KEY
        );
    }
    let notifier = TelegramNotifier::new(
        telegram,
        config.notify.chat_id.clone(),
        Duration::from_secs(config.notify.timeout_secs),
    )
    .with_api_base(config.notify.api_base.clone());

    if cli.dry_run {
        print_settings(&cli, &config, &classifier, &notifier);
        println!("Dry run: settings resolved, not polling.");
        return ExitCode::SUCCESS;
    }

    if cli.test_notify {
        let notification = Notification::new(NotificationKind::Update, cli.task_name.clone());
        return match notifier.send(&notification).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                tracing::error!(error = %e, "test notification failed");
                ExitCode::FAILURE
            }
        };
    }

    let backend = match OpencodeClient::new(&config.backend) {
        Ok(b) => b,
        Err(e) => {
            tracing::error!(error = %e, "failed to create HTTP client");
            return ExitCode::FAILURE;
        }
    };

    let cancel = CancellationToken::new();
    spawn_signal_listener(cancel.clone());

    let settings = MonitorSettings::from(&config.monitor);
    let monitor = Monitor::new(&backend, &notifier, &classifier, settings);
    let outcome = monitor.run(&cli.session_id, &cli.task_name, &cancel).await;

    let summary = match outcome.state {
        TerminalState::Completed(reason) => format!("completed ({reason})"),
        TerminalState::Stuck => "stuck".to_string(),
        TerminalState::TimedOut => "timed out".to_string(),
        TerminalState::Interrupted => "interrupted".to_string(),
    };
    println!(
        "{}: {} after {} checks, {}",
        cli.task_name,
        summary,
        outcome.checks,
        notify::format_duration(outcome.elapsed)
    );

    if outcome.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
