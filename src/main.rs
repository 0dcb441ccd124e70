use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, bail};
use secrecy::SecretString;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use exec_assist::calendar::{CalendarProvider, GoogleCalendar};
use exec_assist::config::AssistantConfig;
use exec_assist::inbox::{ImapInbox, InboxPoller, spawn_inbox_poller};
use exec_assist::llm::{LlmConfig, create_provider};
use exec_assist::mail::{ImapConfig, Mailer, SendGridMailer, SmtpConfig, SmtpMailer};
use exec_assist::pipeline::{ActivityRecorder, MeetingProcessor};
use exec_assist::store::{ActivityStore, LibSqlBackend};
use exec_assist::summary::{SummaryService, spawn_summary_ticker};
use exec_assist::web;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Pick up a local .env before reading anything else
    dotenvy::dotenv().ok();

    // Install rustls crypto provider before any TLS usage
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        bail!("Failed to install rustls crypto provider");
    }

    let _log_guard = init_tracing();

    let config = AssistantConfig::from_env().context("invalid assistant configuration")?;

    // ── LLM ─────────────────────────────────────────────────────────────
    let llm_config = LlmConfig::from_env().context("LLM configuration")?;
    eprintln!("📅 Exec Assist v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", llm_config.model);
    let llm = create_provider(&llm_config)?;

    // ── Calendar ────────────────────────────────────────────────────────
    let token = std::env::var("GOOGLE_CALENDAR_TOKEN")
        .context("GOOGLE_CALENDAR_TOKEN not set")?;
    let calendar: Arc<dyn CalendarProvider> = Arc::new(GoogleCalendar::new(
        SecretString::from(token),
        config.calendar_owner.clone(),
    ));

    // ── Mail ────────────────────────────────────────────────────────────
    let mailer = mailer_from_env()?;
    eprintln!("   Mailer: {}", mailer.name());

    // ── Database ────────────────────────────────────────────────────────
    let db_path = std::env::var("EXEC_ASSIST_DB_PATH")
        .unwrap_or_else(|_| "./data/exec-assist.db".to_string());
    let store: Arc<dyn ActivityStore> = Arc::new(
        LibSqlBackend::new_local(Path::new(&db_path))
            .await
            .with_context(|| format!("failed to open database at {db_path}"))?,
    );
    eprintln!("   Database: {}", db_path);

    // ── Pipeline ────────────────────────────────────────────────────────
    let recorder = Arc::new(ActivityRecorder::new(store, config.store_attempts));
    let summary = Arc::new(SummaryService::new(
        Arc::clone(&recorder),
        Arc::clone(&llm),
        config.llm_timeout,
        config.business_hours.offset,
    ));
    let processor = Arc::new(MeetingProcessor::new(
        config,
        llm,
        calendar,
        Arc::clone(&mailer),
        recorder,
    ));

    // ── Daily summary ticker ────────────────────────────────────────────
    match (
        std::env::var("EXEC_ASSIST_SUMMARY_CRON"),
        std::env::var("EXEC_ASSIST_SUMMARY_RECIPIENT"),
    ) {
        (Ok(schedule), Ok(recipient)) => {
            spawn_summary_ticker(&schedule, Arc::clone(&summary), Arc::clone(&mailer), recipient)
                .map_err(anyhow::Error::msg)
                .context("EXEC_ASSIST_SUMMARY_CRON")?;
            eprintln!("   Summary: {}", schedule);
        }
        (Ok(_), Err(_)) => warn!("EXEC_ASSIST_SUMMARY_CRON set without a recipient, ticker disabled"),
        _ => {}
    }

    // ── Inbox poller ────────────────────────────────────────────────────
    let inbox_shutdown = match ImapConfig::from_env() {
        Some(imap) => {
            eprintln!("   Inbox: {} every {}s", imap.host, imap.poll_interval.as_secs());
            let interval = imap.poll_interval;
            let own_address = imap.own_address.clone();
            let poller = InboxPoller::new(
                Arc::new(ImapInbox::new(imap)),
                Arc::clone(&processor),
                own_address,
            );
            let (_handle, shutdown) = spawn_inbox_poller(poller, interval);
            Some(shutdown)
        }
        None => {
            info!("EMAIL_IMAP_HOST not set, inbox polling disabled");
            None
        }
    };

    // ── HTTP ────────────────────────────────────────────────────────────
    let port: u16 = std::env::var("EXEC_ASSIST_PORT")
        .unwrap_or_else(|_| "8080".to_string())
        .parse()
        .context("EXEC_ASSIST_PORT must be a port number")?;
    let app = web::routes(processor, summary);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port))
        .await
        .with_context(|| format!("failed to bind port {port}"))?;
    eprintln!("   API: http://0.0.0.0:{}/api/process\n", port);
    info!(port, "Exec Assist listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutting down");
            if let Some(flag) = &inbox_shutdown {
                flag.store(true, std::sync::atomic::Ordering::Relaxed);
            }
        })
        .await
        .context("server error")?;
    Ok(())
}

/// Stderr logging, plus a daily rolling file when `EXEC_ASSIST_LOG_DIR` is set.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    match std::env::var("EXEC_ASSIST_LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "exec-assist.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        Err(_) => {
            tracing_subscriber::registry().with(filter).with(stderr).init();
            None
        }
    }
}

/// SendGrid when `SENDGRID_API_KEY` is set, otherwise SMTP.
fn mailer_from_env() -> anyhow::Result<Arc<dyn Mailer>> {
    if let Ok(key) = std::env::var("SENDGRID_API_KEY") {
        let from = std::env::var("EXEC_ASSIST_FROM_ADDRESS")
            .context("EXEC_ASSIST_FROM_ADDRESS is required with SENDGRID_API_KEY")?;
        return Ok(Arc::new(SendGridMailer::new(SecretString::from(key), from)));
    }
    match SmtpConfig::from_env() {
        Some(config) => Ok(Arc::new(SmtpMailer::new(config))),
        None => bail!("Set SENDGRID_API_KEY or EMAIL_SMTP_HOST to send replies"),
    }
}
