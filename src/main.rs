use std::sync::Arc;

use anyhow::{Context, anyhow};

use mail_agent::agent::{ConfigHandle, Orchestrator};
use mail_agent::channels::{EmailConfig, EmailTransport, MailTransport, StdinTransport};
use mail_agent::config::AgentConfig;
use mail_agent::llm::{LlmConfig, create_provider};
use mail_agent::store::{Database, LibSqlBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install rustls crypto provider"))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let test_mode = std::env::args().nth(1).as_deref() == Some("test");

    let settings = AgentConfig::from_env().context("Failed to read configuration")?;

    eprintln!("🐸 Mail Agent v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", settings.db_path.display());
    eprintln!("   Sessions: {} max", settings.session_capacity);

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&settings.db_path)
            .await
            .with_context(|| format!("Failed to open database at {}", settings.db_path.display()))?,
    );
    let config = ConfigHandle::load(Arc::clone(&db))
        .await
        .context("Failed to load config")?;
    let snapshot = config.snapshot().await;
    eprintln!("   Mode: {}", snapshot.mode.as_str());
    eprintln!("   Model: {}", snapshot.model.as_str());

    // ── Chat provider ────────────────────────────────────────────────────
    let provider = create_provider(&LlmConfig {
        api_key: settings.api_key.clone(),
        base_url: settings.api_base_url.clone(),
    })?;

    // ── Transport ────────────────────────────────────────────────────────
    let transport: Arc<dyn MailTransport> = if test_mode {
        Arc::new(StdinTransport::new())
    } else {
        let email = EmailConfig::from_env()
            .ok_or_else(|| anyhow!("EMAIL_IMAP_HOST not set; use `mail-agent test` for stdin mode"))?;
        eprintln!("   Mailbox: {} via {}", email.username, email.imap_host);
        Arc::new(EmailTransport::new(email))
    };
    eprintln!("   Transport: {}\n", transport.name());

    let agent = Arc::new(Orchestrator::new(&settings, db, config, provider));
    agent
        .run(transport)
        .await
        .context("Mail transport failed")?;

    Ok(())
}
