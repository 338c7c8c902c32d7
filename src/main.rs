use clap::Parser;
use llm_relay::config::config_search_paths;
use llm_relay::{build_router, AppState, AuditLog, ProxyConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "llm-relay",
    about = "Chat-completion proxy translating between OpenAI, Anthropic and Gemini APIs",
    version
)]
struct Cli {
    /// Path to config file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Audit log path (overrides config)
    #[arg(long)]
    audit_log: Option<PathBuf>,

    /// Forward same-format requests untranslated
    #[arg(long)]
    direct: bool,

    /// Print config search paths and exit
    #[arg(long)]
    show_config_paths: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "llm_relay=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if cli.show_config_paths {
        println!("Config search paths:");
        for (i, path) in config_search_paths().iter().enumerate() {
            println!("  {}. {}", i + 1, path.display());
        }
        return Ok(());
    }

    let mut config = ProxyConfig::find_and_load(cli.config.as_deref())?;

    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(path) = cli.audit_log {
        config.audit_log = path;
    }
    if cli.direct {
        config.direct_mode = true;
    }

    // Validate config eagerly
    config.validate()?;

    info!("llm-relay v{}", env!("CARGO_PKG_VERSION"));
    for name in config.providers.keys() {
        info!(
            "  Provider:  {} ({}, {}, {} key(s))",
            name,
            config.provider_format(name)?,
            config.provider_base_url(name)?,
            config.provider_keys(name).len()
        );
    }
    if let Some(ref default) = config.default {
        info!("  Default:   {}/{}", default.provider, default.model);
    }
    info!("  Routes:    {}", config.routes.len());
    info!("  Direct:    {}", config.direct_mode);
    info!("  Audit log: {}", config.audit_log.display());

    let audit = AuditLog::open(&config.audit_log)?;
    let port = config.port;
    let state = Arc::new(AppState::from_config(config, audit)?);

    let app = build_router(state);
    let bind_addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;

    info!("Listening on http://{}", bind_addr);

    axum::serve(listener, app).await?;

    Ok(())
}
