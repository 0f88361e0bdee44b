//! a3s-watch - audit-log push channel daemon
//!
//! Keeps one live watch channel per configured topic, serves the webhook
//! the provider pushes to, and renews channels before they lapse.

use a3s_watch::provider::google::{GoogleConfig, GoogleProvider, StaticToken};
use a3s_watch::reader::ActivityReader;
use a3s_watch::server::{build_router, ServerState};
use a3s_watch::{EventFilter, ResourceKey, RetryPolicy, WatchConfig, WatchService};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::TryStreamExt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "a3s-watch")]
#[command(author = "A3S Lab Team")]
#[command(version)]
#[command(about = "Audit-log push notification channels")]
struct Cli {
    /// Configuration file path (.hcl)
    #[arg(short, long, env = "A3S_WATCH_CONFIG")]
    config: Option<PathBuf>,

    /// OAuth access token for the Reports API
    #[arg(long, env = "A3S_WATCH_ACCESS_TOKEN", hide_env_values = true)]
    access_token: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch every configured topic and serve the webhook
    Serve {
        /// Host to bind to (overrides the config file)
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on (overrides the config file)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Print recent activities as JSON lines, most recent first
    Events {
        /// User key, or "all"
        #[arg(long, default_value = "all")]
        user_key: String,

        /// Application name (login, admin, drive, ...)
        #[arg(short, long)]
        application: String,

        /// Restrict to an event name (repeatable)
        #[arg(short, long = "event")]
        events: Vec<String>,

        /// Stop after this many activities
        #[arg(short, long, default_value = "100")]
        limit: usize,
    },

    /// Validate the configuration and list the topics it expands to
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("a3s_watch={},tower_http=info", log_level).into());
    let registry = tracing_subscriber::registry().with(filter);
    if cli.log_json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    match cli.command {
        Commands::Serve { host, port } => {
            let mut config = load_config(cli.config.as_ref())?;
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            serve(config, cli.access_token).await
        }
        Commands::Events {
            user_key,
            application,
            events,
            limit,
        } => {
            let (google, retry) = match cli.config.as_ref() {
                Some(path) => {
                    let config = WatchConfig::from_file(path)
                        .with_context(|| format!("Failed to load {}", path.display()))?;
                    (config.google_config(), config.retry_policy())
                }
                None => (GoogleConfig::default(), RetryPolicy::default()),
            };
            let provider = google_provider(google, cli.access_token)?;
            let reader = ActivityReader::new(provider, retry, 100);
            print_events(
                &reader,
                ResourceKey::new(user_key, application),
                EventFilter::of(events),
                limit,
            )
            .await
        }
        Commands::CheckConfig => {
            let config = load_config(cli.config.as_ref())?;
            println!("Configuration OK");
            for topic in config.topics() {
                println!("  {}", topic);
            }
            Ok(())
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<WatchConfig> {
    let path = path.context("No configuration file given (use --config or A3S_WATCH_CONFIG)")?;
    WatchConfig::from_file(path).with_context(|| format!("Failed to load {}", path.display()))
}

fn google_provider(config: GoogleConfig, token: Option<String>) -> Result<Arc<GoogleProvider>> {
    let token = token.context("No access token given (use --access-token or A3S_WATCH_ACCESS_TOKEN)")?;
    let provider = GoogleProvider::new(config, Arc::new(StaticToken::new(token)))
        .context("Failed to build Reports API client")?;
    Ok(Arc::new(provider))
}

async fn serve(config: WatchConfig, token: Option<String>) -> Result<()> {
    let provider = google_provider(config.google_config(), token)?;
    let service = Arc::new(
        WatchService::builder(config.clone(), provider)
            .build()
            .context("Failed to build watch service")?,
    );

    // Bind before creating channels so deliveries have somewhere to land
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let app = build_router(
        ServerState::new(&service, &config.server),
        &config.server.webhook_path,
    );
    let server = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await
    });
    tracing::info!(
        address = %addr,
        path = %config.server.webhook_path,
        "Webhook listening"
    );

    let report = match service.start().await {
        Ok(report) => report,
        Err(e) => {
            server.abort();
            return Err(e).context("Startup failed");
        }
    };
    if !report.is_complete() {
        tracing::warn!(
            failed = report.failed().count(),
            "Running degraded; failed topics are retried on every scan"
        );
    }

    let background = service.spawn_background();

    server
        .await
        .context("Server task panicked")?
        .context("Server error")?;

    tracing::info!("Shutting down");
    service.shutdown().await;
    background.await.ok();
    Ok(())
}

async fn print_events(
    reader: &ActivityReader,
    resource: ResourceKey,
    filter: EventFilter,
    limit: usize,
) -> Result<()> {
    let mut events = Box::pin(reader.events(resource, filter));
    let mut printed = 0;
    while printed < limit {
        let Some(event) = events.try_next().await.context("Failed to list activities")? else {
            break;
        };
        println!("{}", serde_json::to_string(&event)?);
        printed += 1;
    }
    Ok(())
}
