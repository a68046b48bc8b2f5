//! termgate - terminal session gateway
//!
//! Runs PTY-backed shells on behalf of browser clients and streams them over
//! WebSocket, with per-project focus, suspend/resume and keep-alive policy.

use clap::{Parser as ClapParser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use termgate::{
    api, audit,
    config::{Config, ConfigError},
    health::{HealthMonitor, ProcMemorySampler},
    orchestrator::Orchestrator,
    shell::{ShellDiscovery, ShellError},
    shutdown::ShutdownCoordinator,
};

/// termgate - terminal session gateway
#[derive(ClapParser, Debug)]
#[command(name = "termgate", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to a TOML configuration file
    #[arg(long, global = true, env = "TERMGATE_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP/WebSocket server
    Serve {
        /// Address to bind (overrides `server.bind` in the config file)
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// API token; generated automatically for non-loopback binds
        #[arg(long, env = "TERMGATE_TOKEN")]
        token: Option<String>,
    },

    /// Probe the shells available on this host and print them
    Shells,

    /// Validate the configuration file and exit
    CheckConfig,
}

#[derive(Error, Debug)]
pub enum TermgateError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("invalid bind address '{0}'")]
    InvalidBind(String),

    #[error(transparent)]
    Shell(#[from] ShellError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

fn load_config(path: Option<&PathBuf>) -> Result<Config, TermgateError> {
    match path {
        Some(path) => {
            let config = Config::load(path)?;
            tracing::info!(path = %path.display(), "configuration loaded");
            Ok(config)
        }
        None => Ok(Config::default()),
    }
}

/// Pick the API token: an explicit one always wins; a non-loopback bind
/// without one gets a random token so the server is never left open.
fn resolve_token(bind: &SocketAddr, user_token: Option<String>) -> Option<String> {
    if user_token.is_some() || bind.ip().is_loopback() {
        return user_token;
    }
    use rand::Rng;
    let token: String = rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(32)
        .map(char::from)
        .collect();
    eprintln!("termgate: API token (required for non-localhost): {}", token);
    Some(token)
}

#[tokio::main]
async fn main() -> Result<(), TermgateError> {
    let cli = Cli::parse();
    init_tracing();

    let config = load_config(cli.config.as_ref())?;
    match cli.command {
        Commands::Serve { bind, token } => run_server(config, bind, token).await,
        Commands::Shells => run_shells(config).await,
        Commands::CheckConfig => {
            println!(
                "configuration ok: bind {}, {} session(s) max, {} per project",
                config.server.bind,
                config.limits.max_total_sessions,
                config.limits.max_sessions_per_project
            );
            Ok(())
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "termgate=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run_shells(config: Config) -> Result<(), TermgateError> {
    let discovery = ShellDiscovery::new(config.shell);
    for shell in discovery.available().await? {
        let caps = &shell.capabilities;
        println!(
            "{}\t{}\tcolor={} unicode={}",
            shell.display_name(),
            shell.path.display(),
            caps.color,
            caps.unicode
        );
    }
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => tracing::info!("received Ctrl+C"),
                    _ = term.recv() => tracing::info!("received SIGTERM"),
                }
                return;
            }
            Err(e) => tracing::warn!(?e, "cannot listen for SIGTERM"),
        }
    }
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("received Ctrl+C");
}

// ── Server mode ────────────────────────────────────────────────────

async fn run_server(
    config: Config,
    bind: Option<SocketAddr>,
    token: Option<String>,
) -> Result<(), TermgateError> {
    tracing::info!("termgate server starting");

    let bind = match bind {
        Some(bind) => bind,
        None => config
            .server
            .bind
            .parse()
            .map_err(|_| TermgateError::InvalidBind(config.server.bind.clone()))?,
    };
    let token = resolve_token(&bind, token.or_else(|| config.server.token.clone()));
    if token.is_some() {
        tracing::info!("auth token configured");
    }

    let config = Arc::new(config);
    let shells = Arc::new(ShellDiscovery::new(config.shell.clone()));
    match shells.resolve_shell().await {
        Ok(shell) => tracing::info!(shell = %shell.display_name(), path = %shell.path.display(), "default shell"),
        Err(e) => tracing::warn!(error = %e, "no usable shell found; sessions will fail to start"),
    }
    let audit = audit::from_config(&config.audit)?;

    let orchestrator = Orchestrator::new(config.clone(), shells, audit);
    let shutdown = ShutdownCoordinator::new();
    let background = CancellationToken::new();

    let monitor = HealthMonitor::new(orchestrator.clone(), &config.health, Box::new(ProcMemorySampler));
    let state = api::AppState {
        orchestrator: orchestrator.clone(),
        shutdown: shutdown.clone(),
        health: monitor.last_sample(),
    };
    tokio::spawn(monitor.run(background.clone()));
    tokio::spawn(
        orchestrator
            .clone()
            .run_sweeper(Duration::from_secs(config.sweep.interval_secs), background.clone()),
    );

    let app = api::router(
        state,
        api::RouterConfig {
            token,
            cors_origins: config.server.cors_origins.clone(),
        },
    );

    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(addr = %bind, "HTTP/WS server listening");

    let (server_shutdown_tx, server_shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let http_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                server_shutdown_rx.await.ok();
            })
            .await
    });

    shutdown_signal().await;

    // Signal WebSocket handlers to send close frames
    shutdown.shutdown();
    // Give handlers a moment to flush close frames before stopping the server
    tokio::time::sleep(Duration::from_millis(100)).await;
    if !shutdown.wait_for_drain(Duration::from_secs(2)).await {
        tracing::warn!(
            remaining = shutdown.active_connections(),
            "connections still open after drain timeout"
        );
    }

    background.cancel();
    orchestrator.shutdown();
    let _ = server_shutdown_tx.send(());

    match http_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(?e, "HTTP server error"),
        Err(e) => tracing::warn!(?e, "HTTP server task panicked"),
    }

    tracing::info!("termgate server exiting");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_without_token_stays_open() {
        let bind: SocketAddr = "127.0.0.1:7420".parse().unwrap();
        assert_eq!(resolve_token(&bind, None), None);
    }

    #[test]
    fn explicit_token_is_kept() {
        let bind: SocketAddr = "127.0.0.1:7420".parse().unwrap();
        assert_eq!(
            resolve_token(&bind, Some("abc".into())),
            Some("abc".to_string())
        );
    }

    #[test]
    fn public_bind_gets_generated_token() {
        let bind: SocketAddr = "0.0.0.0:7420".parse().unwrap();
        let token = resolve_token(&bind, None).unwrap();
        assert_eq!(token.len(), 32);
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn cli_parses_serve() {
        let cli = Cli::try_parse_from(["termgate", "serve", "--bind", "0.0.0.0:9000", "--token", "t"])
            .unwrap();
        match cli.command {
            Commands::Serve { bind, token } => {
                assert_eq!(bind, Some("0.0.0.0:9000".parse().unwrap()));
                assert_eq!(token.as_deref(), Some("t"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
