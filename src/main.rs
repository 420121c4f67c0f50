//! Session Gateway - federated authentication and session service.

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};

use session_gateway::{
    cli::{Cli, Command},
    config::Config,
    exchange::Exchange,
    federation::KeyFederation,
    http::{create_router, AppState},
    issuer::IssuerResolver,
    keystore::KeyStore,
    selfsigned::BypassPolicy,
    session::{spawn_reaper, InMemorySessionStore, SessionStore},
    setup_tracing, telemetry,
};

/// How often expired session and grant records are reaped.
const REAP_INTERVAL: Duration = Duration::from_secs(60);

/// Telemetry buffer capacity and reporting interval.
const TELEMETRY_CAPACITY: usize = 1024;
const TELEMETRY_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Some(Command::Keygen { output }) => run_keygen(cli.config.as_deref(), output),
        Some(Command::Init { output }) => run_init(output),
        Some(Command::Serve) | None => run_server(cli).await,
    }
}

/// Apply CLI overrides to a loaded configuration.
fn apply_cli_overrides(config: &mut Config, cli: &Cli) {
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(ref host) = cli.host {
        config.server.host.clone_from(host);
    }
}

/// Generate (or load) the signing-key record and report its identity.
fn run_keygen(config_path: Option<&std::path::Path>, output: Option<std::path::PathBuf>) -> ExitCode {
    let config = match Config::load(config_path) {
        Ok(c) => c,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let path = output.unwrap_or(config.tokens.signing_key_path);
    match KeyStore::load_or_generate(&path) {
        Ok(store) => {
            println!("Signing key ready");
            println!("  kid:  {}", store.kid());
            println!("  path: {}", path.display());
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Failed to prepare signing key: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Write a starter configuration file.
fn run_init(output: std::path::PathBuf) -> ExitCode {
    if output.exists() {
        error!("Refusing to overwrite existing file: {}", output.display());
        return ExitCode::FAILURE;
    }

    let starter = r#"# session-gateway configuration

server:
  host: 127.0.0.1
  port: 8480

issuer:
  # Hosts inside this domain become their own issuer; everything else
  # falls back to https://<base_domain>
  base_domain: localhost
  local_hosts: []
  official_hosts:
    - sessions.hytale.com
  # Accept self-signed identity tokens on the exchange endpoints
  accept_self_signed: true

tokens:
  signing_key_path: signing-key.json
  session_ttl_secs: 36000

federation:
  cache_ttl_secs: 3600
  negative_cache_secs: 30
  fetch_timeout_secs: 5
  cache_capacity: 256
  publish_merged: false

compat:
  # Emit tokens from unknown paths instead of 404 (development only)
  catch_all_tokens: false
"#;

    match std::fs::write(&output, starter) {
        Ok(()) => {
            println!("Configuration written to {}", output.display());
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Failed to write configuration: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Run the session gateway server.
async fn run_server(cli: Cli) -> ExitCode {
    let config = match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
            apply_cli_overrides(&mut config, &cli);
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        base_domain = %config.issuer.base_domain,
        accept_self_signed = config.issuer.accept_self_signed,
        "Starting session gateway"
    );

    let keys = match KeyStore::load_or_generate(&config.tokens.signing_key_path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("Failed to initialize signing key: {e}");
            return ExitCode::FAILURE;
        }
    };

    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    let telemetry = telemetry::spawn_flusher(
        TELEMETRY_CAPACITY,
        TELEMETRY_INTERVAL,
        shutdown_tx.subscribe(),
    );

    let resolver = IssuerResolver::new(&config.issuer);
    let federation = Arc::new(KeyFederation::new(
        Arc::clone(&keys),
        resolver.clone(),
        config.federation.clone(),
        telemetry.clone(),
    ));

    let store: Arc<dyn SessionStore> = Arc::new(InMemorySessionStore::new());
    spawn_reaper(Arc::clone(&store), REAP_INTERVAL, shutdown_tx.subscribe());

    let exchange = Arc::new(Exchange::new(
        Arc::clone(&keys),
        resolver.clone(),
        Arc::clone(&federation),
        Arc::clone(&store),
        BypassPolicy::new(config.issuer.accept_self_signed),
        config.tokens.session_ttl_secs as i64,
        telemetry,
    ));

    let addr = match config.server.host.parse() {
        Ok(ip) => SocketAddr::new(ip, config.server.port),
        Err(e) => {
            error!("Invalid host {}: {e}", config.server.host);
            return ExitCode::FAILURE;
        }
    };

    let state = Arc::new(AppState {
        config,
        keys,
        resolver,
        federation,
        exchange,
    });
    let app = create_router(state);

    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind {addr}: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!(addr = %addr, "Session gateway listening");

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await
    {
        error!("Server error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Session gateway shutdown complete");
    ExitCode::SUCCESS
}

/// Resolve on ctrl-c and fan the shutdown out to background tasks.
async fn shutdown_signal(shutdown_tx: tokio::sync::broadcast::Sender<()>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {e}");
    }
    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_cli(port: Option<u16>, host: Option<String>) -> Cli {
        Cli {
            config: None,
            port,
            host,
            log_level: "info".to_string(),
            log_format: None,
            command: None,
        }
    }

    #[test]
    fn apply_cli_overrides_no_overrides_preserves_defaults() {
        let mut config = Config::default();
        let original_port = config.server.port;
        let original_host = config.server.host.clone();

        apply_cli_overrides(&mut config, &make_cli(None, None));

        assert_eq!(config.server.port, original_port);
        assert_eq!(config.server.host, original_host);
    }

    #[test]
    fn apply_cli_overrides_port_and_host() {
        let mut config = Config::default();
        let cli = make_cli(Some(9999), Some("0.0.0.0".to_string()));

        apply_cli_overrides(&mut config, &cli);

        assert_eq!(config.server.port, 9999);
        assert_eq!(config.server.host, "0.0.0.0");
    }

    #[test]
    fn apply_cli_overrides_preserves_other_sections() {
        let mut config = Config::default();
        config.issuer.base_domain = "play.example".to_string();

        apply_cli_overrides(&mut config, &make_cli(Some(3000), None));

        assert_eq!(config.server.port, 3000);
        assert_eq!(config.issuer.base_domain, "play.example");
    }
}
