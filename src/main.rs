//! Daemon entry point for the deployment platform (slipway).

use std::process::ExitCode;
use std::sync::Arc;

use slipway::cli::Cli;
use slipway::config::{load_config, load_default_config};
use slipway::orchestrator::Orchestrator;
use slipway::proxy::{ProxyServer, RouteTable};
use slipway::sandbox::probe_isolation;
use slipway::store::Store;
use slipway::utils::init_debug_logging;
use slipway::vault::Vault;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse_args();

    // Initialize logging
    init_debug_logging(cli.debug);

    // Load configuration
    let config = match cli.get_settings_path() {
        Some(path) if path.exists() => match load_config(&path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Error loading config from {:?}: {}", path, e);
                return ExitCode::from(1);
            }
        },
        _ => match load_default_config() {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Error loading default config: {}", e);
                return ExitCode::from(1);
            }
        },
    };

    let store = match Store::open(&config.database_path).await {
        Ok(store) => store,
        Err(e) => {
            eprintln!(
                "Failed to open database {:?}: {}",
                config.database_path, e
            );
            return ExitCode::from(1);
        }
    };

    let vault = Vault::new(store.clone(), &config.effective_encryption_key());
    let isolation = probe_isolation(&config.isolation);
    let routes = Arc::new(RouteTable::new());

    let orchestrator = Orchestrator::new(
        config.clone(),
        store,
        vault,
        isolation,
        routes.clone(),
    );

    // Bring back whatever was running before the last shutdown.
    if !cli.no_recover {
        orchestrator.restart_all().await;
    }

    let listen = cli.listen.as_deref().unwrap_or(&config.proxy.listen);
    let mut proxy = match ProxyServer::new(
        listen,
        &config.proxy.base_domain,
        config.proxy.restart_wait_secs,
        routes,
        orchestrator.clone(),
    )
    .await
    {
        Ok(proxy) => proxy,
        Err(e) => {
            eprintln!("Failed to bind proxy on {}: {}", listen, e);
            return ExitCode::from(1);
        }
    };

    if let Err(e) = proxy.start() {
        eprintln!("Failed to start proxy: {}", e);
        return ExitCode::from(1);
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Shutting down");
            proxy.stop();
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Failed to wait for shutdown signal: {}", e);
            ExitCode::from(1)
        }
    }
}
