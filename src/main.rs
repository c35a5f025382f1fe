use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use agni::config::ConfigManager;
use agni::logging;
use agni::security::generate_secret;
use agni::service::Service;
use metrics_exporter_prometheus::PrometheusBuilder;
use structopt::StructOpt;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

#[derive(Debug, StructOpt)]
#[structopt(name = "agni", about = "Firecracker microVM control plane")]
enum Opt {
    /// Run the control plane until SIGINT or SIGTERM
    Serve {
        /// Path to configuration file
        #[structopt(short, long, parse(from_os_str))]
        config: PathBuf,
    },

    /// Print a fresh token signing secret
    GenSecret,

    /// Print the default configuration as YAML
    DefaultConfig,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    match Opt::from_args() {
        Opt::Serve { config } => serve(config).await,
        Opt::GenSecret => {
            println!("{}", generate_secret()?.as_str());
            Ok(())
        }
        Opt::DefaultConfig => {
            let manager = ConfigManager::new();
            print!("{}", manager.to_yaml()?);
            Ok(())
        }
    }
}

async fn serve(config_path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let config_manager = ConfigManager::load_from_file(&config_path).map_err(|e| {
        eprintln!("Failed to load configuration: {}", e);
        e
    })?;
    let config = config_manager.get_config().clone();

    let _log_guard = logging::init(&config.observability.logging)?;
    info!("Starting agni {}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded from: {}", config_path.display());

    if config.observability.metrics.enabled {
        PrometheusBuilder::new()
            .with_http_listener(config.observability.metrics.listen_addr)
            .install()?;
        info!("Metrics exporter listening on {}", config.observability.metrics.listen_addr);
    }

    let service = Arc::new(Service::new(&config_manager).map_err(|e| {
        error!("Failed to initialise service: {}", e);
        e
    })?);

    match service.is_setup_required() {
        Ok(true) => warn!("No users exist yet; run setup to create the admin account"),
        Ok(false) => {}
        Err(e) => warn!("Could not determine setup state: {}", e),
    }

    // keep limiter memory bounded by idle clients
    let purger = {
        let service = Arc::clone(&service);
        let period = Duration::from_secs(config.rate_limit.window_seconds);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let purged = service.purge_rate_limits();
                if purged > 0 {
                    debug!(purged, "purged idle rate-limit keys");
                }
            }
        })
    };

    let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::spawn(async move {
            tokio::select! {
                _ = sigint.recv() => info!("Received SIGINT, shutting down..."),
                _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
            }
            let _ = shutdown_tx.send(()).await;
        });
    }

    shutdown_rx.recv().await;

    purger.abort();
    service.shutdown().await;

    info!("agni has been shut down.");
    Ok(())
}
