//! rbox Client Binary
//!
//! Runs one tunnel through the configured engine binary, or resolves a
//! subscription URL and prints the result as JSON.

use log::{debug, error, info, warn};
use rbox::{
    config::Config,
    error::{Result, VpnError},
    subscription::SubscriptionFetcher,
    LifecycleController, TunnelState,
};
use std::env;
use std::fs;
use std::path::Path;
use std::process;
use std::time::Duration;
use tokio::signal;

const DEFAULT_CONFIG: &str = "rbox.toml";
const STATUS_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    let mut args: Vec<String> = env::args().skip(1).collect();
    let config_path = if args.len() > 1 && args[0] == "--config" {
        let path = args.remove(1);
        args.remove(0);
        path
    } else {
        DEFAULT_CONFIG.to_string()
    };

    let config = match load_config(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            process::exit(2);
        }
    };

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.logging.level.as_str()),
    )
    .init();
    info!("Starting rbox client v{}", rbox::VERSION);

    let result = match args.first().map(String::as_str) {
        Some("run") if args.len() == 2 => run(config, &args[1]).await,
        Some("fetch") if args.len() == 2 => fetch(&config, &args[1]).await,
        Some("help") | Some("--help") | Some("-h") => {
            print_usage();
            Ok(())
        }
        _ => {
            print_usage();
            process::exit(2);
        }
    };

    if let Err(e) = result {
        error!("{e}");
        process::exit(1);
    }
}

/// Start a tunnel from an outbound JSON file and keep it up until signalled
async fn run(config: Config, outbound_path: &str) -> Result<()> {
    let outbound = fs::read_to_string(outbound_path)
        .map_err(|e| VpnError::Config(format!("Failed to read {outbound_path}: {e}")))?;

    let controller = LifecycleController::with_process_engine(config)?;
    controller.start_json(&outbound).await?;
    display_status(&controller).await;

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    tokio::spawn(async move {
        setup_shutdown_handler().await;
        let _ = shutdown_tx.send(());
    });

    info!("Tunnel is running. Press Ctrl+C to stop.");
    let mut status_interval = tokio::time::interval(STATUS_INTERVAL);
    status_interval.tick().await;

    loop {
        tokio::select! {
            _ = &mut shutdown_rx => {
                info!("Shutdown signal received");
                break;
            }
            _ = status_interval.tick() => {
                let status = controller.status().await;
                match status.state {
                    TunnelState::Running => debug!("Tunnel healthy"),
                    state => {
                        warn!(
                            "Tunnel left running state: {} ({})",
                            state.as_str(),
                            status.message.as_deref().unwrap_or("no details")
                        );
                        break;
                    }
                }
            }
        }
    }

    info!("Stopping tunnel...");
    controller.stop().await?;
    info!("Tunnel stopped");
    Ok(())
}

/// Resolve a subscription and print it as JSON
async fn fetch(config: &Config, url: &str) -> Result<()> {
    let fetcher = SubscriptionFetcher::from_config(&config.subscription)?;
    let result = fetcher.fetch(url).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

/// Load configuration from file or create default
fn load_config(config_path: &str) -> Result<Config> {
    if Path::new(config_path).exists() {
        let config = Config::from_file(config_path)?;
        config.validate()?;
        return Ok(config);
    }

    eprintln!("Config file '{config_path}' not found, creating default configuration");
    let config = Config::default();
    if let Err(e) = fs::write(config_path, config.to_toml()?) {
        eprintln!("Failed to write default config file: {e}");
    }
    Ok(config)
}

/// Wait for Ctrl+C or SIGTERM
async fn setup_shutdown_handler() {
    tokio::select! {
        _ = signal::ctrl_c() => {
            debug!("Received Ctrl+C");
        }
        _ = async {
            #[cfg(unix)]
            {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut sigterm) => {
                        sigterm.recv().await;
                        debug!("Received SIGTERM");
                    }
                    Err(e) => {
                        warn!("SIGTERM handler unavailable: {e}");
                        futures::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                futures::future::pending::<()>().await;
            }
        } => {}
    }
}

async fn display_status(controller: &LifecycleController) {
    let status = controller.status().await;

    println!("\n=== Tunnel ===");
    println!("State: {}", status.state.as_str());
    if let Some(outbound) = &status.config {
        println!("Outbound: {outbound}");
    }
    println!("Engine: {}", controller.config().engine.binary.display());
    println!();
}

fn print_usage() {
    println!("rbox client v{}", rbox::VERSION);
    println!();
    println!("USAGE:");
    println!("    rbox-client [--config FILE] run <OUTBOUND_JSON>");
    println!("    rbox-client [--config FILE] fetch <SUBSCRIPTION_URL>");
    println!();
    println!("ARGS:");
    println!("    FILE               TOML configuration (default: {DEFAULT_CONFIG})");
    println!("    OUTBOUND_JSON      Outbound object or full engine document");
    println!("    SUBSCRIPTION_URL   http(s) URL of a share-link subscription");
}
