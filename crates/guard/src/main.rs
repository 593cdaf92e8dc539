//! Faucet guard operator binary

use anyhow::Context;
use clap::{Parser, Subcommand};
use faucet_guard::{format_remaining_time, DistributionGuard, GuardConfig, TokenAmounts};
use faucet_guard_common::utils::logging::init_logging;
use serde_json::json;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};

/// Faucet guard CLI
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file path (TOML, YAML or JSON); environment variables otherwise
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print statistics of both stores as JSON
    Stats,

    /// Drop expired entries from both stores and save them
    Cleanup,

    /// Show whether an identity could receive a distribution right now
    Inspect {
        #[arg(long)]
        address: String,

        #[arg(long)]
        network: String,

        #[arg(long)]
        ip: Option<String>,
    },

    /// Run periodic cleanup and save until interrupted
    Watch,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => GuardConfig::from_file(path).with_context(|| format!("loading {}", path))?,
        None => GuardConfig::from_env()?,
    };
    if args.debug {
        config.logging.level = "debug".to_string();
    }
    init_logging(&config.logging)?;

    info!("Configuration:");
    info!("  Request storage: {}", config.request_storage_path.display());
    info!("  Allowance storage: {}", config.allowance_storage_path.display());
    info!("  Limits: address={} ip={} per {}h", config.limits.address, config.limits.ip, config.window_hours);
    for entry in &config.distribution_amounts {
        info!("  Distribution: {} {}", entry.amount, entry.denom);
    }

    let guard = Arc::new(DistributionGuard::new(&config)?);

    match args.command {
        Command::Stats => {
            let stats = guard.stats().await;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::Cleanup => {
            let removed = guard.cleanup().await;
            guard.save().await;
            println!("{}", json!({ "removed": removed }));
        }
        Command::Inspect { address, network, ip } => {
            let report = inspect(&guard, &config, &address, &network, ip.as_deref()).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Watch => {
            let handle = guard.clone().spawn_maintenance(config.maintenance_interval());
            info!("Maintenance every {:?}", config.maintenance_interval());
            shutdown_signal().await;
            handle.abort();
            guard.shutdown().await;
        }
    }

    Ok(())
}

/// Read-only admission report: runs the checks without recording anything
async fn inspect(
    guard: &DistributionGuard,
    config: &GuardConfig,
    address: &str,
    network: &str,
    ip: Option<&str>,
) -> anyhow::Result<serde_json::Value> {
    let state = guard.lock().await;

    let address_ok = state.limiter.check_address(address, network).await;
    let ip_ok = match ip {
        Some(ip) => Some(state.limiter.check_ip(ip, network).await),
        None => None,
    };

    let single: TokenAmounts = config
        .distribution_amounts
        .iter()
        .map(|entry| (entry.denom.clone(), entry.amount.clone()))
        .collect();
    let allowance = state.tracker.check_allowance(address, &single).await?;

    let address_wait = state.limiter.get_remaining_time(address, network);
    let reset = state.tracker.get_remaining_reset_time(address);

    Ok(json!({
        "address": address,
        "network": network,
        "addressAllowed": address_ok,
        "addressRetryAfter": format_remaining_time(address_wait),
        "ipAllowed": ip_ok,
        "allowanceAllowed": allowance.allowed,
        "available": allowance
            .available
            .iter()
            .map(|(denom, amount)| (denom.clone(), amount.to_string()))
            .collect::<std::collections::BTreeMap<_, _>>(),
        "used": state
            .tracker
            .usage(address)
            .into_iter()
            .map(|(denom, amount)| (denom, amount.to_string()))
            .collect::<std::collections::BTreeMap<_, _>>(),
        "allowanceResetIn": format_remaining_time(reset),
    }))
}

/// Graceful shutdown signal
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }
}
