//! `run` command implementation.

use anyhow::{Context, Result};
use config_loader::ConfigLoader;
use contracts::PlatformConfig;
use std::time::Duration;
use tracing::{info, warn};

use crate::cli::RunArgs;
use crate::pipeline::{Platform, PlatformOptions, SyntheticLoadConfig};

/// Execute the `run` command
///
/// Returns `Err` when the data-plane terminated abnormally, so the process
/// exits non-zero and the supervisor restarts it.
pub async fn run_platform(args: &RunArgs) -> Result<()> {
    match &args.config {
        Some(path) => info!(config = %path.display(), "Loading configuration"),
        None => info!("No config file given, using defaults + environment"),
    }

    let mut config = ConfigLoader::load(args.config.as_deref())
        .context("Failed to load data-plane configuration")?;

    // Apply CLI overrides
    if let Some(ref instance_id) = args.instance_id {
        info!(instance_id = %instance_id, "Overriding instance id from CLI");
        config.instance_id = instance_id.clone();
    }

    info!(
        instance_id = %config.instance_id,
        ingest = config.ingest.enabled,
        router = config.router.enabled,
        pool_max_size = config.producer_pool.max_size,
        "Configuration loaded"
    );

    // Dry run - just validate and exit
    if args.dry_run {
        info!("Dry run mode - configuration is valid, exiting");
        print_config_summary(&config);
        return Ok(());
    }

    let options = PlatformOptions {
        config,
        storage: args.storage,
        data_dir: args.data_dir.clone(),
        synthetic: (args.synthetic_events > 0).then(|| SyntheticLoadConfig {
            events: args.synthetic_events,
            rate: args.synthetic_rate,
            malformed_ratio: args.malformed_ratio,
        }),
        timeout: (args.timeout > 0).then(|| Duration::from_secs(args.timeout)),
        health_interval: Duration::from_millis(args.health_interval_ms),
        metrics_port: (args.metrics_port > 0).then_some(args.metrics_port),
    };

    info!("Starting data-plane...");
    let stats = Platform::new(options)
        .run(setup_shutdown_signal())
        .await
        .context("Data-plane execution failed")?;

    stats.print_summary();
    info!(reason = %stats.stop_reason, "Telemetry Plane finished");
    Ok(())
}

/// Setup Ctrl+C and SIGTERM signal handlers
async fn setup_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    warn!("Received shutdown signal, draining data-plane...");
}

/// Print configuration summary for dry-run mode
fn print_config_summary(config: &PlatformConfig) {
    println!("\n=== Configuration Summary ===\n");
    println!("Instance: {}", config.instance_id);
    println!(
        "Producer pool: max {} producers, idle TTL {}s",
        config.producer_pool.max_size, config.producer_pool.idle_ttl_secs
    );

    if config.ingest.enabled {
        let ingest = &config.ingest;
        println!("\nIngestion:");
        println!("  Sources: {:?}", ingest.source_topics);
        println!("  Subscription: {} x{}", ingest.subscription_name, ingest.consumer_count);
        println!(
            "  Window: {} records / {}ms",
            ingest.max_window_size, ingest.flush_interval_ms
        );
        println!("  DLQ: {}", ingest.dlq_topic);
    } else {
        println!("\nIngestion: disabled");
    }

    if config.router.enabled {
        let router = &config.router;
        println!("\nRouter:");
        println!("  Global topic: {}", router.global_topic);
        println!("  Dataset topics: {}<dataset_id>", router.dataset_topic_prefix);
        println!(
            "  Staleness: {}min, fanout {}, ack policy {:?}",
            router.staleness_threshold_minutes, router.max_fanout_concurrency, router.ack_policy
        );
    } else {
        println!("\nRouter: disabled");
    }

    println!();
}
