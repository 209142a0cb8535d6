//! `validate` command implementation.

use anyhow::{Context, Result};
use contracts::{AckPolicy, PlatformConfig};
use serde::Serialize;
use tracing::info;

use crate::cli::ValidateArgs;

/// Validation result for JSON output
#[derive(Serialize)]
struct ValidationResult {
    valid: bool,
    config_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    warnings: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    summary: Option<ConfigSummary>,
}

#[derive(Serialize)]
struct ConfigSummary {
    instance_id: String,
    ingest_enabled: bool,
    source_topics: Vec<String>,
    dlq_topic: String,
    router_enabled: bool,
    global_topic: String,
    ack_policy: AckPolicy,
    producer_cache_max_size: u64,
}

/// Execute the `validate` command
pub fn run_validate(args: &ValidateArgs) -> Result<()> {
    info!(config = ?args.config, "Validating configuration");

    let result = validate_config(args);

    if args.json {
        let json = serde_json::to_string_pretty(&result)
            .context("Failed to serialize validation result")?;
        println!("{}", json);
    } else {
        print_validation_result(&result);
    }

    if result.valid {
        Ok(())
    } else {
        anyhow::bail!("Configuration validation failed")
    }
}

fn validate_config(args: &ValidateArgs) -> ValidationResult {
    let config_path = args.config.as_ref().map(|p| p.display().to_string());

    if let Some(path) = &args.config {
        if !path.exists() {
            return ValidationResult {
                valid: false,
                config_path,
                error: Some(format!("File not found: {}", path.display())),
                warnings: None,
                summary: None,
            };
        }
    }

    match config_loader::ConfigLoader::load(args.config.as_deref()) {
        Ok(config) => {
            let warnings = collect_warnings(&config);
            ValidationResult {
                valid: true,
                config_path,
                error: None,
                warnings: if warnings.is_empty() {
                    None
                } else {
                    Some(warnings)
                },
                summary: Some(ConfigSummary {
                    instance_id: config.instance_id.clone(),
                    ingest_enabled: config.ingest.enabled,
                    source_topics: config.ingest.source_topics.clone(),
                    dlq_topic: config.ingest.dlq_topic.clone(),
                    router_enabled: config.router.enabled,
                    global_topic: config.router.global_topic.clone(),
                    ack_policy: config.router.ack_policy,
                    producer_cache_max_size: config.producer_pool.max_size,
                }),
            }
        }
        Err(e) => ValidationResult {
            valid: false,
            config_path,
            error: Some(e.to_string()),
            warnings: None,
            summary: None,
        },
    }
}

/// Collect configuration warnings (non-fatal issues)
fn collect_warnings(config: &PlatformConfig) -> Vec<String> {
    let mut warnings = Vec::new();

    if !config.ingest.enabled && !config.router.enabled {
        warnings.push("Both ingest and router are disabled - nothing will run".to_string());
    }

    if config.router.ack_policy == AckPolicy::Always {
        warnings.push(
            "router.ack_policy = always - failed publishes are acknowledged and lost".to_string(),
        );
    }

    if config.instance_id == PlatformConfig::default().instance_id {
        warnings.push(format!(
            "instance_id is the default '{}' - broadcast subscriptions collide across processes",
            config.instance_id
        ));
    }

    if config.ingest.enabled
        && config.router.enabled
        && config.ingest.source_topics.contains(&config.router.global_topic)
    {
        warnings.push("router.global_topic is also an ingest source topic".to_string());
    }

    warnings
}

fn print_validation_result(result: &ValidationResult) {
    let path = result.config_path.as_deref().unwrap_or("<defaults + environment>");
    if result.valid {
        println!("✓ Configuration is valid: {}", path);

        if let Some(ref summary) = result.summary {
            println!("\n  Instance: {}", summary.instance_id);
            println!(
                "  Ingest: {} (sources {:?}, dlq {})",
                enabled(summary.ingest_enabled),
                summary.source_topics,
                summary.dlq_topic
            );
            println!(
                "  Router: {} (global {}, ack policy {:?})",
                enabled(summary.router_enabled),
                summary.global_topic,
                summary.ack_policy
            );
            println!("  Producer cache: {}", summary.producer_cache_max_size);
        }

        if let Some(ref warnings) = result.warnings {
            println!("\n⚠ Warnings:");
            for warning in warnings {
                println!("  - {}", warning);
            }
        }
    } else {
        println!("✗ Configuration is invalid: {}", path);
        if let Some(ref error) = result.error {
            println!("\n  Error: {}", error);
        }
    }
}

fn enabled(flag: bool) -> &'static str {
    if flag {
        "enabled"
    } else {
        "disabled"
    }
}
