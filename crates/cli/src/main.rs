//! # Telemetry Plane CLI
//!
//! 命令行接口入口点。
//!
//! 提供：
//! - 配置加载与验证 (文件 + `TELEMETRY_*` 环境变量)
//! - 数据面编排与生命周期管理
//! - 优雅关闭处理，致命错误以非零码退出

mod cli;
mod commands;
mod pipeline;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use cli::{Cli, Commands};
use commands::{run_platform, run_validate};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    // Initialize logging based on CLI options
    init_logging(&cli)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Telemetry Plane starting"
    );

    // Execute command
    let result = match &cli.command {
        Commands::Run(args) => run_platform(args).await,
        Commands::Validate(args) => run_validate(args),
    };

    if let Err(ref e) = result {
        tracing::error!(error = %e, "Command failed");
    }

    result
}

/// Initialize logging based on CLI options
fn init_logging(cli: &Cli) -> Result<()> {
    use observability::{LogFormat, ObservabilityConfig};

    let default_log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    observability::init_with_config(ObservabilityConfig {
        log_format: match cli.log_format {
            cli::LogFormat::Json => LogFormat::Json,
            cli::LogFormat::Pretty => LogFormat::Pretty,
            cli::LogFormat::Compact => LogFormat::Compact,
        },
        // metrics exporter is started by `run` once the config is known
        metrics_port: None,
        default_log_level: default_log_level.to_string(),
        force_level: cli.quiet,
    })
}
