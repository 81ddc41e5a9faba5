use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

use nicu_ratelimit::config::LimiterConfig;
use nicu_ratelimit::ratelimit::{exceeded_headers, rate_limit_headers, RateLimiter};

/// Operator tool for the NICU dashboard rate limiter.
#[derive(Debug, Parser)]
#[command(name = "nicu-ratelimit", version, about)]
struct Cli {
    /// Configuration file (YAML); NICU_RATELIMIT__* variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Show the active store, connectivity and policy table
    Status,
    /// List the configured policies
    Policies,
    /// Count one request and print the decision
    Check { identifier: String, policy: String },
    /// Show a counter without counting a request
    Info { identifier: String, policy: String },
    /// Clear a counter
    Reset { identifier: String, policy: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = LimiterConfig::load(cli.config.as_deref())?;
    info!(redis_configured = config.redis.url.is_some(), "Configuration loaded");

    let limiter = RateLimiter::from_config(&config).await?;

    let exit = match cli.command {
        Command::Status => {
            print_json(&limiter.status())?;
            ExitCode::SUCCESS
        }
        Command::Policies => {
            print_json(limiter.policies().policies())?;
            ExitCode::SUCCESS
        }
        Command::Check { identifier, policy } => {
            match limiter.check_async(&identifier, &policy).await {
                Ok(decision) => {
                    let headers = rate_limit_headers(&decision);
                    print_json(&json!({ "decision": decision, "headers": headers }))?;
                    ExitCode::SUCCESS
                }
                Err(exceeded) => {
                    let headers = exceeded_headers(&exceeded);
                    print_json(&json!({ "rejected": exceeded, "headers": headers }))?;
                    ExitCode::from(2)
                }
            }
        }
        Command::Info { identifier, policy } => {
            let info = limiter.info(&identifier, &policy).await;
            let headers = rate_limit_headers(&info);
            print_json(&json!({ "info": info, "headers": headers }))?;
            ExitCode::SUCCESS
        }
        Command::Reset { identifier, policy } => {
            let reset = limiter.reset(&identifier, &policy).await;
            print_json(&json!({ "reset": reset }))?;
            ExitCode::SUCCESS
        }
    };

    limiter.shutdown();
    Ok(exit)
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
