//! warden: operator CLI.
//!
//! Inspects the effective configuration, lists the models available to
//! the pool and replays request patterns against a rate limiter.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use warden::limiter::RateLimiter;
use warden::{Config, RateLimitConfig};

/// Warden resource governance CLI
#[derive(Parser)]
#[command(name = "warden")]
#[command(version)]
#[command(about = "Inspect and exercise warden resource governance")]
struct Args {
    /// Path to configuration file.
    #[arg(short, long, env = "WARDEN_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the effective configuration as TOML
    Config,

    /// List models available in the models directory
    Models,

    /// Replay a burst of requests against a local rate limiter
    SimulateLimit {
        /// Rate-limit key
        #[arg(short, long, default_value = "user:demo")]
        key: String,
        /// Requests per window (default: configured limit)
        #[arg(short, long)]
        limit: Option<u64>,
        /// Window length in seconds (default: configured window)
        #[arg(short, long)]
        window_secs: Option<u64>,
        /// Number of requests to send
        #[arg(short = 'n', long, default_value_t = 12)]
        requests: u32,
        /// Delay between requests in milliseconds
        #[arg(short, long, default_value_t = 0)]
        interval_ms: u64,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialise tracing (default: warn for CLI; override with RUST_LOG).
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let args = Args::parse();
    let config = Config::load(args.config.as_deref())?;

    match args.command {
        Command::Config => {
            print!("{}", config.to_toml()?);
        }

        Command::Models => {
            let models_config = config.models.to_config();
            let models = models_config.available_models()?;
            if models.is_empty() {
                println!("no models in {}", models_config.models_dir.display());
            } else {
                for model in models {
                    println!("{model}\t{}", models_config.resolve_path(&model).display());
                }
            }
        }

        Command::SimulateLimit {
            key,
            limit,
            window_secs,
            requests,
            interval_ms,
        } => {
            let limiter_config: RateLimitConfig = config.rate_limit.to_config();
            let limit = limit.unwrap_or(limiter_config.default_limit);
            let window = window_secs
                .map(Duration::from_secs)
                .unwrap_or(limiter_config.window);
            let limiter = RateLimiter::local(limiter_config);

            println!("key={key} limit={limit} window={}s", window.as_secs());
            let mut allowed = 0;
            for i in 1..=requests {
                let decision = limiter.check(&key, limit, window, 1).await;
                if decision.allowed {
                    allowed += 1;
                }
                let now = std::time::SystemTime::now();
                println!(
                    "#{i:<3} {:<7} remaining={:<4} reset_in={:.1}s",
                    if decision.allowed { "allowed" } else { "denied" },
                    decision.remaining,
                    decision.retry_after(now).as_secs_f64(),
                );
                if interval_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(interval_ms)).await;
                }
            }
            println!("{allowed}/{requests} allowed");
        }
    }

    Ok(())
}
