use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use crate::models::ObservationRange;
use crate::rate_limit::RateLimitConfig;
use crate::shards::CacheConfig;

// CLI argument structure
#[derive(Parser, Debug, Clone)]
#[command(name = "like-cache")]
#[command(about = "Like statistics cache and rate limiter over Redis")]
pub struct Args {
    // Redis holding the cache records and rate limit buckets
    #[arg(long, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    pub redis_url: String,

    // Postgres with the content/like tables, used by rebuild
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    // Likes admitted per content per window
    #[arg(long, default_value_t = 100)]
    pub rate_limit: u32,

    // Rate limit window in seconds
    #[arg(long, default_value_t = 60)]
    pub rate_window: u64,

    // Cache workers; likes on one content always go to the same worker
    #[arg(long, default_value_t = 4)]
    pub workers: usize,

    // Pending updates per worker before callers wait
    #[arg(long, default_value_t = 100)]
    pub queue_depth: usize,

    // Timeout for each store call, in milliseconds
    #[arg(long, default_value_t = 500)]
    pub store_timeout_ms: u64,

    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    pub min_value: i16,

    #[arg(long, default_value_t = 5, allow_negative_numbers = true)]
    pub max_value: i16,

    // Print prometheus metrics after the command
    #[arg(long)]
    pub print_metrics: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Recompute every cache record from the system-of-record
    Rebuild {
        /// JSON snapshot of contents and likes, instead of the database
        #[arg(long)]
        snapshot: Option<PathBuf>,
    },
    /// Print cached records as JSON
    List {
        #[arg(long)]
        from: Option<u64>,
        #[arg(long)]
        to: Option<u64>,
    },
    /// Take one token from a content's like bucket
    Admit { content_id: u64 },
}

// Everything the library needs out of the command line
#[derive(Debug, Clone, Copy)]
pub struct Settings {
    pub rate_limit: RateLimitConfig,
    pub cache: CacheConfig,
    pub range: ObservationRange,
    pub store_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            rate_limit: RateLimitConfig::default(),
            cache: CacheConfig::default(),
            range: ObservationRange::default(),
            store_timeout: Duration::from_millis(500),
        }
    }
}

impl From<&Args> for Settings {
    fn from(args: &Args) -> Self {
        Self {
            rate_limit: RateLimitConfig {
                capacity: args.rate_limit,
                window: Duration::from_secs(args.rate_window),
            },
            cache: CacheConfig {
                shards: args.workers,
                queue_depth: args.queue_depth,
            },
            range: ObservationRange {
                min: args.min_value,
                max: args.max_value,
            },
            store_timeout: Duration::from_millis(args.store_timeout_ms),
        }
    }
}
