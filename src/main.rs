use clap::Parser; // for cli
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use like_cache::config::{Args, Command, Settings};
use like_cache::range::IdRange;
use like_cache::source::{MemoryRecords, PgSource, SourceOfRecord};
use like_cache::{AppState, EntityId, metrics};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    // parse cli arguments
    let args = Args::parse();

    let result = run(&args).await;
    if args.print_metrics {
        print!("{}", metrics::render());
    }

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "command failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: &Args) -> Result<(), BoxError> {
    let settings = Settings::from(args);
    info!(
        capacity = settings.rate_limit.capacity,
        window = ?settings.rate_limit.window,
        workers = settings.cache.shards,
        "starting"
    );
    let state = AppState::connect(settings, &args.redis_url).await?;

    match &args.command {
        Command::Rebuild { snapshot } => {
            let source: Arc<dyn SourceOfRecord> = match (snapshot, &args.database_url) {
                (Some(path), _) => Arc::new(MemoryRecords::load_snapshot(path).await?),
                (None, Some(url)) => Arc::new(PgSource::connect(url)?),
                (None, None) => return Err("rebuild needs --snapshot or --database-url".into()),
            };
            let written = state.cache.rebuild(source.as_ref()).await?;
            println!("rebuilt {written} records");
        }
        Command::List { from, to } => {
            let max_id = state.cache.cache().max_id().await?;
            let range = IdRange::resolve(*from, *to, max_id);
            let records = state.cache.list(&range.ids()).await?;
            let body = serde_json::json!({
                "from": range.from,
                "to": range.to,
                "items": records,
            });
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
        Command::Admit { content_id } => {
            let admission = state.rate_limiter.admit_entity(EntityId(*content_id)).await?;
            println!("{admission:?}");
        }
    }
    Ok(())
}
