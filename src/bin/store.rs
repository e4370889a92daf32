use clap::{Parser, Subcommand};
use fusion_store::{
    Config, HistoryService, ItemKind, RateLimiter, config::BackendKind,
    history::DEFAULT_PAGE_LIMIT, open_storage,
};
use serde_json::json;
use tracing::{info, level_filters::LevelFilter, trace};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
#[command(about = "Maintenance tool for the fused item store")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Delete every item whose expiry has passed
    Sweep,

    /// Print one page of history
    History {
        /// fused or custom
        #[arg(long, default_value = "fused")]
        kind: ItemKind,

        #[arg(long, default_value_t = 1)]
        page: i64,

        #[arg(long, default_value_t = DEFAULT_PAGE_LIMIT)]
        limit: i64,

        /// Only custom items of this category
        #[arg(long)]
        category: Option<String>,
    },

    /// Show the remaining quota of a client on an endpoint
    RateInfo { client: String, endpoint: String },

    /// Reset the rate limit of a client on an endpoint
    RateClear { client: String, endpoint: String },

    /// Check that the storage backend responds
    Health,
}

impl Command {
    fn writes(&self) -> bool {
        matches!(self, Command::Sweep | Command::RateClear { .. })
    }
}

fn init() {
    let filter = filter::Targets::new().with_targets(vec![("fusion_store", LevelFilter::DEBUG)]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init();
    let args = Args::parse();
    trace!("started with args: {args:?}");

    let mut config = Config::from_env();

    // inspect an existing table without contending for its write lock
    if !args.command.writes()
        && config
            .storage
            .kv_table_path
            .as_ref()
            .is_some_and(|path| path.exists())
    {
        config.storage.kv_read_only = true;
    }

    let backend = match config.storage.backend {
        BackendKind::KeyValue => "key-value",
        BackendKind::Relational => "relational",
    };
    info!("opening {backend} storage");

    let storage = open_storage(&config.storage).await?;

    let output = match args.command {
        Command::Sweep => {
            let deleted = storage.sweep_expired().await;
            json!({ "deleted": deleted })
        }
        Command::History {
            kind,
            page,
            limit,
            category,
        } => {
            let history =
                HistoryService::new(storage.clone()).with_degraded_mode(config.degraded_mode);
            let result = history
                .get_history(kind, page, limit, category.as_deref())
                .await?;
            serde_json::to_value(result)?
        }
        Command::RateInfo { client, endpoint } => {
            let limiter = RateLimiter::new(storage.clone(), config.rate_limit.clone());
            serde_json::to_value(limiter.get_info(&client, &endpoint).await)?
        }
        Command::RateClear { client, endpoint } => {
            let limiter = RateLimiter::new(storage.clone(), config.rate_limit.clone());
            limiter.clear(&client, &endpoint).await?;
            json!({ "cleared": format!("{client} {endpoint}") })
        }
        Command::Health => {
            let health = storage.health_check().await?;
            json!({
                "backend": storage.backend_type(),
                "healthy": health.healthy,
                "message": health.message,
                "metadata": health.metadata,
            })
        }
    };

    println!("{}", serde_json::to_string_pretty(&output)?);

    storage.close().await?;
    Ok(())
}
