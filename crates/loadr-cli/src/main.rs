use std::sync::Once;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use loadr_core::{pipeline, EventId, PipelineSchema, PIPELINES};
use loadr_storage::{pipeline_ddl, PgStore, PoolConfig};
use loadr_sync::{open_store, Loader, LoaderConfig};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "loadr")]
#[command(about = "Delivery loaders: apply feed deliveries to latest-state tables")]
struct Cli {
    /// Log output format; falls back to LOG_FORMAT.
    #[arg(long, global = true, value_enum)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Poll the feed and load deliveries (default).
    Run(RunArgs),
    /// Create the tables and sequence of one or all pipelines.
    Migrate(TargetArgs),
    /// Show the watermark and the most recent deliveries.
    Status(StatusArgs),
    /// Print the event log of one table as JSON lines.
    Events(EventsArgs),
    /// Print the DDL of one or all pipelines.
    Ddl {
        #[arg(long)]
        pipeline: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

/// Every flag overrides the environment variable of the same name.
#[derive(Debug, Default, Args)]
struct RunArgs {
    #[arg(long)]
    pipeline: Option<String>,
    #[arg(long)]
    data_source: Option<String>,
    /// Keep polling (RUN_AS_SERVICE=true).
    #[arg(long, conflicts_with = "once")]
    service: bool,
    /// Load at most one delivery and exit.
    #[arg(long)]
    once: bool,
    /// Seconds.
    #[arg(long)]
    min_sleep: Option<u64>,
    /// Seconds.
    #[arg(long)]
    max_sleep: Option<u64>,
    #[arg(long)]
    dry_run: bool,
    #[arg(long)]
    notifications: bool,
    #[arg(long)]
    broker_url: Option<String>,
    /// Directory or http(s) base URL of the delivery feed.
    #[arg(long)]
    source: Option<String>,
    #[arg(long)]
    source_token: Option<String>,
    /// Postgres URL; without one the loader runs against an in-process store.
    #[arg(long)]
    target: Option<String>,
}

impl RunArgs {
    fn apply(self, mut config: LoaderConfig) -> LoaderConfig {
        if let Some(pipeline) = self.pipeline {
            config.pipeline = pipeline;
        }
        if let Some(data_source) = self.data_source {
            config.data_source = data_source;
        }
        if self.service {
            config.run_as_service = true;
        }
        if self.once {
            config.run_as_service = false;
        }
        if let Some(secs) = self.min_sleep {
            config.min_sleep = Duration::from_secs(secs);
        }
        if let Some(secs) = self.max_sleep {
            config.max_sleep = Duration::from_secs(secs);
        }
        config.dry_run |= self.dry_run;
        config.notifications |= self.notifications;
        if self.broker_url.is_some() {
            config.broker_url = self.broker_url;
        }
        if let Some(source) = self.source {
            config.source = source;
        }
        if self.source_token.is_some() {
            config.source_token = self.source_token;
        }
        if self.target.is_some() {
            config.target = self.target;
        }
        config
    }
}

#[derive(Debug, Args)]
struct TargetArgs {
    /// Limit to one pipeline; all pipelines otherwise.
    #[arg(long)]
    pipeline: Option<String>,
    /// Postgres URL; falls back to TARGET / DATABASE_URL.
    #[arg(long)]
    target: Option<String>,
}

#[derive(Debug, Args)]
struct StatusArgs {
    #[arg(long)]
    pipeline: Option<String>,
    #[arg(long)]
    target: Option<String>,
    #[arg(long, default_value_t = 10)]
    limit: usize,
}

#[derive(Debug, Args)]
struct EventsArgs {
    #[arg(long)]
    pipeline: String,
    /// Entity table or the pipeline's control table.
    #[arg(long)]
    table: String,
    /// Only events after this id.
    #[arg(long, default_value_t = 0)]
    since: i64,
    #[arg(long)]
    target: Option<String>,
}

static INIT_LOGGING: Once = Once::new();

fn init_logging(format: LogFormat) {
    INIT_LOGGING.call_once(|| {
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

fn log_format_from_env() -> LogFormat {
    match std::env::var("LOG_FORMAT") {
        Ok(value) if value.eq_ignore_ascii_case("json") => LogFormat::Json,
        _ => LogFormat::Pretty,
    }
}

fn selected_pipelines(name: Option<&str>) -> Result<Vec<&'static PipelineSchema>> {
    match name {
        Some(name) => match pipeline(name) {
            Some(schema) => Ok(vec![schema]),
            None => bail!("unknown pipeline {name}"),
        },
        None => Ok(PIPELINES.iter().collect()),
    }
}

fn target_url(flag: Option<String>) -> Result<String> {
    flag.or_else(|| LoaderConfig::from_env().target)
        .context("a Postgres target is required (--target, TARGET or DATABASE_URL)")
}

fn stop_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received; stopping after the current delivery");
            let _ = tx.send(true);
        }
    });
    rx
}

async fn run(args: RunArgs) -> Result<()> {
    let config = args.apply(LoaderConfig::from_env());
    let loader = Loader::from_config(config).await.context("configuring loader")?;
    loader.run(stop_on_ctrl_c()).await?;
    Ok(())
}

async fn migrate(args: TargetArgs) -> Result<()> {
    let url = target_url(args.target)?;
    for schema in selected_pipelines(args.pipeline.as_deref())? {
        let store = PgStore::connect(&url, schema, PoolConfig::default()).await?;
        store.migrate().await?;
        println!("migrated pipeline {}", schema.name);
    }
    Ok(())
}

async fn status(args: StatusArgs) -> Result<()> {
    let mut config = LoaderConfig::from_env();
    if args.target.is_some() {
        config.target = args.target;
    }
    if config.target.is_none() {
        warn!("no target configured; an in-process store has no history");
    }
    for schema in selected_pipelines(args.pipeline.as_deref())? {
        let store = open_store(&config, schema).await?;
        let last = store.last_delivery().await?;
        println!(
            "pipeline={} last_delivery={}",
            schema.name,
            last.map(|id| id.to_string()).unwrap_or_else(|| "none".into())
        );
        for record in store.deliveries(args.limit).await? {
            let summary = record
                .summary
                .as_ref()
                .map(|s| serde_json::to_string(&s.stats))
                .transpose()?
                .unwrap_or_else(|| "{}".into());
            println!(
                "  delivery={} ts={} runtime_ms={} stats={}",
                record.delivery_id,
                record.delivery_ts.to_rfc3339(),
                record.runtime.num_milliseconds(),
                summary
            );
        }
    }
    Ok(())
}

async fn events(args: EventsArgs) -> Result<()> {
    let mut config = LoaderConfig::from_env();
    if args.target.is_some() {
        config.target = args.target;
    }
    let schema = selected_pipelines(Some(&args.pipeline))?[0];
    let store = open_store(&config, schema).await?;
    for entry in store.events(&args.table, EventId(args.since)).await? {
        println!("{}", serde_json::to_string(&entry)?);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format.unwrap_or_else(log_format_from_env));

    match cli.command.unwrap_or(Commands::Run(RunArgs::default())) {
        Commands::Run(args) => run(args).await?,
        Commands::Migrate(args) => migrate(args).await?,
        Commands::Status(args) => status(args).await?,
        Commands::Events(args) => events(args).await?,
        Commands::Ddl { pipeline } => {
            for schema in selected_pipelines(pipeline.as_deref())? {
                println!("-- pipeline {}", schema.name);
                for statement in pipeline_ddl(schema) {
                    println!("{statement};\n");
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_flags_override_environment_defaults() {
        let cli = Cli::parse_from([
            "loadr", "run", "--pipeline", "orders", "--once", "--min-sleep", "1", "--max-sleep", "2",
            "--dry-run", "--source", "https://feed.test",
        ]);
        let Some(Commands::Run(args)) = cli.command else {
            panic!("expected run");
        };
        let config = args.apply(LoaderConfig::default());
        assert_eq!(config.pipeline, "orders");
        assert!(!config.run_as_service);
        assert_eq!(config.min_sleep, Duration::from_secs(1));
        assert_eq!(config.max_sleep, Duration::from_secs(2));
        assert!(config.dry_run);
        assert_eq!(config.source, "https://feed.test");
        assert!(config.target.is_none());
    }

    #[test]
    fn service_and_once_conflict() {
        assert!(Cli::try_parse_from(["loadr", "run", "--service", "--once"]).is_err());
    }

    #[test]
    fn events_reads_from_the_start_by_default() {
        let cli = Cli::parse_from(["loadr", "events", "--pipeline", "portfolio", "--table", "position_latest"]);
        let Some(Commands::Events(args)) = cli.command else {
            panic!("expected events");
        };
        assert_eq!(args.since, 0);
        assert_eq!(args.table, "position_latest");
    }

    #[test]
    fn pipeline_selection() {
        assert_eq!(selected_pipelines(None).unwrap().len(), PIPELINES.len());
        assert_eq!(selected_pipelines(Some("strategy")).unwrap()[0].name, "strategy");
        assert!(selected_pipelines(Some("bonds")).is_err());
    }
}
