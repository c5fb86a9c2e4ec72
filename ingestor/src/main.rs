use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use ingestor::model::{Filters, ProgressStatus, RunResult};
use ingestor::store::{MemoryStore, PgStore};
use ingestor::{App, StartRequest};
use ingestor_core::{telemetry, Config, Error};
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Parser)]
#[clap(name = "ingestor")]
#[clap(about = "Resumable paginated ingestion of Riksdagen and Regeringen open data", version)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct TaskArgs {
    /// Remote source (riksdagen, regeringen)
    source: String,

    /// Data type to ingest (documents, members, speeches, votes, press_releases, categorized_documents)
    data_type: String,
}

#[derive(Args, Debug)]
struct FilterArgs {
    /// Earliest date, YYYY-MM-DD
    #[clap(long)]
    from: Option<NaiveDate>,

    /// Latest date, YYYY-MM-DD
    #[clap(long)]
    to: Option<NaiveDate>,

    #[clap(long)]
    search: Option<String>,

    #[clap(long)]
    party: Option<String>,

    #[clap(long)]
    committee: Option<String>,

    #[clap(long)]
    member_id: Option<String>,

    #[clap(long)]
    doc_type: Option<String>,

    /// Parliamentary year, e.g. 2023/24
    #[clap(long)]
    riksmote: Option<String>,

    /// Required for regeringen categorized_documents
    #[clap(long)]
    category: Option<String>,

    #[clap(long)]
    page_size: Option<u32>,
}

impl From<FilterArgs> for Filters {
    fn from(args: FilterArgs) -> Self {
        Filters {
            from: args.from,
            to: args.to,
            search: args.search,
            party: args.party,
            committee: args.committee,
            member_id: args.member_id,
            doc_type: args.doc_type,
            riksmote: args.riksmote,
            category: args.category,
            page_size: args.page_size,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run database migrations
    Migrate,

    /// Run one bounded invocation of an ingestion task
    Start {
        #[clap(flatten)]
        task: TaskArgs,

        #[clap(flatten)]
        filters: FilterArgs,

        /// Fetch only the first page and mark the task complete
        #[clap(long)]
        no_paginate: bool,

        /// Page budget of this invocation
        #[clap(long, env = "INGESTOR_MAX_PAGES")]
        max_pages: Option<u32>,

        /// Use an in-memory store instead of the database
        #[clap(long)]
        dry_run: bool,
    },

    /// Invoke Start until the task completes, fails or is stopped
    Drain {
        #[clap(flatten)]
        task: TaskArgs,

        #[clap(flatten)]
        filters: FilterArgs,

        #[clap(long, env = "INGESTOR_MAX_PAGES")]
        max_pages: Option<u32>,

        /// Upper bound on Start invocations
        #[clap(long, default_value_t = 1000)]
        max_invocations: u32,
    },

    /// Ask a running task to stop at its next page boundary
    Stop {
        #[clap(flatten)]
        task: TaskArgs,
    },

    /// Clear the stop flag and reset progress to pending
    Reset {
        #[clap(flatten)]
        task: TaskArgs,
    },

    /// Print the task's progress record
    Progress {
        #[clap(flatten)]
        task: TaskArgs,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!(error = %e, "Fatal error");
        eprintln!("error: {e}");

        let client_error = e
            .downcast_ref::<Error>()
            .map_or(false, Error::is_client_error);
        process::exit(if client_error { 2 } else { 1 });
    }
}

async fn run() -> anyhow::Result<()> {
    let config = Config::load()
        .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;

    telemetry::init(&config.telemetry)?;

    let cli = Cli::parse();

    match cli.command {
        Commands::Migrate => {
            let pool = connect(&config).await?;
            info!("Running database migrations");
            sqlx::migrate!("../migrations").run(&pool).await?;
            info!("Migrations completed successfully");
        }

        Commands::Start {
            task,
            filters,
            no_paginate,
            max_pages,
            dry_run,
        } => {
            let request = StartRequest {
                source: task.source,
                data_type: task.data_type,
                filters: filters.into(),
                paginate: !no_paginate,
                max_pages_per_invocation: max_pages,
            };

            let app = if dry_run {
                info!("Dry run, nothing is written to the database");
                App::new(config, Arc::new(MemoryStore::new()))?
            } else {
                database_app(config).await?
            };

            let result = app.start(&request).await?;
            finish_run(&result)?;
        }

        Commands::Drain {
            task,
            filters,
            max_pages,
            max_invocations,
        } => {
            let request = StartRequest {
                source: task.source,
                data_type: task.data_type,
                filters: filters.into(),
                paginate: true,
                max_pages_per_invocation: max_pages,
            };
            let app = database_app(config).await?;

            let mut invocations = 0;
            let result = loop {
                invocations += 1;
                let result = app.start(&request).await?;
                info!(
                    invocation = invocations,
                    status = %result.status,
                    inserted = result.inserted,
                    pages = result.pages_processed,
                    "Invocation finished"
                );

                if result.status != ProgressStatus::Partial {
                    break result;
                }
                if invocations >= max_invocations {
                    warn!(invocations, "Invocation limit reached before the task completed");
                    break result;
                }
            };

            finish_run(&result)?;
        }

        Commands::Stop { task } => {
            let app = database_app(config).await?;
            app.stop(&task.source, &task.data_type).await?;
        }

        Commands::Reset { task } => {
            let app = database_app(config).await?;
            let record = app.reset(&task.source, &task.data_type).await?;
            print_json(&record)?;
        }

        Commands::Progress { task } => {
            let app = database_app(config).await?;
            let record = app.progress(&task.source, &task.data_type).await?;
            print_json(&record)?;
        }
    }

    telemetry::shutdown();
    Ok(())
}

async fn connect(config: &Config) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .min_connections(config.database.min_connections)
        .acquire_timeout(Duration::from_secs(config.database.connect_timeout_secs))
        .idle_timeout(Duration::from_secs(config.database.idle_timeout_secs))
        .connect(&config.database.url)
        .await?;
    Ok(pool)
}

async fn database_app(config: Config) -> anyhow::Result<App> {
    let store = PgStore::new(connect(&config).await?);

    info!("Performing health checks");
    store.health_check().await?;

    Ok(App::new(config, Arc::new(store))?)
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Prints the result and turns a failed run into a non-zero exit.
fn finish_run(result: &RunResult) -> anyhow::Result<()> {
    print_json(result)?;
    if !result.success {
        anyhow::bail!("ingestion failed: {}", result.message);
    }
    Ok(())
}
