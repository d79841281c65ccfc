use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use storyline::agents::{Agents, CompletionAgent, CompletionOptions, HttpCompletionService};
use storyline::api;
use storyline::config::EngineConfig;
use storyline::db::Database;
use storyline::events::{EventBus, InMemoryBroker};
use storyline::orchestrator::Orchestrator;
use storyline::snapshot::SnapshotManager;

#[derive(Parser)]
#[command(name = "storyline")]
#[command(about = "Event-driven orchestration engine for agent-driven software generation")]
struct Cli {
    /// SQLite database file (defaults to the platform data directory)
    #[arg(long, global = true, env = "STORYLINE_DB")]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Port for HTTP API
        #[arg(short, long, default_value = "3000")]
        port: u16,
    },
    /// Apply database migrations and exit
    Migrate,
    /// Run a story's pipeline in the foreground until it finishes
    Process {
        story_id: Uuid,
    },
    /// Cancel a story
    Cancel {
        story_id: Uuid,

        /// Keep the story's file changes instead of rolling them back
        #[arg(long)]
        keep_changes: bool,
    },
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "storyline=debug,tower_http=debug".into()),
    );

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn open_database(path: Option<PathBuf>) -> anyhow::Result<Database> {
    let db = match path {
        Some(path) => Database::open(path)?,
        None => Database::open_default()?,
    };
    db.migrate()?;
    Ok(db)
}

/// Wire bus and orchestrator on top of `broker`, and start the receive loop.
async fn start_engine(
    db: Database,
    broker: Arc<InMemoryBroker>,
    config: EngineConfig,
) -> anyhow::Result<Arc<Orchestrator>> {
    let service = HttpCompletionService::from_config(&config.completion)
        .context("STORYLINE_COMPLETION_URL must be set to run agents")?;
    let agent = CompletionAgent::new(service)
        .with_options(CompletionOptions::from_config(&config.completion));
    let agents = Agents::uniform(Arc::new(agent));

    let bus = Arc::new(EventBus::new(broker, db.clone(), config.event_channel.clone()));

    let orchestrator = Arc::new(Orchestrator::new(db, bus.clone(), agents, config));
    orchestrator.register();
    bus.start_listening().await?;

    Ok(orchestrator)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let config = EngineConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve { port: 3000 }) {
        Commands::Serve { port } => {
            tracing::info!("Starting Storyline server on port {}", port);

            let db = open_database(cli.db)?;
            let broker = Arc::new(InMemoryBroker::new(config.broker_capacity));
            let orchestrator = start_engine(db, broker.clone(), config).await?;
            let app = api::create_router(api::AppState::new(orchestrator));

            let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
            tracing::info!("Storyline server listening on http://127.0.0.1:{}", port);

            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        tracing::error!("Failed to listen for shutdown signal: {}", e);
                    }
                })
                .await?;
            broker.close();
        }
        Commands::Migrate => {
            open_database(cli.db)?;
            println!("Database is up to date");
        }
        Commands::Process { story_id } => {
            let db = open_database(cli.db)?;
            let broker = Arc::new(InMemoryBroker::new(config.broker_capacity));
            let orchestrator = start_engine(db.clone(), broker, config).await?;
            orchestrator.process_story(story_id).await?;

            let story = loop {
                tokio::time::sleep(Duration::from_millis(250)).await;
                let story = db
                    .get_story(story_id)?
                    .context("story disappeared while processing")?;
                if story.status.is_terminal() && !orchestrator.is_running(story_id) {
                    break story;
                }
            };

            println!("Story {} finished: {}", story.id, story.status.as_str());
            if let Some(reason) = &story.failed_reason {
                println!("Reason: {}", reason);
            }
            if story.is_inconsistent() {
                println!("Files not restored: {}", story.rollback_failures.join(", "));
            }
        }
        Commands::Cancel {
            story_id,
            keep_changes,
        } => {
            // Offline cancel: no pipeline runs in this process, so the
            // snapshot manager can act on the story directly.
            let db = open_database(cli.db)?;
            let story = db.get_story(story_id)?.context("story not found")?;
            let outcome =
                SnapshotManager::new(db).cancel(story.id, story.project_id, !keep_changes)?;

            println!(
                "Story {} cancelled, {} open tasks failed",
                story_id,
                outcome.failed_tasks.len()
            );
            if let Some(report) = outcome.rollback {
                println!(
                    "Restored {} files, deleted {}, failed {}",
                    report.restored,
                    report.deleted,
                    report.failures.len()
                );
            }
        }
    }

    Ok(())
}
