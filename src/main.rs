use clap::{Parser, Subcommand};

use lattice::application::application::Application;
use lattice::application::background::Pipes;
use lattice::application::config::configuration::Configuration;
use lattice::db::filters::SearchFilters;
use lattice::db::repositories::{active_snapshot_of, repository_by_url};
use lattice::db::{sqlite, EngineError, EngineResult};
use lattice::indexer::orchestrator::IndexOutcome;
use lattice::relations::{JsonlRelationFeed, RelationSource};
use lattice::repo::types::RepoRef;
use lattice::retrieval::Strategy;

#[derive(Parser, Debug)]
#[clap(name = "lattice", version, about = "Code property graph engine")]
struct Cli {
    #[clap(flatten)]
    config: Configuration,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Index a repository at its branch tip and activate the snapshot
    Index {
        repo_url: String,
        #[clap(long, default_value = "main")]
        branch: String,
        /// Index even if the commit already has a completed snapshot
        #[clap(long)]
        force: bool,
        /// JSON-lines cross-file relation feed to ingest during the run
        #[clap(long)]
        relations_feed: Option<std::path::PathBuf>,
    },
    /// Generate embeddings for the active snapshot
    Embed {
        repo_url: String,
        #[clap(long, default_value = "main")]
        branch: String,
        /// Override the configured embedding model
        #[clap(long)]
        model: Option<String>,
        #[clap(long)]
        batch_size: Option<usize>,
    },
    /// Query a repository; prints one JSON result per line
    Search {
        repo_url: String,
        query: String,
        #[clap(long, default_value = "hybrid")]
        strategy: String,
        #[clap(long, default_value_t = 10)]
        limit: usize,
        #[clap(long, default_value = "main")]
        branch: String,
    },
    /// Database maintenance
    Db {
        #[clap(subcommand)]
        command: DbCommand,
    },
}

#[derive(Subcommand, Debug)]
enum DbCommand {
    /// Apply pending schema migrations
    Upgrade,
}

fn display_name(repo_url: &str) -> String {
    repo_url
        .trim_end_matches('/')
        .trim_end_matches(".git")
        .rsplit(['/', ':'])
        .next()
        .unwrap_or(repo_url)
        .to_owned()
}

async fn run(cli: Cli) -> EngineResult<()> {
    let mut config = cli.config;

    match cli.command {
        Command::Db {
            command: DbCommand::Upgrade,
        } => {
            sqlite::upgrade(&config.db_url).await?;
            println!("database schema is up to date");
            Ok(())
        }
        Command::Index {
            repo_url,
            branch,
            force,
            relations_feed,
        } => {
            let app = Application::initialize(config).await?;
            let repo = RepoRef::new(&repo_url, &branch);
            let pipes = Pipes::new(0);
            let sources: Vec<std::sync::Arc<dyn RelationSource>> = relations_feed
                .into_iter()
                .map(|path| {
                    std::sync::Arc::new(JsonlRelationFeed::new(path))
                        as std::sync::Arc<dyn RelationSource>
                })
                .collect();
            let orchestrator = app.indexer(sources);
            match orchestrator
                .index(&repo, &display_name(&repo_url), force, &pipes)
                .await?
            {
                IndexOutcome::Queued => println!("queued"),
                IndexOutcome::Reused { snapshot_id } => println!("{snapshot_id}"),
                IndexOutcome::Indexed { snapshot_id, stats } => {
                    println!("{snapshot_id}");
                    eprintln!(
                        "{}",
                        serde_json::to_string(&stats).map_err(anyhow::Error::from)?
                    );
                }
            }
            Ok(())
        }
        Command::Embed {
            repo_url,
            branch,
            model,
            batch_size,
        } => {
            if let Some(model) = model {
                config.embedding_model = model;
            }
            let app = Application::initialize(config).await?;
            let repo_id = repository_by_url(&app.sql, &repo_url, &branch).await?;
            let snapshot_id = active_snapshot_of(&app.sql, repo_id)
                .await?
                .ok_or_else(|| {
                    EngineError::Usage(format!("{repo_url} has no completed snapshot"))
                })?;

            let pipeline = app.embedding_pipeline(batch_size).ok_or_else(|| {
                EngineError::Usage("no embedding provider configured (set EMBEDDING_API_KEY)".into())
            })?;
            let summary = pipeline.run_to_completion(snapshot_id).await?;
            println!(
                "{}",
                serde_json::json!({
                    "snapshot_id": snapshot_id,
                    "newly_embedded": summary.newly_embedded,
                    "reused": summary.reused,
                    "errored": summary.errored,
                })
            );
            Ok(())
        }
        Command::Search {
            repo_url,
            query,
            strategy,
            limit,
            branch,
        } => {
            let strategy = Strategy::parse(&strategy)?;
            let app = Application::initialize(config).await?;
            let repo_id = repository_by_url(&app.sql, &repo_url, &branch).await?;
            let retrieval = app.retrieval();
            let results = retrieval
                .retrieve(&query, repo_id, None, limit, strategy, &SearchFilters::default())
                .await?;
            for result in results {
                println!(
                    "{}",
                    serde_json::to_string(&result).map_err(anyhow::Error::from)?
                );
            }
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    Application::install_logging(&cli.config);

    let exit_code = match run(cli).await {
        Ok(()) => 0,
        Err(EngineError::Usage(message)) => {
            eprintln!("error: {message}");
            2
        }
        Err(err) => {
            eprintln!("error: {err}");
            1
        }
    };
    std::process::exit(exit_code);
}
