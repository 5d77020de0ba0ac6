use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use evalboard::config::{AppConfig, LoggingConfig};
use evalboard::runs::{RunStatus, SqliteRunStore};
use evalboard::scores::{ScoreAggregator, OVERALL};

#[derive(Parser)]
#[command(
    name = "evalboard",
    about = "Run lifecycle monitor and score leaderboard for LLM evaluations",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (defaults to $EVALBOARD_CONFIG, then ./evalboard.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// SQLite database path, overrides storage.db_path
    #[arg(long, global = true)]
    db: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (API server + run monitor)
    Serve {
        /// Bind address, overrides api.bind
        #[arg(long)]
        bind: Option<String>,
    },

    /// Run only the run lifecycle monitor
    Monitor {
        /// One reaper pass and one auto-resume pass, then exit
        #[arg(long)]
        once: bool,
    },

    /// Compute and inspect batch leaderboards
    Scores {
        #[command(subcommand)]
        action: ScoresAction,
    },

    /// Inspect evaluation runs
    Runs {
        #[command(subcommand)]
        action: RunsAction,
    },
}

#[derive(Subcommand)]
enum ScoresAction {
    /// Recompute scores for a batch, or one model in it
    Compute {
        #[arg(long)]
        batch: i64,

        #[arg(long)]
        model: Option<i64>,
    },

    /// Delete all scores of a batch
    Clear {
        #[arg(long)]
        batch: i64,
    },

    /// Rank models in a batch
    Rank {
        #[arg(long)]
        batch: i64,

        /// Score type to rank by
        #[arg(long, default_value = OVERALL)]
        score_type: String,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Show every score row of one model in a batch
    Show {
        #[arg(long)]
        batch: i64,

        #[arg(long)]
        model: i64,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum RunsAction {
    /// List evaluation runs
    List {
        /// Only runs in this status (e.g. PAUSED)
        #[arg(long)]
        status: Option<RunStatus>,
    },
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::resolve(cli.config.as_deref())?;
    if let Some(db) = cli.db {
        config.storage.db_path = db;
    }
    init_tracing(&config.logging);

    match cli.command {
        Commands::Serve { bind } => {
            let bind = bind.unwrap_or_else(|| config.api.bind.clone());
            tracing::info!(%bind, "Starting evalboard daemon");
            evalboard::serve(&config, &bind).await?;
        }
        Commands::Monitor { once } => {
            let pool = evalboard::storage::open_pool(&config.storage.db_path)?;
            let monitor = Arc::new(evalboard::build_monitor(pool, &config));

            if once {
                let (reaped, resumed) = monitor.run_once().await;
                let output =
                    serde_json::json!({ "timeout_reaper": reaped, "auto_resume": resumed });
                println!("{}", serde_json::to_string_pretty(&output)?);
            } else {
                let handle = evalboard::monitor::spawn(monitor);
                evalboard::shutdown_signal().await;
                handle.abort();
            }
        }
        Commands::Scores { action } => {
            let pool = evalboard::storage::open_pool(&config.storage.db_path)?;
            let aggregator = ScoreAggregator::new(pool, config.aggregation.on_model_failure);
            run_scores(&aggregator, action)?;
        }
        Commands::Runs { action } => {
            let pool = evalboard::storage::open_pool(&config.storage.db_path)?;
            let store = SqliteRunStore::new(pool);

            match action {
                RunsAction::List { status } => {
                    let runs = store.list(status).context("failed to list runs")?;
                    if runs.is_empty() {
                        println!("No runs found.");
                    } else {
                        println!(
                            "{:<6} | {:<20} | {:<12} | {:<8} | Last activity",
                            "ID", "Name", "Status", "Resumes"
                        );
                        println!(
                            "{:-<6}-|-{:-<20}-|-{:-<12}-|-{:-<8}-|-{:-<25}",
                            "", "", "", "", ""
                        );
                        for run in runs {
                            println!(
                                "{:<6} | {:<20} | {:<12} | {:<8} | {}",
                                run.id,
                                run.name,
                                run.status,
                                run.resume_count,
                                run.last_activity().to_rfc3339()
                            );
                        }
                    }
                }
            }
        }
    }

    Ok(())
}

fn run_scores(aggregator: &ScoreAggregator, action: ScoresAction) -> Result<()> {
    match action {
        ScoresAction::Compute { batch, model: Some(model) } => {
            let rows = aggregator
                .compute_for_model(batch, model)
                .with_context(|| {
                    format!("failed to compute scores for model {model} in batch {batch}")
                })?;
            println!("Computed {rows} score rows for model {model} in batch {batch}.");
        }
        ScoresAction::Compute { batch, model: None } => {
            let summary = aggregator
                .compute_for_batch(batch)
                .with_context(|| format!("failed to compute scores for batch {batch}"))?;
            println!("Computed {} models in batch {batch}.", summary.computed.len());
            for failure in &summary.failed {
                println!(" - model {} failed: {}", failure.model_id, failure.error);
            }
        }
        ScoresAction::Clear { batch } => {
            let removed = aggregator
                .clear_for_batch(batch)
                .with_context(|| format!("failed to clear scores for batch {batch}"))?;
            println!("Removed {removed} score rows from batch {batch}.");
        }
        ScoresAction::Rank { batch, score_type, json } => {
            let rankings = aggregator.rank_models_in_batch(batch, Some(&score_type))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&rankings)?);
            } else if rankings.is_empty() {
                println!("No {score_type} scores in batch {batch}.");
            } else {
                println!(
                    "{:<4} | {:<24} | {:<12} | {:<8} | Answers",
                    "Rank", "Model", "Provider", "Average"
                );
                println!("{:-<4}-|-{:-<24}-|-{:-<12}-|-{:-<8}-|-{:-<7}", "", "", "", "", "");
                for r in rankings {
                    println!(
                        "{:<4} | {:<24} | {:<12} | {:<8.4} | {}",
                        r.rank,
                        r.model_name,
                        r.provider.as_deref().unwrap_or("-"),
                        r.average_score,
                        r.scored_answers
                    );
                }
            }
        }
        ScoresAction::Show { batch, model, json } => {
            let details = aggregator.model_score_details(batch, model)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&details)?);
            } else {
                println!("\n=== {} in {} ===", details.model.name, details.batch.name);
                for (score_type, rows) in &details.scores_by_type {
                    println!("\n{score_type}");
                    for row in rows {
                        let evaluator =
                            row.evaluator_id.map_or_else(|| "all".to_string(), |id| id.to_string());
                        let repeat = if row.repeat_index < 0 {
                            "all".to_string()
                        } else {
                            row.repeat_index.to_string()
                        };
                        println!(
                            "  evaluator {:<5} repeat {:<4} avg {:.4} ({} answers)",
                            evaluator, repeat, row.average_score, row.scored_answers
                        );
                    }
                }
                println!();
            }
        }
    }
    Ok(())
}
