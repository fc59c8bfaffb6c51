//! Operator command surface for the fraud ledger.
//!
//! [`run_cli`] executes a parsed [`Cli`]. Every command prints one JSON
//! document on stdout; logs go to stderr.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use fraud_ledger_core::{ModelSlot, Transaction, TransactionStore};
use fraud_ledger_runtime::config::{
    DEFAULT_DATABASE_PATH, DEFAULT_MODEL_PATH, DEFAULT_POLL_INTERVAL_MS, DEFAULT_QUEUE_PATH,
    DEFAULT_RETRAIN_THRESHOLD, DEFAULT_WATERMARK_PATH,
};
use fraud_ledger_runtime::logging::{self, LogFormat};
use fraud_ledger_runtime::{
    load_linear_model, CommandTrainer, DurableQueue, LedgerPaths, PredictionGateway, QueueWorker,
    RetrainConfig, RetrainOrchestrator, RetrainOutcome, WatermarkStore, WorkerConfig,
    WorkerSummary,
};
use fraud_ledger_store_sqlite::SqliteTransactionStore;
use serde::Serialize;

#[derive(Debug, Parser)]
#[command(name = "fl")]
#[command(about = "Fraud ledger queue, worker and retraining CLI")]
pub struct Cli {
    #[arg(long, env = "FRAUD_LEDGER_QUEUE", default_value = DEFAULT_QUEUE_PATH)]
    queue: PathBuf,

    #[arg(long, env = "FRAUD_LEDGER_WATERMARK", default_value = DEFAULT_WATERMARK_PATH)]
    watermark: PathBuf,

    #[arg(long, env = "FRAUD_LEDGER_DB", default_value = DEFAULT_DATABASE_PATH)]
    db: PathBuf,

    #[arg(long, env = "FRAUD_LEDGER_MODEL", default_value = DEFAULT_MODEL_PATH)]
    model: PathBuf,

    /// compact, pretty or json.
    #[arg(long, env = "FRAUD_LEDGER_LOG_FORMAT", default_value = "compact")]
    log_format: LogFormat,

    /// Used when `RUST_LOG` is unset.
    #[arg(long, default_value = "info")]
    log_filter: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Worker {
        #[command(subcommand)]
        command: Box<WorkerCommand>,
    },
    Retrain {
        #[command(subcommand)]
        command: Box<RetrainCommand>,
    },
    Queue {
        #[command(subcommand)]
        command: Box<QueueCommand>,
    },
    Watermark {
        #[command(subcommand)]
        command: Box<WatermarkCommand>,
    },
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    /// Score one transaction offline and queue the result.
    Predict(PredictArgs),
}

#[derive(Debug, Subcommand)]
pub enum WorkerCommand {
    /// Poll the queue until interrupted or `--max-ticks` is reached.
    Run(WorkerRunArgs),
    /// Drain and persist one batch.
    Tick,
}

#[derive(Debug, Args)]
pub struct WorkerRunArgs {
    #[arg(long, env = "FRAUD_LEDGER_POLL_INTERVAL_MS", default_value_t = DEFAULT_POLL_INTERVAL_MS)]
    poll_interval_ms: u64,
    #[arg(long)]
    max_ticks: Option<u64>,
}

#[derive(Debug, Subcommand)]
pub enum RetrainCommand {
    /// Compare the store row count with the watermark and train when due.
    Evaluate(RetrainEvaluateArgs),
}

#[derive(Debug, Args)]
pub struct RetrainEvaluateArgs {
    #[arg(long, env = "FRAUD_LEDGER_RETRAIN_THRESHOLD", default_value_t = DEFAULT_RETRAIN_THRESHOLD)]
    threshold: u64,
    /// Training program; exit status 0 means success.
    #[arg(long, env = "FRAUD_LEDGER_TRAINER")]
    trainer: PathBuf,
    #[arg(long = "trainer-arg", allow_hyphen_values = true)]
    trainer_args: Vec<String>,
    #[arg(long)]
    trainer_dir: Option<PathBuf>,
    /// Use this row count instead of querying the store.
    #[arg(long)]
    row_count: Option<u64>,
}

#[derive(Debug, Subcommand)]
pub enum QueueCommand {
    Status,
    /// Move lines from an interrupted batch back onto the queue.
    Recover,
}

#[derive(Debug, Subcommand)]
pub enum WatermarkCommand {
    Show,
}

#[derive(Debug, Subcommand)]
pub enum DbCommand {
    Migrate,
    Count,
    Check,
    /// Insert synthetic benign rows.
    Simulate(DbSimulateArgs),
    Recent(DbRecentArgs),
}

#[derive(Debug, Args)]
pub struct DbSimulateArgs {
    #[arg(long, default_value_t = 1001)]
    count: usize,
}

#[derive(Debug, Args)]
pub struct DbRecentArgs {
    #[arg(long, default_value_t = 10)]
    limit: usize,
}

#[derive(Debug, Args)]
pub struct PredictArgs {
    /// Transaction as a JSON object.
    #[arg(long)]
    transaction_json: String,
}

#[derive(Debug, Serialize)]
struct RowCount {
    database: String,
    rows: u64,
}

#[derive(Debug, Serialize)]
struct WatermarkView {
    path: String,
    watermark: u64,
}

#[derive(Debug, Serialize)]
struct RecoverReport {
    queue_path: String,
    recovered_entries: usize,
}

/// Installs the tracing subscriber selected by the global log options.
pub fn init_logging(cli: &Cli) -> Result<()> {
    logging::init(cli.log_format, &cli.log_filter)?;
    Ok(())
}

pub fn run_cli(cli: Cli) -> Result<()> {
    let paths = LedgerPaths {
        queue: cli.queue,
        watermark: cli.watermark,
        database: cli.db,
        model: cli.model,
    };
    paths.validate()?;

    match cli.command {
        Command::Worker { command } => run_worker(*command, &paths),
        Command::Retrain { command } => run_retrain(*command, &paths),
        Command::Queue { command } => run_queue(*command, &paths),
        Command::Watermark { command } => match *command {
            WatermarkCommand::Show => {
                let store = WatermarkStore::new(&paths.watermark);
                print_json(&WatermarkView {
                    path: store.path().display().to_string(),
                    watermark: store.read(),
                })
            }
        },
        Command::Db { command } => run_db(*command, &paths),
        Command::Predict(args) => run_predict(&args, &paths),
    }
}

fn run_worker(command: WorkerCommand, paths: &LedgerPaths) -> Result<()> {
    let queue = Arc::new(DurableQueue::new(&paths.queue));
    let store = SqliteTransactionStore::new(&paths.database);

    match command {
        WorkerCommand::Tick => {
            let worker = QueueWorker::new(queue, store, WorkerConfig::default());
            let report = worker.tick();
            print_json(&report)
        }
        WorkerCommand::Run(args) => {
            let config = WorkerConfig {
                poll_interval: Duration::from_millis(args.poll_interval_ms),
                max_ticks: args.max_ticks,
            };
            config.validate()?;
            let summary = run_worker_loop(QueueWorker::new(queue, store, config))?;
            print_json(&summary)
        }
    }
}

/// Runs the blocking worker loop off the async runtime and turns ctrl-c into
/// a shutdown signal observed between ticks.
fn run_worker_loop(worker: QueueWorker<SqliteTransactionStore>) -> Result<WorkerSummary> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;

    runtime.block_on(async move {
        let (shutdown_tx, shutdown_rx) = std::sync::mpsc::channel::<()>();
        let mut handle = tokio::task::spawn_blocking(move || worker.run(&shutdown_rx));

        let joined = tokio::select! {
            joined = &mut handle => joined,
            signal = tokio::signal::ctrl_c() => {
                if let Err(err) = signal {
                    tracing::warn!(error = %err, "failed to listen for ctrl-c; stopping worker");
                }
                tracing::info!("shutdown requested; finishing current tick");
                let _ = shutdown_tx.send(());
                handle.await
            }
        };
        joined.context("worker thread panicked")
    })
}

fn run_retrain(command: RetrainCommand, paths: &LedgerPaths) -> Result<()> {
    match command {
        RetrainCommand::Evaluate(args) => {
            let config = RetrainConfig {
                threshold: args.threshold,
            };
            config.validate()?;

            let mut trainer = CommandTrainer::new(args.trainer, args.trainer_args);
            if let Some(dir) = args.trainer_dir {
                trainer = trainer.with_working_dir(dir);
            }

            let orchestrator = RetrainOrchestrator::new(WatermarkStore::new(&paths.watermark));
            let outcome = match args.row_count {
                Some(count) => {
                    orchestrator.evaluate_and_maybe_retrain(count, config.threshold, &trainer)
                }
                None => {
                    let store = SqliteTransactionStore::new(&paths.database);
                    orchestrator.run_cycle(&store, config, &trainer)
                }
            };

            print_json(&outcome)?;
            match outcome {
                RetrainOutcome::Skipped { .. } | RetrainOutcome::Retrained { .. } => Ok(()),
                RetrainOutcome::TrainingFailed { reason, .. }
                | RetrainOutcome::WatermarkNotAdvanced { reason, .. }
                | RetrainOutcome::CountUnavailable { reason } => {
                    Err(anyhow!("retraining cycle failed: {reason}"))
                }
            }
        }
    }
}

fn run_queue(command: QueueCommand, paths: &LedgerPaths) -> Result<()> {
    let queue = DurableQueue::new(&paths.queue);
    match command {
        QueueCommand::Status => print_json(&queue.status()?),
        QueueCommand::Recover => {
            let recovered = queue.recover_in_flight()?;
            print_json(&RecoverReport {
                queue_path: queue.path().display().to_string(),
                recovered_entries: recovered,
            })
        }
    }
}

fn run_db(command: DbCommand, paths: &LedgerPaths) -> Result<()> {
    let database = paths.database.display().to_string();
    match command {
        DbCommand::Migrate => {
            SqliteTransactionStore::open(&paths.database)?;
            print_json(&serde_json::json!({ "database": database, "migrated": true }))
        }
        DbCommand::Count => {
            let store = SqliteTransactionStore::new(&paths.database);
            let rows = store.count_rows()?;
            print_json(&RowCount { database, rows })
        }
        DbCommand::Check => {
            let report = SqliteTransactionStore::new(&paths.database).check_connection();
            print_json(&report)?;
            match (report.reachable, report.error) {
                (true, None) => Ok(()),
                (_, Some(error)) => Err(anyhow!("database check failed: {error}")),
                (false, None) => Err(anyhow!("database {database} is not reachable")),
            }
        }
        DbCommand::Simulate(args) => {
            let store = SqliteTransactionStore::open(&paths.database)?;
            let inserted = store.seed_simulated(args.count)?;
            let rows = store.count_rows()?;
            print_json(&serde_json::json!({
                "database": database,
                "inserted": inserted,
                "rows": rows,
            }))
        }
        DbCommand::Recent(args) => {
            let store = SqliteTransactionStore::new(&paths.database);
            print_json(&store.recent(args.limit)?)
        }
    }
}

fn run_predict(args: &PredictArgs, paths: &LedgerPaths) -> Result<()> {
    let transaction: Transaction = serde_json::from_str(&args.transaction_json)
        .context("--transaction-json must be a transaction object")?;

    let model = load_linear_model(&paths.model)?;
    let slot = Arc::new(ModelSlot::new());
    slot.install(Arc::new(model))?;

    let gateway = PredictionGateway::new(slot, Arc::new(DurableQueue::new(&paths.queue)));
    let receipt = gateway.score(transaction)?;
    print_json(&receipt)
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
