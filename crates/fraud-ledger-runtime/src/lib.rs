//! Durable handoff runtime for scored transactions.
//!
//! - [`DurableQueue`]: the append-only queue file with drain, requeue and an
//!   in-flight journal.
//! - [`QueueWorker`]: drains the queue into a [`TransactionStore`] on a fixed
//!   interval and returns failed batches to the queue.
//! - [`WatermarkStore`] and [`RetrainOrchestrator`]: decide when a retraining
//!   run is due and advance the watermark only after it succeeds.
//! - [`PredictionGateway`]: scores a transaction and queues the result without
//!   touching the store.
//!
//! [`TransactionStore`]: fraud_ledger_core::TransactionStore

pub mod config;
pub mod gateway;
pub mod logging;
pub mod queue;
pub mod retrain;
pub mod trainer;
pub mod watermark;
pub mod worker;

pub use config::{LedgerPaths, RetrainConfig, WorkerConfig};
pub use gateway::{load_linear_model, PredictionGateway, PredictionReceipt, ScoredTransaction};
pub use queue::{DurableQueue, QueueEntry, QueueStatus};
pub use retrain::{RetrainOrchestrator, RetrainOutcome};
pub use trainer::CommandTrainer;
pub use watermark::WatermarkStore;
pub use worker::{QueueWorker, TickOutcome, TickReport, WorkerSummary};
