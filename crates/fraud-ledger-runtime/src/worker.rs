use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;

use fraud_ledger_core::{LedgerError, StoreSession, TransactionStore};
use serde::Serialize;
use ulid::Ulid;

use crate::config::WorkerConfig;
use crate::queue::{DurableQueue, QueueEntry};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TickOutcome {
    Idle,
    Committed {
        inserted: usize,
        total: usize,
        malformed: usize,
    },
    /// The store was unreachable; every drained line went back on the queue.
    Requeued { total: usize, reason: String },
    /// The store was unreachable and the requeue also failed. The batch
    /// stays in the in-flight journal until the next tick recovers it.
    RequeueFailed { total: usize, reason: String },
    /// The journal could not be recovered or the queue could not be drained.
    /// Nothing was taken off the queue.
    DrainFailed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub batch_id: Ulid,
    /// Lines moved from the in-flight journal back onto the queue before
    /// this tick drained it.
    pub recovered_entries: usize,
    #[serde(flatten)]
    pub outcome: TickOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerSummary {
    pub ticks: u64,
    pub recovered_entries: usize,
    pub inserted: usize,
    pub malformed: usize,
    pub requeued: usize,
    pub failed_ticks: u64,
}

impl WorkerSummary {
    fn record(&mut self, report: &TickReport) {
        self.ticks += 1;
        self.recovered_entries += report.recovered_entries;
        match &report.outcome {
            TickOutcome::Idle => {}
            TickOutcome::Committed {
                inserted,
                malformed,
                ..
            } => {
                self.inserted += inserted;
                self.malformed += malformed;
            }
            TickOutcome::Requeued { total, .. } => {
                self.requeued += total;
                self.failed_ticks += 1;
            }
            TickOutcome::RequeueFailed { .. } | TickOutcome::DrainFailed { .. } => {
                self.failed_ticks += 1;
            }
        }
    }
}

/// Moves queued records into the transaction store, one batch per tick.
#[derive(Debug)]
pub struct QueueWorker<S> {
    queue: Arc<DurableQueue>,
    store: S,
    config: WorkerConfig,
}

enum BatchResult {
    Committed { inserted: usize, malformed: usize },
    StoreUnavailable(LedgerError),
}

impl<S> QueueWorker<S>
where
    S: TransactionStore,
{
    #[must_use]
    pub fn new(queue: Arc<DurableQueue>, store: S, config: WorkerConfig) -> Self {
        Self {
            queue,
            store,
            config,
        }
    }

    #[must_use]
    pub fn queue(&self) -> &DurableQueue {
        &self.queue
    }

    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Drains the queue once and settles the batch.
    ///
    /// Lines left in the in-flight journal by an interrupted worker or a
    /// failed requeue go back on the queue first; if that fails nothing is
    /// drained. A record that fails to decode or insert is dropped with a
    /// warning and the rest of the batch continues. A connectivity failure at
    /// any point before the commit returns the whole batch to the queue.
    pub fn tick(&self) -> TickReport {
        let batch_id = Ulid::new();
        let span = tracing::info_span!("worker_tick", %batch_id);
        let _entered = span.enter();

        let recovered_entries = match self.queue.recover_in_flight() {
            Ok(0) => 0,
            Ok(recovered) => {
                tracing::warn!(recovered, "recovered lines from unsettled batch");
                recovered
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to recover in-flight journal; not draining");
                return TickReport {
                    batch_id,
                    recovered_entries: 0,
                    outcome: TickOutcome::DrainFailed {
                        reason: err.to_string(),
                    },
                };
            }
        };
        let report = |outcome| TickReport {
            batch_id,
            recovered_entries,
            outcome,
        };

        let entries = match self.queue.drain_all() {
            Ok(entries) => entries,
            Err(err) => {
                tracing::error!(error = %err, "failed to drain queue");
                return report(TickOutcome::DrainFailed {
                    reason: err.to_string(),
                });
            }
        };

        if entries.is_empty() {
            tracing::debug!("queue empty");
            return report(TickOutcome::Idle);
        }

        let total = entries.len();
        tracing::info!(total, "drained batch");

        let outcome = match self.persist(&entries) {
            BatchResult::Committed {
                inserted,
                malformed,
            } => {
                if let Err(err) = self.queue.acknowledge() {
                    tracing::warn!(
                        error = %err,
                        "batch committed but in-flight journal was not removed"
                    );
                }
                tracing::info!(inserted, total, malformed, "batch committed");
                TickOutcome::Committed {
                    inserted,
                    total,
                    malformed,
                }
            }
            BatchResult::StoreUnavailable(cause) => {
                tracing::error!(total, error = %cause, "store unavailable; requeueing batch");
                match self.queue.requeue(&entries) {
                    Ok(()) => TickOutcome::Requeued {
                        total,
                        reason: cause.to_string(),
                    },
                    Err(err) => TickOutcome::RequeueFailed {
                        total,
                        reason: format!("{cause}; requeue failed: {err}"),
                    },
                }
            }
        };

        report(outcome)
    }

    /// Ticks until `shutdown` fires, its sender is dropped, or `max_ticks` is
    /// reached. Every tick recovers the in-flight journal before draining.
    pub fn run(&self, shutdown: &Receiver<()>) -> WorkerSummary {
        let mut summary = WorkerSummary::default();

        tracing::info!(
            queue = %self.queue.path().display(),
            poll_interval_ms = u64::try_from(self.config.poll_interval.as_millis()).unwrap_or(u64::MAX),
            "queue worker started"
        );

        loop {
            let report = self.tick();
            summary.record(&report);

            if self
                .config
                .max_ticks
                .is_some_and(|limit| summary.ticks >= limit)
            {
                break;
            }

            match shutdown.recv_timeout(self.config.poll_interval) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }
        }

        tracing::info!(
            ticks = summary.ticks,
            inserted = summary.inserted,
            requeued = summary.requeued,
            "queue worker stopped"
        );
        summary
    }

    fn persist(&self, entries: &[QueueEntry]) -> BatchResult {
        let mut session = match self.store.open_session() {
            Ok(session) => session,
            Err(err) => return BatchResult::StoreUnavailable(err),
        };

        let mut inserted = 0;
        let mut malformed = 0;
        for (index, entry) in entries.iter().enumerate() {
            let record = match entry.decode() {
                Ok(record) => record,
                Err(err) => {
                    tracing::warn!(index, error = %err, line = %entry.line(), "dropping malformed line");
                    malformed += 1;
                    continue;
                }
            };

            match session.insert(&record) {
                Ok(()) => inserted += 1,
                Err(err @ LedgerError::StoreUnavailable(_)) => {
                    return BatchResult::StoreUnavailable(err);
                }
                Err(err) => {
                    tracing::warn!(
                        index,
                        customer = %record.transaction.customer,
                        error = %err,
                        "store rejected record; dropping"
                    );
                    malformed += 1;
                }
            }
        }

        match session.commit() {
            Ok(()) => BatchResult::Committed {
                inserted,
                malformed,
            },
            Err(err) => BatchResult::StoreUnavailable(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fraud_ledger_core::{FraudLabel, QueuedRecord, Transaction};
    use std::collections::BTreeSet;
    use std::fs;
    use std::path::PathBuf;
    use std::sync::{Mutex, PoisonError};
    use std::time::Duration;

    #[derive(Default)]
    struct MemoryStore {
        rows: Arc<Mutex<Vec<QueuedRecord>>>,
        unreachable: bool,
        fail_commit: bool,
        reject_customers: BTreeSet<String>,
    }

    struct MemorySession {
        rows: Arc<Mutex<Vec<QueuedRecord>>>,
        pending: Vec<QueuedRecord>,
        fail_commit: bool,
        reject_customers: BTreeSet<String>,
    }

    impl StoreSession for MemorySession {
        fn insert(&mut self, record: &QueuedRecord) -> Result<(), LedgerError> {
            if self.reject_customers.contains(&record.transaction.customer) {
                return Err(LedgerError::MalformedRecord("constraint failed".to_string()));
            }
            self.pending.push(record.clone());
            Ok(())
        }

        fn commit(self) -> Result<(), LedgerError> {
            if self.fail_commit {
                return Err(LedgerError::StoreUnavailable("commit lost".to_string()));
            }
            self.rows
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .extend(self.pending);
            Ok(())
        }
    }

    impl TransactionStore for MemoryStore {
        type Session = MemorySession;

        fn open_session(&self) -> Result<Self::Session, LedgerError> {
            if self.unreachable {
                return Err(LedgerError::StoreUnavailable("connection refused".to_string()));
            }
            Ok(MemorySession {
                rows: Arc::clone(&self.rows),
                pending: Vec::new(),
                fail_commit: self.fail_commit,
                reject_customers: self.reject_customers.clone(),
            })
        }

        fn count_rows(&self) -> Result<u64, LedgerError> {
            let rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
            Ok(rows.len() as u64)
        }
    }

    fn must<T>(result: Result<T, LedgerError>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn unique_queue_path() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("fraud-ledger-worker-{}", Ulid::new()));
        if let Err(err) = fs::create_dir_all(&dir) {
            panic!("failed to create temp dir: {err}");
        }
        dir.join("queue.log")
    }

    fn record(customer: &str) -> QueuedRecord {
        QueuedRecord::new(
            Transaction {
                customer: customer.to_string(),
                step: 4,
                age: "3".to_string(),
                gender: "M".to_string(),
                zipcode_ori: "28007".to_string(),
                merchant: "M348934600".to_string(),
                zip_merchant: "28007".to_string(),
                category: "es_food".to_string(),
                amount: 12.75,
            },
            FraudLabel::Benign,
            None,
        )
    }

    /// Five lines with the third one corrupted.
    fn seed_five_with_one_malformed(path: &PathBuf) -> String {
        let mut body = String::new();
        for index in 1..=5 {
            if index == 3 {
                body.push_str("{\"customer\":\"C3\",\"step\":\n");
            } else {
                body.push_str(&must(record(&format!("C{index}")).to_line()));
                body.push('\n');
            }
        }
        if let Err(err) = fs::write(path, &body) {
            panic!("failed to seed queue: {err}");
        }
        body
    }

    fn worker(path: &PathBuf, store: MemoryStore) -> QueueWorker<MemoryStore> {
        QueueWorker::new(
            Arc::new(DurableQueue::new(path)),
            store,
            WorkerConfig {
                poll_interval: Duration::from_millis(10),
                max_ticks: None,
            },
        )
    }

    #[test]
    fn malformed_line_is_dropped_and_the_rest_commit() {
        let path = unique_queue_path();
        seed_five_with_one_malformed(&path);
        let worker = worker(&path, MemoryStore::default());

        let report = worker.tick();

        assert_eq!(
            report.outcome,
            TickOutcome::Committed {
                inserted: 4,
                total: 5,
                malformed: 1,
            }
        );
        assert_eq!(must(worker.store().count_rows()), 4);
        let status = must(worker.queue().status());
        assert_eq!(status.pending_entries, 0);
        assert_eq!(status.in_flight_entries, 0);
    }

    #[test]
    fn unreachable_store_requeues_every_line_verbatim() {
        let path = unique_queue_path();
        let body = seed_five_with_one_malformed(&path);
        let worker = worker(
            &path,
            MemoryStore {
                unreachable: true,
                ..MemoryStore::default()
            },
        );

        let report = worker.tick();

        assert!(matches!(report.outcome, TickOutcome::Requeued { total: 5, .. }));
        let requeued = match fs::read_to_string(&path) {
            Ok(body) => body,
            Err(err) => panic!("failed to read queue: {err}"),
        };
        assert_eq!(requeued, body);
        assert!(!worker.queue().in_flight_path().exists());
    }

    #[test]
    fn commit_failure_requeues_the_batch() {
        let path = unique_queue_path();
        let queue = DurableQueue::new(&path);
        must(queue.append(&record("C1")));
        must(queue.append(&record("C2")));
        let worker = worker(
            &path,
            MemoryStore {
                fail_commit: true,
                ..MemoryStore::default()
            },
        );

        let report = worker.tick();

        assert!(matches!(report.outcome, TickOutcome::Requeued { total: 2, .. }));
        assert_eq!(must(worker.store().count_rows()), 0);
        assert_eq!(must(worker.queue().status()).pending_entries, 2);
    }

    #[test]
    fn store_rejected_record_is_dropped_without_aborting_the_batch() {
        let path = unique_queue_path();
        let queue = DurableQueue::new(&path);
        for name in ["C1", "C2", "C3"] {
            must(queue.append(&record(name)));
        }
        let worker = worker(
            &path,
            MemoryStore {
                reject_customers: BTreeSet::from(["C2".to_string()]),
                ..MemoryStore::default()
            },
        );

        let report = worker.tick();

        assert_eq!(
            report.outcome,
            TickOutcome::Committed {
                inserted: 2,
                total: 3,
                malformed: 1,
            }
        );
    }

    #[test]
    fn empty_queue_is_idle() {
        let worker = worker(&unique_queue_path(), MemoryStore::default());
        assert_eq!(worker.tick().outcome, TickOutcome::Idle);
    }

    #[test]
    fn run_recovers_interrupted_batch_before_ticking() {
        let path = unique_queue_path();
        {
            let queue = DurableQueue::new(&path);
            must(queue.append(&record("C1")));
            must(queue.append(&record("C2")));
            assert_eq!(must(queue.drain_all()).len(), 2);
        }

        let worker = QueueWorker::new(
            Arc::new(DurableQueue::new(&path)),
            MemoryStore::default(),
            WorkerConfig {
                poll_interval: Duration::from_millis(10),
                max_ticks: Some(2),
            },
        );
        let (_sender, receiver) = std::sync::mpsc::channel();

        let summary = worker.run(&receiver);

        assert_eq!(summary.recovered_entries, 2);
        assert_eq!(summary.ticks, 2);
        assert_eq!(summary.inserted, 2);
        assert_eq!(must(worker.store().count_rows()), 2);
    }

    fn stored_customers(worker: &QueueWorker<MemoryStore>) -> Vec<String> {
        let mut names = worker
            .store()
            .rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|row| row.transaction.customer.clone())
            .collect::<Vec<_>>();
        names.sort();
        names
    }

    #[test]
    fn tick_after_interrupted_drain_persists_both_batches() {
        let path = unique_queue_path();
        {
            let queue = DurableQueue::new(&path);
            must(queue.append(&record("A")));
            assert_eq!(must(queue.drain_all()).len(), 1);
            must(queue.append(&record("B")));
        }
        let worker = worker(&path, MemoryStore::default());

        let report = worker.tick();

        assert_eq!(report.recovered_entries, 1);
        assert_eq!(
            report.outcome,
            TickOutcome::Committed {
                inserted: 2,
                total: 2,
                malformed: 0,
            }
        );
        assert_eq!(stored_customers(&worker), vec!["A", "B"]);
        let status = must(worker.queue().status());
        assert_eq!(status.pending_entries, 0);
        assert_eq!(status.in_flight_entries, 0);
    }

    #[test]
    fn unrecoverable_journal_blocks_the_drain_until_the_queue_is_writable() {
        let path = unique_queue_path();
        let queue = DurableQueue::new(&path);
        let journal_line = must(record("A").to_line());
        if let Err(err) = fs::write(queue.in_flight_path(), format!("{journal_line}\n")) {
            panic!("failed to seed journal: {err}");
        }
        if let Err(err) = fs::create_dir(&path) {
            panic!("failed to block queue path: {err}");
        }
        let worker = worker(&path, MemoryStore::default());

        let report = worker.tick();

        assert!(matches!(report.outcome, TickOutcome::DrainFailed { .. }));
        assert_eq!(report.recovered_entries, 0);
        match fs::read_to_string(worker.queue().in_flight_path()) {
            Ok(body) => assert_eq!(body.trim_end(), journal_line),
            Err(err) => panic!("journal was not preserved: {err}"),
        }
        assert!(stored_customers(&worker).is_empty());

        if let Err(err) = fs::remove_dir(&path) {
            panic!("failed to unblock queue path: {err}");
        }
        let report = worker.tick();

        assert_eq!(report.recovered_entries, 1);
        assert!(matches!(report.outcome, TickOutcome::Committed { inserted: 1, .. }));
        assert_eq!(stored_customers(&worker), vec!["A"]);
        assert!(!worker.queue().in_flight_path().exists());
    }

    #[test]
    fn run_stops_when_shutdown_sender_is_dropped() {
        let worker = worker(&unique_queue_path(), MemoryStore::default());
        let (sender, receiver) = std::sync::mpsc::channel::<()>();
        drop(sender);

        let summary = worker.run(&receiver);

        assert_eq!(summary.ticks, 1);
    }
}
