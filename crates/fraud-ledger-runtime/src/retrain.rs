use fraud_ledger_core::{Trainer, TrainingOutcome, TransactionStore};
use serde::Serialize;

use crate::config::RetrainConfig;
use crate::watermark::WatermarkStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RetrainOutcome {
    Skipped {
        current_row_count: u64,
        watermark: u64,
        delta: i64,
        threshold: u64,
    },
    Retrained {
        previous_watermark: u64,
        watermark: u64,
        delta: i64,
    },
    TrainingFailed {
        watermark: u64,
        delta: i64,
        reason: String,
    },
    /// Training succeeded but the new watermark could not be persisted; the
    /// next evaluation trains again.
    WatermarkNotAdvanced {
        watermark: u64,
        observed_row_count: u64,
        reason: String,
    },
    CountUnavailable {
        reason: String,
    },
}

impl RetrainOutcome {
    #[must_use]
    pub fn trained(&self) -> bool {
        matches!(
            self,
            Self::Retrained { .. } | Self::WatermarkNotAdvanced { .. }
        )
    }
}

/// One retraining decision per invocation; scheduling is left to the caller.
#[derive(Debug, Clone)]
pub struct RetrainOrchestrator {
    watermark: WatermarkStore,
}

impl RetrainOrchestrator {
    #[must_use]
    pub fn new(watermark: WatermarkStore) -> Self {
        Self { watermark }
    }

    #[must_use]
    pub fn watermark(&self) -> &WatermarkStore {
        &self.watermark
    }

    /// Trains when `current_row_count - watermark >= threshold` and advances the
    /// watermark to `current_row_count`, the count observed before training.
    pub fn evaluate_and_maybe_retrain<T>(
        &self,
        current_row_count: u64,
        threshold: u64,
        trainer: &T,
    ) -> RetrainOutcome
    where
        T: Trainer + ?Sized,
    {
        let last = self.watermark.read();
        let delta = signed_delta(current_row_count, last);

        tracing::info!(
            current_row_count,
            watermark = last,
            delta,
            threshold,
            "evaluating retraining trigger"
        );

        if delta < to_i64(threshold) {
            tracing::info!(delta, threshold, "retraining not needed");
            return RetrainOutcome::Skipped {
                current_row_count,
                watermark: last,
                delta,
                threshold,
            };
        }

        tracing::info!(trainer = trainer.trainer_name(), delta, "threshold met; training");
        let reason = match trainer.train() {
            Ok(TrainingOutcome::Succeeded) => {
                return self.advance(last, current_row_count, delta);
            }
            Ok(TrainingOutcome::Failed { reason }) => reason,
            Err(err) => err.to_string(),
        };

        tracing::error!(
            trainer = trainer.trainer_name(),
            watermark = last,
            reason = %reason,
            "training failed; watermark unchanged"
        );
        RetrainOutcome::TrainingFailed {
            watermark: last,
            delta,
            reason,
        }
    }

    /// Reads the live row count from `store`, then evaluates. A failed count
    /// skips the cycle rather than comparing against zero.
    pub fn run_cycle<S, T>(&self, store: &S, config: RetrainConfig, trainer: &T) -> RetrainOutcome
    where
        S: TransactionStore + ?Sized,
        T: Trainer + ?Sized,
    {
        match store.count_rows() {
            Ok(count) => self.evaluate_and_maybe_retrain(count, config.threshold, trainer),
            Err(err) => {
                tracing::error!(error = %err, "could not read store row count; skipping");
                RetrainOutcome::CountUnavailable {
                    reason: err.to_string(),
                }
            }
        }
    }

    fn advance(&self, previous: u64, observed: u64, delta: i64) -> RetrainOutcome {
        match self.watermark.write(observed) {
            Ok(()) => {
                tracing::info!(previous, watermark = observed, "watermark advanced");
                RetrainOutcome::Retrained {
                    previous_watermark: previous,
                    watermark: observed,
                    delta,
                }
            }
            Err(err) => {
                tracing::error!(
                    previous,
                    observed,
                    error = %err,
                    "training succeeded but watermark write failed"
                );
                RetrainOutcome::WatermarkNotAdvanced {
                    watermark: previous,
                    observed_row_count: observed,
                    reason: err.to_string(),
                }
            }
        }
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn signed_delta(current: u64, last: u64) -> i64 {
    to_i64(current).saturating_sub(to_i64(last))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fraud_ledger_core::{LedgerError, QueuedRecord, StoreSession};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::sync::Arc;
    use ulid::Ulid;

    struct ScriptedTrainer {
        outcome: Result<TrainingOutcome, LedgerError>,
        calls: AtomicUsize,
        rows_added_during_training: Option<(Arc<AtomicU64>, u64)>,
    }

    impl ScriptedTrainer {
        fn new(outcome: Result<TrainingOutcome, LedgerError>) -> Self {
            Self {
                outcome,
                calls: AtomicUsize::new(0),
                rows_added_during_training: None,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Trainer for ScriptedTrainer {
        fn trainer_name(&self) -> &str {
            "scripted"
        }

        fn train(&self) -> Result<TrainingOutcome, LedgerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some((rows, added)) = &self.rows_added_during_training {
                rows.fetch_add(*added, Ordering::SeqCst);
            }
            self.outcome.clone()
        }
    }

    struct CountingStore {
        rows: Arc<AtomicU64>,
        reachable: bool,
    }

    struct NoSession;

    impl StoreSession for NoSession {
        fn insert(&mut self, _record: &QueuedRecord) -> Result<(), LedgerError> {
            Ok(())
        }

        fn commit(self) -> Result<(), LedgerError> {
            Ok(())
        }
    }

    impl TransactionStore for CountingStore {
        type Session = NoSession;

        fn open_session(&self) -> Result<Self::Session, LedgerError> {
            Ok(NoSession)
        }

        fn count_rows(&self) -> Result<u64, LedgerError> {
            if self.reachable {
                Ok(self.rows.load(Ordering::SeqCst))
            } else {
                Err(LedgerError::StoreUnavailable("connection refused".to_string()))
            }
        }
    }

    fn orchestrator_at(watermark: Option<u64>) -> (RetrainOrchestrator, PathBuf) {
        let path =
            std::env::temp_dir().join(format!("fraud-ledger-retrain-{}.txt", Ulid::new()));
        let store = WatermarkStore::new(&path);
        if let Some(value) = watermark {
            if let Err(err) = store.write(value) {
                panic!("failed to seed watermark: {err}");
            }
        }
        (RetrainOrchestrator::new(store), path)
    }

    #[test]
    fn delta_at_or_above_threshold_trains_and_advances() {
        let (orchestrator, _) = orchestrator_at(Some(500));
        let trainer = ScriptedTrainer::new(Ok(TrainingOutcome::Succeeded));

        let outcome = orchestrator.evaluate_and_maybe_retrain(1600, 1000, &trainer);

        assert_eq!(
            outcome,
            RetrainOutcome::Retrained {
                previous_watermark: 500,
                watermark: 1600,
                delta: 1100,
            }
        );
        assert_eq!(trainer.calls(), 1);
        assert_eq!(orchestrator.watermark().read(), 1600);
    }

    #[test]
    fn delta_exactly_at_threshold_trains() {
        let (orchestrator, _) = orchestrator_at(Some(500));
        let trainer = ScriptedTrainer::new(Ok(TrainingOutcome::Succeeded));
        assert!(orchestrator
            .evaluate_and_maybe_retrain(1500, 1000, &trainer)
            .trained());
    }

    #[test]
    fn delta_below_threshold_skips_training() {
        let (orchestrator, _) = orchestrator_at(Some(500));
        let trainer = ScriptedTrainer::new(Ok(TrainingOutcome::Succeeded));

        let outcome = orchestrator.evaluate_and_maybe_retrain(1200, 1000, &trainer);

        assert!(matches!(outcome, RetrainOutcome::Skipped { delta: 700, .. }));
        assert_eq!(trainer.calls(), 0);
        assert_eq!(orchestrator.watermark().read(), 500);
    }

    #[test]
    fn negative_delta_is_not_an_error() {
        let (orchestrator, _) = orchestrator_at(Some(5000));
        let trainer = ScriptedTrainer::new(Ok(TrainingOutcome::Succeeded));

        let outcome = orchestrator.evaluate_and_maybe_retrain(1200, 1000, &trainer);

        assert!(matches!(outcome, RetrainOutcome::Skipped { delta: -3800, .. }));
        assert_eq!(orchestrator.watermark().read(), 5000);
    }

    #[test]
    fn failed_training_keeps_watermark_and_retries_next_time() {
        let (orchestrator, _) = orchestrator_at(Some(500));
        let trainer = ScriptedTrainer::new(Ok(TrainingOutcome::Failed {
            reason: "not enough fraud samples".to_string(),
        }));

        let first = orchestrator.evaluate_and_maybe_retrain(1600, 1000, &trainer);
        assert!(matches!(first, RetrainOutcome::TrainingFailed { watermark: 500, .. }));
        assert_eq!(orchestrator.watermark().read(), 500);

        let second = orchestrator.evaluate_and_maybe_retrain(1600, 1000, &trainer);
        assert!(matches!(second, RetrainOutcome::TrainingFailed { .. }));
        assert_eq!(trainer.calls(), 2);
        assert_eq!(orchestrator.watermark().read(), 500);
    }

    #[test]
    fn trainer_error_is_treated_as_failure() {
        let (orchestrator, _) = orchestrator_at(None);
        let trainer = ScriptedTrainer::new(Err(LedgerError::TrainingFailed(
            "trainer crashed".to_string(),
        )));

        let outcome = orchestrator.evaluate_and_maybe_retrain(2000, 1000, &trainer);

        assert!(matches!(outcome, RetrainOutcome::TrainingFailed { watermark: 0, .. }));
        assert_eq!(orchestrator.watermark().read(), 0);
    }

    #[test]
    fn watermark_uses_count_observed_before_training() {
        let (orchestrator, _) = orchestrator_at(Some(500));
        let rows = Arc::new(AtomicU64::new(1600));
        let store = CountingStore {
            rows: Arc::clone(&rows),
            reachable: true,
        };
        let mut trainer = ScriptedTrainer::new(Ok(TrainingOutcome::Succeeded));
        trainer.rows_added_during_training = Some((Arc::clone(&rows), 250));

        let outcome = orchestrator.run_cycle(&store, RetrainConfig { threshold: 1000 }, &trainer);

        assert!(outcome.trained());
        assert_eq!(rows.load(Ordering::SeqCst), 1850);
        assert_eq!(orchestrator.watermark().read(), 1600);
    }

    #[test]
    fn unreachable_store_skips_the_cycle() {
        let (orchestrator, _) = orchestrator_at(Some(500));
        let store = CountingStore {
            rows: Arc::new(AtomicU64::new(10_000)),
            reachable: false,
        };
        let trainer = ScriptedTrainer::new(Ok(TrainingOutcome::Succeeded));

        let outcome = orchestrator.run_cycle(&store, RetrainConfig::default(), &trainer);

        assert!(matches!(outcome, RetrainOutcome::CountUnavailable { .. }));
        assert_eq!(trainer.calls(), 0);
        assert_eq!(orchestrator.watermark().read(), 500);
    }

    #[test]
    fn unwritable_watermark_reports_not_advanced() {
        let path = std::env::temp_dir()
            .join(format!("fraud-ledger-missing-{}", Ulid::new()))
            .join("watermark.txt");
        let orchestrator = RetrainOrchestrator::new(WatermarkStore::new(path));
        let trainer = ScriptedTrainer::new(Ok(TrainingOutcome::Succeeded));

        let outcome = orchestrator.evaluate_and_maybe_retrain(1500, 1000, &trainer);

        assert!(matches!(
            outcome,
            RetrainOutcome::WatermarkNotAdvanced {
                watermark: 0,
                observed_row_count: 1500,
                ..
            }
        ));
    }
}
