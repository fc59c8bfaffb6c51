use std::fs;
use std::path::Path;
use std::sync::Arc;

use fraud_ledger_core::{
    encode_features, format_rfc3339, now_utc, LedgerError, LinearModel, ModelSlot, QueuedRecord,
    Transaction,
};
use serde::Serialize;

use crate::queue::DurableQueue;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionReceipt {
    pub prediction: String,
    pub is_fraud: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fraud_probability: Option<f64>,
    pub queued: bool,
    pub status: String,
    pub model_name: String,
}

/// A classified transaction whose record has not been appended yet.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredTransaction {
    record: QueuedRecord,
    fraud_probability: Option<f64>,
    model_name: String,
}

impl ScoredTransaction {
    #[must_use]
    pub fn record(&self) -> &QueuedRecord {
        &self.record
    }

    /// Builds the caller-facing receipt from the outcome of the append.
    #[must_use]
    pub fn into_receipt(self, appended: Result<(), LedgerError>) -> PredictionReceipt {
        let (queued, status) = match appended {
            Ok(()) => (true, "Transaction queued for storage".to_string()),
            Err(err) => (false, format!("Failed to queue transaction: {err}")),
        };
        PredictionReceipt {
            prediction: self.record.fraud.as_str().to_string(),
            is_fraud: self.record.fraud.as_u8(),
            fraud_probability: self.fraud_probability,
            queued,
            status,
            model_name: self.model_name,
        }
    }
}

/// Scores transactions and hands the scored record to the queue. It never
/// talks to the store.
#[derive(Debug, Clone)]
pub struct PredictionGateway {
    model: Arc<ModelSlot>,
    queue: Arc<DurableQueue>,
}

impl PredictionGateway {
    #[must_use]
    pub fn new(model: Arc<ModelSlot>, queue: Arc<DurableQueue>) -> Self {
        Self { model, queue }
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.model.is_ready()
    }

    #[must_use]
    pub fn model_name(&self) -> Option<String> {
        self.model
            .classifier()
            .ok()
            .map(|classifier| classifier.model_name().to_string())
    }

    #[must_use]
    pub fn queue(&self) -> &DurableQueue {
        &self.queue
    }

    /// Validates and classifies the transaction and stamps `scored_at`.
    /// Touches neither the queue nor the store.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] for an invalid transaction and
    /// [`LedgerError::ModelUnavailable`] when no classifier is installed.
    pub fn classify(&self, transaction: Transaction) -> Result<ScoredTransaction, LedgerError> {
        transaction.validate()?;
        let classifier = self.model.classifier()?;
        let classification = classifier.classify(&encode_features(&transaction))?;

        let scored_at = match format_rfc3339(now_utc()) {
            Ok(value) => Some(value),
            Err(err) => {
                tracing::warn!(error = %err, "could not stamp scored_at");
                None
            }
        };

        Ok(ScoredTransaction {
            record: QueuedRecord::new(transaction, classification.label, scored_at),
            fraud_probability: classification.fraud_probability,
            model_name: classifier.model_name().to_string(),
        })
    }

    /// Appends a scored record to the queue, logging a failure.
    ///
    /// # Errors
    /// Returns [`LedgerError::QueueIo`] when the append fails.
    pub fn enqueue(&self, record: &QueuedRecord) -> Result<(), LedgerError> {
        self.queue.append(record).inspect_err(|err| {
            tracing::error!(
                customer = %record.transaction.customer,
                queue = %self.queue.path().display(),
                error = %err,
                "failed to queue scored transaction"
            );
        })
    }

    /// Classifies the transaction and appends the scored record. A failed
    /// append is reported through `queued = false`; the prediction is still
    /// returned.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] for an invalid transaction and
    /// [`LedgerError::ModelUnavailable`] when no classifier is installed.
    pub fn score(&self, transaction: Transaction) -> Result<PredictionReceipt, LedgerError> {
        let scored = self.classify(transaction)?;
        let appended = self.enqueue(scored.record());
        Ok(scored.into_receipt(appended))
    }
}

/// Reads and validates a JSON model artifact.
///
/// # Errors
/// Returns [`LedgerError::ModelUnavailable`] when the file cannot be read and
/// [`LedgerError::Configuration`] when its content is not a valid artifact.
pub fn load_linear_model(path: &Path) -> Result<LinearModel, LedgerError> {
    let raw = fs::read_to_string(path).map_err(|err| {
        LedgerError::ModelUnavailable(format!("failed to read model {}: {err}", path.display()))
    })?;
    let value: serde_json::Value = serde_json::from_str(&raw).map_err(|err| {
        LedgerError::Configuration(format!("model {} is not JSON: {err}", path.display()))
    })?;
    LinearModel::from_json(&value)
}
