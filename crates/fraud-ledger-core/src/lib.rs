use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{OffsetDateTime, UtcOffset};

pub const FEATURE_SCHEMA_VERSION: &str = "fraud-features.v1";

const AGE_LEVELS: [&str; 8] = ["0", "1", "2", "3", "4", "5", "6", "U"];
const GENDER_LEVELS: [&str; 4] = ["E", "F", "M", "U"];

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum LedgerError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("malformed record: {0}")]
    MalformedRecord(String),
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("queue i/o failure: {0}")]
    QueueIo(String),
    #[error("watermark i/o failure: {0}")]
    WatermarkIo(String),
    #[error("training failed: {0}")]
    TrainingFailed(String),
    #[error("model unavailable: {0}")]
    ModelUnavailable(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "u8", into = "u8")]
pub enum FraudLabel {
    Benign,
    Fraudulent,
}

impl FraudLabel {
    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Benign => 0,
            Self::Fraudulent => 1,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Benign => "Benign",
            Self::Fraudulent => "Fraudulent",
        }
    }
}

impl TryFrom<u8> for FraudLabel {
    type Error = LedgerError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Benign),
            1 => Ok(Self::Fraudulent),
            other => Err(LedgerError::MalformedRecord(format!(
                "fraud label MUST be 0 or 1, got {other}"
            ))),
        }
    }
}

impl From<FraudLabel> for u8 {
    fn from(value: FraudLabel) -> Self {
        value.as_u8()
    }
}

impl Display for FraudLabel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A transaction as submitted for scoring. Field names on the wire follow the
/// transaction table columns.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Transaction {
    pub customer: String,
    pub step: i64,
    pub age: String,
    pub gender: String,
    #[serde(rename = "zipcodeOri")]
    pub zipcode_ori: String,
    pub merchant: String,
    #[serde(rename = "zipMerchant")]
    pub zip_merchant: String,
    pub category: String,
    pub amount: f64,
}

impl Transaction {
    /// Validates a transaction before it is scored or persisted.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] when a required field is empty or a
    /// numeric field is out of range.
    pub fn validate(&self) -> Result<(), LedgerError> {
        for (name, value) in [
            ("customer", &self.customer),
            ("age", &self.age),
            ("gender", &self.gender),
            ("merchant", &self.merchant),
            ("category", &self.category),
        ] {
            if value.trim().is_empty() {
                return Err(LedgerError::Validation(format!(
                    "{name} MUST be provided"
                )));
            }
        }

        if self.step < 0 {
            return Err(LedgerError::Validation("step MUST be >= 0".to_string()));
        }

        if !self.amount.is_finite() || self.amount < 0.0 {
            return Err(LedgerError::Validation(
                "amount MUST be a finite, non-negative number".to_string(),
            ));
        }

        Ok(())
    }
}

/// One scored transaction awaiting durable persistence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueuedRecord {
    #[serde(flatten)]
    pub transaction: Transaction,
    pub fraud: FraudLabel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scored_at: Option<String>,
}

impl QueuedRecord {
    #[must_use]
    pub fn new(transaction: Transaction, fraud: FraudLabel, scored_at: Option<String>) -> Self {
        Self {
            transaction,
            fraud,
            scored_at,
        }
    }

    /// Serializes the record as a single queue line without a trailing newline.
    ///
    /// # Errors
    /// Returns [`LedgerError::MalformedRecord`] when serialization fails.
    pub fn to_line(&self) -> Result<String, LedgerError> {
        serde_json::to_string(self)
            .map_err(|err| LedgerError::MalformedRecord(format!("failed to encode record: {err}")))
    }

    /// Decodes and validates one queue line.
    ///
    /// # Errors
    /// Returns [`LedgerError::MalformedRecord`] when the line is not a JSON
    /// object with every transaction field, when a field fails validation, or
    /// when `scored_at` is present but not a UTC RFC3339 timestamp.
    pub fn from_line(line: &str) -> Result<Self, LedgerError> {
        let record: Self = serde_json::from_str(line.trim())
            .map_err(|err| LedgerError::MalformedRecord(format!("invalid queue line: {err}")))?;
        record
            .transaction
            .validate()
            .map_err(|err| LedgerError::MalformedRecord(err.to_string()))?;
        if let Some(scored_at) = record.scored_at.as_deref() {
            parse_rfc3339_utc(scored_at).map_err(|err| {
                LedgerError::MalformedRecord(format!("invalid scored_at: {err}"))
            })?;
        }
        Ok(record)
    }
}

/// Encoded feature values keyed by column name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureVector {
    values: BTreeMap<String, f64>,
}

impl FeatureVector {
    #[must_use]
    pub fn get(&self, column: &str) -> f64 {
        self.values.get(column).copied().unwrap_or(0.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.values.iter().map(|(name, value)| (name.as_str(), *value))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Columns of the `fraud-features.v1` schema, in artifact order.
#[must_use]
pub fn expected_columns() -> Vec<String> {
    let mut columns = vec!["step".to_string(), "amount".to_string()];
    columns.extend(
        AGE_LEVELS
            .iter()
            .skip(1)
            .map(|level| format!("age_{level}")),
    );
    columns.extend(
        GENDER_LEVELS
            .iter()
            .skip(1)
            .map(|level| format!("gender_{level}")),
    );
    columns
}

/// One-hot encodes a transaction. The first level of each categorical field
/// is the reference level and produces no column; unknown levels encode as
/// the reference level.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn encode_features(transaction: &Transaction) -> FeatureVector {
    let mut values = BTreeMap::new();
    for column in expected_columns() {
        values.insert(column, 0.0);
    }

    values.insert("step".to_string(), transaction.step as f64);
    values.insert("amount".to_string(), transaction.amount);

    let age = normalize_level(&transaction.age);
    if AGE_LEVELS.iter().skip(1).any(|level| *level == age) {
        values.insert(format!("age_{age}"), 1.0);
    }

    let gender = normalize_level(&transaction.gender);
    if GENDER_LEVELS.iter().skip(1).any(|level| *level == gender) {
        values.insert(format!("gender_{gender}"), 1.0);
    }

    FeatureVector { values }
}

fn normalize_level(raw: &str) -> String {
    raw.trim().trim_matches('\'').to_ascii_uppercase()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Classification {
    pub label: FraudLabel,
    pub fraud_probability: Option<f64>,
}

pub trait Classifier {
    fn model_name(&self) -> &str;

    #[allow(clippy::missing_errors_doc)]
    fn classify(&self, features: &FeatureVector) -> Result<Classification, LedgerError>;
}

/// Logistic model persisted as a JSON artifact by the training routine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LinearModel {
    pub schema_version: String,
    pub model_name: String,
    pub bias: f64,
    pub weights: BTreeMap<String, f64>,
    pub decision_threshold: f64,
}

impl LinearModel {
    /// Validates the artifact against the feature schema.
    ///
    /// # Errors
    /// Returns [`LedgerError::Configuration`] when the schema version does not
    /// match, a weight names an unknown column, or a number is out of range.
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.schema_version != FEATURE_SCHEMA_VERSION {
            return Err(LedgerError::Configuration(format!(
                "model schema_version {} does not match {FEATURE_SCHEMA_VERSION}",
                self.schema_version
            )));
        }

        if !(self.decision_threshold > 0.0 && self.decision_threshold < 1.0) {
            return Err(LedgerError::Configuration(
                "decision_threshold MUST be in (0.0, 1.0)".to_string(),
            ));
        }

        if !self.bias.is_finite() {
            return Err(LedgerError::Configuration("bias MUST be finite".to_string()));
        }

        let columns = expected_columns();
        for (name, weight) in &self.weights {
            if !columns.iter().any(|column| column == name) {
                return Err(LedgerError::Configuration(format!(
                    "weight references unknown feature column {name}"
                )));
            }
            if !weight.is_finite() {
                return Err(LedgerError::Configuration(format!(
                    "weight for {name} MUST be finite"
                )));
            }
        }

        Ok(())
    }

    /// Decodes and validates a model artifact from JSON.
    ///
    /// # Errors
    /// Returns [`LedgerError::Configuration`] when decoding fails or the
    /// decoded artifact is invalid.
    pub fn from_json(value: &Value) -> Result<Self, LedgerError> {
        let model: Self = serde_json::from_value(value.clone()).map_err(|err| {
            LedgerError::Configuration(format!("invalid model artifact JSON payload: {err}"))
        })?;
        model.validate()?;
        Ok(model)
    }

    #[must_use]
    pub fn fraud_probability(&self, features: &FeatureVector) -> f64 {
        let logit = self
            .weights
            .iter()
            .fold(self.bias, |acc, (column, weight)| acc + weight * features.get(column));
        1.0 / (1.0 + (-logit).exp())
    }
}

impl Classifier for LinearModel {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn classify(&self, features: &FeatureVector) -> Result<Classification, LedgerError> {
        let probability = self.fraud_probability(features);
        if !probability.is_finite() {
            return Err(LedgerError::Validation(
                "model produced a non-finite probability".to_string(),
            ));
        }

        let label = if probability >= self.decision_threshold {
            FraudLabel::Fraudulent
        } else {
            FraudLabel::Benign
        };

        Ok(Classification {
            label,
            fraud_probability: Some(probability),
        })
    }
}

pub type SharedClassifier = Arc<dyn Classifier + Send + Sync>;

/// Holds the active classifier. Installed at most once; readers check
/// readiness instead of loading lazily.
#[derive(Default)]
pub struct ModelSlot {
    inner: OnceLock<SharedClassifier>,
}

impl ModelSlot {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the classifier.
    ///
    /// # Errors
    /// Returns [`LedgerError::Configuration`] when a classifier is already
    /// installed.
    pub fn install(&self, classifier: SharedClassifier) -> Result<(), LedgerError> {
        self.inner.set(classifier).map_err(|_| {
            LedgerError::Configuration("classifier is already installed".to_string())
        })
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.inner.get().is_some()
    }

    /// Returns the installed classifier.
    ///
    /// # Errors
    /// Returns [`LedgerError::ModelUnavailable`] before installation.
    pub fn classifier(&self) -> Result<&SharedClassifier, LedgerError> {
        self.inner.get().ok_or_else(|| {
            LedgerError::ModelUnavailable("classifier has not been loaded".to_string())
        })
    }
}

impl std::fmt::Debug for ModelSlot {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelSlot")
            .field("ready", &self.is_ready())
            .finish()
    }
}

/// The relational store boundary. Opening a session is the connectivity
/// check: failure there means the whole batch must be returned to the queue.
pub trait TransactionStore {
    type Session: StoreSession;

    /// Opens a connection with an open transaction scope.
    ///
    /// # Errors
    /// Returns [`LedgerError::StoreUnavailable`] when the store cannot be
    /// reached.
    fn open_session(&self) -> Result<Self::Session, LedgerError>;

    /// Equivalent of `COUNT(*)` over the transaction table.
    ///
    /// # Errors
    /// Returns [`LedgerError::StoreUnavailable`] when the count cannot be read.
    fn count_rows(&self) -> Result<u64, LedgerError>;
}

pub trait StoreSession {
    /// Inserts one record inside the open scope.
    ///
    /// # Errors
    /// Returns [`LedgerError::MalformedRecord`] when the store rejects the row.
    fn insert(&mut self, record: &QueuedRecord) -> Result<(), LedgerError>;

    /// Commits every successful insert of the session.
    ///
    /// # Errors
    /// Returns [`LedgerError::StoreUnavailable`] when the commit fails; no
    /// row of the session is persisted in that case.
    fn commit(self) -> Result<(), LedgerError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TrainingOutcome {
    Succeeded,
    Failed { reason: String },
}

/// A blocking training routine. It re-reads the full store and overwrites
/// the persisted model artifact when it succeeds.
pub trait Trainer {
    fn trainer_name(&self) -> &str;

    /// Runs one training pass.
    ///
    /// # Errors
    /// Returns [`LedgerError::TrainingFailed`] when the routine could not be
    /// run at all.
    fn train(&self) -> Result<TrainingOutcome, LedgerError>;
}

/// Parses an RFC3339 timestamp and requires a UTC offset.
///
/// # Errors
/// Returns [`LedgerError::Validation`] for unparsable or non-UTC timestamps.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, LedgerError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| LedgerError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(LedgerError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`LedgerError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, LedgerError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| LedgerError::Validation(format!("failed to format RFC3339 timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
