use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use fraud_ledger_core::{LedgerError, ModelSlot, Transaction, FEATURE_SCHEMA_VERSION};
use fraud_ledger_runtime::config::{
    DEFAULT_DATABASE_PATH, DEFAULT_MODEL_PATH, DEFAULT_POLL_INTERVAL_MS, DEFAULT_QUEUE_PATH,
};
use fraud_ledger_runtime::logging::{self, LogFormat};
use fraud_ledger_runtime::{
    load_linear_model, DurableQueue, PredictionGateway, PredictionReceipt, QueueWorker,
    ScoredTransaction, WorkerConfig, WorkerSummary,
};
use fraud_ledger_store_sqlite::SqliteTransactionStore;
use serde::Serialize;
use serde_json::json;
use tokio::task::JoinHandle;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");

#[derive(Debug, Clone)]
struct ServiceState {
    gateway: PredictionGateway,
    operation_timeout: Duration,
    embedded_worker: bool,
    telemetry: Arc<ServiceTelemetry>,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    feature_schema_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    service_contract_version: &'static str,
    error: ServiceErrorPayload,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceErrorPayload {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
struct ServiceFailure {
    status: StatusCode,
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    timeout_ms: u64,
    model_ready: bool,
    embedded_worker: bool,
    telemetry: ServiceTelemetrySnapshot,
}

#[derive(Debug, Default)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetry {
    requests_total: AtomicU64,
    requests_success_total: AtomicU64,
    requests_failure_total: AtomicU64,
    timeout_total: AtomicU64,
    invalid_json_total: AtomicU64,
    validation_error_total: AtomicU64,
    model_unavailable_total: AtomicU64,
    queue_unavailable_total: AtomicU64,
    internal_error_total: AtomicU64,
    other_error_total: AtomicU64,
    predictions_fraudulent_total: AtomicU64,
    predictions_not_queued_total: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetrySnapshot {
    requests_total: u64,
    requests_success_total: u64,
    requests_failure_total: u64,
    timeout_total: u64,
    invalid_json_total: u64,
    validation_error_total: u64,
    model_unavailable_total: u64,
    queue_unavailable_total: u64,
    internal_error_total: u64,
    other_error_total: u64,
    predictions_fraudulent_total: u64,
    predictions_not_queued_total: u64,
}

#[derive(Debug, Clone, Serialize)]
struct ReadinessChecks {
    model_ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    model_name: Option<String>,
    queue_writable: bool,
    pending_entries: usize,
    in_flight_entries: usize,
}

#[derive(Debug, Clone, Serialize)]
struct ReadinessResponse {
    status: &'static str,
    checks: ReadinessChecks,
}

#[derive(Debug, Parser)]
#[command(name = "fraud-ledger-service")]
#[command(about = "Local HTTP prediction service for the fraud ledger")]
struct Args {
    #[arg(long, env = "FRAUD_LEDGER_QUEUE", default_value = DEFAULT_QUEUE_PATH)]
    queue: PathBuf,
    #[arg(long, env = "FRAUD_LEDGER_MODEL", default_value = DEFAULT_MODEL_PATH)]
    model: PathBuf,
    #[arg(long, env = "FRAUD_LEDGER_DB", default_value = DEFAULT_DATABASE_PATH)]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    #[arg(long, default_value_t = 2500)]
    operation_timeout_ms: u64,
    /// Run the queue worker inside this process.
    #[arg(long)]
    embedded_worker: bool,
    #[arg(long, env = "FRAUD_LEDGER_POLL_INTERVAL_MS", default_value_t = DEFAULT_POLL_INTERVAL_MS)]
    poll_interval_ms: u64,
    #[arg(long, env = "FRAUD_LEDGER_LOG_FORMAT", default_value = "compact")]
    log_format: LogFormat,
    #[arg(long, default_value = "info")]
    log_filter: String,
}

struct EmbeddedWorker {
    shutdown: Sender<()>,
    handle: JoinHandle<WorkerSummary>,
}

impl EmbeddedWorker {
    async fn stop(self) -> Result<WorkerSummary> {
        let _ = self.shutdown.send(());
        self.handle.await.context("embedded worker panicked")
    }
}

impl IntoResponse for ServiceFailure {
    fn into_response(self) -> Response {
        let payload = ServiceError {
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: ServiceErrorPayload {
                code: self.code,
                message: self.message.clone(),
                details: self.details,
            },
        };
        (self.status, Json(payload)).into_response()
    }
}

impl ServiceState {
    fn failure(
        status: StatusCode,
        code: &'static str,
        message: impl Into<String>,
        details: Option<serde_json::Value>,
    ) -> ServiceFailure {
        ServiceFailure { status, code, message: message.into(), details }
    }

    fn invalid_json(rejection: &JsonRejection) -> ServiceFailure {
        Self::failure(
            rejection.status(),
            "invalid_json",
            rejection.body_text(),
            Some(json!({"rejection": rejection.to_string()})),
        )
    }

    fn invalid_json_with_telemetry(&self, rejection: &JsonRejection) -> ServiceFailure {
        self.telemetry.record_failure("invalid_json", false);
        Self::invalid_json(rejection)
    }

    fn classify_ledger_error(
        err: &LedgerError,
        default_status: StatusCode,
        default_code: &'static str,
    ) -> ServiceFailure {
        let message = err.to_string();
        match err {
            LedgerError::Validation(_) | LedgerError::MalformedRecord(_) => {
                Self::failure(StatusCode::BAD_REQUEST, "validation_error", message, None)
            }
            LedgerError::ModelUnavailable(_) => Self::failure(
                StatusCode::SERVICE_UNAVAILABLE,
                "model_unavailable",
                message,
                None,
            ),
            LedgerError::QueueIo(_) => Self::failure(
                StatusCode::SERVICE_UNAVAILABLE,
                "queue_unavailable",
                message,
                None,
            ),
            _ => Self::failure(default_status, default_code, message, None),
        }
    }

    async fn run_blocking<T, F>(
        &self,
        default_status: StatusCode,
        default_code: &'static str,
        operation_label: &'static str,
        op: F,
    ) -> Result<T, ServiceFailure>
    where
        T: Send + 'static,
        F: FnOnce(PredictionGateway) -> Result<T, LedgerError> + Send + 'static,
    {
        self.telemetry.requests_total.fetch_add(1, Ordering::Relaxed);
        let gateway = self.gateway.clone();
        let handle = tokio::task::spawn_blocking(move || op(gateway));
        let join_result =
            tokio::time::timeout(self.operation_timeout, handle).await.map_err(|_| {
                self.telemetry.record_failure(default_code, true);
                tracing::warn!(
                    operation = operation_label,
                    timeout_ms = u64::try_from(self.operation_timeout.as_millis()).unwrap_or(u64::MAX),
                    "blocking operation timed out"
                );
                Self::failure(
                    default_status,
                    default_code,
                    format!(
                        "{operation_label} timed out after {} ms",
                        self.operation_timeout.as_millis()
                    ),
                    Some(json!({ "timeout_ms": self.operation_timeout.as_millis() })),
                )
            })?;

        let op_result = join_result.map_err(|err| {
            self.telemetry.record_failure("internal_error", false);
            Self::failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                format!("{operation_label} join failure: {err}"),
                None,
            )
        })?;

        match op_result {
            Ok(value) => {
                self.telemetry.requests_success_total.fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
            Err(err) => {
                let failure = Self::classify_ledger_error(&err, default_status, default_code);
                self.telemetry.record_failure(failure.code, false);
                Err(failure)
            }
        }
    }

    /// Appends the scored record under the operation timeout. The receipt is
    /// always returned; a timed out or failed append yields `queued = false`.
    /// An append that outlives the timeout keeps running and is logged when it
    /// finishes.
    async fn enqueue_with_timeout(&self, scored: ScoredTransaction) -> PredictionReceipt {
        let gateway = self.gateway.clone();
        let record = scored.record().clone();
        let abandoned = Arc::new(AtomicBool::new(false));
        let abandoned_in_task = Arc::clone(&abandoned);

        let handle = tokio::task::spawn_blocking(move || {
            let appended = gateway.enqueue(&record);
            if appended.is_ok() && abandoned_in_task.load(Ordering::SeqCst) {
                tracing::warn!(
                    customer = %record.transaction.customer,
                    "queue append completed after the request timed out; record is queued"
                );
            }
            appended
        });

        let appended = match tokio::time::timeout(self.operation_timeout, handle).await {
            Ok(Ok(appended)) => appended,
            Ok(Err(err)) => {
                self.telemetry.internal_error_total.fetch_add(1, Ordering::Relaxed);
                Err(LedgerError::QueueIo(format!("queue append task failed: {err}")))
            }
            Err(_) => {
                abandoned.store(true, Ordering::SeqCst);
                self.telemetry.timeout_total.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(timeout_ms = self.timeout_ms(), "queue append timed out");
                Err(LedgerError::QueueIo(format!(
                    "append timed out after {} ms",
                    self.timeout_ms()
                )))
            }
        };
        scored.into_receipt(appended)
    }

    fn timeout_ms(&self) -> u64 {
        u64::try_from(self.operation_timeout.as_millis()).unwrap_or(u64::MAX)
    }
}

impl ServiceTelemetry {
    fn record_failure(&self, code: &str, timeout: bool) {
        self.requests_failure_total.fetch_add(1, Ordering::Relaxed);
        if timeout {
            self.timeout_total.fetch_add(1, Ordering::Relaxed);
        }
        match code {
            "invalid_json" => {
                self.invalid_json_total.fetch_add(1, Ordering::Relaxed);
            }
            "validation_error" => {
                self.validation_error_total.fetch_add(1, Ordering::Relaxed);
            }
            "model_unavailable" => {
                self.model_unavailable_total.fetch_add(1, Ordering::Relaxed);
            }
            "queue_unavailable" => {
                self.queue_unavailable_total.fetch_add(1, Ordering::Relaxed);
            }
            "internal_error" => {
                self.internal_error_total.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                self.other_error_total.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn record_prediction(&self, receipt: &PredictionReceipt) {
        if receipt.is_fraud == 1 {
            self.predictions_fraudulent_total.fetch_add(1, Ordering::Relaxed);
        }
        if !receipt.queued {
            self.predictions_not_queued_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn snapshot(&self) -> ServiceTelemetrySnapshot {
        ServiceTelemetrySnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_success_total: self.requests_success_total.load(Ordering::Relaxed),
            requests_failure_total: self.requests_failure_total.load(Ordering::Relaxed),
            timeout_total: self.timeout_total.load(Ordering::Relaxed),
            invalid_json_total: self.invalid_json_total.load(Ordering::Relaxed),
            validation_error_total: self.validation_error_total.load(Ordering::Relaxed),
            model_unavailable_total: self.model_unavailable_total.load(Ordering::Relaxed),
            queue_unavailable_total: self.queue_unavailable_total.load(Ordering::Relaxed),
            internal_error_total: self.internal_error_total.load(Ordering::Relaxed),
            other_error_total: self.other_error_total.load(Ordering::Relaxed),
            predictions_fraudulent_total: self
                .predictions_fraudulent_total
                .load(Ordering::Relaxed),
            predictions_not_queued_total: self
                .predictions_not_queued_total
                .load(Ordering::Relaxed),
        }
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        feature_schema_version: FEATURE_SCHEMA_VERSION,
        data,
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/ready", get(ready))
        .route("/v1/openapi", get(openapi))
        .route("/v1/predict", post(predict))
        .with_state(state)
}

/// Loads the classifier once at startup. A missing or invalid artifact leaves
/// the slot empty and the service unready rather than failing startup.
fn load_model_slot(path: &std::path::Path) -> Result<Arc<ModelSlot>> {
    let slot = Arc::new(ModelSlot::new());
    match load_linear_model(path) {
        Ok(model) => {
            tracing::info!(
                model = %path.display(),
                model_name = %model.model_name,
                "classifier loaded"
            );
            slot.install(Arc::new(model))?;
        }
        Err(err) => {
            tracing::error!(
                model = %path.display(),
                error = %err,
                "classifier not loaded; predictions will be refused"
            );
        }
    }
    Ok(slot)
}

fn spawn_embedded_worker(queue: Arc<DurableQueue>, args: &Args) -> Result<EmbeddedWorker> {
    let config = WorkerConfig {
        poll_interval: Duration::from_millis(args.poll_interval_ms),
        max_ticks: None,
    };
    config.validate()?;

    if let Err(err) = SqliteTransactionStore::open(&args.db) {
        tracing::error!(
            database = %args.db.display(),
            error = %format!("{err:#}"),
            "store migration failed; batches will be requeued until it is reachable"
        );
    }

    let worker = QueueWorker::new(queue, SqliteTransactionStore::new(&args.db), config);
    let (shutdown, shutdown_rx) = std::sync::mpsc::channel();
    let handle = tokio::task::spawn_blocking(move || worker.run(&shutdown_rx));
    Ok(EmbeddedWorker { shutdown, handle })
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to listen for ctrl-c; running until killed");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(args.log_format, &args.log_filter)?;

    let queue = Arc::new(DurableQueue::new(&args.queue));
    let state = ServiceState {
        gateway: PredictionGateway::new(load_model_slot(&args.model)?, Arc::clone(&queue)),
        operation_timeout: Duration::from_millis(args.operation_timeout_ms),
        embedded_worker: args.embedded_worker,
        telemetry: Arc::new(ServiceTelemetry::default()),
    };

    let worker = if args.embedded_worker {
        Some(spawn_embedded_worker(Arc::clone(&queue), &args)?)
    } else {
        None
    };

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, queue = %args.queue.display(), "prediction service listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(worker) = worker {
        let summary = worker.stop().await?;
        tracing::info!(
            ticks = summary.ticks,
            inserted = summary.inserted,
            requeued = summary.requeued,
            "embedded worker stopped"
        );
    }
    Ok(())
}

async fn health(State(state): State<ServiceState>) -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse {
        status: "ok",
        timeout_ms: state.timeout_ms(),
        model_ready: state.gateway.is_ready(),
        embedded_worker: state.embedded_worker,
        telemetry: state.telemetry.snapshot(),
    }))
}

async fn ready(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<ReadinessResponse>>, ServiceFailure> {
    let checks = state
        .run_blocking(
            StatusCode::SERVICE_UNAVAILABLE,
            "queue_unavailable",
            "readiness",
            |gateway| {
                let queue_writable = match gateway.queue().check_writable() {
                    Ok(()) => true,
                    Err(err) => {
                        tracing::warn!(error = %err, "queue is not writable");
                        false
                    }
                };
                let (pending_entries, in_flight_entries) = match gateway.queue().status() {
                    Ok(status) => (status.pending_entries, status.in_flight_entries),
                    Err(err) => {
                        tracing::warn!(error = %err, "queue status unavailable");
                        (0, 0)
                    }
                };
                Ok(ReadinessChecks {
                    model_ready: gateway.is_ready(),
                    model_name: gateway.model_name(),
                    queue_writable,
                    pending_entries,
                    in_flight_entries,
                })
            },
        )
        .await?;

    if checks.model_ready && checks.queue_writable {
        return Ok(Json(envelope(ReadinessResponse { status: "ready", checks })));
    }

    state.telemetry.record_failure("not_ready", false);
    Err(ServiceState::failure(
        StatusCode::SERVICE_UNAVAILABLE,
        "not_ready",
        "classifier must be loaded and the queue writable before serving traffic",
        Some(json!({
            "model_ready": checks.model_ready,
            "queue_writable": checks.queue_writable,
        })),
    ))
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn predict(
    State(state): State<ServiceState>,
    payload: Result<Json<Transaction>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<PredictionReceipt>>, ServiceFailure> {
    let Json(transaction) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    state.telemetry.requests_total.fetch_add(1, Ordering::Relaxed);

    let scored = state.gateway.classify(transaction).map_err(|err| {
        let failure = ServiceState::classify_ledger_error(
            &err,
            StatusCode::INTERNAL_SERVER_ERROR,
            "prediction_failed",
        );
        state.telemetry.record_failure(failure.code, false);
        failure
    })?;
    let receipt = state.enqueue_with_timeout(scored).await;

    state.telemetry.requests_success_total.fetch_add(1, Ordering::Relaxed);
    state.telemetry.record_prediction(&receipt);
    Ok(Json(envelope(receipt)))
}
