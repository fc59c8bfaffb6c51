#![allow(clippy::missing_errors_doc)]

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use fraud_ledger_core::{
    format_rfc3339, now_utc, FraudLabel, LedgerError, QueuedRecord, StoreSession, Transaction,
    TransactionStore,
};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};

const TRANSACTIONS_MIGRATION_VERSION: i64 = 1;
const TRANSACTIONS_TABLE: &str = "fraud_data";

const SCHEMA_TRANSACTIONS_V1: &str = r"
CREATE TABLE IF NOT EXISTS fraud_data (
  transaction_id INTEGER PRIMARY KEY AUTOINCREMENT,
  customer TEXT NOT NULL CHECK (length(customer) > 0),
  step INTEGER NOT NULL CHECK (step >= 0),
  age TEXT NOT NULL,
  gender TEXT NOT NULL,
  zipcodeOri TEXT NOT NULL,
  merchant TEXT NOT NULL,
  zipMerchant TEXT NOT NULL,
  category TEXT NOT NULL,
  amount REAL NOT NULL CHECK (amount >= 0.0),
  fraud INTEGER NOT NULL CHECK (fraud IN (0, 1)),
  scored_at TEXT,
  recorded_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_fraud_data_customer
  ON fraud_data(customer, transaction_id);
CREATE INDEX IF NOT EXISTS idx_fraud_data_fraud
  ON fraud_data(fraud, transaction_id);
";

const INSERT_TRANSACTION: &str = "INSERT INTO fraud_data(
    customer, step, age, gender, zipcodeOri,
    merchant, zipMerchant, category, amount, fraud,
    scored_at, recorded_at
 ) VALUES (
    ?1, ?2, ?3, ?4, ?5,
    ?6, ?7, ?8, ?9, ?10,
    ?11, ?12
 )";

/// Transaction table on a SQLite file. Each session opens its own
/// connection so an unreachable database surfaces at session start.
#[derive(Debug, Clone)]
pub struct SqliteTransactionStore {
    path: PathBuf,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct ConnectionReport {
    pub database: String,
    pub reachable: bool,
    pub sqlite_version: Option<String>,
    pub schema_version: Option<i64>,
    pub table_present: bool,
    pub rows: Option<u64>,
    pub error: Option<String>,
}

pub struct SqliteSession {
    conn: Connection,
    recorded_at: String,
}

impl SqliteTransactionStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Opens the database file, creating it when missing, and applies the
    /// schema.
    pub fn open(path: &Path) -> Result<Self> {
        let store = Self::new(path);
        store.migrate()?;
        Ok(store)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn migrate(&self) -> Result<()> {
        let conn = self.connect()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            );",
        )
        .context("failed to ensure schema_migrations exists")?;

        conn.execute_batch(SCHEMA_TRANSACTIONS_V1)
            .context("failed to apply transaction schema")?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        conn.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![TRANSACTIONS_MIGRATION_VERSION, now],
        )
        .context("failed to register transaction schema migration")?;

        tracing::info!(database = %self.path.display(), "transaction schema ready");
        Ok(())
    }

    /// Connectivity check. Never fails; problems are reported in the result.
    #[must_use]
    pub fn check_connection(&self) -> ConnectionReport {
        let mut report = ConnectionReport {
            database: self.path.display().to_string(),
            reachable: false,
            sqlite_version: None,
            schema_version: None,
            table_present: false,
            rows: None,
            error: None,
        };

        let checked = self.connect().and_then(|conn| {
            report.reachable = true;
            report.sqlite_version = Some(
                conn.query_row("SELECT sqlite_version()", [], |row| row.get::<_, String>(0))
                    .context("failed to query sqlite_version")?,
            );
            report.table_present = table_exists(&conn, TRANSACTIONS_TABLE)?;
            if table_exists(&conn, "schema_migrations")? {
                report.schema_version = conn
                    .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
                        row.get::<_, Option<i64>>(0)
                    })
                    .context("failed to query schema version")?;
            }
            if report.table_present {
                report.rows = Some(count_transactions(&conn)?);
            }
            Ok(())
        });

        if let Err(err) = checked {
            report.error = Some(format!("{err:#}"));
        }
        report
    }

    /// Inserts `count` synthetic benign transactions with customers
    /// `C_SIM_0..C_SIM_{count-1}` in one commit.
    pub fn seed_simulated(&self, count: usize) -> Result<usize> {
        let mut session = self
            .open_session()
            .map_err(|err| anyhow!("failed to open store session: {err}"))?;
        for index in 0..count {
            session
                .insert(&simulated_record(index))
                .map_err(|err| anyhow!("failed to insert simulated row {index}: {err}"))?;
        }
        session
            .commit()
            .map_err(|err| anyhow!("failed to commit simulated rows: {err}"))?;
        Ok(count)
    }

    /// Most recent rows first, for inspection.
    pub fn recent(&self, limit: usize) -> Result<Vec<QueuedRecord>> {
        let conn = self.connect()?;
        let limit = i64::try_from(limit).context("limit out of range")?;
        let mut stmt = conn.prepare(
            "SELECT customer, step, age, gender, zipcodeOri,
                    merchant, zipMerchant, category, amount, fraud, scored_at
             FROM fraud_data
             ORDER BY transaction_id DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], parse_record_row)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path).with_context(|| {
            format!("failed to open sqlite database at {}", self.path.display())
        })?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(conn)
    }
}

impl TransactionStore for SqliteTransactionStore {
    type Session = SqliteSession;

    fn open_session(&self) -> Result<Self::Session, LedgerError> {
        let conn = self.connect().map_err(unavailable)?;
        if !table_exists(&conn, TRANSACTIONS_TABLE).map_err(unavailable)? {
            return Err(LedgerError::StoreUnavailable(format!(
                "table {TRANSACTIONS_TABLE} missing in {}; run migrations",
                self.path.display()
            )));
        }

        conn.execute_batch("BEGIN IMMEDIATE")
            .map_err(|err| LedgerError::StoreUnavailable(format!("failed to begin: {err}")))?;
        let recorded_at = format_rfc3339(now_utc())?;

        Ok(SqliteSession { conn, recorded_at })
    }

    fn count_rows(&self) -> Result<u64, LedgerError> {
        let conn = self.connect().map_err(unavailable)?;
        count_transactions(&conn).map_err(unavailable)
    }
}

impl StoreSession for SqliteSession {
    fn insert(&mut self, record: &QueuedRecord) -> Result<(), LedgerError> {
        let transaction = &record.transaction;
        let mut stmt = self
            .conn
            .prepare_cached(INSERT_TRANSACTION)
            .map_err(|err| LedgerError::StoreUnavailable(format!("failed to prepare insert: {err}")))?;

        stmt.execute(params![
            transaction.customer,
            transaction.step,
            transaction.age,
            transaction.gender,
            transaction.zipcode_ori,
            transaction.merchant,
            transaction.zip_merchant,
            transaction.category,
            transaction.amount,
            i64::from(record.fraud.as_u8()),
            record.scored_at,
            self.recorded_at,
        ])
        .map(|_| ())
        .map_err(|err| classify_insert_error(&err))
    }

    fn commit(self) -> Result<(), LedgerError> {
        self.conn
            .execute_batch("COMMIT")
            .map_err(|err| LedgerError::StoreUnavailable(format!("failed to commit: {err}")))
    }
}

/// Constraint and type failures reject one row; anything else means the
/// store itself is in trouble.
fn classify_insert_error(err: &rusqlite::Error) -> LedgerError {
    match err.sqlite_error_code() {
        Some(ErrorCode::ConstraintViolation | ErrorCode::TypeMismatch) => {
            LedgerError::MalformedRecord(format!("row rejected: {err}"))
        }
        _ => LedgerError::StoreUnavailable(format!("insert failed: {err}")),
    }
}

#[allow(clippy::needless_pass_by_value)]
fn unavailable(err: anyhow::Error) -> LedgerError {
    LedgerError::StoreUnavailable(format!("{err:#}"))
}

fn count_transactions(conn: &Connection) -> Result<u64> {
    let count = conn
        .query_row("SELECT COUNT(*) FROM fraud_data", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to count fraud_data rows")?;
    u64::try_from(count).with_context(|| format!("invalid fraud_data row count: {count}"))
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT 1
             FROM sqlite_master
             WHERE type = 'table' AND name = ?1
             LIMIT 1",
            params![table_name],
            |_| Ok(()),
        )
        .optional()
        .context("failed to query sqlite_master")?
        .is_some();

    Ok(exists)
}

fn parse_record_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<QueuedRecord> {
    let fraud_raw: i64 = row.get(9)?;
    let fraud = u8::try_from(fraud_raw)
        .ok()
        .and_then(|value| FraudLabel::try_from(value).ok())
        .ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                9,
                rusqlite::types::Type::Integer,
                Box::new(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("invalid fraud label: {fraud_raw}"),
                )),
            )
        })?;

    Ok(QueuedRecord {
        transaction: Transaction {
            customer: row.get(0)?,
            step: row.get(1)?,
            age: row.get(2)?,
            gender: row.get(3)?,
            zipcode_ori: row.get(4)?,
            merchant: row.get(5)?,
            zip_merchant: row.get(6)?,
            category: row.get(7)?,
            amount: row.get(8)?,
        },
        fraud,
        scored_at: row.get(10)?,
    })
}

fn simulated_record(index: usize) -> QueuedRecord {
    QueuedRecord::new(
        Transaction {
            customer: format!("C_SIM_{index}"),
            step: 900,
            age: "1".to_string(),
            gender: "U".to_string(),
            zipcode_ori: "12345".to_string(),
            merchant: "M_SIMULATED".to_string(),
            zip_merchant: "12345".to_string(),
            category: "es_simulated".to_string(),
            amount: 10.0,
        },
        FraudLabel::Benign,
        None,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    fn must_ledger<T>(result: Result<T, LedgerError>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn unique_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("fraud-ledger-store-{}.sqlite3", Ulid::new()))
    }

    fn fixture_store() -> SqliteTransactionStore {
        must(SqliteTransactionStore::open(&unique_db_path()))
    }

    fn record(customer: &str, fraud: FraudLabel) -> QueuedRecord {
        QueuedRecord::new(
            Transaction {
                customer: customer.to_string(),
                step: 12,
                age: "5".to_string(),
                gender: "F".to_string(),
                zipcode_ori: "28007".to_string(),
                merchant: "M1053599405".to_string(),
                zip_merchant: "28007".to_string(),
                category: "es_health".to_string(),
                amount: 211.4,
            },
            fraud,
            Some("2026-01-05T10:00:00Z".to_string()),
        )
    }

    #[test]
    fn migrate_is_idempotent() {
        let store = fixture_store();
        must(store.migrate());
        must(store.migrate());
        assert_eq!(must_ledger(store.count_rows()), 0);
    }

    #[test]
    fn committed_session_rows_are_counted_and_readable() {
        let store = fixture_store();
        let mut session = must_ledger(store.open_session());
        must_ledger(session.insert(&record("C1", FraudLabel::Benign)));
        must_ledger(session.insert(&record("C2", FraudLabel::Fraudulent)));
        must_ledger(session.commit());

        assert_eq!(must_ledger(store.count_rows()), 2);
        let recent = must(store.recent(10));
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].transaction.customer, "C2");
        assert_eq!(recent[0].fraud, FraudLabel::Fraudulent);
        assert_eq!(recent[1], record("C1", FraudLabel::Benign));
    }

    #[test]
    fn dropped_session_persists_nothing() {
        let store = fixture_store();
        {
            let mut session = must_ledger(store.open_session());
            must_ledger(session.insert(&record("C1", FraudLabel::Benign)));
        }
        assert_eq!(must_ledger(store.count_rows()), 0);
    }

    #[test]
    fn constraint_violation_rejects_only_that_row() {
        let store = fixture_store();
        let mut session = must_ledger(store.open_session());
        must_ledger(session.insert(&record("C1", FraudLabel::Benign)));
        let rejected = session.insert(&record("", FraudLabel::Benign));
        assert!(matches!(rejected, Err(LedgerError::MalformedRecord(_))));
        must_ledger(session.insert(&record("C3", FraudLabel::Benign)));
        must_ledger(session.commit());

        assert_eq!(must_ledger(store.count_rows()), 2);
    }

    #[test]
    fn missing_directory_is_unavailable() {
        let path = std::env::temp_dir()
            .join(format!("fraud-ledger-missing-{}", Ulid::new()))
            .join("store.sqlite3");
        let store = SqliteTransactionStore::new(path);

        assert!(matches!(
            store.open_session(),
            Err(LedgerError::StoreUnavailable(_))
        ));
        assert!(matches!(
            store.count_rows(),
            Err(LedgerError::StoreUnavailable(_))
        ));

        let report = store.check_connection();
        assert!(!report.reachable);
        assert!(report.error.is_some());
    }

    #[test]
    fn unmigrated_database_is_unavailable_for_sessions() {
        let store = SqliteTransactionStore::new(unique_db_path());
        assert!(matches!(
            store.open_session(),
            Err(LedgerError::StoreUnavailable(_))
        ));

        let report = store.check_connection();
        assert!(report.reachable);
        assert!(!report.table_present);
        assert_eq!(report.rows, None);
    }

    #[test]
    fn seed_simulated_adds_rows_and_check_reports_them() {
        let store = fixture_store();
        assert_eq!(must(store.seed_simulated(25)), 25);
        assert_eq!(must_ledger(store.count_rows()), 25);

        let report = store.check_connection();
        assert!(report.reachable);
        assert!(report.table_present);
        assert_eq!(report.schema_version, Some(TRANSACTIONS_MIGRATION_VERSION));
        assert_eq!(report.rows, Some(25));
        assert_eq!(
            must(store.recent(1))[0].transaction.customer,
            "C_SIM_24"
        );
    }
}
