//! File-backed transaction queue.
//!
//! The queue file is the only durable copy of a scored transaction between
//! scoring and the store. Every mutation happens under an in-process mutex and
//! an exclusive advisory lock on the file, so a drain never observes half of
//! an appended line. A drain copies the drained lines to the in-flight journal
//! before truncating the queue; the journal is removed once the batch is
//! settled (committed or requeued). A drain is refused while the journal still
//! holds lines, so an unsettled batch is never overwritten by the next one.

use std::borrow::Cow;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use fraud_ledger_core::{LedgerError, QueuedRecord};
use fs2::FileExt;
use serde::Serialize;

const IN_FLIGHT_SUFFIX: &str = "inflight";

/// One drained queue line, kept as raw bytes so it can be requeued unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueEntry {
    raw: Vec<u8>,
}

impl QueueEntry {
    /// # Errors
    /// Returns [`LedgerError::MalformedRecord`] when the record cannot be
    /// encoded.
    pub fn from_record(record: &QueuedRecord) -> Result<Self, LedgerError> {
        Ok(Self {
            raw: record.to_line()?.into_bytes(),
        })
    }

    /// The line for display; invalid UTF-8 is replaced.
    #[must_use]
    pub fn line(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.raw)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    /// # Errors
    /// Returns [`LedgerError::MalformedRecord`] when the line is not UTF-8 or
    /// not a valid queued record.
    pub fn decode(&self) -> Result<QueuedRecord, LedgerError> {
        let line = std::str::from_utf8(&self.raw)
            .map_err(|err| LedgerError::MalformedRecord(format!("queue line is not UTF-8: {err}")))?;
        QueuedRecord::from_line(line)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub queue_path: String,
    pub pending_entries: usize,
    pub queue_bytes: u64,
    pub in_flight_path: String,
    pub in_flight_entries: usize,
}

#[derive(Debug)]
pub struct DurableQueue {
    path: PathBuf,
    in_flight_path: PathBuf,
    guard: Mutex<()>,
}

impl DurableQueue {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let in_flight_path = in_flight_path_for(&path);
        Self {
            path,
            in_flight_path,
            guard: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn in_flight_path(&self) -> &Path {
        &self.in_flight_path
    }

    /// Appends one record as a single line.
    ///
    /// # Errors
    /// Returns [`LedgerError::QueueIo`] when the file cannot be opened, locked,
    /// written or synced.
    pub fn append(&self, record: &QueuedRecord) -> Result<(), LedgerError> {
        let entry = QueueEntry::from_record(record)?;
        self.append_entries(std::slice::from_ref(&entry))
    }

    /// Reads every pending line and truncates the queue in one locked step.
    /// A missing queue file is an empty queue.
    ///
    /// # Errors
    /// Returns [`LedgerError::QueueIo`] when the queue or the in-flight journal
    /// cannot be read, written or truncated, or when the journal still holds
    /// an unsettled batch. The queue is left untouched in those cases.
    pub fn drain_all(&self) -> Result<Vec<QueueEntry>, LedgerError> {
        let _guard = self.lock_in_process();

        let mut file = match OpenOptions::new().read(true).write(true).open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(queue_io("open", &self.path, &err)),
        };

        file.lock_exclusive()
            .map_err(|err| queue_io("lock", &self.path, &err))?;
        let result = self.drain_locked(&mut file);
        let _ = FileExt::unlock(&file);
        result
    }

    /// Returns a drained batch to the queue after a store-level failure.
    ///
    /// # Errors
    /// Returns [`LedgerError::QueueIo`] when the append fails. The batch then
    /// survives only in the in-flight journal.
    pub fn requeue(&self, entries: &[QueueEntry]) -> Result<(), LedgerError> {
        if let Err(err) = self.append_entries(entries) {
            tracing::error!(
                entries = entries.len(),
                queue = %self.path.display(),
                journal = %self.in_flight_path.display(),
                data_loss = true,
                error = %err,
                "failed to requeue drained batch"
            );
            return Err(err);
        }
        self.acknowledge()
    }

    /// Discards the in-flight journal once the drained batch is settled.
    ///
    /// # Errors
    /// Returns [`LedgerError::QueueIo`] when the journal exists but cannot be
    /// removed.
    pub fn acknowledge(&self) -> Result<(), LedgerError> {
        let _guard = self.lock_in_process();
        remove_if_exists(&self.in_flight_path)
    }

    /// Moves lines left in the in-flight journal by an interrupted worker back
    /// onto the queue. Returns the number of recovered lines.
    ///
    /// # Errors
    /// Returns [`LedgerError::QueueIo`] when the journal cannot be read or the
    /// lines cannot be appended.
    pub fn recover_in_flight(&self) -> Result<usize, LedgerError> {
        let entries = read_entries(&self.in_flight_path)?;
        if !entries.is_empty() {
            self.append_entries(&entries)?;
        }
        self.acknowledge()?;
        Ok(entries.len())
    }

    /// Opens the queue for appending without writing anything.
    ///
    /// # Errors
    /// Returns [`LedgerError::QueueIo`] when the file cannot be opened for
    /// appending.
    pub fn check_writable(&self) -> Result<(), LedgerError> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map(|_| ())
            .map_err(|err| queue_io("open", &self.path, &err))
    }

    /// # Errors
    /// Returns [`LedgerError::QueueIo`] when either file exists but cannot be
    /// read.
    pub fn status(&self) -> Result<QueueStatus, LedgerError> {
        let queue_bytes = match fs::metadata(&self.path) {
            Ok(metadata) => metadata.len(),
            Err(err) if err.kind() == ErrorKind::NotFound => 0,
            Err(err) => return Err(queue_io("stat", &self.path, &err)),
        };

        Ok(QueueStatus {
            queue_path: self.path.display().to_string(),
            pending_entries: read_entries(&self.path)?.len(),
            queue_bytes,
            in_flight_path: self.in_flight_path.display().to_string(),
            in_flight_entries: read_entries(&self.in_flight_path)?.len(),
        })
    }

    fn drain_locked(&self, file: &mut File) -> Result<Vec<QueueEntry>, LedgerError> {
        let unsettled = read_entries(&self.in_flight_path)?.len();
        if unsettled > 0 {
            return Err(LedgerError::QueueIo(format!(
                "in-flight journal {} holds {unsettled} unsettled lines; recover it before draining",
                self.in_flight_path.display()
            )));
        }

        let mut raw = Vec::new();
        file.read_to_end(&mut raw)
            .map_err(|err| queue_io("read", &self.path, &err))?;
        if raw.is_empty() {
            return Ok(Vec::new());
        }

        let entries = parse_entries(&raw);
        if !entries.is_empty() {
            append_lines(&self.in_flight_path, &entries)?;
        }

        file.set_len(0)
            .map_err(|err| queue_io("truncate", &self.path, &err))?;
        file.sync_all()
            .map_err(|err| queue_io("sync", &self.path, &err))?;

        Ok(entries)
    }

    fn append_entries(&self, entries: &[QueueEntry]) -> Result<(), LedgerError> {
        if entries.is_empty() {
            return Ok(());
        }
        let _guard = self.lock_in_process();
        append_lines(&self.path, entries)
    }

    fn lock_in_process(&self) -> MutexGuard<'_, ()> {
        self.guard.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn in_flight_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|value| value.to_os_string())
        .unwrap_or_default();
    name.push(".");
    name.push(IN_FLIGHT_SUFFIX);
    path.with_file_name(name)
}

/// Writes all lines with one `write_all` under an exclusive file lock.
fn append_lines(path: &Path, entries: &[QueueEntry]) -> Result<(), LedgerError> {
    let mut payload = Vec::new();
    for entry in entries {
        payload.extend_from_slice(&entry.raw);
        payload.push(b'\n');
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|err| queue_io("open", path, &err))?;
    file.lock_exclusive()
        .map_err(|err| queue_io("lock", path, &err))?;

    let written = file
        .write_all(&payload)
        .and_then(|()| file.sync_data());
    let _ = FileExt::unlock(&file);
    written.map_err(|err| queue_io("append", path, &err))
}

fn read_entries(path: &Path) -> Result<Vec<QueueEntry>, LedgerError> {
    match fs::read(path) {
        Ok(raw) => Ok(parse_entries(&raw)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(Vec::new()),
        Err(err) => Err(queue_io("read", path, &err)),
    }
}

fn parse_entries(body: &[u8]) -> Vec<QueueEntry> {
    body.split(|byte| *byte == b'\n')
        .filter(|line| !line.iter().all(u8::is_ascii_whitespace))
        .map(|line| QueueEntry { raw: line.to_vec() })
        .collect()
}

fn remove_if_exists(path: &Path) -> Result<(), LedgerError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(queue_io("remove", path, &err)),
    }
}

fn queue_io(action: &str, path: &Path, err: &std::io::Error) -> LedgerError {
    LedgerError::QueueIo(format!("failed to {action} {}: {err}", path.display()))
}
