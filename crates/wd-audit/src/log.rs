// log.rs — Append-only, hash-chained audit log.
//
// The log is a single ordered appender: one lock serializes the chain head,
// so concurrent callers get strictly increasing sequence numbers and every
// event links to exactly one predecessor. Events are written through an
// AuditSink (JSONL file in production) before the head advances, so an
// unacknowledged write never becomes part of the chain.
//
// A failed sink write may still have reached storage, so the on-disk tail
// is unknown afterwards. The log then refuses every later append; reopening
// the file re-reads and verifies whatever actually landed.
//
// A file-backed log keeps only the newest `retained` events in memory;
// queries reaching further back read the file. A log without a file keeps
// everything, since memory is its only copy.
//
// Stored lines are canonical: re-serializing a parsed event reproduces the
// line byte for byte. Verification checks that too, so whitespace edits or
// reordered keys are caught along with content edits.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use serde::Serialize;

use crate::error::AuditError;
use crate::event::{AuditEvent, GENESIS_HASH};
use crate::sink::{AuditSink, FileSink, MemorySink};

/// Events a file-backed log keeps in memory by default.
pub const DEFAULT_RETAINED_EVENTS: usize = 4096;

/// One page of a read-only audit query.
#[derive(Debug, Clone, Serialize)]
pub struct AuditPage {
    pub events: Vec<AuditEvent>,
    pub offset: usize,
    pub total: usize,
    /// Result of verifying the whole chain at query time.
    pub chain_valid: bool,
}

struct Inner {
    sink: Box<dyn AuditSink>,
    /// Backing file, when there is one.
    path: Option<PathBuf>,
    /// The newest events, oldest first. Holds the whole chain when
    /// `total == recent.len()`.
    recent: VecDeque<AuditEvent>,
    retained: usize,
    total: u64,
    head: String,
    /// Set by the first failed write; appends are refused from then on.
    failed: Option<String>,
}

impl Inner {
    fn is_complete(&self) -> bool {
        self.total == self.recent.len() as u64
    }

    fn trim(&mut self) {
        while self.recent.len() > self.retained {
            self.recent.pop_front();
        }
    }

    /// Every event, oldest first. Reads the file when the window is partial.
    fn all_events(&self) -> Result<Vec<AuditEvent>, AuditError> {
        match &self.path {
            Some(path) if !self.is_complete() => AuditLog::read_all(path),
            _ => Ok(self.recent.iter().cloned().collect()),
        }
    }

    fn verify(&self) -> Result<(), AuditError> {
        match &self.path {
            Some(path) if !self.is_complete() => {
                let events = verify_lines(&read_lines(path)?)?;
                let stored_head = events.last().map(|e| e.this_hash.as_str());
                if events.len() as u64 != self.total
                    || stored_head.unwrap_or(GENESIS_HASH) != self.head
                {
                    return Err(AuditError::IntegrityViolation {
                        line: events.len(),
                        detail: format!(
                            "file holds {} events, log has {} ending at {}",
                            events.len(),
                            self.total,
                            self.head
                        ),
                    });
                }
                Ok(())
            }
            _ => verify_events(&self.recent),
        }
    }
}

/// The append-only audit log.
///
/// The log is `Sync`; share it as `Arc<AuditLog>` between pipeline stages.
pub struct AuditLog {
    inner: Mutex<Inner>,
}

impl AuditLog {
    /// Open (or create) a file-backed log.
    ///
    /// An existing file is read and verified first; a broken chain is
    /// refused rather than extended.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let path = path.as_ref();
        let events = if path.exists() {
            let lines = read_lines(path)?;
            verify_lines(&lines)?
        } else {
            Vec::new()
        };
        let sink = FileSink::open(path)?;
        tracing::info!(
            path = %path.display(),
            events = events.len(),
            "audit log opened"
        );
        Ok(Self::from_parts(
            Box::new(sink),
            Some(path.to_path_buf()),
            events,
            DEFAULT_RETAINED_EVENTS,
        ))
    }

    /// Keep at most `limit` recent events in memory. Has no effect on a log
    /// without a backing file.
    pub fn retain_recent(self, limit: usize) -> Self {
        if let Ok(mut inner) = self.inner.lock() {
            if inner.path.is_some() {
                inner.retained = limit.max(1);
                inner.trim();
            }
        }
        self
    }

    /// A log that keeps events only in memory.
    pub fn in_memory() -> Self {
        Self::with_sink(Box::new(MemorySink::new()))
    }

    /// A fresh, empty chain writing through the given sink.
    pub fn with_sink(sink: Box<dyn AuditSink>) -> Self {
        Self::from_parts(sink, None, Vec::new(), usize::MAX)
    }

    fn from_parts(
        sink: Box<dyn AuditSink>,
        path: Option<PathBuf>,
        events: Vec<AuditEvent>,
        retained: usize,
    ) -> Self {
        let head = events
            .last()
            .map(|e| e.this_hash.clone())
            .unwrap_or_else(|| GENESIS_HASH.to_string());
        let mut inner = Inner {
            sink,
            path,
            total: events.len() as u64,
            recent: events.into(),
            retained,
            head,
            failed: None,
        };
        inner.trim();
        Self {
            inner: Mutex::new(inner),
        }
    }

    /// Append an event and return its sequence number.
    ///
    /// Assigns `sequence`, `timestamp`, `previous_hash` and `this_hash` on
    /// the caller's event. Returns only after the sink confirmed the write.
    pub fn append(&self, event: &mut AuditEvent) -> Result<u64, AuditError> {
        let mut inner = self.inner.lock().map_err(|_| AuditError::Poisoned)?;
        if let Some(cause) = &inner.failed {
            return Err(AuditError::Closed {
                cause: cause.clone(),
            });
        }

        event.sequence = inner.total + 1;
        event.timestamp = Utc::now();
        event.previous_hash = inner.head.clone();
        event.this_hash = event.compute_hash()?;

        let line = serde_json::to_string(event)?;
        if let Err(e) = inner.sink.write_line(&line) {
            tracing::error!(
                sink = %inner.sink.describe(),
                action = %event.action,
                error = %e,
                "audit write failed; log closed until reopened"
            );
            inner.failed = Some(e.to_string());
            return Err(AuditError::WriteFailed(e));
        }

        inner.head = event.this_hash.clone();
        inner.total = event.sequence;
        inner.recent.push_back(event.clone());
        inner.trim();
        tracing::debug!(
            sequence = event.sequence,
            stage = ?event.stage,
            action = %event.action,
            "audit event appended"
        );
        Ok(event.sequence)
    }

    /// Recompute the whole chain from the first event to the last.
    ///
    /// Returns `Ok(true)` when intact, or an `IntegrityViolation` naming the
    /// first bad position.
    pub fn verify(&self) -> Result<bool, AuditError> {
        let inner = self.inner.lock().map_err(|_| AuditError::Poisoned)?;
        inner.verify()?;
        Ok(true)
    }

    /// Independently verify a log file on disk.
    pub fn verify_file(path: impl AsRef<Path>) -> Result<bool, AuditError> {
        let lines = read_lines(path.as_ref())?;
        verify_lines(&lines)?;
        Ok(true)
    }

    /// Read all events from a log file, oldest first, without verifying.
    pub fn read_all(path: impl AsRef<Path>) -> Result<Vec<AuditEvent>, AuditError> {
        read_lines(path.as_ref())?
            .iter()
            .map(|(_, line)| serde_json::from_str(line).map_err(AuditError::from))
            .collect()
    }

    /// Read-only paginated query. `chain_valid` reflects a full verification.
    pub fn page(&self, offset: usize, limit: usize) -> Result<AuditPage, AuditError> {
        let inner = self.inner.lock().map_err(|_| AuditError::Poisoned)?;
        let total = inner.total as usize;
        let first_retained = total - inner.recent.len();
        let events = if offset >= first_retained {
            inner
                .recent
                .iter()
                .skip(offset - first_retained)
                .take(limit)
                .cloned()
                .collect()
        } else {
            inner
                .all_events()?
                .into_iter()
                .skip(offset)
                .take(limit)
                .collect()
        };
        let chain_valid = inner.verify().is_ok();
        Ok(AuditPage {
            events,
            offset,
            total,
            chain_valid,
        })
    }

    /// All events whose `action` equals the given name.
    pub fn events_with_action(&self, action: &str) -> Result<Vec<AuditEvent>, AuditError> {
        let inner = self.inner.lock().map_err(|_| AuditError::Poisoned)?;
        Ok(inner
            .all_events()?
            .into_iter()
            .filter(|e| e.action == action)
            .collect())
    }

    /// Look up one event by sequence number.
    pub fn get(&self, sequence: u64) -> Result<Option<AuditEvent>, AuditError> {
        let inner = self.inner.lock().map_err(|_| AuditError::Poisoned)?;
        if sequence == 0 || sequence > inner.total {
            return Ok(None);
        }
        let first_retained = inner.total - inner.recent.len() as u64;
        if sequence > first_retained {
            let idx = (sequence - first_retained - 1) as usize;
            return Ok(inner.recent.get(idx).cloned());
        }
        Ok(inner
            .all_events()?
            .into_iter()
            .nth((sequence - 1) as usize))
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|i| i.total as usize).unwrap_or(0)
    }

    /// Events currently held in memory.
    pub fn retained(&self) -> usize {
        self.inner.lock().map(|i| i.recent.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a failed write has closed the log to further appends.
    pub fn is_closed(&self) -> bool {
        self.inner
            .lock()
            .map(|i| i.failed.is_some())
            .unwrap_or(true)
    }

    /// Hash of the newest event ([`GENESIS_HASH`] when empty).
    pub fn head_hash(&self) -> Result<String, AuditError> {
        let inner = self.inner.lock().map_err(|_| AuditError::Poisoned)?;
        Ok(inner.head.clone())
    }
}

/// Read non-blank lines with their 1-based line numbers.
fn read_lines(path: &Path) -> Result<Vec<(usize, String)>, AuditError> {
    let file = File::open(path).map_err(|source| AuditError::OpenFailed {
        path: path.to_path_buf(),
        source,
    })?;
    let mut lines = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if !line.trim().is_empty() {
            lines.push((idx + 1, line));
        }
    }
    Ok(lines)
}

/// Parse and verify raw lines, returning the events when the chain holds.
fn verify_lines(lines: &[(usize, String)]) -> Result<Vec<AuditEvent>, AuditError> {
    let mut events = Vec::with_capacity(lines.len());
    let mut previous = GENESIS_HASH.to_string();

    for (line_no, line) in lines {
        let event: AuditEvent =
            serde_json::from_str(line).map_err(|e| AuditError::IntegrityViolation {
                line: *line_no,
                detail: format!("unparseable event: {}", e),
            })?;

        if serde_json::to_string(&event)? != *line {
            return Err(AuditError::IntegrityViolation {
                line: *line_no,
                detail: "line is not in canonical form".to_string(),
            });
        }
        check_link(&event, events.len() as u64 + 1, &previous, *line_no)?;
        previous = event.this_hash.clone();
        events.push(event);
    }
    Ok(events)
}

fn verify_events<'a>(
    events: impl IntoIterator<Item = &'a AuditEvent>,
) -> Result<(), AuditError> {
    let mut previous = GENESIS_HASH;
    for (idx, event) in events.into_iter().enumerate() {
        check_link(event, idx as u64 + 1, previous, idx + 1)?;
        previous = &event.this_hash;
    }
    Ok(())
}

fn check_link(
    event: &AuditEvent,
    expected_sequence: u64,
    previous: &str,
    line: usize,
) -> Result<(), AuditError> {
    if event.sequence != expected_sequence {
        return Err(AuditError::IntegrityViolation {
            line,
            detail: format!(
                "expected sequence {}, found {}",
                expected_sequence, event.sequence
            ),
        });
    }
    if event.previous_hash != previous {
        return Err(AuditError::IntegrityViolation {
            line,
            detail: format!(
                "previous_hash {} does not match preceding event hash {}",
                event.previous_hash, previous
            ),
        });
    }
    let recomputed = event.compute_hash()?;
    if recomputed != event.this_hash {
        return Err(AuditError::IntegrityViolation {
            line,
            detail: format!(
                "stored hash {} does not match recomputed {}",
                event.this_hash, recomputed
            ),
        });
    }
    Ok(())
}
