// sink.rs — Durable storage behind the audit log.
//
// The log hands each serialized event line to an AuditSink. A sink must not
// return Ok until the line is durable: the gateway proceeds past an audit
// point only after the write is confirmed.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::AuditError;

/// Write-once storage for serialized audit lines.
///
/// There is no way to rewrite or truncate through this trait.
pub trait AuditSink: Send {
    /// Durably append one JSON line (without trailing newline).
    fn write_line(&mut self, line: &str) -> std::io::Result<()>;

    /// Short description for logs (e.g. the file path).
    fn describe(&self) -> String;
}

/// Appends lines to a JSONL file opened in append-only mode.
///
/// Unbuffered: a line is handed to the OS in one `write_all`, so a failed
/// write never leaves bytes behind to be flushed later.
pub struct FileSink {
    file: File,
    path: PathBuf,
}

impl FileSink {
    /// Open (or create) the file in append mode. Existing content is never
    /// overwritten.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| AuditError::OpenFailed {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| AuditError::OpenFailed {
                path: path.clone(),
                source,
            })?;
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditSink for FileSink {
    fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        let mut record = String::with_capacity(line.len() + 1);
        record.push_str(line);
        record.push('\n');
        self.file.write_all(record.as_bytes())?;
        self.file.sync_data()
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Keeps lines in memory. Used for ephemeral gateways and tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    lines: Vec<String>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }
}

impl AuditSink for MemorySink {
    fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        self.lines.push(line.to_string());
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
