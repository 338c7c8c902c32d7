//! Request audit log: one JSON line per backend attempt, plus an in-memory
//! ring buffer for `GET /v1/audit/recent`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

const MAX_AUDIT_ENTRIES: usize = 10_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub request_id: String,
    pub attempt: u32,
    pub source_format: String,
    pub target_provider: String,
    pub target_model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_id: Option<String>,
    pub status: u16,
    pub latency_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub trait AuditSink: Send + Sync {
    fn audit(&self, record: AuditRecord);
}

struct AuditInner {
    entries: VecDeque<AuditRecord>,
    writer: Option<BufWriter<File>>,
}

/// JSONL-backed audit log. Appends are serialized by a mutex.
pub struct AuditLog {
    inner: Mutex<AuditInner>,
}

impl AuditLog {
    /// Open (or create) the audit file and reload its tail into memory.
    pub fn open(file_path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file_path = file_path.as_ref();

        if let Some(parent) = file_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let mut entries = VecDeque::with_capacity(MAX_AUDIT_ENTRIES);

        if file_path.exists() {
            let reader = BufReader::new(File::open(file_path)?);
            for line in reader.lines().map_while(std::result::Result::ok) {
                if let Ok(entry) = serde_json::from_str::<AuditRecord>(&line) {
                    if entries.len() >= MAX_AUDIT_ENTRIES {
                        entries.pop_front();
                    }
                    entries.push_back(entry);
                }
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(file_path)?;

        Ok(Self {
            inner: Mutex::new(AuditInner {
                entries,
                writer: Some(BufWriter::new(file)),
            }),
        })
    }

    /// Ring buffer only, nothing written to disk.
    pub fn in_memory() -> Self {
        Self {
            inner: Mutex::new(AuditInner {
                entries: VecDeque::new(),
                writer: None,
            }),
        }
    }

    /// Newest first.
    pub fn recent(&self, limit: usize) -> Vec<AuditRecord> {
        self.inner
            .lock()
            .map(|inner| inner.entries.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }
}

impl AuditSink for AuditLog {
    fn audit(&self, record: AuditRecord) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        if let Some(ref mut writer) = inner.writer {
            if let Ok(json) = serde_json::to_string(&record) {
                if let Err(e) = writeln!(writer, "{}", json).and_then(|()| writer.flush()) {
                    tracing::warn!(error = %e, "failed to append audit record");
                }
            }
        }
        if inner.entries.len() >= MAX_AUDIT_ENTRIES {
            inner.entries.pop_front();
        }
        inner.entries.push_back(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, status: u16) -> AuditRecord {
        AuditRecord {
            timestamp: Utc::now(),
            request_id: id.to_string(),
            attempt: 1,
            source_format: "openai".to_string(),
            target_provider: "anthropic".to_string(),
            target_model: "claude-3-haiku".to_string(),
            credential_id: Some("anthropic-1".to_string()),
            status,
            latency_ms: 12,
            request_summary: Some("hi".to_string()),
            response_summary: None,
            error: None,
        }
    }

    #[test]
    fn test_recent_is_newest_first() {
        let log = AuditLog::in_memory();
        log.audit(record("a", 200));
        log.audit(record("b", 429));
        let recent = log.recent(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].request_id, "b");
        assert_eq!(log.recent(1).len(), 1);
    }

    #[test]
    fn test_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit").join("log.jsonl");

        let log = AuditLog::open(&path).unwrap();
        log.audit(record("req_1", 200));
        drop(log);

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 1);
        assert!(content.contains("\"request_id\":\"req_1\""));

        let reopened = AuditLog::open(&path).unwrap();
        assert_eq!(reopened.recent(5)[0].request_id, "req_1");
    }
}
