//! Tool execution audit log.
//!
//! One line-delimited JSON entry per tool invocation, appended and never
//! mutated. Queries filter by any subset of task, phase, tool and outcome;
//! statistics aggregate totals, success rate and per-tool / per-phase
//! counts. Writes are serialized on an internal mutex on top of the file
//! lock, and long string payloads are truncated so entries stay scannable.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::persist;

/// Max characters preserved for any string inside a recorded result.
const PAYLOAD_TRUNCATE_CHARS: usize = 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub task_id: String,
    pub phase: String,
    pub tool_name: String,
    pub args: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Filters for querying the log. All fields are optional conjuncts.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuditQuery {
    pub task_id: Option<String>,
    pub phase: Option<String>,
    pub tool_name: Option<String>,
    pub success: Option<bool>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditStats {
    pub total_entries: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub success_rate: f64,
    pub tools_used: BTreeMap<String, u64>,
    pub phases: BTreeMap<String, u64>,
}

/// Append-only audit logger. Cheap to clone and share.
#[derive(Debug, Clone)]
pub struct AuditLog {
    log_file: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl AuditLog {
    pub fn new(log_file: PathBuf) -> Self {
        Self {
            log_file,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Record one tool execution.
    #[allow(clippy::too_many_arguments)]
    pub fn log_tool_execution(
        &self,
        task_id: &str,
        phase: &str,
        tool_name: &str,
        args: Value,
        result: Option<Value>,
        duration_ms: Option<f64>,
        success: bool,
        error: Option<String>,
    ) -> std::io::Result<()> {
        let entry = AuditEntry {
            timestamp: Utc::now(),
            task_id: task_id.to_string(),
            phase: phase.to_string(),
            tool_name: tool_name.to_string(),
            args,
            result: result.map(truncate_payload),
            duration_ms,
            success,
            error: error.map(|e| truncate_str(&e)),
        };
        self.append(&entry)
    }

    fn append(&self, entry: &AuditEntry) -> std::io::Result<()> {
        let line = serde_json::to_string(entry).map_err(std::io::Error::other)?;
        let _guard = self.write_lock.lock().expect("audit write lock poisoned");
        persist::append_line_locked(&self.log_file, &line)
    }

    /// Matching entries in insertion order. `limit` caps the match count.
    pub fn query(&self, query: &AuditQuery) -> std::io::Result<Vec<AuditEntry>> {
        let mut entries = Vec::new();
        for entry in self.read_all()? {
            if let Some(task_id) = &query.task_id {
                if &entry.task_id != task_id {
                    continue;
                }
            }
            if let Some(phase) = &query.phase {
                if &entry.phase != phase {
                    continue;
                }
            }
            if let Some(tool_name) = &query.tool_name {
                if &entry.tool_name != tool_name {
                    continue;
                }
            }
            if let Some(success) = query.success {
                if entry.success != success {
                    continue;
                }
            }
            entries.push(entry);
            if let Some(limit) = query.limit {
                if entries.len() >= limit {
                    break;
                }
            }
        }
        Ok(entries)
    }

    /// Most recent entries, newest first.
    pub fn recent(&self, count: usize) -> std::io::Result<Vec<AuditEntry>> {
        let all = self.read_all()?;
        Ok(all.into_iter().rev().take(count).collect())
    }

    pub fn stats(&self) -> std::io::Result<AuditStats> {
        let mut total = 0u64;
        let mut successes = 0u64;
        let mut tools_used: BTreeMap<String, u64> = BTreeMap::new();
        let mut phases: BTreeMap<String, u64> = BTreeMap::new();

        for entry in self.read_all()? {
            total += 1;
            if entry.success {
                successes += 1;
            }
            *tools_used.entry(entry.tool_name).or_default() += 1;
            *phases.entry(entry.phase).or_default() += 1;
        }

        Ok(AuditStats {
            total_entries: total,
            total_successes: successes,
            total_failures: total - successes,
            success_rate: if total > 0 {
                successes as f64 / total as f64
            } else {
                0.0
            },
            tools_used,
            phases,
        })
    }

    fn read_all(&self) -> std::io::Result<Vec<AuditEntry>> {
        let Some(bytes) = persist::read_locked(&self.log_file)? else {
            return Ok(Vec::new());
        };
        let content = String::from_utf8_lossy(&bytes);
        // Malformed lines are skipped, not fatal: the log must stay
        // queryable even if one write was interrupted by a crash.
        Ok(content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect())
    }
}

fn truncate_str(s: &str) -> String {
    if s.chars().count() > PAYLOAD_TRUNCATE_CHARS {
        let truncated: String = s.chars().take(PAYLOAD_TRUNCATE_CHARS).collect();
        format!("{truncated}… [truncated]")
    } else {
        s.to_string()
    }
}

/// Recursively truncate long string values inside a result payload.
fn truncate_payload(value: Value) -> Value {
    match value {
        Value::String(s) => Value::String(truncate_str(&s)),
        Value::Array(items) => Value::Array(items.into_iter().map(truncate_payload).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, truncate_payload(v)))
                .collect(),
        ),
        other => other,
    }
}
