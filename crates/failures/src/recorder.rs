//! Append-only failure ledger.
//!
//! Every failure and every later enrichment is one JSON line in
//! `{data_dir}/failures.jsonl`. Records are keyed by `(task_id, timestamp)`;
//! writing the same key twice is a no-op, so a retried write after a crash
//! cannot duplicate a record.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use taskhub_core::{HandlerError, Parameters, TaskHubConfig, TaskId};

use crate::error::FailureError;
use crate::record::{truncate_traceback, FailureRecord};
use crate::rules::SuggestionRules;

/// One line of the ledger file.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "entry", rename_all = "snake_case")]
enum LedgerEntry {
    Failure(FailureRecord),
    Enrichment {
        task_id: TaskId,
        timestamp: DateTime<Utc>,
        suggestions: Vec<String>,
    },
}

/// Persists failure records and attaches rule-based suggestions.
pub struct FailureRecorder {
    path: Option<PathBuf>,
    file: Mutex<Option<File>>,
    records: RwLock<Vec<FailureRecord>>,
    rules: SuggestionRules,
    traceback_max_lines: usize,
}

impl FailureRecorder {
    /// Recorder that keeps records in memory only.
    pub fn in_memory(rules: SuggestionRules) -> Self {
        Self {
            path: None,
            file: Mutex::new(None),
            records: RwLock::new(Vec::new()),
            rules,
            traceback_max_lines: 40,
        }
    }

    /// Open (or create) a ledger file, replaying any existing entries.
    pub fn open(path: impl AsRef<Path>, rules: SuggestionRules) -> Result<Self, FailureError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let records = if path.exists() {
            Self::replay(&path)?
        } else {
            Vec::new()
        };
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        info!(path = %path.display(), records = records.len(), "failure ledger opened");

        Ok(Self {
            path: Some(path),
            file: Mutex::new(Some(file)),
            records: RwLock::new(records),
            rules,
            traceback_max_lines: 40,
        })
    }

    /// Build a recorder from hub config: rules from YAML if configured,
    /// persistence under `data_dir` unless disabled.
    pub fn from_config(config: &TaskHubConfig) -> Result<Self, FailureError> {
        let rules = match &config.suggestion_rules_path {
            Some(path) => SuggestionRules::from_file(path)?,
            None => SuggestionRules::builtin(),
        };
        let recorder = if config.persist_failures {
            Self::open(config.failures_path(), rules)?
        } else {
            Self::in_memory(rules)
        };
        Ok(recorder.with_traceback_limit(config.traceback_max_lines))
    }

    pub fn with_traceback_limit(mut self, max_lines: usize) -> Self {
        self.traceback_max_lines = max_lines;
        self
    }

    fn replay(path: &Path) -> Result<Vec<FailureRecord>, FailureError> {
        let reader = BufReader::new(File::open(path)?);
        let mut records: Vec<FailureRecord> = Vec::new();
        let mut index: HashMap<(TaskId, DateTime<Utc>), usize> = HashMap::new();
        for (lineno, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LedgerEntry>(&line) {
                Ok(LedgerEntry::Failure(record)) => {
                    if let Entry::Vacant(slot) = index.entry(record.key()) {
                        slot.insert(records.len());
                        records.push(record);
                    }
                }
                Ok(LedgerEntry::Enrichment { task_id, timestamp, suggestions }) => {
                    if let Some(&i) = index.get(&(task_id, timestamp)) {
                        records[i].suggestions.extend(suggestions);
                    }
                }
                Err(e) => {
                    // A torn final line from a crash mid-write is expected.
                    warn!(path = %path.display(), line = lineno + 1, error = %e, "skipping unreadable ledger line");
                }
            }
        }
        Ok(records)
    }

    fn append_line(&self, entry: &LedgerEntry) {
        let mut guard = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(file) = guard.as_mut() else {
            return;
        };
        let result = serde_json::to_string(entry)
            .map_err(FailureError::from)
            .and_then(|mut line| {
                line.push('\n');
                file.write_all(line.as_bytes())?;
                file.flush()?;
                Ok(())
            });
        if let Err(e) = result {
            let path = self.path.as_deref().unwrap_or_else(|| Path::new("(memory)"));
            warn!(path = %path.display(), error = %e, "failed to persist failure ledger entry");
        }
    }

    /// Record a failure. Suggestions come from the first matching rule.
    ///
    /// Idempotent per `(task_id, timestamp)`: a repeated call returns the
    /// existing record without writing again.
    pub fn record(
        &self,
        task_id: TaskId,
        task_type: &str,
        parameters: &Parameters,
        error: &HandlerError,
        timestamp: DateTime<Utc>,
    ) -> FailureRecord {
        let record = {
            let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
            if let Some(existing) = records.iter().find(|r| r.key() == (task_id, timestamp)) {
                debug!(task_id = %task_id, "failure already recorded");
                return existing.clone();
            }
            let record = FailureRecord {
                task_id,
                task_type: task_type.to_string(),
                timestamp,
                error_kind: error.kind.clone(),
                message: error.message.clone(),
                parameters: parameters.clone(),
                traceback: error
                    .traceback
                    .as_deref()
                    .map(|tb| truncate_traceback(tb, self.traceback_max_lines)),
                suggestions: self.rules.suggest(&error.kind, &error.message),
            };
            records.push(record.clone());
            record
        };

        // The index lock is released before touching the disk.
        self.append_line(&LedgerEntry::Failure(record.clone()));
        info!(
            task_id = %task_id,
            error_kind = %record.error_kind,
            suggestions = record.suggestions.len(),
            "failure recorded"
        );
        record
    }

    /// Append enrichment suggestions to an existing record.
    pub fn append_suggestions(
        &self,
        task_id: TaskId,
        timestamp: DateTime<Utc>,
        suggestions: Vec<String>,
    ) -> Option<FailureRecord> {
        if suggestions.is_empty() {
            return self.get(task_id);
        }
        let updated = {
            let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
            let record = records.iter_mut().find(|r| r.key() == (task_id, timestamp))?;
            record.suggestions.extend(suggestions.iter().cloned());
            record.clone()
        };
        self.append_line(&LedgerEntry::Enrichment {
            task_id,
            timestamp,
            suggestions,
        });
        Some(updated)
    }

    /// Most recently recorded failure.
    pub fn most_recent(&self) -> Option<FailureRecord> {
        self.read().iter().max_by_key(|r| r.timestamp).cloned()
    }

    pub fn by_kind(&self, error_kind: &str) -> Vec<FailureRecord> {
        self.read()
            .iter()
            .filter(|r| r.error_kind == error_kind)
            .cloned()
            .collect()
    }

    pub fn get(&self, task_id: TaskId) -> Option<FailureRecord> {
        self.read().iter().rev().find(|r| r.task_id == task_id).cloned()
    }

    pub fn all(&self) -> Vec<FailureRecord> {
        self.read().clone()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn rules(&self) -> &SuggestionRules {
        &self.rules
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<FailureRecord>> {
        self.records.read().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;
    use tempfile::TempDir;

    fn params() -> Parameters {
        let mut p = Parameters::new();
        p.insert("grid".into(), serde_json::json!(64));
        p
    }

    #[test]
    fn record_attaches_first_matching_suggestion() {
        let recorder = FailureRecorder::in_memory(SuggestionRules::builtin());
        let id = TaskId::new();
        let err = HandlerError::new("ValueError", "bad parameter");
        let record = recorder.record(id, "simulate", &params(), &err, Utc::now());

        assert_eq!(record.message, "bad parameter");
        assert_eq!(record.suggestions.len(), 1);
        assert_eq!(record.parameters.get("grid"), Some(&serde_json::json!(64)));
        assert_eq!(recorder.get(id), Some(record));
    }

    #[test]
    fn unmatched_failure_has_no_suggestions() {
        let recorder = FailureRecorder::in_memory(SuggestionRules::new(vec![]));
        let err = HandlerError::new("Weird", "unexpected");
        let record = recorder.record(TaskId::new(), "t", &params(), &err, Utc::now());
        assert!(record.suggestions.is_empty());
    }

    #[test]
    fn record_is_idempotent_per_key() {
        let recorder = FailureRecorder::in_memory(SuggestionRules::builtin());
        let id = TaskId::new();
        let ts = Utc::now();
        let err = HandlerError::new("ValueError", "bad parameter");
        recorder.record(id, "t", &params(), &err, ts);
        recorder.record(id, "t", &params(), &err, ts);
        assert_eq!(recorder.len(), 1);
    }

    #[test]
    fn queries_by_kind_and_recency() {
        let recorder = FailureRecorder::in_memory(SuggestionRules::builtin());
        let t0 = Utc::now();
        let first = TaskId::new();
        let second = TaskId::new();
        recorder.record(first, "t", &params(), &HandlerError::new("ValueError", "a"), t0);
        recorder.record(
            second,
            "t",
            &params(),
            &HandlerError::new("MemoryError", "b"),
            t0 + chrono::Duration::seconds(1),
        );

        assert_eq!(recorder.by_kind("ValueError").len(), 1);
        assert_eq!(recorder.most_recent().map(|r| r.task_id), Some(second));
        assert!(recorder.by_kind("KeyError").is_empty());
    }

    #[test]
    fn traceback_is_truncated() {
        let recorder = FailureRecorder::in_memory(SuggestionRules::builtin()).with_traceback_limit(2);
        let tb = "l1\nl2\nl3\nl4";
        let err = HandlerError::new("E", "m").with_traceback(tb);
        let record = recorder.record(TaskId::new(), "t", &params(), &err, Utc::now());
        assert_eq!(record.traceback.as_deref(), Some("l1\nl2\n... (2 more lines)"));
    }

    #[test]
    fn ledger_survives_reopen_with_enrichment() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("failures.jsonl");
        let id = TaskId::new();
        let ts = Utc::now();
        {
            let recorder = FailureRecorder::open(&path, SuggestionRules::builtin()).unwrap();
            recorder.record(id, "simulate", &params(), &HandlerError::new("ValueError", "bad parameter"), ts);
            recorder.append_suggestions(id, ts, vec!["Try grid=32".into()]).unwrap();
        }

        let reopened = FailureRecorder::open(&path, SuggestionRules::builtin()).unwrap();
        let record = reopened.get(id).unwrap();
        assert_eq!(reopened.len(), 1);
        assert_eq!(record.suggestions.len(), 2);
        assert_eq!(record.suggestions[1], "Try grid=32");
        assert_eq!(record.timestamp, ts);
    }

    #[test]
    fn torn_line_is_skipped_on_replay() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("failures.jsonl");
        let id = TaskId::new();
        {
            let recorder = FailureRecorder::open(&path, SuggestionRules::builtin()).unwrap();
            recorder.record(id, "t", &params(), &HandlerError::new("E", "m"), Utc::now());
        }
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"entry\":\"failure\",\"task_id\":").unwrap();

        let reopened = FailureRecorder::open(&path, SuggestionRules::builtin()).unwrap();
        assert_eq!(reopened.len(), 1);
    }

    #[test]
    fn duplicate_ledger_lines_replay_once() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("failures.jsonl");
        let id = TaskId::new();
        let ts = Utc::now();
        {
            let recorder = FailureRecorder::open(&path, SuggestionRules::builtin()).unwrap();
            recorder.record(id, "t", &params(), &HandlerError::new("ValueError", "bad parameter"), ts);
            recorder.append_suggestions(id, ts, vec!["Halve dt".into()]).unwrap();
        }
        // A retried write after a crash repeats the failure line.
        let contents = std::fs::read_to_string(&path).unwrap();
        let failure_line = contents.lines().next().unwrap().to_string();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "{failure_line}").unwrap();

        let reopened = FailureRecorder::open(&path, SuggestionRules::builtin()).unwrap();
        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened.get(id).unwrap().suggestions.len(), 2);
    }

    #[test]
    fn index_updates_do_not_wait_on_ledger_writes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("failures.jsonl");
        let recorder = FailureRecorder::open(&path, SuggestionRules::builtin()).unwrap();
        let id = TaskId::new();

        // Hold the file while a failure is recorded on another thread.
        let file_guard = recorder.file.lock().unwrap();
        std::thread::scope(|s| {
            let writer = s.spawn(|| {
                recorder.record(id, "t", &params(), &HandlerError::new("E", "slow disk"), Utc::now())
            });
            let deadline = Instant::now() + Duration::from_secs(5);
            while recorder.get(id).is_none() {
                assert!(Instant::now() < deadline, "record stayed invisible while the ledger was busy");
                std::thread::sleep(Duration::from_millis(5));
            }
            assert_eq!(recorder.len(), 1);
            assert!(!writer.is_finished());
            drop(file_guard);
            writer.join().unwrap();
        });

        let reopened = FailureRecorder::open(&path, SuggestionRules::builtin()).unwrap();
        assert_eq!(reopened.get(id).map(|r| r.message), Some("slow disk".to_string()));
    }

    #[test]
    fn from_config_respects_persist_flag() {
        let dir = TempDir::new().unwrap();
        let config = TaskHubConfig {
            data_dir: dir.path().to_path_buf(),
            persist_failures: false,
            ..Default::default()
        };
        let recorder = FailureRecorder::from_config(&config).unwrap();
        assert!(recorder.path().is_none());

        let config = TaskHubConfig { persist_failures: true, ..config };
        let recorder = FailureRecorder::from_config(&config).unwrap();
        assert_eq!(recorder.path(), Some(dir.path().join("failures.jsonl").as_path()));
    }
}
