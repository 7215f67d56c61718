use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TaskHubError};

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_parse<T: std::str::FromStr>(profile: &str, key: &str, default: T) -> T {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_bool(profile: &str, key: &str, default: bool) -> bool {
    match profiled_env_opt(profile, key).as_deref() {
        Some("1") | Some("true") | Some("yes") => true,
        Some("0") | Some("false") | Some("no") => false,
        _ => default,
    }
}

// ── Defaults ──────────────────────────────────────────────────

fn default_max_concurrency() -> usize { 0 }
fn default_max_queued() -> usize { 1000 }
fn default_cancel_grace_ms() -> u64 { 5000 }
fn default_subscriber_buffer() -> usize { 10_000 }
fn default_retention() -> usize { 1024 }
fn default_finished_retention() -> usize { 64 }
fn default_data_dir() -> PathBuf { PathBuf::from("data") }
fn default_persist_failures() -> bool { true }
fn default_traceback_lines() -> usize { 40 }

// ── Top-level config ──────────────────────────────────────────

/// Runtime configuration for a task hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskHubConfig {
    /// Active profile name (empty = default).
    #[serde(default)]
    pub profile: String,
    /// Number of worker slots. 0 = available parallelism.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Admission bound on Queued + Running tasks.
    #[serde(default = "default_max_queued")]
    pub max_queued: usize,
    /// How long a cancelled handler may keep running before its slot is reclaimed.
    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,
    /// Optional wall-clock limit per task execution.
    #[serde(default)]
    pub task_timeout_secs: Option<u64>,
    /// Per-subscriber event buffer capacity.
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
    /// Events kept per task for cursor-based resume.
    #[serde(default = "default_retention")]
    pub retention_per_task: usize,
    /// Events kept per task once it has finished (its terminal event included).
    #[serde(default = "default_finished_retention")]
    pub finished_retention: usize,
    /// Where failure records are persisted.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_persist_failures")]
    pub persist_failures: bool,
    /// YAML file with suggestion rules; built-in rules when unset.
    #[serde(default)]
    pub suggestion_rules_path: Option<PathBuf>,
    /// Tracebacks longer than this are truncated in failure records.
    #[serde(default = "default_traceback_lines")]
    pub traceback_max_lines: usize,
}

impl Default for TaskHubConfig {
    fn default() -> Self {
        Self {
            profile: String::new(),
            max_concurrency: default_max_concurrency(),
            max_queued: default_max_queued(),
            cancel_grace_ms: default_cancel_grace_ms(),
            task_timeout_secs: None,
            subscriber_buffer: default_subscriber_buffer(),
            retention_per_task: default_retention(),
            finished_retention: default_finished_retention(),
            data_dir: default_data_dir(),
            persist_failures: default_persist_failures(),
            suggestion_rules_path: None,
            traceback_max_lines: default_traceback_lines(),
        }
    }
}

impl TaskHubConfig {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `TASKHUB_PROFILE`. When set (e.g. `PROD`), every
    /// key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("TASKHUB_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        Self {
            profile: p.to_string(),
            max_concurrency: profiled_env_parse(p, "TASKHUB_MAX_CONCURRENCY", default_max_concurrency()),
            max_queued: profiled_env_parse(p, "TASKHUB_MAX_QUEUED", default_max_queued()),
            cancel_grace_ms: profiled_env_parse(p, "TASKHUB_CANCEL_GRACE_MS", default_cancel_grace_ms()),
            task_timeout_secs: profiled_env_opt(p, "TASKHUB_TASK_TIMEOUT_SECS").and_then(|v| v.parse().ok()),
            subscriber_buffer: profiled_env_parse(p, "TASKHUB_SUBSCRIBER_BUFFER", default_subscriber_buffer()),
            retention_per_task: profiled_env_parse(p, "TASKHUB_RETENTION", default_retention()),
            finished_retention: profiled_env_parse(p, "TASKHUB_FINISHED_RETENTION", default_finished_retention()),
            data_dir: profiled_env_opt(p, "TASKHUB_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(default_data_dir),
            persist_failures: profiled_env_bool(p, "TASKHUB_PERSIST_FAILURES", default_persist_failures()),
            suggestion_rules_path: profiled_env_opt(p, "TASKHUB_SUGGESTION_RULES").map(PathBuf::from),
            traceback_max_lines: profiled_env_parse(p, "TASKHUB_TRACEBACK_MAX_LINES", default_traceback_lines()),
        }
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Reject values the scheduler cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_queued == 0 {
            return Err(TaskHubError::Config("max_queued must be at least 1".into()));
        }
        if self.subscriber_buffer == 0 {
            return Err(TaskHubError::Config("subscriber_buffer must be at least 1".into()));
        }
        Ok(())
    }

    /// Resolve worker slot count (0 means use available parallelism).
    pub fn resolved_concurrency(&self) -> usize {
        if self.max_concurrency == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        } else {
            self.max_concurrency
        }
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout_secs.map(Duration::from_secs)
    }

    pub fn failures_path(&self) -> PathBuf {
        self.data_dir.join("failures.jsonl")
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!("  workers:     concurrency={}, max_queued={}", self.resolved_concurrency(), self.max_queued);
        tracing::info!("  cancel:      grace={}ms, timeout={:?}", self.cancel_grace_ms, self.task_timeout_secs);
        tracing::info!(
            "  events:      buffer={}, retention={}, finished_retention={}",
            self.subscriber_buffer,
            self.retention_per_task,
            self.finished_retention
        );
        tracing::info!(
            "  failures:    data_dir={}, persist={}, rules={}",
            self.data_dir.display(),
            self.persist_failures,
            self.suggestion_rules_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "(built-in)".into())
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = TaskHubConfig::default();
        assert_eq!(config.max_queued, 1000);
        assert_eq!(config.subscriber_buffer, 10_000);
        assert_eq!(config.finished_retention, 64);
        assert_eq!(config.cancel_grace(), Duration::from_secs(5));
        assert!(config.task_timeout().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn resolved_concurrency() {
        let mut config = TaskHubConfig::default();
        // 0 means auto-detect
        assert!(config.resolved_concurrency() > 0);

        config.max_concurrency = 3;
        assert_eq!(config.resolved_concurrency(), 3);
    }

    #[test]
    fn validate_rejects_zero_bounds() {
        let config = TaskHubConfig { max_queued: 0, ..Default::default() };
        assert!(matches!(config.validate(), Err(TaskHubError::Config(_))));

        let config = TaskHubConfig { subscriber_buffer: 0, ..Default::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn deserialize_fills_defaults() {
        let config: TaskHubConfig = serde_json::from_str(r#"{"max_concurrency": 2}"#).unwrap();
        assert_eq!(config.max_concurrency, 2);
        assert_eq!(config.max_queued, 1000);
        assert_eq!(config.finished_retention, 64);
        assert_eq!(config.failures_path(), PathBuf::from("data").join("failures.jsonl"));
    }

    #[test]
    fn profiled_lookup_prefers_prefix() {
        // Unique key names keep this test independent of the process environment.
        env::set_var("TASKHUB_TEST_UNIQ_KEY", "1");
        env::set_var("QA_TASKHUB_TEST_UNIQ_KEY", "2");
        assert_eq!(profiled_env_opt("QA", "TASKHUB_TEST_UNIQ_KEY").as_deref(), Some("2"));
        assert_eq!(profiled_env_opt("", "TASKHUB_TEST_UNIQ_KEY").as_deref(), Some("1"));
        assert_eq!(profiled_env_parse("QA", "TASKHUB_TEST_MISSING", 9usize), 9);
    }
}
