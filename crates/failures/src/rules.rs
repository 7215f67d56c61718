//! Ordered (predicate, suggestion) rules applied to failed tasks.
//!
//! Rules are evaluated top to bottom; the first match wins. A YAML rule file
//! replaces the built-in list entirely:
//!
//! ```yaml
//! rules:
//!   - id: solver-diverged
//!     when:
//!       any:
//!         - message_contains: "diverged"
//!         - message_word: inf
//!         - kind: FloatingPointError
//!     suggestion: "Reduce the integration step size."
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use taskhub_core::{CANCELLATION_TIMEOUT, TASK_TIMEOUT, WORKER_PANIC};

use crate::error::FailureError;

/// Condition over a failure's error kind and message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    /// Exact error kind.
    Kind(String),
    /// Case-insensitive substring of the message.
    MessageContains(String),
    /// Case-insensitive whole word of the message. Words are split on any
    /// non-alphanumeric character, so `nan` matches "got NaN" and
    /// "nan_mask" but not "resonance".
    MessageWord(String),
    All(Vec<Predicate>),
    Any(Vec<Predicate>),
}

impl Predicate {
    pub fn matches(&self, kind: &str, message: &str) -> bool {
        match self {
            Predicate::Kind(k) => k == kind,
            Predicate::MessageContains(needle) => {
                message.to_lowercase().contains(&needle.to_lowercase())
            }
            Predicate::MessageWord(word) => message
                .split(|c: char| !c.is_alphanumeric())
                .any(|token| token.eq_ignore_ascii_case(word)),
            Predicate::All(preds) => preds.iter().all(|p| p.matches(kind, message)),
            Predicate::Any(preds) => preds.iter().any(|p| p.matches(kind, message)),
        }
    }

    fn validate(&self) -> Result<(), String> {
        match self {
            Predicate::Kind(s) | Predicate::MessageContains(s) if s.is_empty() => {
                Err("empty predicate value".into())
            }
            Predicate::MessageWord(w) if w.is_empty() || !w.chars().all(char::is_alphanumeric) => {
                Err(format!("'{w}' is not a single word"))
            }
            Predicate::All(preds) | Predicate::Any(preds) if preds.is_empty() => {
                Err("empty combinator".into())
            }
            Predicate::All(preds) | Predicate::Any(preds) => {
                preds.iter().try_for_each(Predicate::validate)
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuggestionRule {
    pub id: String,
    pub when: Predicate,
    pub suggestion: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuggestionRules {
    pub rules: Vec<SuggestionRule>,
}

fn kind(k: &str) -> Predicate {
    Predicate::Kind(k.to_string())
}

fn contains(s: &str) -> Predicate {
    Predicate::MessageContains(s.to_string())
}

fn word(w: &str) -> Predicate {
    Predicate::MessageWord(w.to_string())
}

fn rule(id: &str, when: Predicate, suggestion: &str) -> SuggestionRule {
    SuggestionRule {
        id: id.to_string(),
        when,
        suggestion: suggestion.to_string(),
    }
}

impl Default for SuggestionRules {
    fn default() -> Self {
        Self::builtin()
    }
}

impl SuggestionRules {
    pub fn new(rules: Vec<SuggestionRule>) -> Self {
        Self { rules }
    }

    /// Rules shipped with the hub, covering scheduler-synthesized failures and
    /// the usual numeric-handler failure modes.
    pub fn builtin() -> Self {
        Self::new(vec![
            rule(
                "cancellation-timeout",
                kind(CANCELLATION_TIMEOUT),
                "The handler ignored cancellation. Poll is_cancelled() inside long loops so it stops within the grace period.",
            ),
            rule(
                "task-timeout",
                kind(TASK_TIMEOUT),
                "The task exceeded its execution limit. Reduce the problem size or raise TASKHUB_TASK_TIMEOUT_SECS.",
            ),
            rule(
                "worker-panic",
                kind(WORKER_PANIC),
                "The handler panicked. Check the traceback for the failing assertion or index.",
            ),
            rule(
                "out-of-memory",
                Predicate::Any(vec![kind("MemoryError"), contains("out of memory"), contains("allocation failed")]),
                "The computation ran out of memory. Lower the grid resolution or batch size.",
            ),
            rule(
                "no-convergence",
                Predicate::Any(vec![contains("did not converge"), contains("convergence")]),
                "Increase the iteration limit or relax the convergence tolerance.",
            ),
            rule(
                "numerical-instability",
                Predicate::Any(vec![
                    kind("FloatingPointError"),
                    kind("OverflowError"),
                    kind("ZeroDivisionError"),
                    word("nan"),
                    contains("overflow"),
                    contains("singular"),
                    contains("diverge"),
                ]),
                "Numerical instability detected. Reduce the step size or tighten tolerances.",
            ),
            rule(
                "missing-backend",
                Predicate::Any(vec![kind("ImportError"), kind("ModuleNotFoundError"), contains("not available")]),
                "A required backend is unavailable. Install it or select a different backend in the parameters.",
            ),
            rule(
                "bad-parameters",
                Predicate::Any(vec![kind("ValueError"), kind("KeyError"), kind("TypeError"), contains("parameter")]),
                "Check the submitted parameters against the handler's expected inputs.",
            ),
        ])
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, FailureError> {
        let rules: Self = serde_yaml::from_str(yaml)?;
        rules.validate()?;
        Ok(rules)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, FailureError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&content)
    }

    fn validate(&self) -> Result<(), FailureError> {
        for r in &self.rules {
            if r.suggestion.trim().is_empty() {
                return Err(FailureError::InvalidRule {
                    id: r.id.clone(),
                    reason: "empty suggestion".into(),
                });
            }
            r.when.validate().map_err(|reason| FailureError::InvalidRule {
                id: r.id.clone(),
                reason,
            })?;
        }
        Ok(())
    }

    /// The first matching rule, if any.
    pub fn first_match(&self, kind: &str, message: &str) -> Option<&SuggestionRule> {
        self.rules.iter().find(|r| r.when.matches(kind, message))
    }

    /// Suggestions for a failure: the first matching rule's, or none.
    pub fn suggest(&self, kind: &str, message: &str) -> Vec<String> {
        self.first_match(kind, message)
            .map(|r| vec![r.suggestion.clone()])
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_match_wins() {
        let rules = SuggestionRules::new(vec![
            rule("a", contains("bad"), "first"),
            rule("b", kind("ValueError"), "second"),
        ]);
        assert_eq!(rules.suggest("ValueError", "bad parameter"), vec!["first".to_string()]);
        assert_eq!(rules.suggest("ValueError", "other"), vec!["second".to_string()]);
        assert!(rules.suggest("IOError", "disk").is_empty());
    }

    #[test]
    fn builtin_covers_scheduler_kinds() {
        let rules = SuggestionRules::builtin();
        assert_eq!(
            rules.first_match(CANCELLATION_TIMEOUT, "x").map(|r| r.id.as_str()),
            Some("cancellation-timeout")
        );
        assert_eq!(
            rules.first_match("ValueError", "bad parameter").map(|r| r.id.as_str()),
            Some("bad-parameters")
        );
        assert_eq!(
            rules.first_match("RuntimeError", "Solver produced NaN at step 40").map(|r| r.id.as_str()),
            Some("numerical-instability")
        );
    }

    #[test]
    fn message_match_is_case_insensitive() {
        let p = contains("Out Of Memory");
        assert!(p.matches("Error", "CUDA OUT OF MEMORY"));
        assert!(!p.matches("Error", "fine"));
    }

    #[test]
    fn nan_is_matched_as_a_word() {
        let rules = SuggestionRules::builtin();
        let id = |kind: &str, message: &str| rules.first_match(kind, message).map(|r| r.id.clone());

        assert_eq!(id("ValueError", "invalid resonance parameter").as_deref(), Some("bad-parameters"));
        assert_eq!(id("KeyError", "missing key 'dominant_mode'").as_deref(), Some("bad-parameters"));
        assert_eq!(id("ValueError", "bad parameter: tenant_id").as_deref(), Some("bad-parameters"));

        assert_eq!(id("RuntimeError", "residual is nan").as_deref(), Some("numerical-instability"));
        assert_eq!(id("RuntimeError", "nan_mask has 3 entries").as_deref(), Some("numerical-instability"));
    }

    #[test]
    fn message_word_rejects_phrases() {
        let yaml = r#"
rules:
  - id: phrase
    when:
      message_word: "out of memory"
    suggestion: never
"#;
        assert!(matches!(
            SuggestionRules::from_yaml_str(yaml),
            Err(FailureError::InvalidRule { .. })
        ));
    }

    #[test]
    fn combinators() {
        let p = Predicate::All(vec![kind("ValueError"), contains("grid")]);
        assert!(p.matches("ValueError", "grid too small"));
        assert!(!p.matches("ValueError", "mesh too small"));
        assert!(!p.matches("KeyError", "grid too small"));
    }

    #[test]
    fn parse_yaml() {
        let yaml = r#"
rules:
  - id: diverged
    when:
      any:
        - message_contains: diverged
        - kind: FloatingPointError
    suggestion: Reduce the step size.
  - id: grid
    when:
      kind: ValueError
    suggestion: Check the grid.
"#;
        let rules = SuggestionRules::from_yaml_str(yaml).unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules.suggest("X", "RK4 diverged"), vec!["Reduce the step size.".to_string()]);
    }

    #[test]
    fn reject_invalid_yaml_rules() {
        let yaml = r#"
rules:
  - id: empty
    when:
      any: []
    suggestion: never
"#;
        assert!(matches!(
            SuggestionRules::from_yaml_str(yaml),
            Err(FailureError::InvalidRule { .. })
        ));
    }
}
