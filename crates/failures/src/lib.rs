//! Failure records for tasks that end in error.
//!
//! A failure is recorded once, with rule-based suggestions attached
//! synchronously. Optional enrichers add more suggestions later.

pub mod enrichment;
pub mod error;
pub mod record;
pub mod recorder;
pub mod rules;

pub use enrichment::{spawn_enrichment, SuggestionEnricher};
pub use error::FailureError;
pub use record::{truncate_traceback, FailureRecord};
pub use recorder::FailureRecorder;
pub use rules::{Predicate, SuggestionRule, SuggestionRules};
