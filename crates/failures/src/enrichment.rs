use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::record::FailureRecord;
use crate::recorder::FailureRecorder;

/// Slow, optional source of extra suggestions for a recorded failure
/// (an LLM call, a knowledge-base lookup, ...).
///
/// Runs off the critical path: the `task_error` event has already been
/// published with rule suggestions by the time `enrich` is called.
#[async_trait]
pub trait SuggestionEnricher: Send + Sync {
    fn name(&self) -> &str;

    async fn enrich(&self, record: &FailureRecord) -> anyhow::Result<Vec<String>>;
}

/// Run `enricher` in the background and append its output to the ledger.
/// Enrichment errors are logged and otherwise ignored.
pub fn spawn_enrichment(
    recorder: Arc<FailureRecorder>,
    enricher: Arc<dyn SuggestionEnricher>,
    record: FailureRecord,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        match enricher.enrich(&record).await {
            Ok(suggestions) => {
                let added = suggestions.len();
                if recorder
                    .append_suggestions(record.task_id, record.timestamp, suggestions)
                    .is_some()
                {
                    debug!(task_id = %record.task_id, enricher = enricher.name(), added, "failure enriched");
                }
            }
            Err(e) => {
                warn!(task_id = %record.task_id, enricher = enricher.name(), error = %e, "enrichment failed");
            }
        }
    })
}
