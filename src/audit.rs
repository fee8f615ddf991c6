//! Fire-and-forget analysis-log recording. The pipeline must never block (or
//! fail) a user-facing response waiting on a database write, so every
//! completed or failed analysis is handed off through an unbounded channel
//! to a single background task that owns the actual `Store` write. This
//! mirrors the teacher's detached `tokio::spawn` workers in
//! `wallet_analytics_polling` — a channel/task pair the caller fires into
//! and never awaits.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::warn;

use crate::prompt::AnalysisKind;
use crate::store::Store;

/// One analysis's audit record, built by [`crate::pipeline::AnalysisPipeline`]
/// and handed off without waiting for the write to land.
#[derive(Debug, Clone)]
pub struct AuditItem {
    pub user_id: i64,
    pub kind: AnalysisKind,
    pub success: bool,
    pub processing_ms: i64,
    pub error: Option<String>,
    pub user_tier: String,
    pub price_at_request: Option<f64>,
}

/// Consecutive-failure threshold past which the recorder starts warning
/// loudly; a single flaky write is expected, a run of them means the
/// database itself is the problem.
const WARN_AFTER_CONSECUTIVE_FAILURES: u32 = 5;

#[derive(Clone)]
pub struct AuditHandle {
    tx: UnboundedSender<AuditItem>,
}

impl AuditHandle {
    /// Queues the item for recording. Dropped silently if the recorder task
    /// has already shut down — audit logging is explicitly best-effort per
    /// the data model, never a reason to fail the caller's response.
    pub fn log(&self, item: AuditItem) {
        let _ = self.tx.send(item);
    }
}

/// Spawns the background recorder and returns a cloneable handle to it. The
/// task runs until every `AuditHandle` clone (and the one returned here) is
/// dropped, at which point the channel closes and the loop exits.
pub fn spawn_recorder(store: Arc<Store>) -> AuditHandle {
    let (tx, mut rx) = mpsc::unbounded_channel::<AuditItem>();

    tokio::spawn(async move {
        let consecutive_failures = AtomicU32::new(0);
        while let Some(item) = rx.recv().await {
            let log_result = store.insert_analysis_log(
                item.user_id,
                item.kind,
                item.success,
                item.processing_ms,
                item.error.as_deref(),
                &item.user_tier,
                item.price_at_request,
            );

            let summary_result = store.record_daily_summary_sample(
                item.user_id,
                Utc::now().date_naive(),
                item.kind,
                item.success,
                item.processing_ms,
            );

            if log_result.is_err() || summary_result.is_err() {
                let failures = consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                if failures >= WARN_AFTER_CONSECUTIVE_FAILURES {
                    warn!(
                        failures,
                        "audit recorder has failed to write several analyses in a row"
                    );
                }
            } else {
                consecutive_failures.store(0, Ordering::Relaxed);
            }
        }
    });

    AuditHandle { tx }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt::AnalysisKind;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn logged_item_lands_in_store() {
        let file = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(file.path().to_str().unwrap()).unwrap());
        let handle = spawn_recorder(store.clone());

        handle.log(AuditItem {
            user_id: 1000,
            kind: AnalysisKind::Quick,
            success: true,
            processing_ms: 42,
            error: None,
            user_tier: "basic".to_string(),
            price_at_request: Some(3300.0),
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        let (logs, total) = store.list_logs(1, 10, Some(1000)).unwrap();
        assert_eq!(total, 1);
        assert_eq!(logs[0].processing_ms, 42);
    }

    #[tokio::test]
    async fn dropped_handle_does_not_panic_recorder() {
        let file = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(file.path().to_str().unwrap()).unwrap());
        let handle = spawn_recorder(store.clone());
        drop(handle);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
