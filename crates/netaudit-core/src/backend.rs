//! Analysis backend boundary
//!
//! The backend is a black box with two operations per target: a slow,
//! fire-and-forget start call and an idempotent status read. The polling
//! layer only sees the status half, through [`StatusFetcher`].

use crate::error::BackendError;
use crate::types::{AnalysisKind, AnalysisStatus, AnalysisTarget, ResourceId};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Remote analysis service
#[async_trait]
pub trait AnalysisBackend: Send + Sync {
    /// Kick off an analysis; may outlive the client-side deadline
    async fn start_analysis(&self, target: &AnalysisTarget) -> Result<(), BackendError>;

    /// Current result for a target; safe to call repeatedly
    async fn get_analysis_status(
        &self,
        target: &AnalysisTarget,
    ) -> Result<AnalysisStatus, BackendError>;
}

/// Status source polled by a session
#[async_trait]
pub trait StatusFetcher: Send + Sync {
    /// Fetch the current status of `resource`
    async fn fetch_status(&self, resource: &ResourceId) -> Result<AnalysisStatus, BackendError>;
}

/// Adapts an [`AnalysisBackend`] into a [`StatusFetcher`] for one kind
pub struct BackendFetcher {
    backend: Arc<dyn AnalysisBackend>,
    kind: AnalysisKind,
}

impl BackendFetcher {
    /// Fetch `kind` results from `backend`
    #[inline]
    #[must_use]
    pub fn new(backend: Arc<dyn AnalysisBackend>, kind: AnalysisKind) -> Self {
        Self { backend, kind }
    }
}

impl std::fmt::Debug for BackendFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendFetcher")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl StatusFetcher for BackendFetcher {
    async fn fetch_status(&self, resource: &ResourceId) -> Result<AnalysisStatus, BackendError> {
        let target = AnalysisTarget::new(self.kind, resource.clone())
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        self.backend.get_analysis_status(&target).await
    }
}

/// Issue the start call with a client-side deadline
///
/// Deadline expiry maps to [`BackendError::Timeout`].
pub async fn start_with_timeout(
    backend: &dyn AnalysisBackend,
    target: &AnalysisTarget,
    timeout: Duration,
) -> Result<(), BackendError> {
    match tokio::time::timeout(timeout, backend.start_analysis(target)).await {
        Ok(result) => result,
        Err(_) => Err(BackendError::Timeout),
    }
}

/// Race an initial "last saved result" read against a deadline
///
/// A slow or failing read degrades to `None` (the empty state) instead of
/// surfacing an error.
pub async fn load_latest_with_deadline<T, F>(read: F, deadline: Duration) -> Option<T>
where
    F: Future<Output = Result<Option<T>, BackendError>>,
{
    match tokio::time::timeout(deadline, read).await {
        Ok(Ok(value)) => value,
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "initial result load failed, showing empty state");
            None
        }
        Err(_) => {
            tracing::warn!(
                deadline_ms = u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX),
                "initial result load timed out, showing empty state"
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct SlowBackend;

    #[async_trait]
    impl AnalysisBackend for SlowBackend {
        async fn start_analysis(&self, _target: &AnalysisTarget) -> Result<(), BackendError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }

        async fn get_analysis_status(
            &self,
            _target: &AnalysisTarget,
        ) -> Result<AnalysisStatus, BackendError> {
            Ok(AnalysisStatus::ready(json!({ "kind": "slow" })))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn start_timeout_maps_to_timeout_error() {
        let target =
            AnalysisTarget::new(AnalysisKind::Topology, ResourceId::project("P1")).unwrap();
        let result = start_with_timeout(&SlowBackend, &target, Duration::from_secs(5)).await;
        assert_eq!(result, Err(BackendError::Timeout));
    }

    #[tokio::test]
    async fn backend_fetcher_builds_target_from_kind() {
        let fetcher = BackendFetcher::new(Arc::new(SlowBackend), AnalysisKind::NetworkOverview);
        let status = fetcher
            .fetch_status(&ResourceId::project("P1"))
            .await
            .unwrap();
        assert!(status.is_ready());

        // device resource does not fit a project-scoped kind
        let err = fetcher.fetch_status(&ResourceId::device("P1", "SW1")).await;
        assert!(matches!(err, Err(BackendError::Transport(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_load_degrades_to_empty() {
        let read = async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Some(json!({ "late": true })))
        };
        let loaded = load_latest_with_deadline(read, Duration::from_secs(10)).await;
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn failed_load_degrades_to_empty() {
        let read = async { Err::<Option<i32>, _>(BackendError::ConnectionReset) };
        assert!(load_latest_with_deadline(read, Duration::from_secs(1))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn fast_load_returns_value() {
        let read = async { Ok(Some(7)) };
        assert_eq!(
            load_latest_with_deadline(read, Duration::from_secs(1)).await,
            Some(7)
        );
    }
}
