//! Testing utilities for netaudit workspace
//!
//! Shared test helpers, fixtures, and assertions.

#![allow(missing_docs)]

use async_trait::async_trait;
use netaudit_core::{
    AnalysisStatus, BackendError, Callbacks, MemoryFlagStore, Outcome, ResourceId,
    SchedulerConfig, SchedulerServices, SimulatedBackend, StatusFetcher,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Poll interval used by test fixtures
pub const TEST_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Config with a short interval and timeouts
pub fn fast_config() -> SchedulerConfig {
    SchedulerConfig::new()
        .with_poll_interval(TEST_POLL_INTERVAL)
        .with_start_timeout(Duration::from_millis(500))
        .with_load_deadline(Duration::from_millis(500))
}

/// Services over an in-memory flag store and the given backend
pub fn test_services(backend: Arc<SimulatedBackend>) -> SchedulerServices {
    SchedulerServices::new(Arc::new(MemoryFlagStore::new()), backend, fast_config())
}

/// Let `n` poll intervals pass (use under `start_paused = true`)
pub async fn advance_polls(n: u32) {
    tokio::time::sleep(TEST_POLL_INTERVAL * n + TEST_POLL_INTERVAL / 2).await;
}

/// Callback pair that records every outcome it sees
#[derive(Debug, Clone, Default)]
pub struct RecordingCallbacks {
    outcomes: Arc<Mutex<Vec<Outcome>>>,
}

impl RecordingCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn callbacks(&self) -> Callbacks {
        let (ok, err) = (self.outcomes.clone(), self.outcomes.clone());
        Callbacks::new(
            move |payload| ok.lock().push(Outcome::Success(payload.clone())),
            move |message| err.lock().push(Outcome::Failure(message.to_string())),
        )
    }

    pub fn outcomes(&self) -> Vec<Outcome> {
        self.outcomes.lock().clone()
    }

    pub fn successes(&self) -> usize {
        self.outcomes.lock().iter().filter(|o| o.is_success()).count()
    }

    pub fn errors(&self) -> usize {
        self.outcomes.lock().iter().filter(|o| !o.is_success()).count()
    }

    pub fn count(&self) -> usize {
        self.outcomes.lock().len()
    }
}

/// Fetcher that replays a fixed list of answers, then keeps saying `Empty`
#[derive(Debug, Default)]
pub struct ScriptedFetcher {
    answers: Mutex<VecDeque<Result<AnalysisStatus, BackendError>>>,
    calls: AtomicUsize,
}

impl ScriptedFetcher {
    pub fn new(answers: impl IntoIterator<Item = Result<AnalysisStatus, BackendError>>) -> Self {
        Self {
            answers: Mutex::new(answers.into_iter().collect()),
            calls: AtomicUsize::new(0),
        }
    }

    /// `empties` not-ready answers then `payload`
    pub fn ready_after(empties: usize, payload: serde_json::Value) -> Self {
        Self::new(
            std::iter::repeat_with(|| Ok(AnalysisStatus::Empty))
                .take(empties)
                .chain(std::iter::once(Ok(AnalysisStatus::ready(payload)))),
        )
    }

    /// `empties` not-ready answers then a failed check
    pub fn fail_after(empties: usize, error: BackendError) -> Self {
        Self::new(
            std::iter::repeat_with(|| Ok(AnalysisStatus::Empty))
                .take(empties)
                .chain(std::iter::once(Err(error))),
        )
    }

    /// Never ready
    pub fn pending_forever() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StatusFetcher for ScriptedFetcher {
    async fn fetch_status(&self, _resource: &ResourceId) -> Result<AnalysisStatus, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.answers
            .lock()
            .pop_front()
            .unwrap_or(Ok(AnalysisStatus::Empty))
    }
}
