//! Scripted in-memory analysis backend
//!
//! Each target follows a [`Script`]: a number of "not ready" answers, then a
//! result (or a failed status check). Start calls are recorded and reset the
//! script's counter, the way a real backend starts a fresh run.

use crate::backend::AnalysisBackend;
use crate::error::BackendError;
use crate::types::{AnalysisMetrics, AnalysisStatus, AnalysisTarget, Payload};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;

/// Behaviour of one target
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Script {
    /// `Empty` answers before the terminal one
    pub empties: u32,
    /// Fail the terminal status check instead of returning a result
    pub status_error: Option<BackendError>,
    /// Fail the start call
    pub start_error: Option<BackendError>,
    /// Latency of the start call
    pub start_delay: Duration,
}

impl Script {
    /// Ready after `empties` not-ready answers
    #[inline]
    #[must_use]
    pub fn ready_after(empties: u32) -> Self {
        Self {
            empties,
            ..Self::default()
        }
    }

    /// Fail the status check after `empties` not-ready answers
    #[inline]
    #[must_use]
    pub fn fail_after(empties: u32, error: BackendError) -> Self {
        Self {
            empties,
            status_error: Some(error),
            ..Self::default()
        }
    }

    /// Make the start call fail
    #[inline]
    #[must_use]
    pub fn with_start_error(mut self, error: BackendError) -> Self {
        self.start_error = Some(error);
        self
    }

    /// Delay the start call
    #[inline]
    #[must_use]
    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }
}

#[derive(Debug, Default)]
struct TargetState {
    script: Script,
    status_calls: u32,
}

/// Backend whose answers follow per-target scripts
///
/// Unscripted targets behave like `Script::ready_after(0)`.
#[derive(Debug, Default)]
pub struct SimulatedBackend {
    targets: Mutex<HashMap<AnalysisTarget, TargetState>>,
    starts: Mutex<Vec<AnalysisTarget>>,
}

impl SimulatedBackend {
    /// Backend with no scripts
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the script for `target`, resetting its counter
    pub fn script(&self, target: &AnalysisTarget, script: Script) {
        self.targets.lock().insert(
            target.clone(),
            TargetState {
                script,
                status_calls: 0,
            },
        );
    }

    /// Targets passed to `start_analysis`, in call order
    #[must_use]
    pub fn start_calls(&self) -> Vec<AnalysisTarget> {
        self.starts.lock().clone()
    }

    /// Status checks answered for `target` since its last start
    #[must_use]
    pub fn status_calls(&self, target: &AnalysisTarget) -> u32 {
        self.targets
            .lock()
            .get(target)
            .map_or(0, |state| state.status_calls)
    }

    fn payload(target: &AnalysisTarget) -> Payload {
        let resource = target.resource();
        match resource.device_id() {
            Some(device) => json!({
                "kind": target.kind().feature(),
                "project": resource.project_id().as_str(),
                "device": device.as_str(),
            }),
            None => json!({
                "kind": target.kind().feature(),
                "project": resource.project_id().as_str(),
            }),
        }
    }
}

#[async_trait]
impl AnalysisBackend for SimulatedBackend {
    async fn start_analysis(&self, target: &AnalysisTarget) -> Result<(), BackendError> {
        self.starts.lock().push(target.clone());
        let (delay, error) = {
            let mut targets = self.targets.lock();
            let state = targets.entry(target.clone()).or_default();
            state.status_calls = 0;
            (state.script.start_delay, state.script.start_error.clone())
        };

        tracing::debug!(kind = %target.kind(), resource = %target.resource(), "simulated start");
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn get_analysis_status(
        &self,
        target: &AnalysisTarget,
    ) -> Result<AnalysisStatus, BackendError> {
        let mut targets = self.targets.lock();
        let state = targets.entry(target.clone()).or_default();
        state.status_calls += 1;

        if state.status_calls <= state.script.empties {
            return Ok(AnalysisStatus::Empty);
        }
        if let Some(e) = &state.script.status_error {
            return Err(e.clone());
        }
        Ok(AnalysisStatus::Ready {
            payload: Self::payload(target),
            metrics: Some(AnalysisMetrics {
                duration_ms: Some(u64::from(state.status_calls) * 100),
                tokens_used: None,
            }),
        })
    }
}
