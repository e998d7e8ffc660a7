//! Per-feature coordination
//!
//! A [`FeatureCoordinator`] is what a surface (page, panel, CLI command) holds
//! for one `(kind, resource)` pair. It ties the in-flight flag, the owner's job
//! queue and the polling registry together:
//!
//! - `request_analysis` writes the flag, registers the polling session, then
//!   fires the start call, in that order.
//! - `mount` picks a running job back up: resume if a loop exists, start one
//!   if only the flag survived (cold start or a stopped loop). A restarted loop
//!   takes over the queue slot of the job that still holds it.
//! - `unmount` never stops polling.

use crate::backend::{
    load_latest_with_deadline, start_with_timeout, AnalysisBackend, BackendFetcher,
};
use crate::config::SchedulerConfig;
use crate::error::{JobError, PollingError, SchedulerError, TargetError};
use crate::flags::FlagStore;
use crate::notify::{Callbacks, NotificationBus, NotifyScope};
use crate::polling::{PollRequest, PollingRegistry};
use crate::queue::{Job, JobContext, JobQueue, JobQueues, RunRequest, StartFuture};
use crate::state_machine::JobState;
use crate::types::{
    AnalysisKind, AnalysisStatus, AnalysisTarget, JobId, Outcome, Payload, PollKey, ResourceId,
};
use futures::FutureExt;
use std::sync::Arc;

/// Shared services injected into every coordinator
#[derive(Clone)]
pub struct SchedulerServices {
    /// Polling loops
    pub registry: PollingRegistry,
    /// Durable in-flight flags
    pub flags: Arc<dyn FlagStore>,
    /// Per-project job queues
    pub queues: JobQueues,
    /// Analysis backend
    pub backend: Arc<dyn AnalysisBackend>,
    /// Configuration
    pub config: SchedulerConfig,
}

impl SchedulerServices {
    /// Wire up a fresh set of services around `flags` and `backend`
    #[must_use]
    pub fn new(
        flags: Arc<dyn FlagStore>,
        backend: Arc<dyn AnalysisBackend>,
        config: SchedulerConfig,
    ) -> Self {
        let bus = NotificationBus::new(config.notice_capacity);
        let registry = PollingRegistry::new(flags.clone(), bus, &config);
        let queues = JobQueues::new(flags.clone(), &config);
        Self {
            registry,
            flags,
            queues,
            backend,
            config,
        }
    }

    /// Notification bus used by the registry
    #[inline]
    #[must_use]
    pub fn bus(&self) -> &NotificationBus {
        self.registry.bus()
    }

    /// Coordinator for `kind` on `resource`
    ///
    /// # Errors
    /// `TargetError` if the kind cannot run against this resource.
    pub fn coordinator(
        &self,
        kind: AnalysisKind,
        resource: ResourceId,
    ) -> Result<FeatureCoordinator, TargetError> {
        Ok(FeatureCoordinator::new(
            self.clone(),
            AnalysisTarget::new(kind, resource)?,
        ))
    }
}

impl std::fmt::Debug for SchedulerServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerServices")
            .field("registry", &self.registry)
            .field("queues", &self.queues)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// What `mount` found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountOutcome {
    /// Nothing in flight
    Idle,
    /// Live loop found; listeners replaced
    Resumed,
    /// Flag set but no loop (process restarted); polling restarted
    Recovered,
}

/// Glue for one feature instance
#[derive(Debug, Clone)]
pub struct FeatureCoordinator {
    services: SchedulerServices,
    target: AnalysisTarget,
    key: PollKey,
}

impl FeatureCoordinator {
    /// Coordinator for an already validated target
    #[must_use]
    pub fn new(services: SchedulerServices, target: AnalysisTarget) -> Self {
        let key = target.poll_key();
        Self {
            services,
            target,
            key,
        }
    }

    /// Poll key of this feature instance
    #[inline]
    #[must_use]
    pub fn key(&self) -> &PollKey {
        &self.key
    }

    /// Target of this feature instance
    #[inline]
    #[must_use]
    pub fn target(&self) -> &AnalysisTarget {
        &self.target
    }

    /// Queue of the owning project
    #[must_use]
    pub fn queue(&self) -> JobQueue {
        self.services
            .queues
            .for_owner(self.target.resource().project_id())
    }

    fn flag_key(&self) -> String {
        self.key.flag_key(&self.services.config.flag_prefix)
    }

    fn subject(&self) -> &'static str {
        self.target.kind().title()
    }

    fn label(&self) -> String {
        format!("{} {}", self.subject(), self.target.resource())
    }

    fn poll_request(&self, callbacks: Callbacks) -> PollRequest {
        let fetcher = Arc::new(BackendFetcher::new(
            self.services.backend.clone(),
            self.target.kind(),
        ));
        PollRequest::new(
            self.key.clone(),
            self.target.resource().clone(),
            fetcher,
            callbacks,
        )
        .with_subject(self.subject())
    }

    /// Attach a surface, picking up any job still in flight
    ///
    /// # Errors
    /// Propagates a `PollingError` only if the registry rejects both resume
    /// and start, which means it changed under us twice.
    pub fn mount(&self, callbacks: Callbacks) -> Result<MountOutcome, SchedulerError> {
        if !self.services.flags.get(&self.flag_key()) {
            tracing::debug!(key = %self.key, "mounted idle");
            return Ok(MountOutcome::Idle);
        }

        if self.services.registry.is_polling(&self.key) {
            match self.services.registry.resume_polling(&self.key, callbacks.clone()) {
                Ok(()) => {
                    tracing::debug!(key = %self.key, "mounted onto live session");
                    return Ok(MountOutcome::Resumed);
                }
                // session settled between the two calls
                Err(PollingError::NotPolling(_)) => {
                    if !self.services.flags.get(&self.flag_key()) {
                        return Ok(MountOutcome::Idle);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        self.recover(callbacks)
    }

    /// Restart polling for a flag that outlived its loop
    fn recover(&self, callbacks: Callbacks) -> Result<MountOutcome, SchedulerError> {
        let queue = self.queue();
        // a stopped loop leaves its job in the slot; the new loop releases it
        let (completion, adopted) = match queue.rejoin(&self.key) {
            Some(completion) => (Some(completion), false),
            None => (
                queue.adopt_in_flight(self.label(), Some(self.key.clone())),
                true,
            ),
        };

        let mut request = self.poll_request(callbacks.clone());
        if let Some(completion) = completion.clone() {
            request = request.for_job(completion.job_id()).on_settled(move |_| {
                completion.complete();
            });
        }

        let release_adopted = || {
            if let (true, Some(completion)) = (adopted, &completion) {
                completion.complete();
            }
        };

        match self.services.registry.start_polling(request) {
            Ok(()) => {
                tracing::info!(
                    key = %self.key,
                    holds_slot = completion.is_some(),
                    rejoined = !adopted,
                    "recovered in-flight job"
                );
                Ok(MountOutcome::Recovered)
            }
            Err(PollingError::AlreadyPolling(_)) => {
                release_adopted();
                self.services
                    .registry
                    .resume_polling(&self.key, callbacks)?;
                Ok(MountOutcome::Resumed)
            }
            Err(e) => {
                release_adopted();
                Err(e.into())
            }
        }
    }

    /// Detach a surface; the job keeps running
    pub fn unmount(&self) {
        tracing::debug!(key = %self.key, polling = self.services.registry.is_polling(&self.key), "unmounted");
    }

    /// Queue a new analysis run on the owning project's queue
    ///
    /// Returns `RunRequest::AlreadyInFlight` if this key is flagged, running
    /// or pending already.
    pub fn request_analysis(&self, callbacks: Callbacks) -> RunRequest {
        let start = {
            let this = self.clone();
            let callbacks = callbacks.clone();
            move |ctx: JobContext| -> Result<StartFuture, JobError> {
                this.services.flags.set(&this.flag_key())?;

                let completion = ctx.completion();
                let request = this
                    .poll_request(callbacks)
                    .for_job(ctx.job_id)
                    .on_settled(move |_| {
                        completion.complete();
                    });
                this.services.registry.start_polling(request)?;

                let backend = this.services.backend.clone();
                let target = this.target.clone();
                let timeout = this.services.config.start_timeout();
                Ok(async move { start_with_timeout(backend.as_ref(), &target, timeout).await }.boxed())
            }
        };

        let job = Job::new(self.label(), start).with_poll_key(self.key.clone());
        let failed = {
            let this = self.clone();
            let job_id = job.id();
            move |error: &JobError| this.start_failed(job_id, error, &callbacks)
        };
        self.queue().request_run(job.on_start_failure(failed))
    }

    /// Surface a launch failure of job `job_id`
    fn start_failed(&self, job_id: JobId, error: &JobError, callbacks: &Callbacks) {
        if matches!(error, JobError::StartRejected(_)) {
            // the job's own session owns the terminal path
            if self
                .services
                .registry
                .fail_session(&self.key, job_id, error.to_string())
            {
                return;
            }
            if self.services.registry.is_polling(&self.key) {
                tracing::warn!(key = %self.key, %job_id, error = %error, "start rejected but another session polls this key");
                return;
            }
        }

        if !matches!(error, JobError::Polling(PollingError::AlreadyPolling(_))) {
            if let Err(e) = self.services.flags.clear(&self.flag_key()) {
                tracing::error!(key = %self.key, error = %e, "failed to clear in-flight flag");
            }
        }

        let outcome = Outcome::Failure(error.to_string());
        let bus = self.services.bus();
        bus.notify(NotifyScope::Surface(std::slice::from_ref(callbacks)), &outcome);
        bus.notify(
            NotifyScope::System {
                key: &self.key,
                subject: self.subject(),
            },
            &outcome,
        );
    }

    /// Last saved result, or `None` if there is none or the read is too slow
    pub async fn load_latest(&self) -> Option<Payload> {
        let backend = self.services.backend.clone();
        let target = self.target.clone();
        let read = async move {
            match backend.get_analysis_status(&target).await? {
                AnalysisStatus::Ready { payload, .. } => Ok(Some(payload)),
                AnalysisStatus::Empty => Ok(None),
            }
        };
        load_latest_with_deadline(read, self.services.config.load_deadline()).await
    }

    /// Current job state for this key
    #[must_use]
    pub fn state(&self) -> JobState {
        self.services.registry.state(&self.key)
    }

    /// Whether the surface should show its "generating" state
    #[must_use]
    pub fn is_generating(&self) -> bool {
        self.state().is_active()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BackendError;
    use crate::flags::MemoryFlagStore;
    use crate::simulator::{Script, SimulatedBackend};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::time::Duration;

    fn services(backend: Arc<SimulatedBackend>) -> SchedulerServices {
        let config = SchedulerConfig::new()
            .with_poll_interval(Duration::from_millis(100))
            .with_start_timeout(Duration::from_millis(500));
        SchedulerServices::new(Arc::new(MemoryFlagStore::new()), backend, config)
    }

    fn recording() -> (Callbacks, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (ok, err) = (log.clone(), log.clone());
        let callbacks = Callbacks::new(
            move |p| ok.lock().push(format!("ok:{p}")),
            move |e| err.lock().push(format!("err:{e}")),
        );
        (callbacks, log)
    }

    #[tokio::test(start_paused = true)]
    async fn request_sets_flag_before_start_call() {
        let backend = Arc::new(SimulatedBackend::new());
        let services = services(backend.clone());
        let overview = services
            .coordinator(AnalysisKind::NetworkOverview, ResourceId::project("P1"))
            .unwrap();
        let (callbacks, log) = recording();

        assert!(matches!(overview.request_analysis(callbacks), RunRequest::Started(_)));
        assert!(services.flags.get("llm_generating_overview_P1"));
        assert!(overview.is_generating());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(backend.start_calls().len(), 1);
        assert_eq!(*log.lock(), vec![r#"ok:{"kind":"overview","project":"P1"}"#]);
        assert!(!services.flags.get("llm_generating_overview_P1"));
        assert_eq!(overview.state(), JobState::Done);
        assert!(!overview.queue().busy());
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_start_error_fails_fast() {
        let backend = Arc::new(SimulatedBackend::new());
        let target = AnalysisTarget::new(AnalysisKind::Topology, ResourceId::project("P1")).unwrap();
        backend.script(
            &target,
            Script::ready_after(3).with_start_error(BackendError::Rejected {
                status: 500,
                message: "model unavailable".into(),
            }),
        );
        let services = services(backend);
        let topology = FeatureCoordinator::new(services.clone(), target);
        let mut sink = services.bus().mount_sink();
        let (callbacks, log) = recording();

        topology.request_analysis(callbacks);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(log.lock().len(), 1);
        assert!(log.lock()[0].starts_with("err:start rejected"));
        assert!(!topology.queue().busy());
        assert!(!services.flags.get("llm_generating_topology_P1"));
        assert!(!services.registry.is_polling(topology.key()));
        assert_eq!(topology.state(), JobState::Failed);
        assert_eq!(sink.try_recv().unwrap().title, "Topology failed");
    }

    #[tokio::test(start_paused = true)]
    async fn rejection_after_polling_outcome_is_dropped() {
        let backend = Arc::new(SimulatedBackend::new());
        let target = AnalysisTarget::new(AnalysisKind::Topology, ResourceId::project("P1")).unwrap();
        backend.script(
            &target,
            Script::ready_after(0)
                .with_start_delay(Duration::from_millis(250))
                .with_start_error(BackendError::Rejected {
                    status: 500,
                    message: "late".into(),
                }),
        );
        let services = services(backend);
        let topology = FeatureCoordinator::new(services.clone(), target);
        let mut sink = services.bus().mount_sink();
        let (callbacks, log) = recording();

        topology.request_analysis(callbacks);
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(*log.lock(), vec![r#"ok:{"kind":"topology","project":"P1"}"#]);
        assert_eq!(sink.try_recv().unwrap().title, "Topology ready");
        assert!(sink.try_recv().is_none());
        assert_eq!(topology.state(), JobState::Done);
        assert!(!topology.queue().busy());
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_loop_recovers_into_the_held_slot() {
        let backend = Arc::new(SimulatedBackend::new());
        let target = AnalysisTarget::new(AnalysisKind::NetworkOverview, ResourceId::project("P1")).unwrap();
        backend.script(&target, Script::ready_after(3));
        let services = services(backend.clone());
        let overview = FeatureCoordinator::new(services.clone(), target);
        let topology = services
            .coordinator(AnalysisKind::Topology, ResourceId::project("P1"))
            .unwrap();

        overview.request_analysis(Callbacks::noop());
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(services.registry.stop_polling(overview.key()));
        assert!(overview.queue().busy());

        let (callbacks, log) = recording();
        assert_eq!(overview.mount(callbacks).unwrap(), MountOutcome::Recovered);
        let running = overview.queue().snapshot().running.unwrap();
        assert_eq!(running.label, "Network overview P1");
        assert_eq!(
            services.registry.session_info(overview.key()).unwrap().job,
            Some(running.id)
        );

        let (topo_callbacks, topo_log) = recording();
        assert!(matches!(
            topology.request_analysis(topo_callbacks),
            RunRequest::Queued { position: 1, .. }
        ));

        tokio::time::sleep(Duration::from_millis(850)).await;
        assert_eq!(log.lock().len(), 1);
        assert_eq!(topo_log.lock().len(), 1);
        assert_eq!(backend.start_calls().len(), 2);
        assert!(!overview.queue().busy());
        assert!(services.flags.keys().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn start_timeout_is_ignored() {
        let backend = Arc::new(SimulatedBackend::new());
        let target = AnalysisTarget::new(AnalysisKind::Recommendations, ResourceId::project("P1")).unwrap();
        backend.script(
            &target,
            Script::ready_after(10).with_start_error(BackendError::Timeout),
        );
        let services = services(backend);
        let recs = FeatureCoordinator::new(services, target);
        let (callbacks, log) = recording();

        recs.request_analysis(callbacks);
        tokio::time::sleep(Duration::from_millis(550)).await;

        assert!(log.lock().is_empty());
        assert!(recs.is_generating());
        assert!(recs.queue().busy());

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(log.lock().len(), 1);
        assert!(!recs.queue().busy());
    }

    #[tokio::test(start_paused = true)]
    async fn remount_resumes_instead_of_restarting() {
        let backend = Arc::new(SimulatedBackend::new());
        let target = AnalysisTarget::new(AnalysisKind::NetworkOverview, ResourceId::project("P1")).unwrap();
        backend.script(&target, Script::ready_after(5));
        let services = services(backend);
        let overview = FeatureCoordinator::new(services.clone(), target);

        let (first, first_log) = recording();
        overview.request_analysis(first);
        tokio::time::sleep(Duration::from_millis(250)).await;
        overview.unmount();
        assert!(services.registry.is_polling(overview.key()));

        let (second, second_log) = recording();
        assert_eq!(overview.mount(second).unwrap(), MountOutcome::Resumed);
        assert_eq!(services.registry.session_info(overview.key()).unwrap().attempts, 2);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(first_log.lock().is_empty());
        assert_eq!(second_log.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn second_click_is_ignored() {
        let services = services(Arc::new(SimulatedBackend::new()));
        let overview = services
            .coordinator(AnalysisKind::NetworkOverview, ResourceId::project("P1"))
            .unwrap();

        assert!(matches!(overview.request_analysis(Callbacks::noop()), RunRequest::Started(_)));
        assert_eq!(overview.request_analysis(Callbacks::noop()), RunRequest::AlreadyInFlight);
    }

    #[tokio::test(start_paused = true)]
    async fn load_latest_reads_saved_result() {
        let backend = Arc::new(SimulatedBackend::new());
        let target = AnalysisTarget::new(AnalysisKind::Topology, ResourceId::project("P2")).unwrap();
        backend.script(&target, Script::ready_after(0));
        let topology = FeatureCoordinator::new(services(backend), target);

        assert_eq!(
            topology.load_latest().await,
            Some(json!({ "kind": "topology", "project": "P2" }))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn load_latest_without_result_is_empty() {
        let backend = Arc::new(SimulatedBackend::new());
        let target = AnalysisTarget::new(AnalysisKind::Topology, ResourceId::project("P2")).unwrap();
        backend.script(&target, Script::ready_after(2));
        let topology = FeatureCoordinator::new(services(backend), target);

        assert_eq!(topology.load_latest().await, None);
    }

    #[test]
    fn mount_without_flag_is_idle() {
        let services = services(Arc::new(SimulatedBackend::new()));
        let drift = services
            .coordinator(
                AnalysisKind::DeviceConfigDrift,
                ResourceId::drift("P1", "SW1", "running-config", 3, 4),
            )
            .unwrap();
        assert_eq!(drift.mount(Callbacks::noop()).unwrap(), MountOutcome::Idle);
        assert_eq!(drift.state(), JobState::Idle);
    }
}
