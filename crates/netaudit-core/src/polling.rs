//! Polling registry
//!
//! A key-addressed set of status polling loops. Each loop calls its fetcher on
//! a fixed interval until the backend reports a result or a status check
//! fails, then fans the outcome out and removes itself.
//!
//! # Invariants
//!
//! - At most one session per poll key. `start_polling` on a live key is a
//!   no-op that returns `PollingError::AlreadyPolling`.
//! - `resume_polling` swaps the listener list and nothing else: attempts,
//!   start time and the running timer are untouched.
//! - The terminal path runs exactly once per session, whichever of the loop,
//!   `fail_session` or `stop_polling` gets there first.
//! - `fail_session` only ends the session registered for the given job; a
//!   newer session under the same key is left alone.
//! - Sessions never touch each other; one key failing leaves every other loop
//!   running.

use crate::backend::StatusFetcher;
use crate::config::SchedulerConfig;
use crate::error::PollingError;
use crate::flags::FlagStore;
use crate::notify::{Callbacks, NotificationBus, NotifyScope};
use crate::state_machine::{validate_transition, JobState};
use crate::types::{AnalysisStatus, JobId, Outcome, PollKey, ResourceId};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Hook run once after a session's terminal outcome; not replaced by resume
pub type SettledHook = Box<dyn FnOnce(&Outcome) + Send>;

/// Parameters for a new polling session
pub struct PollRequest {
    key: PollKey,
    resource: ResourceId,
    fetcher: Arc<dyn StatusFetcher>,
    callbacks: Callbacks,
    subject: String,
    job: Option<JobId>,
    on_settled: Option<SettledHook>,
}

impl PollRequest {
    /// Poll `resource` under `key`, reporting to `callbacks`
    #[must_use]
    pub fn new(
        key: PollKey,
        resource: ResourceId,
        fetcher: Arc<dyn StatusFetcher>,
        callbacks: Callbacks,
    ) -> Self {
        let subject = key.to_string();
        Self {
            key,
            resource,
            fetcher,
            callbacks,
            subject,
            job: None,
            on_settled: None,
        }
    }

    /// Name used in system notices ("Network overview ready")
    #[inline]
    #[must_use]
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = subject.into();
        self
    }

    /// Job whose start call this session is watching
    #[inline]
    #[must_use]
    pub fn for_job(mut self, job: JobId) -> Self {
        self.job = Some(job);
        self
    }

    /// Run `hook` once after the terminal outcome, after all listeners
    #[inline]
    #[must_use]
    pub fn on_settled(mut self, hook: impl FnOnce(&Outcome) + Send + 'static) -> Self {
        self.on_settled = Some(Box::new(hook));
        self
    }
}

impl std::fmt::Debug for PollRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollRequest")
            .field("key", &self.key)
            .field("resource", &self.resource)
            .field("subject", &self.subject)
            .field("job", &self.job)
            .finish_non_exhaustive()
    }
}

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Registered, first fetch not issued yet
    Pending,
    /// Fetching on the interval
    Polling,
    /// Outcome delivered or stopped
    Terminated,
}

/// Read-only view of a live session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    /// Poll key
    pub key: PollKey,
    /// Resource being polled
    pub resource: ResourceId,
    /// Owning job, if the session was started for one
    pub job: Option<JobId>,
    /// "Not ready yet" answers so far
    pub attempts: u64,
    /// Wall-clock start
    pub started_at: DateTime<Utc>,
    /// Time since start
    pub elapsed: Duration,
    /// Current state
    pub state: SessionState,
}

struct PollingSession {
    key: PollKey,
    resource: ResourceId,
    subject: String,
    job: Option<JobId>,
    started_at: DateTime<Utc>,
    started: Instant,
    attempts: AtomicU64,
    state: Mutex<SessionState>,
    listeners: Mutex<Vec<Callbacks>>,
    on_settled: Mutex<Option<SettledHook>>,
    task: Mutex<Option<AbortHandle>>,
}

impl PollingSession {
    fn new(request: PollRequest) -> (Self, Arc<dyn StatusFetcher>) {
        let session = Self {
            key: request.key,
            resource: request.resource,
            subject: request.subject,
            job: request.job,
            started_at: Utc::now(),
            started: Instant::now(),
            attempts: AtomicU64::new(0),
            state: Mutex::new(SessionState::Pending),
            listeners: Mutex::new(vec![request.callbacks]),
            on_settled: Mutex::new(request.on_settled),
            task: Mutex::new(None),
        };
        (session, request.fetcher)
    }

    fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Pending -> Polling; false if already terminated
    fn mark_polling(&self) -> bool {
        let mut state = self.state.lock();
        match *state {
            SessionState::Terminated => false,
            _ => {
                *state = SessionState::Polling;
                true
            }
        }
    }

    /// Move to Terminated; returns the prior state the first time only
    fn terminate(&self) -> Option<SessionState> {
        let mut state = self.state.lock();
        if *state == SessionState::Terminated {
            return None;
        }
        let prior = *state;
        *state = SessionState::Terminated;
        Some(prior)
    }

    fn abort_task(&self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }

    fn info(&self) -> SessionInfo {
        SessionInfo {
            key: self.key.clone(),
            resource: self.resource.clone(),
            job: self.job,
            attempts: self.attempts.load(Ordering::SeqCst),
            started_at: self.started_at,
            elapsed: self.started.elapsed(),
            state: self.state(),
        }
    }
}

struct RegistryInner {
    sessions: DashMap<PollKey, Arc<PollingSession>>,
    last_outcomes: DashMap<PollKey, JobState>,
    flags: Arc<dyn FlagStore>,
    bus: NotificationBus,
    interval: Duration,
    flag_prefix: String,
}

impl RegistryInner {
    /// Terminal path: runs at most once per session
    fn finish(&self, session: &Arc<PollingSession>, outcome: Outcome) {
        let Some(prior) = session.terminate() else {
            return;
        };

        self.sessions
            .remove_if(&session.key, |_, live| Arc::ptr_eq(live, session));

        let from = match prior {
            SessionState::Pending => JobState::Starting,
            _ => JobState::Polling,
        };
        let to = if outcome.is_success() {
            JobState::Done
        } else {
            JobState::Failed
        };
        if let Err(e) = validate_transition(from, to) {
            tracing::warn!(key = %session.key, error = %e, "unexpected terminal transition");
        }
        self.last_outcomes.insert(session.key.clone(), to);

        let flag = session.key.flag_key(&self.flag_prefix);
        if let Err(e) = self.flags.clear(&flag) {
            tracing::error!(key = %session.key, flag = %flag, error = %e, "failed to clear in-flight flag");
        }

        let attempts = session.attempts.load(Ordering::SeqCst);
        match &outcome {
            Outcome::Success(_) => tracing::info!(
                key = %session.key,
                attempts,
                elapsed_ms = u64::try_from(session.started.elapsed().as_millis()).unwrap_or(u64::MAX),
                "analysis ready"
            ),
            Outcome::Failure(message) => tracing::error!(
                key = %session.key,
                attempts,
                error = %message,
                "analysis failed"
            ),
        }

        let listeners = session.listeners.lock().clone();
        self.bus.notify(NotifyScope::Surface(&listeners), &outcome);
        self.bus.notify(
            NotifyScope::System {
                key: &session.key,
                subject: &session.subject,
            },
            &outcome,
        );

        let hook = session.on_settled.lock().take();
        if let Some(hook) = hook {
            hook(&outcome);
        }
    }
}

/// Process-wide registry of polling loops
///
/// Cheap to clone; clones share the same sessions. Loops run on the ambient
/// tokio runtime, so `start_polling` must be called from within one.
#[derive(Clone)]
pub struct PollingRegistry {
    inner: Arc<RegistryInner>,
}

impl PollingRegistry {
    /// Create a registry that clears flags in `flags` and announces on `bus`
    #[must_use]
    pub fn new(flags: Arc<dyn FlagStore>, bus: NotificationBus, config: &SchedulerConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                sessions: DashMap::new(),
                last_outcomes: DashMap::new(),
                flags,
                bus,
                interval: config.poll_interval(),
                flag_prefix: config.flag_prefix.clone(),
            }),
        }
    }

    /// Whether a loop exists for `key`
    #[inline]
    #[must_use]
    pub fn is_polling(&self, key: &PollKey) -> bool {
        self.inner.sessions.contains_key(key)
    }

    /// Register a session and start its loop
    ///
    /// # Errors
    /// `PollingError::AlreadyPolling` if a session exists for the key; the
    /// existing loop is left untouched.
    pub fn start_polling(&self, request: PollRequest) -> Result<(), PollingError> {
        let (session, fetcher) = match self.inner.sessions.entry(request.key.clone()) {
            Entry::Occupied(_) => {
                tracing::warn!(key = %request.key, "start_polling on a live key ignored");
                return Err(PollingError::AlreadyPolling(request.key));
            }
            Entry::Vacant(slot) => {
                let (session, fetcher) = PollingSession::new(request);
                let session = Arc::new(session);
                slot.insert(session.clone());
                (session, fetcher)
            }
        };
        self.inner.last_outcomes.remove(&session.key);

        tracing::info!(key = %session.key, resource = %session.resource, "polling started");

        let handle = tokio::spawn(run_session(
            Arc::downgrade(&self.inner),
            session.clone(),
            fetcher,
            self.inner.interval,
        ));
        *session.task.lock() = Some(handle.abort_handle());
        Ok(())
    }

    /// Replace a live session's listeners
    ///
    /// # Errors
    /// `PollingError::NotPolling` if no session exists; callers check
    /// [`is_polling`](Self::is_polling) or fall back to `start_polling`.
    pub fn resume_polling(&self, key: &PollKey, callbacks: Callbacks) -> Result<(), PollingError> {
        let session = self.session(key)?;
        *session.listeners.lock() = vec![callbacks];
        tracing::debug!(%key, attempts = session.attempts.load(Ordering::SeqCst), "polling resumed");
        Ok(())
    }

    /// Add a listener to a live session without dropping the existing ones
    ///
    /// # Errors
    /// `PollingError::NotPolling` if no session exists.
    pub fn attach(&self, key: &PollKey, callbacks: Callbacks) -> Result<(), PollingError> {
        let session = self.session(key)?;
        session.listeners.lock().push(callbacks);
        Ok(())
    }

    /// Cancel the loop and forget the session; no callbacks fire afterwards
    ///
    /// The in-flight flag is left alone. Returns whether a session existed.
    pub fn stop_polling(&self, key: &PollKey) -> bool {
        let Some((_, session)) = self.inner.sessions.remove(key) else {
            return false;
        };
        session.terminate();
        session.abort_task();
        tracing::info!(%key, "polling stopped");
        true
    }

    /// End `job`'s live session with a failure, running the full terminal path
    ///
    /// Used when the start call is rejected after the session was registered.
    /// Returns false if the key has no session or its session belongs to
    /// another job.
    pub fn fail_session(&self, key: &PollKey, job: JobId, message: impl Into<String>) -> bool {
        let Some(session) = self.inner.sessions.get(key).map(|s| Arc::clone(s.value())) else {
            return false;
        };
        if session.job != Some(job) {
            tracing::debug!(%key, %job, owner = ?session.job, "session belongs to another job");
            return false;
        }
        session.abort_task();
        self.inner.finish(&session, Outcome::Failure(message.into()));
        true
    }

    /// Snapshot of a live session
    #[must_use]
    pub fn session_info(&self, key: &PollKey) -> Option<SessionInfo> {
        self.inner.sessions.get(key).map(|s| s.info())
    }

    /// Derived job state for `key`
    ///
    /// Live session wins; otherwise a set flag means in flight without a loop
    /// (e.g. right after a restart); otherwise the last recorded outcome.
    #[must_use]
    pub fn state(&self, key: &PollKey) -> JobState {
        if let Some(session) = self.inner.sessions.get(key) {
            match session.state() {
                SessionState::Pending => return JobState::Starting,
                SessionState::Polling => return JobState::Polling,
                SessionState::Terminated => {}
            }
        }
        if self.inner.flags.get(&key.flag_key(&self.inner.flag_prefix)) {
            return JobState::Starting;
        }
        self.inner
            .last_outcomes
            .get(key)
            .map_or(JobState::Idle, |s| *s.value())
    }

    /// Keys with a live session, sorted
    #[must_use]
    pub fn active_keys(&self) -> Vec<PollKey> {
        let mut keys: Vec<PollKey> = self.inner.sessions.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Flag store shared with this registry
    #[inline]
    #[must_use]
    pub fn flags(&self) -> &Arc<dyn FlagStore> {
        &self.inner.flags
    }

    /// Notification bus shared with this registry
    #[inline]
    #[must_use]
    pub fn bus(&self) -> &NotificationBus {
        &self.inner.bus
    }

    /// Prefix used to derive flag keys
    #[inline]
    #[must_use]
    pub fn flag_prefix(&self) -> &str {
        &self.inner.flag_prefix
    }

    fn session(&self, key: &PollKey) -> Result<Arc<PollingSession>, PollingError> {
        match self.inner.sessions.get(key) {
            Some(session) => Ok(Arc::clone(session.value())),
            None => {
                tracing::error!(%key, "no polling session for key");
                Err(PollingError::NotPolling(key.clone()))
            }
        }
    }
}

impl std::fmt::Debug for PollingRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollingRegistry")
            .field("sessions", &self.inner.sessions.len())
            .field("interval", &self.inner.interval)
            .finish_non_exhaustive()
    }
}

/// Session loop (runs in its own tokio task)
async fn run_session(
    registry: Weak<RegistryInner>,
    session: Arc<PollingSession>,
    fetcher: Arc<dyn StatusFetcher>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if !session.mark_polling() {
            return;
        }

        let result = fetcher.fetch_status(&session.resource).await;

        let Some(registry) = registry.upgrade() else {
            return;
        };
        if session.state() == SessionState::Terminated {
            return;
        }

        match result {
            Ok(AnalysisStatus::Empty) => {
                let attempts = session.attempts.fetch_add(1, Ordering::SeqCst) + 1;
                tracing::debug!(key = %session.key, attempts, "not ready yet");
            }
            Ok(AnalysisStatus::Ready { payload, metrics }) => {
                if let Some(metrics) = metrics {
                    tracing::debug!(key = %session.key, ?metrics, "result metrics");
                }
                registry.finish(&session, Outcome::Success(payload));
                return;
            }
            Err(e) => {
                registry.finish(&session, Outcome::Failure(e.to_string()));
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BackendError;
    use crate::flags::MemoryFlagStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    struct ReadyAfter {
        empties: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl StatusFetcher for ReadyAfter {
        async fn fetch_status(
            &self,
            _resource: &ResourceId,
        ) -> Result<AnalysisStatus, BackendError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.empties {
                Ok(AnalysisStatus::Empty)
            } else {
                Ok(AnalysisStatus::ready(json!({ "after": n })))
            }
        }
    }

    fn registry() -> PollingRegistry {
        let config = SchedulerConfig::new().with_poll_interval(Duration::from_millis(100));
        PollingRegistry::new(
            Arc::new(MemoryFlagStore::new()),
            NotificationBus::default(),
            &config,
        )
    }

    fn request(key: &str, fetcher: Arc<dyn StatusFetcher>, callbacks: Callbacks) -> PollRequest {
        PollRequest::new(
            PollKey::from_raw(key),
            ResourceId::project("P1"),
            fetcher,
            callbacks,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn first_fetch_waits_one_interval() {
        let registry = registry();
        let fetcher = Arc::new(ReadyAfter {
            empties: usize::MAX,
            calls: AtomicUsize::new(0),
        });
        registry
            .start_polling(request("overview_P1", fetcher.clone(), Callbacks::noop()))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
        assert_eq!(registry.state(&PollKey::from_raw("overview_P1")), JobState::Starting);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(registry.state(&PollKey::from_raw("overview_P1")), JobState::Polling);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_polling_silences_callbacks() {
        let registry = registry();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let fetcher = Arc::new(ReadyAfter {
            empties: 2,
            calls: AtomicUsize::new(0),
        });
        registry
            .start_polling(request(
                "topology_P1",
                fetcher,
                Callbacks::new(
                    move |_| {
                        counter.fetch_add(1, Ordering::SeqCst);
                    },
                    |_| {},
                ),
            ))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(registry.stop_polling(&PollKey::from_raw("topology_P1")));
        assert!(!registry.is_polling(&PollKey::from_raw("topology_P1")));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(!registry.stop_polling(&PollKey::from_raw("topology_P1")));
    }

    #[tokio::test(start_paused = true)]
    async fn fail_session_runs_terminal_path_once() {
        let registry = registry();
        let key = PollKey::from_raw("recommendations_P1");
        registry
            .flags()
            .set(&key.flag_key(registry.flag_prefix()))
            .unwrap();

        let job = JobId::new();
        let errors = Arc::new(AtomicUsize::new(0));
        let settled = Arc::new(AtomicUsize::new(0));
        let (e, s) = (errors.clone(), settled.clone());
        let fetcher = Arc::new(ReadyAfter {
            empties: usize::MAX,
            calls: AtomicUsize::new(0),
        });
        registry
            .start_polling(
                request(
                    key.as_str(),
                    fetcher,
                    Callbacks::new(|_| {}, move |_| {
                        e.fetch_add(1, Ordering::SeqCst);
                    }),
                )
                .for_job(job)
                .on_settled(move |_| {
                    s.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        assert!(!registry.fail_session(&key, JobId::new(), "someone else's job"));
        assert_eq!(registry.session_info(&key).unwrap().job, Some(job));
        assert!(registry.fail_session(&key, job, "start rejected"));
        assert!(!registry.fail_session(&key, job, "again"));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert_eq!(settled.load(Ordering::SeqCst), 1);
        assert_eq!(registry.state(&key), JobState::Failed);
        assert!(!registry.flags().get(&key.flag_key(registry.flag_prefix())));
    }

    #[tokio::test(start_paused = true)]
    async fn attach_adds_a_second_surface() {
        let registry = registry();
        let key = PollKey::from_raw("overview_P1");
        let hits = Arc::new(AtomicUsize::new(0));
        let make = |hits: Arc<AtomicUsize>| {
            Callbacks::new(
                move |_| {
                    hits.fetch_add(1, Ordering::SeqCst);
                },
                |_| {},
            )
        };
        let fetcher = Arc::new(ReadyAfter {
            empties: 1,
            calls: AtomicUsize::new(0),
        });
        registry
            .start_polling(request(key.as_str(), fetcher, make(hits.clone())))
            .unwrap();
        registry.attach(&key, make(hits.clone())).unwrap();

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(registry.state(&key), JobState::Done);
    }

    #[test]
    fn resume_on_missing_key_is_an_error() {
        let registry = registry();
        let key = PollKey::from_raw("overview_P9");
        assert_eq!(
            registry.resume_polling(&key, Callbacks::noop()),
            Err(PollingError::NotPolling(key))
        );
    }
}
