//! Per-project job queue
//!
//! Serializes mutating "start analysis" jobs for one owner (a project): at
//! most one job holds the slot, the rest wait FIFO.
//!
//! A job's thunk only *starts* work. The slot is released later, out of band,
//! through the [`CompletionHandle`] the thunk receives (normally wired to the
//! polling session's terminal outcome). The queue releases the slot itself
//! only when the job fails to launch: the thunk errors, or the start call is
//! rejected with a non-ignorable error. Either way release happens once. A
//! rejection that arrives after the slot was released is dropped: by then the
//! polling outcome has been delivered.

use crate::config::SchedulerConfig;
use crate::error::{classify_start_error, BackendError, JobError, StartErrorClass};
use crate::flags::FlagStore;
use crate::types::{JobId, PollKey, ProjectId};
use dashmap::DashMap;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// The fire-and-forget start call a thunk hands back
pub type StartFuture = BoxFuture<'static, Result<(), BackendError>>;

type Thunk = Box<dyn FnOnce(JobContext) -> Result<StartFuture, JobError> + Send>;
type StartFailureFn = Box<dyn FnOnce(&JobError) + Send>;

/// A queued unit of work
pub struct Job {
    id: JobId,
    label: String,
    poll_key: Option<PollKey>,
    busy_message: Option<String>,
    thunk: Thunk,
    on_start_failure: Option<StartFailureFn>,
}

impl Job {
    /// Create a job; `thunk` runs when the job reaches the front
    pub fn new<F>(label: impl Into<String>, thunk: F) -> Self
    where
        F: FnOnce(JobContext) -> Result<StartFuture, JobError> + Send + 'static,
    {
        Self {
            id: JobId::new(),
            label: label.into(),
            poll_key: None,
            busy_message: None,
            thunk: Box::new(thunk),
            on_start_failure: None,
        }
    }

    /// Poll key this job will flag; enables the duplicate-request guard
    #[inline]
    #[must_use]
    pub fn with_poll_key(mut self, key: PollKey) -> Self {
        self.poll_key = Some(key);
        self
    }

    /// Busy message shown while this job holds the slot
    #[inline]
    #[must_use]
    pub fn with_busy_message(mut self, message: impl Into<String>) -> Self {
        self.busy_message = Some(message.into());
        self
    }

    /// Called if the job fails to launch
    #[inline]
    #[must_use]
    pub fn on_start_failure(mut self, f: impl FnOnce(&JobError) + Send + 'static) -> Self {
        self.on_start_failure = Some(Box::new(f));
        self
    }

    /// Job ID
    #[inline]
    #[must_use]
    pub fn id(&self) -> JobId {
        self.id
    }

    /// Job label
    #[inline]
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    fn summary(&self) -> JobSummary {
        JobSummary {
            id: self.id,
            label: self.label.clone(),
            poll_key: self.poll_key.clone(),
        }
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("poll_key", &self.poll_key)
            .finish_non_exhaustive()
    }
}

/// What the thunk gets when its job starts
#[derive(Debug)]
pub struct JobContext {
    /// Job being started
    pub job_id: JobId,
    completion: CompletionHandle,
}

impl JobContext {
    /// Handle that releases this job's slot
    #[inline]
    #[must_use]
    pub fn completion(&self) -> CompletionHandle {
        self.completion.clone()
    }
}

/// Releases one job's slot; only the first `complete` has any effect
#[derive(Debug, Clone)]
pub struct CompletionHandle {
    queue: Weak<QueueInner>,
    job_id: JobId,
    released: Arc<AtomicBool>,
}

impl CompletionHandle {
    fn new(queue: &Arc<QueueInner>, job_id: JobId) -> Self {
        Self {
            queue: Arc::downgrade(queue),
            job_id,
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Release the slot and promote the next job
    ///
    /// Returns `false` if this job was already released.
    pub fn complete(&self) -> bool {
        if self.released.swap(true, Ordering::SeqCst) {
            return false;
        }
        if let Some(queue) = self.queue.upgrade() {
            queue.release(self.job_id);
        }
        true
    }

    /// Whether `complete` already ran
    #[inline]
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Job this handle belongs to
    #[inline]
    #[must_use]
    pub fn job_id(&self) -> JobId {
        self.job_id
    }
}

/// Result of `request_run`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunRequest {
    /// Queue was idle; job started
    Started(JobId),
    /// Another job holds the slot; `position` is 1-based among pending jobs
    Queued {
        /// Queued job
        id: JobId,
        /// Place in line
        position: usize,
    },
    /// Same poll key is already flagged, running or pending; nothing queued
    AlreadyInFlight,
}

/// Identity of a running or pending job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSummary {
    /// Job ID
    pub id: JobId,
    /// Label
    pub label: String,
    /// Poll key, if any
    pub poll_key: Option<PollKey>,
}

/// Point-in-time view of a queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSnapshot {
    /// Owner key
    pub owner: ProjectId,
    /// Job holding the slot
    pub running: Option<JobSummary>,
    /// Waiting jobs, front first
    pub pending: Vec<JobSummary>,
    /// Busy message while `running` is set
    pub busy_message: Option<String>,
}

struct RunningJob {
    summary: JobSummary,
    completion: CompletionHandle,
}

#[derive(Default)]
struct QueueState {
    running: Option<RunningJob>,
    pending: VecDeque<Job>,
    busy_message: Option<String>,
}

struct QueueInner {
    owner: ProjectId,
    state: Mutex<QueueState>,
    flags: Arc<dyn FlagStore>,
    flag_prefix: String,
    default_busy_message: String,
}

impl QueueInner {
    /// Take the slot for `job`; caller holds the state lock
    fn promote(self: &Arc<Self>, state: &mut QueueState, job: &Job) -> CompletionHandle {
        let completion = CompletionHandle::new(self, job.id);
        state.busy_message = Some(
            job.busy_message
                .clone()
                .unwrap_or_else(|| self.default_busy_message.clone()),
        );
        state.running = Some(RunningJob {
            summary: job.summary(),
            completion: completion.clone(),
        });
        completion
    }

    /// Free the slot held by `job_id` and launch whatever is next
    fn release(self: &Arc<Self>, job_id: JobId) {
        let next = {
            let mut state = self.state.lock();
            match &state.running {
                Some(running) if running.summary.id == job_id => {}
                _ => {
                    tracing::warn!(owner = %self.owner, %job_id, "release for a job that does not hold the slot");
                    return;
                }
            }
            state.running = None;
            state.busy_message = None;
            tracing::info!(owner = %self.owner, %job_id, pending = state.pending.len(), "job slot released");

            match state.pending.pop_front() {
                Some(job) => {
                    let completion = self.promote(&mut state, &job);
                    Some((job, completion))
                }
                None => None,
            }
        };

        if let Some((job, completion)) = next {
            self.launch(job, completion);
        }
    }

    /// Invoke thunks until one launches or the queue drains
    fn launch(self: &Arc<Self>, job: Job, completion: CompletionHandle) {
        let mut current = Some((job, completion));

        while let Some((job, completion)) = current.take() {
            let Job {
                id,
                label,
                thunk,
                on_start_failure,
                ..
            } = job;
            tracing::info!(owner = %self.owner, job_id = %id, %label, "job started");

            let context = JobContext {
                job_id: id,
                completion: completion.clone(),
            };
            match thunk(context) {
                Ok(start) => {
                    tokio::spawn(watch_start(
                        self.owner.clone(),
                        label,
                        start,
                        completion,
                        on_start_failure,
                    ));
                }
                Err(e) => {
                    tracing::error!(owner = %self.owner, job_id = %id, error = %e, "job failed to launch");
                    if let Some(report) = on_start_failure {
                        report(&e);
                    }
                    if !completion.released.swap(true, Ordering::SeqCst) {
                        current = self.release_inline(id);
                    }
                }
            }
        }
    }

    /// Like `release`, but hands the next job back instead of launching it
    fn release_inline(self: &Arc<Self>, job_id: JobId) -> Option<(Job, CompletionHandle)> {
        let mut state = self.state.lock();
        if !matches!(&state.running, Some(running) if running.summary.id == job_id) {
            return None;
        }
        state.running = None;
        state.busy_message = None;
        let job = state.pending.pop_front()?;
        let completion = self.promote(&mut state, &job);
        Some((job, completion))
    }

    fn is_duplicate(&self, state: &QueueState, key: &PollKey) -> bool {
        self.flags.get(&key.flag_key(&self.flag_prefix))
            || state
                .running
                .as_ref()
                .is_some_and(|r| r.summary.poll_key.as_ref() == Some(key))
            || state
                .pending
                .iter()
                .any(|job| job.poll_key.as_ref() == Some(key))
    }
}

/// Await the start call and classify how it ended
async fn watch_start(
    owner: ProjectId,
    label: String,
    start: StartFuture,
    completion: CompletionHandle,
    on_start_failure: Option<StartFailureFn>,
) {
    let Err(e) = start.await else {
        tracing::debug!(%owner, %label, "start call accepted");
        return;
    };

    match classify_start_error(&e) {
        StartErrorClass::Ignorable => {
            tracing::warn!(%owner, %label, error = %e, "start call did not confirm, waiting on polling");
        }
        StartErrorClass::Fatal if completion.is_released() => {
            tracing::warn!(%owner, %label, error = %e, "start call rejected after the job settled, ignoring");
        }
        StartErrorClass::Fatal => {
            tracing::error!(%owner, %label, error = %e, "start call rejected");
            let error = JobError::StartRejected(e);
            if let Some(report) = on_start_failure {
                report(&error);
            }
            completion.complete();
        }
    }
}

/// One owner's job queue
///
/// Cheap to clone; clones share state. `request_run` and promotion spawn the
/// start call on the ambient tokio runtime.
#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<QueueInner>,
}

impl JobQueue {
    /// Create an idle queue for `owner`
    #[must_use]
    pub fn new(owner: ProjectId, flags: Arc<dyn FlagStore>, config: &SchedulerConfig) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                owner,
                state: Mutex::new(QueueState::default()),
                flags,
                flag_prefix: config.flag_prefix.clone(),
                default_busy_message: config.default_busy_message.clone(),
            }),
        }
    }

    /// Run `job` now if idle, otherwise queue it
    ///
    /// A job whose poll key is already flagged, running or pending is dropped
    /// and `RunRequest::AlreadyInFlight` returned.
    pub fn request_run(&self, job: Job) -> RunRequest {
        let completion = {
            let mut state = self.inner.state.lock();

            if let Some(key) = &job.poll_key {
                if self.inner.is_duplicate(&state, key) {
                    tracing::info!(owner = %self.inner.owner, %key, "duplicate request ignored");
                    return RunRequest::AlreadyInFlight;
                }
            }

            if state.running.is_some() {
                let id = job.id;
                tracing::info!(owner = %self.inner.owner, job_id = %id, label = %job.label, "job queued");
                state.pending.push_back(job);
                return RunRequest::Queued {
                    id,
                    position: state.pending.len(),
                };
            }

            self.inner.promote(&mut state, &job)
        };

        let id = job.id;
        self.inner.launch(job, completion);
        RunRequest::Started(id)
    }

    /// Release the running job's slot and promote the next one
    ///
    /// No-op when idle or when the running job was already released.
    pub fn on_complete(&self) {
        let completion = self
            .inner
            .state
            .lock()
            .running
            .as_ref()
            .map(|r| r.completion.clone());
        if let Some(completion) = completion {
            completion.complete();
        }
    }

    /// Occupy the slot for a job recovered after a restart
    ///
    /// Returns `None` if the slot is taken.
    pub fn adopt_in_flight(
        &self,
        label: impl Into<String>,
        poll_key: Option<PollKey>,
    ) -> Option<CompletionHandle> {
        let mut state = self.inner.state.lock();
        if state.running.is_some() {
            return None;
        }
        let id = JobId::new();
        let completion = CompletionHandle::new(&self.inner, id);
        state.running = Some(RunningJob {
            summary: JobSummary {
                id,
                label: label.into(),
                poll_key,
            },
            completion: completion.clone(),
        });
        state.busy_message = Some(self.inner.default_busy_message.clone());
        tracing::info!(owner = %self.inner.owner, job_id = %id, "adopted in-flight job");
        Some(completion)
    }

    /// Completion handle of the running job, if it polls `poll_key`
    ///
    /// Lets a restarted session for the same key take over the release after
    /// the original session was stopped.
    #[must_use]
    pub fn rejoin(&self, poll_key: &PollKey) -> Option<CompletionHandle> {
        let state = self.inner.state.lock();
        let running = state.running.as_ref()?;
        if running.summary.poll_key.as_ref() != Some(poll_key) || running.completion.is_released() {
            return None;
        }
        tracing::info!(owner = %self.inner.owner, job_id = %running.summary.id, key = %poll_key, "rejoined running job");
        Some(running.completion.clone())
    }

    /// Whether a job holds the slot
    #[must_use]
    pub fn busy(&self) -> bool {
        self.inner.state.lock().running.is_some()
    }

    /// Message to show while busy
    #[must_use]
    pub fn busy_message(&self) -> Option<String> {
        self.inner.state.lock().busy_message.clone()
    }

    /// Number of waiting jobs
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    /// Owner key
    #[inline]
    #[must_use]
    pub fn owner(&self) -> &ProjectId {
        &self.inner.owner
    }

    /// Point-in-time view
    #[must_use]
    pub fn snapshot(&self) -> QueueSnapshot {
        let state = self.inner.state.lock();
        QueueSnapshot {
            owner: self.inner.owner.clone(),
            running: state.running.as_ref().map(|r| r.summary.clone()),
            pending: state.pending.iter().map(Job::summary).collect(),
            busy_message: state.busy_message.clone(),
        }
    }
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("owner", &self.inner.owner)
            .field("busy", &self.busy())
            .field("pending", &self.pending_len())
            .finish()
    }
}

/// Job queues keyed by owner; owners never block each other
#[derive(Clone)]
pub struct JobQueues {
    queues: Arc<DashMap<ProjectId, JobQueue>>,
    flags: Arc<dyn FlagStore>,
    config: SchedulerConfig,
}

impl JobQueues {
    /// Empty set of queues sharing `flags`
    #[must_use]
    pub fn new(flags: Arc<dyn FlagStore>, config: &SchedulerConfig) -> Self {
        Self {
            queues: Arc::new(DashMap::new()),
            flags,
            config: config.clone(),
        }
    }

    /// Queue for `owner`, created on first use
    #[must_use]
    pub fn for_owner(&self, owner: &ProjectId) -> JobQueue {
        self.queues
            .entry(owner.clone())
            .or_insert_with(|| JobQueue::new(owner.clone(), self.flags.clone(), &self.config))
            .clone()
    }

    /// Owners with a queue
    #[must_use]
    pub fn owners(&self) -> Vec<ProjectId> {
        let mut owners: Vec<ProjectId> = self.queues.iter().map(|e| e.key().clone()).collect();
        owners.sort();
        owners
    }
}

impl std::fmt::Debug for JobQueues {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueues")
            .field("owners", &self.queues.len())
            .finish_non_exhaustive()
    }
}
