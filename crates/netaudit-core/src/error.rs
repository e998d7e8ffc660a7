//! Error types for the analysis scheduler
//!
//! Provides error handling for:
//! - Backend transport and status failures
//! - Polling registry misuse
//! - Durable flag store I/O
//! - Job start failures
//! - Configuration loading

use crate::types::{AnalysisKind, PollKey};

/// Main scheduler error type
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// Analysis backend failed
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    /// Polling registry error
    #[error("polling error: {0}")]
    Polling(#[from] PollingError),

    /// Flag store error
    #[error("flag store error: {0}")]
    FlagStore(#[from] FlagStoreError),

    /// Job failed to start
    #[error("job error: {0}")]
    Job(#[from] JobError),

    /// Invalid analysis target
    #[error("target error: {0}")]
    Target(#[from] TargetError),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Illegal job state transition
    #[error("state machine error: {0}")]
    StateMachine(#[from] StateMachineError),
}

impl SchedulerError {
    /// Check if error is retryable
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Backend(e) => e.is_transient(),
            Self::Job(JobError::StartRejected(e)) => e.is_transient(),
            Self::FlagStore(FlagStoreError::Io(_)) => true,
            _ => false,
        }
    }
}

/// Analysis backend errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// Client-side deadline expired; the backend may still be working
    #[error("request timed out")]
    Timeout,

    /// Connection dropped mid-request
    #[error("connection reset")]
    ConnectionReset,

    /// Any other transport failure
    #[error("transport failure: {0}")]
    Transport(String),

    /// Backend answered with an error status
    #[error("rejected with status {status}: {message}")]
    Rejected {
        /// Status code reported by the backend
        status: u16,
        /// Backend message
        message: String,
    },

    /// Response body could not be decoded
    #[error("undecodable response: {0}")]
    Decode(String),
}

impl BackendError {
    /// Transport-level hiccups that do not say anything about the job itself
    #[inline]
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout | Self::ConnectionReset)
    }
}

/// How the scheduler treats a failed start call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartErrorClass {
    /// Job may still be running server-side; polling decides the outcome
    Ignorable,
    /// Job never started; fail it immediately
    Fatal,
}

/// Classify a start-call failure
///
/// Timeouts and connection resets are ignorable because the start call is
/// fire-and-forget and the backend may finish regardless. Everything else
/// means the job was never accepted.
#[must_use]
pub fn classify_start_error(error: &BackendError) -> StartErrorClass {
    if error.is_transient() {
        StartErrorClass::Ignorable
    } else {
        StartErrorClass::Fatal
    }
}

/// Polling registry errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PollingError {
    /// A loop already exists for this key
    #[error("already polling {0}")]
    AlreadyPolling(PollKey),

    /// No loop exists for this key
    #[error("not polling {0}")]
    NotPolling(PollKey),
}

/// Durable flag store errors
#[derive(Debug, thiserror::Error)]
pub enum FlagStoreError {
    /// Reading or writing the backing file failed
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    /// Backing file is not a flat JSON object
    #[error("malformed flag file: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Job start errors
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// Backend refused the start call
    #[error("start rejected: {0}")]
    StartRejected(BackendError),

    /// Thunk failed before issuing the start call
    #[error("job failed to launch: {0}")]
    Thunk(String),

    /// In-flight flag could not be written
    #[error("flag write failed: {0}")]
    Flag(#[from] FlagStoreError),

    /// Polling session could not be registered
    #[error("polling registration failed: {0}")]
    Polling(#[from] PollingError),
}

/// Invalid (kind, resource) combinations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TargetError {
    /// Resource scope does not fit the analysis kind
    #[error("{kind} cannot target {resource}")]
    ScopeMismatch {
        /// Requested kind
        kind: AnalysisKind,
        /// Offending resource
        resource: String,
    },

    /// Drift needs `from < to`
    #[error("invalid version range {from}..{to}")]
    InvalidVersionRange {
        /// Older version
        from: u32,
        /// Newer version
        to: u32,
    },
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),

    /// Config file is not valid TOML for this schema
    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// State machine errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StateMachineError {
    /// Transition not in the allowed table
    #[error("illegal transition {from:?} -> {to:?}")]
    IllegalTransition {
        /// Current state
        from: crate::state_machine::JobState,
        /// Requested state
        to: crate::state_machine::JobState,
    },
}
