//! netaudit core - background analysis scheduler
//!
//! Runs long backend analyses (network overview, recommendations, topology,
//! per-device summaries and config drift) without blocking the surfaces that
//! request them:
//! - Serializes mutating start calls per project through a FIFO job queue
//! - Polls each job's status in a background loop, one loop per poll key
//! - Persists an in-flight flag so a restarted process picks polling back up
//! - Announces terminal outcomes to mounted surfaces and a system channel
//!
//! # Example
//!
//! ```rust,ignore
//! use netaudit_core::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let services = SchedulerServices::new(
//!     Arc::new(MemoryFlagStore::new()),
//!     Arc::new(SimulatedBackend::new()),
//!     SchedulerConfig::new(),
//! );
//! let overview = services.coordinator(AnalysisKind::NetworkOverview, ResourceId::project("P1"))?;
//!
//! overview.mount(Callbacks::noop())?;
//! overview.request_analysis(Callbacks::new(
//!     |payload| println!("ready: {payload}"),
//!     |error| eprintln!("failed: {error}"),
//! ));
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod flags;
pub mod logging;
pub mod notify;
pub mod polling;
pub mod queue;
pub mod simulator;
pub mod state_machine;
pub mod types;

// Re-exports for convenience
pub use backend::{AnalysisBackend, BackendFetcher, StatusFetcher};
pub use config::SchedulerConfig;
pub use coordinator::{FeatureCoordinator, MountOutcome, SchedulerServices};
pub use error::{
    classify_start_error, BackendError, ConfigError, FlagStoreError, JobError, PollingError,
    SchedulerError, StartErrorClass, StateMachineError, TargetError,
};
pub use flags::{FileFlagStore, FlagStore, MemoryFlagStore};
pub use logging::{init_tracing, LogFormat, LogLevel, LoggingConfig};
pub use notify::{Callbacks, NoticeLevel, NoticeSink, NotificationBus, NotifyScope, SystemNotice};
pub use polling::{PollRequest, PollingRegistry, SessionInfo, SessionState};
pub use queue::{
    CompletionHandle, Job, JobContext, JobQueue, JobQueues, JobSummary, QueueSnapshot, RunRequest,
    StartFuture,
};
pub use simulator::{Script, SimulatedBackend};
pub use state_machine::JobState;
pub use types::{
    AnalysisKind, AnalysisMetrics, AnalysisStatus, AnalysisTarget, DeviceId, DocumentId, JobId,
    Outcome, Payload, PollKey, ProjectId, ResourceId,
};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for wiring up the scheduler
    pub use crate::{
        AnalysisBackend, AnalysisKind, AnalysisStatus, AnalysisTarget, Callbacks,
        FeatureCoordinator, FileFlagStore, FlagStore, JobState, MemoryFlagStore, MountOutcome,
        PollKey, ProjectId, ResourceId, RunRequest, SchedulerConfig, SchedulerServices,
        SimulatedBackend,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
