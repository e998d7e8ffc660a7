//! Notification fan-out for terminal job outcomes
//!
//! Two scopes:
//! - Surface: direct callbacks registered for one poll key by whatever view
//!   is mounted.
//! - System: one global best-effort channel (toast/banner). Notices sent while
//!   no sink is mounted are dropped, never queued.

use crate::types::{Outcome, Payload, PollKey};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;

type SuccessFn = Arc<dyn Fn(&Payload) + Send + Sync>;
type ErrorFn = Arc<dyn Fn(&str) + Send + Sync>;

/// Surface-scoped listener pair
#[derive(Clone)]
pub struct Callbacks {
    on_success: SuccessFn,
    on_error: ErrorFn,
}

impl Callbacks {
    /// Listener pair from two closures
    pub fn new<S, E>(on_success: S, on_error: E) -> Self
    where
        S: Fn(&Payload) + Send + Sync + 'static,
        E: Fn(&str) + Send + Sync + 'static,
    {
        Self {
            on_success: Arc::new(on_success),
            on_error: Arc::new(on_error),
        }
    }

    /// Listener that ignores both outcomes
    #[must_use]
    pub fn noop() -> Self {
        Self::new(|_| {}, |_| {})
    }

    /// Invoke the matching half for `outcome`
    pub fn deliver(&self, outcome: &Outcome) {
        match outcome {
            Outcome::Success(payload) => (self.on_success)(payload),
            Outcome::Failure(message) => (self.on_error)(message),
        }
    }
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callbacks").finish_non_exhaustive()
    }
}

/// Severity of a system notice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    /// Job finished
    Success,
    /// Job failed
    Error,
}

/// A system-wide announcement
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemNotice {
    /// Poll key the notice is about
    pub key: PollKey,
    /// Severity
    pub level: NoticeLevel,
    /// Short headline
    pub title: String,
    /// Detail line
    pub message: String,
    /// When the outcome was observed
    pub at: DateTime<Utc>,
}

/// Where to deliver an outcome
#[derive(Debug, Clone, Copy)]
pub enum NotifyScope<'a> {
    /// Callbacks currently registered for a key
    Surface(&'a [Callbacks]),
    /// The global channel; `subject` names the job ("Network overview")
    System {
        /// Key the job ran under
        key: &'a PollKey,
        /// Job title used in the headline
        subject: &'a str,
    },
}

/// Delivers terminal outcomes to surfaces and the system channel
#[derive(Debug, Clone)]
pub struct NotificationBus {
    system: broadcast::Sender<SystemNotice>,
}

impl NotificationBus {
    /// Create a bus whose system channel buffers `capacity` notices per sink
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (system, _) = broadcast::channel(capacity.max(1));
        Self { system }
    }

    /// Mount a system sink; dropping it unmounts
    #[must_use]
    pub fn mount_sink(&self) -> NoticeSink {
        NoticeSink {
            rx: self.system.subscribe(),
        }
    }

    /// Number of mounted sinks
    #[inline]
    #[must_use]
    pub fn sink_count(&self) -> usize {
        self.system.receiver_count()
    }

    /// Deliver `outcome` to `scope`
    ///
    /// Returns how many listeners (surface) or sinks (system) were reached.
    pub fn notify(&self, scope: NotifyScope<'_>, outcome: &Outcome) -> usize {
        match scope {
            NotifyScope::Surface(listeners) => {
                for listener in listeners {
                    listener.deliver(outcome);
                }
                listeners.len()
            }
            NotifyScope::System { key, subject } => {
                let (level, title, message) = match outcome {
                    Outcome::Success(_) => (
                        NoticeLevel::Success,
                        format!("{subject} ready"),
                        format!("{subject} analysis finished."),
                    ),
                    Outcome::Failure(error) => (
                        NoticeLevel::Error,
                        format!("{subject} failed"),
                        error.clone(),
                    ),
                };
                self.notify_system(key.clone(), level, title, message)
            }
        }
    }

    /// Fire-and-forget system notice
    ///
    /// Returns the number of sinks that received it; zero means it was dropped.
    pub fn notify_system(
        &self,
        key: PollKey,
        level: NoticeLevel,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> usize {
        let notice = SystemNotice {
            key,
            level,
            title: title.into(),
            message: message.into(),
            at: Utc::now(),
        };
        match self.system.send(notice) {
            Ok(reached) => reached,
            Err(broadcast::error::SendError(dropped)) => {
                tracing::debug!(key = %dropped.key, title = %dropped.title, "no notice sink mounted, dropping");
                0
            }
        }
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new(64)
    }
}

/// A mounted system notice receiver (toast area, banner, CLI printer)
#[derive(Debug)]
pub struct NoticeSink {
    rx: broadcast::Receiver<SystemNotice>,
}

impl NoticeSink {
    /// Wait for the next notice; `None` once the bus is gone
    ///
    /// Notices missed because the sink fell behind are skipped.
    pub async fn recv(&mut self) -> Option<SystemNotice> {
        loop {
            match self.rx.recv().await {
                Ok(notice) => return Some(notice),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "notice sink lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next notice if one is already buffered
    pub fn try_recv(&mut self) -> Option<SystemNotice> {
        loop {
            match self.rx.try_recv() {
                Ok(notice) => return Some(notice),
                Err(broadcast::error::TryRecvError::Lagged(_)) => {}
                Err(_) => return None,
            }
        }
    }
}
