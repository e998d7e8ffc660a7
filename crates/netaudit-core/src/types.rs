//! Core types for the analysis scheduler
//!
//! Defines the identifiers the scheduler is keyed by:
//! - Project / device / document identifiers
//! - Analysis kinds and their targets
//! - Poll keys and durable flag keys
//! - Backend status results and terminal outcomes

use crate::error::TargetError;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Opaque analysis payload returned by the backend
pub type Payload = serde_json::Value;

/// Default prefix for durable in-flight flags
pub const DEFAULT_FLAG_PREFIX: &str = "llm_generating_";

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            /// Create from anything string-like
            #[inline]
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Borrow as str
            #[inline]
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

string_id!(
    /// Project identifier; the owner key of a job queue
    ProjectId
);
string_id!(
    /// Device identifier within a project
    DeviceId
);
string_id!(
    /// Stored configuration document identifier
    DocumentId
);

/// Unique job identifier (ULID for sortability)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId(pub Ulid);

impl JobId {
    /// Generate new job ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kinds of analysis the backend can run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisKind {
    /// Whole-network overview
    NetworkOverview,
    /// Project-wide recommendations
    Recommendations,
    /// Topology inference
    Topology,
    /// Per-device summary
    DeviceOverview,
    /// Per-device recommendations
    DeviceRecommendations,
    /// Configuration drift between two document versions
    DeviceConfigDrift,
}

impl AnalysisKind {
    /// All kinds, in display order
    pub const ALL: [AnalysisKind; 6] = [
        AnalysisKind::NetworkOverview,
        AnalysisKind::Recommendations,
        AnalysisKind::Topology,
        AnalysisKind::DeviceOverview,
        AnalysisKind::DeviceRecommendations,
        AnalysisKind::DeviceConfigDrift,
    ];

    /// Feature name used when deriving poll and flag keys
    #[inline]
    #[must_use]
    pub fn feature(self) -> &'static str {
        match self {
            AnalysisKind::NetworkOverview => "overview",
            AnalysisKind::Recommendations => "recommendations",
            AnalysisKind::Topology => "topology",
            AnalysisKind::DeviceOverview => "device_overview",
            AnalysisKind::DeviceRecommendations => "device_recs",
            AnalysisKind::DeviceConfigDrift => "device_drift",
        }
    }

    /// Human-readable title for notices
    #[inline]
    #[must_use]
    pub fn title(self) -> &'static str {
        match self {
            AnalysisKind::NetworkOverview => "Network overview",
            AnalysisKind::Recommendations => "Recommendations",
            AnalysisKind::Topology => "Topology",
            AnalysisKind::DeviceOverview => "Device summary",
            AnalysisKind::DeviceRecommendations => "Device recommendations",
            AnalysisKind::DeviceConfigDrift => "Configuration drift",
        }
    }

    /// Whether this kind targets a single device
    #[inline]
    #[must_use]
    pub fn is_device_scoped(self) -> bool {
        matches!(
            self,
            AnalysisKind::DeviceOverview
                | AnalysisKind::DeviceRecommendations
                | AnalysisKind::DeviceConfigDrift
        )
    }
}

impl std::fmt::Display for AnalysisKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.feature())
    }
}

/// Resource an analysis runs against
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceId {
    /// A whole project
    Project(ProjectId),
    /// One device in a project
    Device {
        /// Owning project
        project: ProjectId,
        /// Device
        device: DeviceId,
    },
    /// Two versions of one device's configuration document
    Drift {
        /// Owning project
        project: ProjectId,
        /// Device the document belongs to
        device: DeviceId,
        /// Stored document
        document: DocumentId,
        /// Older version
        from_version: u32,
        /// Newer version
        to_version: u32,
    },
}

impl ResourceId {
    /// Project-scoped resource
    #[inline]
    #[must_use]
    pub fn project(project: impl Into<ProjectId>) -> Self {
        Self::Project(project.into())
    }

    /// Device-scoped resource
    #[inline]
    #[must_use]
    pub fn device(project: impl Into<ProjectId>, device: impl Into<DeviceId>) -> Self {
        Self::Device {
            project: project.into(),
            device: device.into(),
        }
    }

    /// Drift resource comparing two versions of a device document
    #[inline]
    #[must_use]
    pub fn drift(
        project: impl Into<ProjectId>,
        device: impl Into<DeviceId>,
        document: impl Into<DocumentId>,
        from_version: u32,
        to_version: u32,
    ) -> Self {
        Self::Drift {
            project: project.into(),
            device: device.into(),
            document: document.into(),
            from_version,
            to_version,
        }
    }

    /// Owning project (the queue owner key)
    #[must_use]
    pub fn project_id(&self) -> &ProjectId {
        match self {
            ResourceId::Project(project)
            | ResourceId::Device { project, .. }
            | ResourceId::Drift { project, .. } => project,
        }
    }

    /// Device, if device-scoped
    #[must_use]
    pub fn device_id(&self) -> Option<&DeviceId> {
        match self {
            ResourceId::Project(_) => None,
            ResourceId::Device { device, .. } | ResourceId::Drift { device, .. } => Some(device),
        }
    }
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceId::Project(project) => write!(f, "{project}"),
            ResourceId::Device { project, device } => write!(f, "{project}/{device}"),
            ResourceId::Drift {
                project,
                device,
                document,
                from_version,
                to_version,
            } => write!(
                f,
                "{project}/{device}/{document}@{from_version}..{to_version}"
            ),
        }
    }
}

/// A validated (kind, resource) pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AnalysisTarget {
    kind: AnalysisKind,
    resource: ResourceId,
}

impl AnalysisTarget {
    /// Pair a kind with a resource
    ///
    /// # Errors
    /// `TargetError` if the resource scope does not fit the kind
    pub fn new(kind: AnalysisKind, resource: ResourceId) -> Result<Self, TargetError> {
        let fits = match (&resource, kind) {
            (ResourceId::Project(_), k) => !k.is_device_scoped(),
            (ResourceId::Device { .. }, k) => {
                k.is_device_scoped() && k != AnalysisKind::DeviceConfigDrift
            }
            (ResourceId::Drift { .. }, k) => k == AnalysisKind::DeviceConfigDrift,
        };
        if !fits {
            return Err(TargetError::ScopeMismatch {
                kind,
                resource: resource.to_string(),
            });
        }
        if let ResourceId::Drift {
            from_version,
            to_version,
            ..
        } = &resource
        {
            if from_version >= to_version {
                return Err(TargetError::InvalidVersionRange {
                    from: *from_version,
                    to: *to_version,
                });
            }
        }
        Ok(Self { kind, resource })
    }

    /// Analysis kind
    #[inline]
    #[must_use]
    pub fn kind(&self) -> AnalysisKind {
        self.kind
    }

    /// Target resource
    #[inline]
    #[must_use]
    pub fn resource(&self) -> &ResourceId {
        &self.resource
    }

    /// Poll key partitioning this target's polling session
    #[must_use]
    pub fn poll_key(&self) -> PollKey {
        PollKey::for_target(self.kind, &self.resource)
    }
}

/// Key partitioning polling sessions: `{feature}_{project}[_{device}]`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PollKey(String);

impl PollKey {
    /// Derive the key for a kind and resource
    #[must_use]
    pub fn for_target(kind: AnalysisKind, resource: &ResourceId) -> Self {
        match resource.device_id() {
            Some(device) => Self(format!(
                "{}_{}_{}",
                kind.feature(),
                resource.project_id(),
                device
            )),
            None => Self(format!("{}_{}", kind.feature(), resource.project_id())),
        }
    }

    /// Wrap a raw key (e.g. one read back from the flag store)
    #[inline]
    #[must_use]
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Durable flag key: `{prefix}{poll_key}`
    #[inline]
    #[must_use]
    pub fn flag_key(&self, prefix: &str) -> String {
        format!("{prefix}{}", self.0)
    }

    /// Borrow as str
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PollKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Optional metrics reported alongside a ready result
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisMetrics {
    /// Backend-side generation time
    pub duration_ms: Option<u64>,
    /// Tokens consumed by the inference call
    pub tokens_used: Option<u64>,
}

/// Result of one status check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AnalysisStatus {
    /// Still running; keep polling
    Empty,
    /// Finished
    Ready {
        /// Analysis content
        payload: Payload,
        /// Generation metrics, if reported
        #[serde(default)]
        metrics: Option<AnalysisMetrics>,
    },
}

impl AnalysisStatus {
    /// Ready result without metrics
    #[inline]
    #[must_use]
    pub fn ready(payload: Payload) -> Self {
        Self::Ready {
            payload,
            metrics: None,
        }
    }

    /// Whether this status ends polling
    #[inline]
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }
}

/// Terminal outcome of a job
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Backend reported a ready result
    Success(Payload),
    /// A status check or start call failed
    Failure(String),
}

impl Outcome {
    /// Whether the job succeeded
    #[inline]
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_keys_follow_feature_project_device_layout() {
        let overview = AnalysisTarget::new(AnalysisKind::NetworkOverview, ResourceId::project("P1"))
            .unwrap();
        assert_eq!(overview.poll_key().as_str(), "overview_P1");

        let recs = AnalysisTarget::new(
            AnalysisKind::DeviceRecommendations,
            ResourceId::device("P1", "SW1"),
        )
        .unwrap();
        assert_eq!(recs.poll_key().as_str(), "device_recs_P1_SW1");
    }

    #[test]
    fn flag_key_prefixes_poll_key() {
        let key = PollKey::for_target(AnalysisKind::NetworkOverview, &ResourceId::project("P1"));
        assert_eq!(
            key.flag_key(DEFAULT_FLAG_PREFIX),
            "llm_generating_overview_P1"
        );
    }

    #[test]
    fn drift_key_is_device_level() {
        let resource = ResourceId::Drift {
            project: "P1".into(),
            device: "R1".into(),
            document: "doc-9".into(),
            from_version: 1,
            to_version: 3,
        };
        let target = AnalysisTarget::new(AnalysisKind::DeviceConfigDrift, resource).unwrap();
        assert_eq!(target.poll_key().as_str(), "device_drift_P1_R1");
    }

    #[test]
    fn target_rejects_scope_mismatch() {
        let err = AnalysisTarget::new(AnalysisKind::DeviceOverview, ResourceId::project("P1"));
        assert!(matches!(err, Err(TargetError::ScopeMismatch { .. })));

        let err = AnalysisTarget::new(AnalysisKind::Topology, ResourceId::device("P1", "SW1"));
        assert!(err.is_err());

        let err = AnalysisTarget::new(
            AnalysisKind::DeviceConfigDrift,
            ResourceId::device("P1", "SW1"),
        );
        assert!(err.is_err());
    }

    #[test]
    fn drift_requires_ascending_versions() {
        let resource = ResourceId::Drift {
            project: "P1".into(),
            device: "R1".into(),
            document: "doc".into(),
            from_version: 4,
            to_version: 4,
        };
        let err = AnalysisTarget::new(AnalysisKind::DeviceConfigDrift, resource);
        assert!(matches!(
            err,
            Err(TargetError::InvalidVersionRange { from: 4, to: 4 })
        ));
    }

    #[test]
    fn status_deserializes_from_tagged_json() {
        let empty: AnalysisStatus = serde_json::from_str(r#"{"status":"empty"}"#).unwrap();
        assert_eq!(empty, AnalysisStatus::Empty);

        let ready: AnalysisStatus =
            serde_json::from_str(r#"{"status":"ready","payload":{"summary":"ok"}}"#).unwrap();
        assert!(ready.is_ready());
    }
}
