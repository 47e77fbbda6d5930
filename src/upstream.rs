//! Core types describing upstream pools and their targets.

use std::sync::Arc;
use std::time::SystemTime;

/// Identifies one logical upstream pool.
///
/// The key is unique across the whole deployment surface; at most one
/// persisted [Upstream] row exists per key, and the remote object it maps
/// to is reused for every subsequent deployment under that key.
#[derive(Clone, PartialEq, Eq, Ord, PartialOrd, Debug, Hash)]
pub struct UpstreamKey {
    pub org: Arc<str>,
    pub project: Arc<str>,
    pub env: Arc<str>,
    pub az: Arc<str>,
    pub name: Arc<str>,
}

impl UpstreamKey {
    pub fn new(
        org: impl ToString,
        project: impl ToString,
        env: impl ToString,
        az: impl ToString,
        name: impl ToString,
    ) -> Self {
        Self {
            org: org.to_string().into(),
            project: project.to_string().into(),
            env: env.to_string().into(),
            az: az.to_string().into(),
            name: name.to_string().into(),
        }
    }
}

impl std::fmt::Display for UpstreamKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}/{}",
            self.org, self.project, self.env, self.az, self.name
        )
    }
}

/// An opaque deployment generation identifier.
///
/// Generations advance monotonically per rollout; this crate only relies
/// on equality and ordering, never on the numeric value itself.
#[derive(Copy, Clone, PartialEq, Eq, Ord, PartialOrd, Debug, Hash)]
pub struct DeploymentId(pub u64);

impl std::fmt::Display for DeploymentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// The address of a single backend instance ("host:port" or equivalent).
#[derive(Clone, PartialEq, Eq, Ord, PartialOrd, Debug, Hash)]
pub struct TargetAddress(pub Arc<str>);

impl TargetAddress {
    pub fn new(address: impl ToString) -> Self {
        Self(address.to_string().into())
    }
}

impl serde::Serialize for TargetAddress {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.0.serialize(serializer)
    }
}

impl From<String> for TargetAddress {
    fn from(s: String) -> Self {
        Self(s.into())
    }
}

impl From<&'_ str> for TargetAddress {
    fn from(s: &'_ str) -> Self {
        Self(s.into())
    }
}

impl std::borrow::Borrow<str> for TargetAddress {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TargetAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// An identifier assigned by the gateway control plane to a remote object.
#[derive(Clone, PartialEq, Eq, Ord, PartialOrd, Debug, Hash)]
pub struct RemoteId(pub Arc<str>);

impl RemoteId {
    pub fn new(id: impl ToString) -> Self {
        Self(id.to_string().into())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<String> for RemoteId {
    fn from(s: String) -> Self {
        Self(s.into())
    }
}

impl From<&'_ str> for RemoteId {
    fn from(s: &'_ str) -> Self {
        Self(s.into())
    }
}

impl std::fmt::Display for RemoteId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// A creation timestamp reported by the gateway control plane.
///
/// These values come from the gateway's own clock and are only ever
/// compared against other gateway-reported values, which keeps freshness
/// decisions independent of local clock skew.
#[derive(Copy, Clone, PartialEq, Eq, Ord, PartialOrd, Debug, Hash, Default)]
pub struct RemoteTimestamp(pub i64);

impl serde::Serialize for RemoteTimestamp {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.0.serialize(serializer)
    }
}

impl std::fmt::Display for RemoteTimestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Store-assigned row id for an [Upstream].
#[derive(Copy, Clone, PartialEq, Eq, Ord, PartialOrd, Debug, Hash)]
pub struct UpstreamId(pub u64);

impl std::fmt::Display for UpstreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Store-assigned row id for a [Target].
#[derive(Copy, Clone, PartialEq, Eq, Ord, PartialOrd, Debug, Hash)]
pub struct TargetId(pub u64);

impl std::fmt::Display for TargetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// One persisted upstream pool.
#[derive(Clone, Debug)]
pub struct Upstream {
    pub id: UpstreamId,
    pub key: UpstreamKey,

    /// Remote object id assigned by the gateway on creation. Never changes
    /// once the row exists.
    pub remote_id: RemoteId,

    /// Health-check path the remote object was created with.
    pub healthcheck_path: String,

    /// The remote configuration blob returned at creation, stored verbatim.
    pub config: serde_json::Value,

    /// The latest generation recorded by an onboarding call.
    pub last_deployment: DeploymentId,

    /// Local time of the last onboarding event against this pool.
    pub updated_at: SystemTime,
}

/// Upstream row data ahead of id assignment by the store.
#[derive(Clone, Debug)]
pub struct NewUpstream {
    pub key: UpstreamKey,
    pub remote_id: RemoteId,
    pub healthcheck_path: String,
    pub config: serde_json::Value,
    pub last_deployment: DeploymentId,
}

/// One backend instance bound to an upstream for a single generation.
///
/// A row exists if and only if the target is still believed to be attached
/// to the remote upstream; the eviction process keeps the two convergent.
#[derive(Clone, Debug)]
pub struct Target {
    pub id: TargetId,
    pub upstream: UpstreamId,
    pub remote_id: RemoteId,
    pub address: TargetAddress,

    /// The generation that created this target. Never changes.
    pub deployment: DeploymentId,

    /// Gateway-reported creation time, used for freshness comparisons.
    pub created_at: RemoteTimestamp,
}

/// Target row data ahead of id assignment by the store.
#[derive(Clone, Debug)]
pub struct NewTarget {
    pub upstream: UpstreamId,
    pub remote_id: RemoteId,
    pub address: TargetAddress,
    pub deployment: DeploymentId,
    pub created_at: RemoteTimestamp,
}
