//! kache core types, errors and the `ObjectSource` seam.

#![forbid(unsafe_code)]

use std::fmt;

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

pub mod config;

pub use config::InformerConfig;

/// Stable identity of a resource: optional namespace plus name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self { namespace: namespace.map(|s| s.to_string()), name: name.to_string() }
    }

    /// Cluster-scoped key (no namespace).
    pub fn cluster(name: &str) -> Self { Self::new(None, name) }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Server-assigned cursor. Monotonic per object; only compared for ordering and resume.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceVersion(pub u64);

impl ResourceVersion {
    pub fn parse(s: &str) -> Result<Self, SourceError> {
        s.parse::<u64>()
            .map(ResourceVersion)
            .map_err(|_| SourceError::Malformed(format!("non-numeric resourceVersion {:?}", s)))
    }
}

impl fmt::Display for ResourceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.0) }
}

/// One tracked object. The payload is opaque to the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub key: ObjectKey,
    pub version: ResourceVersion,
    pub payload: serde_json::Value,
}

impl Resource {
    pub fn new(key: ObjectKey, version: ResourceVersion, payload: serde_json::Value) -> Self {
        Self { key, version, payload }
    }
}

/// Incremental change emitted by an `ObjectSource` watch.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Added(Resource),
    Modified(Resource),
    Deleted(Resource),
    /// Advances the cursor without a payload change.
    Bookmark(ResourceVersion),
    Error(SourceError),
}

impl WatchEvent {
    pub fn label(&self) -> &'static str {
        match self {
            WatchEvent::Added(_) => "added",
            WatchEvent::Modified(_) => "modified",
            WatchEvent::Deleted(_) => "deleted",
            WatchEvent::Bookmark(_) => "bookmark",
            WatchEvent::Error(_) => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeltaKind {
    Added,
    Updated,
    Deleted,
    /// Produced by a (re)list; the consumer decides between add and update.
    Sync,
}

/// Pending change for one key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    pub kind: DeltaKind,
    pub object: Resource,
}

impl Delta {
    pub fn new(kind: DeltaKind, object: Resource) -> Self { Self { kind, object } }
    pub fn key(&self) -> &ObjectKey { &self.object.key }
}

/// Failures reported by an `ObjectSource`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    /// Network or timeout; retried with backoff.
    #[error("transient source error: {0}")]
    Transient(String),
    /// The watch cursor is older than the retained history.
    #[error("resource version expired: {0}")]
    Expired(String),
    /// A single undecodable item.
    #[error("malformed event: {0}")]
    Malformed(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("invalid source configuration: {0}")]
    Config(String),
}

impl SourceError {
    /// Configuration-class failures end the informer.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SourceError::Auth(_) | SourceError::Config(_))
    }
}

/// Full snapshot plus the cursor to watch from.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub items: Vec<Resource>,
    pub version: ResourceVersion,
}

pub type WatchStream = BoxStream<'static, Result<WatchEvent, SourceError>>;

/// Remote collection the cache mirrors.
#[async_trait::async_trait]
pub trait ObjectSource: Send + Sync {
    async fn list(&self) -> Result<ListPage, SourceError>;

    /// Open a change stream starting after `from`.
    async fn watch(&self, from: ResourceVersion) -> Result<WatchStream, SourceError>;
}

pub mod prelude {
    pub use super::{
        Delta, DeltaKind, InformerConfig, ListPage, ObjectKey, ObjectSource, Resource, ResourceVersion, SourceError,
        WatchEvent, WatchStream,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_display() {
        assert_eq!(ObjectKey::new(Some("default"), "web").to_string(), "default/web");
        assert_eq!(ObjectKey::cluster("node-1").to_string(), "node-1");
    }

    #[test]
    fn resource_version_parse() {
        assert_eq!(ResourceVersion::parse("42").unwrap(), ResourceVersion(42));
        assert!(matches!(ResourceVersion::parse("abc"), Err(SourceError::Malformed(_))));
    }

    #[test]
    fn fatal_classification() {
        assert!(SourceError::Auth("denied".into()).is_fatal());
        assert!(SourceError::Config("no such kind".into()).is_fatal());
        assert!(!SourceError::Transient("reset".into()).is_fatal());
        assert!(!SourceError::Expired("too old".into()).is_fatal());
    }
}
