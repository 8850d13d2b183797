//! Access to the cluster API.
//!
//! [`ClusterApi`] is the seam between session logic and the cluster:
//! [`KubeClient`] talks to a real API server over REST, [`InMemoryCluster`]
//! keeps objects in a map for tests and dry runs.

pub mod credentials;
pub mod kube;
pub mod memory;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::manifest::{ResourceDocument, ResourceId, ResourceKind};

pub use credentials::ClusterCredentials;
pub use kube::KubeClient;
pub use memory::{ClusterOperation, InMemoryCluster};

#[derive(Debug, Error)]
pub enum ClusterError {
	#[error("{0} not found")]
	NotFound(ResourceId),
	#[error("{0} already exists")]
	AlreadyExists(ResourceId),
	#[error("cluster API returned HTTP {status}: {message}")]
	Api { status: u16, message: String },
	#[error("cluster request failed: {0}")]
	Transport(String),
	#[error("cluster credentials: {0}")]
	Credentials(String),
	#[error("unsupported resource kind '{0}'")]
	UnsupportedKind(String),
	#[error("cluster response parsing failed: {0}")]
	Serialization(#[from] serde_json::Error),
}

impl ClusterError {
	pub fn status(&self) -> Option<u16> {
		match self {
			ClusterError::NotFound(_) => Some(404),
			ClusterError::AlreadyExists(_) => Some(409),
			ClusterError::Api { status, .. } => Some(*status),
			_ => None,
		}
	}

	/// The caller may not list or read this kind; deletion skips such kinds.
	pub fn is_forbidden_or_missing(&self) -> bool {
		matches!(self.status(), Some(401 | 403 | 404))
	}
}

pub type ClusterResult<T> = std::result::Result<T, ClusterError>;

/// Which part of a pod's log to read.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogOptions {
	#[serde(default)]
	pub container: Option<String>,
	/// Stop after this many bytes.
	#[serde(default)]
	pub limit_bytes: Option<u64>,
	/// Only the last N lines.
	#[serde(default)]
	pub tail_lines: Option<u64>,
	/// Prefix every line with its RFC 3339 timestamp.
	#[serde(default)]
	pub timestamps: bool,
}

#[async_trait]
pub trait ClusterApi: Send + Sync {
	/// Reads one object; `Ok(None)` when it does not exist.
	async fn get(&self, id: &ResourceId) -> ClusterResult<Option<Value>>;

	async fn create(&self, document: &ResourceDocument) -> ClusterResult<Value>;

	/// Replaces an existing object. The document must carry the current `resourceVersion`.
	async fn replace(&self, document: &ResourceDocument) -> ClusterResult<Value>;

	/// Deletes one object; `Ok(false)` when it was already gone.
	async fn delete(&self, id: &ResourceId) -> ClusterResult<bool>;

	/// Lists objects of `kind` in `namespace` matching a label selector of
	/// equality (`k=v`) and existence (`k`) terms.
	async fn list(&self, kind: ResourceKind, namespace: &str, label_selector: &str) -> ClusterResult<Vec<Value>>;

	/// Applies a JSON merge patch to an existing object.
	async fn patch(&self, id: &ResourceId, patch: &Value) -> ClusterResult<Value>;

	/// Reads the log of one pod.
	async fn pod_logs(&self, namespace: &str, pod: &str, options: &LogOptions) -> ClusterResult<String>;
}

/// Parses a label selector into `(key, Some(value))` equality terms and `(key, None)` existence terms.
pub(crate) fn parse_selector(selector: &str) -> Vec<(&str, Option<&str>)> {
	selector
		.split(',')
		.map(str::trim)
		.filter(|term| !term.is_empty())
		.map(|term| match term.split_once('=') {
			Some((key, value)) => (key.trim(), Some(value.trim())),
			None => (term, None),
		})
		.collect()
}

/// Whether `object`'s labels satisfy every selector term.
pub(crate) fn labels_match(object: &Value, selector: &[(&str, Option<&str>)]) -> bool {
	let labels = &object["metadata"]["labels"];
	selector.iter().all(|(key, value)| match value {
		Some(value) => labels.get(*key).and_then(Value::as_str) == Some(*value),
		None => labels.get(*key).is_some_and(Value::is_string),
	})
}
