//! Resource documents and the kinds the control plane knows how to manage.

pub mod render;
pub mod sanitize;

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

pub use render::{ManifestRenderer, RenderParams};
pub use sanitize::{SanitizePolicy, SanitizeReport, sanitize, sanitize_batch};

/// Cluster object kinds with a known REST mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
	Namespace,
	ConfigMap,
	Secret,
	ServiceAccount,
	PersistentVolumeClaim,
	Pod,
	Deployment,
	StatefulSet,
	DaemonSet,
	ReplicaSet,
	Job,
	CronJob,
	Service,
	Ingress,
	NetworkPolicy,
	Role,
	RoleBinding,
	PodDisruptionBudget,
}

impl ResourceKind {
	pub const ALL: &'static [ResourceKind] = &[
		ResourceKind::Namespace,
		ResourceKind::ConfigMap,
		ResourceKind::Secret,
		ResourceKind::ServiceAccount,
		ResourceKind::PersistentVolumeClaim,
		ResourceKind::Pod,
		ResourceKind::Deployment,
		ResourceKind::StatefulSet,
		ResourceKind::DaemonSet,
		ResourceKind::ReplicaSet,
		ResourceKind::Job,
		ResourceKind::CronJob,
		ResourceKind::Service,
		ResourceKind::Ingress,
		ResourceKind::NetworkPolicy,
		ResourceKind::Role,
		ResourceKind::RoleBinding,
		ResourceKind::PodDisruptionBudget,
	];

	pub fn parse(kind: &str) -> Option<Self> {
		Self::ALL.iter().copied().find(|candidate| candidate.as_str() == kind)
	}

	pub fn as_str(self) -> &'static str {
		match self {
			ResourceKind::Namespace => "Namespace",
			ResourceKind::ConfigMap => "ConfigMap",
			ResourceKind::Secret => "Secret",
			ResourceKind::ServiceAccount => "ServiceAccount",
			ResourceKind::PersistentVolumeClaim => "PersistentVolumeClaim",
			ResourceKind::Pod => "Pod",
			ResourceKind::Deployment => "Deployment",
			ResourceKind::StatefulSet => "StatefulSet",
			ResourceKind::DaemonSet => "DaemonSet",
			ResourceKind::ReplicaSet => "ReplicaSet",
			ResourceKind::Job => "Job",
			ResourceKind::CronJob => "CronJob",
			ResourceKind::Service => "Service",
			ResourceKind::Ingress => "Ingress",
			ResourceKind::NetworkPolicy => "NetworkPolicy",
			ResourceKind::Role => "Role",
			ResourceKind::RoleBinding => "RoleBinding",
			ResourceKind::PodDisruptionBudget => "PodDisruptionBudget",
		}
	}

	/// Preferred `apiVersion` when no document supplies one.
	pub fn api_version(self) -> &'static str {
		match self {
			ResourceKind::Namespace
			| ResourceKind::ConfigMap
			| ResourceKind::Secret
			| ResourceKind::ServiceAccount
			| ResourceKind::PersistentVolumeClaim
			| ResourceKind::Pod
			| ResourceKind::Service => "v1",
			ResourceKind::Deployment | ResourceKind::StatefulSet | ResourceKind::DaemonSet | ResourceKind::ReplicaSet => "apps/v1",
			ResourceKind::Job | ResourceKind::CronJob => "batch/v1",
			ResourceKind::Ingress | ResourceKind::NetworkPolicy => "networking.k8s.io/v1",
			ResourceKind::Role | ResourceKind::RoleBinding => "rbac.authorization.k8s.io/v1",
			ResourceKind::PodDisruptionBudget => "policy/v1",
		}
	}

	/// Lowercase plural used in REST paths.
	pub fn plural(self) -> &'static str {
		match self {
			ResourceKind::Namespace => "namespaces",
			ResourceKind::ConfigMap => "configmaps",
			ResourceKind::Secret => "secrets",
			ResourceKind::ServiceAccount => "serviceaccounts",
			ResourceKind::PersistentVolumeClaim => "persistentvolumeclaims",
			ResourceKind::Pod => "pods",
			ResourceKind::Deployment => "deployments",
			ResourceKind::StatefulSet => "statefulsets",
			ResourceKind::DaemonSet => "daemonsets",
			ResourceKind::ReplicaSet => "replicasets",
			ResourceKind::Job => "jobs",
			ResourceKind::CronJob => "cronjobs",
			ResourceKind::Service => "services",
			ResourceKind::Ingress => "ingresses",
			ResourceKind::NetworkPolicy => "networkpolicies",
			ResourceKind::Role => "roles",
			ResourceKind::RoleBinding => "rolebindings",
			ResourceKind::PodDisruptionBudget => "poddisruptionbudgets",
		}
	}

	pub fn is_namespaced(self) -> bool {
		self != ResourceKind::Namespace
	}

	/// Path from the document root to the embedded pod spec.
	pub fn pod_spec_path(self) -> Option<&'static [&'static str]> {
		match self {
			ResourceKind::Pod => Some(&["spec"]),
			ResourceKind::Deployment | ResourceKind::StatefulSet | ResourceKind::DaemonSet | ResourceKind::ReplicaSet | ResourceKind::Job => {
				Some(&["spec", "template", "spec"])
			}
			ResourceKind::CronJob => Some(&["spec", "jobTemplate", "spec", "template", "spec"]),
			_ => None,
		}
	}

	/// Apply priority of this kind, see [`apply_rank`].
	pub fn rank(self) -> u8 {
		match self {
			ResourceKind::Namespace => 0,
			ResourceKind::ConfigMap | ResourceKind::Secret | ResourceKind::ServiceAccount | ResourceKind::PersistentVolumeClaim => 1,
			ResourceKind::Pod
			| ResourceKind::Deployment
			| ResourceKind::StatefulSet
			| ResourceKind::DaemonSet
			| ResourceKind::ReplicaSet
			| ResourceKind::Job
			| ResourceKind::CronJob => 2,
			ResourceKind::Service => 3,
			ResourceKind::Ingress => 4,
			_ => 5,
		}
	}
}

impl fmt::Display for ResourceKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Apply priority for a kind name: namespaces, then config and identity
/// objects, then workloads, then services, then ingress, then everything else.
pub fn apply_rank(kind: &str) -> u8 {
	ResourceKind::parse(kind).map_or(5, ResourceKind::rank)
}

/// Identity of one cluster object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceId {
	pub api_version: String,
	pub kind: String,
	pub name: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub namespace: Option<String>,
}

impl ResourceId {
	pub fn new(kind: ResourceKind, name: impl Into<String>, namespace: Option<&str>) -> Self {
		Self {
			api_version: kind.api_version().to_string(),
			kind: kind.as_str().to_string(),
			name: name.into(),
			namespace: namespace.filter(|_| kind.is_namespaced()).map(str::to_string),
		}
	}

	pub fn resource_kind(&self) -> Option<ResourceKind> {
		ResourceKind::parse(&self.kind)
	}
}

impl fmt::Display for ResourceId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match &self.namespace {
			Some(namespace) => write!(f, "{}/{} in namespace {}", self.kind, self.name, namespace),
			None => write!(f, "{}/{}", self.kind, self.name),
		}
	}
}

/// One rendered cluster object.
///
/// Always a mapping with string `kind`, `apiVersion`, and `metadata.name`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ResourceDocument(Value);

impl ResourceDocument {
	pub fn from_value(value: Value) -> std::result::Result<Self, String> {
		let Some(object) = value.as_object() else {
			return Err("document is not a mapping".to_string());
		};
		let kind = object.get("kind").and_then(Value::as_str).filter(|kind| !kind.is_empty());
		let Some(kind) = kind else {
			return Err("document has no kind".to_string());
		};
		if object.get("apiVersion").and_then(Value::as_str).is_none_or(str::is_empty) {
			return Err(format!("{kind} document has no apiVersion"));
		}
		let name = object.get("metadata").and_then(|metadata| metadata.get("name")).and_then(Value::as_str);
		if name.is_none_or(str::is_empty) {
			return Err(format!("{kind} document has no metadata.name"));
		}
		Ok(Self(value))
	}

	pub fn kind(&self) -> &str {
		self.0["kind"].as_str().unwrap_or_default()
	}

	pub fn resource_kind(&self) -> Option<ResourceKind> {
		ResourceKind::parse(self.kind())
	}

	pub fn api_version(&self) -> &str {
		self.0["apiVersion"].as_str().unwrap_or_default()
	}

	pub fn name(&self) -> &str {
		self.0["metadata"]["name"].as_str().unwrap_or_default()
	}

	pub fn namespace(&self) -> Option<&str> {
		self.0["metadata"]["namespace"].as_str()
	}

	pub fn label(&self, key: &str) -> Option<&str> {
		self.0["metadata"]["labels"][key].as_str()
	}

	pub fn id(&self) -> ResourceId {
		ResourceId {
			api_version: self.api_version().to_string(),
			kind: self.kind().to_string(),
			name: self.name().to_string(),
			namespace: self.namespace().map(str::to_string),
		}
	}

	/// Embedded pod spec for workload-shaped kinds.
	pub fn pod_spec(&self) -> Option<&Value> {
		let path = self.resource_kind()?.pod_spec_path()?;
		path.iter().try_fold(&self.0, |node, key| node.get(key)).filter(|spec| spec.is_object())
	}

	pub fn as_value(&self) -> &Value {
		&self.0
	}

	pub fn into_value(self) -> Value {
		self.0
	}

	pub(crate) fn value_mut(&mut self) -> &mut Value {
		&mut self.0
	}
}

impl<'de> Deserialize<'de> for ResourceDocument {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
		let value = Value::deserialize(deserializer)?;
		Self::from_value(value).map_err(serde::de::Error::custom)
	}
}

/// Returns the object at `path` under `root`, creating empty maps on the way.
pub(crate) fn object_at<'a>(root: &'a mut Value, path: &[&str]) -> Option<&'a mut Map<String, Value>> {
	let mut node = root;
	for key in path {
		if node.is_null() {
			*node = Value::Object(Map::new());
		}
		node = node.as_object_mut()?.entry(key.to_string()).or_insert(Value::Null);
	}
	if node.is_null() {
		*node = Value::Object(Map::new());
	}
	node.as_object_mut()
}

/// Stable sort by apply priority.
pub fn sort_for_apply(documents: &mut [ResourceDocument]) {
	documents.sort_by_key(|document| apply_rank(document.kind()));
}
