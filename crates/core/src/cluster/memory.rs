//! In-memory cluster for tests and local dry runs.
//!
//! Mirrors the API server behaviors the control plane relies on: create
//! conflicts, replace requiring the current `resourceVersion`, immutable
//! Service `clusterIP`, label-selector listing, JSON merge patches. With
//! [`InMemoryCluster::with_workloads`] every Deployment or StatefulSet with a
//! non-zero `spec.replicas` also gets a running, ready pod that is removed
//! together with its owner or when it is scaled to zero.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};

use super::{ClusterApi, ClusterError, ClusterResult, LogOptions, labels_match, parse_selector};
use crate::manifest::{ResourceDocument, ResourceId, ResourceKind};

/// Mutating call recorded by the in-memory cluster, as `Kind/name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterOperation {
	Create(String),
	Replace(String),
	Patch(String),
	Delete(String),
}

/// Placed before every line when timestamps are requested.
const LOG_TIMESTAMP: &str = "2026-01-01T00:00:00.000000000Z";

type Key = (String, String, String);

fn key(kind: &str, namespace: Option<&str>, name: &str) -> Key {
	(kind.to_string(), namespace.unwrap_or_default().to_string(), name.to_string())
}

#[derive(Default)]
struct State {
	objects: BTreeMap<Key, Value>,
	operations: Vec<ClusterOperation>,
	failures: HashMap<(String, String), String>,
	logs: HashMap<Key, String>,
	workload_ip: Option<String>,
	next_version: u64,
	next_cluster_ip: u8,
}

impl State {
	fn check_failure(&self, id: &ResourceId) -> ClusterResult<()> {
		match self.failures.get(&(id.kind.clone(), id.name.clone())) {
			Some(message) => Err(ClusterError::Api {
				status: 500,
				message: message.clone(),
			}),
			None => Ok(()),
		}
	}

	fn stamp_version(&mut self, object: &mut Value) {
		self.next_version += 1;
		object["metadata"]["resourceVersion"] = Value::String(self.next_version.to_string());
	}

	fn spawn_pod(&mut self, owner: &Value) {
		let Some(ip) = self.workload_ip.clone() else {
			return;
		};
		let kind = owner["kind"].as_str().unwrap_or_default();
		if !matches!(kind, "Deployment" | "StatefulSet") || owner["spec"]["replicas"].as_u64() == Some(0) {
			return;
		}
		let name = owner["metadata"]["name"].as_str().unwrap_or_default();
		let namespace = owner["metadata"]["namespace"].as_str();
		let pod_name = format!("{name}-0");
		let mut pod = json!({
			"apiVersion": "v1",
			"kind": "Pod",
			"metadata": {
				"name": pod_name,
				"namespace": namespace,
				"labels": owner["spec"]["template"]["metadata"]["labels"].clone(),
				"ownerReferences": [{"kind": kind, "name": name}]
			},
			"spec": owner["spec"]["template"]["spec"].clone(),
			"status": {
				"phase": "Running",
				"podIP": ip,
				"conditions": [{"type": "Ready", "status": "True"}]
			}
		});
		self.stamp_version(&mut pod);
		self.objects.insert(key("Pod", namespace, &pod_name), pod);
	}

	fn remove_owned(&mut self, owner: &ResourceId) {
		self.objects.retain(|_, object| {
			let owned = object["metadata"]["ownerReferences"]
				.as_array()
				.is_some_and(|refs| refs.iter().any(|r| r["kind"] == owner.kind.as_str() && r["name"] == owner.name.as_str()));
			!owned
		});
	}
}

#[derive(Default)]
pub struct InMemoryCluster {
	state: Mutex<State>,
}

impl InMemoryCluster {
	pub fn new() -> Self {
		Self::default()
	}

	/// Workloads get a ready pod with `ip` as its address.
	pub fn with_workloads(ip: impl Into<String>) -> Self {
		let cluster = Self::new();
		cluster.state.lock().workload_ip = Some(ip.into());
		cluster
	}

	/// Makes every create or replace of `kind`/`name` fail.
	pub fn fail_on(&self, kind: &str, name: &str, message: &str) {
		self.state.lock().failures.insert((kind.to_string(), name.to_string()), message.to_string());
	}

	pub fn operations(&self) -> Vec<ClusterOperation> {
		self.state.lock().operations.clone()
	}

	pub fn clear_operations(&self) {
		self.state.lock().operations.clear();
	}

	/// Stores a raw object, replacing any previous one with the same identity.
	pub fn insert(&self, object: Value) {
		let kind = object["kind"].as_str().unwrap_or_default().to_string();
		let name = object["metadata"]["name"].as_str().unwrap_or_default().to_string();
		let namespace = object["metadata"]["namespace"].as_str().map(str::to_string);
		self.state.lock().objects.insert(key(&kind, namespace.as_deref(), &name), object);
	}

	/// Sets the log text returned for `pod`.
	pub fn set_pod_logs(&self, namespace: &str, pod: &str, text: impl Into<String>) {
		self.state.lock().logs.insert(key("Pod", Some(namespace), pod), text.into());
	}

	pub fn object(&self, kind: &str, namespace: Option<&str>, name: &str) -> Option<Value> {
		self.state.lock().objects.get(&key(kind, namespace, name)).cloned()
	}

	/// Number of stored objects of `kind`.
	pub fn count(&self, kind: &str) -> usize {
		self.state.lock().objects.keys().filter(|(k, _, _)| k == kind).count()
	}

	pub fn is_empty(&self) -> bool {
		self.state.lock().objects.is_empty()
	}
}

/// RFC 7386: objects merge recursively, `null` removes, anything else replaces.
fn merge_patch(target: &mut Value, patch: &Value) {
	let Value::Object(fields) = patch else {
		*target = patch.clone();
		return;
	};
	if !target.is_object() {
		*target = Value::Object(Default::default());
	}
	let Value::Object(object) = target else { return };
	for (name, value) in fields {
		if value.is_null() {
			object.remove(name);
		} else {
			merge_patch(object.entry(name.clone()).or_insert(Value::Null), value);
		}
	}
}

/// Keeps the last `tail` lines, then the first `limit` bytes.
fn select_log(text: &str, options: &LogOptions) -> String {
	let lines: Vec<&str> = text.lines().collect();
	let skip = options.tail_lines.map_or(0, |tail| lines.len().saturating_sub(usize::try_from(tail).unwrap_or(usize::MAX)));
	let mut selected = String::new();
	for line in &lines[skip..] {
		if options.timestamps {
			selected.push_str(LOG_TIMESTAMP);
			selected.push(' ');
		}
		selected.push_str(line);
		selected.push('\n');
	}
	if let Some(limit) = options.limit_bytes.and_then(|limit| usize::try_from(limit).ok()) {
		if selected.len() > limit {
			let mut end = limit;
			while !selected.is_char_boundary(end) {
				end -= 1;
			}
			selected.truncate(end);
		}
	}
	selected
}

fn supported(document: &ResourceDocument) -> ClusterResult<ResourceKind> {
	document.resource_kind().ok_or_else(|| ClusterError::UnsupportedKind(document.kind().to_string()))
}

#[async_trait]
impl ClusterApi for InMemoryCluster {
	async fn get(&self, id: &ResourceId) -> ClusterResult<Option<Value>> {
		Ok(self.object(&id.kind, id.namespace.as_deref(), &id.name))
	}

	async fn create(&self, document: &ResourceDocument) -> ClusterResult<Value> {
		let kind = supported(document)?;
		let id = document.id();
		let mut state = self.state.lock();
		state.check_failure(&id)?;
		let key = key(&id.kind, id.namespace.as_deref(), &id.name);
		if state.objects.contains_key(&key) {
			return Err(ClusterError::AlreadyExists(id));
		}

		let mut object = document.as_value().clone();
		state.stamp_version(&mut object);
		if kind == ResourceKind::Service && object["spec"].get("clusterIP").is_none() && object["spec"].is_object() {
			state.next_cluster_ip = state.next_cluster_ip.wrapping_add(1);
			object["spec"]["clusterIP"] = Value::String(format!("10.96.0.{}", state.next_cluster_ip));
		}
		state.spawn_pod(&object);
		state.objects.insert(key, object.clone());
		state.operations.push(ClusterOperation::Create(format!("{}/{}", id.kind, id.name)));
		Ok(object)
	}

	async fn replace(&self, document: &ResourceDocument) -> ClusterResult<Value> {
		let kind = supported(document)?;
		let id = document.id();
		let mut state = self.state.lock();
		state.check_failure(&id)?;
		let key = key(&id.kind, id.namespace.as_deref(), &id.name);
		let Some(current) = state.objects.get(&key) else {
			return Err(ClusterError::NotFound(id));
		};

		let current_version = &current["metadata"]["resourceVersion"];
		if document.as_value()["metadata"]["resourceVersion"] != *current_version {
			return Err(ClusterError::Api {
				status: 409,
				message: format!("{id}: the object has been modified; resourceVersion must match {current_version}"),
			});
		}
		if kind == ResourceKind::Service && document.as_value()["spec"]["clusterIP"] != current["spec"]["clusterIP"] {
			return Err(ClusterError::Api {
				status: 422,
				message: format!("{id}: spec.clusterIP: Invalid value: field is immutable"),
			});
		}

		let mut object = document.as_value().clone();
		state.stamp_version(&mut object);
		state.spawn_pod(&object);
		state.objects.insert(key, object.clone());
		state.operations.push(ClusterOperation::Replace(format!("{}/{}", id.kind, id.name)));
		Ok(object)
	}

	async fn delete(&self, id: &ResourceId) -> ClusterResult<bool> {
		let mut state = self.state.lock();
		let removed = state.objects.remove(&key(&id.kind, id.namespace.as_deref(), &id.name)).is_some();
		if removed {
			state.remove_owned(id);
			state.operations.push(ClusterOperation::Delete(format!("{}/{}", id.kind, id.name)));
		}
		Ok(removed)
	}

	async fn list(&self, kind: ResourceKind, namespace: &str, label_selector: &str) -> ClusterResult<Vec<Value>> {
		let selector = parse_selector(label_selector);
		let state = self.state.lock();
		Ok(state
			.objects
			.iter()
			.filter(|((k, ns, _), object)| k == kind.as_str() && (!kind.is_namespaced() || ns == namespace) && labels_match(object, &selector))
			.map(|(_, object)| object.clone())
			.collect())
	}

	async fn patch(&self, id: &ResourceId, patch: &Value) -> ClusterResult<Value> {
		let mut state = self.state.lock();
		state.check_failure(id)?;
		let key = key(&id.kind, id.namespace.as_deref(), &id.name);
		let Some(mut object) = state.objects.get(&key).cloned() else {
			return Err(ClusterError::NotFound(id.clone()));
		};

		merge_patch(&mut object, patch);
		state.stamp_version(&mut object);
		state.remove_owned(id);
		state.spawn_pod(&object);
		state.objects.insert(key, object.clone());
		state.operations.push(ClusterOperation::Patch(format!("{}/{}", id.kind, id.name)));
		Ok(object)
	}

	async fn pod_logs(&self, namespace: &str, pod: &str, options: &LogOptions) -> ClusterResult<String> {
		let state = self.state.lock();
		let key = key("Pod", Some(namespace), pod);
		if !state.objects.contains_key(&key) {
			return Err(ClusterError::NotFound(ResourceId::new(ResourceKind::Pod, pod, Some(namespace))));
		}
		Ok(select_log(state.logs.get(&key).map_or("", String::as_str), options))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn deployment(name: &str) -> ResourceDocument {
		ResourceDocument::from_value(json!({
			"apiVersion": "apps/v1",
			"kind": "Deployment",
			"metadata": {"name": name, "namespace": "default", "labels": {"session": "s1"}},
			"spec": {"template": {"metadata": {"labels": {"session": "s1"}}, "spec": {"containers": []}}}
		}))
		.unwrap()
	}

	#[tokio::test]
	async fn create_conflicts_and_replace_requires_version() {
		let cluster = InMemoryCluster::new();
		let doc = deployment("android-s1");
		let created = cluster.create(&doc).await.unwrap();
		assert!(matches!(cluster.create(&doc).await, Err(ClusterError::AlreadyExists(_))));
		assert!(matches!(cluster.replace(&doc).await, Err(ClusterError::Api { status: 409, .. })));

		let mut value = doc.into_value();
		value["metadata"]["resourceVersion"] = created["metadata"]["resourceVersion"].clone();
		let updated = ResourceDocument::from_value(value).unwrap();
		cluster.replace(&updated).await.expect("replace with current version should succeed");
		assert_eq!(
			cluster.operations(),
			vec![
				ClusterOperation::Create("Deployment/android-s1".into()),
				ClusterOperation::Replace("Deployment/android-s1".into())
			]
		);
	}

	#[tokio::test]
	async fn workloads_get_ready_pods_that_die_with_their_owner() {
		let cluster = InMemoryCluster::with_workloads("10.1.2.3");
		cluster.create(&deployment("android-s1")).await.unwrap();

		let pods = cluster.list(ResourceKind::Pod, "default", "session=s1").await.unwrap();
		assert_eq!(pods.len(), 1);
		assert_eq!(pods[0]["status"]["podIP"], "10.1.2.3");
		assert!(cluster.list(ResourceKind::Pod, "other", "session=s1").await.unwrap().is_empty());

		let id = ResourceId::new(ResourceKind::Deployment, "android-s1", Some("default"));
		assert!(cluster.delete(&id).await.unwrap());
		assert_eq!(cluster.count("Pod"), 0);
		assert!(!cluster.delete(&id).await.unwrap());
	}

	#[tokio::test]
	async fn scaling_to_zero_removes_the_pod_and_back_restores_it() {
		let cluster = InMemoryCluster::with_workloads("10.1.2.3");
		cluster.create(&deployment("android-s1")).await.unwrap();
		let id = ResourceId::new(ResourceKind::Deployment, "android-s1", Some("default"));

		let scaled = cluster.patch(&id, &json!({"spec": {"replicas": 0}})).await.unwrap();
		assert_eq!(scaled["spec"]["replicas"], 0);
		assert!(scaled["spec"]["template"].is_object(), "merge keeps untouched fields");
		assert_eq!(cluster.count("Pod"), 0);

		cluster.patch(&id, &json!({"spec": {"replicas": 1}})).await.unwrap();
		assert_eq!(cluster.count("Pod"), 1);
		assert_eq!(cluster.operations().last(), Some(&ClusterOperation::Patch("Deployment/android-s1".into())));

		let missing = ResourceId::new(ResourceKind::Deployment, "android-s2", Some("default"));
		assert!(matches!(cluster.patch(&missing, &json!({})).await, Err(ClusterError::NotFound(_))));
	}

	#[test]
	fn merge_patch_removes_nulls_and_replaces_arrays() {
		let mut target = json!({"a": {"b": 1, "c": 2}, "list": [1, 2], "keep": true});
		merge_patch(&mut target, &json!({"a": {"b": null, "d": 3}, "list": [3]}));
		assert_eq!(target, json!({"a": {"c": 2, "d": 3}, "list": [3], "keep": true}));
	}

	#[tokio::test]
	async fn pod_logs_honour_tail_limit_and_timestamps() {
		let cluster = InMemoryCluster::with_workloads("10.1.2.3");
		cluster.create(&deployment("android-s1")).await.unwrap();
		cluster.set_pod_logs("default", "android-s1-0", "boot\nadbd ready\nagent listening\n");

		let all = cluster.pod_logs("default", "android-s1-0", &LogOptions::default()).await.unwrap();
		assert_eq!(all, "boot\nadbd ready\nagent listening\n");

		let tail = LogOptions {
			tail_lines: Some(1),
			timestamps: true,
			..LogOptions::default()
		};
		assert_eq!(
			cluster.pod_logs("default", "android-s1-0", &tail).await.unwrap(),
			format!("{LOG_TIMESTAMP} agent listening\n")
		);

		let limited = LogOptions {
			limit_bytes: Some(4),
			..LogOptions::default()
		};
		assert_eq!(cluster.pod_logs("default", "android-s1-0", &limited).await.unwrap(), "boot");

		let err = cluster.pod_logs("default", "android-s9-0", &LogOptions::default()).await.unwrap_err();
		assert!(matches!(err, ClusterError::NotFound(id) if id.kind == "Pod"));
	}

	#[tokio::test]
	async fn injected_failures_surface_as_api_errors() {
		let cluster = InMemoryCluster::new();
		cluster.fail_on("Deployment", "android-s1", "quota exceeded");
		let err = cluster.create(&deployment("android-s1")).await.unwrap_err();
		assert!(err.to_string().contains("quota exceeded"));
	}
}
