//! Session discovery by label lookup.
//!
//! Several pods may match one session, for example during a rolling
//! replacement. The registry picks one deterministically: Running and ready
//! first, then Running, then Pending, then Terminating; ties go to the
//! lexicographically lowest pod name.

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use super::{AddressCache, SESSION_LABEL, SessionPhase, SessionStatus, session_selector, validate_session_id, workload_name};
use crate::cluster::{ClusterApi, ClusterError, LogOptions};
use crate::error::{Error, Result};
use crate::manifest::{ResourceId, ResourceKind};

/// Address the relay or stream proxy should connect to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAddress {
	pub address: String,
	pub pod_name: Option<String>,
	/// True when served from the cache; a failed connect should trigger one re-resolve.
	pub cached: bool,
}

/// Log text read from one of a session's pods.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionLogs {
	pub session_id: String,
	pub pod_name: String,
	pub logs: String,
}

struct PodView {
	name: String,
	phase: SessionPhase,
	ready: bool,
	address: Option<String>,
}

impl PodView {
	fn from_value(pod: &Value) -> Self {
		let metadata = &pod["metadata"];
		let status = &pod["status"];
		let deleting = !metadata["deletionTimestamp"].is_null();
		let ready = status["conditions"]
			.as_array()
			.is_some_and(|conditions| conditions.iter().any(|c| c["type"] == "Ready" && c["status"] == "True"));
		Self {
			name: metadata["name"].as_str().unwrap_or_default().to_string(),
			phase: SessionPhase::from_pod(status["phase"].as_str(), deleting),
			ready,
			address: status["podIP"].as_str().filter(|ip| !ip.is_empty()).map(str::to_string),
		}
	}

	/// Lower sorts first.
	fn preference(&self) -> (u8, Reverse<bool>, &str) {
		let phase = match self.phase {
			SessionPhase::Running => 0,
			SessionPhase::Pending => 1,
			SessionPhase::Terminating | SessionPhase::Absent => 2,
		};
		(phase, Reverse(self.ready), self.name.as_str())
	}
}

/// Status of a session from its matching pods; `None` when there are none.
fn summarize(session_id: &str, pods: &[&Value]) -> Option<SessionStatus> {
	let mut views: Vec<PodView> = pods.iter().map(|pod| PodView::from_value(pod)).collect();
	views.sort_by(|a, b| a.preference().cmp(&b.preference()));
	let instances = views.len();
	let chosen = views.into_iter().next()?;
	Some(SessionStatus {
		exists: true,
		session_id: session_id.to_string(),
		workload_name: workload_name(session_id),
		pod_name: Some(chosen.name),
		phase: chosen.phase,
		ready: chosen.ready,
		address: chosen.address,
		instances,
	})
}

pub struct SessionRegistry {
	cluster: Arc<dyn ClusterApi>,
	namespace: String,
	cache: AddressCache,
}

impl SessionRegistry {
	pub fn new(cluster: Arc<dyn ClusterApi>, namespace: impl Into<String>, address_ttl: Duration) -> Self {
		Self {
			cluster,
			namespace: namespace.into(),
			cache: AddressCache::new(address_ttl),
		}
	}

	pub fn namespace(&self) -> &str {
		&self.namespace
	}

	pub fn cache(&self) -> &AddressCache {
		&self.cache
	}

	pub async fn resolve(&self, session_id: &str) -> Result<SessionStatus> {
		validate_session_id(session_id)?;
		let pods = self.cluster.list(ResourceKind::Pod, &self.namespace, &session_selector(session_id)).await?;
		let Some(status) = summarize(session_id, &pods.iter().collect::<Vec<_>>()) else {
			return Ok(SessionStatus::absent(session_id));
		};
		if let (SessionPhase::Running, Some(address)) = (status.phase, &status.address) {
			self.cache.insert(session_id, address, status.pod_name.as_deref());
		}
		debug!(
			target = "droidplane.registry",
			%session_id,
			pod = status.pod_name.as_deref().unwrap_or_default(),
			phase = %status.phase,
			instances = status.instances,
			"session resolved"
		);
		Ok(status)
	}

	/// Every session with at least one pod in the namespace, ordered by id.
	pub async fn list(&self) -> Result<Vec<SessionStatus>> {
		let pods = self.cluster.list(ResourceKind::Pod, &self.namespace, SESSION_LABEL).await?;
		let mut sessions: BTreeMap<&str, Vec<&Value>> = BTreeMap::new();
		for pod in &pods {
			if let Some(session_id) = pod["metadata"]["labels"][SESSION_LABEL].as_str() {
				sessions.entry(session_id).or_default().push(pod);
			}
		}
		let statuses: Vec<SessionStatus> = sessions.iter().filter_map(|(session_id, pods)| summarize(session_id, pods)).collect();
		debug!(target = "droidplane.registry", sessions = statuses.len(), pods = pods.len(), "sessions listed");
		Ok(statuses)
	}

	/// Reads the log of `pod_name`, or of the pod [`resolve`](Self::resolve) picks.
	///
	/// A named pod must carry the session's label.
	pub async fn logs(&self, session_id: &str, pod_name: Option<&str>, options: &LogOptions) -> Result<SessionLogs> {
		validate_session_id(session_id)?;
		let pod_name = match pod_name.filter(|name| !name.is_empty()) {
			Some(name) => {
				let pod = self.cluster.get(&ResourceId::new(ResourceKind::Pod, name, Some(self.namespace.as_str()))).await?;
				if pod.as_ref().and_then(|pod| pod["metadata"]["labels"][SESSION_LABEL].as_str()) != Some(session_id) {
					return Err(Error::SessionNotFound(session_id.to_string()));
				}
				name.to_string()
			}
			None => self.resolve(session_id).await?.pod_name.ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?,
		};

		let logs = match self.cluster.pod_logs(&self.namespace, &pod_name, options).await {
			Ok(logs) => logs,
			Err(ClusterError::NotFound(_)) => return Err(Error::SessionNotFound(session_id.to_string())),
			Err(err) => return Err(err.into()),
		};
		debug!(target = "droidplane.registry", %session_id, pod = %pod_name, bytes = logs.len(), "pod logs read");
		Ok(SessionLogs {
			session_id: session_id.to_string(),
			pod_name,
			logs,
		})
	}

	/// Address of a Running instance, from the cache when fresh.
	pub async fn resolve_address(&self, session_id: &str) -> Result<ResolvedAddress> {
		if let Some((address, pod_name)) = self.cache.get(session_id) {
			return Ok(ResolvedAddress {
				address,
				pod_name,
				cached: true,
			});
		}

		let status = self.resolve(session_id).await?;
		if !status.exists {
			return Err(Error::SessionNotFound(session_id.to_string()));
		}
		match (status.phase, status.address) {
			(SessionPhase::Running, Some(address)) => Ok(ResolvedAddress {
				address,
				pod_name: status.pod_name,
				cached: false,
			}),
			(phase, _) => Err(Error::SessionNotReady {
				session_id: session_id.to_string(),
				phase,
			}),
		}
	}

	pub fn invalidate_address(&self, session_id: &str) {
		if self.cache.invalidate(session_id) {
			debug!(target = "droidplane.registry", %session_id, "cached address invalidated");
		}
	}

	/// Polls until the session is Running and ready or `window` elapses.
	///
	/// Returns the last observed status either way.
	pub async fn wait_until_ready(&self, session_id: &str, window: Duration, interval: Duration) -> Result<SessionStatus> {
		let started = Instant::now();
		loop {
			let status = self.resolve(session_id).await?;
			if status.is_ready() || started.elapsed() + interval > window {
				return Ok(status);
			}
			tokio::time::sleep(interval).await;
		}
	}

	/// Deletes every object labelled with the session, in reverse apply order.
	///
	/// Within the workload rank, controllers go before bare pods so a
	/// controller cannot recreate a pod that was just removed. Namespaces are
	/// never deleted. Kinds the credentials may not list are
	/// skipped. Returns the identities actually deleted.
	pub async fn delete(&self, session_id: &str) -> Result<Vec<ResourceId>> {
		validate_session_id(session_id)?;
		self.cache.invalidate(session_id);

		let selector = session_selector(session_id);
		let mut kinds: Vec<ResourceKind> = ResourceKind::ALL.iter().copied().filter(|kind| *kind != ResourceKind::Namespace).collect();
		kinds.sort_by_key(|kind| (Reverse(kind.rank()), *kind == ResourceKind::Pod));

		let mut deleted = Vec::new();
		for kind in kinds {
			let objects = match self.cluster.list(kind, &self.namespace, &selector).await {
				Ok(objects) => objects,
				Err(err) if err.is_forbidden_or_missing() => {
					debug!(target = "droidplane.registry", %session_id, %kind, error = %err, "skipping kind during delete");
					continue;
				}
				Err(err) => return Err(err.into()),
			};
			for object in objects {
				let Some(name) = object["metadata"]["name"].as_str() else { continue };
				let namespace = object["metadata"]["namespace"].as_str().unwrap_or(&self.namespace);
				let mut id = ResourceId::new(kind, name, Some(namespace));
				if let Some(api_version) = object["apiVersion"].as_str() {
					id.api_version = api_version.to_string();
				}
				if self.cluster.delete(&id).await? {
					deleted.push(id);
				}
			}
		}

		info!(target = "droidplane.registry", %session_id, deleted = deleted.len(), "session resources deleted");
		Ok(deleted)
	}
}
