//! Ordered, sequential application of rendered documents.

use std::sync::Arc;

use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::cluster::{ClusterApi, ClusterError};
use crate::error::{ApplyFailure, Error, Result};
use crate::manifest::{ResourceDocument, ResourceId, ResourceKind, sort_for_apply};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplyOperation {
	Created,
	Replaced,
}

/// One object the applier created or replaced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedResource {
	pub kind: String,
	pub name: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub namespace: Option<String>,
	pub operation: ApplyOperation,
}

impl AppliedResource {
	fn new(document: &ResourceDocument, operation: ApplyOperation) -> Self {
		Self {
			kind: document.kind().to_string(),
			name: document.name().to_string(),
			namespace: document.namespace().map(str::to_string),
			operation,
		}
	}
}

pub struct ResourceApplier {
	cluster: Arc<dyn ClusterApi>,
}

impl ResourceApplier {
	pub fn new(cluster: Arc<dyn ClusterApi>) -> Self {
		Self { cluster }
	}

	/// Applies `documents` in kind priority, one at a time.
	///
	/// Existing objects are replaced, missing ones created. The first failure
	/// stops the batch; the error lists what was applied before it.
	pub async fn apply(&self, documents: &[ResourceDocument]) -> Result<Vec<AppliedResource>> {
		if let Some(unsupported) = documents.iter().find(|document| document.resource_kind().is_none()) {
			return Err(Error::UnsupportedKind(unsupported.id()));
		}

		let mut ordered = documents.to_vec();
		sort_for_apply(&mut ordered);

		let mut applied = Vec::with_capacity(ordered.len());
		for document in ordered {
			match self.apply_one(document.clone()).await {
				Ok(operation) => {
					debug!(target = "droidplane.apply", resource = %document.id(), ?operation, "applied");
					applied.push(AppliedResource::new(&document, operation));
				}
				Err(cause) => {
					warn!(target = "droidplane.apply", resource = %document.id(), applied = applied.len(), error = %cause, "apply failed");
					return Err(Error::ApplyFailed(Box::new(ApplyFailure {
						applied,
						failed: document.id(),
						cause,
					})));
				}
			}
		}

		info!(target = "droidplane.apply", count = applied.len(), "batch applied");
		Ok(applied)
	}

	/// Live state of the object `document` describes, if any.
	pub async fn current(&self, document: &ResourceDocument) -> Result<Option<Value>> {
		Ok(self.cluster.get(&document.id()).await?)
	}

	/// Sets `spec.replicas` of a workload with a merge patch; `Ok(None)` when it does not exist.
	pub async fn scale(&self, id: &ResourceId, replicas: u32) -> Result<Option<Value>> {
		match self.cluster.patch(id, &json!({ "spec": { "replicas": replicas } })).await {
			Ok(object) => {
				info!(target = "droidplane.apply", resource = %id, replicas, "scaled");
				Ok(Some(object))
			}
			Err(ClusterError::NotFound(_)) => Ok(None),
			Err(err) => Err(err.into()),
		}
	}

	async fn apply_one(&self, mut document: ResourceDocument) -> std::result::Result<ApplyOperation, String> {
		let existing = self.cluster.get(&document.id()).await.map_err(|err| err.to_string())?;
		match existing {
			Some(current) => {
				carry_over(&mut document, &current);
				self.cluster.replace(&document).await.map_err(|err| err.to_string())?;
				Ok(ApplyOperation::Replaced)
			}
			None => {
				self.cluster.create(&document).await.map_err(|err| err.to_string())?;
				Ok(ApplyOperation::Created)
			}
		}
	}
}

/// Copies server-owned fields a replace must preserve.
fn carry_over(document: &mut ResourceDocument, current: &Value) {
	let is_service = document.resource_kind() == Some(ResourceKind::Service);
	let value = document.value_mut();
	if let Some(version) = current["metadata"].get("resourceVersion") {
		if let Some(metadata) = value.get_mut("metadata").and_then(Value::as_object_mut) {
			metadata.insert("resourceVersion".to_string(), version.clone());
		}
	}
	if !is_service {
		return;
	}
	let Some(spec) = crate::manifest::object_at(value, &["spec"]) else {
		return;
	};
	for field in ["clusterIP", "clusterIPs"] {
		if let Some(allocated) = current["spec"].get(field) {
			spec.entry(field.to_string()).or_insert_with(|| allocated.clone());
		}
	}
}
