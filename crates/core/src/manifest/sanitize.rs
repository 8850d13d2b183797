//! Pre-apply security gate for rendered documents.
//!
//! Not an admission controller: it inspects the embedded pod spec of
//! workload-shaped kinds and reports every forbidden field it finds. A batch
//! is applied only if every document passes.

use serde::Serialize;
use serde_json::Value;

use super::ResourceDocument;
use crate::error::{Error, Result};

/// Policy overrides. Set from server configuration only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SanitizePolicy {
	pub allow_host_path: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SanitizeReport {
	pub ok: bool,
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub errors: Vec<String>,
}

impl SanitizeReport {
	fn from_errors(errors: Vec<String>) -> Self {
		Self { ok: errors.is_empty(), errors }
	}
}

fn flag(spec: &Value, field: &str) -> bool {
	spec.get(field).and_then(Value::as_bool).unwrap_or(false)
}

/// Checks one document, accumulating every violation.
pub fn sanitize(document: &ResourceDocument, policy: SanitizePolicy) -> SanitizeReport {
	let Some(pod_spec) = document.pod_spec() else {
		return SanitizeReport::from_errors(Vec::new());
	};

	let mut errors = Vec::new();
	for field in ["hostNetwork", "hostPID", "hostIPC"] {
		if flag(pod_spec, field) {
			errors.push(format!("{field} is forbidden"));
		}
	}

	for list in ["containers", "initContainers", "ephemeralContainers"] {
		let containers = pod_spec.get(list).and_then(Value::as_array).map(Vec::as_slice).unwrap_or_default();
		for (index, container) in containers.iter().enumerate() {
			if container.get("securityContext").is_some_and(|context| flag(context, "privileged")) {
				errors.push(format!("{list}[{index}].securityContext.privileged is forbidden"));
			}
		}
	}

	if !policy.allow_host_path {
		let volumes = pod_spec.get("volumes").and_then(Value::as_array).map(Vec::as_slice).unwrap_or_default();
		for (index, volume) in volumes.iter().enumerate() {
			if volume.get("hostPath").is_some_and(|host_path| !host_path.is_null()) {
				errors.push(format!("volumes[{index}] uses hostPath which is forbidden by default"));
			}
		}
	}

	SanitizeReport::from_errors(errors)
}

/// Gate for a whole batch: fails with every violation of every document.
pub fn sanitize_batch(documents: &[ResourceDocument], policy: SanitizePolicy) -> Result<()> {
	let violations: Vec<String> = documents
		.iter()
		.flat_map(|document| {
			let prefix = format!("{}/{}", document.kind(), document.name());
			sanitize(document, policy).errors.into_iter().map(move |error| format!("{prefix}: {error}"))
		})
		.collect();

	if violations.is_empty() { Ok(()) } else { Err(Error::SanitizerRejected { violations }) }
}
