//! Session creation (render, sanitize, apply) and workload scaling.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::apply::{AppliedResource, ResourceApplier};
use crate::error::{Error, Result};
use crate::manifest::{ManifestRenderer, RenderParams, ResourceDocument, ResourceId, ResourceKind, SanitizePolicy, object_at, sanitize_batch};
use crate::session::{PROFILE_ANNOTATION, generate_session_id, validate_session_id, workload_name};

pub const DEFAULT_PROFILE: &str = "tablet-1280x720";

/// Arguments of `createSession`, shared by the relay and `POST /session`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
	#[serde(default, alias = "profile")]
	pub device_profile: Option<String>,
	#[serde(default)]
	pub session_id: Option<String>,
	#[serde(default)]
	pub resolution: Option<String>,
	#[serde(default)]
	pub cpu_request: Option<String>,
	#[serde(default)]
	pub cpu_limit: Option<String>,
	#[serde(default)]
	pub memory_request: Option<String>,
	#[serde(default)]
	pub memory_limit: Option<String>,
	/// Extra template placeholders. Scalars are stringified.
	#[serde(default)]
	pub params: BTreeMap<String, Value>,
}

impl CreateSessionRequest {
	/// Parses relay `args`; a missing or null value means all defaults.
	pub fn from_args(args: Option<Value>) -> Result<Self> {
		match args {
			None | Some(Value::Null) => Ok(Self::default()),
			Some(args) => serde_json::from_value(args).map_err(|err| Error::InvalidPayload(format!("createSession args: {err}"))),
		}
	}

	fn render_params(&self, session_id: &str) -> Result<RenderParams> {
		let mut extra = BTreeMap::new();
		for (key, value) in &self.params {
			let value = match value {
				Value::String(text) => text.clone(),
				Value::Number(number) => number.to_string(),
				Value::Bool(flag) => flag.to_string(),
				_ => return Err(Error::InvalidPayload(format!("param '{key}' must be a string, number or boolean"))),
			};
			extra.insert(key.clone(), value);
		}
		Ok(RenderParams {
			session_id: Some(session_id.to_string()),
			resolution: self.resolution.clone(),
			cpu_request: self.cpu_request.clone(),
			cpu_limit: self.cpu_limit.clone(),
			memory_request: self.memory_request.clone(),
			memory_limit: self.memory_limit.clone(),
			extra,
		})
	}
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionedSession {
	pub session_id: String,
	pub workload_name: String,
	pub namespace: String,
	pub profile: String,
	pub applied: Vec<AppliedResource>,
}

/// Result of a replica change.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaledSession {
	pub session_id: String,
	pub workload_name: String,
	pub kind: &'static str,
	pub replicas: u32,
}

fn stamp_profile(documents: &mut [ResourceDocument], profile: &str) {
	for document in documents {
		if let Some(annotations) = object_at(document.value_mut(), &["metadata", "annotations"]) {
			annotations.insert(PROFILE_ANNOTATION.into(), Value::String(profile.to_string()));
		}
	}
}

pub struct Provisioner {
	renderer: ManifestRenderer,
	policy: SanitizePolicy,
	applier: ResourceApplier,
	default_profile: String,
}

impl Provisioner {
	pub fn new(renderer: ManifestRenderer, policy: SanitizePolicy, applier: ResourceApplier) -> Self {
		Self {
			renderer,
			policy,
			applier,
			default_profile: DEFAULT_PROFILE.to_string(),
		}
	}

	pub fn with_default_profile(mut self, profile: impl Into<String>) -> Self {
		self.default_profile = profile.into();
		self
	}

	pub fn renderer(&self) -> &ManifestRenderer {
		&self.renderer
	}

	pub fn applier(&self) -> &ResourceApplier {
		&self.applier
	}

	/// Creates (or re-applies) a session. Nothing is mutated unless every
	/// rendered document passes the sanitizer.
	///
	/// Re-applying an existing session id under a different profile is
	/// refused with [`Error::SessionConflict`].
	pub async fn create(&self, request: &CreateSessionRequest) -> Result<ProvisionedSession> {
		let (session_id, explicit) = match request.session_id.as_deref().filter(|id| !id.is_empty()) {
			Some(id) => {
				validate_session_id(id)?;
				(id.to_string(), true)
			}
			None => (generate_session_id(), false),
		};
		let profile = request.device_profile.clone().filter(|p| !p.is_empty()).unwrap_or_else(|| self.default_profile.clone());

		let mut documents = self.renderer.render(&profile, &request.render_params(&session_id)?)?;
		stamp_profile(&mut documents, &profile);
		sanitize_batch(&documents, self.policy)?;
		if explicit {
			self.check_profile(&session_id, &profile, &documents).await?;
		}
		let applied = self.applier.apply(&documents).await?;

		info!(target = "droidplane.apply", %session_id, %profile, resources = applied.len(), "session provisioned");
		Ok(ProvisionedSession {
			workload_name: workload_name(&session_id),
			namespace: self.renderer.namespace().to_string(),
			session_id,
			profile,
			applied,
		})
	}

	async fn check_profile(&self, session_id: &str, profile: &str, documents: &[ResourceDocument]) -> Result<()> {
		let Some(workload) = documents.iter().find(|document| document.pod_spec().is_some()) else {
			return Ok(());
		};
		let Some(live) = self.applier.current(workload).await? else {
			return Ok(());
		};
		match live["metadata"]["annotations"][PROFILE_ANNOTATION].as_str() {
			Some(current) if current != profile => Err(Error::SessionConflict {
				session_id: session_id.to_string(),
				current: current.to_string(),
				requested: profile.to_string(),
			}),
			_ => Ok(()),
		}
	}

	/// Sets the replica count of the session's Deployment or StatefulSet.
	pub async fn scale(&self, session_id: &str, replicas: u32) -> Result<ScaledSession> {
		validate_session_id(session_id)?;
		let name = workload_name(session_id);
		for kind in [ResourceKind::Deployment, ResourceKind::StatefulSet] {
			let id = ResourceId::new(kind, name.as_str(), Some(self.renderer.namespace()));
			if self.applier.scale(&id, replicas).await?.is_some() {
				return Ok(ScaledSession {
					session_id: session_id.to_string(),
					workload_name: name,
					kind: kind.as_str(),
					replicas,
				});
			}
		}
		Err(Error::SessionNotFound(session_id.to_string()))
	}
}
