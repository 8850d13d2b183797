//! Session identity, status, and discovery.

pub mod cache;
pub mod registry;

use std::fmt;

use serde::Serialize;

use crate::error::{Error, Result};

pub use cache::AddressCache;
pub use registry::{ResolvedAddress, SessionLogs, SessionRegistry};

/// Label that ties every cluster object to its session.
pub const SESSION_LABEL: &str = "session";

/// Annotation recording the device profile a session was created from.
pub const PROFILE_ANNOTATION: &str = "droidplane.io/profile";

const MAX_SESSION_ID_LEN: usize = 40;

/// Deterministic workload name for a session.
pub fn workload_name(session_id: &str) -> String {
	format!("android-{session_id}")
}

/// Label selector matching a session's objects.
pub fn session_selector(session_id: &str) -> String {
	format!("{SESSION_LABEL}={session_id}")
}

/// Session ids are DNS-label safe: lowercase alphanumerics and `-`, alphanumeric at both ends.
pub fn validate_session_id(session_id: &str) -> Result<()> {
	let bytes = session_id.as_bytes();
	let valid = !bytes.is_empty()
		&& bytes.len() <= MAX_SESSION_ID_LEN
		&& bytes.iter().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
		&& bytes.first().is_some_and(u8::is_ascii_alphanumeric)
		&& bytes.last().is_some_and(u8::is_ascii_alphanumeric);
	if valid {
		Ok(())
	} else {
		Err(Error::InvalidPayload(format!(
			"invalid session id '{session_id}': expected 1-{MAX_SESSION_ID_LEN} lowercase letters, digits or '-'"
		)))
	}
}

/// Fresh random session id (12 lowercase hex characters).
pub fn generate_session_id() -> String {
	let mut id = uuid::Uuid::new_v4().simple().to_string();
	id.truncate(12);
	id
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum SessionPhase {
	Pending,
	Running,
	Terminating,
	Absent,
}

impl SessionPhase {
	/// Maps a pod's phase and deletion state.
	pub fn from_pod(phase: Option<&str>, deleting: bool) -> Self {
		if deleting {
			return SessionPhase::Terminating;
		}
		match phase {
			Some("Running") => SessionPhase::Running,
			Some("Succeeded" | "Failed") => SessionPhase::Terminating,
			_ => SessionPhase::Pending,
		}
	}
}

impl fmt::Display for SessionPhase {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			SessionPhase::Pending => "Pending",
			SessionPhase::Running => "Running",
			SessionPhase::Terminating => "Terminating",
			SessionPhase::Absent => "Absent",
		};
		f.write_str(name)
	}
}

/// What the registry knows about a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
	pub exists: bool,
	pub session_id: String,
	pub workload_name: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub pod_name: Option<String>,
	pub phase: SessionPhase,
	pub ready: bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub address: Option<String>,
	/// Number of pods matching the session label.
	pub instances: usize,
}

impl SessionStatus {
	pub fn absent(session_id: &str) -> Self {
		Self {
			exists: false,
			session_id: session_id.to_string(),
			workload_name: workload_name(session_id),
			pod_name: None,
			phase: SessionPhase::Absent,
			ready: false,
			address: None,
			instances: 0,
		}
	}

	pub fn is_ready(&self) -> bool {
		self.phase == SessionPhase::Running && self.ready
	}
}
