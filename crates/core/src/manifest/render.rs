//! Device-profile templates to resource documents.
//!
//! A profile is a YAML file `<templates_dir>/<profile>.yaml` (or `.yml`)
//! holding one or more documents separated by `---`. `{{ name }}`
//! placeholders are substituted before parsing. Rendering is pure: it reads
//! the template file and nothing else.
//!
//! `resolution` is `WIDTHxHEIGHT` and also provides `{{ width }}` and
//! `{{ height }}`. A profile whose name ends in `-WIDTHxHEIGHT` uses that as
//! its default resolution.
//!
//! Every rendered document is labelled `session=<id>`, and pod-bearing kinds
//! carry the same label on their pod template, so the registry can always
//! find the session's pods by label.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::{ResourceDocument, ResourceKind, object_at};
use crate::error::{Error, Result};
use crate::session::{SESSION_LABEL, validate_session_id, workload_name};

static PLACEHOLDER: LazyLock<Regex> =
	LazyLock::new(|| Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").expect("placeholder pattern is valid"));

static RESOLUTION: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^([1-9][0-9]{1,4})x([1-9][0-9]{1,4})$").expect("resolution pattern is valid"));

pub const DEFAULT_RESOLUTION: &str = "1280x720";
pub const DEFAULT_CPU_REQUEST: &str = "1";
pub const DEFAULT_CPU_LIMIT: &str = "4";
pub const DEFAULT_MEMORY_REQUEST: &str = "4Gi";
pub const DEFAULT_MEMORY_LIMIT: &str = "12Gi";

/// Placeholder values that extras may not override.
const RESERVED: &[&str] = &["sessionId", "workloadName", "namespace", "width", "height"];

/// Splits `WIDTHxHEIGHT`.
fn parse_resolution(resolution: &str) -> Option<(&str, &str)> {
	let caps = RESOLUTION.captures(resolution)?;
	Some((caps.get(1)?.as_str(), caps.get(2)?.as_str()))
}

/// Resolution suffix of a profile name such as `phone-1080x1920`.
fn profile_resolution(profile: &str) -> Option<&str> {
	profile.rsplit('-').next().filter(|suffix| parse_resolution(suffix).is_some())
}

/// Parameters for one render.
#[derive(Debug, Clone, Default)]
pub struct RenderParams {
	pub session_id: Option<String>,
	pub resolution: Option<String>,
	pub cpu_request: Option<String>,
	pub cpu_limit: Option<String>,
	pub memory_request: Option<String>,
	pub memory_limit: Option<String>,
	/// Additional template-specific placeholders.
	pub extra: BTreeMap<String, String>,
}

impl RenderParams {
	pub fn for_session(session_id: impl Into<String>) -> Self {
		Self {
			session_id: Some(session_id.into()),
			..Self::default()
		}
	}

	fn values(&self, namespace: &str, default_resolution: &str) -> Result<BTreeMap<String, String>> {
		let session_id = self
			.session_id
			.as_deref()
			.filter(|id| !id.is_empty())
			.ok_or_else(|| Error::Configuration("sessionId is required to render a session".into()))?;
		validate_session_id(session_id).map_err(|err| Error::Configuration(err.to_string()))?;

		let mut values = BTreeMap::new();
		for (key, value) in &self.extra {
			if RESERVED.contains(&key.as_str()) {
				return Err(Error::Configuration(format!("parameter '{key}' cannot be overridden")));
			}
			values.insert(key.clone(), value.clone());
		}

		let with_default = |value: &Option<String>, default: &str| value.clone().unwrap_or_else(|| default.to_string());
		values.insert("sessionId".into(), session_id.to_string());
		values.insert("workloadName".into(), workload_name(session_id));
		values.insert("namespace".into(), namespace.to_string());
		let resolution = with_default(&self.resolution, default_resolution);
		let (width, height) =
			parse_resolution(&resolution).ok_or_else(|| Error::Configuration(format!("resolution '{}' must be WIDTHxHEIGHT", resolution.escape_debug())))?;
		values.insert("width".into(), width.to_string());
		values.insert("height".into(), height.to_string());
		values.insert("resolution".into(), resolution);
		values.insert("cpu_request".into(), with_default(&self.cpu_request, DEFAULT_CPU_REQUEST));
		values.insert("cpu_limit".into(), with_default(&self.cpu_limit, DEFAULT_CPU_LIMIT));
		values.insert("memory_request".into(), with_default(&self.memory_request, DEFAULT_MEMORY_REQUEST));
		values.insert("memory_limit".into(), with_default(&self.memory_limit, DEFAULT_MEMORY_LIMIT));

		for (key, value) in &values {
			if value.contains(['\n', '\r']) || value.contains("{{") || value.contains("}}") {
				return Err(Error::Configuration(format!("parameter '{key}' contains forbidden characters")));
			}
		}
		Ok(values)
	}
}

#[derive(Debug, Clone)]
pub struct ManifestRenderer {
	templates_dir: PathBuf,
	namespace: String,
}

impl ManifestRenderer {
	pub fn new(templates_dir: impl Into<PathBuf>, namespace: impl Into<String>) -> Self {
		Self {
			templates_dir: templates_dir.into(),
			namespace: namespace.into(),
		}
	}

	pub fn templates_dir(&self) -> &Path {
		&self.templates_dir
	}

	pub fn namespace(&self) -> &str {
		&self.namespace
	}

	/// Profile names available in the templates directory, sorted.
	pub fn profiles(&self) -> Result<Vec<String>> {
		let mut profiles = Vec::new();
		for entry in std::fs::read_dir(&self.templates_dir)? {
			let path = entry?.path();
			let is_yaml = path.extension().and_then(|ext| ext.to_str()).is_some_and(|ext| ext == "yaml" || ext == "yml");
			if let (true, Some(stem)) = (is_yaml, path.file_stem().and_then(|stem| stem.to_str())) {
				profiles.push(stem.to_string());
			}
		}
		profiles.sort();
		profiles.dedup();
		Ok(profiles)
	}

	/// Reads the raw template for `profile`.
	pub fn load_template(&self, profile: &str) -> Result<String> {
		let not_found = || Error::TemplateNotFound {
			profile: profile.to_string(),
			dir: self.templates_dir.clone(),
		};
		let plain_stem = !profile.is_empty() && profile.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')) && !profile.starts_with('.');
		if !plain_stem {
			return Err(not_found());
		}
		for ext in ["yaml", "yml"] {
			let path = self.templates_dir.join(format!("{profile}.{ext}"));
			if let Ok(text) = std::fs::read_to_string(&path) {
				debug!(target = "droidplane.render", path = %path.display(), "template loaded");
				return Ok(text);
			}
		}
		Err(not_found())
	}

	pub fn render(&self, profile: &str, params: &RenderParams) -> Result<Vec<ResourceDocument>> {
		let template = self.load_template(profile)?;
		self.render_template(&template, params, profile_resolution(profile).unwrap_or(DEFAULT_RESOLUTION))
	}

	/// Renders an in-memory template.
	pub fn render_str(&self, template: &str, params: &RenderParams) -> Result<Vec<ResourceDocument>> {
		self.render_template(template, params, DEFAULT_RESOLUTION)
	}

	fn render_template(&self, template: &str, params: &RenderParams, default_resolution: &str) -> Result<Vec<ResourceDocument>> {
		let values = params.values(&self.namespace, default_resolution)?;

		if let Some(missing) = PLACEHOLDER.captures_iter(template).map(|caps| caps[1].to_string()).find(|name| !values.contains_key(name)) {
			return Err(Error::Render(format!("template placeholder '{missing}' has no value")));
		}
		let rendered = PLACEHOLDER.replace_all(template, |caps: &regex::Captures<'_>| values[&caps[1]].clone());

		let session_id = &values["sessionId"];
		let mut documents = Vec::new();
		for (index, document) in serde_yaml::Deserializer::from_str(&rendered).enumerate() {
			let value = Value::deserialize(document).map_err(|err| Error::Render(format!("document {index} is not valid YAML: {err}")))?;
			if value.is_null() {
				continue;
			}
			let mut document = ResourceDocument::from_value(value).map_err(|err| Error::Render(format!("document {index}: {err}")))?;
			self.stamp(&mut document, session_id);
			documents.push(document);
		}

		if documents.is_empty() {
			return Err(Error::Render("template produced no documents".into()));
		}
		Ok(documents)
	}

	fn stamp(&self, document: &mut ResourceDocument, session_id: &str) {
		let kind = document.resource_kind();
		let namespaced = kind.is_none_or(ResourceKind::is_namespaced);
		let template_metadata: Option<Vec<&str>> = kind.and_then(ResourceKind::pod_spec_path).map(|path| match path {
			["spec"] => vec!["metadata"],
			longer => {
				let mut parent = longer[..longer.len() - 1].to_vec();
				parent.push("metadata");
				parent
			}
		});

		let root = document.value_mut();
		if let Some(metadata) = object_at(root, &["metadata"]) {
			if namespaced && !metadata.get("namespace").is_some_and(Value::is_string) {
				metadata.insert("namespace".into(), Value::String(self.namespace.clone()));
			}
		}
		if let Some(labels) = object_at(root, &["metadata", "labels"]) {
			labels.insert(SESSION_LABEL.into(), Value::String(session_id.to_string()));
		}
		if let Some(mut path) = template_metadata {
			path.push("labels");
			if let Some(labels) = object_at(root, &path) {
				labels.insert(SESSION_LABEL.into(), Value::String(session_id.to_string()));
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	const TEMPLATE: &str = r#"
apiVersion: apps/v1
kind: Deployment
metadata:
  name: {{ workloadName }}
spec:
  replicas: 1
  selector:
    matchLabels:
      app: {{workloadName}}
  template:
    metadata:
      labels:
        app: {{workloadName}}
    spec:
      containers:
        - name: redroid
          image: redroid/redroid:12.0.0-latest
          args: ["androidboot.redroid_width={{resolution}}"]
          resources:
            requests: { cpu: "{{cpu_request}}", memory: "{{memory_request}}" }
            limits: { cpu: "{{cpu_limit}}", memory: "{{memory_limit}}" }
---
---
apiVersion: v1
kind: Service
metadata:
  name: {{workloadName}}
spec:
  selector:
    session: "{{sessionId}}"
  ports:
    - name: agent
      port: 8081
"#;

	fn renderer() -> ManifestRenderer {
		ManifestRenderer::new("/nonexistent", "devices")
	}

	#[test]
	fn renders_multi_document_template_with_defaults() {
		let docs = renderer().render_str(TEMPLATE, &RenderParams::for_session("s1")).expect("render should succeed");
		assert_eq!(docs.len(), 2, "empty documents are skipped");

		let deployment = docs[0].as_value();
		assert_eq!(deployment["metadata"]["name"], "android-s1");
		assert_eq!(deployment["metadata"]["namespace"], "devices");
		assert_eq!(deployment["metadata"]["labels"]["session"], "s1");
		assert_eq!(deployment["spec"]["template"]["metadata"]["labels"], json!({"app": "android-s1", "session": "s1"}));
		let container = &deployment["spec"]["template"]["spec"]["containers"][0];
		assert_eq!(container["args"][0], "androidboot.redroid_width=1280x720");
		assert_eq!(container["resources"]["requests"], json!({"cpu": "1", "memory": "4Gi"}));
		assert_eq!(container["resources"]["limits"], json!({"cpu": "4", "memory": "12Gi"}));

		assert_eq!(docs[1].kind(), "Service");
		assert_eq!(docs[1].as_value()["spec"]["selector"]["session"], "s1");
	}

	#[test]
	fn overrides_replace_defaults() {
		let params = RenderParams {
			resolution: Some("1080x1920".into()),
			memory_limit: Some("6Gi".into()),
			..RenderParams::for_session("s2")
		};
		let docs = renderer().render_str(TEMPLATE, &params).unwrap();
		let container = &docs[0].as_value()["spec"]["template"]["spec"]["containers"][0];
		assert_eq!(container["args"][0], "androidboot.redroid_width=1080x1920");
		assert_eq!(container["resources"]["limits"]["memory"], "6Gi");
	}

	#[test]
	fn missing_session_id_is_a_configuration_error() {
		let err = renderer().render_str(TEMPLATE, &RenderParams::default()).unwrap_err();
		assert!(matches!(err, Error::Configuration(_)), "unexpected error: {err}");
	}

	#[test]
	fn multiline_parameter_is_rejected() {
		let params = RenderParams {
			memory_limit: Some("1Gi\n  hostNetwork: true".into()),
			..RenderParams::for_session("s1")
		};
		assert!(matches!(renderer().render_str(TEMPLATE, &params), Err(Error::Configuration(_))));
	}

	#[test]
	fn width_and_height_follow_the_resolution() {
		let template = "apiVersion: v1\nkind: Pod\nmetadata:\n  name: {{ workloadName }}\nspec:\n  containers:\n    - name: android\n      args: [\"w={{ width }}\", \"h={{ height }}\"]\n";
		let docs = renderer().render_str(template, &RenderParams::for_session("s1")).unwrap();
		assert_eq!(docs[0].as_value()["spec"]["containers"][0]["args"], json!(["w=1280", "h=720"]));

		let params = RenderParams {
			resolution: Some("720x1280".into()),
			..RenderParams::for_session("s1")
		};
		let docs = renderer().render_str(template, &params).unwrap();
		assert_eq!(docs[0].as_value()["spec"]["containers"][0]["args"], json!(["w=720", "h=1280"]));

		for bad in ["big", "1280x", "0x720", "1280*720", "-1x5"] {
			let params = RenderParams {
				resolution: Some(bad.into()),
				..RenderParams::for_session("s1")
			};
			assert!(matches!(renderer().render_str(template, &params), Err(Error::Configuration(_))), "{bad} should be rejected");
		}

		let params = RenderParams {
			extra: BTreeMap::from([("width".to_string(), "9999".to_string())]),
			..RenderParams::for_session("s1")
		};
		assert!(matches!(renderer().render_str(template, &params), Err(Error::Configuration(_))));
	}

	#[test]
	fn profile_name_sets_the_default_resolution() {
		assert_eq!(profile_resolution("phone-1080x1920"), Some("1080x1920"));
		assert_eq!(profile_resolution("tablet"), None);
		assert_eq!(profile_resolution("pixel-7"), None);

		let dir = tempfile::tempdir().unwrap();
		std::fs::write(dir.path().join("phone-1080x1920.yaml"), TEMPLATE).unwrap();
		let renderer = ManifestRenderer::new(dir.path(), "default");
		let docs = renderer.render("phone-1080x1920", &RenderParams::for_session("s1")).unwrap();
		let container = &docs[0].as_value()["spec"]["template"]["spec"]["containers"][0];
		assert_eq!(container["args"][0], "androidboot.redroid_width=1080x1920");
	}

	#[test]
	fn unknown_placeholder_is_a_render_error() {
		let err = renderer()
			.render_str("kind: Pod\napiVersion: v1\nmetadata:\n  name: {{ podName }}\n", &RenderParams::for_session("s1"))
			.unwrap_err();
		assert!(matches!(err, Error::Render(ref message) if message.contains("podName")), "unexpected error: {err}");
	}

	#[test]
	fn malformed_output_is_a_render_error() {
		let params = RenderParams::for_session("s1");
		assert!(matches!(renderer().render_str("kind: [unclosed", &params), Err(Error::Render(_))));
		assert!(matches!(renderer().render_str("- just\n- a list\n", &params), Err(Error::Render(_))));
		assert!(matches!(renderer().render_str("kind: Service\napiVersion: v1\n", &params), Err(Error::Render(_))));
	}

	#[test]
	fn templates_are_loaded_by_profile_name() {
		let dir = tempfile::tempdir().unwrap();
		std::fs::write(dir.path().join("tablet-1280x720.yaml"), TEMPLATE).unwrap();
		std::fs::write(dir.path().join("phone.yml"), TEMPLATE).unwrap();
		let renderer = ManifestRenderer::new(dir.path(), "default");

		assert_eq!(renderer.render("tablet-1280x720", &RenderParams::for_session("s1")).unwrap().len(), 2);
		assert_eq!(renderer.render("phone", &RenderParams::for_session("s1")).unwrap().len(), 2);
		assert_eq!(renderer.profiles().unwrap(), vec!["phone".to_string(), "tablet-1280x720".to_string()]);

		for profile in ["missing", "../etc/passwd", "", ".hidden"] {
			let err = renderer.render(profile, &RenderParams::for_session("s1")).unwrap_err();
			assert!(matches!(err, Error::TemplateNotFound { .. }), "{profile}: unexpected error {err}");
		}
	}
}
