use std::path::{Path, PathBuf};
use std::process::Command;

use serde_json::Value;
use tempfile::TempDir;

fn templates_dir() -> PathBuf {
	PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../templates")
}

fn run_render(templates: &Path, args: &[&str]) -> (bool, Value, String) {
	let output = Command::new(env!("CARGO_BIN_EXE_droidplane"))
		.arg("render")
		.arg("--templates-dir")
		.arg(templates)
		.args(args)
		.env_remove("DROIDPLANE_ALLOW_HOST_PATH")
		.env_remove("DROIDPLANE_NAMESPACE")
		.output()
		.expect("failed to execute droidplane");

	let stdout = String::from_utf8_lossy(&output.stdout).to_string();
	let stderr = String::from_utf8_lossy(&output.stderr).to_string();
	let parsed = serde_json::from_str(&stdout).unwrap_or(Value::Null);
	(output.status.success(), parsed, stderr)
}

const HOST_PATH_TEMPLATE: &str = r#"
apiVersion: v1
kind: Pod
metadata:
  name: android-{{sessionId}}
  namespace: {{namespace}}
  labels:
    session: "{{sessionId}}"
spec:
  containers:
    - name: android
      image: redroid/redroid:12.0.0-latest
      securityContext:
        privileged: true
  volumes:
    - name: data
      hostPath:
        path: /var/lib/android
"#;

#[test]
fn render_prints_documents_and_verdict() {
	let (ok, output, stderr) = run_render(&templates_dir(), &["phone-1080x1920", "--session-id", "cli-1", "--namespace", "devices"]);
	assert!(ok, "stderr: {stderr}");

	assert_eq!(output["profile"], "phone-1080x1920");
	assert_eq!(output["sessionId"], "cli-1");
	assert_eq!(output["sanitizer"]["ok"], true);

	let documents = output["documents"].as_array().unwrap();
	assert!(!documents.is_empty());
	for document in documents {
		assert_eq!(document["metadata"]["labels"]["session"], "cli-1");
	}
	let deployment = documents.iter().find(|doc| doc["kind"] == "Deployment").unwrap();
	assert_eq!(deployment["metadata"]["namespace"], "devices");
	let args = &deployment["spec"]["template"]["spec"]["containers"][0]["args"];
	assert_eq!(args[0], "androidboot.redroid_width=1080");
	assert_eq!(args[1], "androidboot.redroid_height=1920");
}

#[test]
fn render_resolution_sets_display_size() {
	let (ok, output, stderr) = run_render(&templates_dir(), &["phone-1080x1920", "--resolution", "720x1280"]);
	assert!(ok, "stderr: {stderr}");
	let deployment = output["documents"].as_array().unwrap().iter().find(|doc| doc["kind"] == "Deployment").unwrap();
	let android = &deployment["spec"]["template"]["spec"]["containers"][0];
	assert_eq!(android["args"][0], "androidboot.redroid_width=720");
	assert_eq!(android["args"][1], "androidboot.redroid_height=1280");
	let agent = &deployment["spec"]["template"]["spec"]["containers"][1];
	assert_eq!(agent["env"][1]["value"], "720x1280");

	let (ok, _, stderr) = run_render(&templates_dir(), &["phone-1080x1920", "--resolution", "huge"]);
	assert!(!ok);
	assert!(stderr.contains("WIDTHxHEIGHT"), "stderr: {stderr}");
}

#[test]
fn render_fails_when_the_sanitizer_rejects() {
	let dir = TempDir::new().unwrap();
	std::fs::write(dir.path().join("unsafe.yaml"), HOST_PATH_TEMPLATE).unwrap();

	let (ok, output, stderr) = run_render(dir.path(), &["unsafe"]);
	assert!(!ok);
	assert!(stderr.contains("rejected by the sanitizer"), "stderr: {stderr}");
	assert_eq!(output["sanitizer"]["ok"], false);
	let errors = output["sanitizer"]["documents"][0]["report"]["errors"].as_array().unwrap();
	assert_eq!(errors.len(), 2, "{errors:?}");
}

#[test]
fn render_reports_missing_profiles() {
	let dir = TempDir::new().unwrap();
	let (ok, output, stderr) = run_render(dir.path(), &["tablet-1280x720"]);
	assert!(!ok);
	assert!(output.is_null());
	assert!(stderr.contains("tablet-1280x720"), "stderr: {stderr}");
}
