use anyhow::bail;
use droidplane::manifest::{ManifestRenderer, RenderParams, SanitizePolicy, sanitize};
use serde_json::json;

use crate::cli::RenderArgs;

/// Prints the rendered documents and the sanitizer verdict as JSON.
pub fn run(args: RenderArgs) -> anyhow::Result<()> {
	let renderer = ManifestRenderer::new(&args.templates.templates_dir, args.namespace.clone());
	let mut params = RenderParams::for_session(args.session_id.clone());
	params.resolution = args.resolution.clone();
	params.extra = args.params.into_iter().collect();
	let documents = renderer.render(&args.profile, &params)?;

	let policy = SanitizePolicy {
		allow_host_path: args.templates.allow_host_path,
	};
	let reports: Vec<_> = documents
		.iter()
		.map(|document| json!({"kind": document.kind(), "name": document.name(), "report": sanitize(document, policy)}))
		.collect();
	let ok = reports.iter().all(|report| report["report"]["ok"] == true);

	let output = json!({
		"profile": args.profile,
		"sessionId": args.session_id,
		"documents": documents,
		"sanitizer": {"ok": ok, "documents": reports},
	});
	println!("{}", serde_json::to_string_pretty(&output)?);

	if !ok {
		bail!("profile '{}' was rejected by the sanitizer", args.profile);
	}
	Ok(())
}
