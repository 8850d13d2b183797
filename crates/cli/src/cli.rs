use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "droidplane")]
#[command(about = "Control plane for remote Android device sessions")]
#[command(version)]
pub struct Cli {
	/// Increase verbosity (-v info, -vv debug)
	#[arg(short, long, global = true, action = clap::ArgAction::Count)]
	pub verbose: u8,

	#[command(subcommand)]
	pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
	/// Run the HTTP and WebSocket control plane
	Serve(ServeArgs),

	/// Render a device profile locally and run the sanitizer on it
	Render(RenderArgs),
}

/// Where templates live and how they are screened.
#[derive(Args, Debug, Clone)]
pub struct TemplateArgs {
	/// Directory holding `<profile>.yaml` templates
	#[arg(long, env = "TEMPLATES_DIR", default_value = "./templates")]
	pub templates_dir: PathBuf,

	/// Permit hostPath volumes in rendered pod specs
	#[arg(long, env = "DROIDPLANE_ALLOW_HOST_PATH")]
	pub allow_host_path: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
	/// Address to listen on
	#[arg(long, env = "DROIDPLANE_LISTEN", default_value = "0.0.0.0:3000")]
	pub listen: SocketAddr,

	/// Kubeconfig file (falls back to in-cluster credentials, then ~/.kube/config)
	#[arg(long, env = "KUBECONFIG", value_name = "FILE")]
	pub kubeconfig: Option<PathBuf>,

	/// Namespace for session objects (defaults to the credentials' namespace, then `default`)
	#[arg(long, env = "DROIDPLANE_NAMESPACE")]
	pub namespace: Option<String>,

	#[command(flatten)]
	pub templates: TemplateArgs,

	/// Profile used when createSession names none
	#[arg(long, env = "DROIDPLANE_DEFAULT_PROFILE", default_value = droidplane::provision::DEFAULT_PROFILE)]
	pub default_profile: String,

	/// Access key required from clients; no key disables authentication
	#[arg(long, env = "AUTH_KEY", hide_env_values = true)]
	pub auth_key: Option<String>,

	/// Key presented to device agents as `x-api-key`
	#[arg(long, env = "AGENT_API_KEY", hide_env_values = true)]
	pub agent_key: Option<String>,

	/// Device agent port on the session pod
	#[arg(long, default_value = "8081")]
	pub agent_port: u16,

	/// Device agent WebSocket path
	#[arg(long, default_value = "/")]
	pub agent_path: String,

	/// Screen stream port on the session pod
	#[arg(long, default_value = "8080")]
	pub stream_port: u16,

	/// Screen stream upgrade path on the session pod
	#[arg(long, default_value = "/")]
	pub stream_path: String,

	/// Default agent request timeout (ms)
	#[arg(long, default_value = "15000")]
	pub request_timeout_ms: u64,

	/// Agent and stream connect timeout (ms)
	#[arg(long, default_value = "5000")]
	pub handshake_timeout_ms: u64,

	/// Upper bound for per-request `timeoutMs` overrides (ms)
	#[arg(long, default_value = "120000")]
	pub max_request_timeout_ms: u64,

	/// How long a resolved pod address is reused (0 disables caching)
	#[arg(long, default_value = "30")]
	pub address_ttl_secs: u64,
}

#[derive(Args, Debug, Clone)]
pub struct RenderArgs {
	/// Device profile (template name without extension)
	pub profile: String,

	/// Session id to render for
	#[arg(long, default_value = "preview")]
	pub session_id: String,

	/// Namespace stamped on namespaced documents
	#[arg(long, env = "DROIDPLANE_NAMESPACE", default_value = "default")]
	pub namespace: String,

	/// Display size as WIDTHxHEIGHT (defaults to the profile's own size)
	#[arg(long)]
	pub resolution: Option<String>,

	#[command(flatten)]
	pub templates: TemplateArgs,

	/// Extra template parameter as KEY=VALUE (repeatable)
	#[arg(long = "param", value_name = "KEY=VALUE", value_parser = parse_param)]
	pub params: Vec<(String, String)>,
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
	match raw.split_once('=') {
		Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
		_ => Err(format!("expected KEY=VALUE, got '{raw}'")),
	}
}
