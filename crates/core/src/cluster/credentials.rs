//! Cluster credential discovery.
//!
//! Sources, first match wins:
//! 1. an explicit kubeconfig path (`--kubeconfig` / `KUBECONFIG`)
//! 2. the in-cluster service account (`KUBERNETES_SERVICE_HOST`)
//! 3. `~/.kube/config`
//!
//! Kubeconfig support covers bearer tokens, token files, client
//! certificates, and CA bundles (file or inline base64). Exec and
//! auth-provider plugins are not supported.

use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use tracing::debug;

use super::{ClusterError, ClusterResult};

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Everything needed to reach an API server.
#[derive(Clone, Default)]
pub struct ClusterCredentials {
	pub server: String,
	pub token: Option<String>,
	/// Re-read on every request when set (rotated service account tokens).
	pub token_file: Option<PathBuf>,
	pub ca_pem: Option<Vec<u8>>,
	pub client_cert_pem: Option<Vec<u8>>,
	pub client_key_pem: Option<Vec<u8>>,
	pub insecure_skip_tls_verify: bool,
	/// Namespace from the selected context or service account.
	pub namespace: Option<String>,
}

impl std::fmt::Debug for ClusterCredentials {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ClusterCredentials")
			.field("server", &self.server)
			.field("token", &self.token.as_ref().map(|_| "<redacted>"))
			.field("token_file", &self.token_file)
			.field("client_cert", &self.client_cert_pem.is_some())
			.field("insecure_skip_tls_verify", &self.insecure_skip_tls_verify)
			.field("namespace", &self.namespace)
			.finish()
	}
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct Kubeconfig {
	current_context: Option<String>,
	#[serde(default)]
	contexts: Vec<Named<ContextEntry>>,
	#[serde(default)]
	clusters: Vec<Named<ClusterEntry>>,
	#[serde(default)]
	users: Vec<Named<UserEntry>>,
}

#[derive(Debug, Deserialize)]
struct Named<T> {
	name: String,
	#[serde(alias = "context", alias = "cluster", alias = "user")]
	item: T,
}

#[derive(Debug, Deserialize)]
struct ContextEntry {
	cluster: String,
	user: Option<String>,
	namespace: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ClusterEntry {
	server: String,
	certificate_authority: Option<PathBuf>,
	certificate_authority_data: Option<String>,
	#[serde(default)]
	insecure_skip_tls_verify: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct UserEntry {
	token: Option<String>,
	#[serde(rename = "tokenFile")]
	token_file: Option<PathBuf>,
	client_certificate: Option<PathBuf>,
	client_certificate_data: Option<String>,
	client_key: Option<PathBuf>,
	client_key_data: Option<String>,
	exec: Option<serde_yaml::Value>,
	auth_provider: Option<serde_yaml::Value>,
}

fn credentials_error(message: impl Into<String>) -> ClusterError {
	ClusterError::Credentials(message.into())
}

fn read_file(path: &Path) -> ClusterResult<Vec<u8>> {
	std::fs::read(path).map_err(|err| credentials_error(format!("cannot read {}: {err}", path.display())))
}

fn decode(field: &str, data: &str) -> ClusterResult<Vec<u8>> {
	STANDARD
		.decode(data.trim())
		.map_err(|err| credentials_error(format!("{field} is not valid base64: {err}")))
}

/// Inline data wins over a file path; relative paths resolve against `base`.
fn material(field: &str, data: Option<&str>, file: Option<&Path>, base: &Path) -> ClusterResult<Option<Vec<u8>>> {
	match (data, file) {
		(Some(data), _) => decode(field, data).map(Some),
		(None, Some(file)) => read_file(&base.join(file)).map(Some),
		(None, None) => Ok(None),
	}
}

impl ClusterCredentials {
	/// Resolves credentials from the standard sources.
	pub fn load(explicit: Option<&Path>) -> ClusterResult<Self> {
		let from_env = std::env::var_os("KUBECONFIG").and_then(|paths| std::env::split_paths(&paths).find(|path| !path.as_os_str().is_empty()));
		if let Some(path) = explicit.map(Path::to_path_buf).or(from_env) {
			debug!(target = "droidplane.cluster", path = %path.display(), "loading kubeconfig");
			return Self::from_kubeconfig(&path);
		}

		if let Some(credentials) = Self::in_cluster()? {
			debug!(target = "droidplane.cluster", server = %credentials.server, "using in-cluster service account");
			return Ok(credentials);
		}

		let home = dirs::home_dir().ok_or_else(|| credentials_error("no kubeconfig given and no home directory to look in"))?;
		let path = home.join(".kube").join("config");
		if !path.exists() {
			return Err(credentials_error(format!(
				"no cluster credentials found: not in a cluster and {} does not exist",
				path.display()
			)));
		}
		debug!(target = "droidplane.cluster", path = %path.display(), "loading kubeconfig");
		Self::from_kubeconfig(&path)
	}

	pub fn from_kubeconfig(path: &Path) -> ClusterResult<Self> {
		let text = std::fs::read_to_string(path).map_err(|err| credentials_error(format!("cannot read kubeconfig {}: {err}", path.display())))?;
		let base = path.parent().unwrap_or_else(|| Path::new("."));
		Self::from_kubeconfig_str(&text, base)
	}

	/// Parses kubeconfig text, resolving relative file references against `base`.
	pub fn from_kubeconfig_str(text: &str, base: &Path) -> ClusterResult<Self> {
		let config: Kubeconfig = serde_yaml::from_str(text).map_err(|err| credentials_error(format!("invalid kubeconfig: {err}")))?;

		let context = match config.current_context.as_deref() {
			Some(name) => config
				.contexts
				.iter()
				.find(|context| context.name == name)
				.ok_or_else(|| credentials_error(format!("current context '{name}' is not defined")))?,
			None => config.contexts.first().ok_or_else(|| credentials_error("kubeconfig defines no contexts"))?,
		};
		let context = &context.item;

		let cluster = config
			.clusters
			.iter()
			.find(|cluster| cluster.name == context.cluster)
			.map(|cluster| &cluster.item)
			.ok_or_else(|| credentials_error(format!("cluster '{}' is not defined", context.cluster)))?;

		let default_user = UserEntry::default();
		let user = match context.user.as_deref() {
			Some(name) => config
				.users
				.iter()
				.find(|user| user.name == name)
				.map(|user| &user.item)
				.ok_or_else(|| credentials_error(format!("user '{name}' is not defined")))?,
			None => &default_user,
		};

		let has_static_auth = user.token.is_some() || user.token_file.is_some() || user.client_certificate.is_some() || user.client_certificate_data.is_some();
		if !has_static_auth && (user.exec.is_some() || user.auth_provider.is_some()) {
			return Err(credentials_error("exec and auth-provider credential plugins are not supported"));
		}

		Ok(Self {
			server: cluster.server.trim_end_matches('/').to_string(),
			token: user.token.clone(),
			token_file: user.token_file.as_ref().map(|file| base.join(file)),
			ca_pem: material(
				"certificate-authority-data",
				cluster.certificate_authority_data.as_deref(),
				cluster.certificate_authority.as_deref(),
				base,
			)?,
			client_cert_pem: material(
				"client-certificate-data",
				user.client_certificate_data.as_deref(),
				user.client_certificate.as_deref(),
				base,
			)?,
			client_key_pem: material("client-key-data", user.client_key_data.as_deref(), user.client_key.as_deref(), base)?,
			insecure_skip_tls_verify: cluster.insecure_skip_tls_verify,
			namespace: context.namespace.clone(),
		})
	}

	/// Service account credentials when running inside a pod.
	pub fn in_cluster() -> ClusterResult<Option<Self>> {
		let (Ok(host), Ok(port)) = (std::env::var("KUBERNETES_SERVICE_HOST"), std::env::var("KUBERNETES_SERVICE_PORT")) else {
			return Ok(None);
		};
		let dir = Path::new(SERVICE_ACCOUNT_DIR);
		let token_file = dir.join("token");
		if !token_file.exists() {
			return Ok(None);
		}

		let host = if host.contains(':') { format!("[{host}]") } else { host };
		let namespace = std::fs::read_to_string(dir.join("namespace")).ok().map(|ns| ns.trim().to_string());
		Ok(Some(Self {
			server: format!("https://{host}:{port}"),
			token: None,
			token_file: Some(token_file),
			ca_pem: Some(read_file(&dir.join("ca.crt"))?),
			client_cert_pem: None,
			client_key_pem: None,
			insecure_skip_tls_verify: false,
			namespace,
		}))
	}

	/// Current bearer token, re-reading the token file if configured.
	pub fn bearer_token(&self) -> ClusterResult<Option<String>> {
		if let Some(file) = &self.token_file {
			let token = std::fs::read_to_string(file).map_err(|err| credentials_error(format!("cannot read token file {}: {err}", file.display())))?;
			return Ok(Some(token.trim().to_string()));
		}
		Ok(self.token.clone())
	}
}
