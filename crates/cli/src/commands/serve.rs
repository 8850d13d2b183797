use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use droidplane::apply::ResourceApplier;
use droidplane::cluster::{ClusterApi, ClusterCredentials, KubeClient};
use droidplane::manifest::{ManifestRenderer, SanitizePolicy};
use droidplane::provision::Provisioner;
use droidplane::relay::{AgentDialer, CommandRelay, RelayConfig, WebSocketDialer};
use droidplane::session::SessionRegistry;
use droidplane::stream::StreamProxy;
use droidplane_runtime::ConnectOptions;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::cli::ServeArgs;
use crate::server::{self, AppState};

const DEFAULT_NAMESPACE: &str = "default";

/// Wires the control plane together over `cluster`.
pub fn build_state(args: &ServeArgs, cluster: Arc<dyn ClusterApi>, namespace: String) -> AppState {
	let handshake_timeout = Duration::from_millis(args.handshake_timeout_ms);
	let renderer = ManifestRenderer::new(&args.templates.templates_dir, namespace.clone());
	match renderer.profiles() {
		Ok(profiles) => info!(target = "droidplane.render", dir = %args.templates.templates_dir.display(), ?profiles, "device profiles available"),
		Err(err) => warn!(target = "droidplane.render", dir = %args.templates.templates_dir.display(), error = %err, "templates directory is not readable"),
	}

	let policy = SanitizePolicy {
		allow_host_path: args.templates.allow_host_path,
	};
	let provisioner = Provisioner::new(renderer, policy, ResourceApplier::new(Arc::clone(&cluster))).with_default_profile(args.default_profile.clone());
	let registry = Arc::new(SessionRegistry::new(cluster, namespace, Duration::from_secs(args.address_ttl_secs)));

	let dialer = WebSocketDialer::new(
		args.agent_port,
		args.agent_path.clone(),
		ConnectOptions {
			handshake_timeout,
			api_key: args.agent_key.clone(),
		},
	);
	let config = RelayConfig {
		request_timeout: Duration::from_millis(args.request_timeout_ms),
		max_request_timeout: Duration::from_millis(args.max_request_timeout_ms.max(args.request_timeout_ms)),
	};
	let relay = CommandRelay::new(Arc::new(provisioner), Arc::clone(&registry), Arc::new(dialer) as Arc<dyn AgentDialer>, config);

	AppState {
		relay: Arc::new(relay),
		stream: Arc::new(StreamProxy::new(registry, args.stream_port, handshake_timeout)),
		stream_path: Arc::from(args.stream_path.as_str()),
		auth_key: args.auth_key.as_deref().filter(|key| !key.is_empty()).map(Arc::from),
	}
}

pub async fn run(args: ServeArgs) -> anyhow::Result<()> {
	let credentials = ClusterCredentials::load(args.kubeconfig.as_deref()).context("failed to load cluster credentials")?;
	let client = KubeClient::new(credentials).context("failed to build cluster client")?;
	let namespace = args
		.namespace
		.clone()
		.or_else(|| client.default_namespace().map(str::to_string))
		.unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());

	let state = build_state(&args, Arc::new(client), namespace.clone());
	if state.auth_key.is_none() {
		warn!(target = "droidplane.http", "no access key configured; every route is open");
	}
	let relay = Arc::clone(&state.relay);

	let listener = TcpListener::bind(args.listen).await.with_context(|| format!("failed to bind {}", args.listen))?;
	info!(target = "droidplane.http", addr = %args.listen, %namespace, "droidplane listening");
	axum::serve(listener, server::router(state)).with_graceful_shutdown(shutdown_signal()).await?;

	relay.shutdown().await;
	info!(target = "droidplane.http", "droidplane stopped");
	Ok(())
}

async fn shutdown_signal() {
	if let Err(err) = tokio::signal::ctrl_c().await {
		warn!(target = "droidplane.http", error = %err, "failed to listen for shutdown signal");
		std::future::pending::<()>().await;
	}
}
