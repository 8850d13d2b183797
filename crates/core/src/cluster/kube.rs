//! Kubernetes REST client over reqwest.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Certificate, Identity, Method, RequestBuilder, Response, StatusCode};
use serde_json::{Value, json};
use tracing::{debug, trace};

use super::{ClusterApi, ClusterCredentials, ClusterError, ClusterResult, LogOptions};
use crate::manifest::{ResourceDocument, ResourceId, ResourceKind};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct KubeClient {
	http: reqwest::Client,
	credentials: ClusterCredentials,
}

impl KubeClient {
	pub fn new(credentials: ClusterCredentials) -> ClusterResult<Self> {
		let mut builder = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).use_rustls_tls();

		if let Some(ca) = &credentials.ca_pem {
			for certificate in Certificate::from_pem_bundle(ca).map_err(|err| ClusterError::Credentials(format!("invalid CA bundle: {err}")))? {
				builder = builder.add_root_certificate(certificate);
			}
		}
		if let (Some(cert), Some(key)) = (&credentials.client_cert_pem, &credentials.client_key_pem) {
			let mut pem = cert.clone();
			pem.push(b'\n');
			pem.extend_from_slice(key);
			let identity = Identity::from_pem(&pem).map_err(|err| ClusterError::Credentials(format!("invalid client certificate: {err}")))?;
			builder = builder.identity(identity);
		}
		if credentials.insecure_skip_tls_verify {
			builder = builder.danger_accept_invalid_certs(true);
		}

		let http = builder.build().map_err(|err| ClusterError::Transport(err.to_string()))?;
		Ok(Self { http, credentials })
	}

	/// Namespace suggested by the credentials, if any.
	pub fn default_namespace(&self) -> Option<&str> {
		self.credentials.namespace.as_deref()
	}

	fn collection_url(&self, api_version: &str, kind: ResourceKind, namespace: Option<&str>) -> String {
		let prefix = if api_version.contains('/') { "apis" } else { "api" };
		match namespace.filter(|_| kind.is_namespaced()) {
			Some(namespace) => format!("{}/{prefix}/{api_version}/namespaces/{namespace}/{}", self.credentials.server, kind.plural()),
			None => format!("{}/{prefix}/{api_version}/{}", self.credentials.server, kind.plural()),
		}
	}

	fn object_url(&self, id: &ResourceId) -> ClusterResult<String> {
		let kind = id.resource_kind().ok_or_else(|| ClusterError::UnsupportedKind(id.kind.clone()))?;
		Ok(format!("{}/{}", self.collection_url(&id.api_version, kind, id.namespace.as_deref()), id.name))
	}

	fn request(&self, method: Method, url: &str) -> ClusterResult<RequestBuilder> {
		trace!(target = "droidplane.cluster", %method, %url, "cluster request");
		let builder = self.http.request(method, url);
		Ok(match self.credentials.bearer_token()? {
			Some(token) => builder.bearer_auth(token),
			None => builder,
		})
	}

	async fn send(builder: RequestBuilder) -> ClusterResult<Response> {
		builder.send().await.map_err(|err| ClusterError::Transport(err.to_string()))
	}

	fn pod_log_url(&self, namespace: &str, pod: &str) -> String {
		format!("{}/api/v1/namespaces/{namespace}/pods/{pod}/log", self.credentials.server)
	}

	async fn check(id: Option<&ResourceId>, response: Response) -> ClusterResult<Value> {
		let body = Self::check_raw(id, response).await?;
		Ok(serde_json::from_slice(&body)?)
	}

	/// Turns a non-success response into an error, using the Status message when present.
	async fn check_raw(id: Option<&ResourceId>, response: Response) -> ClusterResult<Vec<u8>> {
		let status = response.status();
		let body = response.bytes().await.map_err(|err| ClusterError::Transport(err.to_string()))?;
		if status.is_success() {
			return Ok(body.to_vec());
		}

		match (status, id) {
			(StatusCode::NOT_FOUND, Some(id)) => Err(ClusterError::NotFound(id.clone())),
			(StatusCode::CONFLICT, Some(id)) => Err(ClusterError::AlreadyExists(id.clone())),
			_ => {
				let message = serde_json::from_slice::<Value>(&body)
					.ok()
					.and_then(|status| status["message"].as_str().map(str::to_string))
					.unwrap_or_else(|| String::from_utf8_lossy(&body).into_owned());
				Err(ClusterError::Api {
					status: status.as_u16(),
					message,
				})
			}
		}
	}
}

#[async_trait]
impl ClusterApi for KubeClient {
	async fn get(&self, id: &ResourceId) -> ClusterResult<Option<Value>> {
		let response = Self::send(self.request(Method::GET, &self.object_url(id)?)?).await?;
		match Self::check(Some(id), response).await {
			Ok(object) => Ok(Some(object)),
			Err(ClusterError::NotFound(_)) => Ok(None),
			Err(err) => Err(err),
		}
	}

	async fn create(&self, document: &ResourceDocument) -> ClusterResult<Value> {
		let id = document.id();
		let kind = document.resource_kind().ok_or_else(|| ClusterError::UnsupportedKind(id.kind.clone()))?;
		let url = self.collection_url(&id.api_version, kind, id.namespace.as_deref());
		let response = Self::send(self.request(Method::POST, &url)?.json(document.as_value())).await?;
		let created = Self::check(Some(&id), response).await?;
		debug!(target = "droidplane.cluster", resource = %id, "created");
		Ok(created)
	}

	async fn replace(&self, document: &ResourceDocument) -> ClusterResult<Value> {
		let id = document.id();
		let response = Self::send(self.request(Method::PUT, &self.object_url(&id)?)?.json(document.as_value())).await?;
		let replaced = Self::check(Some(&id), response).await?;
		debug!(target = "droidplane.cluster", resource = %id, "replaced");
		Ok(replaced)
	}

	async fn delete(&self, id: &ResourceId) -> ClusterResult<bool> {
		let options = json!({"kind": "DeleteOptions", "apiVersion": "v1", "propagationPolicy": "Background"});
		let response = Self::send(self.request(Method::DELETE, &self.object_url(id)?)?.json(&options)).await?;
		match Self::check(Some(id), response).await {
			Ok(_) => {
				debug!(target = "droidplane.cluster", resource = %id, "deleted");
				Ok(true)
			}
			Err(ClusterError::NotFound(_)) => Ok(false),
			Err(err) => Err(err),
		}
	}

	async fn list(&self, kind: ResourceKind, namespace: &str, label_selector: &str) -> ClusterResult<Vec<Value>> {
		let url = self.collection_url(kind.api_version(), kind, Some(namespace));
		let response = Self::send(self.request(Method::GET, &url)?.query(&[("labelSelector", label_selector)])).await?;
		let mut list = Self::check(None, response).await?;
		let Some(Value::Array(items)) = list.get_mut("items").map(Value::take) else {
			return Ok(Vec::new());
		};
		// List items omit kind/apiVersion.
		Ok(items
			.into_iter()
			.map(|mut item| {
				if let Some(object) = item.as_object_mut() {
					object.entry("kind").or_insert_with(|| Value::String(kind.as_str().to_string()));
					object.entry("apiVersion").or_insert_with(|| Value::String(kind.api_version().to_string()));
				}
				item
			})
			.collect())
	}

	async fn patch(&self, id: &ResourceId, patch: &Value) -> ClusterResult<Value> {
		let body = serde_json::to_vec(patch)?;
		let builder = self.request(Method::PATCH, &self.object_url(id)?)?.header(CONTENT_TYPE, "application/merge-patch+json").body(body);
		let patched = Self::check(Some(id), Self::send(builder).await?).await?;
		debug!(target = "droidplane.cluster", resource = %id, "patched");
		Ok(patched)
	}

	async fn pod_logs(&self, namespace: &str, pod: &str, options: &LogOptions) -> ClusterResult<String> {
		let mut query: Vec<(&str, String)> = vec![("timestamps", options.timestamps.to_string())];
		if let Some(container) = &options.container {
			query.push(("container", container.clone()));
		}
		if let Some(limit) = options.limit_bytes {
			query.push(("limitBytes", limit.to_string()));
		}
		if let Some(tail) = options.tail_lines {
			query.push(("tailLines", tail.to_string()));
		}

		let id = ResourceId::new(ResourceKind::Pod, pod, Some(namespace));
		let response = Self::send(self.request(Method::GET, &self.pod_log_url(namespace, pod))?.query(&query)).await?;
		let body = Self::check_raw(Some(&id), response).await?;
		Ok(String::from_utf8_lossy(&body).into_owned())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn client() -> KubeClient {
		KubeClient::new(ClusterCredentials {
			server: "https://k8s.example:6443".into(),
			token: Some("t".into()),
			..ClusterCredentials::default()
		})
		.expect("client should build")
	}

	#[test]
	fn urls_follow_api_groups() {
		let client = client();
		let service = ResourceId::new(ResourceKind::Service, "android-s1", Some("devices"));
		assert_eq!(client.object_url(&service).unwrap(), "https://k8s.example:6443/api/v1/namespaces/devices/services/android-s1");

		let deployment = ResourceId::new(ResourceKind::Deployment, "android-s1", Some("devices"));
		assert_eq!(
			client.object_url(&deployment).unwrap(),
			"https://k8s.example:6443/apis/apps/v1/namespaces/devices/deployments/android-s1"
		);

		let namespace = ResourceId::new(ResourceKind::Namespace, "devices", Some("ignored"));
		assert_eq!(client.object_url(&namespace).unwrap(), "https://k8s.example:6443/api/v1/namespaces/devices");

		assert_eq!(
			client.collection_url("networking.k8s.io/v1", ResourceKind::Ingress, Some("devices")),
			"https://k8s.example:6443/apis/networking.k8s.io/v1/namespaces/devices/ingresses"
		);
		assert_eq!(
			client.pod_log_url("devices", "android-s1-0"),
			"https://k8s.example:6443/api/v1/namespaces/devices/pods/android-s1-0/log"
		);
	}

	#[test]
	fn unknown_kinds_have_no_url() {
		let id = ResourceId {
			api_version: "example.io/v1".into(),
			kind: "Widget".into(),
			name: "w".into(),
			namespace: None,
		};
		assert!(matches!(client().object_url(&id), Err(ClusterError::UnsupportedKind(_))));
	}
}
