//! HTTP and WebSocket surface against the in-memory cluster, a local agent,
//! and a local stream endpoint.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use droidplane::cluster::{ClusterApi, InMemoryCluster};
use droidplane_cli::cli::{Cli, Commands};
use droidplane_cli::commands::build_state;
use droidplane_cli::server::router;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;

const KEY: &str = "test-key";

fn templates_dir() -> PathBuf {
	PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../templates")
}

/// Echoes `{action, args}` back under the agent's request id.
async fn spawn_agent() -> u16 {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let port = listener.local_addr().unwrap().port();
	tokio::spawn(async move {
		while let Ok((stream, _)) = listener.accept().await {
			tokio::spawn(async move {
				let Ok(ws) = tokio_tungstenite::accept_async(stream).await else { return };
				let (mut ws_tx, mut ws_rx) = ws.split();
				while let Some(Ok(frame)) = ws_rx.next().await {
					let Message::Text(text) = frame else { continue };
					let request: Value = serde_json::from_str(text.as_str()).unwrap();
					let reply = json!({
						"requestId": request["requestId"],
						"status": "ok",
						"data": {"action": request["action"], "args": request["args"]},
					});
					if ws_tx.send(Message::Text(reply.to_string().into())).await.is_err() {
						break;
					}
				}
			});
		}
	});
	port
}

async fn read_head(stream: &mut TcpStream) -> String {
	let mut head = Vec::new();
	let mut byte = [0u8; 1];
	while !head.ends_with(b"\r\n\r\n") {
		if stream.read(&mut byte).await.unwrap() == 0 {
			break;
		}
		head.push(byte[0]);
	}
	String::from_utf8(head).unwrap()
}

/// Answers one upgrade with `101`, records the request head, then echoes bytes.
async fn spawn_stream_endpoint() -> (u16, tokio::sync::oneshot::Receiver<String>) {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let port = listener.local_addr().unwrap().port();
	let (head_tx, head_rx) = tokio::sync::oneshot::channel();
	tokio::spawn(async move {
		let (mut stream, _) = listener.accept().await.unwrap();
		let head = read_head(&mut stream).await;
		let _ = head_tx.send(head);
		stream
			.write_all(b"HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nUpgrade: echo\r\n\r\n")
			.await
			.unwrap();
		let mut buf = [0u8; 1024];
		loop {
			let n = stream.read(&mut buf).await.unwrap_or(0);
			if n == 0 || stream.write_all(&buf[..n]).await.is_err() {
				break;
			}
		}
	});
	(port, head_rx)
}

struct TestServer {
	addr: SocketAddr,
	http: reqwest::Client,
	cluster: Arc<InMemoryCluster>,
}

impl TestServer {
	async fn start(agent_port: u16, stream_port: u16) -> Self {
		let templates = templates_dir();
		let agent_port = agent_port.to_string();
		let stream_port = stream_port.to_string();
		let cli = Cli::try_parse_from([
			"droidplane",
			"serve",
			"--templates-dir",
			templates.to_str().unwrap(),
			"--agent-port",
			agent_port.as_str(),
			"--stream-port",
			stream_port.as_str(),
			"--auth-key",
			KEY,
			"--request-timeout-ms",
			"2000",
		])
		.unwrap();
		let Commands::Serve(args) = cli.command else { panic!("expected serve") };

		let cluster = Arc::new(InMemoryCluster::with_workloads("127.0.0.1"));
		let state = build_state(&args, Arc::clone(&cluster) as Arc<dyn ClusterApi>, "devices".into());
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		tokio::spawn(async move {
			axum::serve(listener, router(state)).await.unwrap();
		});

		Self {
			addr,
			http: reqwest::Client::new(),
			cluster,
		}
	}

	fn url(&self, path: &str) -> String {
		format!("http://{}{path}", self.addr)
	}

	fn post(&self, path: &str) -> reqwest::RequestBuilder {
		self.http.post(self.url(path)).header("x-auth-key", KEY)
	}

	fn get(&self, path: &str) -> reqwest::RequestBuilder {
		self.http.get(self.url(path)).header("x-auth-key", KEY)
	}

	async fn create(&self, session_id: &str) -> Value {
		let response = self.post("/session").json(&json!({"sessionId": session_id})).send().await.unwrap();
		assert_eq!(response.status(), 201);
		response.json().await.unwrap()
	}
}

#[tokio::test]
async fn health_is_public_and_everything_else_needs_the_key() {
	let server = TestServer::start(spawn_agent().await, 1).await;

	let health = server.http.get(server.url("/health")).send().await.unwrap();
	assert_eq!(health.status(), 200);
	assert_eq!(health.json::<Value>().await.unwrap(), json!({"ok": true}));

	let denied = server.http.post(server.url("/session")).send().await.unwrap();
	assert_eq!(denied.status(), 401);
	let body: Value = denied.json().await.unwrap();
	assert_eq!(body["ok"], false);
	assert_eq!(body["error"]["code"], "UNAUTHORIZED");

	let wrong = server.http.get(server.url("/session/s1/status")).bearer_auth("nope").send().await.unwrap();
	assert_eq!(wrong.status(), 401);

	let bearer = server.http.get(server.url("/session/s1/status")).bearer_auth(KEY).send().await.unwrap();
	assert_eq!(bearer.status(), 200);
	let query = server.http.get(server.url(&format!("/session/s1/status?authKey={KEY}"))).send().await.unwrap();
	assert_eq!(query.status(), 200);
	assert_eq!(query.json::<Value>().await.unwrap()["exists"], false);
}

#[tokio::test]
async fn create_act_delete_over_http() {
	let server = TestServer::start(spawn_agent().await, 1).await;

	let created = server.create("h1").await;
	assert_eq!(created["sessionId"], "h1");
	assert_eq!(created["workloadName"], "android-h1");
	assert_eq!(created["profile"], "tablet-1280x720");

	let status: Value = server.get("/session/h1/status?waitMs=2000").send().await.unwrap().json().await.unwrap();
	assert_eq!(status["exists"], true);
	assert_eq!(status["ready"], true);
	assert_eq!(status["address"], "127.0.0.1");

	let tap = server
		.post("/session/h1/action")
		.json(&json!({"action": "tap", "args": {"x": 10, "y": 20}, "requestId": "r-1"}))
		.send()
		.await
		.unwrap();
	assert_eq!(tap.status(), 200);
	let tap: Value = tap.json().await.unwrap();
	assert_eq!(tap["requestId"], "r-1");
	assert_eq!(tap["status"], "ok");
	assert_eq!(tap["sessionId"], "h1");
	assert_eq!(tap["data"]["args"], json!({"x": 10, "y": 20}));

	let unknown = server.post("/session/h1/action").json(&json!({"action": "fly"})).send().await.unwrap();
	assert_eq!(unknown.status(), 400);
	assert_eq!(unknown.json::<Value>().await.unwrap()["error"]["code"], "UNKNOWN_ACTION");

	let deleted = server.http.delete(server.url("/session/h1")).header("x-auth-key", KEY).send().await.unwrap();
	assert_eq!(deleted.status(), 200);
	let deleted: Value = deleted.json().await.unwrap();
	assert_eq!(deleted["ok"], true);
	assert!(!deleted["deleted"].as_array().unwrap().is_empty());

	let missing = server.post("/session/h1/action").json(&json!({"action": "tap"})).send().await.unwrap();
	assert_eq!(missing.status(), 404);
	assert_eq!(missing.json::<Value>().await.unwrap()["error"]["code"], "SESSION_NOT_FOUND");
}

#[tokio::test]
async fn list_logs_and_scale_over_http() {
	let server = TestServer::start(spawn_agent().await, 1).await;
	server.create("m2").await;
	server.create("m1").await;

	let listed: Value = server.get("/sessions").send().await.unwrap().json().await.unwrap();
	assert_eq!(listed["namespace"], "devices");
	let ids: Vec<_> = listed["sessions"].as_array().unwrap().iter().map(|s| s["sessionId"].as_str().unwrap()).collect();
	assert_eq!(ids, vec!["m1", "m2"]);

	server.cluster.set_pod_logs("devices", "android-m1-0", "boot completed\nagent listening\n");
	let tail: Value = server.get("/session/m1/logs?tailLines=1&timestamps=false").send().await.unwrap().json().await.unwrap();
	assert_eq!(tail["podName"], "android-m1-0");
	assert_eq!(tail["logs"], "agent listening\n");
	let limited: Value = server.get("/session/m1/logs?limitBytes=4&timestamps=false").send().await.unwrap().json().await.unwrap();
	assert_eq!(limited["logs"], "boot");
	let stamped: Value = server.get("/session/m1/logs").send().await.unwrap().json().await.unwrap();
	assert!(stamped["logs"].as_str().unwrap().lines().all(|line| line.starts_with("20")), "{stamped}");

	let scaled = server.post("/session/m1/scale").json(&json!({"replicas": 0})).send().await.unwrap();
	assert_eq!(scaled.status(), 200);
	let scaled: Value = scaled.json().await.unwrap();
	assert_eq!(scaled["kind"], "Deployment");
	assert_eq!(scaled["replicas"], 0);

	let status: Value = server.get("/session/m1/status").send().await.unwrap().json().await.unwrap();
	assert_eq!(status["exists"], false);
	let listed: Value = server.get("/sessions").send().await.unwrap().json().await.unwrap();
	assert_eq!(listed["sessions"].as_array().unwrap().len(), 1);
	let gone = server.get("/session/m1/logs").send().await.unwrap();
	assert_eq!(gone.status(), 404);

	let restored = server.post("/session/m1/scale").json(&json!({"replicas": 1})).send().await.unwrap();
	assert_eq!(restored.status(), 200);
	let status: Value = server.get("/session/m1/status").send().await.unwrap().json().await.unwrap();
	assert_eq!(status["ready"], true);

	let negative = server.post("/session/m1/scale").json(&json!({"replicas": -1})).send().await.unwrap();
	assert_eq!(negative.status(), 400);
	assert_eq!(negative.json::<Value>().await.unwrap()["error"]["code"], "INVALID_PAYLOAD");
	let missing = server.post("/session/zz/scale").json(&json!({"replicas": 1})).send().await.unwrap();
	assert_eq!(missing.status(), 404);
	assert_eq!(missing.json::<Value>().await.unwrap()["error"]["code"], "SESSION_NOT_FOUND");
}

#[tokio::test]
async fn recreating_under_another_profile_conflicts() {
	let server = TestServer::start(spawn_agent().await, 1).await;
	server.create("c1").await;

	let conflict = server
		.post("/session")
		.json(&json!({"sessionId": "c1", "deviceProfile": "phone-1080x1920"}))
		.send()
		.await
		.unwrap();
	assert_eq!(conflict.status(), 409);
	let body: Value = conflict.json().await.unwrap();
	assert_eq!(body["error"]["code"], "SESSION_CONFLICT");
	assert_eq!(body["error"]["details"]["currentProfile"], "tablet-1280x720");

	let same = server.post("/session").json(&json!({"sessionId": "c1"})).send().await.unwrap();
	assert_eq!(same.status(), 201);
}

#[tokio::test]
async fn bad_create_payloads_are_client_errors() {
	let server = TestServer::start(spawn_agent().await, 1).await;

	let malformed = server.post("/session").body("{not json").send().await.unwrap();
	assert_eq!(malformed.status(), 400);
	assert_eq!(malformed.json::<Value>().await.unwrap()["error"]["code"], "INVALID_PAYLOAD");

	let missing = server.post("/session").json(&json!({"deviceProfile": "watch-200x200"})).send().await.unwrap();
	assert_eq!(missing.status(), 400);
	assert_eq!(missing.json::<Value>().await.unwrap()["error"]["code"], "TEMPLATE_NOT_FOUND");
}

#[tokio::test]
async fn relay_socket_accepts_query_key() {
	let server = TestServer::start(spawn_agent().await, 1).await;
	server.create("w1").await;

	let url = format!("ws://{}/relay?authKey={KEY}", server.addr);
	let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();

	let request = json!({"action": "swipe", "sessionId": "w1", "args": {"persist": true, "x1": 1}, "requestId": "ws-1"});
	ws.send(Message::Text(request.to_string().into())).await.unwrap();
	let reply = loop {
		match ws.next().await.unwrap().unwrap() {
			Message::Text(text) => break serde_json::from_str::<Value>(text.as_str()).unwrap(),
			_ => continue,
		}
	};
	assert_eq!(reply["requestId"], "ws-1");
	assert_eq!(reply["action"], "swipe");
	assert_eq!(reply["status"], "ok");
	assert_eq!(reply["data"]["args"], json!({"x1": 1}));

	ws.send(Message::Text("not json".to_string().into())).await.unwrap();
	let reply = loop {
		match ws.next().await.unwrap().unwrap() {
			Message::Text(text) => break serde_json::from_str::<Value>(text.as_str()).unwrap(),
			_ => continue,
		}
	};
	assert_eq!(reply["status"], "error");
	assert_eq!(reply["code"], "INVALID_PAYLOAD");

	let unauthenticated = tokio_tungstenite::connect_async(format!("ws://{}/relay", server.addr)).await;
	assert!(unauthenticated.is_err());
}

#[tokio::test]
async fn stream_upgrade_is_spliced_to_the_pod() {
	let (stream_port, upstream_head) = spawn_stream_endpoint().await;
	let server = TestServer::start(spawn_agent().await, stream_port).await;
	server.create("v1").await;

	let mut client = TcpStream::connect(server.addr).await.unwrap();
	let request = format!(
		"GET /session/v1/stream?authKey={KEY}&quality=high HTTP/1.1\r\nHost: {}\r\nConnection: Upgrade\r\nUpgrade: echo\r\n\r\n",
		server.addr
	);
	client.write_all(request.as_bytes()).await.unwrap();

	let head = read_head(&mut client).await;
	assert!(head.starts_with("HTTP/1.1 101"), "{head}");

	let upstream_head = upstream_head.await.unwrap();
	assert!(upstream_head.starts_with("GET /?quality=high HTTP/1.1"), "{upstream_head}");
	assert!(!upstream_head.contains(KEY), "{upstream_head}");

	client.write_all(b"ping").await.unwrap();
	let mut echoed = [0u8; 4];
	client.read_exact(&mut echoed).await.unwrap();
	assert_eq!(&echoed, b"ping");
}

#[tokio::test]
async fn stream_without_upgrade_is_rejected() {
	let server = TestServer::start(spawn_agent().await, 1).await;
	server.create("v2").await;

	let response = server.get("/session/v2/stream").send().await.unwrap();
	assert_eq!(response.status(), 400);
}
