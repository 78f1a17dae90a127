//! Integration tests for the relay server.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1;
use hyper::{Method, Request};
use hyper_util::rt::TokioIo;
use serde_json::{json, Map, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tlsrelay::prelude::*;
use tokio::net::{TcpListener, TcpStream};

#[derive(Default)]
struct Counters {
    opens: AtomicUsize,
    gets: AtomicUsize,
    closes: AtomicUsize,
}

impl Counters {
    fn snapshot(&self) -> (usize, usize, usize) {
        (
            self.opens.load(Ordering::SeqCst),
            self.gets.load(Ordering::SeqCst),
            self.closes.load(Ordering::SeqCst),
        )
    }
}

/// What the fake client does for a request.
#[derive(Clone)]
enum Behavior {
    /// Answer with `{status: 200, body: <url>, args: <args>}` after a delay.
    Echo(Duration),
    /// Answer with a fixed value.
    Respond(Value),
    /// Fail the GET.
    Fail(&'static str),
    /// Never answer.
    Hang,
    /// Fail to open a session.
    RefuseOpen(&'static str),
}

struct FakeClient {
    behavior: Behavior,
    counters: Arc<Counters>,
}

struct FakeSession {
    behavior: Behavior,
    counters: Arc<Counters>,
}

#[async_trait]
impl FingerprintClient for FakeClient {
    async fn open(&self) -> Result<Box<dyn FingerprintSession>, FetchError> {
        self.counters.opens.fetch_add(1, Ordering::SeqCst);
        if let Behavior::RefuseOpen(message) = self.behavior {
            return Err(FetchError::acquisition(message));
        }
        Ok(Box::new(FakeSession {
            behavior: self.behavior.clone(),
            counters: self.counters.clone(),
        }))
    }

    fn name(&self) -> &str {
        "fake"
    }
}

#[async_trait]
impl FingerprintSession for FakeSession {
    async fn get(&self, url: &str, args: &Map<String, Value>) -> Result<Value, FetchError> {
        self.counters.gets.fetch_add(1, Ordering::SeqCst);
        match &self.behavior {
            Behavior::Echo(delay) => {
                tokio::time::sleep(*delay).await;
                Ok(json!({ "status": 200, "body": url, "args": args }))
            }
            Behavior::Respond(value) => Ok(value.clone()),
            Behavior::Fail(message) => Err(FetchError::upstream(*message)),
            Behavior::Hang | Behavior::RefuseOpen(_) => {
                std::future::pending::<Result<Value, FetchError>>().await
            }
        }
    }

    async fn close(self: Box<Self>) {
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
    }
}

fn test_config() -> RelayConfig {
    RelayConfig::new()
        .host("127.0.0.1")
        .port(0)
        .fetch_timeout(Duration::from_millis(200))
}

/// Start a relay on an ephemeral port with a short deadline.
async fn start_relay(behavior: Behavior) -> (SocketAddr, Arc<Counters>) {
    start_relay_with(behavior, test_config()).await
}

async fn start_relay_with(behavior: Behavior, config: RelayConfig) -> (SocketAddr, Arc<Counters>) {
    let counters = Arc::new(Counters::default());
    let client = FakeClient {
        behavior,
        counters: counters.clone(),
    };

    let server = RelayServer::new(config, Arc::new(client));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server.serve(listener));

    (addr, counters)
}

async fn send(addr: SocketAddr, method: Method, path: &str, body: &str) -> (u16, Value) {
    let stream = TcpStream::connect(addr).await.unwrap();
    let (mut sender, conn) = http1::handshake(TokioIo::new(stream)).await.unwrap();
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let request = Request::builder()
        .method(method)
        .uri(path)
        .header("Host", addr.to_string())
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap();

    let response = sender.send_request(request).await.unwrap();
    let status = response.status().as_u16();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&bytes).unwrap())
}

async fn post_fetch(addr: SocketAddr, body: &str) -> (u16, Value) {
    send(addr, Method::POST, "/fetch", body).await
}

#[tokio::test]
async fn test_success_relays_client_value_verbatim() {
    let upstream = json!({
        "status": 200,
        "body": "<html>hello</html>",
        "headers": { "Content-Type": "text/html" },
        "finalUrl": "http://example.com/",
    });
    let (addr, counters) = start_relay(Behavior::Respond(upstream.clone())).await;

    let (status, body) = post_fetch(addr, r#"{"url": "http://example.com", "args": {}}"#).await;

    assert_eq!(status, 200);
    assert_eq!(body, upstream);
    assert_eq!(counters.snapshot(), (1, 1, 1));
}

#[tokio::test]
async fn test_args_are_passed_through() {
    let (addr, _) = start_relay(Behavior::Echo(Duration::ZERO)).await;

    let (status, body) = post_fetch(
        addr,
        r#"{"url": "https://example.org", "args": {"headers": {"X-Test": "1"}, "ja3": "771,4865,0,29,0"}}"#,
    )
    .await;

    assert_eq!(status, 200);
    assert_eq!(body["body"], json!("https://example.org"));
    assert_eq!(
        body["args"],
        json!({ "headers": { "X-Test": "1" }, "ja3": "771,4865,0,29,0" })
    );
}

#[tokio::test]
async fn test_missing_url_is_rejected_without_session() {
    let (addr, counters) = start_relay(Behavior::Echo(Duration::ZERO)).await;

    let (status, body) = post_fetch(addr, r#"{"args": {}}"#).await;

    assert_eq!(status, 400);
    assert!(body["error"].as_str().unwrap().contains("url"));
    assert_eq!(counters.snapshot(), (0, 0, 0));

    // The server keeps serving afterwards.
    let (status, _) = post_fetch(addr, r#"{"url": "http://example.com"}"#).await;
    assert_eq!(status, 200);
}

#[tokio::test]
async fn test_invalid_json_is_rejected() {
    let (addr, counters) = start_relay(Behavior::Echo(Duration::ZERO)).await;

    let (status, body) = post_fetch(addr, "not json").await;

    assert_eq!(status, 400);
    assert!(body["error"].is_string());
    assert_eq!(counters.snapshot(), (0, 0, 0));
}

#[tokio::test]
async fn test_oversized_body_is_rejected() {
    let (addr, counters) =
        start_relay_with(Behavior::Echo(Duration::ZERO), test_config().max_body_size(64)).await;

    let long_url = format!("https://example.com/{}", "a".repeat(200));
    let (status, body) = post_fetch(addr, &format!(r#"{{"url": "{}"}}"#, long_url)).await;

    assert_eq!(status, 400);
    assert_eq!(body, json!({ "error": "Request body too large" }));
    assert_eq!(counters.snapshot(), (0, 0, 0));

    // A body within the limit still goes through.
    let (status, _) = post_fetch(addr, r#"{"url": "https://example.com"}"#).await;
    assert_eq!(status, 200);
}

#[tokio::test]
async fn test_hanging_get_times_out() {
    let (addr, counters) = start_relay(Behavior::Hang).await;

    let (status, body) = post_fetch(addr, r#"{"url": "http://example.com", "args": {}}"#).await;

    assert_eq!(status, 500);
    assert_eq!(body, json!({ "error": "Request timed out" }));
    assert_eq!(counters.snapshot(), (1, 1, 1));
}

#[tokio::test]
async fn test_upstream_failure_is_500() {
    let (addr, counters) = start_relay(Behavior::Fail("remote error: tls: handshake failure")).await;

    let (status, body) = post_fetch(addr, r#"{"url": "https://example.com", "args": {}}"#).await;

    assert_eq!(status, 500);
    assert_eq!(body, json!({ "error": "remote error: tls: handshake failure" }));
    assert_eq!(counters.snapshot(), (1, 1, 1));
}

#[tokio::test]
async fn test_acquisition_failure_skips_get() {
    let (addr, counters) = start_relay(Behavior::RefuseOpen("Failed to start ./cycletls")).await;

    let (status, body) = post_fetch(addr, r#"{"url": "https://example.com", "args": {}}"#).await;

    assert_eq!(status, 500);
    assert_eq!(body, json!({ "error": "Failed to start ./cycletls" }));
    assert_eq!(counters.snapshot(), (1, 0, 0));
}

#[tokio::test]
async fn test_concurrent_requests_do_not_interfere() {
    let (addr, counters) = start_relay(Behavior::Echo(Duration::from_millis(50))).await;

    let (a, b) = tokio::join!(
        post_fetch(addr, r#"{"url": "https://a.example", "args": {}}"#),
        post_fetch(addr, r#"{"url": "https://b.example", "args": {}}"#),
    );

    assert_eq!(a.0, 200);
    assert_eq!(b.0, 200);
    assert_eq!(a.1["body"], json!("https://a.example"));
    assert_eq!(b.1["body"], json!("https://b.example"));
    assert_eq!(counters.snapshot(), (2, 2, 2));
}

#[tokio::test]
async fn test_unknown_path_is_404() {
    let (addr, counters) = start_relay(Behavior::Echo(Duration::ZERO)).await;

    let (status, body) = send(addr, Method::POST, "/other", "{}").await;

    assert_eq!(status, 404);
    assert!(body["error"].is_string());
    assert_eq!(counters.snapshot(), (0, 0, 0));
}

#[tokio::test]
async fn test_wrong_method_is_405() {
    let (addr, _) = start_relay(Behavior::Echo(Duration::ZERO)).await;

    let (status, body) = send(addr, Method::GET, "/fetch", "").await;

    assert_eq!(status, 405);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn test_gateway_handle_directly() {
    let counters = Arc::new(Counters::default());
    let client = FakeClient {
        behavior: Behavior::Respond(json!({ "status": 204 })),
        counters: counters.clone(),
    };
    let invoker = BoundedInvoker::new(Arc::new(client));

    let response =
        tlsrelay::runtime::gateway::handle(br#"{"url": "http://example.com"}"#, &invoker).await;

    assert_eq!(response.status, StatusCode::OK);
    let body: Value = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(body, json!({ "status": 204 }));

    let response = tlsrelay::runtime::gateway::handle(b"", &invoker).await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(counters.snapshot(), (1, 1, 1));
}

#[tokio::test]
async fn test_fetch_request_builder() {
    let request = FetchRequest::new("https://example.com").arg("proxy", "");
    assert_eq!(request.url, "https://example.com");
    assert_eq!(request.args.get("proxy"), Some(&json!("")));

    let response: RelayResponse = FetchError::Timeout.into();
    assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
    tokio_test::assert_ok!(serde_json::from_slice::<Value>(&response.body));
}
