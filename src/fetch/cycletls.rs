//! CycleTLS-backed fingerprinting client.
//!
//! CycleTLS ships a helper executable that performs the actual requests
//! with a spoofed JA3 fingerprint. The helper listens for WebSocket
//! connections on the port given in `WS_PORT`. Each JSON text frame
//! `{"requestId", "options"}` is answered with a frame carrying the same
//! `RequestID`.
//!
//! Every session spawns its own helper on its own port, so sessions never
//! observe each other's traffic and closing one never kills another.

use crate::fetch::client::{FingerprintClient, FingerprintSession};
use crate::fetch::FetchError;
use crate::http::generate_request_id;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Map, Value};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

/// JA3 string CycleTLS falls back to when none is supplied.
pub const DEFAULT_JA3: &str = "771,4865-4866-4867-49195-49199-49196-49200-52393-52392-49171-49172-156-157-47-53-10,0-23-65281-10-11-35-16-5-13-18-51-45-43-27-21,29-23-24,0";

/// User agent CycleTLS falls back to when none is supplied.
pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:87.0) Gecko/20100101 Firefox/87.0";

/// Environment variable naming the helper executable.
pub const EXECUTABLE_ENV: &str = "CYCLETLS_PATH";

type HelperSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Configuration for the CycleTLS client.
#[derive(Debug, Clone)]
pub struct CycleTlsConfig {
    /// Path to the CycleTLS helper executable.
    pub executable: PathBuf,
    /// How long to wait for a freshly spawned helper to accept connections.
    pub startup_timeout: Duration,
    /// Pause between connection attempts during startup.
    pub connect_retry_interval: Duration,
    /// JA3 applied when the caller's args carry none.
    pub ja3: String,
    /// User agent applied when the caller's args carry none.
    pub user_agent: String,
}

impl Default for CycleTlsConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("./cycletls"),
            startup_timeout: Duration::from_secs(5),
            connect_retry_interval: Duration::from_millis(100),
            ja3: DEFAULT_JA3.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl CycleTlsConfig {
    /// Create a new config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Default config with the executable taken from `CYCLETLS_PATH`.
    pub fn from_env() -> Self {
        let config = Self::default();
        match std::env::var_os(EXECUTABLE_ENV) {
            Some(path) => config.executable(path),
            None => config,
        }
    }

    /// Set the helper executable.
    pub fn executable(mut self, path: impl Into<PathBuf>) -> Self {
        self.executable = path.into();
        self
    }

    /// Set the startup timeout.
    pub fn startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }
}

/// Helper launches per `open`. A helper that dies during startup usually
/// lost its port to another process, so it is retried once on a new port.
const STARTUP_ATTEMPTS: usize = 2;

/// Why a freshly spawned helper never became usable.
enum StartupFailure {
    Exited(ExitStatus),
    Unreachable(String),
}

impl From<StartupFailure> for FetchError {
    fn from(failure: StartupFailure) -> Self {
        match failure {
            StartupFailure::Exited(status) => {
                FetchError::acquisition(format!("CycleTLS exited during startup: {}", status))
            }
            StartupFailure::Unreachable(message) => FetchError::acquisition(message),
        }
    }
}

/// Fingerprinting client that drives a CycleTLS helper process.
pub struct CycleTlsClient {
    config: CycleTlsConfig,
}

impl CycleTlsClient {
    pub fn new(config: CycleTlsConfig) -> Self {
        Self { config }
    }

    /// Get the client configuration.
    pub fn config(&self) -> &CycleTlsConfig {
        &self.config
    }

    fn spawn_helper(&self, port: u16) -> Result<Child, FetchError> {
        let mut child = Command::new(&self.config.executable)
            .env("WS_PORT", port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                FetchError::acquisition(format!(
                    "Failed to start {}: {}",
                    self.config.executable.display(),
                    e
                ))
            })?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(stderr, port));
        }
        Ok(child)
    }

    /// Connect to the helper on `port`, giving up after `startup_timeout`.
    ///
    /// The timeout covers the WebSocket handshake too, so a helper that
    /// accepts TCP but never answers cannot stall the caller.
    async fn connect(&self, child: &mut Child, port: u16) -> Result<HelperSocket, StartupFailure> {
        let url = format!("ws://127.0.0.1:{}", port);
        let retry_interval = self.config.connect_retry_interval;

        let attempts = async {
            loop {
                match connect_async(url.as_str()).await {
                    // The socket only belongs to our helper if it is still running.
                    Ok((socket, _)) => {
                        return match child.try_wait() {
                            Ok(Some(status)) => Err(StartupFailure::Exited(status)),
                            _ => Ok(socket),
                        };
                    }
                    Err(e) => {
                        if let Ok(Some(status)) = child.try_wait() {
                            return Err(StartupFailure::Exited(status));
                        }
                        debug!("CycleTLS on port {} not ready: {}", port, e);
                        tokio::time::sleep(retry_interval).await;
                    }
                }
            }
        };

        match tokio::time::timeout(self.config.startup_timeout, attempts).await {
            Ok(result) => result,
            Err(_) => Err(StartupFailure::Unreachable(format!(
                "CycleTLS on port {} did not answer within {:?}",
                port, self.config.startup_timeout
            ))),
        }
    }
}

#[async_trait]
impl FingerprintClient for CycleTlsClient {
    async fn open(&self) -> Result<Box<dyn FingerprintSession>, FetchError> {
        let mut attempt = 1;
        loop {
            let port = reserve_port()
                .await
                .map_err(|e| FetchError::acquisition(format!("Failed to reserve a port: {}", e)))?;
            let mut child = self.spawn_helper(port)?;

            match self.connect(&mut child, port).await {
                Ok(socket) => {
                    info!("CycleTLS session ready on port {}", port);
                    return Ok(Box::new(CycleTlsSession {
                        socket: Mutex::new(socket),
                        child: Mutex::new(child),
                        port,
                        ja3: self.config.ja3.clone(),
                        user_agent: self.config.user_agent.clone(),
                    }));
                }
                Err(StartupFailure::Exited(status)) if attempt < STARTUP_ATTEMPTS => {
                    warn!(
                        "CycleTLS on port {} exited during startup ({}), retrying on a new port",
                        port, status
                    );
                    attempt += 1;
                }
                Err(failure) => {
                    if let StartupFailure::Unreachable(_) = failure {
                        if let Err(kill_err) = child.kill().await {
                            warn!("Failed to stop CycleTLS on port {}: {}", port, kill_err);
                        }
                    }
                    return Err(failure.into());
                }
            }
        }
    }

    fn name(&self) -> &str {
        "cycletls"
    }
}

/// One helper process and the WebSocket connected to it.
struct CycleTlsSession {
    socket: Mutex<HelperSocket>,
    child: Mutex<Child>,
    port: u16,
    ja3: String,
    user_agent: String,
}

#[async_trait]
impl FingerprintSession for CycleTlsSession {
    async fn get(&self, url: &str, args: &Map<String, Value>) -> Result<Value, FetchError> {
        let request_id = format!("{}{}", url, generate_request_id());
        let options = build_options(url, args, &self.ja3, &self.user_agent);
        let frame = json!({ "requestId": request_id, "options": options });

        let mut socket = self.socket.lock().await;
        socket
            .send(Message::Text(frame.to_string()))
            .await
            .map_err(|e| FetchError::upstream(format!("Failed to send request to CycleTLS: {}", e)))?;

        while let Some(message) = socket.next().await {
            let message = message.map_err(|e| FetchError::upstream(e.to_string()))?;
            let payload: Value = match message {
                Message::Text(text) => serde_json::from_str(&text),
                Message::Binary(data) => serde_json::from_slice(&data),
                Message::Close(_) => break,
                _ => continue,
            }
            .map_err(|e| FetchError::upstream(format!("Invalid CycleTLS response: {}", e)))?;

            if payload.get("RequestID").and_then(Value::as_str) != Some(request_id.as_str()) {
                debug!("Ignoring CycleTLS frame for another request on port {}", self.port);
                continue;
            }

            return parse_response(payload);
        }

        Err(FetchError::upstream(
            "CycleTLS closed the connection before responding",
        ))
    }

    async fn close(self: Box<Self>) {
        let CycleTlsSession {
            socket, child, port, ..
        } = *self;

        let mut socket = socket.into_inner();
        if let Err(e) = socket.close(None).await {
            debug!("CycleTLS socket on port {} did not close cleanly: {}", port, e);
        }

        let mut child = child.into_inner();
        if let Err(e) = child.kill().await {
            warn!("Failed to stop CycleTLS on port {}: {}", port, e);
        }
        debug!("CycleTLS on port {} stopped", port);
    }
}

/// Pick a free local port for a new helper.
///
/// The port is released before the helper binds it, so another process can
/// take it in between. `open` covers that by restarting a helper that exits
/// during startup.
async fn reserve_port() -> std::io::Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    Ok(listener.local_addr()?.port())
}

async fn forward_stderr(stderr: ChildStderr, port: u16) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!("cycletls[{}]: {}", port, line);
    }
}

/// Absent, null, empty and `false` values all count as unset.
fn is_unset(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) | Some(Value::Bool(false)) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(_) => false,
    }
}

/// Build the helper's option object from the caller's args.
///
/// The caller's values win. Library defaults only fill unset keys, and a
/// `{name: value}` cookie object is rewritten into the helper's list form.
fn build_options(
    url: &str,
    args: &Map<String, Value>,
    ja3: &str,
    user_agent: &str,
) -> Map<String, Value> {
    let mut options = args.clone();

    let defaults = [
        ("ja3", Value::from(ja3)),
        ("userAgent", Value::from(user_agent)),
        ("body", Value::from("")),
        ("proxy", Value::from("")),
        ("insecureSkipVerify", Value::Bool(false)),
        ("forceHTTP1", Value::Bool(false)),
    ];
    for (key, default) in defaults {
        if is_unset(options.get(key)) {
            options.insert(key.to_string(), default);
        }
    }

    if let Some(Value::Object(cookies)) = options.get("cookies") {
        let cookies: Vec<Value> = cookies
            .iter()
            .map(|(name, value)| json!({ "name": name, "value": value }))
            .collect();
        options.insert("cookies".to_string(), Value::Array(cookies));
    }

    options.insert("url".to_string(), Value::from(url));
    options.insert("method".to_string(), Value::from("GET"));
    options
}

/// Turn a helper response frame into `{status, body, headers, finalUrl}`.
fn parse_response(payload: Value) -> Result<Value, FetchError> {
    if let Some(error) = payload.get("error").filter(|e| !is_unset(Some(*e))) {
        let message = match error {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        return Err(FetchError::upstream(message));
    }

    let status = payload.get("Status").cloned().unwrap_or(Value::Null);

    let body = match payload.get("Body") {
        Some(Value::String(raw)) => {
            serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone()))
        }
        Some(other) => other.clone(),
        None => Value::String(String::new()),
    };

    let mut headers = match payload.get("Headers") {
        Some(Value::Object(headers)) => headers.clone(),
        _ => Map::new(),
    };
    if let Some(Value::String(cookies)) = headers.get("Set-Cookie") {
        let cookies: Vec<Value> = cookies.split("/,/").map(Value::from).collect();
        headers.insert("Set-Cookie".to_string(), Value::Array(cookies));
    }

    let final_url = payload.get("FinalUrl").cloned().unwrap_or(Value::Null);

    Ok(json!({
        "status": status,
        "body": body,
        "headers": headers,
        "finalUrl": final_url,
    }))
}
