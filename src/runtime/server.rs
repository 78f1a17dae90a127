//! Relay HTTP server implementation.

use crate::fetch::{BoundedInvoker, FetchError, FingerprintClient};
use crate::http::{generate_request_id, RelayResponse, StatusCode};
use crate::runtime::{gateway, RelayConfig};
use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Route served by the relay.
pub const FETCH_PATH: &str = "/fetch";

/// Pause after a failed accept, e.g. while the process is out of file descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Relay server.
///
/// Accepts `POST /fetch` and answers each request with one bounded GET
/// through the configured fingerprinting client.
pub struct RelayServer {
    /// Server configuration.
    config: RelayConfig,
    /// Shared invoker; it holds no per-request state.
    invoker: BoundedInvoker,
}

impl RelayServer {
    /// Create a new relay server.
    pub fn new(config: RelayConfig, client: Arc<dyn FingerprintClient>) -> Self {
        let invoker = BoundedInvoker::new(client).with_deadline(config.fetch_deadline());
        Self { config, invoker }
    }

    /// Get the invoker.
    pub fn invoker(&self) -> &BoundedInvoker {
        &self.invoker
    }

    /// Bind to the configured address and serve forever.
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr: SocketAddr = self.config.bind_addr().parse()?;
        let listener = TcpListener::bind(addr).await?;

        info!("Server listening at http://{}", addr);

        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(
        self,
        listener: TcpListener,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let invoker = self.invoker.clone();
        let config = self.config.clone();

        loop {
            let (stream, remote_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };
            let io = TokioIo::new(stream);

            let invoker = invoker.clone();
            let config = config.clone();

            tokio::task::spawn(async move {
                let service = service_fn(move |req| {
                    let invoker = invoker.clone();
                    let config = config.clone();
                    async move { handle_request(req, invoker, config, remote_addr).await }
                });

                if let Err(err) = http1::Builder::new()
                    .serve_connection(io, service)
                    .await
                {
                    error!("Error serving connection: {:?}", err);
                }
            });
        }
    }
}

/// Handle an incoming HTTP request.
async fn handle_request(
    req: Request<Incoming>,
    invoker: BoundedInvoker,
    config: RelayConfig,
    remote_addr: SocketAddr,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path().to_string();
    let method = req.method().clone();
    let request_id = generate_request_id();

    debug!(
        "Handling request: {} {} from {} [{}]",
        method, path, remote_addr, request_id
    );

    if path != FETCH_PATH {
        return Ok(build_response(RelayResponse::error(
            StatusCode::NOT_FOUND,
            format!("Cannot {} {}", method, path),
        )));
    }

    if method != Method::POST {
        return Ok(build_response(
            RelayResponse::error(
                StatusCode::METHOD_NOT_ALLOWED,
                format!("Method {} not allowed on {}", method, FETCH_PATH),
            )
            .header("Allow", "POST"),
        ));
    }

    let body = match read_body(req, config.max_body_size).await {
        Ok(body) => body,
        Err(e) => {
            warn!("Failed to read request body: {} [{}]", e, request_id);
            return Ok(build_response(e.into()));
        }
    };

    let response = gateway::handle(&body, &invoker).await;
    debug!(
        "Finished request with status {} [{}]",
        response.status.0, request_id
    );
    Ok(build_response(response))
}

/// Collect the request body, stopping as soon as it exceeds the size limit.
async fn read_body(req: Request<Incoming>, max_body_size: usize) -> Result<Bytes, FetchError> {
    let collected = Limited::new(req.into_body(), max_body_size)
        .collect()
        .await
        .map_err(|e| {
            if e.downcast_ref::<LengthLimitError>().is_some() {
                FetchError::malformed("Request body too large")
            } else {
                FetchError::malformed(format!("Failed to read request body: {}", e))
            }
        })?;

    Ok(collected.to_bytes())
}

/// Build a hyper Response from RelayResponse.
fn build_response(relay_response: RelayResponse) -> Response<Full<Bytes>> {
    let status = hyper::StatusCode::from_u16(relay_response.status.0).unwrap_or_else(|_| {
        warn!(
            "Invalid status code {}, falling back to 500 Internal Server Error",
            relay_response.status.0
        );
        hyper::StatusCode::INTERNAL_SERVER_ERROR
    });

    let mut builder = Response::builder().status(status);

    for (name, value) in relay_response.headers {
        builder = builder.header(name, value);
    }

    builder.body(Full::new(relay_response.body)).unwrap_or_else(|e| {
        error!("Failed to build response: {}", e);
        let mut fallback = Response::new(Full::new(Bytes::new()));
        *fallback.status_mut() = hyper::StatusCode::INTERNAL_SERVER_ERROR;
        fallback
    })
}
