//! Subdomain-routing reverse proxy.
//!
//! Terminates HTTP for `<subdomain>.<base_domain>`, looks the subdomain up
//! in the route table, and forwards to the instance's local port. Requests
//! for a known project with no live route trigger an on-demand restart and
//! wait a bounded time for the route to appear.

pub mod router;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1::SendRequest;
use hyper::header::{HeaderValue, HOST};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

use crate::error::{Error, Result};
use crate::orchestrator::Orchestrator;
use crate::utils::RESERVED_LABELS;

pub use router::{extract_subdomain, RouteTable};

const ROUTE_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Shown while an instance is restarting or still inside its launch window.
/// Refreshes itself until the application answers.
const STARTING_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head>
  <meta charset="utf-8">
  <meta http-equiv="refresh" content="5">
  <title>Application Starting</title>
  <style>
    body { font-family: sans-serif; background: #0f1117; color: #e6e6e6;
           display: flex; align-items: center; justify-content: center;
           height: 100vh; margin: 0; }
    .card { text-align: center; }
    .spinner { width: 40px; height: 40px; margin: 0 auto 20px;
               border: 4px solid #2a2d37; border-top-color: #6c9ef8;
               border-radius: 50%; animation: spin 1s linear infinite; }
    @keyframes spin { to { transform: rotate(360deg); } }
  </style>
</head>
<body>
  <div class="card">
    <div class="spinner"></div>
    <h1>Application Starting</h1>
    <p>This page will refresh automatically.</p>
  </div>
</body>
</html>"#;

/// A kept-alive upstream connection, reused across requests to the same
/// subdomain. Keyed to the route generation it was opened under, so any
/// route mutation (redeploy, stop, delete) invalidates it.
struct CachedForwarder {
    generation: u64,
    sender: SendRequest<Incoming>,
}

struct ProxyState {
    routes: Arc<RouteTable>,
    orchestrator: Orchestrator,
    base_domain: String,
    restart_wait: Duration,
    forwarders: tokio::sync::Mutex<HashMap<String, CachedForwarder>>,
}

/// The reverse proxy server.
pub struct ProxyServer {
    listener: Option<TcpListener>,
    state: Arc<ProxyState>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl ProxyServer {
    /// Bind the proxy listener.
    pub async fn new(
        listen: &str,
        base_domain: &str,
        restart_wait_secs: u64,
        routes: Arc<RouteTable>,
        orchestrator: Orchestrator,
    ) -> Result<Self> {
        let listener = TcpListener::bind(listen).await?;
        tracing::info!(
            "Reverse proxy listening on {} for *.{}",
            listener.local_addr()?,
            base_domain
        );

        Ok(Self {
            listener: Some(listener),
            state: Arc::new(ProxyState {
                routes,
                orchestrator,
                base_domain: base_domain.to_string(),
                restart_wait: Duration::from_secs(restart_wait_secs),
                forwarders: tokio::sync::Mutex::new(HashMap::new()),
            }),
            shutdown_tx: None,
        })
    }

    /// Start serving. Returns immediately; connections are handled on
    /// spawned tasks until `stop` is called.
    pub fn start(&mut self) -> Result<()> {
        let listener = self
            .listener
            .take()
            .ok_or_else(|| Error::Validation("proxy already started".to_string()))?;

        let state = self.state.clone();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        self.shutdown_tx = Some(shutdown_tx);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((stream, addr)) => {
                                let state = state.clone();
                                tokio::spawn(async move {
                                    let io = TokioIo::new(stream);
                                    let service = service_fn(move |req| {
                                        let state = state.clone();
                                        async move { handle_request(req, state).await }
                                    });
                                    if let Err(e) = http1::Builder::new()
                                        .serve_connection(io, service)
                                        .await
                                    {
                                        tracing::debug!("Connection error from {}: {}", addr, e);
                                    }
                                });
                            }
                            Err(e) => {
                                tracing::error!("Accept error: {}", e);
                            }
                        }
                    }
                    _ = &mut shutdown_rx => {
                        tracing::debug!("Reverse proxy shutting down");
                        break;
                    }
                }
            }
        });

        Ok(())
    }

    /// Stop accepting connections.
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    state: Arc<ProxyState>,
) -> std::result::Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let host = match req.headers().get(HOST).and_then(|h| h.to_str().ok()) {
        Some(host) => host.to_string(),
        None => return Ok(text_response(StatusCode::BAD_REQUEST, "Missing Host header")),
    };

    let subdomain = match extract_subdomain(&host, &state.base_domain) {
        Some(subdomain) => subdomain,
        None => {
            tracing::debug!("Unroutable host {:?}", host);
            return Ok(text_response(
                StatusCode::BAD_REQUEST,
                "Unrecognized host",
            ));
        }
    };
    if RESERVED_LABELS.contains(&subdomain.as_str()) {
        return Ok(text_response(StatusCode::BAD_REQUEST, "Reserved subdomain"));
    }

    let (port, generation) = match resolve_route(&state, &subdomain).await {
        Ok(route) => route,
        Err(response) => return Ok(response),
    };

    tracing::debug!("{} {} -> 127.0.0.1:{}", req.method(), subdomain, port);
    forward(req, &state, &subdomain, port, generation, &host).await
}

/// Resolve a subdomain to a live port, restarting the instance on demand.
/// Errs with the response to send when no route could be produced.
async fn resolve_route(
    state: &ProxyState,
    subdomain: &str,
) -> std::result::Result<(u16, u64), Response<BoxBody<Bytes, hyper::Error>>> {
    if let Some(route) = state.routes.lookup_with_generation(subdomain) {
        return Ok(route);
    }

    // No live route: a known project gets a restart attempt, an unknown
    // subdomain is a 404.
    match state
        .orchestrator
        .store()
        .get_project_by_subdomain(subdomain)
        .await
    {
        Ok(_) => {}
        Err(Error::NotFound(_)) => {
            return Err(text_response(StatusCode::NOT_FOUND, "No such application"));
        }
        Err(e) => {
            tracing::error!("Route lookup for {} failed: {}", subdomain, e);
            return Err(text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal error",
            ));
        }
    }

    state.orchestrator.request_restart(subdomain);

    let deadline = tokio::time::Instant::now() + state.restart_wait;
    while tokio::time::Instant::now() < deadline {
        tokio::time::sleep(ROUTE_POLL_INTERVAL).await;
        if let Some(route) = state.routes.lookup_with_generation(subdomain) {
            return Ok(route);
        }
    }

    tracing::debug!("Restart of {} did not produce a route in time", subdomain);
    Err(starting_page(StatusCode::SERVICE_UNAVAILABLE))
}

/// Forward one request to the instance on a local port, reusing a cached
/// upstream connection when one is still valid for that port.
async fn forward(
    mut req: Request<hyper::body::Incoming>,
    state: &ProxyState,
    subdomain: &str,
    port: u16,
    generation: u64,
    original_host: &str,
) -> std::result::Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    if let Ok(value) = HeaderValue::from_str(original_host) {
        req.headers_mut().insert("x-forwarded-host", value);
    }

    let mut sender = match take_forwarder(state, subdomain, generation).await {
        Some(sender) => sender,
        None => match connect_upstream(port).await {
            Ok(sender) => sender,
            Err(response) => return Ok(response),
        },
    };

    match sender.send_request(req).await {
        Ok(resp) => {
            if !sender.is_closed() {
                state.forwarders.lock().await.insert(
                    subdomain.to_string(),
                    CachedForwarder { generation, sender },
                );
            }
            Ok(resp.map(|b| b.boxed()))
        }
        Err(e) => {
            tracing::debug!("Upstream request error: {}", e);
            Ok(text_response(StatusCode::BAD_GATEWAY, "Upstream request failed"))
        }
    }
}

/// Take the cached connection for a subdomain out of the pool, dropping it
/// when the route has been republished since it was opened or the
/// connection died.
async fn take_forwarder(
    state: &ProxyState,
    subdomain: &str,
    generation: u64,
) -> Option<SendRequest<Incoming>> {
    let cached = state.forwarders.lock().await.remove(subdomain)?;
    if cached.generation != generation || cached.sender.is_closed() {
        return None;
    }
    Some(cached.sender)
}

/// Open a fresh HTTP/1 connection to an instance port.
async fn connect_upstream(
    port: u16,
) -> std::result::Result<SendRequest<Incoming>, Response<BoxBody<Bytes, hyper::Error>>> {
    let stream = match TcpStream::connect(("127.0.0.1", port)).await {
        Ok(stream) => stream,
        Err(e) => {
            // The instance may still be booting; hand back the holding page.
            tracing::debug!("Upstream 127.0.0.1:{} not accepting yet: {}", port, e);
            return Err(starting_page(StatusCode::BAD_GATEWAY));
        }
    };

    let io = TokioIo::new(stream);
    let (sender, conn) = match hyper::client::conn::http1::handshake(io).await {
        Ok(c) => c,
        Err(e) => {
            tracing::debug!("Handshake with 127.0.0.1:{} failed: {}", port, e);
            return Err(text_response(
                StatusCode::BAD_GATEWAY,
                "Upstream handshake failed",
            ));
        }
    };

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            tracing::debug!("Upstream connection error: {}", e);
        }
    });

    Ok(sender)
}

fn text_response(status: StatusCode, message: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain; charset=utf-8")
        .body(full_body(message))
        .unwrap_or_else(|_| Response::new(empty_body()))
}

fn starting_page(status: StatusCode) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(status)
        .header("content-type", "text/html; charset=utf-8")
        .header("retry-after", "5")
        .body(full_body(STARTING_PAGE))
        .unwrap_or_else(|_| Response::new(empty_body()))
}

fn empty_body() -> BoxBody<Bytes, hyper::Error> {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

fn full_body(s: &str) -> BoxBody<Bytes, hyper::Error> {
    Full::new(Bytes::from(s.to_string()))
        .map_err(|never| match never {})
        .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starting_page_shape() {
        let resp = starting_page(StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            resp.headers().get("content-type").unwrap(),
            "text/html; charset=utf-8"
        );
        assert!(STARTING_PAGE.contains("Application Starting"));
    }

    #[test]
    fn test_text_response_shape() {
        let resp = text_response(StatusCode::NOT_FOUND, "No such application");
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
