//! HTTP transport in front of [`Server`]
//!
//! Accepts connections, buffers each request body, runs the request
//! through the server and writes back the accumulated response.

use crate::context::{RequestContext, ResponseState};
use crate::server::Server;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";

pub struct Listener {
    listener: TcpListener,
    server: Arc<Server>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Listener {
    pub async fn bind(
        addr: &str,
        server: Arc<Server>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            server,
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until the shutdown signal fires
    pub async fn run(self) -> anyhow::Result<()> {
        let local = self.listener.local_addr()?;
        info!(addr = %local, server = %self.server.name(), "Listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let server = Arc::clone(&self.server);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, server).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Listener shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, server: Arc<Server>) -> anyhow::Result<()> {
    let local_addr = stream.local_addr()?;
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let server = Arc::clone(&server);
        async move { handle_request(req, server, addr, local_addr).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    server: Arc<Server>,
    remote_addr: SocketAddr,
    local_addr: SocketAddr,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let (mut parts, body) = req.into_parts();

    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            debug!(addr = %remote_addr, error = %e, "Failed to read request body");
            return Ok(plain_response(StatusCode::BAD_REQUEST, "bad request"));
        }
    };

    let request_id = match parts.headers.get(X_REQUEST_ID) {
        Some(id) => id.clone(),
        None => {
            let id = HeaderValue::from_str(&Uuid::new_v4().to_string())
                .expect("uuid is a valid header value");
            parts.headers.insert(X_REQUEST_ID, id.clone());
            id
        }
    };

    let mut ctx = RequestContext::new(Request::from_parts(parts, body), remote_addr, local_addr);

    // A cold cache miss compiles from disk
    let handled = tokio::task::spawn_blocking(move || {
        server.handle(&mut ctx);
        ctx
    })
    .await;
    let ctx = match handled {
        Ok(ctx) => ctx,
        Err(e) => {
            error!(addr = %remote_addr, error = %e, "Request handler failed");
            return Ok(plain_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error"));
        }
    };

    let mut response = into_response(ctx.into_response());
    response.headers_mut().insert(X_REQUEST_ID, request_id);
    Ok(response)
}

fn into_response(state: ResponseState) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(state.body)));
    *response.status_mut() = state.status;
    *response.headers_mut() = state.headers;
    response
}

fn plain_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain")
        .body(Full::new(Bytes::from_static(body.as_bytes())))
        .expect("valid response builder")
}
