//! Per-request state shared by the dispatch pipeline
//!
//! A [`RequestContext`] holds the transport-provided request data, a
//! fixed-shape enrichment record filled in by the server before dispatch,
//! and the response being accumulated by the chain.

use crate::geo::GeoInfo;
use hyper::body::Bytes;
use hyper::header::{HeaderName, HeaderValue};
use hyper::{HeaderMap, Method, Request, StatusCode, Uri, Version};
use serde::Serialize;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use tracing::warn;

/// Values attached to a request before its router runs
#[derive(Debug, Default, Clone)]
pub struct Enrichment {
    /// Client address taken from the configured region field
    pub client_addr: Option<IpAddr>,
    /// Geo information for the client address
    pub geo: Option<GeoInfo>,
    /// User variables from the server and router declarations
    pub variables: HashMap<String, String>,
    /// Parameters captured by the matched route
    pub params: Vec<(String, String)>,
}

/// Response accumulated while the chain runs
#[derive(Debug)]
pub struct ResponseState {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    /// Set once a status or body was written
    pub touched: bool,
}

impl Default for ResponseState {
    fn default() -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Vec::new(),
            touched: false,
        }
    }
}

/// A single in-flight request
#[derive(Debug)]
pub struct RequestContext {
    method: Method,
    uri: Uri,
    version: Version,
    headers: HeaderMap,
    body: Bytes,
    remote_addr: SocketAddr,
    local_addr: SocketAddr,
    is_tls: bool,
    enrichment: Enrichment,
    response: ResponseState,
    terminated: bool,
}

impl RequestContext {
    pub fn new(req: Request<Bytes>, remote_addr: SocketAddr, local_addr: SocketAddr) -> Self {
        let (parts, body) = req.into_parts();
        Self {
            method: parts.method,
            uri: parts.uri,
            version: parts.version,
            headers: parts.headers,
            body,
            remote_addr,
            local_addr,
            is_tls: false,
            enrichment: Enrichment::default(),
            response: ResponseState::default(),
            terminated: false,
        }
    }

    pub fn with_tls(mut self, is_tls: bool) -> Self {
        self.is_tls = is_tls;
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Request header value as a string, if present and valid UTF-8
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_tls(&self) -> bool {
        self.is_tls
    }

    /// Host header without the port
    pub fn host(&self) -> &str {
        self.header("host")
            .map(|h| h.split(':').next().unwrap_or(h))
            .unwrap_or("")
    }

    /// Effective client address: the enriched value if set, else the peer IP
    pub fn client_ip(&self) -> IpAddr {
        self.enrichment
            .client_addr
            .unwrap_or_else(|| self.remote_addr.ip())
    }

    pub fn enrichment(&self) -> &Enrichment {
        &self.enrichment
    }

    pub fn enrichment_mut(&mut self) -> &mut Enrichment {
        &mut self.enrichment
    }

    pub fn response(&self) -> &ResponseState {
        &self.response
    }

    pub fn response_mut(&mut self) -> &mut ResponseState {
        &mut self.response
    }

    pub fn into_response(self) -> ResponseState {
        self.response
    }

    // --- response operations available to handles and callbacks ---

    pub fn set_status(&mut self, status: StatusCode) {
        self.response.status = status;
        self.response.touched = true;
    }

    /// True once any slot set a status or wrote a body
    pub fn is_answered(&self) -> bool {
        self.response.touched
    }

    /// Set a response header, replacing any previous value for the name
    pub fn set_header(&mut self, name: &str, value: &str) {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                self.response.headers.insert(name, value);
            }
            _ => warn!(header = name, "Ignoring invalid response header"),
        }
    }

    /// Set a request header, visible to later slots through `http_*` variables
    pub fn set_request_header(&mut self, name: &str, value: &str) {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                self.headers.insert(name, value);
            }
            _ => warn!(header = name, "Ignoring invalid request header"),
        }
    }

    /// Replace the response body
    pub fn say(&mut self, body: impl AsRef<[u8]>) {
        self.response.body.clear();
        self.response.body.extend_from_slice(body.as_ref());
        self.response.touched = true;
    }

    /// Replace the response body with the JSON encoding of `value`
    pub fn say_json<T: Serialize>(&mut self, value: &T) -> Result<(), serde_json::Error> {
        let body = serde_json::to_vec(value)?;
        self.set_header("content-type", "application/json");
        self.response.body = body;
        self.response.touched = true;
        Ok(())
    }

    /// Append to the response body
    pub fn append(&mut self, chunk: impl AsRef<[u8]>) {
        self.response.body.extend_from_slice(chunk.as_ref());
        self.response.touched = true;
    }

    pub fn redirect(&mut self, location: &str, status: StatusCode) {
        self.set_header("location", location);
        self.set_status(status);
    }

    /// Set the status and stop the chain after the current slot
    pub fn exit(&mut self, status: StatusCode) {
        self.set_status(status);
        self.terminated = true;
    }

    /// Stop the chain after the current slot
    pub fn eof(&mut self) {
        self.terminated = true;
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Fixed NotFound response
    pub fn not_found(&mut self) {
        self.set_status(StatusCode::NOT_FOUND);
        self.say(crate::error::NOT_FOUND_BODY);
    }

    /// Internal-error response carrying the failure text
    pub fn internal_error(&mut self, message: &str) {
        self.set_status(StatusCode::INTERNAL_SERVER_ERROR);
        self.say(message);
    }
}
