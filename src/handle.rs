//! Handles and the dispatch chain
//!
//! A [`Handle`] is the unit of request-handling behavior: an optional
//! condition, a status code, response headers and a body producer. A
//! [`HandleChain`] is the ordered list of slots a route runs.

use crate::cache::Resource;
use crate::context::RequestContext;
use crate::error::{CloseError, CompileError, DispatchError};
use crate::filter::Condition;
use crate::template::Template;
use hyper::StatusCode;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Value of the `server` header set by every matching handle
pub const SERVER_HEADER: &str = concat!("hotgate/", env!("CARGO_PKG_VERSION"));

/// Inline code run against the request context
pub type Callback = Arc<dyn Fn(&mut RequestContext) -> Result<(), DispatchError> + Send + Sync>;

/// Release step of a programmatically declared resource
pub type CloseHook = Arc<dyn Fn() -> Result<(), CloseError> + Send + Sync>;

/// Ordered response headers; names compare ignoring ASCII case
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Header {
    entries: Vec<(String, String)>,
}

impl Header {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the value of a matching name in place, else append
    pub fn set(&mut self, name: &str, value: &str) {
        match self
            .entries
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
        {
            Some(entry) => *entry = (name.to_string(), value.to_string()),
            None => self.entries.push((name.to_string(), value.to_string())),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Body producer of a handle
#[derive(Clone)]
pub enum Body {
    Template(Template),
    Callback(Callback),
}

impl Body {
    fn produce(&self, ctx: &mut RequestContext) -> Result<(), DispatchError> {
        match self {
            Body::Template(t) => {
                t.render_body(ctx);
                Ok(())
            }
            Body::Callback(f) => f(ctx),
        }
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Template(t) => f.debug_tuple("Template").field(&t.as_str()).finish(),
            Body::Callback(_) => f.write_str("Callback(..)"),
        }
    }
}

/// What the chain does after a handle ran
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// The condition did not match
    Skip,
    /// The handle ran and the chain continues
    Next,
    /// The handle ran and is terminal
    Stop,
}

pub struct Handle {
    name: String,
    filter: Option<Condition>,
    code: Option<StatusCode>,
    header: Header,
    body: Option<Body>,
    close: Option<CloseHook>,
    eof: bool,
    mtime: i64,
    hits: AtomicU64,
}

impl Handle {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            filter: None,
            code: None,
            header: Header::new(),
            body: None,
            close: None,
            eof: false,
            mtime: 0,
            hits: AtomicU64::new(0),
        }
    }

    /// Terminal handle answering 200 with a template body
    pub fn text(body: &str) -> Self {
        Self::new("text")
            .with_code(StatusCode::OK)
            .with_body(Body::Template(Template::compile(body)))
            .with_eof(true)
    }

    /// Terminal handle answering with a `location` header
    pub fn redirect(location: &str, code: StatusCode) -> Self {
        Self::new("redirect")
            .with_code(code)
            .with_header("location", location)
            .with_eof(true)
    }

    pub fn with_filter(mut self, filter: Condition) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_code(mut self, code: StatusCode) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.header.set(name, value);
        self
    }

    pub fn with_body(mut self, body: Body) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_callback<F>(self, f: F) -> Self
    where
        F: Fn(&mut RequestContext) -> Result<(), DispatchError> + Send + Sync + 'static,
    {
        self.with_body(Body::Callback(Arc::new(f)))
    }

    pub fn with_eof(mut self, eof: bool) -> Self {
        self.eof = eof;
        self
    }

    pub fn with_close<F>(mut self, f: F) -> Self
    where
        F: Fn() -> Result<(), CloseError> + Send + Sync + 'static,
    {
        self.close = Some(Arc::new(f));
        self
    }

    pub fn with_mod_time(mut self, mtime: i64) -> Self {
        self.mtime = mtime;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn code(&self) -> Option<StatusCode> {
        self.code
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn is_eof(&self) -> bool {
        self.eof
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Run this handle against the request
    pub fn apply(&self, ctx: &mut RequestContext) -> Result<Flow, DispatchError> {
        self.hits.fetch_add(1, Ordering::Relaxed);

        if let Some(filter) = &self.filter {
            if !filter.matches(ctx) {
                return Ok(Flow::Skip);
            }
        }

        ctx.set_header("server", SERVER_HEADER);
        for (name, value) in self.header.iter() {
            ctx.set_header(name, value);
        }

        if self.code.is_none() && self.body.is_none() {
            return Err(DispatchError::EmptyHandle);
        }

        if let Some(code) = self.code {
            ctx.set_status(code);
        }

        if let Some(body) = &self.body {
            body.produce(ctx)?;
        }

        Ok(if self.eof { Flow::Stop } else { Flow::Next })
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("name", &self.name)
            .field("code", &self.code)
            .field("header", &self.header)
            .field("body", &self.body)
            .field("eof", &self.eof)
            .field("hits", &self.hits())
            .finish()
    }
}

impl Resource for Handle {
    type Meta = ();

    fn matches(&self, name: &str) -> bool {
        self.name == name
    }

    fn close(&self) -> Result<(), CloseError> {
        match &self.close {
            Some(hook) => hook(),
            None => Ok(()),
        }
    }

    fn mod_time(&self) -> i64 {
        self.mtime
    }

    fn meta(&self) {}
}

/// Resolves named chain slots to handles
pub trait HandleSource: Send + Sync {
    /// Handle declared as `name` under the handler directory `dir`
    fn require_handle(&self, dir: &str, name: &str) -> Result<Arc<Handle>, CompileError>;
}

/// One element of a chain
#[derive(Clone)]
pub enum Slot {
    /// Handle looked up by name when the slot runs
    Named(String),
    /// Handle compiled together with the route
    Handle(Arc<Handle>),
    /// Inline code
    Callback(Callback),
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Slot::Named(name) => f.debug_tuple("Named").field(name).finish(),
            Slot::Handle(h) => f.debug_tuple("Handle").field(&h.name()).finish(),
            Slot::Callback(_) => f.write_str("Callback(..)"),
        }
    }
}

impl From<&str> for Slot {
    fn from(name: &str) -> Self {
        Slot::Named(name.to_string())
    }
}

impl From<Handle> for Slot {
    fn from(handle: Handle) -> Self {
        Slot::Handle(Arc::new(handle))
    }
}

impl From<Arc<Handle>> for Slot {
    fn from(handle: Arc<Handle>) -> Self {
        Slot::Handle(handle)
    }
}

/// Ordered, immutable list of slots run for a matched route
#[derive(Debug, Clone)]
pub struct HandleChain {
    slots: Arc<[Slot]>,
}

impl Default for HandleChain {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl HandleChain {
    pub fn new(slots: Vec<Slot>) -> Self {
        Self {
            slots: slots.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Execute the chain; named slots are resolved under `handler_dir`
    pub fn run(&self, ctx: &mut RequestContext, handler_dir: &str, source: &dyn HandleSource) {
        if self.slots.is_empty() {
            ctx.not_found();
            return;
        }

        for (idx, slot) in self.slots.iter().enumerate() {
            let result = match slot {
                Slot::Named(name) => source
                    .require_handle(handler_dir, name)
                    .map_err(DispatchError::from)
                    .and_then(|h| h.apply(ctx)),
                Slot::Handle(h) => h.apply(ctx),
                Slot::Callback(f) => f(ctx).map(|_| Flow::Next),
            };

            match result {
                Ok(Flow::Stop) => {
                    debug!(slot = idx, "Chain stopped by terminal handle");
                    return;
                }
                Ok(_) if ctx.is_terminated() => {
                    debug!(slot = idx, "Chain stopped by exit");
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(slot = idx, error = %e, "Chain aborted");
                    ctx.internal_error(&e.to_string());
                    return;
                }
            }
        }

        if !ctx.is_answered() {
            debug!(slots = self.slots.len(), "Chain exhausted without a response");
            ctx.not_found();
        }
    }
}

impl FromIterator<Slot> for HandleChain {
    fn from_iter<I: IntoIterator<Item = Slot>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// In-memory handle source keyed by `dir/name`
    #[derive(Default)]
    pub struct MapSource {
        handles: HashMap<String, Arc<Handle>>,
        pub requests: Mutex<Vec<String>>,
    }

    impl MapSource {
        pub fn with(mut self, key: &str, handle: Handle) -> Self {
            self.handles.insert(key.to_string(), Arc::new(handle));
            self
        }
    }

    impl HandleSource for MapSource {
        fn require_handle(&self, dir: &str, name: &str) -> Result<Arc<Handle>, CompileError> {
            let key = format!("{}/{}", dir, name);
            self.requests.lock().push(key.clone());
            self.handles.get(&key).cloned().ok_or_else(|| CompileError::Io {
                path: key,
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
            })
        }
    }
}
