//! Per-host routers
//!
//! A [`Router`] maps (method, path) to a [`HandleChain`] for one virtual
//! host. Paths use matchit syntax: `/users/{id}` captures one segment and
//! `/static/{*rest}` captures the remainder. Captured values are exposed to
//! the chain through `param_*` variables.

use crate::cache::Resource;
use crate::context::RequestContext;
use crate::error::{CloseError, CompileError, DispatchError};
use crate::files::StaticFiles;
use crate::handle::{Callback, CloseHook, HandleChain, HandleSource};
use crate::sink::OutputSink;
use crate::template::AccessFormat;
use hyper::Method;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Per-router access-log override
#[derive(Clone)]
pub enum AccessLog {
    /// No access line is written for this host
    Off,
    /// Replace the server's format and, when given, its sink
    Format {
        format: AccessFormat,
        sink: Option<Arc<dyn OutputSink>>,
    },
}

impl fmt::Debug for AccessLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessLog::Off => f.write_str("Off"),
            AccessLog::Format { format, sink } => f
                .debug_struct("Format")
                .field("format", format)
                .field("sink", &sink.is_some())
                .finish(),
        }
    }
}

pub struct Router {
    name: String,
    routes: HashMap<Method, matchit::Router<usize>>,
    any: matchit::Router<usize>,
    chains: Vec<HandleChain>,
    not_found: Option<HandleChain>,
    interceptor: Option<Callback>,
    access: Option<AccessLog>,
    region: Option<String>,
    variables: Vec<(String, String)>,
    handler_dir: String,
    mtime: i64,
    close: Option<CloseHook>,
}

impl Router {
    pub fn builder(name: impl Into<String>) -> RouterBuilder {
        RouterBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Directory named chain slots are resolved under
    pub fn handler_dir(&self) -> &str {
        &self.handler_dir
    }

    /// Request variable holding the client address for geo enrichment
    pub fn region(&self) -> Option<&str> {
        self.region.as_deref()
    }

    pub fn variables(&self) -> &[(String, String)] {
        &self.variables
    }

    pub fn access_log(&self) -> Option<&AccessLog> {
        self.access.as_ref()
    }

    /// Number of registered routes
    pub fn route_count(&self) -> usize {
        self.chains.len()
    }

    fn find(&self, method: &Method, path: &str) -> Option<(usize, Vec<(String, String)>)> {
        let matched = self
            .routes
            .get(method)
            .and_then(|r| r.at(path).ok())
            .or_else(|| self.any.at(path).ok())?;

        let params = matched
            .params
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Some((*matched.value, params))
    }

    /// Run the matching chain, then the interceptor
    pub fn dispatch(&self, ctx: &mut RequestContext, handles: &dyn HandleSource) {
        match self.find(ctx.method(), ctx.path()) {
            Some((idx, params)) => {
                ctx.enrichment_mut().params = params;
                self.chains[idx].run(ctx, &self.handler_dir, handles);
            }
            None => {
                debug!(router = %self.name, path = %ctx.path(), "No route matched");
                match &self.not_found {
                    Some(chain) => chain.run(ctx, &self.handler_dir, handles),
                    None => ctx.not_found(),
                }
            }
        }

        if let Some(interceptor) = &self.interceptor {
            if let Err(e) = interceptor(ctx) {
                ctx.internal_error(&e.to_string());
            }
        }
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("name", &self.name)
            .field("routes", &self.chains.len())
            .field("handler_dir", &self.handler_dir)
            .field("region", &self.region)
            .field("mtime", &self.mtime)
            .finish()
    }
}

impl Resource for Router {
    type Meta = String;

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

    fn meta(&self) -> String {
        self.handler_dir.clone()
    }
}

/// Assembles a [`Router`] from route registrations
pub struct RouterBuilder {
    router: Router,
}

impl RouterBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            router: Router {
                name: name.into(),
                routes: HashMap::new(),
                any: matchit::Router::new(),
                chains: Vec::new(),
                not_found: None,
                interceptor: None,
                access: None,
                region: None,
                variables: Vec::new(),
                handler_dir: String::new(),
                mtime: 0,
                close: None,
            },
        }
    }

    /// Register `chain` for `method` (`GET`, `POST`, ... or `ANY`) and `path`
    pub fn route(mut self, method: &str, path: &str, chain: HandleChain) -> Result<Self, CompileError> {
        let route_err = |message: String| CompileError::Route {
            method: method.to_string(),
            path: path.to_string(),
            message,
        };

        let idx = self.router.chains.len();
        let table = if method.eq_ignore_ascii_case("ANY") {
            &mut self.router.any
        } else {
            let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
                .map_err(|e| route_err(e.to_string()))?;
            self.router.routes.entry(method).or_insert_with(matchit::Router::new)
        };
        table
            .insert(path, idx)
            .map_err(|e| route_err(e.to_string()))?;

        self.router.chains.push(chain);
        Ok(self)
    }

    pub fn get(self, path: &str, chain: HandleChain) -> Result<Self, CompileError> {
        self.route("GET", path, chain)
    }

    pub fn post(self, path: &str, chain: HandleChain) -> Result<Self, CompileError> {
        self.route("POST", path, chain)
    }

    pub fn any(self, path: &str, chain: HandleChain) -> Result<Self, CompileError> {
        self.route("ANY", path, chain)
    }

    /// Serve `GET path` from a static file root
    pub fn files(self, path: &str, files: StaticFiles) -> Result<Self, CompileError> {
        self.route("GET", path, HandleChain::new(vec![files.into_slot()]))
    }

    pub fn not_found(mut self, chain: HandleChain) -> Self {
        self.router.not_found = Some(chain);
        self
    }

    pub fn interceptor<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut RequestContext) -> Result<(), DispatchError> + Send + Sync + 'static,
    {
        self.router.interceptor = Some(Arc::new(f));
        self
    }

    pub fn access_log(mut self, access: AccessLog) -> Self {
        self.router.access = Some(access);
        self
    }

    pub fn region(mut self, field: impl Into<String>) -> Self {
        let field = field.into();
        self.router.region = (!field.is_empty()).then_some(field);
        self
    }

    /// Declare a user variable; a value starting with `$` names another variable
    pub fn variable(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.router.variables.push((name.into(), value.into()));
        self
    }

    pub fn handler_dir(mut self, dir: impl Into<String>) -> Self {
        self.router.handler_dir = dir.into();
        self
    }

    pub fn mod_time(mut self, mtime: i64) -> Self {
        self.router.mtime = mtime;
        self
    }

    pub fn on_close<F>(mut self, f: F) -> Self
    where
        F: Fn() -> Result<(), CloseError> + Send + Sync + 'static,
    {
        self.router.close = Some(Arc::new(f));
        self
    }

    pub fn build(self) -> Router {
        self.router
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::context;
    use crate::handle::testing::MapSource;
    use crate::handle::Handle;
    use hyper::StatusCode;

    fn chain(handle: Handle) -> HandleChain {
        HandleChain::new(vec![handle.into()])
    }

    fn body(ctx: &RequestContext) -> String {
        String::from_utf8_lossy(&ctx.response().body).into_owned()
    }

    fn run(router: &Router, method: &str, uri: &str) -> RequestContext {
        let mut ctx = context(method, uri, &[("host", "a.com")]);
        router.dispatch(&mut ctx, &MapSource::default());
        ctx
    }

    #[test]
    fn test_method_and_any_routes() {
        let router = Router::builder("a.com")
            .get("/", chain(Handle::text("get")))
            .unwrap()
            .post("/", chain(Handle::text("post")))
            .unwrap()
            .any("/both", chain(Handle::text("any")))
            .unwrap()
            .build();

        assert_eq!(body(&run(&router, "GET", "/")), "get");
        assert_eq!(body(&run(&router, "POST", "/")), "post");
        assert_eq!(body(&run(&router, "DELETE", "/both")), "any");
        assert_eq!(run(&router, "PUT", "/").response().status, StatusCode::NOT_FOUND);
        assert_eq!(router.route_count(), 3);
    }

    #[test]
    fn test_route_params() {
        let router = Router::builder("a.com")
            .get("/users/{id}", chain(Handle::text("user ${param_id}")))
            .unwrap()
            .get("/static/{*rest}", chain(Handle::text("${param_rest}")))
            .unwrap()
            .build();

        assert_eq!(body(&run(&router, "GET", "/users/42")), "user 42");
        assert_eq!(body(&run(&router, "GET", "/static/css/app.css")), "css/app.css");
    }

    #[test]
    fn test_not_found_chain() {
        let plain = Router::builder("a.com").build();
        let ctx = run(&plain, "GET", "/nope");
        assert_eq!(ctx.response().status, StatusCode::NOT_FOUND);
        assert_eq!(body(&ctx), crate::error::NOT_FOUND_BODY);

        let custom = Router::builder("a.com")
            .not_found(chain(
                Handle::text("custom 404").with_code(StatusCode::NOT_FOUND),
            ))
            .build();
        let ctx = run(&custom, "GET", "/nope");
        assert_eq!(ctx.response().status, StatusCode::NOT_FOUND);
        assert_eq!(body(&ctx), "custom 404");
    }

    #[test]
    fn test_interceptor_runs_after_dispatch() {
        let router = Router::builder("a.com")
            .get("/", chain(Handle::text("body")))
            .unwrap()
            .interceptor(|ctx| {
                ctx.set_header("x-intercepted", "1");
                Ok(())
            })
            .build();
        let ctx = run(&router, "GET", "/");
        assert_eq!(body(&ctx), "body");
        assert_eq!(ctx.response().headers.get("x-intercepted").unwrap(), "1");
    }

    #[test]
    fn test_interceptor_failure_overrides_response() {
        let router = Router::builder("a.com")
            .get("/", chain(Handle::text("body")))
            .unwrap()
            .interceptor(|_| Err(DispatchError::Callback("denied".into())))
            .build();
        let ctx = run(&router, "GET", "/");
        assert_eq!(ctx.response().status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body(&ctx), "denied");
    }

    #[test]
    fn test_invalid_routes() {
        let conflict = Router::builder("a.com")
            .get("/x", HandleChain::default())
            .unwrap()
            .get("/x", HandleChain::default());
        assert!(matches!(conflict, Err(CompileError::Route { .. })));

        let bad_method = Router::builder("a.com").route("NOT A METHOD", "/", HandleChain::default());
        assert!(bad_method.is_err());
    }

    #[test]
    fn test_resource_meta_is_handler_dir() {
        let router = Router::builder("/www/vhost/a.com.toml")
            .handler_dir("/www/handle")
            .mod_time(7)
            .build();
        assert_eq!(router.meta(), "/www/handle");
        assert_eq!(router.mod_time(), 7);
        assert!(router.matches("/www/vhost/a.com.toml"));
    }

    #[test]
    fn test_files_route_serves_captured_path() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("logo.svg"), "<svg/>").unwrap();
        let router = Router::builder("files")
            .files("/static/{*file}", StaticFiles::new(dir.path()))
            .unwrap()
            .build();

        let ctx = run(&router, "GET", "/static/logo.svg");
        assert_eq!(body(&ctx), "<svg/>");
        assert_eq!(ctx.response().headers.get("content-type").unwrap(), "image/svg+xml");

        let ctx = run(&router, "POST", "/static/logo.svg");
        assert_eq!(ctx.response().status, StatusCode::NOT_FOUND);
    }
}
