//! Per-request orchestration
//!
//! [`Server::handle`] selects the router for a request, attaches geo and
//! user variables, dispatches, and writes the access line. [`SyncTask`]
//! owns the periodic sweep over the router and handle caches.

use crate::cache::{Compile, ResourceCache, SyncReport};
use crate::config::Config;
use crate::context::RequestContext;
use crate::error::{CompileError, Error};
use crate::geo::GeoLookup;
use crate::handle::{Handle, HandleSource};
use crate::loader::{self, FileCompiler};
use crate::router::{AccessLog, Router};
use crate::sink::{OutputSink, TracingSink};
use crate::template::AccessFormat;
use crate::vars;
use crate::vhost::VirtualHostTable;
use hyper::StatusCode;
use parking_lot::RwLock;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub struct Server {
    name: String,
    router_dir: String,
    handler_dir: String,
    region: Option<String>,
    variables: Vec<(String, String)>,
    access: Option<AccessFormat>,
    sink: Arc<dyn OutputSink>,
    routers: ResourceCache<Router>,
    handles: ResourceCache<Handle>,
    vhosts: VirtualHostTable,
    router_compiler: Arc<dyn Compile<Router>>,
    handle_compiler: Arc<dyn Compile<Handle>>,
    fallback: RwLock<Option<Arc<Router>>>,
    geo: Option<Arc<dyn GeoLookup>>,
}

impl Server {
    /// Server with defaults for everything but the two directories
    pub fn new(router_dir: impl Into<String>, handler_dir: impl Into<String>) -> Self {
        Self {
            name: "hotgate".to_string(),
            router_dir: router_dir.into(),
            handler_dir: handler_dir.into(),
            region: None,
            variables: Vec::new(),
            access: Some(AccessFormat::default()),
            sink: Arc::new(TracingSink),
            routers: ResourceCache::new("router"),
            handles: ResourceCache::new("handle"),
            vhosts: VirtualHostTable::new(),
            router_compiler: Arc::new(FileCompiler),
            handle_compiler: Arc::new(FileCompiler),
            fallback: RwLock::new(None),
            geo: None,
        }
    }

    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let mut server = Self::new(&config.server.router_dir, &config.server.handler_dir);
        server.name = config.server.name.clone();
        server.access = config.access_log.access_format();
        if let Some(sink) = config.access_log.open_sink()? {
            server.sink = sink;
        }
        server = server.with_region(&config.server.region);
        for (name, value) in &config.variables {
            server = server.with_variable(name, value);
        }

        for (host, vhost) in &config.vhosts {
            let router = server
                .router_compiler
                .compile(&vhost.router, &server.handler_dir)
                .map_err(|e| anyhow::anyhow!("vhost {}: {}", host, e))?;
            server.vhosts.insert(host, Arc::new(router));
            info!(host = %host, router = %vhost.router, "Virtual host registered");
        }

        Ok(server)
    }

    pub fn with_region(mut self, field: &str) -> Self {
        self.region = (!field.is_empty()).then(|| field.to_string());
        self
    }

    /// Server-wide user variable, applied after the router's own
    pub fn with_variable(mut self, name: &str, value: &str) -> Self {
        self.variables.push((name.to_string(), value.to_string()));
        self
    }

    /// Server access format; `None` disables logging for hosts without an override
    pub fn with_access_format(mut self, access: Option<AccessFormat>) -> Self {
        self.access = access;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn OutputSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_geo(mut self, geo: Arc<dyn GeoLookup>) -> Self {
        self.geo = Some(geo);
        self
    }

    pub fn with_compilers(
        mut self,
        routers: Arc<dyn Compile<Router>>,
        handles: Arc<dyn Compile<Handle>>,
    ) -> Self {
        self.router_compiler = routers;
        self.handle_compiler = handles;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn router_dir(&self) -> &str {
        &self.router_dir
    }

    pub fn handler_dir(&self) -> &str {
        &self.handler_dir
    }

    pub fn routers(&self) -> &ResourceCache<Router> {
        &self.routers
    }

    pub fn handles(&self) -> &ResourceCache<Handle> {
        &self.handles
    }

    pub fn vhosts(&self) -> &VirtualHostTable {
        &self.vhosts
    }

    /// Router run for requests whose host resolves to nothing
    pub fn set_fallback(&self, router: Option<Arc<Router>>) {
        *self.fallback.write() = router;
    }

    /// Install a handle under a cache key; the sweep never touches it
    pub fn register_handle(&self, key: &str, handle: Handle) {
        self.handles.pin(key, Arc::new(handle));
    }

    /// Install a router under a cache key; the sweep never touches it
    pub fn register_router(&self, key: &str, router: Router) {
        self.routers.pin(key, Arc::new(router));
    }

    /// Add or replace a virtual host
    pub fn insert(&self, host: &str, router: Router) {
        self.vhosts.insert(host, Arc::new(router));
    }

    /// Remove every virtual host starting with `prefix`
    pub fn evict(&self, prefix: &str) -> usize {
        self.vhosts.evict_prefix(prefix)
    }

    /// One sweep over the router cache, then the handle cache
    pub fn sync_once(&self) -> (SyncReport, SyncReport) {
        let routers = self.routers.sync(self.router_compiler.as_ref());
        let handles = self.handles.sync(self.handle_compiler.as_ref());
        (routers, handles)
    }

    /// Close every cached resource under the configured directories
    pub fn shutdown(&self) {
        info!(server = %self.name, "Clearing resource caches");
        self.routers.evict_prefix(&self.router_dir);
        self.handles.evict_prefix(&self.handler_dir);
    }

    fn select_router(&self, ctx: &RequestContext) -> Result<Arc<Router>, Error> {
        let host = ctx.host();
        if let Some(router) = self.vhosts.lookup(host) {
            return Ok(router);
        }

        let key = loader::router_key(&self.router_dir, host)
            .ok_or_else(|| Error::NotFound(host.to_string()))?;
        self.routers
            .require(&key, &self.handler_dir, self.router_compiler.as_ref())
            .map_err(Error::from)
    }

    fn enrich(&self, router: Option<&Router>, ctx: &mut RequestContext) {
        let region = router
            .and_then(|r| r.region())
            .or(self.region.as_deref());
        if let Some(field) = region {
            self.enrich_region(field, ctx);
        }

        let router_vars = router.map(|r| r.variables()).unwrap_or_default();
        for (name, value) in router_vars.iter().chain(self.variables.iter()) {
            let value = match value.strip_prefix('$') {
                Some(source) => vars::resolve(ctx, source)
                    .map(|v| v.into_owned())
                    .unwrap_or_default(),
                None => value.clone(),
            };
            ctx.enrichment_mut().variables.insert(name.clone(), value);
        }
    }

    fn enrich_region(&self, field: &str, ctx: &mut RequestContext) {
        let Some(ip) = vars::resolve(ctx, field).and_then(|v| v.trim().parse::<IpAddr>().ok()) else {
            return;
        };
        ctx.enrichment_mut().client_addr = Some(ip);

        if !ip.is_ipv4() {
            return;
        }
        let Some(geo) = &self.geo else {
            return;
        };
        match geo.lookup(ip) {
            Ok(info) => ctx.enrichment_mut().geo = Some(info),
            Err(e) => warn!(error = %e, "Geo lookup failed"),
        }
    }

    fn not_found(&self, ctx: &mut RequestContext) {
        let fallback = self.fallback.read().clone();
        match fallback {
            Some(router) => router.dispatch(ctx, self),
            None => ctx.not_found(),
        }
    }

    fn log_access(&self, router: Option<&Router>, ctx: &RequestContext) {
        let (format, sink) = match router.and_then(|r| r.access_log()) {
            Some(AccessLog::Off) => return,
            Some(AccessLog::Format { format, sink }) => {
                (Some(format), sink.as_ref().unwrap_or(&self.sink))
            }
            None => (self.access.as_ref(), &self.sink),
        };
        if let Some(format) = format {
            sink.write(format.render(ctx).as_bytes());
        }
    }

    /// Serve one request
    pub fn handle(&self, ctx: &mut RequestContext) {
        let selected = self.select_router(ctx);
        let router = selected.as_ref().ok().cloned();

        self.enrich(router.as_deref(), ctx);

        match selected {
            Ok(router) => router.dispatch(ctx, self),
            Err(e) if e.status_code() == StatusCode::NOT_FOUND => {
                debug!(host = %ctx.host(), error = %e, "No router for host");
                self.not_found(ctx);
            }
            Err(e) => {
                error!(host = %ctx.host(), error = %e, "Router selection failed");
                ctx.set_status(e.status_code());
                ctx.say(e.to_string());
            }
        }

        self.log_access(router.as_deref(), ctx);
    }
}

impl HandleSource for Server {
    fn require_handle(&self, dir: &str, name: &str) -> Result<Arc<Handle>, CompileError> {
        let key = loader::handle_key(dir, name);
        self.handles.require(&key, &(), self.handle_compiler.as_ref())
    }
}

/// Background task sweeping the server's caches at a fixed interval
pub struct SyncTask {
    server: Arc<Server>,
    interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl SyncTask {
    pub fn new(server: Arc<Server>, interval: Duration, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            server,
            interval,
            shutdown_rx,
        }
    }

    /// Run until the shutdown signal fires
    pub async fn run(mut self) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            "Cache sync started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    let server = self.server.clone();
                    match tokio::task::spawn_blocking(move || server.sync_once()).await {
                        Ok((routers, handles)) => {
                            if routers.changed() || handles.changed() {
                                debug!(?routers, ?handles, "Cache sync applied changes");
                            }
                        }
                        Err(e) => error!(error = %e, "Cache sync task failed"),
                    }
                }
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        info!("Cache sync shutting down");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::testing::touch;
    use crate::context::testing::context;
    use crate::geo::{GeoInfo, StaticGeo};
    use crate::handle::HandleChain;
    use crate::template::Template;
    use parking_lot::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct MemorySink {
        lines: Mutex<Vec<String>>,
    }

    impl OutputSink for MemorySink {
        fn write(&self, line: &[u8]) {
            self.lines
                .lock()
                .push(String::from_utf8_lossy(line).into_owned());
        }
    }

    struct Fixture {
        dir: TempDir,
        server: Server,
        sink: Arc<MemorySink>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            std::fs::create_dir_all(dir.path().join("vhost")).unwrap();
            std::fs::create_dir_all(dir.path().join("handle")).unwrap();
            let sink = Arc::new(MemorySink::default());
            let server = Server::new(
                dir.path().join("vhost").to_string_lossy(),
                dir.path().join("handle").to_string_lossy(),
            )
            .with_access_format(Some(AccessFormat::Line(Template::compile(
                "${host} ${uri} ${status}",
            ))))
            .with_sink(sink.clone());
            Self { dir, server, sink }
        }

        fn write(&self, file: &str, content: &str) -> std::path::PathBuf {
            let path = self.dir.path().join(file);
            std::fs::write(&path, content).unwrap();
            path
        }

        fn request(&self, host: &str, uri: &str) -> RequestContext {
            let mut ctx = context("GET", uri, &[("host", host)]);
            self.server.handle(&mut ctx);
            ctx
        }
    }

    fn body(ctx: &RequestContext) -> String {
        String::from_utf8_lossy(&ctx.response().body).into_owned()
    }

    #[test]
    fn test_unknown_host_is_not_found() {
        let f = Fixture::new();
        let ctx = f.request("nobody.com", "/");
        assert_eq!(ctx.response().status, StatusCode::NOT_FOUND);
        assert_eq!(body(&ctx), "not found");
        assert_eq!(f.sink.lines.lock().as_slice(), ["nobody.com / 404"]);
    }

    #[test]
    fn test_registered_resources_survive_sync() {
        let f = Fixture::new();
        f.server.register_handle("greeting", Handle::text("hi"));
        let router = Router::builder("pinned")
            .get("/", HandleChain::new(vec![Handle::text("pinned").into()]))
            .unwrap()
            .build();
        let key = format!("{}/pinned.test.toml", f.server.router_dir());
        f.server.register_router(&key, router);

        let (routers, handles) = f.server.sync_once();
        assert_eq!(routers.evicted, 0);
        assert_eq!(handles.evicted, 0);
        assert!(f.server.handles().lookup("greeting").is_some());
        assert_eq!(body(&f.request("pinned.test", "/")), "pinned");
    }

    #[test]
    fn test_invalid_host_is_not_found() {
        let f = Fixture::new();
        let ctx = f.request("../../etc", "/");
        assert_eq!(ctx.response().status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_broken_router_is_internal_error() {
        let f = Fixture::new();
        f.write("vhost/bad.com.toml", "[[route]]\nnope = 1\n");
        let ctx = f.request("bad.com", "/");
        assert_eq!(ctx.response().status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body(&ctx).contains("bad.com.toml"));
    }

    #[test]
    fn test_file_router_with_named_handle() {
        let f = Fixture::new();
        f.write(
            "vhost/a.com.toml",
            "[[route]]\npath = \"/\"\nchain = [\"hello\"]\n",
        );
        f.write("handle/hello.toml", "code = 200\nbody = \"hello ${host}\"\n");

        let ctx = f.request("a.com:8080", "/");
        assert_eq!(ctx.response().status, StatusCode::OK);
        assert_eq!(body(&ctx), "hello a.com:8080");
        assert_eq!(f.server.routers().len(), 1);
        assert_eq!(f.server.handles().len(), 1);
    }

    #[test]
    fn test_sync_picks_up_changes() {
        let f = Fixture::new();
        f.write(
            "vhost/a.com.toml",
            "[[route]]\npath = \"/\"\nchain = [\"hello\"]\n",
        );
        let handle = f.write("handle/hello.toml", "code = 200\nbody = \"v1\"\n");
        assert_eq!(body(&f.request("a.com", "/")), "v1");

        touch(&handle, "code = 200\nbody = \"v2\"\n", 10);
        let (routers, handles) = f.server.sync_once();
        assert_eq!(routers.unchanged, 1);
        assert_eq!(handles.recompiled, 1);
        assert_eq!(body(&f.request("a.com", "/")), "v2");

        touch(&handle, "code = \"broken\"\n", 20);
        let (_, handles) = f.server.sync_once();
        assert_eq!(handles.failed, 1);
        assert_eq!(body(&f.request("a.com", "/")), "v2");

        std::fs::remove_file(&handle).unwrap();
        let (_, handles) = f.server.sync_once();
        assert_eq!(handles.evicted, 1);
        assert_eq!(
            f.request("a.com", "/").response().status,
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_vhost_takes_precedence() {
        let f = Fixture::new();
        f.write(
            "vhost/a.com.toml",
            "[[route]]\npath = \"/\"\nchain = [{ code = 200, body = \"file\" }]\n",
        );
        let router = Router::builder("programmatic")
            .get("/", HandleChain::new(vec![Handle::text("vhost").into()]))
            .unwrap()
            .build();
        f.server.insert("A.com", router);

        assert_eq!(body(&f.request("a.com", "/")), "vhost");
        assert_eq!(f.server.evict("a.com"), 1);
        assert_eq!(body(&f.request("a.com", "/")), "file");
    }

    #[test]
    fn test_fallback_router() {
        let f = Fixture::new();
        let fallback = Router::builder("fallback")
            .any("/{*rest}", HandleChain::new(vec![Handle::text("fallback ${param_rest}").into()]))
            .unwrap()
            .build();
        f.server.set_fallback(Some(Arc::new(fallback)));
        assert_eq!(body(&f.request("none.com", "/x/y")), "fallback x/y");
    }

    #[test]
    fn test_variables_router_then_server() {
        let dir = tempfile::tempdir().unwrap();
        let server = Server::new(
            dir.path().to_string_lossy(),
            dir.path().to_string_lossy(),
        )
        .with_access_format(None)
        .with_variable("env", "prod")
        .with_variable("who", "$remote_addr");

        let router = Router::builder("r")
            .variable("env", "staging")
            .variable("tier", "gold")
            .get(
                "/",
                HandleChain::new(vec![Handle::text("${env} ${tier} ${who}").into()]),
            )
            .unwrap()
            .build();
        server.insert("v.com", router);

        let mut ctx = context("GET", "/", &[("host", "v.com")]);
        server.handle(&mut ctx);
        assert_eq!(body(&ctx), "prod gold 10.0.0.7");
    }

    #[test]
    fn test_region_enrichment() {
        let dir = tempfile::tempdir().unwrap();
        let geo = StaticGeo::new().with(
            "1.2.3.4".parse().unwrap(),
            GeoInfo {
                city: "Lyon".into(),
                ..Default::default()
            },
        );
        let server = Server::new(
            dir.path().to_string_lossy(),
            dir.path().to_string_lossy(),
        )
        .with_access_format(None)
        .with_region("http_x_real_ip")
        .with_geo(Arc::new(geo));

        let router = Router::builder("r")
            .get(
                "/",
                HandleChain::new(vec![Handle::text("${addr} ${region_city}").into()]),
            )
            .unwrap()
            .build();
        server.insert("g.com", router);

        let mut ctx = context("GET", "/", &[("host", "g.com"), ("x-real-ip", "1.2.3.4")]);
        server.handle(&mut ctx);
        assert_eq!(body(&ctx), "1.2.3.4 Lyon");

        let mut ctx = context("GET", "/", &[("host", "g.com"), ("x-real-ip", "9.9.9.9")]);
        server.handle(&mut ctx);
        assert_eq!(body(&ctx), "9.9.9.9 ${region_city}");

        let mut ctx = context("GET", "/", &[("host", "g.com"), ("x-real-ip", "garbage")]);
        server.handle(&mut ctx);
        assert_eq!(body(&ctx), "10.0.0.7 ${region_city}");
    }

    #[test]
    fn test_router_access_log_override() {
        let f = Fixture::new();
        let own = Arc::new(MemorySink::default());
        let quiet = Router::builder("quiet")
            .access_log(AccessLog::Off)
            .get("/", HandleChain::new(vec![Handle::text("q").into()]))
            .unwrap()
            .build();
        let loud = Router::builder("loud")
            .access_log(AccessLog::Format {
                format: AccessFormat::Line(Template::compile("loud ${uri}")),
                sink: Some(own.clone()),
            })
            .get("/", HandleChain::new(vec![Handle::text("l").into()]))
            .unwrap()
            .build();
        f.server.insert("quiet.com", quiet);
        f.server.insert("loud.com", loud);

        f.request("quiet.com", "/");
        f.request("loud.com", "/");
        assert!(f.sink.lines.lock().is_empty());
        assert_eq!(own.lines.lock().as_slice(), ["loud /"]);
    }

    #[test]
    fn test_shutdown_evicts_and_closes() {
        let f = Fixture::new();
        f.write(
            "vhost/a.com.toml",
            "[[route]]\npath = \"/\"\nchain = [\"hello\"]\n",
        );
        f.write("handle/hello.toml", "code = 200\nbody = \"x\"\n");
        f.request("a.com", "/");
        assert_eq!(f.server.routers().len(), 1);

        f.server.shutdown();
        assert!(f.server.routers().is_empty());
        assert!(f.server.handles().is_empty());
    }

    #[test]
    fn test_from_config_registers_vhosts() {
        let dir = tempfile::tempdir().unwrap();
        let router_file = dir.path().join("admin.toml");
        std::fs::write(
            &router_file,
            "[[route]]\npath = \"/\"\nchain = [{ code = 200, body = \"admin\" }]\n",
        )
        .unwrap();
        let toml = format!(
            "[access_log]\nformat = \"off\"\n\n[vhosts.\"admin.local\"]\nrouter = {:?}\n",
            router_file.to_string_lossy()
        );
        let config: Config = toml::from_str(&toml).unwrap();
        let server = Server::from_config(&config).unwrap();

        let mut ctx = context("GET", "/", &[("host", "admin.local")]);
        server.handle(&mut ctx);
        assert_eq!(body(&ctx), "admin");
        assert_eq!(server.vhosts().hosts(), ["admin.local"]);
    }

    #[tokio::test]
    async fn test_sync_task_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let server = Arc::new(Server::new(
            dir.path().to_string_lossy(),
            dir.path().to_string_lossy(),
        ));
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(SyncTask::new(server, Duration::from_millis(10), rx).run());

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("sync task should stop")
            .unwrap();
    }
}
