//! File-backed resource declarations
//!
//! Handlers and routers are declared in TOML files. A handler lives at
//! `<handler_dir>/<name>.toml`:
//!
//! ```toml
//! code = 200
//! body = "hello ${remote_addr}"
//! eof = true
//! filter = ["method == GET", "uri ^= /api"]
//!
//! [header]
//! content-type = "text/plain"
//! ```
//!
//! A router lives at `<router_dir>/<host>.toml`:
//!
//! ```toml
//! region = "http_x_real_ip"
//!
//! [variables]
//! tier = "gold"
//!
//! [[route]]
//! method = "GET"
//! path = "/users/{id}"
//! chain = ["auth", { body = "user ${param_id}", eof = true }]
//!
//! [[route]]
//! path = "/assets/{*file}"
//! files = "/var/www/assets"
//! ```

use crate::cache::{file_mod_time, Compile};
use crate::config::AccessLogConfig;
use crate::error::CompileError;
use crate::files::StaticFiles;
use crate::filter::Condition;
use crate::handle::{Body, Handle, HandleChain, Slot};
use crate::router::{AccessLog, Router};
use crate::template::Template;
use hyper::StatusCode;
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::info;

/// Extension of declaration files
pub const DECL_EXT: &str = "toml";

/// Max length of a host name used as a file name
const MAX_HOSTNAME_LEN: usize = 253;

/// Cache key of the handler `name` declared under `dir`
pub fn handle_key(dir: &str, name: &str) -> String {
    format!("{}/{}.{}", dir.trim_end_matches('/'), name, DECL_EXT)
}

/// Cache key of the router serving `host`, or `None` if the host cannot
/// name a file
pub fn router_key(dir: &str, host: &str) -> Option<String> {
    let host = host.split(':').next()?;
    if host.is_empty() || host.len() > MAX_HOSTNAME_LEN {
        return None;
    }
    if !host.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.') {
        return None;
    }
    if host.starts_with('.') || host.contains("..") {
        return None;
    }
    Some(format!(
        "{}/{}.{}",
        dir.trim_end_matches('/'),
        host.to_lowercase(),
        DECL_EXT
    ))
}

#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
pub enum FilterDecl {
    One(String),
    All(Vec<String>),
}

/// Declaration of a single handle
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct HandleDecl {
    pub name: Option<String>,
    pub code: Option<u16>,
    #[serde(default)]
    pub header: BTreeMap<String, String>,
    pub body: Option<String>,
    #[serde(default)]
    pub eof: bool,
    pub filter: Option<FilterDecl>,
    /// Location to redirect to; implies eof and code 302 unless `code` is set
    pub redirect: Option<String>,
}

impl HandleDecl {
    pub fn into_handle(self, name: &str, mtime: i64) -> Result<Handle, CompileError> {
        let mut handle = Handle::new(self.name.unwrap_or_else(|| name.to_string()))
            .with_mod_time(mtime)
            .with_eof(self.eof);

        let code = match (self.code, &self.redirect) {
            (Some(code), _) => Some(code),
            (None, Some(_)) => Some(StatusCode::FOUND.as_u16()),
            (None, None) => None,
        };
        if let Some(code) = code {
            let code = StatusCode::from_u16(code)
                .map_err(|_| CompileError::Invalid(format!("{}: invalid status code {}", name, code)))?;
            handle = handle.with_code(code);
        }

        for (key, value) in &self.header {
            handle = handle.with_header(key, value);
        }

        if let Some(location) = &self.redirect {
            handle = handle.with_header("location", location).with_eof(true);
        }

        if let Some(body) = &self.body {
            handle = handle.with_body(Body::Template(Template::compile(body)));
        }

        if let Some(filter) = self.filter {
            let condition = match filter {
                FilterDecl::One(clause) => Condition::parse([clause])?,
                FilterDecl::All(clauses) => Condition::parse(clauses)?,
            };
            handle = handle.with_filter(condition);
        }

        Ok(handle)
    }
}

/// One chain element: a handler name or an inline declaration
#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
pub enum SlotDecl {
    Named(String),
    Inline(HandleDecl),
}

fn default_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct RouteDecl {
    #[serde(default = "default_method")]
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub chain: Vec<SlotDecl>,
    /// Root directory served after the chain's own slots
    pub files: Option<String>,
}

/// Declaration of a router for one host
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct RouterDecl {
    pub region: Option<String>,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    pub access_log: Option<AccessLogConfig>,
    #[serde(default, rename = "route")]
    pub routes: Vec<RouteDecl>,
    pub not_found: Option<Vec<SlotDecl>>,
}

fn build_slots(owner: &str, slots: Vec<SlotDecl>, mtime: i64) -> Result<Vec<Slot>, CompileError> {
    slots
        .into_iter()
        .map(|slot| match slot {
            SlotDecl::Named(name) => Ok(Slot::Named(name)),
            SlotDecl::Inline(decl) => decl.into_handle(owner, mtime).map(Slot::from),
        })
        .collect()
}

impl RouterDecl {
    pub fn into_router(self, name: &str, handler_dir: &str, mtime: i64) -> Result<Router, CompileError> {
        let mut builder = Router::builder(name)
            .handler_dir(handler_dir)
            .mod_time(mtime);

        if let Some(region) = self.region {
            builder = builder.region(region);
        }
        for (key, value) in self.variables {
            builder = builder.variable(key, value);
        }

        if let Some(access) = self.access_log {
            let problems = access.problems(&format!("{}: access_log", name));
            if !problems.is_empty() {
                return Err(CompileError::Invalid(problems.join("; ")));
            }
            let log = match access.access_format() {
                None => AccessLog::Off,
                Some(format) => AccessLog::Format {
                    format,
                    sink: access
                        .open_sink()
                        .map_err(|e| CompileError::Invalid(format!("{}: {}", name, e)))?,
                },
            };
            builder = builder.access_log(log);
        }

        for route in self.routes {
            let mut slots = build_slots(name, route.chain, mtime)?;
            if let Some(root) = route.files {
                slots.push(StaticFiles::new(root).into_slot());
            }
            builder = builder.route(&route.method, &route.path, HandleChain::new(slots))?;
        }

        if let Some(slots) = self.not_found {
            builder = builder.not_found(HandleChain::new(build_slots(name, slots, mtime)?));
        }

        Ok(builder.build())
    }
}

fn read_decl<T>(path: &str) -> Result<(T, i64), CompileError>
where
    T: for<'de> Deserialize<'de>,
{
    let io_err = |source| CompileError::Io {
        path: path.to_string(),
        source,
    };
    let mtime = file_mod_time(path).map_err(io_err)?;
    let content = std::fs::read_to_string(path).map_err(io_err)?;
    let decl = toml::from_str(&content).map_err(|e| CompileError::Parse {
        path: path.to_string(),
        message: e.to_string(),
    })?;
    Ok((decl, mtime))
}

/// Compiles handler and router declaration files
#[derive(Debug, Clone, Copy, Default)]
pub struct FileCompiler;

impl Compile<Handle> for FileCompiler {
    fn compile(&self, key: &str, _meta: &()) -> Result<Handle, CompileError> {
        let (decl, mtime): (HandleDecl, i64) = read_decl(key)?;
        let handle = decl.into_handle(key, mtime)?;
        info!(key = %key, "Handle compiled");
        Ok(handle)
    }
}

impl Compile<Router> for FileCompiler {
    fn compile(&self, key: &str, handler_dir: &String) -> Result<Router, CompileError> {
        let (decl, mtime): (RouterDecl, i64) = read_decl(key)?;
        let router = decl.into_router(key, handler_dir, mtime)?;
        info!(key = %key, routes = router.route_count(), "Router compiled");
        Ok(router)
    }
}
