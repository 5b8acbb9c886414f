use crate::error::SinkError;
use crate::sink::{FileSink, OutputSink};
use crate::template::{AccessFormat, FieldList, Template, DEFAULT_ACCESS_FORMAT};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Global configuration for the server
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Server-wide access log
    #[serde(default)]
    pub access_log: AccessLogConfig,

    /// User variables attached to every request
    /// A value starting with `$` names another variable resolved per request
    #[serde(default)]
    pub variables: BTreeMap<String, String>,

    /// Programmatically registered virtual hosts
    #[serde(default)]
    pub vhosts: HashMap<String, VhostConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Server name used in logs (default: hotgate)
    #[serde(default = "default_name")]
    pub name: String,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// HTTP port (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Directory of router declarations, one `<host>.toml` per host
    #[serde(default = "default_router_dir")]
    pub router_dir: String,

    /// Directory of handler declarations referenced by name from chains
    #[serde(default = "default_handler_dir")]
    pub handler_dir: String,

    /// Interval between cache sync sweeps in milliseconds (default: 1000)
    #[serde(default = "default_sync_interval_ms")]
    pub sync_interval_ms: u64,

    /// Request variable holding the client address used for geo lookup
    /// Empty disables geo enrichment unless a router sets its own
    #[serde(default)]
    pub region: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            bind: default_bind_address(),
            port: default_listen_port(),
            router_dir: default_router_dir(),
            handler_dir: default_handler_dir(),
            sync_interval_ms: default_sync_interval_ms(),
            region: String::new(),
        }
    }
}

impl ServerConfig {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

/// Encoding of access-log lines
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Template rendered as plain text
    #[default]
    Line,
    /// Template segments rendered as a JSON array
    Json,
    /// Named fields rendered as a JSON object
    Dict,
    /// No access log
    Off,
}

/// Access-log settings, shared by the server and router declarations
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct AccessLogConfig {
    #[serde(default)]
    pub format: LogFormat,

    /// Placeholder template for `line` and `json`
    #[serde(default = "default_access_template")]
    pub template: String,

    /// Variable names for `dict`
    #[serde(default)]
    pub fields: Vec<String>,

    /// File the lines are appended to; without it lines go to tracing
    pub path: Option<String>,
}

impl Default for AccessLogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            template: default_access_template(),
            fields: Vec::new(),
            path: None,
        }
    }
}

impl AccessLogConfig {
    /// Compiled line encoder, `None` when logging is off
    pub fn access_format(&self) -> Option<AccessFormat> {
        match self.format {
            LogFormat::Line => Some(AccessFormat::Line(Template::compile(&self.template))),
            LogFormat::Json => Some(AccessFormat::Json(Template::compile(&self.template))),
            LogFormat::Dict => Some(AccessFormat::Dict(FieldList::new(self.fields.iter().cloned()))),
            LogFormat::Off => None,
        }
    }

    /// Open the configured file sink, if any
    pub fn open_sink(&self) -> Result<Option<Arc<dyn OutputSink>>, SinkError> {
        match &self.path {
            Some(path) => Ok(Some(Arc::new(FileSink::open(path)?))),
            None => Ok(None),
        }
    }

    /// Problems with this section, prefixed with `scope`
    pub fn problems(&self, scope: &str) -> Vec<String> {
        let mut errors = Vec::new();
        if self.format == LogFormat::Dict && self.fields.is_empty() {
            errors.push(format!("{}: dict format requires fields", scope));
        }
        if matches!(self.format, LogFormat::Line | LogFormat::Json) && self.template.is_empty() {
            errors.push(format!("{}: template must not be empty", scope));
        }
        errors
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct VhostConfig {
    /// Path of the router declaration serving this host
    pub router: String,
}

fn default_name() -> String {
    "hotgate".to_string()
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    8080
}

fn default_router_dir() -> String {
    "www/vhost".to_string()
}

fn default_handler_dir() -> String {
    "www/handle".to_string()
}

fn default_sync_interval_ms() -> u64 {
    1000
}

fn default_access_template() -> String {
    DEFAULT_ACCESS_FORMAT.to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.server.sync_interval_ms == 0 {
            errors.push("server.sync_interval_ms must be greater than 0".to_string());
        }
        if self.server.router_dir.is_empty() {
            errors.push("server.router_dir must not be empty".to_string());
        }
        if self.server.handler_dir.is_empty() {
            errors.push("server.handler_dir must not be empty".to_string());
        }

        errors.extend(self.access_log.problems("access_log"));

        for (name, value) in &self.variables {
            if value == "$" {
                errors.push(format!("variables.{}: `$` must be followed by a variable name", name));
            }
        }

        for (host, vhost) in &self.vhosts {
            if host.is_empty() {
                errors.push("vhosts: host name must not be empty".to_string());
            }
            if vhost.router.is_empty() {
                errors.push(format!("vhosts.{}: router must name a declaration file", host));
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
