//! Hotgate - an HTTP server driven by hot-reloaded declaration files
//!
//! This library provides:
//! - A sorted, lock-guarded cache of compiled resources with a periodic
//!   sync sweep that recompiles changed files and evicts deleted ones
//! - Handles and ordered handle chains with conditional, terminal steps
//! - Per-host routers selected from a virtual host table or compiled from
//!   `<router_dir>/<host>.toml` on first use
//! - Static file routes served below a root directory
//! - Placeholder templates for response bodies and access-log lines
//! - A variable resolver over the per-request context

pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod files;
pub mod filter;
pub mod geo;
pub mod handle;
pub mod listener;
pub mod loader;
pub mod router;
pub mod server;
pub mod sink;
pub mod template;
pub mod vars;
pub mod vhost;

pub use error::{CloseError, CompileError, DispatchError, Error};
pub use server::{Server, SyncTask};
