//! Static file routes
//!
//! A [`StaticFiles`] serves files below a root directory. The file is named
//! by the last parameter the route captured (`/assets/{*file}`), or by the
//! request path when the route has none. Directories answer with their
//! `index.html`.

use crate::context::RequestContext;
use crate::error::DispatchError;
use crate::handle::Slot;
use hyper::StatusCode;
use std::fmt;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Index file served for a directory
pub const INDEX_NAMES: &[&str] = &["index.html"];

type Rewrite = Arc<dyn Fn(&RequestContext) -> Option<String> + Send + Sync>;

#[derive(Clone)]
pub struct StaticFiles {
    root: PathBuf,
    rewrite: Option<Rewrite>,
}

impl fmt::Debug for StaticFiles {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticFiles")
            .field("root", &self.root)
            .field("rewrite", &self.rewrite.is_some())
            .finish()
    }
}

impl StaticFiles {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            rewrite: None,
        }
    }

    /// Hook mapping a request to the file path to serve; `None` keeps the default
    pub fn with_rewrite<F>(mut self, f: F) -> Self
    where
        F: Fn(&RequestContext) -> Option<String> + Send + Sync + 'static,
    {
        self.rewrite = Some(Arc::new(f));
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Chain slot serving from this root
    pub fn into_slot(self) -> Slot {
        Slot::Callback(Arc::new(move |ctx: &mut RequestContext| self.serve(ctx)))
    }

    fn requested(&self, ctx: &RequestContext) -> String {
        if let Some(path) = self.rewrite.as_ref().and_then(|f| f(ctx)) {
            return path;
        }
        match ctx.enrichment().params.last() {
            Some((_, value)) => value.clone(),
            None => ctx.path().to_string(),
        }
    }

    /// Write the requested file to the response and stop the chain
    pub fn serve(&self, ctx: &mut RequestContext) -> Result<(), DispatchError> {
        let requested = self.requested(ctx);
        let Some(relative) = sanitize_path(&requested) else {
            debug!(path = %requested, "Rejected static file path");
            ctx.not_found();
            ctx.eof();
            return Ok(());
        };

        let mut full = self.root.join(relative);
        if full.is_dir() {
            match INDEX_NAMES.iter().map(|name| full.join(name)).find(|p| p.is_file()) {
                Some(index) => full = index,
                None => {
                    ctx.not_found();
                    ctx.eof();
                    return Ok(());
                }
            }
        }

        match std::fs::read(&full) {
            Ok(content) => {
                let mime = mime_guess::from_path(&full).first_or_octet_stream();
                ctx.set_header("content-type", mime.as_ref());
                ctx.set_status(StatusCode::OK);
                ctx.say(content);
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => ctx.not_found(),
            Err(e) => {
                return Err(DispatchError::Callback(format!(
                    "{}: {}",
                    full.display(),
                    e
                )))
            }
        }
        ctx.eof();
        Ok(())
    }
}

/// Relative path below the root, or `None` if it would escape it
fn sanitize_path(path: &str) -> Option<PathBuf> {
    let decoded = urlencoding::decode(path.trim_start_matches('/')).ok()?;
    let path = Path::new(decoded.as_ref());
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::get;

    fn site() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("docs")).unwrap();
        std::fs::write(dir.path().join("index.html"), "<h1>home</h1>").unwrap();
        std::fs::write(dir.path().join("app.css"), "body{}").unwrap();
        std::fs::write(dir.path().join("docs").join("a b.txt"), "spaced").unwrap();
        dir
    }

    fn serve(files: &StaticFiles, uri: &str) -> RequestContext {
        let mut ctx = get(uri);
        files.serve(&mut ctx).unwrap();
        ctx
    }

    #[test]
    fn test_sanitize_path() {
        assert_eq!(sanitize_path("/a/./b.txt"), Some(PathBuf::from("a/b.txt")));
        assert_eq!(sanitize_path("/"), Some(PathBuf::new()));
        assert!(sanitize_path("/../etc/passwd").is_none());
        assert!(sanitize_path("/a/%2e%2e/%2e%2e/etc").is_none());
    }

    #[test]
    fn test_serves_files_with_content_type() {
        let dir = site();
        let files = StaticFiles::new(dir.path());

        let ctx = serve(&files, "/app.css");
        assert_eq!(ctx.response().status, StatusCode::OK);
        assert_eq!(ctx.response().body, b"body{}");
        assert_eq!(ctx.response().headers.get("content-type").unwrap(), "text/css");
        assert!(ctx.is_terminated());

        let ctx = serve(&files, "/docs/a%20b.txt");
        assert_eq!(ctx.response().body, b"spaced");
    }

    #[test]
    fn test_directory_serves_index() {
        let dir = site();
        let files = StaticFiles::new(dir.path());

        let ctx = serve(&files, "/");
        assert_eq!(ctx.response().body, b"<h1>home</h1>");
        assert_eq!(ctx.response().headers.get("content-type").unwrap(), "text/html");

        let ctx = serve(&files, "/docs/");
        assert_eq!(ctx.response().status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_missing_and_escaping_paths_are_not_found() {
        let dir = site();
        let files = StaticFiles::new(dir.path().join("docs"));

        assert_eq!(serve(&files, "/nope.txt").response().status, StatusCode::NOT_FOUND);
        assert_eq!(serve(&files, "/../app.css").response().status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_captured_param_and_rewrite() {
        let dir = site();
        let files = StaticFiles::new(dir.path());

        let mut ctx = get("/static/app.css");
        ctx.enrichment_mut().params = vec![("file".to_string(), "app.css".to_string())];
        files.serve(&mut ctx).unwrap();
        assert_eq!(ctx.response().body, b"body{}");

        let files = StaticFiles::new(dir.path()).with_rewrite(|ctx| {
            ctx.path().strip_prefix("/v1").map(|p| p.to_string())
        });
        assert_eq!(serve(&files, "/v1/app.css").response().body, b"body{}");
        assert_eq!(serve(&files, "/index.html").response().body, b"<h1>home</h1>");
    }
}
