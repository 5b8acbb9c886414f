//! Error taxonomy for resource compilation and request dispatch
//!
//! None of these errors terminate the process. They either shape the
//! response of the request that hit them or are logged and dropped.

use hyper::StatusCode;
use std::io;

/// Body written for the NotFound response
pub const NOT_FOUND_BODY: &str = "not found";

/// Failure of the external compile capability
#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    /// The backing file could not be read (a missing file is the NotFound trigger)
    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    /// The declaration could not be parsed
    #[error("{path}: {message}")]
    Parse { path: String, message: String },
    /// The declaration parsed but describes an invalid resource
    #[error("{0}")]
    Invalid(String),
    /// A route could not be registered in the path table
    #[error("route {method} {path}: {message}")]
    Route {
        method: String,
        path: String,
        message: String,
    },
}

impl CompileError {
    /// True when the failure is caused by the backing file not existing
    pub fn is_not_found(&self) -> bool {
        matches!(self, CompileError::Io { source, .. } if source.kind() == io::ErrorKind::NotFound)
    }
}

/// Failure while executing a chain slot
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// A handle matched but has neither a status code nor a body producer
    #[error("empty handle object")]
    EmptyHandle,
    /// An inline callback, body producer or interceptor failed
    #[error("{0}")]
    Callback(String),
    /// A named slot could not be resolved to a handle
    #[error(transparent)]
    Lookup(#[from] CompileError),
}

/// Failure of a resource's release step
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct CloseError(pub String);

/// Failure of the geo lookup collaborator
#[derive(Debug, thiserror::Error)]
#[error("geo lookup for {ip}: {message}")]
pub struct GeoError {
    pub ip: String,
    pub message: String,
}

/// Failure of an output sink
#[derive(Debug, thiserror::Error)]
#[error("sink {name}: {source}")]
pub struct SinkError {
    pub name: String,
    #[source]
    pub source: io::Error,
}

/// Top level error surfaced by router selection
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No router or handle resolves for the key
    #[error("not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Compile(CompileError),
}

impl From<CompileError> for Error {
    fn from(err: CompileError) -> Self {
        if err.is_not_found() {
            let key = match &err {
                CompileError::Io { path, .. } => path.clone(),
                _ => String::new(),
            };
            Error::NotFound(key)
        } else {
            Error::Compile(err)
        }
    }
}

impl Error {
    /// HTTP status used when this error becomes the response
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Compile(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
