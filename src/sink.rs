//! Output sinks for access-log lines
//!
//! Writes are fire and forget: a failing sink logs the error and the
//! request carries on.

use crate::error::SinkError;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{error, info};

pub trait OutputSink: Send + Sync {
    fn write(&self, line: &[u8]);
}

/// Appends newline-terminated lines to a file
pub struct FileSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileSink {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, SinkError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| SinkError {
                name: path.display().to_string(),
                source,
            })?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl OutputSink for FileSink {
    fn write(&self, line: &[u8]) {
        let mut file = self.file.lock();
        let result = file.write_all(line).and_then(|_| file.write_all(b"\n"));
        if let Err(e) = result {
            error!(path = %self.path.display(), error = %e, "Access log write failed");
        }
    }
}

/// Emits each line as a tracing event on the `hotgate::access` target
#[derive(Debug, Default)]
pub struct TracingSink;

impl OutputSink for TracingSink {
    fn write(&self, line: &[u8]) {
        info!(target: "hotgate::access", "{}", String::from_utf8_lossy(line));
    }
}
