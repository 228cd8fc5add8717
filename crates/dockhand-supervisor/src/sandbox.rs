//! Supplies sandbox environment variables for a workload.
//!
//! The platform convention stores one variable per regular file: the file
//! name is the variable name and the file contents are the value, with one
//! trailing newline trimmed. Subdirectories and their contents are ignored.

use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

const SANDBOX_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::sandbox");

/// Source of sandbox environment variables layered over the inherited
/// environment when a workload launches.
pub trait SandboxEnv: Send + Sync {
    /// Collects the variables the sandbox contributes.
    ///
    /// Pairs are sorted by name so launches log and apply deterministically.
    fn variables(&self) -> Result<Vec<(OsString, OsString)>, SandboxError>;
}

/// Sandbox source for invocations without a configured environment
/// directory. Contributes nothing.
#[derive(Debug, Default)]
pub struct NullSandboxEnv;

impl NullSandboxEnv {
    /// Builds the empty sandbox source.
    pub fn new() -> Self {
        Self
    }
}

impl SandboxEnv for NullSandboxEnv {
    fn variables(&self) -> Result<Vec<(OsString, OsString)>, SandboxError> {
        Ok(Vec::new())
    }
}

/// Sandbox source reading variables from an environment directory.
#[derive(Debug)]
pub struct DirSandboxEnv {
    directory: PathBuf,
}

impl DirSandboxEnv {
    /// Builds a source reading from `directory`.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    /// Directory the variables are read from.
    pub fn directory(&self) -> &Path {
        self.directory.as_path()
    }
}

impl SandboxEnv for DirSandboxEnv {
    fn variables(&self) -> Result<Vec<(OsString, OsString)>, SandboxError> {
        let entries = fs::read_dir(&self.directory).map_err(|source| SandboxError::Directory {
            path: self.directory.clone(),
            source,
        })?;

        let mut variables = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| SandboxError::Directory {
                path: self.directory.clone(),
                source,
            })?;
            let file_type = entry.file_type().map_err(|source| SandboxError::Variable {
                path: entry.path(),
                source,
            })?;
            if !file_type.is_file() {
                continue;
            }
            let mut value = fs::read(entry.path()).map_err(|source| SandboxError::Variable {
                path: entry.path(),
                source,
            })?;
            if value.last() == Some(&b'\n') {
                value.pop();
            }
            variables.push((entry.file_name(), value_from_bytes(value)));
        }
        variables.sort();

        debug!(
            target: SANDBOX_TARGET,
            directory = %self.directory.display(),
            count = variables.len(),
            "sandbox environment collected"
        );
        Ok(variables)
    }
}

#[cfg(unix)]
fn value_from_bytes(bytes: Vec<u8>) -> OsString {
    use std::os::unix::ffi::OsStringExt;
    OsString::from_vec(bytes)
}

#[cfg(not(unix))]
fn value_from_bytes(bytes: Vec<u8>) -> OsString {
    String::from_utf8_lossy(&bytes).into_owned().into()
}

/// Errors raised while collecting the sandbox environment.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The environment directory could not be read.
    #[error("failed to read environment directory '{path}': {source}")]
    Directory {
        /// Directory that could not be read.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// One variable file could not be read.
    #[error("failed to read environment variable file '{path}': {source}")]
    Variable {
        /// Variable file that could not be read.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
}
