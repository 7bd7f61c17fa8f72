// src/error.rs

//! Crate-wide error taxonomy
//!
//! One `Error` enum covers the transaction engine and the build sandbox.
//! External failure sources (I/O, SQLite, HTTP, syscalls, recipe parsing)
//! convert in via `#[from]`; domain failures carry enough context to be
//! reported without a backtrace.

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// A transaction action failed in a way isolated to one package
    #[error("action failed: {0}")]
    Action(String),

    /// An embedded scriptlet exited non-zero or could not be staged
    #[error("{phase} scriptlet failed: {message}")]
    Script { phase: String, message: String },

    /// An embedded scriptlet exceeded its execution window
    #[error("{phase} scriptlet timed out after {secs}s")]
    ScriptTimeout { phase: String, secs: u64 },

    /// The scriptlet interpreter is absent or not executable in the root
    #[error("interpreter {interpreter} not usable inside {root}")]
    MissingInterpreter { interpreter: String, root: PathBuf },

    #[error("build failed: {0}")]
    Build(String),

    /// Another operation holds the build root's exclusive lock
    #[error("build root {0} is locked by another operation")]
    BuildRootLocked(PathBuf),

    #[error("dependency resolution failed: {0}")]
    Dependency(String),

    #[error("cgroup {path}: {message}")]
    CGroup { path: PathBuf, message: String },

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("system call failed: {0}")]
    Sys(#[from] nix::errno::Errno),

    #[error("recipe error: {0}")]
    Recipe(#[from] toml::de::Error),
}
