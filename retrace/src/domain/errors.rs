//! Structured error types for retrace
//!
//! Using thiserror for automatic Display implementation and error chaining.
//!
//! Only initialisation (`Scheduler::new`) and `emit` return errors. Failures
//! at schedule points are never reported through a return value — the loop
//! calls the scheduler on hot paths — so invariant violations panic instead.

use std::path::PathBuf;

use retrace_common::{ThreadRole, ThreadSlot};
use thiserror::Error;

use super::types::Mode;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("the {backend} backend does not support {mode} mode")]
    UnsupportedMode { backend: &'static str, mode: Mode },

    #[error("schedule file {path}: {source}")]
    Schedule { path: PathBuf, source: ScheduleFileError },

    #[error("a looper thread is already registered ({0})")]
    LooperTaken(ThreadSlot),

    #[error("thread is already registered as {0}")]
    ThreadAlreadyRegistered(ThreadRole),

    #[error(transparent)]
    Export(#[from] ExportError),
}

#[derive(Error, Debug)]
pub enum ScheduleFileError {
    #[error("line {line}: unknown record tag `{tag}`")]
    UnknownTag { line: usize, tag: String },

    #[error("line {line}: malformed record: {reason}")]
    Malformed { line: usize, reason: String },

    #[error("line {line}: bad tree path `{path}`")]
    BadPath { line: usize, path: String },

    #[error("line {line}: node `{path}` appears before its parent")]
    OrphanNode { line: usize, path: String },

    #[error("line {line}: duplicate node `{path}`")]
    DuplicateNode { line: usize, path: String },

    #[error("line {line}: exec record for unregistered node `{path}`")]
    ExecUnknownNode { line: usize, path: String },

    #[error("line {line}: {source}")]
    Json { line: usize, source: serde_json::Error },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("failed to replace {path}: {source}")]
    Replace { path: PathBuf, source: std::io::Error },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
