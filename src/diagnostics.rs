//! Error taxonomy and warning bookkeeping (spec §7).
//!
//! Fatal input errors get a named `FatalError` variant and abort the
//! enclosing operation (one master's analysis, or the whole run). Recoverable
//! inconsistencies and status-only notices go through [`warn`], which logs
//! and bumps a shared counter so the driver can report how many warnings
//! fired.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Fatal errors abort the operation that raised them. They are never
/// recovered from in place; see [`Warnings`] for the recoverable class.
#[derive(Debug, thiserror::Error)]
pub enum FatalError {
    #[error("cannot open master {0}: {1}")]
    CannotOpen(PathBuf, std::io::Error),

    #[error("cannot mmap master {0}: {1}")]
    CannotMmap(PathBuf, std::io::Error),

    #[error("cannot determine current directory: {0}")]
    CannotGetCwd(std::io::Error),

    #[error("{master}: malformed RCS master: {reason}")]
    MalformedMaster { master: PathBuf, reason: String },

    #[error("{master}: delta for {revision} violates edit-script ordering: {reason}")]
    DeltaOrderViolation { master: PathBuf, revision: String, reason: String },

    #[error("revision number too long (> {max} components)")]
    RevisionTooLong { max: usize },

    #[error("{master}: duplicate delta number {revision}")]
    DuplicateDelta { master: PathBuf, revision: String },

    #[error("branch cycle detected while sorting gitspace branch heads")]
    BranchCycle,

    #[error("{0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),
}

/// Process-wide (but explicitly owned, see [`crate::pipeline::Pipeline`])
/// warning counter, matching the original's global `warncount`.
#[derive(Debug, Clone, Default)]
pub struct Warnings {
    count: Arc<AtomicUsize>,
}

impl Warnings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a recoverable inconsistency or status-only notice fired.
    /// The message itself should already have been logged by the caller via
    /// [`log::warn!`]; this only updates the counter.
    pub fn bump(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }
}

/// Log a recoverable-inconsistency warning and bump the shared counter.
///
/// `announce()` in the original combines both effects; this macro keeps the
/// call sites equally terse.
#[macro_export]
macro_rules! announce {
    ($warnings:expr, $($arg:tt)*) => {{
        log::warn!($($arg)*);
        $warnings.bump();
    }};
}
