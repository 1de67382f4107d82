//! Tag table (spec §4.4/§4.5.4), grounded on the original's `tags.c`.
//!
//! The original buckets tags by pointer-hashed name into chunked
//! 256-entry arrays to avoid realloc churn; a `HashMap<Atom, Vec<_>>`
//! gives the same "one entry per (tag, file)" accumulation with none of
//! that bookkeeping.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::atom::Atom;
use crate::diagnostics::Warnings;
use crate::model::{CvsCommit, CvsMaster, GitCommit};

struct TagEntry {
    commits: Vec<CvsCommit>,
    /// Master-name atom of the most recent file to record this tag,
    /// pointer-compared to detect a master tagging the same name twice.
    last_master: Option<Atom>,
    target: RefCell<Option<GitCommit>>,
}

/// Accumulates, for every symbolic tag name seen across all masters, the
/// list of per-file commits it was attached to. Resolved to a single
/// gitspace commit per tag once component E has built the changeset DAG.
#[derive(Default)]
pub struct TagTable {
    table: Mutex<HashMap<Atom, TagEntry>>,
}

impl TagTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.table.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every tag name currently known, for the §4.5.4 placement pass.
    pub fn names(&self) -> Vec<Atom> {
        self.table.lock().unwrap().keys().cloned().collect()
    }

    pub fn commits_for(&self, name: &Atom) -> Vec<CvsCommit> {
        self.table.lock().unwrap().get(name).map(|e| e.commits.clone()).unwrap_or_default()
    }

    pub fn set_target(&self, name: &Atom, commit: GitCommit) {
        if let Some(entry) = self.table.lock().unwrap().get(name) {
            *entry.target.borrow_mut() = Some(commit);
        }
    }

    pub fn target_for(&self, name: &Atom) -> Option<GitCommit> {
        self.table.lock().unwrap().get(name).and_then(|e| e.target.borrow().clone())
    }

    /// Every tag name resolved to land on `commit`, for the emitter's
    /// `reset refs/tags/<name>` interleaving (spec §4.5.6).
    pub fn names_targeting(&self, commit: &GitCommit) -> Vec<Atom> {
        let table = self.table.lock().unwrap();
        table
            .iter()
            .filter(|(_, e)| {
                e.target.borrow().as_ref().map(|t| std::sync::Arc::ptr_eq(t, commit)).unwrap_or(false)
            })
            .map(|(name, _)| name.clone())
            .collect()
    }
}

/// Record that `commit` (from `master`) carries symbolic name `name`.
pub fn tag_commit(
    tags: &TagTable,
    commit: &CvsCommit,
    name: Atom,
    master: &std::sync::Arc<CvsMaster>,
    warnings: &Warnings,
) {
    let mut table = tags.table.lock().unwrap();
    let entry = table.entry(name.clone()).or_insert_with(|| TagEntry {
        commits: Vec::new(),
        last_master: None,
        target: RefCell::new(None),
    });
    if entry.last_master.as_ref() == Some(&master.master_name) {
        crate::announce!(
            warnings,
            "{}: duplicate tag {} in same master",
            master.master_name.as_str(),
            name.as_str()
        );
    }
    entry.last_master = Some(master.master_name.clone());
    entry.commits.push(commit.clone());
}
