//! Driver context bundling the shared tables every phase touches (spec
//! §5, §9's "explicit context object instead of process globals").
//!
//! The original's `analyze_masters` hands master paths to a small pool of
//! pthread workers. Every per-master DAG here is built from `Rc`-linked
//! nodes (see [`crate::model::Node`], [`crate::model::BranchHeadData`]),
//! which intentionally cannot cross a thread boundary — so this port
//! analyses masters on one thread, in file order, rather than fanning the
//! read+analyse phase out across a worker pool (see DESIGN.md).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::atom::{Atom, AtomTable};
use crate::diagnostics::{FatalError, Warnings};
use crate::emit::BlobStore;
use crate::merge::{self, GitBranch};
use crate::model::CvsMaster;
use crate::revcvs::{self, PerMasterDag};
use crate::tags::TagTable;

/// Shared, explicitly-owned state for one run (spec §5's mutex-guarded
/// process tables, minus the process-wide `static`s).
pub struct Pipeline {
    pub atoms: AtomTable,
    pub tags: TagTable,
    pub warnings: Warnings,
    pub window: u32,
    pub blobs: BlobStore,
    /// Leading path components to drop from each master path before using
    /// the remainder as its export directory (spec §10.2's `--strip`).
    pub strip: usize,
    next_serial: AtomicU32,
}

impl Pipeline {
    /// `blob_root` is where materialised revision text is staged before
    /// being streamed (spec §4.5.6); the caller picks and cleans up a
    /// scratch directory the way the original's driver does for its
    /// `mkdtemp`-based blob cache.
    pub fn new(window: u32, blob_root: PathBuf) -> std::io::Result<Self> {
        Ok(Pipeline {
            atoms: AtomTable::new(),
            tags: TagTable::new(),
            warnings: Warnings::new(),
            window,
            blobs: BlobStore::new(blob_root)?,
            strip: 0,
            next_serial: AtomicU32::new(1),
        })
    }

    /// Read and analyse every master, producing one [`PerMasterDag`] each
    /// (spec §4.2-§4.4).
    pub fn analyze_masters(
        &self,
        paths: &[PathBuf],
    ) -> Result<Vec<(Arc<CvsMaster>, PerMasterDag)>, FatalError> {
        let mut out = Vec::with_capacity(paths.len());
        for path in paths {
            out.push(self.analyze_one(path)?);
        }
        Ok(out)
    }

    fn analyze_one(&self, path: &Path) -> Result<(Arc<CvsMaster>, PerMasterDag), FatalError> {
        let bytes = std::fs::read(path).map_err(|e| FatalError::CannotOpen(path.to_path_buf(), e))?;
        let dir = self.export_dir(path);
        let (master, _name) = crate::grammar::parse_master(path, &bytes, dir, &self.atoms, &self.warnings)?;
        let master = Arc::new(master);

        let mut nodehash = crate::nodehash::NodeHash::new();
        for v in &master.versions {
            nodehash.hash_version(v, &self.warnings);
        }
        for p in &master.patches {
            nodehash.hash_patch(p, &self.warnings);
        }
        for v in &master.versions {
            for b in &v.branches {
                nodehash.hash_branch(*b);
            }
        }

        let dag = revcvs::build_dag(&master, &mut nodehash, &self.atoms, &self.tags, &self.warnings);
        self.stage_blobs(&master, &bytes, &dag)?;
        Ok((master, dag))
    }

    /// Turn a master path's parent directories (after dropping
    /// [`Pipeline::strip`] leading components) into the [`crate::model::MasterDir`]
    /// every file under it shares.
    fn export_dir(&self, path: &Path) -> crate::model::MasterDir {
        let components: Vec<_> = path.parent().into_iter().flat_map(|p| p.iter()).collect();
        let mut dir = crate::model::master_dir_root(&self.atoms);
        for component in components.into_iter().skip(self.strip) {
            dir = crate::model::master_dir_child(&dir, self.atoms.intern(&component.to_string_lossy()));
        }
        dir
    }

    /// Materialise every revision's text once (spec §4.3) and stage it
    /// under a serial used later as the revision's fast-import blob mark
    /// (spec §4.5.6), skipping dead (deleted) revisions, which never
    /// become blobs.
    fn stage_blobs(&self, master: &CvsMaster, bytes: &[u8], dag: &PerMasterDag) -> Result<(), FatalError> {
        let texts = crate::generate::materialize_all(master, bytes)?;
        for head in &dag.heads {
            let mut cursor = head.commit.borrow().clone();
            while let Some(commit) = cursor {
                if !commit.dead && commit.serial.get() == 0 {
                    if let Some(text) = texts.get(&commit.number) {
                        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
                        self.blobs
                            .stage(serial, text)
                            .map_err(|e| FatalError::Io(master.master_name.as_str().into(), e))?;
                        commit.serial.set(serial);
                    }
                }
                cursor = commit.parent.borrow().clone();
            }
        }
        Ok(())
    }

    /// Merge every master's per-file DAG into one cross-master changeset
    /// history (spec §4.5).
    pub fn merge(
        &self,
        masters: Vec<(Arc<CvsMaster>, PerMasterDag)>,
    ) -> Result<HashMap<Atom, GitBranch>, FatalError> {
        let mut names: Vec<Atom> = Vec::new();
        for (_, dag) in &masters {
            for h in &dag.heads {
                if let Some(name) = h.name.borrow().clone() {
                    if !names.iter().any(|n| *n == name) {
                        names.push(name);
                    }
                }
            }
        }

        let sorted = merge::tsort_branch_names(names, &masters)?;
        let mut branches: HashMap<Atom, GitBranch> = HashMap::new();
        for name in &sorted {
            branches.insert(name.clone(), merge::new_git_branch(name.clone()));
        }

        for name in &sorted {
            let branch = branches.get(name).unwrap().clone();
            merge::set_parent_depth(&branch, &branches, &masters);

            let contributors: Vec<(Arc<CvsMaster>, crate::model::CvsCommit)> = masters
                .iter()
                .filter_map(|(m, dag)| {
                    dag.heads
                        .iter()
                        .find(|h| h.name.borrow().as_ref() == Some(name))
                        .and_then(|h| h.commit.borrow().clone())
                        .map(|c| (m.clone(), c))
                })
                .collect();
            if contributors.is_empty() {
                continue;
            }
            if let Some(head) = merge::merge_branch(name, contributors, self.window) {
                merge::set_tail(&head);
                *branch.commit.borrow_mut() = Some(head);
            }
        }

        merge::place_tags(&self.tags, &self.warnings);
        merge::validate(&branches, &self.warnings);
        Ok(branches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_master_list_merges_to_no_branches() {
        let root = std::env::temp_dir().join(format!("cvs-fast-export-pipeline-test-{}", std::process::id()));
        let pipeline = Pipeline::new(merge::DEFAULT_WINDOW, root.clone()).unwrap();
        let branches = pipeline.merge(Vec::new()).unwrap();
        assert!(branches.is_empty());
        std::fs::remove_dir_all(&root).ok();
    }
}
