//! Component E: cross-master merger (spec §4.5.1, §4.5.2, §4.5.4, §4.5.5),
//! grounded on `merge.c`. Per spec §9, `GitBranch`/`GitCommit` are a
//! distinct record kind from the per-master `BranchHead`/`CvsCommit`
//! (no struct punning): a clique of matching per-file commits across
//! masters becomes exactly one [`GitCommit`].
//!
//! The original's `merge_branches` keeps a hand-rolled insertion-sort
//! scratch buffer (`resort_revs`) to re-sort only the one cursor that
//! advanced each iteration. This port re-sorts the whole cursor list every
//! iteration instead — same coalescence semantics, simpler code, and
//! `nbranch` is small (one entry per master touching the branch).

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::atom::{Atom, AtomTable};
use crate::diagnostics::{FatalError, Warnings};
use crate::model::{CvsCommit, GitCommit, GitCommitData};
use crate::revcvs::PerMasterDag;
use crate::tags::TagTable;

/// How close two commits' timestamps must be, in seconds, to be eligible
/// for coalescing into the same changeset when no commitid is present
/// (spec §4.5.2).
pub const DEFAULT_WINDOW: u32 = 300;

pub struct GitBranchData {
    pub name: Atom,
    pub commit: RefCell<Option<GitCommit>>,
    pub parent: RefCell<Option<GitBranch>>,
    pub depth: std::cell::Cell<usize>,
    pub tail: std::cell::Cell<bool>,
}

pub type GitBranch = Rc<GitBranchData>;

fn commit_time_close(a: u32, b: u32, window: u32) -> bool {
    a.abs_diff(b) < window
}

fn commits_match(a: &CvsCommit, b: &CvsCommit, window: u32) -> bool {
    match (&a.commitid, &b.commitid) {
        (Some(x), Some(y)) => return x == y,
        (Some(_), None) | (None, Some(_)) => return false,
        (None, None) => {}
    }
    commit_time_close(a.date.get(), b.date.get(), window) && a.log == b.log && a.author == b.author
}

/// Topologically sort branch names so a branch always comes after every
/// master's record of its parent (spec §4.5.1).
pub fn tsort_branch_names(
    names: Vec<Atom>,
    masters: &[(std::sync::Arc<crate::model::CvsMaster>, PerMasterDag)],
) -> Result<Vec<Atom>, FatalError> {
    let mut remaining = names;
    let mut sorted: Vec<Atom> = Vec::new();

    while !remaining.is_empty() {
        let idx = remaining.iter().position(|name| parents_placed(name, &sorted, masters));
        match idx {
            Some(i) => sorted.push(remaining.remove(i)),
            None => return Err(FatalError::BranchCycle),
        }
    }
    Ok(sorted)
}

fn parents_placed(
    name: &Atom,
    sorted: &[Atom],
    masters: &[(std::sync::Arc<crate::model::CvsMaster>, PerMasterDag)],
) -> bool {
    for (_, dag) in masters {
        if let Some(head) = dag.heads.iter().find(|h| h.name.borrow().as_ref() == Some(name)) {
            if let Some(parent) = head.parent.borrow().as_ref() {
                let parent_name = parent.name.borrow().clone();
                if let Some(pn) = parent_name {
                    if !sorted.iter().any(|s| *s == pn) {
                        return false;
                    }
                }
            }
        }
    }
    true
}

/// Recursively assign each gitspace branch's depth as one more than the
/// deepest parent any contributing master records for it (spec §4.5.1).
pub fn set_parent_depth(
    branch: &GitBranch,
    branches: &HashMap<Atom, GitBranch>,
    masters: &[(std::sync::Arc<crate::model::CvsMaster>, PerMasterDag)],
) {
    let mut deepest: Option<GitBranch> = None;
    for (_, dag) in masters {
        if let Some(head) = dag.heads.iter().find(|h| h.name.borrow().as_ref() == Some(&branch.name)) {
            if let Some(parent) = head.parent.borrow().as_ref() {
                if let Some(parent_name) = parent.name.borrow().clone() {
                    if let Some(gb) = branches.get(&parent_name) {
                        if deepest.as_ref().map(|d| gb.depth.get() >= d.depth.get()).unwrap_or(true) {
                            deepest = Some(gb.clone());
                        }
                    }
                }
            }
        }
    }
    if let Some(parent) = &deepest {
        if branch.parent.borrow().is_none() {
            *branch.parent.borrow_mut() = Some(parent.clone());
        }
        branch.depth.set(parent.depth.get() + 1);
    }
}

/// One step of the parallel walk across every master's cursor on this
/// branch: take the clique of newest, mutually-matching commits and fold
/// them into a single [`GitCommit`] (spec §4.5.2).
fn build_changeset(
    parent: Option<GitCommit>,
    clique: &[CvsCommit],
    revdir_files: Vec<(String, CvsCommit)>,
) -> GitCommit {
    let leader = clique
        .iter()
        .max_by_key(|c| c.date.get())
        .expect("a clique always has at least one member")
        .clone();
    let built_revdir = crate::revdir::pack_files(revdir_files);
    let commit = Rc::new(GitCommitData {
        parent: RefCell::new(parent),
        log: leader.log.clone(),
        author: leader.author.clone(),
        commitid: leader.commitid.clone(),
        date: leader.date.get(),
        revdir: RefCell::new(Some(built_revdir)),
        tail: std::cell::Cell::new(false),
        tailed: std::cell::Cell::new(false),
        dead: std::cell::Cell::new(clique.iter().all(|c| c.dead)),
        tagged: std::cell::Cell::new(false),
        serial: std::cell::Cell::new(0),
        refcount: std::cell::Cell::new(0),
    });
    for c in clique {
        *c.gitspace.borrow_mut() = Some(commit.clone());
    }
    commit
}

/// Merge every master's commit chain on one branch into a single gitspace
/// chain, newest first (spec §4.5.2's parallel walk).
///
/// `file_state` carries forward the export-path -> commit map so each
/// changeset's revdir reflects every file still alive on the branch, not
/// only the ones that changed in this step.
pub fn merge_branch(
    branch_name: &Atom,
    contributors: Vec<(std::sync::Arc<crate::model::CvsMaster>, CvsCommit)>,
    window: u32,
) -> Option<GitCommit> {
    let mut cursors: Vec<Option<CvsCommit>> =
        contributors.into_iter().map(|(_, c)| Some(c)).collect();
    let mut file_state: HashMap<String, CvsCommit> = HashMap::new();
    let mut parent: Option<GitCommit> = None;
    let mut head: Option<GitCommit> = None;

    loop {
        let newest_idx = cursors
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.as_ref().map(|c| (i, c.date.get())))
            .max_by_key(|(_, d)| *d)
            .map(|(i, _)| i);
        let Some(i) = newest_idx else { break };
        let leader = cursors[i].clone().unwrap();

        let mut clique_idx = vec![i];
        for (j, cursor) in cursors.iter().enumerate() {
            if j == i {
                continue;
            }
            if let Some(c) = cursor {
                if commits_match(&leader, c, window) {
                    clique_idx.push(j);
                }
            }
        }

        let clique: Vec<CvsCommit> = clique_idx.iter().map(|&j| cursors[j].clone().unwrap()).collect();
        for c in &clique {
            file_state.insert(c.export_path(), c.clone());
        }

        let revdir_files: Vec<(String, CvsCommit)> =
            file_state.iter().filter(|(_, c)| !c.dead).map(|(p, c)| (p.clone(), c.clone())).collect();
        let commit = build_changeset(parent.clone(), &clique, revdir_files);
        if head.is_none() {
            head = Some(commit.clone());
        }
        parent = Some(commit);

        for j in clique_idx {
            cursors[j] = cursors[j].as_ref().and_then(|c| c.parent.borrow().clone());
        }
        let _ = branch_name;
    }
    head
}

/// Walk the branch's gitspace chain marking the commit after which
/// traversal should stop, so the second and later heads that share tail
/// history with an earlier-processed branch do not revisit it (spec
/// §4.5.5).
pub fn set_tail(head: &GitCommit) {
    let mut c = Some(head.clone());
    let mut stop = false;
    while let Some(commit) = c {
        let parent = commit.parent.borrow().clone();
        if !stop {
            if let Some(p) = &parent {
                if commit.refcount.get() < p.refcount.get() {
                    commit.tail.set(true);
                    stop = true;
                }
            }
        }
        commit.refcount.set(commit.refcount.get() + 1);
        c = parent;
    }
    head.tagged.set(true);
}

/// Resolve every tag name to the gitspace commit that owns its
/// latest-dated contributing CVS commit (spec §4.5.4).
pub fn place_tags(tags: &TagTable, warnings: &Warnings) {
    for name in tags.names() {
        let commits = tags.commits_for(&name);
        let latest = commits.iter().max_by_key(|c| c.date.get());
        let Some(latest) = latest else { continue };
        match latest.gitspace.borrow().clone() {
            Some(target) => tags.set_target(&name, target),
            None => {
                crate::announce!(
                    warnings,
                    "tag {} points at a commit with no gitspace changeset",
                    name.as_str()
                );
            }
        }
    }
}

/// Check that every non-tail branch's commit chain has monotonically
/// non-increasing dates walking from head to tail (spec §8's first
/// quantified invariant).
pub fn validate(branches: &HashMap<Atom, GitBranch>, warnings: &Warnings) {
    for branch in branches.values() {
        if branch.tail.get() {
            continue;
        }
        let mut c = branch.commit.borrow().clone();
        while let Some(commit) = c {
            let parent = commit.parent.borrow().clone();
            if let Some(p) = &parent {
                if p.date > commit.date {
                    crate::announce!(
                        warnings,
                        "{}: parent commit dated after child in branch {}",
                        p.date,
                        branch.name.as_str()
                    );
                }
            }
            if commit.tail.get() {
                break;
            }
            c = parent;
        }
    }
}

pub fn new_git_branch(name: Atom) -> GitBranch {
    Rc::new(GitBranchData {
        name,
        commit: RefCell::new(None),
        parent: RefCell::new(None),
        depth: std::cell::Cell::new(0),
        tail: std::cell::Cell::new(false),
    })
}
