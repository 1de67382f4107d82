//! Component D: per-master DAG builder (spec §4.4).
//!
//! Turns one master's node tree (component B's output) into a tree of
//! [`BranchHead`]s, each threading a chain of [`CvsCommit`]s through the
//! `parent` link. Trunk and branches are first built independently, then
//! vendor-branch grafting, symbol resolution and a listsort-style
//! topological ordering stitch them into a single per-file tree.

use std::cell::Cell;
use std::rc::Rc;
use std::sync::Arc;

use crate::atom::AtomTable;
use crate::cvsnumber::CvsNumber;
use crate::diagnostics::Warnings;
use crate::model::{new_branch_head, BranchHead, CvsCommit, CvsCommitData, CvsMaster};
use crate::nodehash::NodeHash;

/// Tree capturing one master's history: an unordered list of branch heads,
/// each with its own commit chain, eventually linked into a tree by
/// [`set_refs`].
#[derive(Clone)]
pub struct PerMasterDag {
    pub heads: Vec<BranchHead>,
}

/// Walk the node tree rooted at `branch`, producing a newest-first commit
/// chain (spec §4.4 step 1). Returns `None` if the branch has no deltas at
/// all (e.g. a branch symbol with nothing ever committed to it).
fn branch_commits(
    master: &Arc<CvsMaster>,
    nodehash: &NodeHash,
    branch: CvsNumber,
    warnings: &Warnings,
) -> Option<CvsCommit> {
    // The original walks "node chains starting one below the branch root":
    // find_version(cvs, n) with n's last component forced negative finds
    // the first delta actually committed on the branch.
    let mut probe = branch;
    let last = probe.as_slice().last().copied().unwrap_or(0);
    probe = probe.truncated(1).with_appended(last.wrapping_sub(1));

    let mut head: Option<CvsCommit> = None;
    let mut cursor = NodeHash::find_version(&master.versions, &probe);
    while let Some(node) = cursor {
        let version = node.version.borrow().clone();
        let Some(v) = version else {
            cursor = node.next.borrow().clone();
            continue;
        };
        let log = node.patch.borrow().as_ref().map(|p| p.log.clone()).unwrap_or_else(|| v.author.clone());
        let commit = Arc::new(CvsCommitData {
            master: master.clone(),
            number: v.number,
            log,
            author: v.author.clone(),
            commitid: v.commitid.clone(),
            date: Cell::new(v.date),
            dead: v.dead,
            parent: std::cell::RefCell::new(head.clone()),
            refcount: Cell::new(0),
            tail: Cell::new(false),
            tailed: Cell::new(false),
            tagged: Cell::new(false),
            gitspace: std::cell::RefCell::new(None),
            serial: Cell::new(0),
        });
        head = Some(commit);
        cursor = node.next.borrow().clone();
    }

    repair_branch_dates(master, &head, warnings);
    head
}

/// Fix up non-monotonic dates along a branch (spec §4.4 step 2): walking
/// newest-to-oldest, a parent dated later than its child is pulled back in
/// time, preferring to adjust the lone outlier over the whole tail.
fn repair_branch_dates(master: &Arc<CvsMaster>, head: &Option<CvsCommit>, warnings: &Warnings) {
    let Some(mut c) = head.clone() else { return };
    let mut grandchild: Option<CvsCommit> = None;
    loop {
        let parent = c.parent.borrow().clone();
        let Some(p) = parent else { break };
        if p.date.get() > c.date.get() {
            crate::announce!(
                warnings,
                "{}: {} is newer than {}",
                master.master_name.as_str(),
                p.number,
                c.number
            );
            if grandchild.as_ref().map(|gc| p.date.get() <= gc.date.get()).unwrap_or(false) {
                c.date.set(p.date.get());
            } else {
                p.date.set(c.date.get());
            }
        }
        grandchild = Some(c.clone());
        c = p;
    }
}

/// Build the per-master DAG (spec §4.4's single entry point, `rev_list_cvs`
/// in the original).
pub fn build_dag(
    master: &Arc<CvsMaster>,
    nodehash: &mut NodeHash,
    atoms: &AtomTable,
    tags: &crate::tags::TagTable,
    warnings: &Warnings,
) -> PerMasterDag {
    nodehash.build_branches(warnings);

    let mut heads = Vec::new();

    let trunk_number = master
        .versions
        .iter()
        .filter(|v| v.number.is_trunk())
        .map(|v| v.number)
        .min()
        .unwrap_or_else(|| CvsNumber::parse("1.1").unwrap());

    let trunk_commit = branch_commits(master, nodehash, trunk_number, warnings);
    if let Some(commit) = trunk_commit {
        let head = new_branch_head(Some(commit), Some(atoms.intern("master")), 2);
        *head.number.borrow_mut() = trunk_number;
        heads.push(head);
    } else {
        crate::announce!(warnings, "{}: no master branch generated", master.master_name.as_str());
    }

    let mut branch_numbers: Vec<CvsNumber> = master
        .versions
        .iter()
        .flat_map(|v| v.branches.iter().copied())
        .collect();
    branch_numbers.sort();
    branch_numbers.dedup();
    for number in branch_numbers {
        let commit = branch_commits(master, nodehash, number, warnings);
        heads.push(new_branch_head(commit, None, 0));
    }

    let mut dag = PerMasterDag { heads };
    patch_vendor_branch(&mut dag);
    graft_branches(&mut dag, master);
    set_refs(&mut dag, master, atoms, tags, warnings);
    sort_heads(&mut dag, master);
    set_tail(&mut dag);
    dag
}

/// Merge a vendor-import branch (`1.1.x`) back onto the trunk (spec §4.4
/// step 3's "vendor-branch grafting").
fn patch_vendor_branch(dag: &mut PerMasterDag) {
    let Some(trunk) = dag.heads.first().cloned() else { return };
    let mut keep = Vec::with_capacity(dag.heads.len());
    keep.push(trunk.clone());

    for head in dag.heads.iter().skip(1).cloned() {
        let is_vendor = head.commit.borrow().as_ref().map(|c| c.number.is_vendor()).unwrap_or(false);
        if !is_vendor {
            keep.push(head);
            continue;
        }
        // Splice the vendor branch's commits onto the trunk by date,
        // dropping the separate head unless some trunk history predates it.
        let mut t = trunk.commit.borrow().clone();
        let mut v = head.commit.borrow().clone();
        let mut merged: Option<CvsCommit> = None;
        let mut tail: Option<CvsCommit> = None;
        while let (Some(tc), Some(vc)) = (t.clone(), v.clone()) {
            let (next, advance_v) =
                if vc.date.get() >= tc.date.get() { (vc.clone(), true) } else { (tc.clone(), false) };
            if let Some(prev) = &tail {
                *prev.parent.borrow_mut() = Some(next.clone());
            } else {
                merged = Some(next.clone());
            }
            tail = Some(next.clone());
            if advance_v {
                v = next.parent.borrow().clone();
            } else {
                t = next.parent.borrow().clone();
            }
        }
        let rest = t.or(v);
        if let (Some(prev), Some(rest)) = (&tail, rest) {
            *prev.parent.borrow_mut() = Some(rest);
        }
        if let Some(m) = merged {
            *trunk.commit.borrow_mut() = Some(m);
        }
    }
    dag.heads = keep;
}

/// Attach every orphan branch root to its parent revision (spec §4.4 step
/// 3's "tree of branches").
fn graft_branches(dag: &mut PerMasterDag, master: &Arc<CvsMaster>) {
    let trunk = dag.heads.first().cloned();
    for head in dag.heads.iter().skip(1) {
        if head.tail.get() {
            continue;
        }
        let mut tail_commit = head.commit.borrow().clone();
        while let Some(c) = &tail_commit {
            let next = c.parent.borrow().clone();
            if next.is_none() {
                break;
            }
            tail_commit = next;
        }
        let Some(c) = tail_commit else { continue };
        if Rc::ptr_eq(head, trunk.as_ref().unwrap_or(head)) {
            continue;
        }
        for v in &master.versions {
            for b in &v.branches {
                if *b == c.number {
                    if let Some(parent_commit) = find_revision(dag, &v.number) {
                        *c.parent.borrow_mut() = Some(parent_commit);
                        c.tail.set(true);
                    }
                }
            }
        }
    }
}

fn find_revision(dag: &PerMasterDag, number: &CvsNumber) -> Option<CvsCommit> {
    for h in &dag.heads {
        if h.tail.get() {
            continue;
        }
        let mut c = h.commit.borrow().clone();
        while let Some(commit) = c {
            if commit.number == *number {
                return Some(commit);
            }
            if commit.tail.get() {
                break;
            }
            c = commit.parent.borrow().clone();
        }
    }
    None
}

/// Resolve every CVS symbol against this master's heads: head symbols name
/// branches, non-head symbols tag a single commit (spec §4.4 step 4).
fn set_refs(
    dag: &mut PerMasterDag,
    master: &Arc<CvsMaster>,
    atoms: &AtomTable,
    tags: &crate::tags::TagTable,
    warnings: &Warnings,
) {
    for (name, number) in &master.symbols {
        if number.is_head() {
            let found = dag.heads.iter().find(|h| {
                h.commit.borrow().as_ref().map(|c| c.number.same_branch(number)).unwrap_or(false)
            });
            if let Some(h) = found {
                if h.name.borrow().is_none() {
                    *h.name.borrow_mut() = Some(name.clone());
                    h.degree.set(number.degree());
                } else {
                    let commit = h.commit.borrow().clone();
                    let new_head = new_branch_head(commit, Some(name.clone()), number.degree());
                    *new_head.number.borrow_mut() = *number;
                    dag.heads.push(new_head);
                }
            } else {
                let mut probe = *number;
                let mut commit = None;
                while probe.depth() >= 4 {
                    probe = probe.truncated(2);
                    commit = find_revision(dag, &probe);
                    if commit.is_some() {
                        break;
                    }
                }
                if let Some(c) = commit {
                    let new_head = new_branch_head(Some(c), Some(name.clone()), number.degree());
                    *new_head.number.borrow_mut() = *number;
                    dag.heads.push(new_head);
                }
            }
        } else if let Some(c) = find_revision(dag, number) {
            c.tagged.set(true);
            crate::tags::tag_commit(tags, &c, name.clone(), master, warnings);
        }
    }

    // Unnamed heads adopt a synthetic branch number from their first live
    // commit.
    for h in &dag.heads {
        if h.name.borrow().is_some() {
            continue;
        }
        let mut live = h.commit.borrow().clone();
        while let Some(c) = &live {
            if !c.dead {
                break;
            }
            live = c.parent.borrow().clone();
        }
        let Some(c) = live else { continue };
        let n = c.number.as_slice();
        if n.len() < 2 {
            continue;
        }
        let mut parts = n.to_vec();
        let last = parts[parts.len() - 1];
        let idx = parts.len() - 1;
        parts[idx] = parts[idx - 1];
        parts[idx - 1] = 0;
        let _ = last;
        let synthetic = CvsNumber::from_parts(&parts).expect("synthetic branch number in bounds");
        *h.number.borrow_mut() = synthetic;
        h.degree.set(synthetic.degree());
    }

    // Link heads into a tree by branch-number prefix, naming anything still
    // unnamed after its parent.
    let snapshot: Vec<BranchHead> = dag.heads.clone();
    for h in &dag.heads {
        let number = *h.number.borrow();
        if number.depth() >= 4 {
            let probe = number.truncated(2);
            let parent = snapshot.iter().find(|other| {
                !Rc::ptr_eq(other, h) && other.number.borrow().same_branch(&probe)
            });
            if let Some(p) = parent {
                *h.parent.borrow_mut() = Some(p.clone());
            } else if !number.is_vendor() {
                crate::announce!(
                    warnings,
                    "{}: non-vendor branch {:?} has no parent",
                    master.master_name.as_str(),
                    h.name.borrow().as_ref().map(|a| a.as_str().to_string())
                );
            }
        }
        if h.parent.borrow().is_some() && h.name.borrow().is_none() {
            let parent_name = h.parent.borrow().as_ref().and_then(|p| p.name.borrow().clone());
            let label = match parent_name {
                Some(n) => format!("{}-UNNAMED-BRANCH", n.as_str()),
                None => "UNNAMED-BRANCH".to_string(),
            };
            *h.name.borrow_mut() = Some(atoms.intern(&label));
        }
    }
}

/// Stable merge sort of heads by resolved symbol number, trunk first (spec
/// §4.4 step 5). The original implements a listsort variant of this over a
/// linked list; a key-extracting stable sort gives the same order.
fn sort_heads(dag: &mut PerMasterDag, master: &Arc<CvsMaster>) {
    let trunk = dag.heads.first().cloned();
    dag.heads.sort_by(|a, b| {
        if let Some(t) = &trunk {
            if Rc::ptr_eq(a, t) {
                return std::cmp::Ordering::Less;
            }
            if Rc::ptr_eq(b, t) {
                return std::cmp::Ordering::Greater;
            }
        }
        let key = |h: &BranchHead| -> Option<CvsNumber> {
            let name = h.name.borrow().clone()?;
            master.symbols.iter().find(|(n, _)| *n == name).map(|(_, n)| *n)
        };
        match (key(a), key(b)) {
            (None, None) => std::cmp::Ordering::Equal,
            (None, Some(_)) => std::cmp::Ordering::Less,
            (Some(_), None) => std::cmp::Ordering::Greater,
            (Some(x), Some(y)) => x.cmp(&y),
        }
    });
}

/// Set the `tail` bit on the commit where traversal from a later-sorted
/// head would re-enter already-visited history (spec §4.4 step 6), so each
/// commit is visited exactly once when walking all heads.
fn set_tail(dag: &mut PerMasterDag) {
    for head in &dag.heads {
        let mut tail = true;
        if let Some(hc) = head.commit.borrow().as_ref() {
            if hc.refcount.get() > 0 {
                head.tail.set(true);
                tail = false;
            }
        }
        let mut c = head.commit.borrow().clone();
        while let Some(commit) = c {
            let parent = commit.parent.borrow().clone();
            if tail {
                if let Some(p) = &parent {
                    if commit.refcount.get() < p.refcount.get() {
                        commit.tail.set(true);
                        tail = false;
                    }
                }
            }
            commit.refcount.set(commit.refcount.get() + 1);
            c = parent;
        }
        if let Some(hc) = head.commit.borrow().as_ref() {
            hc.tagged.set(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::AtomTable;
    use crate::model::{master_dir_root, CvsPatch, CvsVersion, TextLocation};
    use std::cell::RefCell;

    fn test_master(atoms: &AtomTable, versions: Vec<Rc<CvsVersion>>, head: CvsNumber) -> Arc<CvsMaster> {
        let dir = master_dir_root(atoms);
        let patches = versions
            .iter()
            .map(|v| {
                Arc::new(CvsPatch {
                    number: v.number,
                    log: atoms.intern("msg"),
                    text: TextLocation { offset: 0, length: 0 },
                    node: RefCell::new(None),
                })
            })
            .collect();
        Arc::new(CvsMaster {
            master_name: atoms.intern("f.c,v"),
            export_name: atoms.intern("f.c"),
            dir,
            mode: 0o644,
            versions,
            patches,
            head,
            branch: None,
            symbols: Vec::new(),
            expand: Default::default(),
            total_revisions: 0,
            skew_vulnerable: 0,
        })
    }

    fn version(atoms: &AtomTable, s: &str, date: u32, next: Option<&str>, branches: &[&str]) -> Rc<CvsVersion> {
        Rc::new(CvsVersion {
            number: CvsNumber::parse(s).unwrap(),
            author: atoms.intern("alice"),
            state: atoms.intern("Exp"),
            commitid: None,
            date,
            dead: false,
            next: next.map(|n| CvsNumber::parse(n).unwrap()),
            branches: branches.iter().map(|b| CvsNumber::parse(b).unwrap()).collect(),
            node: RefCell::new(None),
        })
    }

    /// A two-revision trunk builds a two-commit chain, newest first, with
    /// the tail bit set on the oldest commit (spec §4.4 steps 1 and 6).
    #[test]
    fn build_dag_links_trunk_chain_and_sets_tail() {
        let atoms = AtomTable::new();
        let v1 = version(&atoms, "1.1", 1000, None, &[]);
        let v2 = version(&atoms, "1.2", 2000, Some("1.1"), &[]);
        let master = test_master(&atoms, vec![v1, v2], CvsNumber::parse("1.2").unwrap());
        let mut nodehash = NodeHash::new();
        let warnings = Warnings::new();
        for v in &master.versions {
            nodehash.hash_version(v, &warnings);
        }
        let tags = crate::tags::TagTable::new();
        let dag = build_dag(&master, &mut nodehash, &atoms, &tags, &warnings);

        assert_eq!(dag.heads.len(), 1);
        let head = &dag.heads[0];
        let commit2 = head.commit.borrow().clone().unwrap();
        assert_eq!(commit2.number, CvsNumber::parse("1.2").unwrap());
        let commit1 = commit2.parent.borrow().clone().unwrap();
        assert_eq!(commit1.number, CvsNumber::parse("1.1").unwrap());
        assert!(commit1.parent.borrow().is_none());
        assert!(commit1.tail.get());
        assert_eq!(warnings.count(), 0);
    }

    fn commit(master: &Arc<CvsMaster>, number: &str, date: u32, parent: Option<CvsCommit>) -> CvsCommit {
        Arc::new(CvsCommitData {
            master: master.clone(),
            number: CvsNumber::parse(number).unwrap(),
            log: master.master_name.clone(),
            author: master.master_name.clone(),
            commitid: None,
            date: Cell::new(date),
            dead: false,
            parent: RefCell::new(parent),
            refcount: Cell::new(0),
            tail: Cell::new(false),
            tailed: Cell::new(false),
            tagged: Cell::new(false),
            gitspace: RefCell::new(None),
            serial: Cell::new(0),
        })
    }

    /// Vendor-branch grafting (spec §4.4 step 3 / §8 scenario 3): a vendor
    /// import chain is spliced into the trunk by date, newest first, and
    /// the separate vendor head is dropped.
    #[test]
    fn patch_vendor_branch_splices_by_date() {
        let atoms = AtomTable::new();
        let master = test_master(&atoms, Vec::new(), CvsNumber::parse("1.2").unwrap());

        let trunk_root = commit(&master, "1.1", 1000, None);
        let trunk_head = commit(&master, "1.2", 3000, Some(trunk_root.clone()));
        let vendor_root = commit(&master, "1.1.1.1", 1000, None);
        let vendor_head = commit(&master, "1.1.1.2", 2000, Some(vendor_root.clone()));

        let trunk = new_branch_head(Some(trunk_head.clone()), Some(atoms.intern("master")), 2);
        let vendor = new_branch_head(Some(vendor_head.clone()), None, 0);
        let mut dag = PerMasterDag { heads: vec![trunk.clone(), vendor] };

        patch_vendor_branch(&mut dag);

        // The vendor head is dropped; only the trunk head remains.
        assert_eq!(dag.heads.len(), 1);
        assert!(Rc::ptr_eq(&dag.heads[0], &trunk));

        let mut chain = Vec::new();
        let mut c = trunk.commit.borrow().clone();
        while let Some(commit) = c {
            chain.push(commit.number);
            c = commit.parent.borrow().clone();
        }
        assert_eq!(
            chain,
            vec![
                CvsNumber::parse("1.2").unwrap(),
                CvsNumber::parse("1.1.1.2").unwrap(),
                CvsNumber::parse("1.1.1.1").unwrap(),
                CvsNumber::parse("1.1").unwrap(),
            ]
        );
    }
}
