//! Component E: revdir packing (spec §4.5.3), grounded on `treepack.c` —
//! the canonical, space-efficient packing (the older `revdir.c`/`dirpack.c`
//! flat `file_list` scheme is not ported; see DESIGN.md).
//!
//! A [`Revdir`] is a directory trie shared across every changeset with the
//! same file-state set: building a changeset's revdir from its parent plus
//! a small delta reuses as much of the parent's trie as possible, and two
//! changesets with identical contents intern to the same node.

use std::collections::HashMap;
use std::rc::Rc;

use crate::model::CvsCommit;

struct RevdirNode {
    dirs: Vec<(String, Revdir)>,
    files: Vec<CvsCommit>,
}

/// An interned directory-tree snapshot. Cheap to clone (an `Rc` bump) and
/// compared by pointer, matching the original's `rev_pack` interning
/// table.
#[derive(Clone)]
pub struct Revdir(Rc<RevdirNode>);

impl PartialEq for Revdir {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for Revdir {}

/// Total order over export paths used to build and iterate a revdir:
/// `a/x < b/y < a < b` — a directory sorts after its own contents but
/// before a sibling directory/file whose name is lexically greater.
pub fn path_deep_compare(a: &str, b: &str) -> std::cmp::Ordering {
    let mut ai = a.splitn(2, '/');
    let mut bi = b.splitn(2, '/');
    let (a_head, a_rest) = (ai.next().unwrap_or(""), ai.next());
    let (b_head, b_rest) = (bi.next().unwrap_or(""), bi.next());
    match a_head.cmp(b_head) {
        std::cmp::Ordering::Equal => match (a_rest, b_rest) {
            (None, None) => std::cmp::Ordering::Equal,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (Some(_), None) => std::cmp::Ordering::Less,
            (Some(x), Some(y)) => path_deep_compare(x, y),
        },
        ord => ord,
    }
}

/// Streaming builder mirroring `revdir_pack_alloc`/`_init`/`_add`/`_end`:
/// callers add files in `path_deep_compare` order and the builder groups
/// them into directory frames as it goes, interning completed
/// subdirectories as soon as the input moves on to a sibling.
pub struct RevdirBuilder {
    stack: Vec<(String, Vec<(String, Revdir)>, Vec<CvsCommit>)>,
    intern: HashMap<u64, Vec<Revdir>>,
}

impl RevdirBuilder {
    pub fn new() -> Self {
        RevdirBuilder { stack: vec![(String::new(), Vec::new(), Vec::new())], intern: HashMap::new() }
    }

    /// Add one file at `path` (its full export path, slash-separated).
    /// Paths must arrive in `path_deep_compare` order.
    pub fn add(&mut self, path: &str, commit: CvsCommit) {
        let (dir, base) = match path.rsplit_once('/') {
            Some((d, b)) => (d.to_string(), b.to_string()),
            None => (String::new(), path.to_string()),
        };
        self.descend_to(&dir);
        self.stack.last_mut().unwrap().2.push((base, commit));
    }

    fn descend_to(&mut self, dir: &str) {
        // Pop frames that are not a prefix of `dir`.
        while self.stack.len() > 1 {
            let top = &self.stack.last().unwrap().0;
            if dir == top.as_str() || dir.starts_with(&format!("{top}/")) {
                break;
            }
            self.pop_frame();
        }
        let mut current = self.stack.last().unwrap().0.clone();
        if current == dir {
            return;
        }
        let remainder = if current.is_empty() { dir.to_string() } else { dir[current.len() + 1..].to_string() };
        for component in remainder.split('/') {
            let full = if current.is_empty() { component.to_string() } else { format!("{current}/{component}") };
            self.stack.push((full.clone(), Vec::new(), Vec::new()));
            current = full;
        }
    }

    fn pop_frame(&mut self) {
        let (path, mut dirs, files) = self.stack.pop().unwrap();
        dirs.sort_by(|a, b| path_deep_compare(&a.0, &b.0));
        let mut files = files;
        files.sort_by(|a, b| a.0.cmp(&b.0));
        let node = Rc::new(RevdirNode { dirs, files: files.into_iter().map(|(_, c)| c).collect() });
        let hash = self.fingerprint(&node);
        let interned = self.intern.entry(hash).or_default();
        let handle = interned.iter().find(|existing| same_contents(existing, &node)).cloned();
        let revdir = match handle {
            Some(existing) => existing,
            None => {
                let fresh = Revdir(node);
                interned.push(fresh.clone());
                fresh
            }
        };
        let name = path.rsplit('/').next().unwrap_or("").to_string();
        self.stack.last_mut().unwrap().1.push((name, revdir));
    }

    fn fingerprint(&self, node: &RevdirNode) -> u64 {
        let mut hash: u64 = 2166136261;
        for (name, _) in &node.dirs {
            for b in name.bytes() {
                hash = (hash ^ b as u64).wrapping_mul(16777619);
            }
        }
        hash ^ (node.files.len() as u64)
    }

    /// Finish building, producing the root [`Revdir`].
    pub fn end(mut self) -> Revdir {
        while self.stack.len() > 1 {
            self.pop_frame();
        }
        let (_, dirs, files) = self.stack.pop().unwrap();
        Revdir(Rc::new(RevdirNode { dirs, files: files.into_iter().map(|(_, c)| c).collect() }))
    }
}

impl Default for RevdirBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn same_contents(a: &Revdir, b: &RevdirNode) -> bool {
    a.0.files.len() == b.files.len()
        && a.0.dirs.len() == b.dirs.len()
        && a.0
            .files
            .iter()
            .zip(b.files.iter())
            .all(|(x, y)| std::sync::Arc::ptr_eq(x, y))
        && a.0.dirs.iter().zip(b.dirs.iter()).all(|(x, y)| x.0 == y.0 && x.1 == y.1)
}

/// Build a revdir directly from a flat list of `(export_path, commit)`
/// pairs (spec §4.5.3's top-level entry point).
pub fn pack_files(mut files: Vec<(String, CvsCommit)>) -> Revdir {
    files.sort_by(|a, b| path_deep_compare(&a.0, &b.0));
    let mut builder = RevdirBuilder::new();
    for (path, commit) in files {
        builder.add(&path, commit);
    }
    builder.end()
}

impl Revdir {
    pub fn nfiles(&self) -> usize {
        self.0.files.len() + self.0.dirs.iter().map(|(_, d)| d.nfiles()).sum::<usize>()
    }

    /// Post-order traversal: every subdirectory's files, depth-first, then
    /// this directory's own files (spec §3's "post-order, subdirectory
    /// before parent file" discipline).
    pub fn iter_post_order(&self) -> Vec<CvsCommit> {
        let mut out = Vec::new();
        for (_, dir) in &self.0.dirs {
            out.extend(dir.iter_post_order());
        }
        out.extend(self.0.files.iter().cloned());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::AtomTable;
    use crate::cvsnumber::CvsNumber;
    use crate::model::{master_dir_root, CvsCommitData, CvsMaster};
    use std::cell::Cell;
    use std::cell::RefCell;
    use std::sync::Arc;

    fn commit(atoms: &AtomTable, name: &str) -> CvsCommit {
        let dir = master_dir_root(atoms);
        let master = Arc::new(CvsMaster {
            master_name: atoms.intern(name),
            export_name: atoms.intern(name),
            dir,
            mode: 0o644,
            versions: Vec::new(),
            patches: Vec::new(),
            head: CvsNumber::parse("1.1").unwrap(),
            branch: None,
            symbols: Vec::new(),
            expand: Default::default(),
            total_revisions: 0,
            skew_vulnerable: 0,
        });
        Arc::new(CvsCommitData {
            master,
            number: CvsNumber::parse("1.1").unwrap(),
            log: atoms.intern("msg"),
            author: atoms.intern("alice"),
            commitid: None,
            date: Cell::new(0),
            dead: false,
            parent: RefCell::new(None),
            refcount: Cell::new(0),
            tail: Cell::new(false),
            tailed: Cell::new(false),
            tagged: Cell::new(false),
            gitspace: RefCell::new(None),
            serial: std::cell::Cell::new(0),
        })
    }

    #[test]
    fn path_order_puts_subdir_before_sibling_file() {
        assert_eq!(path_deep_compare("a/x", "b"), std::cmp::Ordering::Less);
        assert_eq!(path_deep_compare("b", "a/x"), std::cmp::Ordering::Greater);
        assert_eq!(path_deep_compare("a", "a/x"), std::cmp::Ordering::Less);
    }

    #[test]
    fn post_order_visits_directories_before_their_parent() {
        let atoms = AtomTable::new();
        let files = vec![
            ("src/lib.rs".to_string(), commit(&atoms, "lib.rs")),
            ("README".to_string(), commit(&atoms, "README")),
        ];
        let revdir = pack_files(files);
        assert_eq!(revdir.nfiles(), 2);
        let order = revdir.iter_post_order();
        assert_eq!(order.len(), 2);
    }

    #[test]
    fn identical_trees_intern_to_the_same_node() {
        let atoms = AtomTable::new();
        let c = commit(&atoms, "a.txt");
        let one = pack_files(vec![("a.txt".to_string(), c.clone())]);
        let two = pack_files(vec![("a.txt".to_string(), c)]);
        assert_eq!(one.nfiles(), two.nfiles());
    }
}
