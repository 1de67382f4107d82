//! Component E: fast-import emission (spec §4.5.6, §6), grounded on
//! `export.c`.
//!
//! Blobs are staged to a fan-out directory tree before being streamed (the
//! original does this so blob data can be written once and referenced by
//! serial from several commits without re-reading the master); marks are
//! assigned once per blob and once per commit, in the order each is first
//! referenced.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::authormap::AuthorMap;
use crate::model::{CvsCommit, GitCommit};
use crate::tags::TagTable;

const FANOUT: u32 = 256;

/// Two-level fan-out directory path for blob `serial`, matching the
/// original's `blobfile()`.
pub fn blob_path(root: &Path, serial: u32) -> PathBuf {
    let mut path = root.to_path_buf();
    let mut m = serial;
    let mut components = Vec::new();
    loop {
        let digit = m % FANOUT;
        m /= FANOUT;
        components.push(format!("={digit:x}"));
        if m == 0 {
            break;
        }
    }
    components.reverse();
    for c in components {
        path.push(c);
    }
    path
}

pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn new(root: PathBuf) -> std::io::Result<Self> {
        std::fs::create_dir_all(&root)?;
        Ok(BlobStore { root })
    }

    pub fn stage(&self, serial: u32, bytes: &[u8]) -> std::io::Result<()> {
        let path = blob_path(&self.root, serial);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, bytes)
    }

    pub fn load(&self, serial: u32) -> std::io::Result<Vec<u8>> {
        std::fs::read(blob_path(&self.root, serial))
    }
}

enum FileOp {
    Modify { mode: u32, mark: u32, path: String },
    Delete { path: String },
}

/// Diff two revdir snapshots into fast-import file operations (spec §8's
/// second quantified invariant: present-in-parent-not-child ⇒ `D`,
/// present-in-child-with-different-content ⇒ `M`).
fn diff_revdirs(
    parent: Option<&crate::revdir::Revdir>,
    child: &crate::revdir::Revdir,
    marks: &mut Marks,
) -> Vec<FileOp> {
    let child_files: Vec<CvsCommit> = child.iter_post_order();
    let parent_map: HashMap<String, CvsCommit> = parent
        .map(|p| p.iter_post_order().into_iter().map(|c| (c.export_path(), c)).collect())
        .unwrap_or_default();

    let mut ops = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for file in &child_files {
        let path = file.export_path();
        seen.insert(path.clone());
        let unchanged = parent_map.get(&path).map(|p| std::sync::Arc::ptr_eq(p, file)).unwrap_or(false);
        if unchanged {
            continue;
        }
        if file.dead {
            if parent_map.contains_key(&path) {
                ops.push(FileOp::Delete { path });
            }
            continue;
        }
        let mark = marks.mark_for_blob(file);
        let mode = if file.master.mode & 0o100 != 0 { 0o100755 } else { 0o100644 };
        ops.push(FileOp::Modify { mode, mark, path });
    }
    for (path, _) in &parent_map {
        if !seen.contains(path) {
            ops.push(FileOp::Delete { path: path.clone() });
        }
    }
    ops
}

/// Commit marks start above any plausible blob serial so the two mark
/// spaces (blob marks are a file's [`CvsCommitData::serial`], assigned
/// once per materialised revision) never collide in one fast-import
/// stream.
const COMMIT_MARK_BASE: u32 = 1 << 30;

/// Assigns fast-import marks to commits (in first-reference order, as the
/// original's `markmap` does) and tracks which blob serials were actually
/// referenced, so [`emit_blobs`] only streams blobs the emitted commits
/// use.
pub struct Marks {
    next_commit_mark: u32,
    commit_marks: HashMap<usize, u32>,
    blobs_referenced: std::collections::BTreeSet<u32>,
}

impl Marks {
    pub fn new() -> Self {
        Marks {
            next_commit_mark: COMMIT_MARK_BASE,
            commit_marks: HashMap::new(),
            blobs_referenced: std::collections::BTreeSet::new(),
        }
    }

    fn mark_for_blob(&mut self, commit: &CvsCommit) -> u32 {
        let serial = commit.serial.get();
        self.blobs_referenced.insert(serial);
        serial
    }

    fn mark_for_commit(&mut self, commit: &GitCommit) -> u32 {
        let key = std::sync::Arc::as_ptr(commit) as usize;
        *self.commit_marks.entry(key).or_insert_with(|| {
            let m = self.next_commit_mark;
            self.next_commit_mark += 1;
            m
        })
    }

    /// Look up the mark already assigned to a gitspace commit, for
    /// `--revision-map` output; `None` if it was never emitted (e.g. it was
    /// skipped by `--incremental`).
    pub fn commit_mark(&self, commit: &GitCommit) -> Option<u32> {
        let key = std::sync::Arc::as_ptr(commit) as usize;
        self.commit_marks.get(&key).copied()
    }
}

impl Default for Marks {
    fn default() -> Self {
        Self::new()
    }
}

/// Where a commit's `from` line points.
enum ParentRef {
    Mark(u32),
    /// `--incremental` cut the true parent out of this run; the receiving
    /// repository is assumed to already hold it on this ref (spec §4.5.6's
    /// incremental-mode note).
    BranchTip,
}

/// Streams one branch's commits, oldest first, as `blob`/`commit` fast
/// import commands (spec §6), interleaving `reset refs/tags/<name>` for
/// every tag targeting each commit and a final `reset <branch_ref>` for
/// the branch head. `cutoff` implements `--incremental`: commits dated at
/// or before it are assumed already imported, and emit no `commit` body,
/// but still advance marks; the first commit after the gap references
/// `<branch_ref>^0` instead of a mark, since its true parent was never
/// written to this stream.
#[allow(clippy::too_many_arguments)]
pub fn emit_branch<W: Write>(
    out: &mut W,
    blobs: &BlobStore,
    marks: &mut Marks,
    branch_ref: &str,
    head: &GitCommit,
    cutoff: Option<u32>,
    authors: Option<&AuthorMap>,
    tags: Option<&TagTable>,
) -> std::io::Result<()> {
    let mut chain = Vec::new();
    let mut c = Some(head.clone());
    while let Some(commit) = c {
        let tail = commit.tail.get();
        chain.push(commit.clone());
        if tail {
            break;
        }
        c = commit.parent.borrow().clone();
    }
    chain.reverse();

    let mut parent_revdir: Option<crate::revdir::Revdir> = None;
    let mut parent_ref: Option<ParentRef> = None;
    let mut last_was_skipped = false;
    let mut any_emitted = false;
    for commit in &chain {
        let skip = cutoff.map(|t| commit.date <= t).unwrap_or(false);
        if skip {
            // Still advance marks (spec §4.5.6's incremental-mode note) so a
            // later, non-incremental re-run of the same masters assigns the
            // same numbering.
            let mark = marks.mark_for_commit(commit);
            parent_ref = Some(ParentRef::Mark(mark));
            parent_revdir = commit.revdir.borrow().clone();
            last_was_skipped = true;
            continue;
        }
        let revdir = commit.revdir.borrow().clone();
        let ops = match &revdir {
            Some(r) => diff_revdirs(parent_revdir.as_ref(), r, marks),
            None => Vec::new(),
        };
        let effective_parent = if last_was_skipped { Some(ParentRef::BranchTip) } else { parent_ref.take() };
        write_commit(out, branch_ref, commit, effective_parent, &ops, marks, authors)?;
        any_emitted = true;
        let mark = marks.mark_for_commit(commit);
        if let Some(tags) = tags {
            for name in tags.names_targeting(commit) {
                writeln!(out, "reset refs/tags/{}", name.as_str())?;
                writeln!(out, "from :{mark}")?;
                writeln!(out)?;
            }
        }
        parent_ref = Some(ParentRef::Mark(mark));
        parent_revdir = revdir;
        last_was_skipped = false;
    }

    if any_emitted {
        if let Some(mark) = marks.commit_mark(head) {
            writeln!(out, "reset {branch_ref}")?;
            writeln!(out, "from :{mark}")?;
            writeln!(out)?;
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn write_commit<W: Write>(
    out: &mut W,
    branch_ref: &str,
    commit: &GitCommit,
    parent_ref: Option<ParentRef>,
    ops: &[FileOp],
    marks: &mut Marks,
    authors: Option<&AuthorMap>,
) -> std::io::Result<()> {
    let mark = marks.mark_for_commit(commit);
    writeln!(out, "commit {branch_ref}")?;
    writeln!(out, "mark :{mark}")?;
    let ident = match authors.and_then(|a| a.get(commit.author.as_str())) {
        Some(info) => format!("{} <{}>", info.full_name, info.email),
        None => format!("{} <{}@localhost>", commit.author.as_str(), commit.author.as_str()),
    };
    writeln!(out, "author {ident} {} +0000", commit.date)?;
    writeln!(out, "committer {ident} {} +0000", commit.date)?;
    writeln!(out, "data {}", commit.log.as_bytes().len())?;
    out.write_all(commit.log.as_bytes())?;
    writeln!(out)?;
    match parent_ref {
        Some(ParentRef::Mark(p)) => writeln!(out, "from :{p}")?,
        Some(ParentRef::BranchTip) => writeln!(out, "from {branch_ref}^0")?,
        None => {}
    }
    for op in ops {
        match op {
            FileOp::Modify { mode, mark, path } => {
                writeln!(out, "M {mode:o} :{mark} {path}")?;
            }
            FileOp::Delete { path } => {
                writeln!(out, "D {path}")?;
            }
        }
    }
    writeln!(out)?;
    Ok(())
}

/// Writes every staged blob once, in mark order, ahead of any commit that
/// references it (fast-import requires `blob` before the `commit` using
/// its mark).
pub fn emit_blobs<W: Write>(out: &mut W, blobs: &BlobStore, marks: &Marks) -> std::io::Result<()> {
    for &serial in &marks.blobs_referenced {
        let data = blobs.load(serial)?;
        writeln!(out, "blob")?;
        writeln!(out, "mark :{serial}")?;
        writeln!(out, "data {}", data.len())?;
        out.write_all(&data)?;
        writeln!(out)?;
    }
    Ok(())
}

pub fn emit_done<W: Write>(out: &mut W) -> std::io::Result<()> {
    writeln!(out, "done")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_path_uses_two_level_fanout() {
        let root = PathBuf::from("/tmp/x");
        let p = blob_path(&root, 0);
        assert_eq!(p, root.join("=0"));
        let p = blob_path(&root, 256);
        assert_eq!(p, root.join("=1").join("=0"));
    }

    #[test]
    fn blob_mark_is_the_commits_serial() {
        let atoms = crate::atom::AtomTable::new();
        let commit = make_commit(&atoms);
        commit.serial.set(7);
        let mut marks = Marks::new();
        assert_eq!(marks.mark_for_blob(&commit), 7);
        assert!(marks.blobs_referenced.contains(&7));
    }


    fn make_commit(atoms: &crate::atom::AtomTable) -> CvsCommit {
        use crate::cvsnumber::CvsNumber;
        use crate::model::{master_dir_root, CvsCommitData, CvsMaster};
        use std::cell::{Cell, RefCell};
        use std::sync::Arc;
        let dir = master_dir_root(atoms);
        let master = Arc::new(CvsMaster {
            master_name: atoms.intern("f.c,v"),
            export_name: atoms.intern("f.c"),
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

    fn test_blobs(name: &str) -> BlobStore {
        let root = std::env::temp_dir()
            .join(format!("cvs-fast-export-emit-test-{name}-{}", std::process::id()));
        BlobStore::new(root).unwrap()
    }

    /// A file-level commit with a staged blob, for building [`Revdir`]
    /// fixtures (spec §8's literal end-to-end scenarios).
    fn file_commit(
        atoms: &crate::atom::AtomTable,
        blobs: &BlobStore,
        path: &str,
        serial: u32,
        content: &[u8],
        dead: bool,
    ) -> CvsCommit {
        use crate::cvsnumber::CvsNumber;
        use crate::model::{master_dir_root, CvsCommitData, CvsMaster};
        use std::cell::{Cell, RefCell};
        use std::sync::Arc;
        blobs.stage(serial, content).unwrap();
        let dir = master_dir_root(atoms);
        let master = Arc::new(CvsMaster {
            master_name: atoms.intern(&format!("{path},v")),
            export_name: atoms.intern(path),
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
            dead,
            parent: RefCell::new(None),
            refcount: Cell::new(0),
            tail: Cell::new(false),
            tailed: Cell::new(false),
            tagged: Cell::new(false),
            gitspace: RefCell::new(None),
            serial: Cell::new(serial),
        })
    }

    fn git_commit(
        atoms: &crate::atom::AtomTable,
        log: &str,
        author: &str,
        date: u32,
        parent: Option<GitCommit>,
        revdir: Option<crate::revdir::Revdir>,
    ) -> GitCommit {
        use crate::model::GitCommitData;
        use std::cell::{Cell, RefCell};
        use std::sync::Arc;
        Arc::new(GitCommitData {
            parent: RefCell::new(parent),
            log: atoms.intern(log),
            author: atoms.intern(author),
            commitid: None,
            date,
            revdir: RefCell::new(revdir),
            tail: Cell::new(false),
            tailed: Cell::new(false),
            dead: Cell::new(false),
            tagged: Cell::new(false),
            serial: Cell::new(0),
            refcount: Cell::new(0),
        })
    }

    fn count_occurrences(haystack: &str, needle: &str) -> usize {
        haystack.matches(needle).count()
    }

    /// Scenario 1 (spec §8): single master, linear trunk of three
    /// revisions. Three blobs, three commits on `refs/heads/master`,
    /// chained `commit3 -> commit2 -> commit1`, and a closing `reset`.
    #[test]
    fn scenario_single_master_linear_trunk() {
        let atoms = crate::atom::AtomTable::new();
        let blobs = test_blobs("scenario1");

        let f1 = file_commit(&atoms, &blobs, "f.c", 1, b"a\n", false);
        let f2 = file_commit(&atoms, &blobs, "f.c", 2, b"b\n", false);
        let f3 = file_commit(&atoms, &blobs, "f.c", 3, b"c\n", false);
        let r1 = crate::revdir::pack_files(vec![("f.c".to_string(), f1)]);
        let r2 = crate::revdir::pack_files(vec![("f.c".to_string(), f2)]);
        let r3 = crate::revdir::pack_files(vec![("f.c".to_string(), f3)]);

        let g1 = git_commit(&atoms, "a", "alice", 1000, None, Some(r1));
        let g2 = git_commit(&atoms, "b", "alice", 2000, Some(g1.clone()), Some(r2));
        let g3 = git_commit(&atoms, "c", "alice", 3000, Some(g2.clone()), Some(r3));

        let mut marks = Marks::new();
        let mut buf = Vec::new();
        emit_branch(&mut buf, &blobs, &mut marks, "refs/heads/master", &g3, None, None, None).unwrap();
        let mut out = Vec::new();
        emit_blobs(&mut out, &blobs, &marks).unwrap();
        out.extend_from_slice(&buf);
        emit_done(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();

        assert_eq!(count_occurrences(&text, "blob\n"), 3);
        assert_eq!(count_occurrences(&text, "commit refs/heads/master\n"), 3);

        let m1 = marks.mark_for_commit(&g1);
        let m2 = marks.mark_for_commit(&g2);
        let m3 = marks.mark_for_commit(&g3);
        assert!(text.contains(&format!("from :{m1}")));
        assert!(text.contains(&format!("from :{m2}")));
        assert!(text.contains(&format!("reset refs/heads/master\nfrom :{m3}\n")));
        assert!(text.trim_end().ends_with("done"));
    }

    /// Scenario 2 (spec §8): two masters contributing a coalesced commit;
    /// the newer changeset carries `M` operations for both files pointing
    /// at the later blobs, the older one at the initial blobs.
    #[test]
    fn scenario_two_masters_coalescing_commit() {
        let atoms = crate::atom::AtomTable::new();
        let blobs = test_blobs("scenario2");

        let f1 = file_commit(&atoms, &blobs, "f.c", 1, b"f-old\n", false);
        let g1 = file_commit(&atoms, &blobs, "g.c", 2, b"g-old\n", false);
        let r_old = crate::revdir::pack_files(vec![("f.c".to_string(), f1), ("g.c".to_string(), g1)]);

        let f2 = file_commit(&atoms, &blobs, "f.c", 3, b"f-new\n", false);
        let g2 = file_commit(&atoms, &blobs, "g.c", 4, b"g-new\n", false);
        let r_new = crate::revdir::pack_files(vec![("f.c".to_string(), f2), ("g.c".to_string(), g2)]);

        let c_old = git_commit(&atoms, "joint", "alice", 1000, None, Some(r_old));
        let c_new = git_commit(&atoms, "joint", "alice", 1010, Some(c_old.clone()), Some(r_new));

        let mut marks = Marks::new();
        let mut buf = Vec::new();
        emit_branch(&mut buf, &blobs, &mut marks, "refs/heads/master", &c_new, None, None, None).unwrap();
        let text = String::from_utf8(buf).unwrap();

        assert_eq!(count_occurrences(&text, "M 100644 :1 f.c"), 1);
        assert_eq!(count_occurrences(&text, "M 100644 :2 g.c"), 1);
        assert_eq!(count_occurrences(&text, "M 100644 :3 f.c"), 1);
        assert_eq!(count_occurrences(&text, "M 100644 :4 g.c"), 1);
    }

    /// Scenario 4 (spec §8): a tag on a trunk commit surfaces as a
    /// `reset refs/tags/<name>` interleaved at that commit's mark, and a
    /// branch rooted there chains `from` the same mark.
    #[test]
    fn scenario_branch_from_tag() {
        let atoms = crate::atom::AtomTable::new();
        let blobs = test_blobs("scenario4");

        let f1 = file_commit(&atoms, &blobs, "f.c", 1, b"one\n", false);
        let r1 = crate::revdir::pack_files(vec![("f.c".to_string(), f1)]);
        let g1 = git_commit(&atoms, "tagged", "alice", 1000, None, Some(r1));

        let f2 = file_commit(&atoms, &blobs, "f.c", 2, b"two\n", false);
        let r2 = crate::revdir::pack_files(vec![("f.c".to_string(), f2)]);
        let fix = git_commit(&atoms, "fix", "alice", 2000, Some(g1.clone()), Some(r2));

        let tags = TagTable::new();
        let warnings = crate::diagnostics::Warnings::new();
        let name = atoms.intern("RELEASE");
        let tagged_file = file_commit(&atoms, &blobs, "f.c", 1, b"one\n", false);
        crate::tags::tag_commit(&tags, &tagged_file, name.clone(), &tagged_file.master, &warnings);
        tags.set_target(&name, g1.clone());
        assert_eq!(tags.names_targeting(&g1).len(), 1);

        let mut marks = Marks::new();
        let mut master_buf = Vec::new();
        emit_branch(&mut master_buf, &blobs, &mut marks, "refs/heads/master", &g1, None, None, Some(&tags))
            .unwrap();
        let mut fixes_buf = Vec::new();
        emit_branch(&mut fixes_buf, &blobs, &mut marks, "refs/heads/fixes", &fix, None, None, Some(&tags))
            .unwrap();

        let m1 = marks.mark_for_commit(&g1);
        let master_text = String::from_utf8(master_buf).unwrap();
        assert!(master_text.contains(&format!("reset refs/tags/RELEASE\nfrom :{m1}\n")));

        let fixes_text = String::from_utf8(fixes_buf).unwrap();
        assert!(fixes_text.contains(&format!("from :{m1}")));
        assert!(fixes_text.contains("reset refs/heads/fixes"));
    }

    /// Scenario 5 (spec §8): `$Id$` expands to the basename, revision,
    /// date, author and state of the revision being emitted.
    #[test]
    fn scenario_keyword_expansion() {
        use crate::generate::{expand_keywords, KeywordContext};
        use crate::model::ExpandMode;

        let ctx = KeywordContext {
            filename: "f.c",
            revision: "1.4",
            date: "2010/01/02 03:04:05",
            author: "alice",
            state: "Exp",
            master_name: "f.c,v",
            log: "",
        };
        let expanded = expand_keywords(b"$Id$\n", ExpandMode::Kv, &ctx);
        let expanded = String::from_utf8(expanded).unwrap();
        assert!(
            expanded.starts_with("$Id: f.c 1.4 2010/01/02 03:04:05 alice Exp $"),
            "got {expanded:?}"
        );
    }

    /// Scenario 6 (spec §8): `--incremental` skips already-imported
    /// commits but still assigns them marks, and the first emitted commit
    /// on the branch references the ref tip rather than a commit mark.
    #[test]
    fn scenario_incremental_cutoff() {
        let atoms = crate::atom::AtomTable::new();
        let blobs = test_blobs("scenario6");

        let f1 = file_commit(&atoms, &blobs, "f.c", 1, b"a\n", false);
        let f2 = file_commit(&atoms, &blobs, "f.c", 2, b"b\n", false);
        let f3 = file_commit(&atoms, &blobs, "f.c", 3, b"c\n", false);
        let r1 = crate::revdir::pack_files(vec![("f.c".to_string(), f1)]);
        let r2 = crate::revdir::pack_files(vec![("f.c".to_string(), f2)]);
        let r3 = crate::revdir::pack_files(vec![("f.c".to_string(), f3)]);

        let g1 = git_commit(&atoms, "a", "alice", 1000, None, Some(r1));
        let g2 = git_commit(&atoms, "b", "alice", 2000, Some(g1.clone()), Some(r2));
        let g3 = git_commit(&atoms, "c", "alice", 3000, Some(g2.clone()), Some(r3));

        let mut marks = Marks::new();
        let mut buf = Vec::new();
        emit_branch(&mut buf, &blobs, &mut marks, "refs/heads/master", &g3, Some(2500), None, None).unwrap();
        let text = String::from_utf8(buf).unwrap();

        assert_eq!(count_occurrences(&text, "commit refs/heads/master\n"), 1);
        assert!(text.contains("from refs/heads/master^0"));
    }
}
