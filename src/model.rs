//! Component A/B/D/E data model (spec §3).
//!
//! Per §9's design notes, this module keeps the two historically
//! type-punned commit kinds as two distinct record types
//! ([`CvsCommit`] and [`GitCommit`]) connected by an explicit back-link,
//! and keeps the "dead" marker as a plain field rather than a tagged
//! pointer.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use crate::atom::Atom;
use crate::cvsnumber::CvsNumber;

/// Seconds since the Unix epoch, as a plain 32-bit quantity — spec §3.
/// The original's `cvstime_t` is biased from 1982-01-01; this port keeps
/// an ordinary Unix timestamp instead; since every value is produced by
/// the same parser and the field is only ever compared, not rendered in
/// the original's serialisation format, the choice of epoch is immaterial.
/// Comparisons are ordinary integer comparisons; repair (spec §4.4 step 3)
/// mutates this field directly.
pub type CvsTime = u32;

/// RCS keyword-expansion mode (spec §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExpandMode {
    /// `$Keyword: value$`
    #[default]
    Kv,
    /// `$Keyword: value$` but locker name never filled in.
    Kvl,
    /// `$Keyword$` with no value.
    K,
    /// Value only, no keyword name or delimiters.
    V,
    /// Old: no expansion, preserve original bytes verbatim.
    Old,
    /// Binary: no expansion, no EOL normalisation.
    Binary,
}

impl ExpandMode {
    pub fn from_flag(flag: &str) -> ExpandMode {
        match flag {
            "kv" => ExpandMode::Kv,
            "kvl" => ExpandMode::Kvl,
            "k" => ExpandMode::K,
            "v" => ExpandMode::V,
            "o" => ExpandMode::Old,
            "b" => ExpandMode::Binary,
            _ => ExpandMode::Kv,
        }
    }

    /// Per §9's resolved open question: `o`/`b` are treated as "no
    /// expansion."
    pub fn expands_keywords(&self) -> bool {
        !matches!(self, ExpandMode::Old | ExpandMode::Binary)
    }
}

/// One RCS delta's metadata (spec §3: "ordered list of versions").
#[derive(Debug)]
pub struct CvsVersion {
    pub number: CvsNumber,
    pub author: Atom,
    pub state: Atom,
    pub commitid: Option<Atom>,
    pub date: CvsTime,
    pub dead: bool,
    /// Next revision along the `,v` chain (older revision's admin block
    /// points here via `next`).
    pub next: Option<CvsNumber>,
    /// Branch-attachment numbers rooted at this revision.
    pub branches: Vec<CvsNumber>,
    /// Back-link filled in by [`crate::nodehash::hash_version`].
    pub node: RefCell<Option<NodeRef>>,
}

/// Location of a delta's `@...@`-quoted text within the master file.
#[derive(Debug, Clone, Copy)]
pub struct TextLocation {
    pub offset: u64,
    pub length: u64,
}

/// One RCS delta's log message and text locator (spec §3: "ordered list of
/// patches").
#[derive(Debug)]
pub struct CvsPatch {
    pub number: CvsNumber,
    pub log: Atom,
    pub text: TextLocation,
    /// Back-link filled in by [`crate::nodehash::hash_patch`].
    pub node: RefCell<Option<NodeRef>>,
}

/// A delta-tree node (spec §3). Lives only during component B/C/D; dropped
/// once the per-master DAG (component D's output) is built.
pub struct Node {
    pub number: CvsNumber,
    pub version: RefCell<Option<Rc<CvsVersion>>>,
    pub patch: RefCell<Option<Rc<CvsPatch>>>,
    pub next: RefCell<Option<NodeRef>>,
    pub to: RefCell<Option<NodeRef>>,
    pub down: RefCell<Option<NodeRef>>,
    pub sib: RefCell<Option<NodeRef>>,
    pub starts: RefCell<bool>,
}

pub type NodeRef = Rc<Node>;

impl Node {
    pub fn new(number: CvsNumber) -> NodeRef {
        Rc::new(Node {
            number,
            version: RefCell::new(None),
            patch: RefCell::new(None),
            next: RefCell::new(None),
            to: RefCell::new(None),
            down: RefCell::new(None),
            sib: RefCell::new(None),
            starts: RefCell::new(false),
        })
    }
}

/// A directory in the export-path space, shared by every file it contains
/// (spec §4.5.3's "tree of directory nodes"). Comparable by pointer.
pub struct MasterDirData {
    pub parent: Option<MasterDir>,
    pub name: Atom,
    /// Full slash-joined path from the export root, used by
    /// `path_deep_compare` and `dir_is_ancestor`.
    pub full_path: Arc<str>,
}

pub type MasterDir = Arc<MasterDirData>;

pub fn master_dir_root(atoms: &crate::atom::AtomTable) -> MasterDir {
    Arc::new(MasterDirData { parent: None, name: atoms.intern(""), full_path: "".into() })
}

pub fn master_dir_child(parent: &MasterDir, name: Atom) -> MasterDir {
    let full_path: Arc<str> = if parent.full_path.is_empty() {
        name.as_str().into()
    } else {
        format!("{}/{}", parent.full_path, name.as_str()).into()
    };
    Arc::new(MasterDirData { parent: Some(parent.clone()), name, full_path })
}

/// Is `ancestor` a prefix directory of `child` (or equal to it)?
pub fn dir_is_ancestor(child: &MasterDir, ancestor: &MasterDir) -> bool {
    child.full_path.starts_with(&*ancestor.full_path)
}

/// One CVS master file (spec §3).
pub struct CvsMaster {
    pub master_name: Atom,
    pub export_name: Atom,
    pub dir: MasterDir,
    pub mode: u32,
    pub versions: Vec<Rc<CvsVersion>>,
    pub patches: Vec<Rc<CvsPatch>>,
    pub head: CvsNumber,
    pub branch: Option<CvsNumber>,
    pub symbols: Vec<(Atom, CvsNumber)>,
    pub expand: ExpandMode,
    pub total_revisions: usize,
    pub skew_vulnerable: CvsTime,
}

/// The analysed form of one file's revision (spec §3: "CVS commit").
/// Lives from component D through component E; its `gitspace` back-link is
/// filled in once the owning changeset is built (spec §9: explicit
/// back-link instead of struct punning).
pub struct CvsCommitData {
    pub master: Arc<CvsMaster>,
    pub number: CvsNumber,
    pub log: Atom,
    pub author: Atom,
    pub commitid: Option<Atom>,
    /// A `Cell` because branch date-repair (spec §4.4 step 2) legitimately
    /// mutates a commit's date after construction.
    pub date: std::cell::Cell<CvsTime>,
    pub dead: bool,
    pub parent: RefCell<Option<CvsCommit>>,
    pub refcount: std::cell::Cell<u32>,
    pub tail: std::cell::Cell<bool>,
    pub tailed: std::cell::Cell<bool>,
    pub tagged: std::cell::Cell<bool>,
    pub gitspace: RefCell<Option<GitCommit>>,
    /// Blob serial assigned once this revision's text is materialised and
    /// staged (spec §4.5.6), used as its fast-import blob mark.
    pub serial: std::cell::Cell<u32>,
}

pub type CvsCommit = Arc<CvsCommitData>;

impl CvsCommitData {
    /// The file's full export path, as stored in the revdir trie.
    pub fn export_path(&self) -> String {
        if self.master.dir.full_path.is_empty() {
            self.master.export_name.as_str().to_string()
        } else {
            format!("{}/{}", self.master.dir.full_path, self.master.export_name.as_str())
        }
    }
}

/// A changeset synthesised by the cross-master merger (spec §3: "gitspace
/// commit").
pub struct GitCommitData {
    pub parent: RefCell<Option<GitCommit>>,
    pub log: Atom,
    pub author: Atom,
    pub commitid: Option<Atom>,
    pub date: CvsTime,
    pub revdir: RefCell<Option<crate::revdir::Revdir>>,
    pub tail: std::cell::Cell<bool>,
    pub tailed: std::cell::Cell<bool>,
    pub dead: std::cell::Cell<bool>,
    pub tagged: std::cell::Cell<bool>,
    pub serial: std::cell::Cell<u32>,
    pub refcount: std::cell::Cell<u32>,
}

pub type GitCommit = Arc<GitCommitData>;

/// A named branch reference (spec §3: "branch head (rev_ref)"). This
/// variant belongs to one master's per-file DAG (component D's output);
/// see [`crate::merge::GitBranch`] for the cross-master equivalent used
/// from component E onward (the two are kept distinct per §9).
pub struct BranchHeadData {
    pub name: RefCell<Option<Atom>>,
    pub commit: RefCell<Option<CvsCommit>>,
    pub number: RefCell<CvsNumber>,
    pub degree: std::cell::Cell<usize>,
    pub parent: RefCell<Option<BranchHead>>,
    pub tail: std::cell::Cell<bool>,
}

pub type BranchHead = Rc<BranchHeadData>;

pub fn new_branch_head(commit: Option<CvsCommit>, name: Option<Atom>, degree: usize) -> BranchHead {
    Rc::new(BranchHeadData {
        name: RefCell::new(name),
        commit: RefCell::new(commit),
        number: RefCell::new(CvsNumber::ZERO),
        degree: std::cell::Cell::new(degree),
        parent: RefCell::new(None),
        tail: std::cell::Cell::new(false),
    })
}

/// A symbolic tag (spec §3). Accumulates one CVS commit per master that
/// used the name, then resolves to a single gitspace commit in §4.5.4.
pub struct TagData {
    pub name: Atom,
    pub commits: RefCell<Vec<CvsCommit>>,
    pub target: RefCell<Option<GitCommit>>,
}

pub type Tag = Rc<TagData>;
