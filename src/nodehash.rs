//! Component B: node hash table (spec §4.2).
//!
//! Pairs each master's versions and patches into a single delta-tree
//! [`Node`] per revision number, keyed by revision number rather than by
//! the manual bucket-chaining the original uses (a `HashMap` already gives
//! us the "intern once, revisit many times" behaviour the original's
//! `NODE_HASH_SIZE`-bucket table provides by hand).

use std::collections::HashMap;
use std::rc::Rc;

use crate::cvsnumber::CvsNumber;
use crate::model::{CvsPatch, CvsVersion, Node, NodeRef};

/// Owns the per-master node table. Confined to the worker thread building
/// one master's DAG; discarded once component D has produced the file's
/// [`crate::model::CvsCommit`] chain.
#[derive(Default)]
pub struct NodeHash {
    table: HashMap<CvsNumber, NodeRef>,
    pub head_node: Option<NodeRef>,
}

impl NodeHash {
    pub fn new() -> Self {
        Self::default()
    }

    fn node_for(&mut self, number: CvsNumber) -> NodeRef {
        self.table.entry(number).or_insert_with(|| Node::new(number)).clone()
    }

    fn find_parent(&self, number: &CvsNumber, depth: usize) -> Option<NodeRef> {
        let key = number.truncated(depth);
        self.table.get(&key).cloned()
    }

    /// Intern a version onto the node list.
    pub fn hash_version(&mut self, v: &Rc<CvsVersion>, warnings: &crate::diagnostics::Warnings) {
        let node = self.node_for(v.number);
        if node.version.borrow().is_some() {
            crate::announce!(warnings, "more than one delta with number {}", v.number);
        } else {
            *node.version.borrow_mut() = Some(v.clone());
        }
        *v.node.borrow_mut() = Some(node.clone());
        if node.number.depth() % 2 == 1 {
            crate::announce!(warnings, "revision with odd depth ({})", v.number);
        }
    }

    /// Intern a patch onto the node list.
    pub fn hash_patch(&mut self, p: &Rc<CvsPatch>, warnings: &crate::diagnostics::Warnings) {
        let node = self.node_for(p.number);
        if node.patch.borrow().is_some() {
            crate::announce!(warnings, "more than one delta with number {}", p.number);
        } else {
            *node.patch.borrow_mut() = Some(p.clone());
        }
        *p.node.borrow_mut() = Some(node.clone());
        if node.number.depth() % 2 == 1 {
            crate::announce!(warnings, "patch with odd depth ({})", p.number);
        }
    }

    /// Intern a branch-attachment number onto the node list.
    pub fn hash_branch(&mut self, number: CvsNumber) -> NodeRef {
        self.node_for(number)
    }

    fn try_pair(&mut self, a: &NodeRef, b: &NodeRef) {
        let n = a.number.depth();
        if n == b.number.depth() {
            if n == 2 {
                *a.next.borrow_mut() = Some(b.clone());
                *b.to.borrow_mut() = Some(a.clone());
                return;
            }
            if a.number.same_branch(&b.number) {
                *a.next.borrow_mut() = Some(b.clone());
                *a.to.borrow_mut() = Some(b.clone());
                return;
            }
        } else if n == 2 {
            self.head_node = Some(a.clone());
        }
        if b.number.depth() % 2 == 0 {
            *b.starts.borrow_mut() = true;
            if let Some(p) = self.find_parent(&b.number, 1) {
                *p.next.borrow_mut() = Some(b.clone());
            }
        }
    }

    /// Build branch links (`down`/`sib`) across the whole node list, once
    /// every version and patch has been interned.
    pub fn build_branches(&mut self, warnings: &crate::diagnostics::Warnings) {
        if self.table.is_empty() {
            return;
        }
        let mut nodes: Vec<NodeRef> = self.table.values().cloned().collect();
        nodes.sort_by(|a, b| a.number.cmp(&b.number));

        if nodes.last().unwrap().number.depth() == 2 {
            self.head_node = Some(nodes.last().unwrap().clone());
        }

        for i in (0..nodes.len() - 1).rev() {
            let (a, b) = (nodes[i].clone(), nodes[i + 1].clone());
            self.try_pair(&a, &b);
        }

        for a in nodes.iter().rev() {
            if !*a.starts.borrow() {
                continue;
            }
            match self.find_parent(&a.number, 2) {
                Some(b) => {
                    *a.sib.borrow_mut() = b.down.borrow().clone();
                    *b.down.borrow_mut() = Some(a.clone());
                }
                None => {
                    crate::announce!(warnings, "no parent for {}", a.number);
                }
            }
        }
    }

    /// Find the file version that `cvs_number` would resolve to: the
    /// lowest version on the same branch that is still greater than `number`.
    pub fn find_version(
        versions: &[Rc<CvsVersion>],
        number: &CvsNumber,
    ) -> Option<NodeRef> {
        let mut best: Option<&Rc<CvsVersion>> = None;
        for v in versions {
            if v.number.same_branch(number)
                && v.number > *number
                && best.map(|b| b.number > v.number).unwrap_or(true)
            {
                best = Some(v);
            }
        }
        best.and_then(|v| v.node.borrow().clone())
    }
}
