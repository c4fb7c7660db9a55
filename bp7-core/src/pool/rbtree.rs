//! Red-black tree used for the cache's secondary indices: bundle-id, time,
//! destination, and pending-DACS lookups, plus the pool's blocktype registry.
//!
//! The tree owns its nodes in a slab and hands out stable [`NodeHandle`]s;
//! an entry that participates in an index keeps the handle, mirroring an
//! embedded link. Duplicate keys are permitted and tie-broken by insertion
//! order; `insert_unique` refuses them instead.

use crate::error::{BpError, BpResult};
use std::cmp::Ordering;

/// Handle to a node owned by an [`RbTree`]. Index 0 is the nil sentinel, so
/// a zero handle means "not in any tree".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeHandle(u32);

impl NodeHandle {
    pub const NIL: NodeHandle = NodeHandle(0);

    pub fn is_nil(self) -> bool {
        self.0 == 0
    }
}

const NIL: u32 = 0;

#[derive(Debug)]
struct Node<K, V> {
    /// `None` for the sentinel and for freed slots.
    entry: Option<(K, V)>,
    serial: u64,
    parent: u32,
    left: u32,
    right: u32,
    red: bool,
}

impl<K, V> Node<K, V> {
    fn vacant() -> Self {
        Node {
            entry: None,
            serial: 0,
            parent: NIL,
            left: NIL,
            right: NIL,
            red: false,
        }
    }
}

#[derive(Debug)]
pub struct RbTree<K, V> {
    nodes: Vec<Node<K, V>>,
    free: Vec<u32>,
    root: u32,
    len: usize,
    next_serial: u64,
}

impl<K: Ord + Copy, V> Default for RbTree<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord + Copy, V> RbTree<K, V> {
    pub fn new() -> Self {
        Self {
            nodes: vec![Node::vacant()],
            free: Vec::new(),
            root: NIL,
            len: 0,
            next_serial: 1,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn key_of(&self, n: u32) -> K {
        self.nodes[n as usize].entry.as_ref().map(|(k, _)| *k).unwrap()
    }

    /// Total order: key first, insertion serial as the tiebreaker.
    fn cmp_node(&self, key: K, serial: u64, n: u32) -> Ordering {
        match key.cmp(&self.key_of(n)) {
            Ordering::Equal => serial.cmp(&self.nodes[n as usize].serial),
            other => other,
        }
    }

    fn alloc_node(&mut self, key: K, value: V) -> u32 {
        let serial = self.next_serial;
        self.next_serial += 1;
        let node = Node {
            entry: Some((key, value)),
            serial,
            parent: NIL,
            left: NIL,
            right: NIL,
            red: true,
        };
        if let Some(idx) = self.free.pop() {
            self.nodes[idx as usize] = node;
            idx
        } else {
            self.nodes.push(node);
            (self.nodes.len() - 1) as u32
        }
    }

    /// Inserts `key`, allowing duplicates; equal keys order by insertion.
    pub fn insert(&mut self, key: K, value: V) -> NodeHandle {
        let n = self.alloc_node(key, value);
        let serial = self.nodes[n as usize].serial;

        let mut parent = NIL;
        let mut cur = self.root;
        while cur != NIL {
            parent = cur;
            cur = if self.cmp_node(key, serial, cur) == Ordering::Less {
                self.nodes[cur as usize].left
            } else {
                self.nodes[cur as usize].right
            };
        }
        self.nodes[n as usize].parent = parent;
        if parent == NIL {
            self.root = n;
        } else if self.cmp_node(key, serial, parent) == Ordering::Less {
            self.nodes[parent as usize].left = n;
        } else {
            self.nodes[parent as usize].right = n;
        }
        self.insert_fixup(n);
        self.len += 1;
        NodeHandle(n)
    }

    /// Inserts `key` only if no node with an equal key exists.
    pub fn insert_unique(&mut self, key: K, value: V) -> BpResult<NodeHandle> {
        if self.find(key).is_some() {
            return Err(BpError::Duplicate);
        }
        Ok(self.insert(key, value))
    }

    /// Finds any node with an exactly equal key.
    pub fn find(&self, key: K) -> Option<NodeHandle> {
        let mut cur = self.root;
        while cur != NIL {
            match key.cmp(&self.key_of(cur)) {
                Ordering::Less => cur = self.nodes[cur as usize].left,
                Ordering::Greater => cur = self.nodes[cur as usize].right,
                Ordering::Equal => return Some(NodeHandle(cur)),
            }
        }
        None
    }

    /// Smallest node whose key is `>= key` (ascending scan entry point).
    pub fn lower_bound(&self, key: K) -> Option<NodeHandle> {
        let mut cur = self.root;
        let mut best = NIL;
        while cur != NIL {
            if self.key_of(cur) >= key {
                best = cur;
                cur = self.nodes[cur as usize].left;
            } else {
                cur = self.nodes[cur as usize].right;
            }
        }
        (best != NIL).then_some(NodeHandle(best))
    }

    /// Largest node whose key is `<= key` (descending scan entry point).
    pub fn upper_bound(&self, key: K) -> Option<NodeHandle> {
        let mut cur = self.root;
        let mut best = NIL;
        while cur != NIL {
            if self.key_of(cur) <= key {
                best = cur;
                cur = self.nodes[cur as usize].right;
            } else {
                cur = self.nodes[cur as usize].left;
            }
        }
        (best != NIL).then_some(NodeHandle(best))
    }

    pub fn first(&self) -> Option<NodeHandle> {
        (self.root != NIL).then(|| NodeHandle(self.subtree_min(self.root)))
    }

    pub fn last(&self) -> Option<NodeHandle> {
        let mut cur = self.root;
        if cur == NIL {
            return None;
        }
        while self.nodes[cur as usize].right != NIL {
            cur = self.nodes[cur as usize].right;
        }
        Some(NodeHandle(cur))
    }

    /// In-order successor.
    pub fn next(&self, h: NodeHandle) -> Option<NodeHandle> {
        let mut cur = h.0;
        if self.nodes[cur as usize].right != NIL {
            return Some(NodeHandle(self.subtree_min(self.nodes[cur as usize].right)));
        }
        let mut parent = self.nodes[cur as usize].parent;
        while parent != NIL && self.nodes[parent as usize].right == cur {
            cur = parent;
            parent = self.nodes[cur as usize].parent;
        }
        (parent != NIL).then_some(NodeHandle(parent))
    }

    /// In-order predecessor.
    pub fn prev(&self, h: NodeHandle) -> Option<NodeHandle> {
        let mut cur = h.0;
        if self.nodes[cur as usize].left != NIL {
            let mut m = self.nodes[cur as usize].left;
            while self.nodes[m as usize].right != NIL {
                m = self.nodes[m as usize].right;
            }
            return Some(NodeHandle(m));
        }
        let mut parent = self.nodes[cur as usize].parent;
        while parent != NIL && self.nodes[parent as usize].left == cur {
            cur = parent;
            parent = self.nodes[cur as usize].parent;
        }
        (parent != NIL).then_some(NodeHandle(parent))
    }

    pub fn key(&self, h: NodeHandle) -> K {
        self.key_of(h.0)
    }

    pub fn value(&self, h: NodeHandle) -> &V {
        self.nodes[h.0 as usize].entry.as_ref().map(|(_, v)| v).unwrap()
    }

    pub fn value_mut(&mut self, h: NodeHandle) -> &mut V {
        self.nodes[h.0 as usize].entry.as_mut().map(|(_, v)| v).unwrap()
    }

    /// Tests membership by traversing parents to the root, the same check the
    /// driver uses before extracting a possibly stale handle.
    pub fn is_member(&self, h: NodeHandle) -> bool {
        if h.is_nil()
            || h.0 as usize >= self.nodes.len()
            || self.nodes[h.0 as usize].entry.is_none()
        {
            return false;
        }
        let mut cur = h.0;
        while self.nodes[cur as usize].parent != NIL {
            cur = self.nodes[cur as usize].parent;
        }
        cur == self.root
    }

    /// Removes the node and returns its key/value. The handle is dead after.
    pub fn extract(&mut self, h: NodeHandle) -> (K, V) {
        let z = h.0;
        debug_assert!(self.nodes[z as usize].entry.is_some());

        let mut y = z;
        let mut y_was_red = self.nodes[y as usize].red;
        let x;
        if self.nodes[z as usize].left == NIL {
            x = self.nodes[z as usize].right;
            self.transplant(z, x);
        } else if self.nodes[z as usize].right == NIL {
            x = self.nodes[z as usize].left;
            self.transplant(z, x);
        } else {
            y = self.subtree_min(self.nodes[z as usize].right);
            y_was_red = self.nodes[y as usize].red;
            x = self.nodes[y as usize].right;
            if self.nodes[y as usize].parent == z {
                // x may be the sentinel; its parent field is scratch space
                // for the fixup walk.
                self.nodes[x as usize].parent = y;
            } else {
                self.transplant(y, x);
                let zr = self.nodes[z as usize].right;
                self.nodes[y as usize].right = zr;
                self.nodes[zr as usize].parent = y;
            }
            self.transplant(z, y);
            let zl = self.nodes[z as usize].left;
            self.nodes[y as usize].left = zl;
            self.nodes[zl as usize].parent = y;
            self.nodes[y as usize].red = self.nodes[z as usize].red;
        }
        if !y_was_red {
            self.extract_fixup(x);
        }

        self.len -= 1;
        let node = std::mem::replace(&mut self.nodes[z as usize], Node::vacant());
        self.free.push(z);
        // Keep the sentinel pristine for the next operation.
        self.nodes[NIL as usize].parent = NIL;
        self.nodes[NIL as usize].red = false;
        node.entry.unwrap()
    }

    fn subtree_min(&self, mut cur: u32) -> u32 {
        while self.nodes[cur as usize].left != NIL {
            cur = self.nodes[cur as usize].left;
        }
        cur
    }

    fn transplant(&mut self, u: u32, v: u32) {
        let up = self.nodes[u as usize].parent;
        if up == NIL {
            self.root = v;
        } else if self.nodes[up as usize].left == u {
            self.nodes[up as usize].left = v;
        } else {
            self.nodes[up as usize].right = v;
        }
        self.nodes[v as usize].parent = up;
    }

    fn rotate_left(&mut self, x: u32) {
        let y = self.nodes[x as usize].right;
        let yl = self.nodes[y as usize].left;
        self.nodes[x as usize].right = yl;
        if yl != NIL {
            self.nodes[yl as usize].parent = x;
        }
        let xp = self.nodes[x as usize].parent;
        self.nodes[y as usize].parent = xp;
        if xp == NIL {
            self.root = y;
        } else if self.nodes[xp as usize].left == x {
            self.nodes[xp as usize].left = y;
        } else {
            self.nodes[xp as usize].right = y;
        }
        self.nodes[y as usize].left = x;
        self.nodes[x as usize].parent = y;
    }

    fn rotate_right(&mut self, x: u32) {
        let y = self.nodes[x as usize].left;
        let yr = self.nodes[y as usize].right;
        self.nodes[x as usize].left = yr;
        if yr != NIL {
            self.nodes[yr as usize].parent = x;
        }
        let xp = self.nodes[x as usize].parent;
        self.nodes[y as usize].parent = xp;
        if xp == NIL {
            self.root = y;
        } else if self.nodes[xp as usize].right == x {
            self.nodes[xp as usize].right = y;
        } else {
            self.nodes[xp as usize].left = y;
        }
        self.nodes[y as usize].right = x;
        self.nodes[x as usize].parent = y;
    }

    fn insert_fixup(&mut self, mut z: u32) {
        while {
            let p = self.nodes[z as usize].parent;
            p != NIL && self.nodes[p as usize].red
        } {
            let p = self.nodes[z as usize].parent;
            let g = self.nodes[p as usize].parent;
            if p == self.nodes[g as usize].left {
                let u = self.nodes[g as usize].right;
                if u != NIL && self.nodes[u as usize].red {
                    self.nodes[p as usize].red = false;
                    self.nodes[u as usize].red = false;
                    self.nodes[g as usize].red = true;
                    z = g;
                } else {
                    if z == self.nodes[p as usize].right {
                        z = p;
                        self.rotate_left(z);
                    }
                    let p = self.nodes[z as usize].parent;
                    let g = self.nodes[p as usize].parent;
                    self.nodes[p as usize].red = false;
                    self.nodes[g as usize].red = true;
                    self.rotate_right(g);
                }
            } else {
                let u = self.nodes[g as usize].left;
                if u != NIL && self.nodes[u as usize].red {
                    self.nodes[p as usize].red = false;
                    self.nodes[u as usize].red = false;
                    self.nodes[g as usize].red = true;
                    z = g;
                } else {
                    if z == self.nodes[p as usize].left {
                        z = p;
                        self.rotate_right(z);
                    }
                    let p = self.nodes[z as usize].parent;
                    let g = self.nodes[p as usize].parent;
                    self.nodes[p as usize].red = false;
                    self.nodes[g as usize].red = true;
                    self.rotate_left(g);
                }
            }
        }
        let r = self.root;
        self.nodes[r as usize].red = false;
    }

    fn extract_fixup(&mut self, mut x: u32) {
        while x != self.root && !self.nodes[x as usize].red {
            let p = self.nodes[x as usize].parent;
            if x == self.nodes[p as usize].left {
                let mut w = self.nodes[p as usize].right;
                if self.nodes[w as usize].red {
                    self.nodes[w as usize].red = false;
                    self.nodes[p as usize].red = true;
                    self.rotate_left(p);
                    w = self.nodes[self.nodes[x as usize].parent as usize].right;
                }
                let wl = self.nodes[w as usize].left;
                let wr = self.nodes[w as usize].right;
                let wl_red = wl != NIL && self.nodes[wl as usize].red;
                let wr_red = wr != NIL && self.nodes[wr as usize].red;
                if !wl_red && !wr_red {
                    self.nodes[w as usize].red = true;
                    x = self.nodes[x as usize].parent;
                } else {
                    if !wr_red {
                        if wl != NIL {
                            self.nodes[wl as usize].red = false;
                        }
                        self.nodes[w as usize].red = true;
                        self.rotate_right(w);
                        w = self.nodes[self.nodes[x as usize].parent as usize].right;
                    }
                    let p = self.nodes[x as usize].parent;
                    self.nodes[w as usize].red = self.nodes[p as usize].red;
                    self.nodes[p as usize].red = false;
                    let wr = self.nodes[w as usize].right;
                    if wr != NIL {
                        self.nodes[wr as usize].red = false;
                    }
                    self.rotate_left(p);
                    x = self.root;
                }
            } else {
                let mut w = self.nodes[p as usize].left;
                if self.nodes[w as usize].red {
                    self.nodes[w as usize].red = false;
                    self.nodes[p as usize].red = true;
                    self.rotate_right(p);
                    w = self.nodes[self.nodes[x as usize].parent as usize].left;
                }
                let wl = self.nodes[w as usize].left;
                let wr = self.nodes[w as usize].right;
                let wl_red = wl != NIL && self.nodes[wl as usize].red;
                let wr_red = wr != NIL && self.nodes[wr as usize].red;
                if !wl_red && !wr_red {
                    self.nodes[w as usize].red = true;
                    x = self.nodes[x as usize].parent;
                } else {
                    if !wl_red {
                        if wr != NIL {
                            self.nodes[wr as usize].red = false;
                        }
                        self.nodes[w as usize].red = true;
                        self.rotate_left(w);
                        w = self.nodes[self.nodes[x as usize].parent as usize].left;
                    }
                    let p = self.nodes[x as usize].parent;
                    self.nodes[w as usize].red = self.nodes[p as usize].red;
                    self.nodes[p as usize].red = false;
                    let wl = self.nodes[w as usize].left;
                    if wl != NIL {
                        self.nodes[wl as usize].red = false;
                    }
                    self.rotate_right(p);
                    x = self.root;
                }
            }
        }
        self.nodes[x as usize].red = false;
    }

    /// Validates the red-black invariants; returns the black height.
    /// Test support.
    #[doc(hidden)]
    pub fn check_invariants(&self) -> usize {
        assert!(self.root == NIL || !self.nodes[self.root as usize].red, "red root");
        self.check_subtree(self.root)
    }

    fn check_subtree(&self, n: u32) -> usize {
        if n == NIL {
            return 1;
        }
        let node = &self.nodes[n as usize];
        if node.red {
            for child in [node.left, node.right] {
                assert!(
                    child == NIL || !self.nodes[child as usize].red,
                    "red-red parent-child edge"
                );
            }
        }
        let lh = self.check_subtree(node.left);
        let rh = self.check_subtree(node.right);
        assert_eq!(lh, rh, "black-height mismatch");
        lh + usize::from(!node.red)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect_keys(tree: &RbTree<u64, u32>) -> Vec<u64> {
        let mut out = Vec::new();
        let mut cur = tree.first();
        while let Some(h) = cur {
            out.push(tree.key(h));
            cur = tree.next(h);
        }
        out
    }

    #[test]
    fn in_order_iteration_is_sorted() {
        let mut tree = RbTree::new();
        for k in [41u64, 38, 31, 12, 19, 8, 5, 27, 99, 0, 63] {
            tree.insert(k, k as u32);
            tree.check_invariants();
        }
        let keys = collect_keys(&tree);
        let mut sorted = keys.clone();
        sorted.sort_unstable();
        assert_eq!(keys, sorted);
        assert_eq!(tree.len(), 11);
    }

    #[test]
    fn duplicate_keys_preserve_insertion_order() {
        let mut tree = RbTree::new();
        let a = tree.insert(5u64, 1u32);
        let b = tree.insert(5, 2);
        let c = tree.insert(5, 3);
        tree.insert(1, 0);
        let mut h = tree.lower_bound(5).unwrap();
        assert_eq!(*tree.value(h), 1);
        h = tree.next(h).unwrap();
        assert_eq!(*tree.value(h), 2);
        h = tree.next(h).unwrap();
        assert_eq!(*tree.value(h), 3);
        assert!(tree.next(h).is_none());
        let _ = (a, b, c);
    }

    #[test]
    fn insert_unique_rejects_collisions() {
        let mut tree = RbTree::new();
        tree.insert_unique(7u64, 1u32).unwrap();
        assert_eq!(tree.insert_unique(7, 2), Err(BpError::Duplicate));
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn bounds() {
        let mut tree = RbTree::new();
        for k in [10u64, 20, 30] {
            tree.insert(k, 0u32);
        }
        assert_eq!(tree.key(tree.lower_bound(15).unwrap()), 20);
        assert_eq!(tree.key(tree.lower_bound(20).unwrap()), 20);
        assert!(tree.lower_bound(31).is_none());
        assert_eq!(tree.key(tree.upper_bound(25).unwrap()), 20);
        assert_eq!(tree.key(tree.upper_bound(10).unwrap()), 10);
        assert!(tree.upper_bound(9).is_none());
    }

    #[test]
    fn extract_keeps_invariants() {
        let mut tree = RbTree::new();
        let handles: Vec<_> = (0u64..64).map(|k| tree.insert(k % 16, k as u32)).collect();
        tree.check_invariants();
        // Remove in a scrambled order.
        for (i, h) in handles.into_iter().enumerate() {
            if i % 3 == 0 {
                continue;
            }
            assert!(tree.is_member(h));
            tree.extract(h);
            tree.check_invariants();
        }
        let keys = collect_keys(&tree);
        let mut sorted = keys.clone();
        sorted.sort_unstable();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn member_check_detects_extraction() {
        let mut tree = RbTree::new();
        let h = tree.insert(3u64, 9u32);
        assert!(tree.is_member(h));
        assert_eq!(tree.extract(h), (3, 9));
        assert!(!tree.is_member(h));
        assert!(tree.is_empty());
    }

    #[test]
    fn slab_reuse_after_extract() {
        let mut tree = RbTree::new();
        let h1 = tree.insert(1u64, 1u32);
        tree.extract(h1);
        let h2 = tree.insert(2, 2);
        assert!(tree.is_member(h2));
        assert_eq!(tree.key(h2), 2);
        assert_eq!(tree.len(), 1);
    }
}
