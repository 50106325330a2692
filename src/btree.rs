//! Arena-indexed B+-tree secondary index.
//!
//! Nodes live in one `Vec<BPNode>`; every link (parent→child, leaf→next,
//! tree→root/head) is a plain `usize` index into that arena rather than a
//! raw pointer or `Rc<RefCell<_>>`. This keeps every traversal — search,
//! insert, delete, serialization — an ordinary iterative walk.

use std::cmp::Ordering;
use std::path::PathBuf;

use crate::codec::{Reader, Writer};
use crate::errors::{DbError, Result};
use crate::field::FieldValue;
use crate::fs as dbfs;

#[derive(Debug, Clone)]
struct BPNode {
    is_leaf: bool,
    keys: Vec<FieldValue>,
    children: Vec<usize>,
    values: Vec<i64>,
    next: Option<usize>,
}

impl BPNode {
    fn new_leaf() -> Self {
        BPNode { is_leaf: true, keys: Vec::new(), children: Vec::new(), values: Vec::new(), next: None }
    }

    fn new_internal() -> Self {
        BPNode { is_leaf: false, keys: Vec::new(), children: Vec::new(), values: Vec::new(), next: None }
    }
}

/// Ordered key -> primary-key secondary index for one table column.
#[derive(Debug, Clone)]
pub struct BPTree {
    pub name: String,
    pub path: Option<PathBuf>,
    domain: usize,
    nodes: Vec<BPNode>,
    root: usize,
    head: usize,
}

impl BPTree {
    pub fn new(name: impl Into<String>, domain: usize) -> Self {
        let root = BPNode::new_leaf();
        BPTree {
            name: name.into(),
            path: None,
            domain,
            nodes: vec![root],
            root: 0,
            head: 0,
        }
    }

    fn max_keys(&self) -> usize {
        2 * self.domain - 1
    }

    fn min_keys(&self) -> usize {
        self.domain - 1
    }

    fn is_leaf(&self, idx: usize) -> bool {
        self.nodes[idx].is_leaf
    }

    fn key_count(&self, idx: usize) -> usize {
        self.nodes[idx].keys.len()
    }

    fn is_full(&self, idx: usize) -> bool {
        self.key_count(idx) >= self.max_keys()
    }

    fn free_slots(&self, idx: usize) -> usize {
        self.max_keys().saturating_sub(self.key_count(idx))
    }

    fn alloc(&mut self, node: BPNode) -> usize {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    /// Last index i such that keys[i] <= key, defaulting to 0.
    fn find_child_index(&self, node_idx: usize, key: &FieldValue) -> usize {
        let keys = &self.nodes[node_idx].keys;
        let mut idx = 0;
        for i in 0..keys.len() {
            if keys[i].cmp_value(key) != Ordering::Greater {
                idx = i;
            } else {
                break;
            }
        }
        idx
    }

    fn find_leaf_for_key(&self, key: &FieldValue) -> usize {
        let mut cur = self.root;
        while !self.is_leaf(cur) {
            let idx = self.find_child_index(cur, key);
            cur = self.nodes[cur].children[idx];
        }
        cur
    }

    // ---- insert --------------------------------------------------------

    pub fn insert(&mut self, key: FieldValue, value: i64) {
        if self.is_full(self.root) {
            self.split_root();
        }
        let mut cur = self.root;
        loop {
            if self.is_leaf(cur) {
                self.leaf_insert(cur, key, value);
                return;
            }
            let mut idx = self.find_child_index(cur, &key);
            if key.cmp_value(&self.nodes[cur].keys[idx]) == Ordering::Less {
                self.nodes[cur].keys[idx] = key.clone();
            }
            let child = self.nodes[cur].children[idx];
            if self.is_full(child) {
                if !self.try_rotate_before_insert(cur, idx) {
                    self.split_child(cur, idx);
                    idx = self.find_child_index(cur, &key);
                    if key.cmp_value(&self.nodes[cur].keys[idx]) == Ordering::Less {
                        self.nodes[cur].keys[idx] = key.clone();
                    }
                }
            }
            cur = self.nodes[cur].children[idx];
        }
    }

    fn leaf_insert(&mut self, leaf: usize, key: FieldValue, value: i64) {
        let node = &mut self.nodes[leaf];
        let pos = node
            .keys
            .iter()
            .position(|k| k.cmp_value(&key) == Ordering::Greater)
            .unwrap_or(node.keys.len());
        node.keys.insert(pos, key);
        node.values.insert(pos, value);
    }

    fn split_root(&mut self) {
        debug!("{}: root full, growing tree by one level", self.name);
        let old_root = self.root;
        let min_key = self.nodes[old_root].keys.first().cloned();
        let mut new_root = BPNode::new_internal();
        new_root.children.push(old_root);
        new_root.keys.push(min_key.unwrap_or(FieldValue::Null));
        let new_root_idx = self.alloc(new_root);
        self.root = new_root_idx;
        self.split_child(new_root_idx, 0);
    }

    fn split_child(&mut self, parent: usize, child_pos: usize) {
        let child = self.nodes[parent].children[child_pos];
        if self.is_leaf(child) {
            self.split_leaf(parent, child_pos, child);
        } else {
            self.split_internal(parent, child_pos, child);
        }
    }

    fn split_leaf(&mut self, parent: usize, child_pos: usize, child: usize) {
        trace!("{}: splitting leaf {} at domain {}", self.name, child, self.domain);
        let mid = self.domain;
        let right_keys = self.nodes[child].keys.split_off(mid);
        let right_values = self.nodes[child].values.split_off(mid);
        let right_next = self.nodes[child].next;
        let mut right = BPNode::new_leaf();
        right.keys = right_keys;
        right.values = right_values;
        right.next = right_next;
        let right_idx = self.alloc(right);
        self.nodes[child].next = Some(right_idx);

        let sep = self.nodes[right_idx].keys[0].clone();
        self.nodes[parent].keys.insert(child_pos + 1, sep);
        self.nodes[parent].children.insert(child_pos + 1, right_idx);
    }

    fn split_internal(&mut self, parent: usize, child_pos: usize, child: usize) {
        trace!("{}: splitting internal node {} at domain {}", self.name, child, self.domain);
        let mid = self.domain;
        let right_keys = self.nodes[child].keys.split_off(mid);
        let right_children = self.nodes[child].children.split_off(mid);
        let mut right = BPNode::new_internal();
        right.keys = right_keys;
        right.children = right_children;
        let right_idx = self.alloc(right);

        let sep = self.nodes[right_idx].keys[0].clone();
        self.nodes[parent].keys.insert(child_pos + 1, sep);
        self.nodes[parent].children.insert(child_pos + 1, right_idx);
    }

    /// Moves one (key, child[, value]) tuple into a sibling with >= 2
    /// free slots, preferring the left sibling. Requiring two free slots
    /// (not one) keeps the receiving sibling from immediately overflowing
    /// again, which would otherwise oscillate between rotate and split.
    fn try_rotate_before_insert(&mut self, parent: usize, child_pos: usize) -> bool {
        if child_pos > 0 {
            let left = self.nodes[parent].children[child_pos - 1];
            if self.free_slots(left) >= 2 {
                self.rotate_into_left(parent, child_pos - 1, child_pos);
                return true;
            }
        }
        if child_pos + 1 < self.nodes[parent].children.len() {
            let right = self.nodes[parent].children[child_pos + 1];
            if self.free_slots(right) >= 2 {
                self.rotate_into_right(parent, child_pos, child_pos + 1);
                return true;
            }
        }
        false
    }

    fn rotate_into_left(&mut self, parent: usize, left_pos: usize, full_pos: usize) {
        trace!("{}: rotating into left sibling to avoid split", self.name);
        let left = self.nodes[parent].children[left_pos];
        let full = self.nodes[parent].children[full_pos];
        if self.is_leaf(full) {
            let key = self.nodes[full].keys.remove(0);
            let value = self.nodes[full].values.remove(0);
            self.nodes[left].keys.push(key);
            self.nodes[left].values.push(value);
        } else {
            let key = self.nodes[full].keys.remove(0);
            let child = self.nodes[full].children.remove(0);
            self.nodes[left].keys.push(key);
            self.nodes[left].children.push(child);
        }
        self.nodes[parent].keys[full_pos] = self.nodes[full].keys[0].clone();
    }

    fn rotate_into_right(&mut self, parent: usize, full_pos: usize, right_pos: usize) {
        trace!("{}: rotating into right sibling to avoid split", self.name);
        let full = self.nodes[parent].children[full_pos];
        let right = self.nodes[parent].children[right_pos];
        if self.is_leaf(full) {
            let key = self.nodes[full].keys.pop().unwrap();
            let value = self.nodes[full].values.pop().unwrap();
            self.nodes[right].keys.insert(0, key.clone());
            self.nodes[right].values.insert(0, value);
            self.nodes[parent].keys[right_pos] = key;
        } else {
            let key = self.nodes[full].keys.pop().unwrap();
            let child = self.nodes[full].children.pop().unwrap();
            self.nodes[right].keys.insert(0, key.clone());
            self.nodes[right].children.insert(0, child);
            self.nodes[parent].keys[right_pos] = key;
        }
    }

    // ---- delete ---------------------------------------------------------

    pub fn delete(&mut self, key: &FieldValue) -> Result<()> {
        let mut path: Vec<(usize, usize)> = Vec::new();
        let mut cur = self.root;
        loop {
            if self.is_leaf(cur) {
                let pos = self.nodes[cur]
                    .keys
                    .iter()
                    .position(|k| k.cmp_value(key) == Ordering::Equal)
                    .ok_or_else(|| DbError::NotFound(format!("{}: key not in index", self.name)))?;
                self.nodes[cur].keys.remove(pos);
                self.nodes[cur].values.remove(pos);
                break;
            }
            let idx = self.find_child_index(cur, key);
            let child = self.nodes[cur].children[idx];
            let resolved_idx = if self.key_count(child) <= self.min_keys() {
                self.fix_underflow(cur, idx)
            } else {
                idx
            };
            path.push((cur, resolved_idx));
            cur = self.nodes[cur].children[resolved_idx];
        }

        for (node_idx, child_pos) in path.into_iter().rev() {
            let child_idx = self.nodes[node_idx].children[child_pos];
            if let Some(new_min) = self.nodes[child_idx].keys.first().cloned() {
                self.nodes[node_idx].keys[child_pos] = new_min;
            }
        }

        while !self.is_leaf(self.root) && self.nodes[self.root].children.len() == 1 {
            self.root = self.nodes[self.root].children[0];
        }
        Ok(())
    }

    /// Ensures `children[child_pos]` holds more than the minimum key
    /// count before the caller descends into it, by de-rotation (borrow
    /// from a sibling with spare keys) or, failing that, merge. Returns
    /// the child's position after the operation (merging with the left
    /// sibling shifts it left by one).
    fn fix_underflow(&mut self, parent: usize, child_pos: usize) -> usize {
        if child_pos > 0 {
            let left = self.nodes[parent].children[child_pos - 1];
            if self.key_count(left) > self.min_keys() {
                self.de_rotate_from_left(parent, child_pos - 1, child_pos);
                return child_pos;
            }
        }
        if child_pos + 1 < self.nodes[parent].children.len() {
            let right = self.nodes[parent].children[child_pos + 1];
            if self.key_count(right) > self.min_keys() {
                self.de_rotate_from_right(parent, child_pos, child_pos + 1);
                return child_pos;
            }
        }
        if child_pos > 0 {
            self.merge(parent, child_pos - 1, child_pos);
            child_pos - 1
        } else {
            self.merge(parent, child_pos, child_pos + 1);
            child_pos
        }
    }

    /// Moves exactly one (key, child[, value]) tuple — never the key
    /// alone — from the left sibling's end to the underflowing right
    /// child's front.
    fn de_rotate_from_left(&mut self, parent: usize, left_pos: usize, right_pos: usize) {
        trace!("{}: borrowing from left sibling to fix underflow", self.name);
        let left = self.nodes[parent].children[left_pos];
        let right = self.nodes[parent].children[right_pos];
        if self.is_leaf(right) {
            let key = self.nodes[left].keys.pop().unwrap();
            let value = self.nodes[left].values.pop().unwrap();
            self.nodes[right].keys.insert(0, key);
            self.nodes[right].values.insert(0, value);
        } else {
            let key = self.nodes[left].keys.pop().unwrap();
            let child = self.nodes[left].children.pop().unwrap();
            self.nodes[right].keys.insert(0, key);
            self.nodes[right].children.insert(0, child);
        }
        self.nodes[parent].keys[right_pos] = self.nodes[right].keys[0].clone();
    }

    /// Moves one tuple from the right sibling's front to the
    /// underflowing left child's end.
    fn de_rotate_from_right(&mut self, parent: usize, left_pos: usize, right_pos: usize) {
        trace!("{}: borrowing from right sibling to fix underflow", self.name);
        let left = self.nodes[parent].children[left_pos];
        let right = self.nodes[parent].children[right_pos];
        if self.is_leaf(left) {
            let key = self.nodes[right].keys.remove(0);
            let value = self.nodes[right].values.remove(0);
            self.nodes[left].keys.push(key);
            self.nodes[left].values.push(value);
        } else {
            let key = self.nodes[right].keys.remove(0);
            let child = self.nodes[right].children.remove(0);
            self.nodes[left].keys.push(key);
            self.nodes[left].children.push(child);
        }
        self.nodes[parent].keys[right_pos] = self.nodes[right].keys.first().cloned().unwrap_or(FieldValue::Null);
    }

    /// Merges `children[right_pos]` into `children[left_pos]` and drops
    /// the right entry from the parent. The vacated arena slot is left
    /// in place (never reused) — this tree never shrinks its arena.
    fn merge(&mut self, parent: usize, left_pos: usize, right_pos: usize) {
        debug!("{}: merging underflowing node into its sibling", self.name);
        let left = self.nodes[parent].children[left_pos];
        let right = self.nodes[parent].children[right_pos];
        if self.is_leaf(left) {
            let right_keys = std::mem::take(&mut self.nodes[right].keys);
            let right_values = std::mem::take(&mut self.nodes[right].values);
            let right_next = self.nodes[right].next;
            self.nodes[left].keys.extend(right_keys);
            self.nodes[left].values.extend(right_values);
            self.nodes[left].next = right_next;
        } else {
            let right_keys = std::mem::take(&mut self.nodes[right].keys);
            let right_children = std::mem::take(&mut self.nodes[right].children);
            self.nodes[left].keys.extend(right_keys);
            self.nodes[left].children.extend(right_children);
        }
        self.nodes[parent].children.remove(right_pos);
        self.nodes[parent].keys.remove(right_pos);
    }

    // ---- queries --------------------------------------------------------

    pub fn get_data(&self, key: &FieldValue) -> Option<i64> {
        let leaf = self.find_leaf_for_key(key);
        let node = &self.nodes[leaf];
        node.keys
            .iter()
            .position(|k| k.cmp_value(key) == Ordering::Equal)
            .map(|pos| node.values[pos])
    }

    pub fn get_key(&self, value: i64) -> Option<FieldValue> {
        self.traversal().into_iter().find(|(_, v)| *v == value).map(|(k, _)| k)
    }

    pub fn get_range(
        &self,
        left: Option<&FieldValue>,
        left_eq: bool,
        right: Option<&FieldValue>,
        right_eq: bool,
    ) -> Vec<(FieldValue, i64)> {
        let mut out = Vec::new();
        let mut leaf = match left {
            Some(k) => self.find_leaf_for_key(k),
            None => self.head,
        };
        loop {
            let node = &self.nodes[leaf];
            for (k, v) in node.keys.iter().zip(node.values.iter()) {
                if let Some(lo) = left {
                    let c = k.cmp_value(lo);
                    if c == Ordering::Less || (c == Ordering::Equal && !left_eq) {
                        continue;
                    }
                }
                if let Some(hi) = right {
                    let c = k.cmp_value(hi);
                    if c == Ordering::Greater || (c == Ordering::Equal && !right_eq) {
                        return out;
                    }
                }
                out.push((k.clone(), *v));
            }
            match node.next {
                Some(next) => leaf = next,
                None => break,
            }
        }
        out
    }

    pub fn traversal(&self) -> Vec<(FieldValue, i64)> {
        self.get_range(None, true, None, true)
    }

    pub fn leaf_count(&self) -> usize {
        let mut count = 0;
        let mut cur = Some(self.head);
        while let Some(idx) = cur {
            count += 1;
            cur = self.nodes[idx].next;
        }
        count
    }

    pub fn update_item(&mut self, key: &FieldValue, new_value: i64) -> Result<()> {
        let leaf = self.find_leaf_for_key(key);
        let node = &mut self.nodes[leaf];
        let pos = node
            .keys
            .iter()
            .position(|k| k.cmp_value(key) == Ordering::Equal)
            .ok_or_else(|| DbError::NotFound(format!("{}: key not in index", self.name)))?;
        node.values[pos] = new_value;
        Ok(())
    }

    pub fn update_key(&mut self, old: &FieldValue, new: FieldValue) -> Result<()> {
        let value = self
            .get_data(old)
            .ok_or_else(|| DbError::NotFound(format!("{}: key not in index", self.name)))?;
        self.delete(old)?;
        self.insert(new, value);
        Ok(())
    }

    /// Every leaf is at the same depth; every non-root node has
    /// `t-1 ..= 2t-1` keys; leaves are linked in ascending order. Used
    /// by tests and may be called defensively after bulk loads.
    pub fn check_balance(&self) -> Result<()> {
        fn depth(tree: &BPTree, idx: usize) -> Result<usize> {
            if tree.is_leaf(idx) {
                return Ok(0);
            }
            if idx != tree.root && !(tree.min_keys()..=tree.max_keys()).contains(&tree.key_count(idx)) {
                return Err(DbError::Index(format!(
                    "node {} has {} keys, outside [{}, {}]",
                    idx, tree.key_count(idx), tree.min_keys(), tree.max_keys()
                )));
            }
            let mut depths = Vec::new();
            for &child in &tree.nodes[idx].children {
                depths.push(depth(tree, child)?);
            }
            if depths.windows(2).any(|w| w[0] != w[1]) {
                return Err(DbError::Index("unbalanced leaf depth".into()));
            }
            Ok(depths.first().copied().unwrap_or(0) + 1)
        }
        depth(self, self.root)?;
        let keys = self.traversal();
        if keys.windows(2).any(|w| w[0].0.cmp_value(&w[1].0) != Ordering::Less) {
            return Err(DbError::Index("leaf chain not strictly ascending".into()));
        }
        Ok(())
    }

    // ---- persistence ------------------------------------------------------

    pub fn encode(&self, w: &mut Writer) {
        w.write_str(&self.name);
        w.write_u32(self.domain as u32);
        w.write_u32(self.root as u32);
        w.write_u32(self.head as u32);
        w.write_seq(&self.nodes, |w, n| {
            w.write_bool(n.is_leaf);
            w.write_seq(&n.keys, |w, k| k.encode(w));
            w.write_seq(&n.children, |w, c| w.write_u32(*c as u32));
            w.write_seq(&n.values, |w, v| w.write_i64(*v));
            match n.next {
                Some(next) => {
                    w.write_bool(true);
                    w.write_u32(next as u32);
                }
                None => w.write_bool(false),
            }
        });
    }

    pub fn decode(r: &mut Reader) -> Result<Self> {
        let name = r.read_str()?;
        let domain = r.read_u32()? as usize;
        let root = r.read_u32()? as usize;
        let head = r.read_u32()? as usize;
        let nodes = r.read_seq(|r| {
            let is_leaf = r.read_bool()?;
            let keys = r.read_seq(FieldValue::decode)?;
            let children = r.read_seq(|r| Ok(r.read_u32()? as usize))?;
            let values = r.read_seq(|r| r.read_i64())?;
            let next = if r.read_bool()? { Some(r.read_u32()? as usize) } else { None };
            Ok(BPNode { is_leaf, keys, children, values, next })
        })?;
        Ok(BPTree { name, path: None, domain, nodes, root, head })
    }

    pub fn commit(&self) -> Result<()> {
        if let Some(path) = &self.path {
            trace!("{}: committing index to {}", self.name, path.display());
            let mut w = Writer::new();
            self.encode(&mut w);
            dbfs::atomic_write(path, &w.into_vec())?;
        }
        Ok(())
    }

    pub fn rollback(&mut self) -> Result<()> {
        if let Some(path) = self.path.clone() {
            debug!("{}: rolling back index from {}", self.name, path.display());
            let bytes = dbfs::read(&path)?;
            let mut r = Reader::new(&bytes);
            let mut reloaded = BPTree::decode(&mut r)?;
            reloaded.path = Some(path);
            *self = reloaded;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(tree: &BPTree) -> Vec<i64> {
        tree.traversal()
            .into_iter()
            .map(|(k, _)| match k {
                FieldValue::Int(v) => v,
                _ => panic!("expected int key"),
            })
            .collect()
    }

    #[test]
    fn insert_keeps_balance_and_order() {
        let mut tree = BPTree::new("ix", 3);
        for i in 1..=200i64 {
            tree.insert(FieldValue::Int(i), i);
        }
        tree.check_balance().unwrap();
        assert_eq!(keys(&tree), (1..=200).collect::<Vec<_>>());
    }

    #[test]
    fn delete_keeps_balance() {
        let mut tree = BPTree::new("ix", 3);
        for i in 1..=200i64 {
            tree.insert(FieldValue::Int(i), i);
        }
        for i in (1..=200i64).step_by(2) {
            tree.delete(&FieldValue::Int(i)).unwrap();
        }
        tree.check_balance().unwrap();
        assert_eq!(keys(&tree), (2..=200).step_by(2).collect::<Vec<_>>());
    }

    #[test]
    fn get_and_range() {
        let mut tree = BPTree::new("ix", 4);
        for i in 1..=50i64 {
            tree.insert(FieldValue::Int(i * 10), i);
        }
        assert_eq!(tree.get_data(&FieldValue::Int(250)), Some(25));
        let range = tree.get_range(Some(&FieldValue::Int(100)), true, Some(&FieldValue::Int(300)), false);
        assert_eq!(range.len(), 20);
    }

    #[test]
    fn update_item_and_key() {
        let mut tree = BPTree::new("ix", 3);
        tree.insert(FieldValue::Int(1), 100);
        tree.update_item(&FieldValue::Int(1), 200).unwrap();
        assert_eq!(tree.get_data(&FieldValue::Int(1)), Some(200));
        tree.update_key(&FieldValue::Int(1), FieldValue::Int(5)).unwrap();
        assert_eq!(tree.get_data(&FieldValue::Int(5)), Some(200));
        assert_eq!(tree.get_data(&FieldValue::Int(1)), None);
    }

    #[test]
    fn round_trips_through_codec() {
        let mut tree = BPTree::new("ix", 3);
        for i in 1..=30i64 {
            tree.insert(FieldValue::Int(i), i * 2);
        }
        let mut w = Writer::new();
        tree.encode(&mut w);
        let bytes = w.into_vec();
        let mut r = Reader::new(&bytes);
        let back = BPTree::decode(&mut r).unwrap();
        assert_eq!(keys(&back), keys(&tree));
    }
}
