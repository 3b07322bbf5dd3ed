use colored::Colorize;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use std::cmp::max;
use std::ops::{Index, IndexMut};

use crate::slab::{MapError, Record, Slab, SENTINEL};

#[cfg(test)]
use bytemuck::{Pod, Zeroable};

/// Child side of a tree node.
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive)]
pub enum Branch {
    Left = 0,
    Right = 1,
}

/// Exploits the fact that LEFT and RIGHT are set to 0 and 1 respectively
#[inline(always)]
fn opposite(dir: u32) -> u32 {
    1 - dir
}

/// Outcome of a key lookup: the slot that holds the key, or the exact
/// attach point a later insert may commit to without searching again.
///
/// A handle is a pair of bare indices. It stays meaningful until a
/// structural mutation touches the recorded slots; the holder must not
/// carry one across an unrelated insert or remove.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Handle {
    Occupied(u32),
    Vacant { parent: u32, branch: u32 },
}

impl Handle {
    #[inline(always)]
    pub fn is_occupied(&self) -> bool {
        matches!(self, Handle::Occupied(_))
    }

    /// The occupied slot, if any. Vacant handles have no slot to offer.
    #[inline(always)]
    pub fn slot(&self) -> Option<u32> {
        match self {
            Handle::Occupied(slot) => Some(*slot),
            Handle::Vacant { .. } => None,
        }
    }
}

/// Where an insert-flavored call left the record.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Placement {
    /// A record with this key was already stored in the slot.
    Existing(u32),
    /// The record went into a freshly allocated slot.
    Inserted(u32),
}

impl Placement {
    #[inline(always)]
    pub fn slot(&self) -> u32 {
        match self {
            Placement::Existing(slot) | Placement::Inserted(slot) => *slot,
        }
    }

    #[inline(always)]
    pub fn is_inserted(&self) -> bool {
        matches!(self, Placement::Inserted(_))
    }
}

/// An ordered map of keyed records in one contiguous allocation, balanced
/// as a weak AVL tree. Search, insert, and remove are O(log n) worst case.
/// Records are addressed by stable u32 slots that survive grows and
/// unrelated mutations; all internal links are slot indices, never
/// pointers, so the whole map relocates freely.
///
/// Rank bookkeeping is one parity bit per slot. Whether a child is a
/// 1- or 2-child (or, mid-fixup, a 0- or 3-child) of its parent follows
/// from comparing the two bits; the sentinel's bit is set, giving nil its
/// rank of -1.
pub struct WavlMap<'a, V: Record> {
    root: u32,
    slab: Slab<'a, V>,
}

impl<'a, V: Record> Default for WavlMap<'a, V> {
    fn default() -> Self {
        WavlMap {
            root: SENTINEL,
            slab: Slab::new(),
        }
    }
}

impl<'a, V: Record> WavlMap<'a, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// A map with room for `records` inserts before the first grow.
    pub fn with_capacity(records: u32) -> Result<Self, MapError> {
        let mut map = Self::new();
        if records > 0 {
            map.slab.grow(records + 1)?;
        }
        Ok(map)
    }

    /// Adopts a caller-supplied buffer in fixed-size mode: the map never
    /// allocates and refuses inserts past the buffer's capacity.
    pub fn from_buffer(buf: &'a mut [u8]) -> Result<Self, MapError> {
        Ok(WavlMap {
            root: SENTINEL,
            slab: Slab::from_buffer(buf)?,
        })
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.slab.len() as usize
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.slab.is_empty()
    }

    /// Slots usable for records; the sentinel slot is excluded.
    #[inline(always)]
    pub fn capacity(&self) -> usize {
        (self.slab.capacity() as usize).saturating_sub(1)
    }

    #[inline(always)]
    pub fn get_node(&self, slot: u32) -> &V {
        self.slab.value(slot)
    }

    /// Mutable access to a stored record. The key must not be changed.
    #[inline(always)]
    pub fn get_node_mut(&mut self, slot: u32) -> &mut V {
        self.slab.value_mut(slot)
    }

    #[inline(always)]
    fn branch(&self, node: u32, dir: u32) -> u32 {
        self.slab.branch(node, dir)
    }

    #[inline(always)]
    fn parent(&self, node: u32) -> u32 {
        self.slab.up(node)
    }

    #[inline(always)]
    fn parity(&self, node: u32) -> bool {
        self.slab.parity(node)
    }

    #[inline(always)]
    fn promote(&mut self, node: u32) {
        self.slab.flip_parity(node);
    }

    #[inline(always)]
    fn demote(&mut self, node: u32) {
        self.slab.flip_parity(node);
    }

    /// Parities equal: the child is a 0- or 2-child. Callers on the insert
    /// path have ruled out 2, callers on the remove path have ruled out 0.
    #[inline(always)]
    fn is_2_child(&self, parent: u32, child: u32) -> bool {
        self.parity(parent) == self.parity(child)
    }

    /// Parities differ: the child is a 1-child (or, mid-removal, a
    /// 3-child; context decides).
    #[inline(always)]
    fn is_1_child(&self, parent: u32, child: u32) -> bool {
        self.parity(parent) != self.parity(child)
    }

    /// `x` is a 0-child and `y` a 1-child of `parent`.
    #[inline(always)]
    fn is_01_parent(&self, x: u32, parent: u32, y: u32) -> bool {
        self.parity(x) == self.parity(parent) && self.parity(y) != self.parity(parent)
    }

    /// `x` is a 0-child and `y` a 2-child of `parent`.
    #[inline(always)]
    fn is_02_parent(&self, x: u32, parent: u32, y: u32) -> bool {
        self.parity(x) == self.parity(parent) && self.parity(y) == self.parity(parent)
    }

    /// Both children are 2-children of `parent`.
    #[inline(always)]
    fn is_22_parent(&self, left: u32, parent: u32, right: u32) -> bool {
        self.parity(left) == self.parity(parent) && self.parity(right) == self.parity(parent)
    }

    /// Both children are 1-children of `parent`.
    #[inline(always)]
    fn is_11_parent(&self, left: u32, parent: u32, right: u32) -> bool {
        self.parity(left) != self.parity(parent) && self.parity(right) != self.parity(parent)
    }

    #[inline(always)]
    pub fn is_leaf(&self, node: u32) -> bool {
        self.branch(node, Branch::Left as u32) == SENTINEL
            && self.branch(node, Branch::Right as u32) == SENTINEL
    }

    /// Writes the parent/child link in both directions. Either end may be
    /// the sentinel, which is left untouched.
    #[inline(always)]
    fn connect(&mut self, parent: u32, child: u32, dir: u32) {
        if parent != SENTINEL {
            self.slab.set_branch(parent, dir, child);
        }
        if child != SENTINEL {
            self.slab.set_up(child, parent);
        }
    }

    #[inline(always)]
    fn child_dir(&self, parent: u32, child: u32) -> u32 {
        if child == self.branch(parent, Branch::Left as u32) {
            Branch::Left as u32
        } else if child == self.branch(parent, Branch::Right as u32) {
            Branch::Right as u32
        } else {
            panic!("nodes are not connected");
        }
    }

    /// Non-mutating lookup. Returns the slot holding `key`, or the parent
    /// and side a new record would attach to.
    pub fn handle(&self, key: &V::Key) -> Handle {
        let mut node = self.root;
        if node == SENTINEL {
            return Handle::Vacant {
                parent: SENTINEL,
                branch: Branch::Left as u32,
            };
        }
        loop {
            let node_key = self.get_node(node).key();
            let dir = if *key < node_key {
                Branch::Left as u32
            } else if *key > node_key {
                Branch::Right as u32
            } else {
                return Handle::Occupied(node);
            };
            let target = self.branch(node, dir);
            if target == SENTINEL {
                return Handle::Vacant {
                    parent: node,
                    branch: dir,
                };
            }
            node = target;
        }
    }

    /// The slot holding `key`, or the sentinel.
    pub fn get_slot(&self, key: &V::Key) -> u32 {
        match self.handle(key) {
            Handle::Occupied(slot) => slot,
            Handle::Vacant { .. } => SENTINEL,
        }
    }

    pub fn contains(&self, key: &V::Key) -> bool {
        self.handle(key).is_occupied()
    }

    pub fn get(&self, key: &V::Key) -> Option<&V> {
        match self.handle(key) {
            Handle::Occupied(slot) => Some(self.get_node(slot)),
            Handle::Vacant { .. } => None,
        }
    }

    /// Mutable access to the record stored under `key`. The key field must
    /// not be changed through the returned reference.
    pub fn get_mut(&mut self, key: &V::Key) -> Option<&mut V> {
        match self.handle(key) {
            Handle::Occupied(slot) => Some(self.get_node_mut(slot)),
            Handle::Vacant { .. } => None,
        }
    }

    /// Inserts iff the key is absent. `Existing` reports the blocking slot
    /// and leaves the stored record untouched.
    pub fn try_insert(&mut self, record: V) -> Result<Placement, MapError> {
        match self.handle(&record.key()) {
            Handle::Occupied(slot) => Ok(Placement::Existing(slot)),
            Handle::Vacant { parent, branch } => {
                Ok(Placement::Inserted(self.attach(parent, branch, record)?))
            }
        }
    }

    /// Insert-or-assign: overwrites the stored record when the key is
    /// present.
    pub fn insert(&mut self, record: V) -> Result<Placement, MapError> {
        match self.handle(&record.key()) {
            Handle::Occupied(slot) => {
                *self.get_node_mut(slot) = record;
                Ok(Placement::Existing(slot))
            }
            Handle::Vacant { parent, branch } => {
                Ok(Placement::Inserted(self.attach(parent, branch, record)?))
            }
        }
    }

    /// Exchanges the caller's record with the stored one when the key is
    /// present, and inserts a copy otherwise.
    pub fn swap(&mut self, record: &mut V) -> Result<Placement, MapError> {
        match self.handle(&record.key()) {
            Handle::Occupied(slot) => {
                std::mem::swap(self.get_node_mut(slot), record);
                Ok(Placement::Existing(slot))
            }
            Handle::Vacant { parent, branch } => {
                Ok(Placement::Inserted(self.attach(parent, branch, *record)?))
            }
        }
    }

    /// Commits a prior lookup: the occupied slot as-is, or an insert into
    /// the recorded vacancy.
    pub fn or_insert(&mut self, handle: Handle, record: V) -> Result<u32, MapError> {
        self.check_handle(&handle)?;
        match handle {
            Handle::Occupied(slot) => Ok(slot),
            Handle::Vacant { parent, branch } => self.attach(parent, branch, record),
        }
    }

    /// Commits a prior lookup with a lazily built record.
    pub fn or_insert_with(
        &mut self,
        handle: Handle,
        make: impl FnOnce() -> V,
    ) -> Result<u32, MapError> {
        self.check_handle(&handle)?;
        match handle {
            Handle::Occupied(slot) => Ok(slot),
            Handle::Vacant { parent, branch } => self.attach(parent, branch, make()),
        }
    }

    /// Writes `record` through the handle unconditionally, inserting on
    /// vacancy. An occupied slot only accepts a record with the matching
    /// key.
    pub fn insert_handle(&mut self, handle: Handle, record: V) -> Result<u32, MapError> {
        self.check_handle(&handle)?;
        match handle {
            Handle::Occupied(slot) => {
                if self.get_node(slot).key() != record.key() {
                    return Err(MapError::InvalidArgument);
                }
                *self.get_node_mut(slot) = record;
                Ok(slot)
            }
            Handle::Vacant { parent, branch } => self.attach(parent, branch, record),
        }
    }

    /// Applies `op` to the stored record when the handle is occupied. The
    /// key field must not be changed.
    pub fn and_modify(&mut self, handle: Handle, op: impl FnOnce(&mut V)) -> Handle {
        if let Handle::Occupied(slot) = handle {
            if slot != SENTINEL && slot < self.slab.capacity() {
                op(self.get_node_mut(slot));
            }
        }
        handle
    }

    pub fn remove(&mut self, key: &V::Key) -> Option<V> {
        match self.handle(key) {
            Handle::Occupied(slot) => Some(self.remove_reachable(slot)),
            Handle::Vacant { .. } => None,
        }
    }

    /// Removes through an occupied slot handle. The slot must come from a
    /// live handle; a slot the map does not currently store a record in is
    /// reported as `None`.
    pub fn remove_slot(&mut self, slot: u32) -> Option<V> {
        if slot == SENTINEL || slot >= self.slab.capacity() {
            return None;
        }
        let key = self.get_node(slot).key();
        if self.get_slot(&key) != slot {
            return None;
        }
        Some(self.remove_reachable(slot))
    }

    fn check_handle(&self, handle: &Handle) -> Result<(), MapError> {
        match *handle {
            Handle::Occupied(slot) => {
                if slot == SENTINEL || slot >= self.slab.capacity() {
                    return Err(MapError::InvalidArgument);
                }
            }
            Handle::Vacant { parent, branch } => {
                if !matches!(
                    FromPrimitive::from_u32(branch),
                    Some(Branch::Left) | Some(Branch::Right),
                ) {
                    return Err(MapError::InvalidArgument);
                }
                if parent == SENTINEL {
                    if self.root != SENTINEL {
                        return Err(MapError::InvalidArgument);
                    }
                } else if parent >= self.slab.capacity()
                    || self.branch(parent, branch) != SENTINEL
                {
                    return Err(MapError::InvalidArgument);
                }
            }
        }
        Ok(())
    }

    /// Allocates a slot for `record` and wires it under `parent`. A failed
    /// allocation leaves the tree untouched.
    fn attach(&mut self, parent: u32, dir: u32, record: V) -> Result<u32, MapError> {
        let slot = self.slab.alloc(record)?;
        if parent == SENTINEL {
            self.root = slot;
            return Ok(slot);
        }
        self.connect(parent, slot, dir);
        if self.branch(parent, opposite(dir)) == SENTINEL {
            // the parent was a leaf, so the fresh rank-0 child is a 0-child
            self.insert_fixup(parent, slot);
        }
        Ok(slot)
    }

    /// Restores the rank rule after a new leaf landed under a former leaf.
    /// Promotions walk up while the violation is a 0,1 parent; whatever
    /// remains is settled by one rotation group.
    fn insert_fixup(&mut self, mut z: u32, mut x: u32) {
        loop {
            self.promote(z);
            x = z;
            z = self.parent(x);
            if z == SENTINEL {
                return;
            }
            let y = self.branch(z, opposite(self.child_dir(z, x)));
            if !self.is_01_parent(x, z, y) {
                break;
            }
        }
        let dir = self.child_dir(z, x);
        let y = self.branch(z, opposite(dir));
        if !self.is_02_parent(x, z, y) {
            return;
        }
        let inner = self.branch(x, opposite(dir));
        if self.is_2_child(x, inner) {
            self.rotate_dir(z, opposite(dir));
            self.demote(z);
        } else {
            // the inner grandchild is a 1-child and rises to the top
            self.double_rotate_dir(z, opposite(dir));
            self.promote(inner);
            self.demote(x);
            self.demote(z);
        }
    }

    fn remove_reachable(&mut self, target: u32) -> V {
        let out = *self.get_node(target);
        let target_parent = self.parent(target);
        let left = self.branch(target, Branch::Left as u32);
        let right = self.branch(target, Branch::Right as u32);

        let z;
        let x;
        let two_child;
        if left == SENTINEL || right == SENTINEL {
            let only = if left == SENTINEL { right } else { left };
            two_child = target_parent != SENTINEL && self.is_2_child(target_parent, target);
            self.transplant(target_parent, target, only);
            z = target_parent;
            x = only;
        } else {
            // splice out the inorder successor, then move it into the
            // target's position at the target's rank
            let succ = self.extremum(right, Branch::Left as u32);
            let succ_parent = self.parent(succ);
            let succ_right = self.branch(succ, Branch::Right as u32);
            two_child = self.is_2_child(succ_parent, succ);
            if succ_parent == target {
                z = succ;
            } else {
                self.connect(succ_parent, succ_right, Branch::Left as u32);
                z = succ_parent;
            }
            self.slab.set_parity(succ, self.parity(target));
            self.transplant(target_parent, target, succ);
            self.connect(succ, left, Branch::Left as u32);
            if succ_parent == target {
                self.connect(succ, succ_right, Branch::Right as u32);
            } else {
                self.connect(succ, right, Branch::Right as u32);
            }
            x = succ_right;
        }

        self.slab.free(target);

        if z != SENTINEL {
            if two_child {
                self.rebalance_3_child(z, x);
            } else if x == SENTINEL && self.is_leaf(z) && self.parity(z) {
                // the splice left a rank-1 leaf behind
                let grandparent = self.parent(z);
                let was_2_child =
                    grandparent != SENTINEL && self.is_2_child(grandparent, z);
                self.demote(z);
                if was_2_child {
                    self.rebalance_3_child(grandparent, z);
                }
            }
        }
        out
    }

    /// Rewires the parent of `target` to `replacement` (or rebinds the
    /// root). The first step of taking `target` out of the tree.
    #[inline(always)]
    fn transplant(&mut self, parent: u32, target: u32, replacement: u32) {
        if parent == SENTINEL {
            self.root = replacement;
            if replacement != SENTINEL {
                self.slab.set_up(replacement, SENTINEL);
            }
            return;
        }
        let dir = self.child_dir(parent, target);
        self.connect(parent, replacement, dir);
    }

    /// Walks up from a freshly created 3-child `x` (possibly the sentinel)
    /// under `z`, restoring the rank rule with demotions and at most one
    /// rotation group.
    fn rebalance_3_child(&mut self, mut z: u32, mut x: u32) {
        let mut made_3_child = true;
        while z != SENTINEL && made_3_child {
            let grandparent = self.parent(z);
            let dir = if self.branch(z, Branch::Left as u32) == x {
                Branch::Left as u32
            } else {
                Branch::Right as u32
            };
            let y = self.branch(z, opposite(dir));
            // a demotion of z turns it into a 3-child exactly when it was a
            // 2-child going in
            made_3_child = grandparent != SENTINEL && self.is_2_child(grandparent, z);
            if self.is_2_child(z, y) {
                self.demote(z);
            } else if self.is_22_parent(
                self.branch(y, Branch::Left as u32),
                y,
                self.branch(y, Branch::Right as u32),
            ) {
                self.demote(z);
                self.demote(y);
            } else {
                // z is a 1,3 parent and y has a 1-child to lend
                let away = self.branch(y, opposite(dir));
                if self.is_1_child(y, away) {
                    self.rotate_dir(z, dir);
                    self.promote(y);
                    self.demote(z);
                    if self.is_leaf(z) {
                        self.demote(z);
                    }
                } else {
                    // the inner grandchild rises two levels: its double
                    // promotion and z's double demotion leave both parity
                    // bits untouched
                    self.double_rotate_dir(z, dir);
                    self.demote(y);
                    if !self.is_leaf(z)
                        && self.is_11_parent(
                            self.branch(z, Branch::Left as u32),
                            z,
                            self.branch(z, Branch::Right as u32),
                        )
                    {
                        self.promote(z);
                    } else if !self.is_leaf(y)
                        && self.is_11_parent(
                            self.branch(y, Branch::Left as u32),
                            y,
                            self.branch(y, Branch::Right as u32),
                        )
                    {
                        self.promote(y);
                    }
                }
                return;
            }
            x = z;
            z = grandparent;
        }
    }

    /// Rotates `parent` down in `dir`; the child on the opposite side
    /// rises into its place. Returns the riser, or None when there is
    /// nothing to rotate.
    fn rotate_dir(&mut self, parent: u32, dir: u32) -> Option<u32> {
        if !matches!(
            FromPrimitive::from_u32(dir),
            Some(Branch::Left) | Some(Branch::Right),
        ) {
            return None;
        }
        let grandparent = self.parent(parent);
        let riser = self.branch(parent, opposite(dir));
        if riser == SENTINEL {
            return None;
        }
        let transfer = self.branch(riser, dir);
        self.connect(riser, parent, dir);
        self.connect(parent, transfer, opposite(dir));
        if grandparent != SENTINEL {
            let gdir = self.child_dir(grandparent, parent);
            self.connect(grandparent, riser, gdir);
        } else {
            self.slab.set_up(riser, SENTINEL);
            self.root = riser;
        }
        Some(riser)
    }

    /// Two rotations bringing the inner grandchild over both `parent` and
    /// its `opposite(dir)` child.
    fn double_rotate_dir(&mut self, parent: u32, dir: u32) -> Option<u32> {
        let child = self.branch(parent, opposite(dir));
        self.rotate_dir(child, opposite(dir))?;
        self.rotate_dir(parent, dir)
    }

    #[inline(always)]
    fn extremum(&self, from: u32, dir: u32) -> u32 {
        let mut node = from;
        while self.branch(node, dir) != SENTINEL {
            node = self.branch(node, dir);
        }
        node
    }

    pub fn find_min_index(&self) -> u32 {
        if self.root == SENTINEL {
            return SENTINEL;
        }
        self.extremum(self.root, Branch::Left as u32)
    }

    pub fn find_max_index(&self) -> u32 {
        if self.root == SENTINEL {
            return SENTINEL;
        }
        self.extremum(self.root, Branch::Right as u32)
    }

    pub fn find_min(&self) -> Option<&V> {
        match self.find_min_index() {
            SENTINEL => None,
            slot => Some(self.get_node(slot)),
        }
    }

    pub fn find_max(&self) -> Option<&V> {
        match self.find_max_index() {
            SENTINEL => None,
            slot => Some(self.get_node(slot)),
        }
    }

    /// Inorder neighbor of `slot` in the given direction, or the sentinel
    /// past either end. Slots are stable, so this supports cursor-style
    /// traversal with mutations between steps.
    pub fn next_slot(&self, slot: u32, dir: Branch) -> u32 {
        let dir = dir as u32;
        if slot == SENTINEL {
            return SENTINEL;
        }
        let ahead = self.branch(slot, dir);
        if ahead != SENTINEL {
            return self.extremum(ahead, opposite(dir));
        }
        let mut node = slot;
        let mut up = self.parent(node);
        while up != SENTINEL && self.branch(up, dir) == node {
            node = up;
            up = self.parent(node);
        }
        up
    }

    /// First slot whose key is not less than `key`.
    pub fn lower_bound(&self, key: &V::Key) -> u32 {
        match self.handle(key) {
            Handle::Occupied(slot) => slot,
            Handle::Vacant {
                parent: SENTINEL, ..
            } => SENTINEL,
            Handle::Vacant { parent, branch } => {
                if branch == Branch::Left as u32 {
                    parent
                } else {
                    self.next_slot(parent, Branch::Right)
                }
            }
        }
    }

    /// First slot whose key is greater than `key`.
    pub fn upper_bound(&self, key: &V::Key) -> u32 {
        match self.handle(key) {
            Handle::Occupied(slot) => self.next_slot(slot, Branch::Right),
            Handle::Vacant {
                parent: SENTINEL, ..
            } => SENTINEL,
            Handle::Vacant { parent, branch } => {
                if branch == Branch::Left as u32 {
                    parent
                } else {
                    self.next_slot(parent, Branch::Right)
                }
            }
        }
    }

    /// Last slot whose key is not greater than `key`.
    fn lower_bound_rev(&self, key: &V::Key) -> u32 {
        match self.handle(key) {
            Handle::Occupied(slot) => slot,
            Handle::Vacant {
                parent: SENTINEL, ..
            } => SENTINEL,
            Handle::Vacant { parent, branch } => {
                if branch == Branch::Right as u32 {
                    parent
                } else {
                    self.next_slot(parent, Branch::Left)
                }
            }
        }
    }

    /// Half-open slot pair `[first not less than lo, first greater than
    /// hi)`.
    pub fn equal_range(&self, lo: &V::Key, hi: &V::Key) -> (u32, u32) {
        (self.lower_bound(lo), self.upper_bound(hi))
    }

    /// Records with keys in `[lo, hi]`, ascending.
    pub fn range(&self, lo: &V::Key, hi: &V::Key) -> WavlMapRangeIterator<'_, 'a, V> {
        WavlMapRangeIterator {
            map: self,
            node: self.lower_bound(lo),
            until: *hi,
            dir: Branch::Right,
        }
    }

    /// Records with keys in `[lo, hi]`, descending.
    pub fn range_rev(&self, lo: &V::Key, hi: &V::Key) -> WavlMapRangeIterator<'_, 'a, V> {
        WavlMapRangeIterator {
            map: self,
            node: self.lower_bound_rev(hi),
            until: *lo,
            dir: Branch::Left,
        }
    }

    pub fn iter(&self) -> WavlMapIterator<'_, 'a, V> {
        WavlMapIterator {
            map: self,
            fwd: self.find_min_index(),
            rev: self.find_max_index(),
            done: self.root == SENTINEL,
        }
    }

    pub fn iter_mut(&mut self) -> WavlMapIteratorMut<'_, 'a, V> {
        let fwd = self.find_min_index();
        let rev = self.find_max_index();
        let done = self.root == SENTINEL;
        WavlMapIteratorMut {
            map: self,
            fwd,
            rev,
            done,
        }
    }

    /// Ensures `additional` more inserts cannot trigger a grow.
    pub fn reserve(&mut self, additional: u32) -> Result<(), MapError> {
        self.slab.reserve(additional)
    }

    /// Rebuilds this map as a copy of `src`. A large-enough existing buffer
    /// (and its fixed-size mode) is kept; otherwise the map grows to
    /// match. Slot assignments carry over bit-for-bit, so handles into
    /// `src` address the same records here.
    pub fn copy_from(&mut self, src: &WavlMap<'_, V>) -> Result<(), MapError> {
        self.slab.copy_from(&src.slab)?;
        self.root = src.root;
        Ok(())
    }

    /// Empties the map in one pass, keeping the allocation.
    pub fn clear(&mut self) {
        self.root = SENTINEL;
        self.slab.clear();
    }

    /// Runs `dtor` once per stored record, then empties the map. Capacity
    /// is preserved.
    pub fn clear_with(&mut self, mut dtor: impl FnMut(&mut V)) {
        let mut node = self.find_min_index();
        while node != SENTINEL {
            let next = self.next_slot(node, Branch::Right);
            dtor(self.get_node_mut(node));
            node = next;
        }
        self.clear();
    }

    /// Empties the map and returns the allocation. Refuses in fixed-size
    /// mode, where the buffer belongs to the caller.
    pub fn clear_and_free(&mut self) -> Result<(), MapError> {
        self.slab.release()?;
        self.root = SENTINEL;
        Ok(())
    }

    /// `clear_and_free` with a destructor for the stored records. Nothing
    /// runs when the allocation cannot be released.
    pub fn clear_and_free_with(&mut self, dtor: impl FnMut(&mut V)) -> Result<(), MapError> {
        if !self.slab.owns_allocation() {
            return Err(MapError::CapacityExhausted);
        }
        self.clear_with(dtor);
        self.slab.release()?;
        self.root = SENTINEL;
        Ok(())
    }

    pub fn height(&self) -> u32 {
        self.subtree_height(self.root)
    }

    fn subtree_height(&self, node: u32) -> u32 {
        if node == SENTINEL {
            return 0;
        }
        1 + max(
            self.subtree_height(self.branch(node, Branch::Left as u32)),
            self.subtree_height(self.branch(node, Branch::Right as u32)),
        )
    }

    /// Recomputes the rank of every node from the leaves up. None when no
    /// rank assignment satisfies the rule that every parent-child rank
    /// difference is 1 or 2, leaves sit at rank 0, and the stored parity
    /// is the rank's low bit.
    fn subtree_rank(&self, node: u32) -> Option<i64> {
        if node == SENTINEL {
            return Some(-1);
        }
        let left = self.subtree_rank(self.branch(node, Branch::Left as u32))?;
        let right = self.subtree_rank(self.branch(node, Branch::Right as u32))?;
        let lo = left.max(right) + 1;
        let hi = left.min(right) + 2;
        let mut rank = None;
        let mut candidate = lo;
        while candidate <= hi {
            if (candidate & 1 == 1) == self.parity(node) {
                rank = Some(candidate);
            }
            candidate += 1;
        }
        let rank = rank?;
        if left == -1 && right == -1 && rank != 0 {
            return None;
        }
        Some(rank)
    }

    /// Full structural audit: sentinel immutability, parent links, strict
    /// key order, the reachable/free partition of all slots, and the rank
    /// rule. Intended for tests; prints the reason when it fails.
    pub fn is_valid_wavl_tree(&self) -> bool {
        let capacity = self.slab.capacity();
        if capacity == 0 {
            return self.root == SENTINEL && self.slab.len() == 0;
        }
        if self.slab.branch(SENTINEL, 0) != SENTINEL
            || self.slab.branch(SENTINEL, 1) != SENTINEL
            || self.slab.up(SENTINEL) != SENTINEL
            || !self.parity(SENTINEL)
        {
            println!("sentinel metadata was touched");
            return false;
        }
        if self.root != SENTINEL && self.parent(self.root) != SENTINEL {
            println!("root has a parent");
            return false;
        }
        let mut seen = vec![false; capacity as usize];
        let mut reachable = 0u32;
        if self.root != SENTINEL {
            let mut stack = vec![self.root];
            while let Some(node) = stack.pop() {
                if node >= capacity || seen[node as usize] {
                    println!("link cycle or out-of-range slot at {}", node);
                    return false;
                }
                seen[node as usize] = true;
                reachable += 1;
                for dir in [Branch::Left as u32, Branch::Right as u32] {
                    let child = self.branch(node, dir);
                    if child == SENTINEL {
                        continue;
                    }
                    if child >= capacity || self.parent(child) != node {
                        println!("parent link of {} does not match {}", child, node);
                        return false;
                    }
                    stack.push(child);
                }
            }
        }
        if reachable != self.slab.len() {
            println!(
                "{} slots reachable but {} records stored",
                reachable,
                self.slab.len()
            );
            return false;
        }
        let mut inorder = 0u32;
        let mut node = self.find_min_index();
        let mut prev: Option<V::Key> = None;
        while node != SENTINEL {
            let key = self.get_node(node).key();
            if let Some(ref p) = prev {
                if !(*p < key) {
                    println!("keys out of order at slot {}", node);
                    return false;
                }
            }
            prev = Some(key);
            inorder += 1;
            if inorder > capacity {
                println!("inorder walk does not terminate");
                return false;
            }
            node = self.next_slot(node, Branch::Right);
        }
        if inorder != reachable {
            println!("inorder walk saw {} of {} nodes", inorder, reachable);
            return false;
        }
        let mut free = 0u32;
        let mut cursor = self.slab.free_head();
        while cursor != SENTINEL {
            if cursor >= capacity || seen[cursor as usize] {
                println!("free list overlaps the tree at {}", cursor);
                return false;
            }
            seen[cursor as usize] = true;
            free += 1;
            if free > capacity {
                println!("free list does not terminate");
                return false;
            }
            cursor = self.slab.up(cursor);
        }
        if free != capacity - 1 - self.slab.len() {
            println!(
                "free list holds {} slots, expected {}",
                free,
                capacity - 1 - self.slab.len()
            );
            return false;
        }
        if seen[1..].iter().any(|claimed| !claimed) {
            println!("orphaned slot");
            return false;
        }
        if self.subtree_rank(self.root).is_none() {
            println!("rank rule violated");
            return false;
        }
        true
    }

    pub fn pretty_print(&self)
    where
        V::Key: std::fmt::Debug,
    {
        let mut out = String::new();
        let mut stack = vec![(self.root, "".to_string(), "".to_string())];
        while let Some((node, mut padding, pointer)) = stack.pop() {
            if node == SENTINEL {
                continue;
            }
            let key = self.get_node(node).key();
            out.push_str(&padding);
            out.push_str(&pointer);
            let label = format!("{:?} ({})", key, node);
            if self.parity(node) {
                out.push_str(&format!("{}", label.red()));
            } else {
                out.push_str(&label);
            }
            out.push('\n');
            padding.push_str("│  ");
            let right_pointer = "└──".to_string();
            let left_pointer = if self.branch(node, Branch::Right as u32) != SENTINEL {
                "├──".to_string()
            } else {
                "└──".to_string()
            };
            stack.push((
                self.branch(node, Branch::Right as u32),
                padding.clone(),
                right_pointer,
            ));
            stack.push((
                self.branch(node, Branch::Left as u32),
                padding.clone(),
                left_pointer,
            ));
        }
        println!("{}", out);
    }
}

impl<'a, V: Record> Index<&V::Key> for WavlMap<'a, V> {
    type Output = V;

    fn index(&self, index: &V::Key) -> &Self::Output {
        self.get(index).unwrap()
    }
}

impl<'a, V: Record> IndexMut<&V::Key> for WavlMap<'a, V> {
    fn index_mut(&mut self, index: &V::Key) -> &mut Self::Output {
        self.get_mut(index).unwrap()
    }
}

impl<'m, 'a, V: Record> IntoIterator for &'m WavlMap<'a, V> {
    type Item = &'m V;
    type IntoIter = WavlMapIterator<'m, 'a, V>;
    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<'m, 'a, V: Record> IntoIterator for &'m mut WavlMap<'a, V> {
    type Item = &'m mut V;
    type IntoIter = WavlMapIteratorMut<'m, 'a, V>;
    fn into_iter(self) -> Self::IntoIter {
        self.iter_mut()
    }
}

pub struct WavlMapIterator<'m, 'a, V: Record> {
    map: &'m WavlMap<'a, V>,
    fwd: u32,
    rev: u32,
    done: bool,
}

impl<'m, 'a, V: Record> Iterator for WavlMapIterator<'m, 'a, V> {
    type Item = &'m V;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let current = self.fwd;
        if current == self.rev {
            self.done = true;
        } else {
            self.fwd = self.map.next_slot(current, Branch::Right);
        }
        Some(self.map.get_node(current))
    }
}

impl<'m, 'a, V: Record> DoubleEndedIterator for WavlMapIterator<'m, 'a, V> {
    fn next_back(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let current = self.rev;
        if current == self.fwd {
            self.done = true;
        } else {
            self.rev = self.map.next_slot(current, Branch::Left);
        }
        Some(self.map.get_node(current))
    }
}

pub struct WavlMapIteratorMut<'m, 'a, V: Record> {
    map: &'m mut WavlMap<'a, V>,
    fwd: u32,
    rev: u32,
    done: bool,
}

impl<'m, 'a, V: Record> Iterator for WavlMapIteratorMut<'m, 'a, V> {
    type Item = &'m mut V;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let current = self.fwd;
        if current == self.rev {
            self.done = true;
        } else {
            self.fwd = self.map.next_slot(current, Branch::Right);
        }
        // TODO: hand out one &mut per distinct slot without the raw
        // pointer round-trip
        unsafe {
            let value = self.map.get_node_mut(current) as *mut V;
            Some(&mut *value)
        }
    }
}

impl<'m, 'a, V: Record> DoubleEndedIterator for WavlMapIteratorMut<'m, 'a, V> {
    fn next_back(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let current = self.rev;
        if current == self.fwd {
            self.done = true;
        } else {
            self.rev = self.map.next_slot(current, Branch::Left);
        }
        unsafe {
            let value = self.map.get_node_mut(current) as *mut V;
            Some(&mut *value)
        }
    }
}

pub struct WavlMapRangeIterator<'m, 'a, V: Record> {
    map: &'m WavlMap<'a, V>,
    node: u32,
    until: V::Key,
    dir: Branch,
}

impl<'m, 'a, V: Record> Iterator for WavlMapRangeIterator<'m, 'a, V> {
    type Item = &'m V;

    fn next(&mut self) -> Option<Self::Item> {
        if self.node == SENTINEL {
            return None;
        }
        let value = self.map.get_node(self.node);
        let inside = match self.dir {
            Branch::Right => !(value.key() > self.until),
            Branch::Left => !(value.key() < self.until),
        };
        if !inside {
            self.node = SENTINEL;
            return None;
        }
        self.node = self.map.next_slot(self.node, self.dir);
        Some(value)
    }
}

#[cfg(test)]
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
struct Pair {
    key: i32,
    val: i32,
}

#[cfg(test)]
unsafe impl Zeroable for Pair {}
#[cfg(test)]
unsafe impl Pod for Pair {}

#[cfg(test)]
impl Record for Pair {
    type Key = i32;
    fn key(&self) -> i32 {
        self.key
    }
}

#[cfg(test)]
fn pair(key: i32, val: i32) -> Pair {
    Pair { key, val }
}

#[cfg(test)]
fn wavl_height_bound<V: Record>(map: &WavlMap<V>) -> bool {
    map.height() as f64 <= 2.0 * ((map.len() + 2) as f64).log2().ceil()
}

#[test]
fn test_empty_map() {
    let map = WavlMap::<Pair>::new();
    assert_eq!(map.len(), 0);
    assert!(map.is_empty());
    assert!(!map.contains(&1));
    assert_eq!(map.get(&1), None);
    assert_eq!(map.find_min_index(), SENTINEL);
    assert_eq!(map.iter().next(), None);
    assert!(map.is_valid_wavl_tree());
    assert_eq!(
        map.handle(&1),
        Handle::Vacant {
            parent: SENTINEL,
            branch: Branch::Left as u32
        }
    );
}

#[test]
fn test_single_insert() {
    let mut map = WavlMap::<Pair>::new();
    let placed = map.try_insert(pair(1, 10)).unwrap();
    assert!(placed.is_inserted());
    let slot = placed.slot();
    assert_eq!(map.len(), 1);
    assert!(map.contains(&1));
    assert_eq!(*map.get_node(slot), pair(1, 10));
    assert_eq!(map.iter().map(|v| v.key).collect::<Vec<_>>(), vec![1]);
    assert!(map.is_valid_wavl_tree());
}

#[test]
fn test_duplicate_insert_is_reported() {
    let mut map = WavlMap::<Pair>::new();
    let slot = map.try_insert(pair(1, 10)).unwrap().slot();
    let placed = map.try_insert(pair(1, 20)).unwrap();
    assert_eq!(placed, Placement::Existing(slot));
    assert_eq!(map.get(&1), Some(&pair(1, 10)));
    assert_eq!(map.len(), 1);
}

#[test]
fn test_insert_or_assign_overwrites() {
    let mut map = WavlMap::<Pair>::new();
    let slot = map.try_insert(pair(1, 10)).unwrap().slot();
    let placed = map.insert(pair(1, 20)).unwrap();
    assert_eq!(placed, Placement::Existing(slot));
    assert_eq!(*map.get_node(slot), pair(1, 20));
    assert_eq!(map.len(), 1);
    assert!(map.is_valid_wavl_tree());
}

#[test]
fn test_removed_slot_is_reused_first() {
    let mut map = WavlMap::<Pair>::new();
    let slot = map.try_insert(pair(1, 10)).unwrap().slot();
    assert_eq!(map.remove(&1), Some(pair(1, 10)));
    assert_eq!(map.len(), 0);
    let reused = map.try_insert(pair(2, 200)).unwrap();
    assert_eq!(reused, Placement::Inserted(slot));
    assert_eq!(*map.get_node(slot), pair(2, 200));
    assert!(map.is_valid_wavl_tree());
}

#[test]
fn test_three_inserts_rotate_to_a_balanced_root() {
    let mut map = WavlMap::<Pair>::new();
    let one = map.try_insert(pair(1, 0)).unwrap().slot();
    let two = map.try_insert(pair(2, 0)).unwrap().slot();
    let three = map.try_insert(pair(3, 0)).unwrap().slot();
    // ascending inserts force the single-rotation endgame
    assert_eq!(map.root, two);
    assert_eq!(map.branch(two, Branch::Left as u32), one);
    assert_eq!(map.branch(two, Branch::Right as u32), three);
    assert!(map.parity(two));
    assert!(!map.parity(one));
    assert!(!map.parity(three));
    assert!(map.is_valid_wavl_tree());
}

#[test]
fn test_handle_commit_without_second_search() {
    let mut map = WavlMap::<Pair>::new();
    let handle = map.handle(&5);
    assert!(!handle.is_occupied());
    let slot = map.or_insert(handle, pair(5, 50)).unwrap();
    assert_eq!(map.get(&5), Some(&pair(5, 50)));
    // committing an occupied handle must not overwrite
    let handle = map.handle(&5);
    assert_eq!(handle.slot(), Some(slot));
    assert_eq!(map.or_insert(handle, pair(5, 999)).unwrap(), slot);
    assert_eq!(map.get(&5), Some(&pair(5, 50)));
}

#[test]
fn test_stale_vacant_handle_is_rejected() {
    let mut map = WavlMap::<Pair>::new();
    let stale = map.handle(&7);
    map.insert(pair(7, 70)).unwrap();
    assert_eq!(
        map.or_insert(stale, pair(7, 71)),
        Err(MapError::InvalidArgument)
    );
    assert_eq!(map.get(&7), Some(&pair(7, 70)));
}

#[test]
fn test_insert_handle_rejects_key_mismatch() {
    let mut map = WavlMap::<Pair>::new();
    map.insert(pair(1, 10)).unwrap();
    let handle = map.handle(&1);
    assert_eq!(
        map.insert_handle(handle, pair(2, 20)),
        Err(MapError::InvalidArgument)
    );
    let slot = map.insert_handle(handle, pair(1, 11)).unwrap();
    assert_eq!(*map.get_node(slot), pair(1, 11));
    assert_eq!(
        map.insert_handle(Handle::Occupied(900), pair(1, 0)),
        Err(MapError::InvalidArgument)
    );
}

#[test]
fn test_swap_exchanges_records() {
    let mut map = WavlMap::<Pair>::new();
    map.insert(pair(1, 10)).unwrap();
    let mut record = pair(1, 99);
    let placed = map.swap(&mut record).unwrap();
    assert!(!placed.is_inserted());
    assert_eq!(record, pair(1, 10));
    assert_eq!(map.get(&1), Some(&pair(1, 99)));

    let mut vacant = pair(2, 5);
    let placed = map.swap(&mut vacant).unwrap();
    assert!(placed.is_inserted());
    assert_eq!(vacant, pair(2, 5));
    assert_eq!(map.get(&2), Some(&pair(2, 5)));
    assert!(map.is_valid_wavl_tree());
}

#[test]
fn test_and_modify_and_or_insert_with() {
    let mut map = WavlMap::<Pair>::new();
    let handle = map.handle(&3);
    let slot = map.or_insert_with(handle, || pair(3, 30)).unwrap();
    assert_eq!(*map.get_node(slot), pair(3, 30));
    let handle = map.handle(&3);
    map.and_modify(handle, |v| v.val += 1);
    assert_eq!(map.get(&3), Some(&pair(3, 31)));
    // vacant handles are left alone
    let vacant = map.handle(&4);
    map.and_modify(vacant, |v| v.val += 1);
    assert!(!map.contains(&4));
}

#[test]
fn test_ascending_and_descending_inserts_stay_valid() {
    let mut up = WavlMap::<Pair>::new();
    let mut down = WavlMap::<Pair>::new();
    for k in 1..=128 {
        up.try_insert(pair(k, k)).unwrap();
        down.try_insert(pair(-k, k)).unwrap();
        assert!(up.is_valid_wavl_tree());
        assert!(down.is_valid_wavl_tree());
        assert!(wavl_height_bound(&up));
        assert!(wavl_height_bound(&down));
    }
    assert_eq!(
        up.iter().map(|v| v.key).collect::<Vec<_>>(),
        (1..=128).collect::<Vec<_>>()
    );
    assert_eq!(
        down.iter().map(|v| v.key).collect::<Vec<_>>(),
        (-128..=-1).collect::<Vec<_>>()
    );
}

#[test]
fn test_remove_stays_valid_in_every_direction() {
    for removal in 0..3 {
        let mut map = WavlMap::<Pair>::new();
        for k in 1..=64 {
            map.try_insert(pair(k, k)).unwrap();
        }
        let keys: Vec<i32> = match removal {
            0 => (1..=64).collect(),
            1 => (1..=64).rev().collect(),
            // inside-out removals exercise the two-child transplant
            _ => (32..=64).chain((1..=31).rev()).collect(),
        };
        let mut remaining = 64usize;
        for k in keys {
            assert_eq!(map.remove(&k), Some(pair(k, k)));
            remaining -= 1;
            assert_eq!(map.len(), remaining);
            assert!(map.is_valid_wavl_tree());
            assert!(wavl_height_bound(&map));
        }
        assert!(map.is_empty());
    }
}

#[test]
fn test_remove_two_child_node_keeps_order() {
    let mut map = WavlMap::<Pair>::new();
    for k in [50, 25, 75, 12, 37, 62, 87, 31, 43] {
        map.try_insert(pair(k, k)).unwrap();
    }
    // 25 has two children; its successor 31 takes its place
    assert_eq!(map.remove(&25), Some(pair(25, 25)));
    assert!(map.is_valid_wavl_tree());
    assert_eq!(
        map.iter().map(|v| v.key).collect::<Vec<_>>(),
        vec![12, 31, 37, 43, 50, 62, 75, 87]
    );
    assert_eq!(map.remove(&50), Some(pair(50, 50)));
    assert!(map.is_valid_wavl_tree());
    assert_eq!(
        map.iter().map(|v| v.key).collect::<Vec<_>>(),
        vec![12, 31, 37, 43, 62, 75, 87]
    );
}

#[test]
fn test_remove_slot_by_handle() {
    let mut map = WavlMap::<Pair>::new();
    map.insert(pair(1, 10)).unwrap();
    let slot = map.insert(pair(2, 20)).unwrap().slot();
    map.insert(pair(3, 30)).unwrap();
    assert_eq!(map.remove_slot(slot), Some(pair(2, 20)));
    assert_eq!(map.len(), 2);
    assert!(map.is_valid_wavl_tree());
    // the freed slot no longer names a record
    assert_eq!(map.remove_slot(slot), None);
    assert_eq!(map.remove_slot(900), None);
}

#[test]
fn test_iterators_meet_in_the_middle() {
    let mut map = WavlMap::<Pair>::new();
    for k in 1..=7 {
        map.try_insert(pair(k, k * 10)).unwrap();
    }
    let mut it = map.iter();
    assert_eq!(it.next().map(|v| v.key), Some(1));
    assert_eq!(it.next_back().map(|v| v.key), Some(7));
    assert_eq!(it.next().map(|v| v.key), Some(2));
    assert_eq!(it.next_back().map(|v| v.key), Some(6));
    assert_eq!(it.next().map(|v| v.key), Some(3));
    assert_eq!(it.next_back().map(|v| v.key), Some(5));
    assert_eq!(it.next().map(|v| v.key), Some(4));
    assert_eq!(it.next(), None);
    assert_eq!(it.next_back(), None);
    assert_eq!(it.next(), None);
}

#[test]
fn test_iter_mut_updates_in_place() {
    let mut map = WavlMap::<Pair>::new();
    for k in 1..=10 {
        map.try_insert(pair(k, 0)).unwrap();
    }
    for v in map.iter_mut() {
        v.val = v.key * 2;
    }
    for k in 1..=10 {
        assert_eq!(map.get(&k), Some(&pair(k, k * 2)));
    }
    for v in map.iter_mut().rev() {
        v.val += 1;
    }
    assert_eq!(map.get(&10), Some(&pair(10, 21)));
}

#[test]
fn test_bounds_and_ranges() {
    let mut map = WavlMap::<Pair>::new();
    for k in [10, 20, 30, 40] {
        map.try_insert(pair(k, k)).unwrap();
    }
    assert_eq!(map.get_node(map.lower_bound(&15)).key, 20);
    assert_eq!(map.get_node(map.lower_bound(&20)).key, 20);
    assert_eq!(map.get_node(map.upper_bound(&30)).key, 40);
    assert_eq!(map.upper_bound(&40), SENTINEL);
    assert_eq!(map.lower_bound(&41), SENTINEL);
    let (lo, hi) = map.equal_range(&15, &35);
    assert_eq!(map.get_node(lo).key, 20);
    assert_eq!(map.get_node(hi).key, 40);
    assert_eq!(
        map.range(&15, &35).map(|v| v.key).collect::<Vec<_>>(),
        vec![20, 30]
    );
    assert_eq!(
        map.range_rev(&15, &35).map(|v| v.key).collect::<Vec<_>>(),
        vec![30, 20]
    );
    assert_eq!(
        map.range(&10, &40).map(|v| v.key).collect::<Vec<_>>(),
        vec![10, 20, 30, 40]
    );
    assert_eq!(map.range(&35, &15).next(), None);
}

#[test]
fn test_cursor_traversal_matches_iteration() {
    let mut map = WavlMap::<Pair>::new();
    for k in [5, 3, 8, 1, 4, 7, 9] {
        map.try_insert(pair(k, k)).unwrap();
    }
    let mut keys = vec![];
    let mut slot = map.find_min_index();
    while slot != SENTINEL {
        keys.push(map.get_node(slot).key);
        slot = map.next_slot(slot, Branch::Right);
    }
    assert_eq!(keys, vec![1, 3, 4, 5, 7, 8, 9]);
    let mut slot = map.find_max_index();
    keys.clear();
    while slot != SENTINEL {
        keys.push(map.get_node(slot).key);
        slot = map.next_slot(slot, Branch::Left);
    }
    assert_eq!(keys, vec![9, 8, 7, 5, 4, 3, 1]);
}

#[test]
fn test_slots_are_stable_across_grows() {
    let mut map = WavlMap::<Pair>::new();
    let mut slots = vec![];
    for k in 1..=200 {
        slots.push((k, map.try_insert(pair(k, k)).unwrap().slot()));
    }
    assert!(map.capacity() >= 200);
    for (k, slot) in slots {
        assert_eq!(map.get_slot(&k), slot);
        assert_eq!(*map.get_node(slot), pair(k, k));
    }
    assert!(map.is_valid_wavl_tree());
}

#[test]
fn test_fixed_buffer_map() {
    let mut words = vec![0u64; 128];
    let buf: &mut [u8] = bytemuck::cast_slice_mut(words.as_mut_slice());
    let mut map = WavlMap::<Pair>::from_buffer(buf).unwrap();
    let capacity = map.capacity() as i32;
    assert!(capacity > 0);
    for k in 1..=capacity {
        map.try_insert(pair(k, k)).unwrap();
    }
    assert_eq!(
        map.try_insert(pair(capacity + 1, 0)),
        Err(MapError::CapacityExhausted)
    );
    assert_eq!(map.len(), capacity as usize);
    assert!(map.is_valid_wavl_tree());
    assert_eq!(map.reserve(1), Err(MapError::CapacityExhausted));
    assert_eq!(map.clear_and_free(), Err(MapError::CapacityExhausted));
    map.remove(&1).unwrap();
    map.try_insert(pair(capacity + 1, 0)).unwrap();
    assert!(map.is_valid_wavl_tree());
}

#[test]
fn test_misaligned_buffer_is_rejected() {
    let mut words = vec![0u64; 128];
    let buf: &mut [u8] = bytemuck::cast_slice_mut(words.as_mut_slice());
    assert!(WavlMap::<Pair>::from_buffer(&mut buf[1..]).is_err());
}

#[test]
fn test_copy_from_preserves_slots() {
    let mut src = WavlMap::<Pair>::new();
    for k in 1..=50 {
        src.try_insert(pair(k, k * 3)).unwrap();
    }
    src.remove(&17).unwrap();
    src.remove(&33).unwrap();

    let mut dst = WavlMap::<Pair>::new();
    dst.copy_from(&src).unwrap();
    assert_eq!(dst.len(), src.len());
    assert!(dst.is_valid_wavl_tree());
    for v in src.iter() {
        assert_eq!(dst.get_slot(&v.key), src.get_slot(&v.key));
        assert_eq!(dst.get(&v.key), Some(v));
    }

    // a larger destination keeps its buffer and its extra capacity
    let mut wide = WavlMap::<Pair>::with_capacity(500).unwrap();
    let wide_capacity = wide.capacity();
    wide.copy_from(&src).unwrap();
    assert_eq!(wide.capacity(), wide_capacity);
    assert!(wide.is_valid_wavl_tree());
    for k in 100..200 {
        wide.try_insert(pair(k, 0)).unwrap();
    }
    assert!(wide.is_valid_wavl_tree());
}

#[test]
fn test_clear_preserves_capacity() {
    let mut map = WavlMap::<Pair>::new();
    for k in 1..=40 {
        map.try_insert(pair(k, k)).unwrap();
    }
    let capacity = map.capacity();
    map.clear();
    assert!(map.is_empty());
    assert_eq!(map.capacity(), capacity);
    assert!(map.is_valid_wavl_tree());
    for k in 1..=40 {
        map.try_insert(pair(k, k)).unwrap();
    }
    assert_eq!(map.capacity(), capacity);
}

#[test]
fn test_clear_with_runs_dtor_once_per_record() {
    let mut map = WavlMap::<Pair>::new();
    for k in 1..=25 {
        map.try_insert(pair(k, k)).unwrap();
    }
    let mut seen = vec![];
    map.clear_with(|v| seen.push(v.key));
    seen.sort_unstable();
    assert_eq!(seen, (1..=25).collect::<Vec<_>>());
    assert!(map.is_empty());

    for k in 1..=5 {
        map.try_insert(pair(k, k)).unwrap();
    }
    let mut count = 0;
    map.clear_and_free_with(|_| count += 1).unwrap();
    assert_eq!(count, 5);
    assert_eq!(map.capacity(), 0);
    assert!(map.is_valid_wavl_tree());
}

#[test]
fn test_index_by_key() {
    let mut map = WavlMap::<Pair>::new();
    map.insert(pair(1, 10)).unwrap();
    assert_eq!(map[&1], pair(1, 10));
    map[&1].val = 11;
    assert_eq!(map[&1].val, 11);
}

#[test]
fn test_insert_or_assign_of_equal_record_is_idempotent() {
    let mut map = WavlMap::<Pair>::new();
    for k in 1..=20 {
        map.try_insert(pair(k, k)).unwrap();
    }
    let before: Vec<Pair> = map.iter().copied().collect();
    map.insert(pair(10, 10)).unwrap();
    assert_eq!(map.len(), 20);
    assert!(map.is_valid_wavl_tree());
    assert_eq!(map.iter().copied().collect::<Vec<_>>(), before);
}
