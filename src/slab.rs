use bytemuck::{Pod, Zeroable};
use std::marker::PhantomData;
use std::mem::{align_of, size_of};
use thiserror::Error;

use crate::layout::{Block, Plan, SlotLinks, BLOCK_BITS, MAX_ELEMENT_ALIGN};

pub const SENTINEL: u32 = 0;

/// Failures surfaced by slab and map operations. Every failure is local to
/// the reporting call; no partial structural mutation is left behind.
#[derive(Debug, Error, Copy, Clone, PartialEq, Eq)]
pub enum MapError {
    /// A buffer or handle argument failed a call-boundary precondition.
    #[error("invalid buffer or handle argument")]
    InvalidArgument,
    /// The storage is full and is not allowed to grow.
    #[error("capacity exhausted and the storage cannot grow")]
    CapacityExhausted,
    /// The global allocator declined a growth request.
    #[error("allocation failed")]
    AllocationFailed,
}

/// A fixed-size record stored at a slot. The record embeds its own key and
/// `key()` exposes it for ordering. Comparison through `PartialOrd` must be
/// total and independent of container state, and the key of a stored record
/// must not change while the record is in a container.
pub trait Record: Default + Copy + Clone + Pod + Zeroable {
    type Key: PartialOrd + Copy;
    fn key(&self) -> Self::Key;
}

enum Storage<'a> {
    /// Nothing allocated yet; the first insert allocates.
    Unallocated,
    /// Caller-supplied buffer. Capacity is fixed for the slab's lifetime.
    Adopted(&'a mut [u8]),
    /// Heap storage in `Block` words so the data region stays aligned.
    Owned(Vec<Block>),
}

/// Slot storage for one container: a single allocation split into a data
/// region, a node-link region, and a packed parity bit region, plus a LIFO
/// free list threaded through the `up` word of unused slots. Slot 0 is the
/// sentinel; it never holds a record and its parity is always set (rank -1).
/// Slot indices are stable across grows.
pub struct Slab<'a, V: Record> {
    storage: Storage<'a>,
    capacity: u32,
    free_list_head: u32,
    size: u32,
    _marker: PhantomData<V>,
}

impl<'a, V: Record> Default for Slab<'a, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, V: Record> Slab<'a, V> {
    pub fn new() -> Self {
        assert!(
            align_of::<V>() <= MAX_ELEMENT_ALIGN,
            "record alignment {} exceeds the supported maximum ({})",
            align_of::<V>(),
            MAX_ELEMENT_ALIGN,
        );
        Slab {
            storage: Storage::Unallocated,
            capacity: 0,
            free_list_head: SENTINEL,
            size: 0,
            _marker: PhantomData,
        }
    }

    /// Adopts a caller-supplied buffer in fixed-size mode. The buffer must
    /// be aligned for the record type and large enough for the sentinel
    /// plus at least one record.
    pub fn from_buffer(buf: &'a mut [u8]) -> Result<Self, MapError> {
        assert!(
            align_of::<V>() <= MAX_ELEMENT_ALIGN,
            "record alignment {} exceeds the supported maximum ({})",
            align_of::<V>(),
            MAX_ELEMENT_ALIGN,
        );
        if (buf.as_ptr() as usize) % Plan::buffer_align(align_of::<V>()) != 0 {
            return Err(MapError::InvalidArgument);
        }
        let capacity = Plan::max_capacity(size_of::<V>(), align_of::<V>(), buf.len());
        if capacity < 2 {
            return Err(MapError::InvalidArgument);
        }
        let mut slab = Slab {
            storage: Storage::Adopted(buf),
            capacity,
            free_list_head: SENTINEL,
            size: 0,
            _marker: PhantomData,
        };
        slab.format();
        Ok(slab)
    }

    #[inline(always)]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    #[inline(always)]
    pub fn len(&self) -> u32 {
        self.size
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    #[inline(always)]
    pub fn free_head(&self) -> u32 {
        self.free_list_head
    }

    /// Whether the slab owns its allocation and may grow or release it.
    #[inline(always)]
    pub fn owns_allocation(&self) -> bool {
        !matches!(self.storage, Storage::Adopted(_))
    }

    #[inline(always)]
    fn plan(&self) -> Plan {
        Plan::new(size_of::<V>(), align_of::<V>(), self.capacity)
    }

    fn bytes(&self) -> &[u8] {
        match &self.storage {
            Storage::Unallocated => &[],
            Storage::Adopted(buf) => buf,
            Storage::Owned(words) => bytemuck::cast_slice(words),
        }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        match &mut self.storage {
            Storage::Unallocated => &mut [],
            Storage::Adopted(buf) => buf,
            Storage::Owned(words) => bytemuck::cast_slice_mut(words),
        }
    }

    #[inline(always)]
    pub fn value(&self, i: u32) -> &V {
        let elem = size_of::<V>();
        bytemuck::from_bytes(&self.bytes()[i as usize * elem..(i as usize + 1) * elem])
    }

    #[inline(always)]
    pub fn value_mut(&mut self, i: u32) -> &mut V {
        let elem = size_of::<V>();
        bytemuck::from_bytes_mut(&mut self.bytes_mut()[i as usize * elem..(i as usize + 1) * elem])
    }

    #[inline(always)]
    pub fn links(&self, i: u32) -> SlotLinks {
        let offset = self.plan().node_offset + i as usize * size_of::<SlotLinks>();
        *bytemuck::from_bytes(&self.bytes()[offset..offset + size_of::<SlotLinks>()])
    }

    #[inline(always)]
    fn links_mut(&mut self, i: u32) -> &mut SlotLinks {
        let offset = self.plan().node_offset + i as usize * size_of::<SlotLinks>();
        bytemuck::from_bytes_mut(&mut self.bytes_mut()[offset..offset + size_of::<SlotLinks>()])
    }

    #[inline(always)]
    pub fn branch(&self, i: u32, dir: u32) -> u32 {
        self.links(i).branch[dir as usize]
    }

    #[inline(always)]
    pub fn set_branch(&mut self, i: u32, dir: u32, to: u32) {
        self.links_mut(i).branch[dir as usize] = to;
    }

    #[inline(always)]
    pub fn up(&self, i: u32) -> u32 {
        self.links(i).up
    }

    #[inline(always)]
    pub fn set_up(&mut self, i: u32, to: u32) {
        self.links_mut(i).up = to;
    }

    #[inline(always)]
    fn parity_block(&self, i: u32) -> usize {
        self.plan().parity_offset + (i as usize / BLOCK_BITS) * size_of::<Block>()
    }

    #[inline(always)]
    pub fn parity(&self, i: u32) -> bool {
        let offset = self.parity_block(i);
        let block: &Block = bytemuck::from_bytes(&self.bytes()[offset..offset + size_of::<Block>()]);
        (*block >> (i as usize % BLOCK_BITS)) & 1 == 1
    }

    pub fn set_parity(&mut self, i: u32, parity: bool) {
        let offset = self.parity_block(i);
        let block: &mut Block =
            bytemuck::from_bytes_mut(&mut self.bytes_mut()[offset..offset + size_of::<Block>()]);
        let bit: Block = 1 << (i as usize % BLOCK_BITS);
        if parity {
            *block |= bit;
        } else {
            *block &= !bit;
        }
    }

    /// One promote or demote: the rank moves by one, so only the stored
    /// parity bit flips.
    #[inline(always)]
    pub fn flip_parity(&mut self, i: u32) {
        let offset = self.parity_block(i);
        let block: &mut Block =
            bytemuck::from_bytes_mut(&mut self.bytes_mut()[offset..offset + size_of::<Block>()]);
        *block ^= 1 << (i as usize % BLOCK_BITS);
    }

    /// Takes a slot off the free list and initializes it with `v`: no
    /// children, no parent, rank 0. Grows when no slot is free.
    pub fn alloc(&mut self, v: V) -> Result<u32, MapError> {
        if self.free_list_head == SENTINEL {
            let target = (2 * self.capacity).max(8);
            self.grow(target)?;
        }
        let i = self.free_list_head;
        self.free_list_head = self.up(i);
        *self.links_mut(i) = SlotLinks::default();
        self.set_parity(i, false);
        *self.value_mut(i) = v;
        self.size += 1;
        Ok(i)
    }

    /// Resets a slot and pushes it onto the free list. The caller must have
    /// unlinked it from the tree already.
    pub fn free(&mut self, i: u32) {
        debug_assert_ne!(i, SENTINEL);
        let head = self.free_list_head;
        *self.links_mut(i) = SlotLinks {
            branch: [SENTINEL; 2],
            up: head,
        };
        self.free_list_head = i;
        self.size -= 1;
    }

    /// Ensures `additional` more records fit without another grow.
    pub fn reserve(&mut self, additional: u32) -> Result<(), MapError> {
        let need = self.size + additional + 1;
        if need <= self.capacity {
            return Ok(());
        }
        let target = need.max(2 * self.capacity).max(8);
        self.grow(target)
    }

    /// Grows to `new_cap` slots. The three regions move to their offsets
    /// under the new capacity one by one; slot indices are preserved and the
    /// fresh tail joins the free list lowest-index-first.
    pub fn grow(&mut self, new_cap: u32) -> Result<(), MapError> {
        if new_cap <= self.capacity {
            return Ok(());
        }
        if !self.owns_allocation() {
            return Err(MapError::CapacityExhausted);
        }
        let plan = Plan::new(size_of::<V>(), align_of::<V>(), new_cap);
        let words = plan.total_bytes / size_of::<Block>();
        let mut fresh: Vec<Block> = Vec::new();
        fresh
            .try_reserve_exact(words)
            .map_err(|_| MapError::AllocationFailed)?;
        fresh.resize(words, 0);
        let old_cap = self.capacity;
        if old_cap > 0 {
            let old_plan = self.plan();
            let old_bytes = self.bytes();
            let new_bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut fresh);
            let data_len = old_cap as usize * size_of::<V>();
            new_bytes[..data_len].copy_from_slice(&old_bytes[..data_len]);
            let node_len = old_cap as usize * size_of::<SlotLinks>();
            new_bytes[plan.node_offset..plan.node_offset + node_len]
                .copy_from_slice(&old_bytes[old_plan.node_offset..old_plan.node_offset + node_len]);
            let parity_len = Plan::parity_words(old_cap) * size_of::<Block>();
            new_bytes[plan.parity_offset..plan.parity_offset + parity_len].copy_from_slice(
                &old_bytes[old_plan.parity_offset..old_plan.parity_offset + parity_len],
            );
        }
        self.storage = Storage::Owned(fresh);
        self.capacity = new_cap;
        self.thread_tail(old_cap);
        self.set_parity(SENTINEL, true);
        Ok(())
    }

    /// Copies another slab's regions into this one at this slab's offsets.
    /// A large-enough destination buffer is kept; any extra destination
    /// slots are threaded onto the front of the copied free list.
    pub fn copy_from(&mut self, src: &Slab<'_, V>) -> Result<(), MapError> {
        if self.capacity < src.capacity {
            if !self.owns_allocation() {
                return Err(MapError::CapacityExhausted);
            }
            let plan = Plan::new(size_of::<V>(), align_of::<V>(), src.capacity);
            let words = plan.total_bytes / size_of::<Block>();
            let mut fresh: Vec<Block> = Vec::new();
            fresh
                .try_reserve_exact(words)
                .map_err(|_| MapError::AllocationFailed)?;
            fresh.resize(words, 0);
            self.storage = Storage::Owned(fresh);
            self.capacity = src.capacity;
        }
        if src.capacity == 0 {
            self.clear();
            return Ok(());
        }
        let src_plan = src.plan();
        let dst_plan = self.plan();
        let data_len = src.capacity as usize * size_of::<V>();
        let node_len = src.capacity as usize * size_of::<SlotLinks>();
        let parity_len = Plan::parity_words(src.capacity) * size_of::<Block>();
        let src_bytes = src.bytes();
        let dst_bytes = self.bytes_mut();
        dst_bytes[..data_len].copy_from_slice(&src_bytes[..data_len]);
        dst_bytes[dst_plan.node_offset..dst_plan.node_offset + node_len]
            .copy_from_slice(&src_bytes[src_plan.node_offset..src_plan.node_offset + node_len]);
        dst_bytes[dst_plan.parity_offset..dst_plan.parity_offset + parity_len].copy_from_slice(
            &src_bytes[src_plan.parity_offset..src_plan.parity_offset + parity_len],
        );
        self.free_list_head = src.free_list_head;
        self.size = src.size;
        self.thread_tail(src.capacity);
        Ok(())
    }

    /// Forgets every record and rebuilds the free list over the whole
    /// capacity. One pass; the allocation is kept.
    pub fn clear(&mut self) {
        self.size = 0;
        self.free_list_head = SENTINEL;
        self.thread_tail(0);
    }

    /// Returns the allocation. Fails for an adopted buffer, which the slab
    /// does not own.
    pub fn release(&mut self) -> Result<(), MapError> {
        if !self.owns_allocation() {
            return Err(MapError::CapacityExhausted);
        }
        self.storage = Storage::Unallocated;
        self.capacity = 0;
        self.free_list_head = SENTINEL;
        self.size = 0;
        Ok(())
    }

    /// Threads `[from, capacity)` onto the free list in descending order so
    /// the lowest new index pops first. Slot 0 is skipped.
    fn thread_tail(&mut self, from: u32) {
        let mut head = self.free_list_head;
        for i in (from.max(1)..self.capacity).rev() {
            self.set_up(i, head);
            head = i;
        }
        self.free_list_head = head;
    }

    /// Zeroes the metadata regions of an adopted buffer and threads the
    /// free list across it.
    fn format(&mut self) {
        let plan = self.plan();
        let node_len = self.capacity as usize * size_of::<SlotLinks>();
        let parity_len = Plan::parity_words(self.capacity) * size_of::<Block>();
        {
            let bytes = self.bytes_mut();
            bytes[plan.node_offset..plan.node_offset + node_len].fill(0);
            bytes[plan.parity_offset..plan.parity_offset + parity_len].fill(0);
        }
        self.free_list_head = SENTINEL;
        self.size = 0;
        self.thread_tail(0);
        self.set_parity(SENTINEL, true);
    }
}

#[cfg(test)]
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
struct Cell {
    key: u32,
    tag: u32,
}

#[cfg(test)]
unsafe impl Zeroable for Cell {}
#[cfg(test)]
unsafe impl Pod for Cell {}

#[cfg(test)]
impl Record for Cell {
    type Key = u32;
    fn key(&self) -> u32 {
        self.key
    }
}

#[cfg(test)]
fn cell(key: u32) -> Cell {
    Cell { key, tag: key * 10 }
}

#[test]
fn test_first_alloc_grows_lazily() {
    let mut slab = Slab::<Cell>::new();
    assert_eq!(slab.capacity(), 0);
    let i = slab.alloc(cell(7)).unwrap();
    assert_eq!(i, 1);
    assert_eq!(slab.capacity(), 8);
    assert_eq!(slab.len(), 1);
    assert!(slab.parity(SENTINEL));
    assert!(!slab.parity(i));
    assert_eq!(*slab.value(i), cell(7));
}

#[test]
fn test_fresh_tail_pops_lowest_index_first() {
    let mut slab = Slab::<Cell>::new();
    for expected in 1..8u32 {
        assert_eq!(slab.alloc(cell(expected)).unwrap(), expected);
    }
    // capacity 8 is exhausted; the next alloc doubles and continues at 8
    assert_eq!(slab.alloc(cell(8)).unwrap(), 8);
    assert_eq!(slab.capacity(), 16);
    for expected in 9..16u32 {
        assert_eq!(slab.alloc(cell(expected)).unwrap(), expected);
    }
}

#[test]
fn test_free_is_lifo() {
    let mut slab = Slab::<Cell>::new();
    for k in 1..=5u32 {
        slab.alloc(cell(k)).unwrap();
    }
    slab.free(3);
    slab.free(5);
    assert_eq!(slab.len(), 3);
    assert_eq!(slab.alloc(cell(50)).unwrap(), 5);
    assert_eq!(slab.alloc(cell(30)).unwrap(), 3);
    assert_eq!(slab.alloc(cell(60)).unwrap(), 6);
}

#[test]
fn test_grow_preserves_contents_and_indices() {
    let mut slab = Slab::<Cell>::new();
    for k in 1..8u32 {
        let i = slab.alloc(cell(k)).unwrap();
        slab.set_branch(i, 0, k % 3);
        slab.set_parity(i, k % 2 == 1);
    }
    slab.alloc(cell(100)).unwrap();
    assert_eq!(slab.capacity(), 16);
    for k in 1..8u32 {
        assert_eq!(*slab.value(k), cell(k));
        assert_eq!(slab.branch(k, 0), k % 3);
        assert_eq!(slab.parity(k), k % 2 == 1);
    }
    assert!(slab.parity(SENTINEL));
}

#[test]
fn test_adopted_buffer_is_fixed_size() {
    let mut words = vec![0u64; 64];
    let buf: &mut [u8] = bytemuck::cast_slice_mut(words.as_mut_slice());
    let mut slab = Slab::<Cell>::from_buffer(buf).unwrap();
    let capacity = slab.capacity();
    assert!(capacity >= 2);
    assert!(!slab.owns_allocation());
    for k in 1..capacity {
        slab.alloc(cell(k)).unwrap();
    }
    assert_eq!(slab.alloc(cell(999)), Err(MapError::CapacityExhausted));
    slab.free(1);
    assert_eq!(slab.alloc(cell(999)).unwrap(), 1);
    assert_eq!(slab.release(), Err(MapError::CapacityExhausted));
}

#[test]
fn test_misaligned_buffer_is_rejected() {
    let mut words = vec![0u64; 64];
    let buf: &mut [u8] = bytemuck::cast_slice_mut(words.as_mut_slice());
    assert_eq!(
        Slab::<Cell>::from_buffer(&mut buf[1..]).err(),
        Some(MapError::InvalidArgument)
    );
    assert_eq!(
        Slab::<Cell>::from_buffer(&mut buf[..8]).err(),
        Some(MapError::InvalidArgument)
    );
}

#[test]
fn test_reserve_preallocates() {
    let mut slab = Slab::<Cell>::new();
    slab.reserve(100).unwrap();
    let capacity = slab.capacity();
    assert!(capacity > 100);
    for k in 1..=100u32 {
        slab.alloc(cell(k)).unwrap();
    }
    assert_eq!(slab.capacity(), capacity);
}

#[test]
fn test_copy_from_threads_extra_capacity() {
    let mut src = Slab::<Cell>::new();
    for k in 1..=6u32 {
        src.alloc(cell(k)).unwrap();
    }
    src.free(2);

    let mut dst = Slab::<Cell>::new();
    dst.reserve(40).unwrap();
    dst.copy_from(&src).unwrap();
    assert_eq!(dst.len(), src.len());
    for k in [1u32, 3, 4, 5, 6] {
        assert_eq!(*dst.value(k), cell(k));
    }
    // destination tail slots pop before the copied free list
    assert_eq!(dst.alloc(cell(70)).unwrap(), src.capacity());
    let mut shrunk = Slab::<Cell>::new();
    shrunk.copy_from(&src).unwrap();
    assert_eq!(shrunk.capacity(), src.capacity());
    assert_eq!(shrunk.alloc(cell(20)).unwrap(), 2);
}

#[test]
fn test_clear_keeps_capacity() {
    let mut slab = Slab::<Cell>::new();
    for k in 1..=20u32 {
        slab.alloc(cell(k)).unwrap();
    }
    let capacity = slab.capacity();
    slab.clear();
    assert_eq!(slab.len(), 0);
    assert_eq!(slab.capacity(), capacity);
    assert!(slab.parity(SENTINEL));
    assert_eq!(slab.alloc(cell(1)).unwrap(), 1);
    slab.release().unwrap();
    assert_eq!(slab.capacity(), 0);
}
