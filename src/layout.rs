use bytemuck::{Pod, Zeroable};
use std::mem::{align_of, size_of};

/// Parity block word; one rank-parity bit per slot.
pub type Block = u64;

/// Bits per parity block.
pub const BLOCK_BITS: usize = Block::BITS as usize;

/// Largest element alignment the single-allocation layout supports. Owned
/// buffers are allocated as `Block` words, so a larger element alignment
/// could not be honored at the start of the data region.
pub const MAX_ELEMENT_ALIGN: usize = align_of::<Block>();

/// Tree metadata for one slot. `branch` holds the child slot indices.
/// `up` holds the parent index while the slot is reachable from the root,
/// and the next free index while the slot sits on the free list; which of
/// the two it means follows from which set currently owns the slot.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct SlotLinks {
    pub branch: [u32; 2],
    pub up: u32,
}

unsafe impl Zeroable for SlotLinks {}
unsafe impl Pod for SlotLinks {}

/// Byte placement of the three arrays inside one allocation:
/// `[ data | nodes | parity ]`. Data comes first so elements keep their
/// natural alignment without intrusive padding; the node array is
/// index-only; the parity bits pack last and may leave trailing bits
/// unused.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Plan {
    pub capacity: u32,
    pub node_offset: usize,
    pub parity_offset: usize,
    pub total_bytes: usize,
}

#[inline(always)]
fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

impl Plan {
    pub fn new(elem_size: usize, elem_align: usize, capacity: u32) -> Self {
        assert!(
            elem_align <= MAX_ELEMENT_ALIGN,
            "element alignment {} exceeds the supported maximum ({})",
            elem_align,
            MAX_ELEMENT_ALIGN,
        );
        let data_bytes = elem_size * capacity as usize;
        let node_offset = align_up(data_bytes, align_of::<SlotLinks>());
        let node_end = node_offset + size_of::<SlotLinks>() * capacity as usize;
        let parity_offset = align_up(node_end, align_of::<Block>());
        let total_bytes = parity_offset + Self::parity_words(capacity) * size_of::<Block>();
        Plan {
            capacity,
            node_offset,
            parity_offset,
            total_bytes,
        }
    }

    /// Number of `Block` words needed for `capacity` parity bits.
    #[inline(always)]
    pub fn parity_words(capacity: u32) -> usize {
        (capacity as usize + BLOCK_BITS - 1) / BLOCK_BITS
    }

    /// Alignment the backing buffer must provide.
    #[inline(always)]
    pub fn buffer_align(elem_align: usize) -> usize {
        elem_align.max(align_of::<Block>())
    }

    /// Largest capacity whose plan fits in `bytes`.
    pub fn max_capacity(elem_size: usize, elem_align: usize, bytes: usize) -> u32 {
        let per_slot = elem_size + size_of::<SlotLinks>();
        let mut capacity = (bytes / per_slot.max(1)).min(u32::MAX as usize) as u32;
        while capacity > 0 && Plan::new(elem_size, elem_align, capacity).total_bytes > bytes {
            capacity -= 1;
        }
        capacity
    }
}

#[test]
fn test_plan_offsets_are_aligned() {
    for elem_size in [1usize, 2, 4, 8, 12, 16, 24, 40] {
        let elem_align = elem_size.min(8).next_power_of_two().min(8);
        for capacity in [0u32, 1, 2, 7, 8, 63, 64, 65, 1000] {
            let plan = Plan::new(elem_size, elem_align, capacity);
            assert!(plan.node_offset >= elem_size * capacity as usize);
            assert_eq!(plan.node_offset % align_of::<SlotLinks>(), 0);
            assert_eq!(plan.parity_offset % align_of::<Block>(), 0);
            assert_eq!(plan.total_bytes % size_of::<Block>(), 0);
            assert!(
                plan.parity_offset >= plan.node_offset + size_of::<SlotLinks>() * capacity as usize
            );
        }
    }
}

#[test]
fn test_plan_total_grows_with_capacity() {
    let mut last = 0;
    for capacity in 1..=512u32 {
        let plan = Plan::new(16, 8, capacity);
        assert!(plan.total_bytes > last);
        last = plan.total_bytes;
    }
}

#[test]
fn test_max_capacity_round_trips() {
    for elem_size in [4usize, 8, 16, 24] {
        for capacity in [2u32, 8, 64, 65, 500] {
            let total = Plan::new(elem_size, 4, capacity).total_bytes;
            assert_eq!(Plan::max_capacity(elem_size, 4, total), capacity);
            assert_eq!(Plan::max_capacity(elem_size, 4, total - 1), capacity - 1);
        }
    }
}

#[test]
fn test_parity_words_cover_every_slot() {
    assert_eq!(Plan::parity_words(0), 0);
    assert_eq!(Plan::parity_words(1), 1);
    assert_eq!(Plan::parity_words(64), 1);
    assert_eq!(Plan::parity_words(65), 2);
    assert_eq!(Plan::parity_words(128), 2);
    assert_eq!(Plan::parity_words(129), 3);
}
