use arbor::{Branch, MapError, Record, WavlMap, SENTINEL};
use bytemuck::{Pod, Zeroable};
use itertools::Itertools;
use rand::rngs::ThreadRng;
use rand::seq::SliceRandom;
use rand::{thread_rng, Rng};
use std::collections::BTreeMap;

const MAX_SIZE: usize = 5000;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct Widget {
    key: u64,
    a: u64,
    b: u64,
}

unsafe impl Zeroable for Widget {}
unsafe impl Pod for Widget {}

impl Record for Widget {
    type Key = u64;
    fn key(&self) -> u64 {
        self.key
    }
}

impl Widget {
    fn new_random(rng: &mut ThreadRng, key: u64) -> Self {
        Self {
            key,
            a: rng.gen::<u64>(),
            b: rng.gen::<u64>(),
        }
    }
}

fn assert_same_content(tree: &WavlMap<Widget>, shadow: &BTreeMap<u64, Widget>) {
    assert_eq!(tree.len(), shadow.len());
    for ((k, w), v) in shadow.iter().zip(tree.iter()) {
        assert_eq!(*k, v.key);
        assert_eq!(*w, *v);
    }
    for ((k, w), v) in shadow.iter().rev().zip(tree.iter().rev()) {
        assert_eq!(*k, v.key);
        assert_eq!(*w, *v);
    }
}

fn wavl_height_bound(tree: &WavlMap<Widget>) -> bool {
    tree.height() as f64 <= 2.0 * ((tree.len() + 2) as f64).log2().ceil()
}

fn simulate(tree: &mut WavlMap<Widget>) {
    let mut rng = thread_rng();
    let mut shadow = Box::new(BTreeMap::new());
    let mut keys = vec![];
    let mut live = 0usize;

    for _ in 0..MAX_SIZE {
        let k = rng.gen::<u64>();
        let w = Widget::new_random(&mut rng, k);
        if tree.insert(w).unwrap().is_inserted() {
            live += 1;
            keys.push(k);
        }
        assert_eq!(live, tree.len());
        shadow.insert(k, w);
    }
    assert!(tree.is_valid_wavl_tree());
    assert!(wavl_height_bound(tree));
    assert_same_content(tree, &shadow);

    let mut rand_keys = keys.clone();
    rand_keys.shuffle(&mut rng);
    for k in rand_keys.iter() {
        assert!(tree.remove(k).is_some());
        shadow.remove(k);
        live -= 1;
    }
    assert!(tree.len() == 0);
    assert!(tree.is_valid_wavl_tree());
    keys = vec![];

    for _ in 0..100 {
        assert_eq!(live, tree.len());
        let sample = rng.gen::<f64>();
        if sample < 0.33 {
            let num_samples = rng.gen_range(0, 200);
            for _ in 0..num_samples {
                let k = rng.gen::<u64>();
                let w = Widget::new_random(&mut rng, k);
                if tree.insert(w).unwrap().is_inserted() {
                    live += 1;
                    keys.push(k);
                }
                shadow.insert(k, w);
            }
        } else if sample < 0.66 {
            if tree.len() < 2 {
                continue;
            }
            let num_samples = rng.gen_range(0, tree.len() / 2);
            for _ in 0..num_samples {
                assert!(!keys.is_empty());
                let j = rng.gen_range(0, keys.len());
                let key = keys[j];
                keys.swap_remove(j);
                assert_eq!(tree.remove(&key).unwrap(), shadow[&key]);
                shadow.remove(&key);
                live -= 1;
            }
        } else {
            if tree.len() == 0 {
                continue;
            }
            let num_samples = rng.gen_range(0, tree.len());
            for _ in 0..num_samples {
                let j = rng.gen_range(0, keys.len());
                let key = keys[j];
                let w = Widget::new_random(&mut rng, key);
                *tree.get_mut(&key).unwrap() = w;
                shadow.insert(key, w);
            }
        }
        assert!(wavl_height_bound(tree));
    }
    assert!(tree.is_valid_wavl_tree());
    assert_same_content(tree, &shadow);

    // overwrite through the mutable iterator, both directions
    let mut rewritten = BTreeMap::new();
    for v in tree.iter_mut() {
        let w = Widget::new_random(&mut rng, v.key);
        *v = w;
        rewritten.insert(w.key, w);
    }
    assert_same_content(tree, &rewritten);
    let mut rewritten = BTreeMap::new();
    for v in tree.iter_mut().rev() {
        let w = Widget::new_random(&mut rng, v.key);
        *v = w;
        rewritten.insert(w.key, w);
    }
    assert_same_content(tree, &rewritten);
    let mut shadow = rewritten;

    // double ended iterator meets exactly once
    while tree.len() < 16 {
        let k = rng.gen::<u64>();
        let w = Widget::new_random(&mut rng, k);
        tree.insert(w).unwrap();
        shadow.insert(k, w);
    }
    {
        let mut tree_iter = tree.iter();
        let mut shadow_iter = shadow.iter();
        let breakpoint = rng.gen_range(1, shadow.len() - 1);
        for _ in 0..breakpoint {
            let a = tree_iter.next();
            let b = shadow_iter.next();
            assert!(a.is_some() && b.is_some());
            assert_eq!(a.unwrap(), b.unwrap().1);
        }
        for _ in breakpoint..shadow.len() {
            let a = tree_iter.next_back();
            let b = shadow_iter.next_back();
            assert!(a.is_some() && b.is_some());
            assert_eq!(a.unwrap(), b.unwrap().1);
        }
        assert!(tree_iter.next().is_none());
        assert!(tree_iter.next_back().is_none());
        // do it again for good measure
        assert!(tree_iter.next().is_none());
        assert!(tree_iter.next_back().is_none());
    }

    // a consumed iterator stays consumed
    {
        let mut tree_iter = tree.iter();
        for _ in 0..tree.len() {
            assert!(tree_iter.next().is_some());
        }
        assert!(tree_iter.next().is_none());
        assert!(tree_iter.next_back().is_none());
        let mut tree_iter = tree.iter();
        for _ in 0..tree.len() {
            assert!(tree_iter.next_back().is_some());
        }
        assert!(tree_iter.next_back().is_none());
        assert!(tree_iter.next().is_none());
    }

    // unsorted collection of the same records sorts to the same order
    let collected = tree.iter().copied().collect::<Vec<_>>();
    for (a, b) in collected.iter().sorted().zip(tree.iter()) {
        assert_eq!(a, b);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_simulate_growable_map() {
    let mut tree = WavlMap::<Widget>::new();
    simulate(&mut tree);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_simulate_preallocated_map() {
    let mut tree = WavlMap::<Widget>::with_capacity(5 * MAX_SIZE as u32).unwrap();
    let capacity = tree.capacity();
    simulate(&mut tree);
    assert_eq!(tree.capacity(), capacity);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shuffled_insert_remove_stays_within_wavl_height() {
    let mut rng = thread_rng();
    let mut tree = WavlMap::<Widget>::new();
    let mut keys: Vec<u64> = (1..=10_000).collect();
    keys.shuffle(&mut rng);
    for (step, k) in keys.iter().enumerate() {
        let slot = tree
            .try_insert(Widget::new_random(&mut rng, *k))
            .unwrap()
            .slot();
        assert_ne!(slot, SENTINEL);
        assert!(tree.contains(k));
        assert!(wavl_height_bound(&tree));
        if step % 97 == 0 {
            assert!(tree.is_valid_wavl_tree());
        }
    }
    assert_eq!(tree.len(), 10_000);

    keys.shuffle(&mut rng);
    for (step, k) in keys.iter().enumerate() {
        assert_eq!(tree.remove(k).map(|w| w.key), Some(*k));
        assert!(!tree.contains(k));
        assert!(wavl_height_bound(&tree));
        if step % 97 == 0 {
            assert!(tree.is_valid_wavl_tree());
        }
    }
    assert!(tree.is_empty());
    assert!(tree.is_valid_wavl_tree());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_slots_survive_grows_and_unrelated_removals() {
    let mut rng = thread_rng();
    let mut tree = WavlMap::<Widget>::new();
    let mut pinned: Vec<(u64, u32)> = vec![];
    for k in 0..2000u64 {
        let slot = tree
            .try_insert(Widget::new_random(&mut rng, k))
            .unwrap()
            .slot();
        if k % 5 == 0 {
            pinned.push((k, slot));
        } else if k % 3 == 0 {
            // unrelated removals in between keep the free list busy
            tree.remove(&k).unwrap();
        }
        for (key, slot) in pinned.iter() {
            assert_eq!(tree.get_slot(key), *slot);
        }
    }
    assert!(tree.is_valid_wavl_tree());
    for (key, slot) in pinned {
        assert_eq!(tree.get_node(slot).key, key);
        assert_eq!(tree.remove_slot(slot).map(|w| w.key), Some(key));
    }
    assert!(tree.is_valid_wavl_tree());
}

#[test]
fn test_fixed_buffer_end_to_end() {
    let mut words = vec![0u64; 8192];
    let buf: &mut [u8] = bytemuck::cast_slice_mut(words.as_mut_slice());
    let mut rng = thread_rng();
    let mut tree = WavlMap::<Widget>::from_buffer(buf).unwrap();
    let capacity = tree.capacity();
    assert!(capacity > 0);

    let mut keys: Vec<u64> = (0..capacity as u64).collect();
    keys.shuffle(&mut rng);
    for k in keys.iter() {
        tree.try_insert(Widget::new_random(&mut rng, *k)).unwrap();
    }
    assert_eq!(
        tree.try_insert(Widget::new_random(&mut rng, u64::MAX)),
        Err(MapError::CapacityExhausted)
    );
    assert_eq!(tree.len(), capacity);
    assert!(tree.is_valid_wavl_tree());

    keys.shuffle(&mut rng);
    for k in keys.iter().take(capacity / 2) {
        tree.remove(k).unwrap();
    }
    assert!(tree.is_valid_wavl_tree());
    for k in keys.iter().take(capacity / 2) {
        tree.try_insert(Widget::new_random(&mut rng, *k)).unwrap();
    }
    assert_eq!(tree.len(), capacity);
    assert!(tree.is_valid_wavl_tree());
}

#[test]
fn test_copy_between_buffers_and_heap() {
    let mut rng = thread_rng();
    let mut src = WavlMap::<Widget>::new();
    for k in 0..500u64 {
        src.try_insert(Widget::new_random(&mut rng, k)).unwrap();
    }
    for k in (0..500u64).step_by(7) {
        src.remove(&k).unwrap();
    }

    // heap to heap
    let mut dst = WavlMap::<Widget>::new();
    dst.copy_from(&src).unwrap();
    assert!(dst.is_valid_wavl_tree());
    for v in src.iter() {
        assert_eq!(dst.get_slot(&v.key), src.get_slot(&v.key));
    }

    // heap into an adopted buffer of equal or greater capacity
    let mut words = vec![0u64; 8192];
    let buf: &mut [u8] = bytemuck::cast_slice_mut(words.as_mut_slice());
    let mut fixed = WavlMap::<Widget>::from_buffer(buf).unwrap();
    assert!(fixed.capacity() >= src.capacity());
    fixed.copy_from(&src).unwrap();
    assert!(fixed.is_valid_wavl_tree());
    assert_same_content(
        &fixed,
        &src.iter().map(|v| (v.key, *v)).collect::<BTreeMap<_, _>>(),
    );

    // an adopted buffer that is too small must refuse without damage
    let mut small_words = vec![0u64; 64];
    let small: &mut [u8] = bytemuck::cast_slice_mut(small_words.as_mut_slice());
    let mut tiny = WavlMap::<Widget>::from_buffer(small).unwrap();
    tiny.try_insert(Widget::new_random(&mut rng, 1)).unwrap();
    assert_eq!(tiny.copy_from(&src), Err(MapError::CapacityExhausted));
    assert_eq!(tiny.len(), 1);
    assert!(tiny.is_valid_wavl_tree());
}

#[test]
fn test_equal_range_matches_btree_range() {
    let mut rng = thread_rng();
    let mut tree = WavlMap::<Widget>::new();
    let mut shadow = BTreeMap::new();
    for _ in 0..1000 {
        let k = rng.gen_range(0, 10_000u64);
        let w = Widget::new_random(&mut rng, k);
        tree.insert(w).unwrap();
        shadow.insert(k, w);
    }
    for _ in 0..200 {
        let a = rng.gen_range(0, 10_000u64);
        let b = rng.gen_range(0, 10_000u64);
        let (lo, hi) = (a.min(b), a.max(b));
        let expected: Vec<u64> = shadow.range(lo..=hi).map(|(k, _)| *k).collect();
        let got: Vec<u64> = tree.range(&lo, &hi).map(|v| v.key).collect();
        assert_eq!(got, expected);
        let got_rev: Vec<u64> = tree.range_rev(&lo, &hi).map(|v| v.key).collect();
        let mut expected_rev = expected.clone();
        expected_rev.reverse();
        assert_eq!(got_rev, expected_rev);
    }
}

#[test]
fn test_cursor_survives_mutation_between_steps() {
    let mut tree = WavlMap::<Widget>::new();
    for k in 0..100u64 {
        tree.try_insert(Widget {
            key: k,
            a: k,
            b: 0,
        })
        .unwrap();
    }
    // walk even keys while deleting the odd ones ahead of the cursor
    let mut slot = tree.find_min_index();
    let mut visited = vec![];
    while slot != SENTINEL {
        let key = tree.get_node(slot).key;
        visited.push(key);
        let next = tree.next_slot(slot, Branch::Right);
        if key + 1 < 100 {
            tree.remove(&(key + 1)).unwrap();
        }
        slot = if next != SENTINEL && key + 1 < 100 {
            // the removed neighbor was between us and `next` only when it
            // was the next key itself
            tree.next_slot(slot, Branch::Right)
        } else {
            next
        };
    }
    assert_eq!(visited, (0..100).step_by(2).collect::<Vec<_>>());
    assert!(tree.is_valid_wavl_tree());
}
