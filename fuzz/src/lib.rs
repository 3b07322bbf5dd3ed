use arbitrary::Arbitrary;
use arbor::{Record, WavlMap};
use bytemuck::{Pod, Zeroable};
use rand::thread_rng;
use rand::Rng;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: u64,
    pub payload: u64,
}

unsafe impl Zeroable for Entry {}
unsafe impl Pod for Entry {}

impl Record for Entry {
    type Key = u64;
    fn key(&self) -> u64 {
        self.key
    }
}

#[derive(Debug, Arbitrary, Clone, Copy)]
pub enum WavlMapAction {
    Insert { key: u64, payload: u64 },
    Upsert { payload: u64 },
    Swap { payload: u64 },
    Remove,
    RemoveSlot,
    Iter,
    IterRev,
    Range { a: u64, b: u64 },
    Validate,
}

pub fn perform_action(map: &mut WavlMap<Entry>, keys: &mut Vec<u64>, action: WavlMapAction) {
    let mut rng = thread_rng();
    match action {
        WavlMapAction::Insert { key, payload } => {
            let placed = map.try_insert(Entry { key, payload }).unwrap();
            if placed.is_inserted() {
                keys.push(key);
            }
            assert_eq!(map.get(&key).unwrap().key, key);
        }
        WavlMapAction::Upsert { payload } => {
            if keys.is_empty() {
                return;
            }
            let key = keys[rng.gen_range(0, keys.len())];
            map.insert(Entry { key, payload }).unwrap();
            assert_eq!(*map.get(&key).unwrap(), Entry { key, payload });
        }
        WavlMapAction::Swap { payload } => {
            if keys.is_empty() {
                return;
            }
            let key = keys[rng.gen_range(0, keys.len())];
            let stored = *map.get(&key).unwrap();
            let mut record = Entry { key, payload };
            assert!(!map.swap(&mut record).unwrap().is_inserted());
            assert_eq!(record, stored);
            assert_eq!(*map.get(&key).unwrap(), Entry { key, payload });
        }
        WavlMapAction::Remove => {
            if keys.is_empty() {
                return;
            }
            let j = rng.gen_range(0, keys.len());
            let key = keys.swap_remove(j);
            assert_eq!(map.remove(&key).unwrap().key, key);
            assert!(!map.contains(&key));
        }
        WavlMapAction::RemoveSlot => {
            if keys.is_empty() {
                return;
            }
            let j = rng.gen_range(0, keys.len());
            let key = keys.swap_remove(j);
            let slot = map.get_slot(&key);
            assert_eq!(map.remove_slot(slot).unwrap().key, key);
        }
        WavlMapAction::Iter => {
            let mut last = None;
            for v in map.iter() {
                if let Some(prev) = last {
                    assert!(prev < v.key);
                }
                last = Some(v.key);
            }
        }
        WavlMapAction::IterRev => {
            let mut last = None;
            for v in map.iter().rev() {
                if let Some(prev) = last {
                    assert!(prev > v.key);
                }
                last = Some(v.key);
            }
        }
        WavlMapAction::Range { a, b } => {
            let (lo, hi) = (a.min(b), a.max(b));
            let mut last = None;
            for v in map.range(&lo, &hi) {
                assert!(lo <= v.key && v.key <= hi);
                if let Some(prev) = last {
                    assert!(prev < v.key);
                }
                last = Some(v.key);
            }
        }
        WavlMapAction::Validate => {
            assert!(map.is_valid_wavl_tree());
            assert_eq!(map.len(), keys.len());
        }
    }
}
