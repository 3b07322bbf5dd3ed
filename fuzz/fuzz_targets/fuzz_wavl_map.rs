#![no_main]
use arbor::WavlMap;
use arbor_fuzz::{perform_action, WavlMapAction};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|actions: Vec<WavlMapAction>| {
    let mut map = WavlMap::new();
    let mut keys = Vec::new();
    for action in actions {
        perform_action(&mut map, &mut keys, action);
    }
    assert!(map.is_valid_wavl_tree());
});
