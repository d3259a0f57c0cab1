#![no_main]

use callrank::Engine;
use libfuzzer_sys::fuzz_target;

const NAMES: [&str; 4] = ["a", "b", "c", "d"];

// Arbitrary enter/exit interleavings, including unmatched exits
fuzz_target!(|data: &[u8]| {
    let engine = Engine::with_defaults();
    engine.initialize();
    for byte in data {
        let name = NAMES[usize::from(byte & 0x03)];
        match (byte >> 2) & 0x03 {
            0 | 1 => {
                engine.enter(name, false);
            }
            2 => {
                engine.exit(name, false);
            }
            _ => {
                engine.housekeep();
            }
        }
    }
    let published = engine.global_published();
    assert!(published.len() <= 10);
});
