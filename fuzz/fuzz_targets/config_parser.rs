#![no_main]

use callrank::config::EngineConfig;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(input) = std::str::from_utf8(data) {
        // Must reject bad input with an error, never a panic
        if let Ok(config) = EngineConfig::from_toml_str(input) {
            assert!(config.validate().is_ok());
        }
    }
});
