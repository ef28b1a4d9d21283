#![no_main]

use libfuzzer_sys::fuzz_target;
use lockstat::config::ProfilerConfig;

fuzz_target!(|data: &[u8]| {
    if let Ok(input) = std::str::from_utf8(data) {
        let _ = ProfilerConfig::from_toml_str(input);
    }
});
