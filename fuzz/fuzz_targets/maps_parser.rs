#![no_main]

use libfuzzer_sys::fuzz_target;
use lockstat::symbols::parse_maps;

fuzz_target!(|data: &[u8]| {
    // /proc/<pid>/maps is read while the target may be remapping memory,
    // so any text must parse without panicking
    if let Ok(input) = std::str::from_utf8(data) {
        for map in parse_maps(input) {
            let _ = map.contains(map.start);
        }
    }
});
