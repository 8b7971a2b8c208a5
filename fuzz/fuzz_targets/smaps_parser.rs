#![no_main]

use libfuzzer_sys::fuzz_target;
use ruse::procfs::parse_pss_kib;

fuzz_target!(|data: &[u8]| {
    if let Ok(contents) = std::str::from_utf8(data) {
        let _ = parse_pss_kib(contents);
    }
});
