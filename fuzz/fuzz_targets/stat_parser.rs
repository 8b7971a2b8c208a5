#![no_main]

use libfuzzer_sys::fuzz_target;
use ruse::procfs::StatRecord;

fuzz_target!(|data: &[u8]| {
    if let Ok(line) = std::str::from_utf8(data) {
        // Any process can pick its own comm, so this must never panic
        if let Ok(stat) = StatRecord::parse(line) {
            let _ = stat.cpu_ticks();
        }
    }
});
