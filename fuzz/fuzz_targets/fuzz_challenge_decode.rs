#![no_main]

use libfuzzer_sys::fuzz_target;
use parley::session::Challenge;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        // Both the raw header and an already-decoded payload
        let _ = Challenge::decode(s);
        if let Ok(challenge) = Challenge::parse(s) {
            let solved = challenge.solve();
            assert!(!solved.is_empty());
        }
    }
});
