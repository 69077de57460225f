#![no_main]

use libfuzzer_sys::fuzz_target;
use parley::llm::tools::extract_with_tier;

fuzz_target!(|data: &[u8]| {
    if let Ok(reply) = std::str::from_utf8(data) {
        let extraction = extract_with_tier(reply);
        assert_eq!(extraction.tier.is_some(), !extraction.calls.is_empty());
        for call in &extraction.calls {
            assert!(!call.name.is_empty());
            assert!(!call.id.is_empty());
        }
    }
});
