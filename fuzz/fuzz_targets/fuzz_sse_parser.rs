#![no_main]

use libfuzzer_sys::fuzz_target;
use parley::upstream::{classify_data, collect_reply, SseLineDecoder};

fuzz_target!(|data: &[u8]| {
    // Splitting the input must not change the decoded lines
    let split = data.first().map_or(0, |b| *b as usize % (data.len() + 1));

    let mut whole = SseLineDecoder::new();
    let mut expected = whole.feed(data);
    expected.extend(whole.finish());

    let mut parts = SseLineDecoder::new();
    let mut lines = parts.feed(&data[..split]);
    lines.extend(parts.feed(&data[split..]));
    lines.extend(parts.finish());
    assert_eq!(lines, expected);

    for line in &lines {
        let _ = classify_data(line);
    }
    if let Ok(body) = std::str::from_utf8(data) {
        let _ = collect_reply(body);
    }
});
