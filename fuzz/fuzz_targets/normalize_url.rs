#![no_main]

use libfuzzer_sys::fuzz_target;
use tabtree_core::signature::{is_pinnable_url, is_recordable_url, normalize_url};

fuzz_target!(|data: &[u8]| {
    let Ok(raw) = std::str::from_utf8(data) else {
        return;
    };

    let once = normalize_url(raw);
    let twice = normalize_url(&once);
    assert_eq!(once, twice, "normalization must be idempotent for {raw:?}");

    // Classification must be stable across normalization.
    assert_eq!(is_recordable_url(&once), is_recordable_url(&twice));
    assert_eq!(is_pinnable_url(&once), is_pinnable_url(&twice));
});
