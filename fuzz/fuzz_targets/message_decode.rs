#![no_main]

use libfuzzer_sys::fuzz_target;
use tabtree_core::events::BrowserEvent;
use tabtree_core::messages::Request;

fuzz_target!(|data: &[u8]| {
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(data) else {
        return;
    };

    if let Ok(request) = Request::from_value(value.clone()) {
        // Re-encoding a decoded request must decode to the same request.
        let encoded = serde_json::to_value(&request).expect("requests serialize");
        assert_eq!(encoded["action"], request.action());
        let decoded = Request::from_value(encoded).expect("re-encoded request decodes");
        assert_eq!(decoded, request);
    }

    if let Ok(event) = serde_json::from_value::<BrowserEvent>(value) {
        let encoded = serde_json::to_value(&event).expect("events serialize");
        assert_eq!(encoded["type"], event.kind());
    }
});
