//! Fuzz target for key documents
//!
//! Key documents come from credentials archives and from root metadata
//! fetched from the server. Parsing must never panic, and a parsed key
//! must either yield a stable key id or a clean error.

#![no_main]

use libfuzzer_sys::fuzz_target;
use tufroot::TufKey;

fuzz_target!(|data: &[u8]| {
    if let Ok(key) = TufKey::from_json(data) {
        if let Ok(id) = key.key_id() {
            if let Ok(json) = key.to_json() {
                let again = TufKey::from_json(&json).expect("re-encoded key must parse");
                assert_eq!(again.key_id().ok().as_deref(), Some(id.as_str()));
            }
        }
        // Private halves go through the PEM / seed decoders
        let _ = key.to_signer();
    }
});
