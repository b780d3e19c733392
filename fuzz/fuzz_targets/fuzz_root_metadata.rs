//! Fuzz target for root metadata
//!
//! Root documents are parsed, canonicalized and checked for signatures.
//! Canonical bytes must not depend on the input's key order or whitespace.

#![no_main]

use libfuzzer_sys::fuzz_target;
use tufroot::tuf::{verify_root_role, Role, RootMeta};

fuzz_target!(|data: &[u8]| {
    if let Ok(root) = RootMeta::from_json(data) {
        if let Ok(canonical) = root.canonical_payload() {
            let reparsed = serde_json::to_vec(&root).expect("parsed root must serialize");
            let again = RootMeta::from_json(&reparsed).expect("serialized root must parse");
            assert_eq!(again.canonical_payload().ok(), Some(canonical));
        }
        for role in Role::ALL {
            let _ = verify_root_role(&root, &root.signed, role);
        }
    }
});
