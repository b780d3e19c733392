//! Fuzz target for offline credentials archives
//!
//! Exercises the gzip and tar decoders plus the `.pub` / `.sec` pairing
//! checks on arbitrary input.

#![no_main]

use libfuzzer_sys::fuzz_target;
use tufroot::creds::OfflineCreds;

fuzz_target!(|data: &[u8]| {
    if let Ok(creds) = OfflineCreds::from_bytes(data) {
        let _ = creds.validate();
        let _ = creds.public_keys();
        if let Ok(bytes) = creds.to_bytes() {
            OfflineCreds::from_bytes(&bytes).expect("re-encoded archive must parse");
        }
    }
});
