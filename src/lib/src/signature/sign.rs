use crate::error::TufError;
use crate::signature::canonical::to_canonical_bytes;
use crate::signature::keys::{Signer, TufKey};

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// One signature over the canonical form of a `signed` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub keyid: String,
    pub method: String,
    /// Base64-encoded signature bytes
    pub sig: String,
}

impl Signature {
    pub fn bytes(&self) -> Result<Vec<u8>, TufError> {
        base64::engine::general_purpose::STANDARD
            .decode(&self.sig)
            .map_err(|e| TufError::ParseError(format!("Invalid signature encoding: {}", e)))
    }
}

/// A signed envelope: `{"signed": ..., "signatures": [...]}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signed<T> {
    pub signed: T,
    #[serde(default)]
    pub signatures: Vec<Signature>,
}

impl<T: Serialize> Signed<T> {
    /// Wrap a payload with no signatures.
    pub fn unsigned(signed: T) -> Self {
        Self {
            signed,
            signatures: Vec::new(),
        }
    }

    /// Canonical bytes of the `signed` payload (what gets signed).
    pub fn canonical_payload(&self) -> Result<Vec<u8>, TufError> {
        to_canonical_bytes(&self.signed)
    }

    pub fn is_signed_by(&self, key_id: &str) -> bool {
        self.signatures.iter().any(|s| s.keyid == key_id)
    }

    pub fn signer_ids(&self) -> BTreeSet<&str> {
        self.signatures.iter().map(|s| s.keyid.as_str()).collect()
    }
}

/// Sign a payload with every signer: one `{keyid, method, sig}` per signer.
pub fn sign_meta<T: Serialize + ?Sized>(
    payload: &T,
    signers: &[&Signer],
) -> Result<Vec<Signature>, TufError> {
    let canonical = to_canonical_bytes(payload)?;
    signers
        .iter()
        .map(|signer| {
            let sig = signer.sign(&canonical)?;
            Ok(Signature {
                keyid: signer.key_id()?,
                method: signer.key_type().sig_method().to_string(),
                sig: base64::engine::general_purpose::STANDARD.encode(sig),
            })
        })
        .collect()
}

/// Add signatures to an envelope.
///
/// A new signature replaces an existing one from the same key id; signatures
/// from other keys are kept. Returns the ids of the keys that signed.
pub fn sign_envelope<T: Serialize>(
    envelope: &mut Signed<T>,
    signers: &[&Signer],
) -> Result<Vec<String>, TufError> {
    let new_sigs = sign_meta(&envelope.signed, signers)?;
    let ids: Vec<String> = new_sigs.iter().map(|s| s.keyid.clone()).collect();
    envelope
        .signatures
        .retain(|existing| !ids.contains(&existing.keyid));
    envelope.signatures.extend(new_sigs);
    Ok(ids)
}

/// Outcome of checking an envelope against a role.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignatureStatus {
    /// Role key ids with a valid signature
    pub valid: BTreeSet<String>,
    /// Role key ids whose signature does not verify
    pub invalid: BTreeSet<String>,
    /// Signatures from keys not listed in the role
    pub unknown: BTreeSet<String>,
    pub threshold: u32,
}

impl SignatureStatus {
    pub fn is_satisfied(&self) -> bool {
        self.threshold > 0 && self.valid.len() >= self.threshold as usize
    }

    pub fn missing(&self) -> usize {
        (self.threshold as usize).saturating_sub(self.valid.len())
    }
}

/// Count distinct valid signatures made by `role_keys` over the envelope.
///
/// `role_keys` maps every key id listed in the role to its public key.
pub fn verify_envelope<T: Serialize>(
    envelope: &Signed<T>,
    role_keys: &BTreeMap<String, TufKey>,
    threshold: u32,
) -> Result<SignatureStatus, TufError> {
    let canonical = envelope.canonical_payload()?;
    let mut status = SignatureStatus {
        threshold,
        ..Default::default()
    };

    for sig in &envelope.signatures {
        let Some(key) = role_keys.get(&sig.keyid) else {
            status.unknown.insert(sig.keyid.clone());
            continue;
        };
        let ok = sig
            .bytes()
            .and_then(|bytes| key.verify(&sig.method, &canonical, &bytes))
            .is_ok();
        if ok {
            status.valid.insert(sig.keyid.clone());
        } else {
            log::debug!("Signature by {} does not verify", sig.keyid);
            status.invalid.insert(sig.keyid.clone());
        }
    }
    status.invalid.retain(|id| !status.valid.contains(id));

    Ok(status)
}
