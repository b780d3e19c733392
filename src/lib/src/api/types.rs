//! Wire types of the Factory TUF endpoints

use crate::signature::Signature;
use crate::tuf::SignedRoot;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Signatures to append to published manifests, keyed by tag or wave name.
pub type ManifestSignatures = BTreeMap<String, Vec<Signature>>;

/// Server-held state of an active transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxState {
    /// CI root currently published
    pub current: SignedRoot,
    /// Staged CI root
    pub updated: SignedRoot,
    /// Staged production root, once production is touched by the transaction
    #[serde(rename = "updated-prod", default, skip_serializing_if = "Option::is_none")]
    pub updated_prod: Option<SignedRoot>,
    #[serde(rename = "prod-signatures", default)]
    pub prod_signatures: ManifestSignatures,
    #[serde(rename = "wave-signatures", default)]
    pub wave_signatures: ManifestSignatures,
    /// Role name to the key id of its server-held online key
    #[serde(rename = "online-keys", default)]
    pub online_keys: BTreeMap<String, String>,
}

/// Body of a transaction update. Every call replaces all staged fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxPut {
    #[serde(rename = "ci-root")]
    pub ci_root: SignedRoot,
    #[serde(rename = "prod-root", default, skip_serializing_if = "Option::is_none")]
    pub prod_root: Option<SignedRoot>,
    #[serde(rename = "prod-signatures", default)]
    pub prod_signatures: ManifestSignatures,
    #[serde(rename = "wave-signatures", default)]
    pub wave_signatures: ManifestSignatures,
}

impl From<&TxState> for TxPut {
    fn from(state: &TxState) -> Self {
        Self {
            ci_root: state.updated.clone(),
            prod_root: state.updated_prod.clone(),
            prod_signatures: state.prod_signatures.clone(),
            wave_signatures: state.wave_signatures.clone(),
        }
    }
}

/// Body of the non-transactional root endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RootUpdate {
    #[serde(rename = "ci-root", default, skip_serializing_if = "Option::is_none")]
    pub ci_root: Option<SignedRoot>,
    #[serde(rename = "prod-root", default, skip_serializing_if = "Option::is_none")]
    pub prod_root: Option<SignedRoot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxInitRequest {
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxInitResponse {
    pub txid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnlineKeysRequest {
    #[serde(rename = "key-type")]
    pub key_type: String,
    pub roles: Vec<String>,
}
