//! Client side of the Factory TUF API
//!
//! [`FactoryApi`] is everything the rotation engine needs from the server.
//! [`HttpFactoryApi`] talks to the real service; tests plug in an in-memory
//! implementation.

mod http;
mod types;

pub use http::*;
pub use types::*;

use crate::error::TufError;
use crate::signature::KeyType;
use crate::tuf::{Role, SignedRoot, TargetsManifests};

pub trait FactoryApi {
    /// Published CI root, the latest one or a specific version.
    fn get_ci_root(&self, version: Option<u64>) -> Result<SignedRoot, TufError>;

    /// Published production root, if the Factory has one.
    fn get_prod_root(&self) -> Result<Option<SignedRoot>, TufError>;

    /// Non-transactional root update. A 409 is reported as `ProdOutOfSync`.
    fn post_root(&self, update: &RootUpdate) -> Result<(), TufError>;

    /// Open a transaction and return its id. Fails with `Conflict` if one is active.
    fn tx_init(&self, message: &str) -> Result<String, TufError>;

    fn tx_get(&self, txid: &str) -> Result<TxState, TufError>;

    /// Replace the staged state of a transaction.
    fn tx_put(&self, txid: &str, update: &TxPut) -> Result<(), TufError>;

    fn tx_apply(&self, txid: &str) -> Result<(), TufError>;

    fn tx_cancel(&self, txid: &str) -> Result<(), TufError>;

    /// Have the server generate new online keys for `roles` and stage them.
    fn tx_generate_online_keys(
        &self,
        txid: &str,
        key_type: KeyType,
        roles: &[Role],
    ) -> Result<(), TufError>;

    /// Published production manifests by tag.
    fn get_prod_targets(&self) -> Result<TargetsManifests, TufError>;

    /// Published wave manifests by wave name.
    fn get_wave_targets(&self) -> Result<TargetsManifests, TufError>;
}
