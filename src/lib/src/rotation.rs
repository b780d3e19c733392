//! Key rotation operations
//!
//! Pure edits of a staged root document and an offline credentials archive.
//! They validate the request, mutate both in memory and report what changed;
//! fetching, signing and uploading is left to the caller.

use crate::creds::OfflineCreds;
use crate::error::TufError;
use crate::signature::{KeyType, Signer};
use crate::tuf::{Role, RootMeta};

use std::collections::BTreeSet;

/// Lowest production targets threshold: the online key plus one offline key.
pub const MIN_PROD_TARGETS_THRESHOLD: u32 = 2;

/// Lowest root threshold.
pub const MIN_ROOT_THRESHOLD: u32 = 1;

/// How `delete_offline_key` picks the key to drop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySelector {
    /// An explicit key id
    Id(String),
    /// The single role key whose private half is in the archive
    HeldInCreds,
}

/// Result of a key generation.
#[derive(Debug, Clone)]
pub struct NewKey {
    pub key_id: String,
    pub signer: Signer,
}

/// Result of `rotate_offline_key`.
#[derive(Debug, Clone)]
pub struct Rotation {
    pub old_key_id: String,
    pub new_key: NewKey,
}

/// Offline key ids of `role`: every listed key that is not an online key.
pub fn offline_keys(
    root: &RootMeta,
    role: Role,
    online: &BTreeSet<String>,
) -> Result<Vec<String>, TufError> {
    Ok(root
        .role(role)?
        .keyids
        .iter()
        .filter(|id| !online.contains(*id))
        .cloned()
        .collect())
}

/// Offline keys of `role` whose private half `creds` holds.
fn held_offline_keys(
    root: &RootMeta,
    creds: &OfflineCreds,
    role: Role,
    online: &BTreeSet<String>,
) -> Result<Vec<String>, TufError> {
    let mut held = Vec::new();
    for id in offline_keys(root, role, online)? {
        let key = root
            .keys
            .get(&id)
            .ok_or_else(|| TufError::ParseError(format!("Key {} is not in 'keys'", id)))?;
        if creds.has_private_key(key)? {
            held.push(id);
        }
    }
    Ok(held)
}

fn generate_into(
    root: &mut RootMeta,
    creds: &mut OfflineCreds,
    role: Role,
    key_type: KeyType,
) -> Result<NewKey, TufError> {
    let signer = key_type.generate_key()?;
    let key_id = creds.add_key_pair(role.name(), &signer)?;
    let listed_id = root.add_key(signer.public_key()?)?;
    debug_assert_eq!(key_id, listed_id);
    log::info!("Generated new {} {} key {}", key_type, role, key_id);
    Ok(NewKey { key_id, signer })
}

/// Add a new offline key to `role`, leaving the threshold unchanged.
///
/// Refused when `creds` already holds the private half of one of the role's
/// offline keys in the published root: that holder should rotate instead of
/// keeping two live generations of the same key.
pub fn add_offline_key(
    current: &RootMeta,
    staged: &mut RootMeta,
    creds: &mut OfflineCreds,
    role: Role,
    key_type: KeyType,
    online: &BTreeSet<String>,
) -> Result<NewKey, TufError> {
    ensure_offline_role(role)?;
    let held = held_offline_keys(current, creds, role, online)?;
    if let Some(id) = held.first() {
        return Err(TufError::InvalidArgument(format!(
            "The credentials already hold active {} key {}; use rotate-offline-key to replace it",
            role, id
        )));
    }
    let new_key = generate_into(staged, creds, role, key_type)?;
    staged.role_mut(role)?.keyids.push(new_key.key_id.clone());
    Ok(new_key)
}

/// Remove an offline key from `role`.
///
/// Online keys are never removed this way, and a removal that would leave
/// fewer keys than the threshold is refused.
pub fn delete_offline_key(
    staged: &mut RootMeta,
    creds: Option<&OfflineCreds>,
    role: Role,
    selector: &KeySelector,
    online: &BTreeSet<String>,
) -> Result<String, TufError> {
    ensure_offline_role(role)?;
    let key_id = match selector {
        KeySelector::Id(id) => {
            if online.contains(id) {
                return Err(TufError::InvalidArgument(format!(
                    "Key {} is the online {} key and cannot be deleted",
                    id, role
                )));
            }
            if !staged.role(role)?.contains(id) {
                return Err(TufError::KeyNotFound(format!(
                    "{} is not a {} key",
                    id, role
                )));
            }
            id.clone()
        }
        KeySelector::HeldInCreds => {
            let creds = creds.ok_or(TufError::UsageError(
                "Either a key id or a credentials archive is required",
            ))?;
            single_held_key(staged, creds, role, online)?
        }
    };

    let role_keys = staged.role_mut(role)?;
    let remaining = role_keys.keyids.len() - 1;
    if remaining < role_keys.threshold as usize {
        return Err(TufError::Threshold(format!(
            "Deleting {} would leave {} {} keys for a threshold of {}",
            key_id, remaining, role, role_keys.threshold
        )));
    }
    role_keys.keyids.retain(|id| id != &key_id);
    log::info!("Removed {} key {}", role, key_id);
    Ok(key_id)
}

/// Replace the offline key of `role` held in `creds` by a freshly generated one.
///
/// The new key takes the old key's place in the role; the threshold is
/// unchanged. The old private key stays in the archive.
pub fn rotate_offline_key(
    staged: &mut RootMeta,
    creds: &mut OfflineCreds,
    role: Role,
    key_type: KeyType,
    online: &BTreeSet<String>,
) -> Result<Rotation, TufError> {
    ensure_offline_role(role)?;
    let old_key_id = single_held_key(staged, creds, role, online)?;
    let new_key = generate_into(staged, creds, role, key_type)?;

    let role_keys = staged.role_mut(role)?;
    for id in role_keys.keyids.iter_mut() {
        if *id == old_key_id {
            *id = new_key.key_id.clone();
        }
    }
    log::info!("Rotated {} key {} -> {}", role, old_key_id, new_key.key_id);
    Ok(Rotation {
        old_key_id,
        new_key,
    })
}

/// Change the threshold of `role`.
///
/// The root threshold applies to CI and production alike. The targets
/// threshold only exists on the production root: the CI targets role is
/// signed by the online key alone.
pub fn set_threshold(
    root: &mut RootMeta,
    role: Role,
    threshold: u32,
    production: bool,
) -> Result<(), TufError> {
    let minimum = match role {
        Role::Root => MIN_ROOT_THRESHOLD,
        Role::Targets if production => MIN_PROD_TARGETS_THRESHOLD,
        Role::Targets => {
            return Err(TufError::InvalidArgument(
                "The CI targets threshold is fixed at 1; only the production targets threshold can be set"
                    .to_string(),
            ))
        }
        other => {
            return Err(TufError::InvalidArgument(format!(
                "The {} threshold cannot be changed",
                other
            )))
        }
    };
    if threshold < minimum {
        return Err(TufError::Threshold(format!(
            "The {} threshold must be at least {}",
            role, minimum
        )));
    }
    let role_keys = root.role_mut(role)?;
    if threshold as usize > role_keys.keyids.len() {
        return Err(TufError::Threshold(format!(
            "The {} role has only {} keys; add keys before raising the threshold to {}",
            role,
            role_keys.keyids.len(),
            threshold
        )));
    }
    role_keys.threshold = threshold;
    Ok(())
}

fn single_held_key(
    root: &RootMeta,
    creds: &OfflineCreds,
    role: Role,
    online: &BTreeSet<String>,
) -> Result<String, TufError> {
    let mut held = held_offline_keys(root, creds, role, online)?;
    match held.len() {
        0 => Err(TufError::KeyNotFound(format!(
            "the credentials hold no private key of the {} role",
            role
        ))),
        1 => Ok(held.remove(0)),
        n => Err(TufError::InvalidArgument(format!(
            "The credentials hold {} {} keys ({}); cannot tell which one to use",
            n,
            role,
            held.join(", ")
        ))),
    }
}

fn ensure_offline_role(role: Role) -> Result<(), TufError> {
    if role.has_offline_keys() {
        Ok(())
    } else {
        Err(TufError::InvalidArgument(format!(
            "Role '{}' has no offline keys",
            role
        )))
    }
}
