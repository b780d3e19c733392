//! Production / CI root synchronization
//!
//! The production root is the CI root with its own targets threshold. It is
//! never edited directly: it is derived from one specific CI root, staged
//! next to it and applied with it.

use crate::api::{FactoryApi, ManifestSignatures, RootUpdate};
use crate::audit;
use crate::creds::OfflineCreds;
use crate::error::TufError;
use crate::rotation::MIN_PROD_TARGETS_THRESHOLD;
use crate::signature::{sign_envelope, sign_meta, Signer};
use crate::tuf::{Role, RootMeta, SignedRoot, SignedTargets, TargetsManifests};

use std::collections::{BTreeMap, BTreeSet};

/// Whether production has diverged from CI for a Factory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProdState {
    /// The transaction already stages a production root
    pub staged: bool,
    /// The Factory has a published production root
    pub published: bool,
}

/// Whether an edit of `role` must also (re)derive the staged production root.
///
/// Root keys are shared by both documents, so root edits always propagate.
/// Other edits only matter once production exists, either published or
/// staged earlier in the same transaction.
pub fn prod_update_required(role: Role, prod: ProdState) -> bool {
    match role {
        Role::Root => true,
        _ => prod.staged || prod.published,
    }
}

/// Targets threshold of the production root to derive.
///
/// A threshold staged in this transaction wins over the published one.
pub fn prod_targets_threshold(staged: Option<&RootMeta>, published: Option<&RootMeta>) -> u32 {
    staged
        .or(published)
        .and_then(|r| r.role(Role::Targets).ok())
        .map(|r| r.threshold)
        .unwrap_or(MIN_PROD_TARGETS_THRESHOLD)
}

/// Production root for `ci`: same content, same version, own targets threshold.
pub fn derive_prod_root(ci: &RootMeta, targets_threshold: u32) -> Result<RootMeta, TufError> {
    let mut prod = ci.clone();
    let targets = prod.role_mut(Role::Targets)?;
    if targets_threshold as usize > targets.keyids.len() {
        return Err(TufError::Threshold(format!(
            "The production targets threshold is {} but the targets role would have only {} keys",
            targets_threshold,
            targets.keyids.len()
        )));
    }
    targets.threshold = targets_threshold;
    Ok(prod)
}

/// Sign every selected manifest that `signer` has not signed yet.
///
/// New signatures are added to `staged`, next to any already staged for the
/// same manifest. Returns the names of the manifests signed.
pub fn sign_manifests<F>(
    manifests: &TargetsManifests,
    staged: &mut ManifestSignatures,
    signer: &Signer,
    select: F,
) -> Result<Vec<String>, TufError>
where
    F: Fn(&str, &SignedTargets) -> bool,
{
    let key_id = signer.key_id()?;
    let mut signed = Vec::new();
    for (name, manifest) in manifests {
        if manifest.is_signed_by(&key_id) {
            continue;
        }
        let already_staged = staged
            .get(name)
            .is_some_and(|sigs| sigs.iter().any(|s| s.keyid == key_id));
        if already_staged || !select(name, manifest) {
            continue;
        }
        let sigs = sign_meta(&manifest.signed, &[signer])?;
        staged.entry(name.clone()).or_default().extend(sigs);
        signed.push(name.clone());
    }
    Ok(signed)
}

/// Manifests re-signed by a targets key rotation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResignReport {
    pub prod: Vec<String>,
    pub waves: Vec<String>,
}

impl ResignReport {
    pub fn len(&self) -> usize {
        self.prod.len() + self.waves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Published manifests and the signatures staged for them.
pub struct ManifestSet<'a> {
    pub prod: &'a TargetsManifests,
    pub waves: &'a TargetsManifests,
    pub prod_signatures: &'a mut ManifestSignatures,
    pub wave_signatures: &'a mut ManifestSignatures,
}

/// Add `new_signer`'s signature to every manifest signed by the retiring key.
///
/// Existing signatures are kept, so each manifest stays valid under the old
/// and the new root until the rotation is applied.
pub fn resign_for_rotation(
    set: ManifestSet<'_>,
    old_key_id: &str,
    new_signer: &Signer,
    correlation_id: &str,
) -> Result<ResignReport, TufError> {
    let new_key_id = new_signer.key_id()?;
    let prod_by_old = signed_by(set.prod, set.prod_signatures, old_key_id);
    let waves_by_old = signed_by(set.waves, set.wave_signatures, old_key_id);

    let report = ResignReport {
        prod: sign_manifests(set.prod, set.prod_signatures, new_signer, |name, _| {
            prod_by_old.contains(name)
        })?,
        waves: sign_manifests(set.waves, set.wave_signatures, new_signer, |name, _| {
            waves_by_old.contains(name)
        })?,
    };
    for name in &report.prod {
        audit::log_manifest_resigned(correlation_id, "prod", name, &new_key_id);
    }
    for name in &report.waves {
        audit::log_manifest_resigned(correlation_id, "wave", name, &new_key_id);
    }
    if !report.is_empty() {
        log::info!(
            "Re-signed {} production and {} wave manifests with {}",
            report.prod.len(),
            report.waves.len(),
            new_key_id
        );
    }
    Ok(report)
}

/// Key ids that signed `name`, published or staged in this transaction.
fn signers_of<'a>(
    name: &str,
    manifest: &'a SignedTargets,
    staged: &'a ManifestSignatures,
) -> BTreeSet<&'a str> {
    let mut ids = manifest.signer_ids();
    if let Some(sigs) = staged.get(name) {
        ids.extend(sigs.iter().map(|s| s.keyid.as_str()));
    }
    ids
}

/// Names of manifests with a published or staged signature by `key_id`.
fn signed_by(
    manifests: &TargetsManifests,
    staged: &ManifestSignatures,
    key_id: &str,
) -> BTreeSet<String> {
    manifests
        .iter()
        .filter(|(name, m)| signers_of(name, m, staged).contains(key_id))
        .map(|(name, _)| name.clone())
        .collect()
}

/// Manifests signed by `dropped` that the targets keys of `prod` no longer
/// bring to the production threshold.
pub fn under_signed_after_drop(
    manifests: &TargetsManifests,
    staged: &ManifestSignatures,
    prod: &RootMeta,
    dropped: &str,
) -> Result<Vec<String>, TufError> {
    let targets = prod.role(Role::Targets)?;
    let mut names = Vec::new();
    for (name, manifest) in manifests {
        let signers = signers_of(name, manifest, staged);
        if !signers.contains(dropped) {
            continue;
        }
        let kept = signers.iter().filter(|id| targets.contains(id)).count();
        if kept < targets.threshold as usize {
            names.push(name.clone());
        }
    }
    Ok(names)
}

/// Drop staged signatures by keys that are not in the targets role of `root`.
///
/// Returns the number of signatures dropped.
pub fn prune_staged_signatures(
    staged: &mut ManifestSignatures,
    root: &RootMeta,
) -> Result<usize, TufError> {
    let targets = root.role(Role::Targets)?;
    let mut dropped = 0;
    for sigs in staged.values_mut() {
        let before = sigs.len();
        sigs.retain(|s| targets.contains(&s.keyid));
        dropped += before - sigs.len();
    }
    staged.retain(|_, sigs| !sigs.is_empty());
    Ok(dropped)
}

/// Names of manifests signed by `old_key_id` but not by `new_key_id`.
pub fn manifests_pending_resign(
    manifests: &TargetsManifests,
    old_key_id: &str,
    new_key_id: &str,
) -> Vec<String> {
    manifests
        .iter()
        .filter(|(_, m)| m.is_signed_by(old_key_id) && !m.is_signed_by(new_key_id))
        .map(|(name, _)| name.clone())
        .collect()
}

/// Root signers held by `creds` for the given root documents.
///
/// Includes every root key of every document, so a new version can collect
/// signatures from both the outgoing and the incoming root quorum.
pub fn root_signers(
    creds: &OfflineCreds,
    roots: &[&RootMeta],
) -> Result<Vec<(String, Signer)>, TufError> {
    let mut keys = BTreeMap::new();
    for root in roots {
        keys.extend(root.role_keys(Role::Root)?);
    }
    creds.signers_for(&keys)
}

/// Re-derive, sign and publish the production root outside of a transaction.
///
/// Used when the production root was left behind by an earlier CI change.
pub fn sync_prod_root(api: &dyn FactoryApi, creds: &OfflineCreds) -> Result<SignedRoot, TufError> {
    let ci = api.get_ci_root(None)?;
    let published = api.get_prod_root()?;

    let threshold = prod_targets_threshold(None, published.as_ref().map(|p| &p.signed));
    let prod = derive_prod_root(&ci.signed, threshold)?;
    let mut envelope = SignedRoot::unsigned(prod);

    let signers = root_signers(creds, &[&ci.signed])?;
    if signers.is_empty() {
        return Err(TufError::KeyNotFound(
            "the credentials hold no key of the current root role".to_string(),
        ));
    }
    let refs: Vec<&Signer> = signers.iter().map(|(_, s)| s).collect();
    sign_envelope(&mut envelope, &refs)?;

    api.post_root(&RootUpdate {
        ci_root: None,
        prod_root: Some(envelope.clone()),
    })?;
    log::info!(
        "Production root synced to CI root version {}",
        envelope.signed.version
    );
    Ok(envelope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::{sign_envelope, KeyType};
    use crate::tuf::root::tests::sample_root;
    use crate::tuf::targets::tests::sample_targets;

    #[test]
    fn test_trigger_rule() {
        let none = ProdState::default();
        let staged = ProdState {
            staged: true,
            published: false,
        };
        let published = ProdState {
            staged: false,
            published: true,
        };

        assert!(prod_update_required(Role::Root, none));
        assert!(prod_update_required(Role::Root, published));
        assert!(!prod_update_required(Role::Targets, none));
        assert!(prod_update_required(Role::Targets, staged));
        assert!(prod_update_required(Role::Targets, published));
        assert!(!prod_update_required(Role::Snapshot, none));
    }

    #[test]
    fn test_threshold_source() {
        let (env, ..) = sample_root();
        let mut staged = env.signed.clone();
        staged.role_mut(Role::Targets).unwrap().threshold = 2;
        let published = env.signed.clone();

        assert_eq!(prod_targets_threshold(None, None), 2);
        assert_eq!(prod_targets_threshold(None, Some(&published)), 1);
        assert_eq!(prod_targets_threshold(Some(&staged), Some(&published)), 2);
    }

    #[test]
    fn test_derive_prod_root() {
        let (env, ..) = sample_root();
        let prod = derive_prod_root(&env.signed, 2).unwrap();
        assert_eq!(prod.version, env.signed.version);
        assert_eq!(prod.role(Role::Targets).unwrap().threshold, 2);
        assert_eq!(prod.role(Role::Root).unwrap(), env.signed.role(Role::Root).unwrap());
        assert_eq!(env.signed.role(Role::Targets).unwrap().threshold, 1);

        assert!(matches!(
            derive_prod_root(&env.signed, 3),
            Err(TufError::Threshold(_))
        ));
    }

    #[test]
    fn test_resign_only_manifests_signed_by_old_key() {
        let old = KeyType::Ed25519.generate_key().unwrap();
        let online = KeyType::Ed25519.generate_key().unwrap();
        let new = KeyType::Ed25519.generate_key().unwrap();

        let mut prod = TargetsManifests::new();
        for (i, name) in ["production", "beta", "rc"].iter().enumerate() {
            let mut m = sample_targets(i as u64 + 1);
            sign_envelope(&mut m, &[&online, &old]).unwrap();
            prod.insert(name.to_string(), m);
        }
        let mut online_only = sample_targets(9);
        sign_envelope(&mut online_only, &[&online]).unwrap();
        prod.insert("devel".to_string(), online_only);

        let waves = TargetsManifests::new();
        let mut prod_sigs = ManifestSignatures::new();
        let mut wave_sigs = ManifestSignatures::new();
        let report = resign_for_rotation(
            ManifestSet {
                prod: &prod,
                waves: &waves,
                prod_signatures: &mut prod_sigs,
                wave_signatures: &mut wave_sigs,
            },
            &old.key_id().unwrap(),
            &new,
            "cid",
        )
        .unwrap();

        assert_eq!(report.prod, vec!["beta", "production", "rc"]);
        assert!(report.waves.is_empty());
        assert_eq!(prod_sigs.len(), 3);
        for sigs in prod_sigs.values() {
            assert_eq!(sigs.len(), 1);
            assert_eq!(sigs[0].keyid, new.key_id().unwrap());
        }
        // Published signatures are untouched
        assert_eq!(prod["production"].signatures.len(), 2);
    }

    #[test]
    fn test_resign_follows_signatures_staged_earlier() {
        let online = KeyType::Ed25519.generate_key().unwrap();
        let first = KeyType::Ed25519.generate_key().unwrap();
        let second = KeyType::Ed25519.generate_key().unwrap();

        let mut prod = TargetsManifests::new();
        let mut m = sample_targets(1);
        sign_envelope(&mut m, &[&online]).unwrap();
        prod.insert("main".to_string(), m);
        let waves = TargetsManifests::new();

        let mut prod_sigs = ManifestSignatures::new();
        sign_manifests(&prod, &mut prod_sigs, &first, |_, _| true).unwrap();
        let mut wave_sigs = ManifestSignatures::new();
        let report = resign_for_rotation(
            ManifestSet {
                prod: &prod,
                waves: &waves,
                prod_signatures: &mut prod_sigs,
                wave_signatures: &mut wave_sigs,
            },
            &first.key_id().unwrap(),
            &second,
            "cid",
        )
        .unwrap();

        assert_eq!(report.prod, vec!["main"]);
        assert_eq!(prod_sigs["main"].len(), 2);
    }

    #[test]
    fn test_prune_staged_signatures() {
        let (env, ..) = sample_root();
        let kept = env.signed.role(Role::Targets).unwrap().keyids[0].clone();
        let gone = KeyType::Ed25519.generate_key().unwrap();

        let mut staged = ManifestSignatures::new();
        let mut m = sample_targets(1);
        sign_envelope(&mut m, &[&gone]).unwrap();
        staged.insert("main".to_string(), m.signatures.clone());
        let mut kept_sig = m.signatures[0].clone();
        kept_sig.keyid = kept.clone();
        staged.insert("stable".to_string(), vec![kept_sig, m.signatures[0].clone()]);

        assert_eq!(prune_staged_signatures(&mut staged, &env.signed).unwrap(), 2);
        assert!(!staged.contains_key("main"));
        assert_eq!(staged["stable"].len(), 1);
        assert_eq!(staged["stable"][0].keyid, kept);
    }

    #[test]
    fn test_under_signed_after_drop() {
        let (env, ..) = sample_root();
        let prod = derive_prod_root(&env.signed, 1).unwrap();
        let dropped = KeyType::Ed25519.generate_key().unwrap();
        let other = KeyType::Ed25519.generate_key().unwrap();
        let remaining = prod.role(Role::Targets).unwrap().keyids[0].clone();

        let mut manifests = TargetsManifests::new();
        let mut lonely = sample_targets(1);
        sign_envelope(&mut lonely, &[&dropped, &other]).unwrap();
        manifests.insert("lonely".to_string(), lonely.clone());
        manifests.insert("covered".to_string(), lonely);
        let mut unrelated = sample_targets(2);
        sign_envelope(&mut unrelated, &[&other]).unwrap();
        manifests.insert("unrelated".to_string(), unrelated);

        let mut staged = ManifestSignatures::new();
        let mut sig = manifests["covered"].signatures[0].clone();
        sig.keyid = remaining;
        staged.insert("covered".to_string(), vec![sig]);

        let names =
            under_signed_after_drop(&manifests, &staged, &prod, &dropped.key_id().unwrap())
                .unwrap();
        assert_eq!(names, vec!["lonely"]);
    }

    #[test]
    fn test_sign_manifests_is_idempotent() {
        let key = KeyType::Ed25519.generate_key().unwrap();
        let mut manifests = TargetsManifests::new();
        manifests.insert("production".to_string(), sample_targets(1));
        let mut staged = ManifestSignatures::new();

        let first = sign_manifests(&manifests, &mut staged, &key, |_, _| true).unwrap();
        let second = sign_manifests(&manifests, &mut staged, &key, |_, _| true).unwrap();
        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
        assert_eq!(staged["production"].len(), 1);
    }

    #[test]
    fn test_pending_resign() {
        let old = KeyType::Ed25519.generate_key().unwrap();
        let new = KeyType::Ed25519.generate_key().unwrap();
        let mut manifests = TargetsManifests::new();
        let mut a = sample_targets(1);
        sign_envelope(&mut a, &[&old]).unwrap();
        let mut b = sample_targets(2);
        sign_envelope(&mut b, &[&old, &new]).unwrap();
        manifests.insert("a".to_string(), a);
        manifests.insert("b".to_string(), b);
        assert_eq!(
            manifests_pending_resign(&manifests, &old.key_id().unwrap(), &new.key_id().unwrap()),
            vec!["a"]
        );
    }
}
