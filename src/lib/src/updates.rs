//! Staged root updates
//!
//! Every command follows the same path: fetch the transaction state, edit a
//! copy of the staged CI root, re-derive the staged production root when the
//! edit requires it, optionally sign, save the credentials archive, then
//! upload the whole staged state. Commands are fetch-then-write: two
//! operators editing one transaction at the same time can lose an edit.

use crate::api::{FactoryApi, TxPut, TxState};
use crate::audit;
use crate::creds::OfflineCreds;
use crate::error::TufError;
use crate::rotation::{self, KeySelector};
use crate::secure_file;
use crate::signature::{sign_envelope, KeyType, SignatureStatus, Signer};
use crate::sync::{
    self, derive_prod_root, prod_targets_threshold, prod_update_required, root_signers,
    ManifestSet, ProdState, ResignReport,
};
use crate::transaction::Transaction;
use crate::tuf::{verify_root_role, ManifestFilter, Role, RootDiff, RootMeta, SignedRoot};

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};

/// A credentials archive opened by a command.
struct CredsFile {
    path: PathBuf,
    creds: OfflineCreds,
    dirty: bool,
}

impl CredsFile {
    /// Open an archive the command will rewrite.
    fn open_for_update(path: &Path) -> Result<Self, TufError> {
        secure_file::assert_writable(path)?;
        Self::open(path)
    }

    fn open(path: &Path) -> Result<Self, TufError> {
        Ok(Self {
            path: path.to_path_buf(),
            creds: OfflineCreds::open(path)?,
            dirty: false,
        })
    }

    /// Persist new key material before anything is uploaded.
    fn save(&mut self, correlation_id: &str) -> Result<(), TufError> {
        if !self.dirty {
            return Ok(());
        }
        let backup = self.creds.save(&self.path)?;
        audit::log_creds_saved(
            correlation_id,
            &self.path.display().to_string(),
            backup.as_ref().map(|b| b.display().to_string()).as_deref(),
        );
        self.dirty = false;
        Ok(())
    }
}

/// Fetched transaction state plus the edits made to it by one command.
struct Session<'a> {
    api: &'a dyn FactoryApi,
    tx: &'a Transaction,
    state: TxState,
    published_prod: Option<SignedRoot>,
}

impl<'a> Session<'a> {
    fn open(api: &'a dyn FactoryApi, tx: &'a Transaction) -> Result<Self, TufError> {
        let state = tx.state(api)?;
        let published_prod = api.get_prod_root()?;
        Ok(Self {
            api,
            tx,
            state,
            published_prod,
        })
    }

    fn online_keys(&self) -> BTreeSet<String> {
        self.state.online_keys.values().cloned().collect()
    }

    fn current(&self) -> &RootMeta {
        &self.state.current.signed
    }

    fn staged(&self) -> RootMeta {
        self.state.updated.signed.clone()
    }

    fn prod_state(&self) -> ProdState {
        ProdState {
            staged: self.state.updated_prod.is_some(),
            published: self.published_prod.is_some(),
        }
    }

    /// Install `ci` as the staged CI root after an edit of `roles`.
    ///
    /// `prod_threshold` forces a production root with that targets threshold.
    fn commit_edit(
        &mut self,
        mut ci: RootMeta,
        roles: &[Role],
        prod_threshold: Option<u32>,
    ) -> Result<(), TufError> {
        ci.bump_from(&self.state.current.signed);
        ci.remove_unused_keys();
        ci.validate()?;

        let prod_state = self.prod_state();
        let needs_prod =
            prod_threshold.is_some() || roles.iter().any(|r| prod_update_required(*r, prod_state));
        if needs_prod {
            let threshold = prod_threshold.unwrap_or_else(|| {
                prod_targets_threshold(
                    self.state.updated_prod.as_ref().map(|p| &p.signed),
                    self.published_prod.as_ref().map(|p| &p.signed),
                )
            });
            let prod = derive_prod_root(&ci, threshold)?;
            prod.validate()?;
            let unchanged = self
                .state
                .updated_prod
                .as_ref()
                .is_some_and(|p| p.signed == prod);
            if !unchanged {
                log::debug!("Staging production root version {}", prod.version);
                self.state.updated_prod = Some(SignedRoot::unsigned(prod));
            }
        }

        if ci != self.state.updated.signed {
            self.state.updated = SignedRoot::unsigned(ci);
        }
        Ok(())
    }

    /// Sign the staged roots with every root key held by `creds`.
    fn sign_roots(&mut self, creds: &OfflineCreds) -> Result<Vec<String>, TufError> {
        let signers = root_signers(
            creds,
            &[&self.state.current.signed, &self.state.updated.signed],
        )?;
        if signers.is_empty() {
            return Err(TufError::KeyNotFound(
                "the credentials hold no key of the current or the staged root role".to_string(),
            ));
        }
        let refs: Vec<&Signer> = signers.iter().map(|(_, s)| s).collect();
        let ids = sign_envelope(&mut self.state.updated, &refs)?;
        if let Some(prod) = self.state.updated_prod.as_mut() {
            sign_envelope(prod, &refs)?;
        }
        log::info!("Signed the staged root with {} key(s)", ids.len());
        Ok(ids)
    }

    /// Refuse to drop targets key `key_id` while a published manifest needs
    /// its signature to reach the production threshold.
    fn ensure_manifests_survive_drop(&self, key_id: &str) -> Result<(), TufError> {
        let Some(prod) = self.state.updated_prod.as_ref() else {
            return Ok(());
        };
        let prod_targets = self.api.get_prod_targets()?;
        let waves = self.api.get_wave_targets()?;

        let prod_names = sync::under_signed_after_drop(
            &prod_targets,
            &self.state.prod_signatures,
            &prod.signed,
            key_id,
        )?;
        let wave_names = sync::under_signed_after_drop(
            &waves,
            &self.state.wave_signatures,
            &prod.signed,
            key_id,
        )?;
        let names: Vec<String> = prod_names
            .iter()
            .map(|n| format!("prod:{}", n))
            .chain(wave_names.iter().map(|n| format!("wave:{}", n)))
            .collect();
        if names.is_empty() {
            return Ok(());
        }
        Err(TufError::Threshold(format!(
            "Deleting {} would leave {} below the production targets threshold; \
             sign them with a remaining targets key first (sign-prod-targets)",
            key_id,
            names.join(", ")
        )))
    }

    fn upload(&mut self, operation: &str) -> Result<(), TufError> {
        let staged = &self.state.updated.signed;
        let dropped = sync::prune_staged_signatures(&mut self.state.prod_signatures, staged)?
            + sync::prune_staged_signatures(&mut self.state.wave_signatures, staged)?;
        if dropped > 0 {
            log::debug!("Dropped {} staged signature(s) of retired targets keys", dropped);
        }
        self.tx
            .update(self.api, &TxPut::from(&self.state), operation)
    }
}

/// Add a freshly generated offline key to `role`. Returns the new key id.
pub fn add_offline_key(
    api: &dyn FactoryApi,
    tx: &Transaction,
    creds_path: &Path,
    role: Role,
    key_type: KeyType,
    sign: bool,
) -> Result<String, TufError> {
    let mut session = Session::open(api, tx)?;
    let mut creds = CredsFile::open_for_update(creds_path)?;

    let mut ci = session.staged();
    let new_key = rotation::add_offline_key(
        session.current(),
        &mut ci,
        &mut creds.creds,
        role,
        key_type,
        &session.online_keys(),
    )?;
    creds.dirty = true;
    audit::log_key_generation(
        tx.correlation_id(),
        role.name(),
        key_type.name(),
        &new_key.key_id,
    );

    session.commit_edit(ci, &[role], None)?;
    if sign {
        session.sign_roots(&creds.creds)?;
    }
    creds.save(tx.correlation_id())?;
    session.upload("add-offline-key")?;
    Ok(new_key.key_id)
}

/// Remove an offline key from `role`, by id or by looking it up in `creds_path`.
pub fn delete_offline_key(
    api: &dyn FactoryApi,
    tx: &Transaction,
    creds_path: Option<&Path>,
    role: Role,
    key_id: Option<&str>,
    sign: bool,
) -> Result<String, TufError> {
    let mut session = Session::open(api, tx)?;
    let creds = creds_path.map(CredsFile::open).transpose()?;
    let selector = match key_id {
        Some(id) => KeySelector::Id(id.to_string()),
        None => KeySelector::HeldInCreds,
    };

    let mut ci = session.staged();
    let removed = rotation::delete_offline_key(
        &mut ci,
        creds.as_ref().map(|c| &c.creds),
        role,
        &selector,
        &session.online_keys(),
    )?;
    session.commit_edit(ci, &[role], None)?;
    if role == Role::Targets {
        session.ensure_manifests_survive_drop(&removed)?;
    }
    audit::log_key_retired(tx.correlation_id(), role.name(), &removed);
    if sign {
        let creds = creds.as_ref().ok_or(TufError::UsageError(
            "Signing requires a credentials archive",
        ))?;
        session.sign_roots(&creds.creds)?;
    }
    session.upload("delete-offline-key")?;
    Ok(removed)
}

/// What `rotate_offline_key` did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationSummary {
    pub old_key_id: String,
    pub new_key_id: String,
    pub resigned: ResignReport,
}

/// Replace the offline key of `role` held in the archive.
///
/// Targets keys may live in a separate archive (`targets_creds_path`); root
/// signatures always come from `creds_path`. Rotating a targets key also
/// signs every published production and wave manifest that the retiring
/// key had signed.
pub fn rotate_offline_key(
    api: &dyn FactoryApi,
    tx: &Transaction,
    creds_path: &Path,
    targets_creds_path: Option<&Path>,
    role: Role,
    key_type: KeyType,
    sign: bool,
) -> Result<RotationSummary, TufError> {
    let mut session = Session::open(api, tx)?;

    let key_path = match (role, targets_creds_path) {
        (Role::Targets, Some(p)) => p,
        _ => creds_path,
    };
    let mut key_creds = CredsFile::open_for_update(key_path)?;
    let root_creds = if key_path != creds_path {
        Some(CredsFile::open(creds_path)?)
    } else {
        None
    };

    let mut ci = session.staged();
    let rotation = rotation::rotate_offline_key(
        &mut ci,
        &mut key_creds.creds,
        role,
        key_type,
        &session.online_keys(),
    )?;
    key_creds.dirty = true;
    let cid = tx.correlation_id();
    audit::log_key_generation(cid, role.name(), key_type.name(), &rotation.new_key.key_id);
    audit::log_key_retired(cid, role.name(), &rotation.old_key_id);

    session.commit_edit(ci, &[role], None)?;

    let mut resigned = ResignReport::default();
    if role == Role::Targets {
        let prod = api.get_prod_targets()?;
        let waves = api.get_wave_targets()?;
        resigned = sync::resign_for_rotation(
            ManifestSet {
                prod: &prod,
                waves: &waves,
                prod_signatures: &mut session.state.prod_signatures,
                wave_signatures: &mut session.state.wave_signatures,
            },
            &rotation.old_key_id,
            &rotation.new_key.signer,
            cid,
        )?;
    }

    if sign {
        let creds = root_creds.as_ref().unwrap_or(&key_creds);
        session.sign_roots(&creds.creds)?;
    }
    key_creds.save(cid)?;
    session.upload("rotate-offline-key")?;

    Ok(RotationSummary {
        old_key_id: rotation.old_key_id,
        new_key_id: rotation.new_key.key_id,
        resigned,
    })
}

/// Have the server replace the online keys of `roles`.
///
/// The private keys never leave the server, which also signs the published
/// manifests with the new online targets key when the transaction is applied.
/// Returns the manifests still signed only by the retiring online targets key.
pub fn rotate_online_key(
    api: &dyn FactoryApi,
    tx: &Transaction,
    roles: &[Role],
    key_type: KeyType,
    creds_path: Option<&Path>,
    sign: bool,
) -> Result<Vec<String>, TufError> {
    if roles.is_empty() {
        return Err(TufError::UsageError("At least one role is required"));
    }
    if roles.contains(&Role::Root) {
        return Err(TufError::InvalidArgument(
            "The root role has no online key".to_string(),
        ));
    }
    let creds = creds_path.map(CredsFile::open).transpose()?;
    if sign && creds.is_none() {
        return Err(TufError::UsageError(
            "Signing requires a credentials archive",
        ));
    }

    let before = tx.state(api)?.online_keys;
    api.tx_generate_online_keys(tx.txid(), key_type, roles)?;
    let mut session = Session::open(api, tx)?;
    let after = session.state.online_keys.clone();

    let ci = session.staged();
    session.commit_edit(ci, roles, None)?;

    let mut pending = Vec::new();
    if let (Some(old), Some(new)) = (
        before.get(Role::Targets.name()),
        after.get(Role::Targets.name()),
    ) {
        if old != new {
            let prod = api.get_prod_targets()?;
            let waves = api.get_wave_targets()?;
            pending.extend(
                sync::manifests_pending_resign(&prod, old, new)
                    .into_iter()
                    .map(|n| format!("prod:{}", n)),
            );
            pending.extend(
                sync::manifests_pending_resign(&waves, old, new)
                    .into_iter()
                    .map(|n| format!("wave:{}", n)),
            );
            if !pending.is_empty() {
                log::warn!(
                    "{} published manifests are signed by the retiring online targets key {}; \
                     they are re-signed by the server when the transaction is applied",
                    pending.len(),
                    old
                );
            }
        }
    }
    for role in roles {
        if let Some(id) = before.get(role.name()) {
            if after.get(role.name()) != Some(id) {
                audit::log_key_retired(tx.correlation_id(), role.name(), id);
            }
        }
    }

    if sign {
        if let Some(creds) = creds.as_ref() {
            session.sign_roots(&creds.creds)?;
        }
    }
    session.upload("rotate-online-key")?;
    Ok(pending)
}

/// Change the root threshold, or the production targets threshold.
pub fn set_threshold(
    api: &dyn FactoryApi,
    tx: &Transaction,
    role: Role,
    threshold: u32,
    creds_path: Option<&Path>,
    sign: bool,
) -> Result<(), TufError> {
    let mut session = Session::open(api, tx)?;
    let mut ci = session.staged();

    match role {
        Role::Targets => {
            let mut prod_check = ci.clone();
            rotation::set_threshold(&mut prod_check, Role::Targets, threshold, true)?;
            session.commit_edit(ci, &[role], Some(threshold))?;
        }
        _ => {
            rotation::set_threshold(&mut ci, role, threshold, false)?;
            session.commit_edit(ci, &[role], None)?;
        }
    }

    if sign {
        let path = creds_path.ok_or(TufError::UsageError(
            "Signing requires a credentials archive",
        ))?;
        let creds = CredsFile::open(path)?;
        session.sign_roots(&creds.creds)?;
    }
    session.upload("set-threshold")
}

/// Add root signatures to the staged roots without changing their content.
pub fn sign(
    api: &dyn FactoryApi,
    tx: &Transaction,
    creds_path: &Path,
) -> Result<Vec<String>, TufError> {
    let mut session = Session::open(api, tx)?;
    let creds = CredsFile::open(creds_path)?;
    let ids = session.sign_roots(&creds.creds)?;
    session.upload("sign")?;
    Ok(ids)
}

/// Stage a new root version with unchanged keys, signed by `creds_path`.
pub fn resign_root(
    api: &dyn FactoryApi,
    tx: &Transaction,
    creds_path: &Path,
) -> Result<(), TufError> {
    let mut session = Session::open(api, tx)?;
    let creds = CredsFile::open(creds_path)?;
    let ci = session.staged();
    session.commit_edit(ci, &[Role::Root], None)?;
    session.sign_roots(&creds.creds)?;
    session.upload("resign-root")
}

/// Sign matching production and wave manifests with the offline targets keys
/// held in `creds_path`.
pub fn sign_prod_targets(
    api: &dyn FactoryApi,
    tx: &Transaction,
    creds_path: &Path,
    filter: &ManifestFilter,
) -> Result<ResignReport, TufError> {
    let mut session = Session::open(api, tx)?;
    let creds = CredsFile::open(creds_path)?;

    let online = session.online_keys();
    let mut keys = BTreeMap::new();
    for root in [session.current(), &session.state.updated.signed] {
        for (id, key) in root.role_keys(Role::Targets)? {
            if !online.contains(&id) {
                keys.insert(id, key);
            }
        }
    }
    let signers = creds.creds.signers_for(&keys)?;
    if signers.is_empty() {
        return Err(TufError::KeyNotFound(
            "the credentials hold no offline targets key".to_string(),
        ));
    }

    let prod = api.get_prod_targets()?;
    let waves = api.get_wave_targets()?;
    let cid = tx.correlation_id();
    let mut report = ResignReport::default();
    for (id, signer) in &signers {
        let tags = sync::sign_manifests(
            &prod,
            &mut session.state.prod_signatures,
            signer,
            |name, _| filter.selects_tag(name),
        )?;
        let wave_names = sync::sign_manifests(
            &waves,
            &mut session.state.wave_signatures,
            signer,
            |name, _| filter.selects_wave(name),
        )?;
        for name in &tags {
            audit::log_manifest_resigned(cid, "prod", name, id);
        }
        for name in &wave_names {
            audit::log_manifest_resigned(cid, "wave", name, id);
        }
        report.prod.extend(tags);
        report.waves.extend(wave_names);
    }

    if report.is_empty() {
        log::info!("Every matching manifest is already signed by these keys");
        return Ok(report);
    }
    session.upload("sign-prod-targets")?;
    Ok(report)
}

/// Render the staged changes of a transaction.
pub fn review(api: &dyn FactoryApi, tx: &Transaction, prod: bool) -> Result<Review, TufError> {
    let session = Session::open(api, tx)?;
    Review::new(&session.state, session.published_prod.as_ref(), prod)
}

/// A rendered view of the staged state: root diff, signature status and
/// pending manifest signatures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Review {
    title: String,
    diff: Option<RootDiff>,
    status: Vec<(&'static str, SignatureStatus)>,
    online_keys: BTreeMap<String, String>,
    prod_signatures: BTreeMap<String, usize>,
    wave_signatures: BTreeMap<String, usize>,
}

impl Review {
    /// Pure function of the transaction state and the published production root.
    pub fn new(
        state: &TxState,
        published_prod: Option<&SignedRoot>,
        prod: bool,
    ) -> Result<Self, TufError> {
        let (title, pair) = if prod {
            (
                "Production root".to_string(),
                state
                    .updated_prod
                    .as_ref()
                    .map(|staged| (published_prod.unwrap_or(&state.current), staged)),
            )
        } else {
            ("CI root".to_string(), Some((&state.current, &state.updated)))
        };

        let mut status = Vec::new();
        let diff = match pair {
            Some((current, staged)) => {
                status.push((
                    "current root role",
                    verify_root_role(staged, &current.signed, Role::Root)?,
                ));
                status.push((
                    "staged root role",
                    verify_root_role(staged, &staged.signed, Role::Root)?,
                ));
                Some(RootDiff::between(&current.signed, &staged.signed))
            }
            None => None,
        };

        Ok(Self {
            title,
            diff,
            status,
            online_keys: state.online_keys.clone(),
            prod_signatures: state
                .prod_signatures
                .iter()
                .map(|(k, v)| (k.clone(), v.len()))
                .collect(),
            wave_signatures: state
                .wave_signatures
                .iter()
                .map(|(k, v)| (k.clone(), v.len()))
                .collect(),
        })
    }

    /// Whether the staged roots carry enough root signatures to be applied.
    pub fn is_signed(&self) -> bool {
        !self.status.is_empty() && self.status.iter().all(|(_, s)| s.is_satisfied())
    }
}

impl fmt::Display for Review {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "== {}", self.title)?;
        let Some(diff) = &self.diff else {
            return writeln!(f, "not changed by this transaction");
        };
        write!(f, "{}", diff)?;
        for (label, status) in &self.status {
            write!(
                f,
                "signatures ({}): {}/{}",
                label,
                status.valid.len(),
                status.threshold
            )?;
            if status.is_satisfied() {
                writeln!(f, " ok")?;
            } else {
                writeln!(f, " ({} missing)", status.missing())?;
            }
        }
        for (role, id) in &self.online_keys {
            writeln!(f, "online {} key: {}", role, id)?;
        }
        for (tag, n) in &self.prod_signatures {
            writeln!(f, "production targets '{}': {} new signature(s)", tag, n)?;
        }
        for (wave, n) in &self.wave_signatures {
            writeln!(f, "wave '{}': {} new signature(s)", wave, n)?;
        }
        Ok(())
    }
}
