//! In-memory Factory used by the integration tests.
//!
//! It enforces what the real server enforces for these flows: one active
//! transaction per Factory, root signature quorums on `apply`, and
//! publication of staged manifest signatures. Like the server, it records
//! the change reason of `init` in the staged root, and only publishes a
//! staged root whose version was bumped.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

use serde_json::json;
use tufroot::api::{FactoryApi, RootUpdate, TxPut, TxState};
use tufroot::creds::OfflineCreds;
use tufroot::sync::derive_prod_root;
use tufroot::tuf::{
    now_timestamp, verify_root_role, ChangeReason, Role, RoleKeys, RootMeta, SignedRoot,
    SignedTargets, TargetsManifests, TargetsMeta,
};
use tufroot::{
    sign_envelope, verify_envelope, KeyType, Signer, TufError, NON_FATAL_HTTP_STATUSES,
};

struct Inner {
    ci_roots: Vec<SignedRoot>,
    prod_root: Option<SignedRoot>,
    prod_targets: TargetsManifests,
    wave_targets: TargetsManifests,
    tx: Option<(String, TxState)>,
    next_txid: u32,
    online: BTreeMap<String, Signer>,
    apply_failure: Option<u16>,
    post_conflict: bool,
    applied: u32,
}

pub struct MockFactory {
    inner: Mutex<Inner>,
}

fn status_error(status: u16) -> TufError {
    if NON_FATAL_HTTP_STATUSES.contains(&status) {
        TufError::Validation {
            status,
            message: "rejected by the test server".to_string(),
        }
    } else {
        TufError::Transport(format!("HTTP {}", status))
    }
}

impl MockFactory {
    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    /// Make every following `apply` fail with `status`.
    pub fn fail_apply_with(&self, status: Option<u16>) {
        self.lock().apply_failure = status;
    }

    /// Make the non-transactional root endpoint answer 409.
    pub fn reject_root_post(&self) {
        self.lock().post_conflict = true;
    }

    pub fn ci_root(&self) -> SignedRoot {
        self.lock().ci_roots.last().cloned().unwrap()
    }

    pub fn prod_root(&self) -> Option<SignedRoot> {
        self.lock().prod_root.clone()
    }

    pub fn prod_targets(&self) -> TargetsManifests {
        self.lock().prod_targets.clone()
    }

    pub fn wave_targets(&self) -> TargetsManifests {
        self.lock().wave_targets.clone()
    }

    /// Published manifests whose valid signatures do not reach the targets
    /// threshold of the published production root, as `prod:<tag>` and
    /// `wave:<name>`.
    pub fn under_signed_manifests(&self) -> Vec<String> {
        let inner = self.lock();
        let prod = &inner.prod_root.as_ref().unwrap().signed;
        let keys = prod.role_keys(Role::Targets).unwrap();
        let threshold = prod.role(Role::Targets).unwrap().threshold;

        let mut names = Vec::new();
        for (kind, manifests) in [("prod", &inner.prod_targets), ("wave", &inner.wave_targets)] {
            for (name, m) in manifests {
                if !verify_envelope(m, &keys, threshold).unwrap().is_satisfied() {
                    names.push(format!("{}:{}", kind, name));
                }
            }
        }
        names
    }

    pub fn has_active_tx(&self) -> bool {
        self.lock().tx.is_some()
    }

    pub fn applied(&self) -> u32 {
        self.lock().applied
    }

    pub fn online_key_id(&self, role: Role) -> String {
        self.lock().online[role.name()].key_id().unwrap()
    }

    pub fn online_signer(&self, role: Role) -> Signer {
        self.lock().online[role.name()].clone()
    }

    pub fn insert_prod_targets(&self, tag: &str, manifest: SignedTargets) {
        self.lock().prod_targets.insert(tag.to_string(), manifest);
    }

    pub fn insert_wave_targets(&self, wave: &str, manifest: SignedTargets) {
        self.lock().wave_targets.insert(wave.to_string(), manifest);
    }

    fn check_quorum(current: &RootMeta, staged: &SignedRoot) -> Result<(), TufError> {
        for authority in [current, &staged.signed] {
            let status = verify_root_role(staged, authority, Role::Root)?;
            if !status.is_satisfied() {
                return Err(TufError::Validation {
                    status: 422,
                    message: format!(
                        "root version {} is missing {} signature(s)",
                        staged.signed.version,
                        status.missing()
                    ),
                });
            }
        }
        Ok(())
    }
}

fn publish_signatures(
    manifests: &mut TargetsManifests,
    staged: &BTreeMap<String, Vec<tufroot::Signature>>,
) {
    for (name, sigs) in staged {
        if let Some(m) = manifests.get_mut(name) {
            for sig in sigs {
                if !m.is_signed_by(&sig.keyid) {
                    m.signatures.push(sig.clone());
                }
            }
        }
    }
}

impl FactoryApi for MockFactory {
    fn get_ci_root(&self, version: Option<u64>) -> Result<SignedRoot, TufError> {
        let inner = self.lock();
        let found = match version {
            None => inner.ci_roots.last(),
            Some(v) => inner.ci_roots.iter().find(|r| r.signed.version == v),
        };
        found
            .cloned()
            .ok_or_else(|| TufError::Transport("HTTP 404".to_string()))
    }

    fn get_prod_root(&self) -> Result<Option<SignedRoot>, TufError> {
        Ok(self.lock().prod_root.clone())
    }

    fn post_root(&self, update: &RootUpdate) -> Result<(), TufError> {
        let mut inner = self.lock();
        if inner.post_conflict {
            return Err(TufError::ProdOutOfSync);
        }
        if let Some(ci) = &update.ci_root {
            inner.ci_roots.push(ci.clone());
        }
        if let Some(prod) = &update.prod_root {
            inner.prod_root = Some(prod.clone());
        }
        Ok(())
    }

    fn tx_init(&self, message: &str) -> Result<String, TufError> {
        let mut inner = self.lock();
        if let Some((txid, _)) = &inner.tx {
            return Err(TufError::Conflict(format!(
                "transaction {} is already active",
                txid
            )));
        }
        inner.next_txid += 1;
        let txid = format!("tx-{}", inner.next_txid);
        let current = inner.ci_roots.last().cloned().unwrap();
        let mut updated = current.clone();
        updated.signed.change_reason = Some(ChangeReason {
            author: "test-operator".to_string(),
            message: message.to_string(),
            time: now_timestamp(),
        });
        let online_keys = inner
            .online
            .iter()
            .map(|(role, s)| (role.clone(), s.key_id().unwrap()))
            .collect();
        let state = TxState {
            current,
            updated,
            updated_prod: None,
            prod_signatures: BTreeMap::new(),
            wave_signatures: BTreeMap::new(),
            online_keys,
        };
        inner.tx = Some((txid.clone(), state));
        Ok(txid)
    }

    fn tx_get(&self, txid: &str) -> Result<TxState, TufError> {
        match &self.lock().tx {
            Some((id, state)) if id.as_str() == txid => Ok(state.clone()),
            _ => Err(TufError::Transport("HTTP 404".to_string())),
        }
    }

    fn tx_put(&self, txid: &str, update: &TxPut) -> Result<(), TufError> {
        match &mut self.lock().tx {
            Some((id, state)) if id.as_str() == txid => {
                state.updated = update.ci_root.clone();
                state.updated_prod = update.prod_root.clone();
                state.prod_signatures = update.prod_signatures.clone();
                state.wave_signatures = update.wave_signatures.clone();
                Ok(())
            }
            _ => Err(TufError::Transport("HTTP 404".to_string())),
        }
    }

    fn tx_apply(&self, txid: &str) -> Result<(), TufError> {
        let mut inner = self.lock();
        let state = match &inner.tx {
            Some((id, state)) if id.as_str() == txid => state.clone(),
            _ => return Err(TufError::Transport("HTTP 404".to_string())),
        };
        if let Some(status) = inner.apply_failure {
            return Err(status_error(status));
        }

        let bumped = state.updated.signed.version > state.current.signed.version;
        if bumped {
            Self::check_quorum(&state.current.signed, &state.updated)?;
        }
        if let Some(prod) = &state.updated_prod {
            Self::check_quorum(&state.current.signed, prod)?;
        }

        if bumped {
            inner.ci_roots.push(state.updated.clone());
        }
        if let Some(prod) = state.updated_prod {
            inner.prod_root = Some(prod);
        }
        publish_signatures(&mut inner.prod_targets, &state.prod_signatures);
        publish_signatures(&mut inner.wave_targets, &state.wave_signatures);
        inner.tx = None;
        inner.applied += 1;
        Ok(())
    }

    fn tx_cancel(&self, txid: &str) -> Result<(), TufError> {
        let mut inner = self.lock();
        match &inner.tx {
            Some((id, _)) if id.as_str() == txid => {
                inner.tx = None;
                Ok(())
            }
            _ => Err(TufError::Transport("HTTP 404".to_string())),
        }
    }

    fn tx_generate_online_keys(
        &self,
        txid: &str,
        key_type: KeyType,
        roles: &[Role],
    ) -> Result<(), TufError> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let (id, state) = inner
            .tx
            .as_mut()
            .ok_or_else(|| TufError::Transport("HTTP 404".to_string()))?;
        if id.as_str() != txid {
            return Err(TufError::Transport("HTTP 404".to_string()));
        }
        for role in roles {
            let signer = key_type.generate_key()?;
            let new_id = state.updated.signed.add_key(signer.public_key()?)?;
            let old_id = state.online_keys.get(role.name()).cloned();
            let role_keys = state.updated.signed.role_mut(*role)?;
            role_keys.keyids.retain(|k| Some(k) != old_id.as_ref());
            role_keys.keyids.insert(0, new_id.clone());
            state.online_keys.insert(role.name().to_string(), new_id);
            inner.online.insert(role.name().to_string(), signer);
        }
        state.updated.signatures.clear();
        Ok(())
    }

    fn get_prod_targets(&self) -> Result<TargetsManifests, TufError> {
        Ok(self.lock().prod_targets.clone())
    }

    fn get_wave_targets(&self) -> Result<TargetsManifests, TufError> {
        Ok(self.lock().wave_targets.clone())
    }
}

/// A Factory with one offline root key, one offline targets key and one
/// online key shared by targets, snapshot and timestamp. The offline keys
/// are stored in a credentials archive on disk.
pub struct Fixture {
    pub api: MockFactory,
    pub dir: tempfile::TempDir,
    pub creds_path: PathBuf,
    pub root_key: Signer,
    pub targets_key: Signer,
}

impl Fixture {
    pub fn new() -> Self {
        Self::build(false)
    }

    /// Same Factory, with a published production root (targets threshold 2).
    pub fn with_production() -> Self {
        Self::build(true)
    }

    fn build(production: bool) -> Self {
        let root_key = KeyType::Ed25519.generate_key().unwrap();
        let targets_key = KeyType::Ed25519.generate_key().unwrap();
        let online = KeyType::Ed25519.generate_key().unwrap();

        let mut meta = RootMeta {
            type_: "Root".to_string(),
            consistent_snapshot: false,
            expires: "2030-01-01T00:00:00Z".to_string(),
            keys: BTreeMap::new(),
            roles: BTreeMap::new(),
            version: 1,
            change_reason: None,
            extra: serde_json::Map::new(),
        };
        let rid = meta.add_key(root_key.public_key().unwrap()).unwrap();
        let tid = meta.add_key(targets_key.public_key().unwrap()).unwrap();
        let oid = meta.add_key(online.public_key().unwrap()).unwrap();
        for (role, ids) in [
            (Role::Root, vec![rid]),
            (Role::Targets, vec![oid.clone(), tid]),
            (Role::Snapshot, vec![oid.clone()]),
            (Role::Timestamp, vec![oid]),
        ] {
            meta.roles.insert(
                role.name().to_string(),
                RoleKeys {
                    keyids: ids,
                    threshold: 1,
                },
            );
        }

        let prod_root = production.then(|| {
            let mut prod = SignedRoot::unsigned(derive_prod_root(&meta, 2).unwrap());
            sign_envelope(&mut prod, &[&root_key]).unwrap();
            prod
        });
        let mut ci = SignedRoot::unsigned(meta);
        sign_envelope(&mut ci, &[&root_key]).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let creds_path = dir.path().join("offline-creds.tgz");
        let mut creds = OfflineCreds::new();
        creds.add_key_pair("root", &root_key).unwrap();
        creds.add_key_pair("targets", &targets_key).unwrap();
        creds.save(&creds_path).unwrap();

        let online_by_role = [Role::Targets, Role::Snapshot, Role::Timestamp]
            .iter()
            .map(|r| (r.name().to_string(), online.clone()))
            .collect();

        let api = MockFactory {
            inner: Mutex::new(Inner {
                ci_roots: vec![ci],
                prod_root,
                prod_targets: BTreeMap::new(),
                wave_targets: BTreeMap::new(),
                tx: None,
                next_txid: 0,
                online: online_by_role,
                apply_failure: None,
                post_conflict: false,
                applied: 0,
            }),
        };

        Self {
            api,
            dir,
            creds_path,
            root_key,
            targets_key,
        }
    }

    pub fn root_key_id(&self) -> String {
        self.root_key.key_id().unwrap()
    }

    pub fn targets_key_id(&self) -> String {
        self.targets_key.key_id().unwrap()
    }

    pub fn creds(&self) -> OfflineCreds {
        OfflineCreds::open(&self.creds_path).unwrap()
    }
}

/// A published targets manifest signed by `signers`.
pub fn manifest(version: u64, signers: &[&Signer]) -> SignedTargets {
    let value = json!({
        "signed": {
            "_type": "Targets",
            "expires": "2030-01-01T00:00:00Z",
            "version": version,
            "targets": {
                "intel-corei7-64-lmp": {
                    "hashes": {"sha256": "00ff"},
                    "length": 0,
                    "custom": {"version": version.to_string()}
                }
            }
        },
        "signatures": []
    });
    let mut m = TargetsMeta::from_json(&serde_json::to_vec(&value).unwrap()).unwrap();
    sign_envelope(&mut m, signers).unwrap();
    m
}
