//! Root metadata model
//!
//! The root document lists every role, the key ids allowed to sign for it
//! and the quorum each role needs. Two instances exist per Factory: the CI
//! root and a production root derived from it.

use crate::error::TufError;
use crate::signature::{verify_envelope, SignatureStatus, Signed, TufKey};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// Lifetime of a freshly staged root version.
pub const ROOT_EXPIRY_DAYS: i64 = 365;

/// Format of `expires` and change reason timestamps.
pub const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// TUF roles known to the root document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Role {
    Root,
    Targets,
    Snapshot,
    Timestamp,
}

impl Role {
    pub const ALL: [Role; 4] = [Role::Root, Role::Targets, Role::Snapshot, Role::Timestamp];

    pub fn name(&self) -> &'static str {
        match self {
            Role::Root => "root",
            Role::Targets => "targets",
            Role::Snapshot => "snapshot",
            Role::Timestamp => "timestamp",
        }
    }

    /// Whether operators may hold offline keys for this role.
    pub fn has_offline_keys(&self) -> bool {
        matches!(self, Role::Root | Role::Targets)
    }

    /// Parse a role accepted by offline key commands (`root` or `targets`).
    pub fn parse_offline(s: &str) -> Result<Self, TufError> {
        let role: Role = s.parse()?;
        if !role.has_offline_keys() {
            return Err(TufError::InvalidArgument(format!(
                "Role '{}' has no offline keys; expected root or targets",
                role
            )));
        }
        Ok(role)
    }
}

impl FromStr for Role {
    type Err = TufError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "root" => Ok(Role::Root),
            "targets" => Ok(Role::Targets),
            "snapshot" => Ok(Role::Snapshot),
            "timestamp" => Ok(Role::Timestamp),
            other => Err(TufError::InvalidArgument(format!("Unknown role '{}'", other))),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Key ids allowed to sign for a role, and how many of them must sign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleKeys {
    pub keyids: Vec<String>,
    pub threshold: u32,
}

impl RoleKeys {
    pub fn contains(&self, key_id: &str) -> bool {
        self.keyids.iter().any(|k| k == key_id)
    }
}

/// Who changed the root, and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeReason {
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub time: String,
}

/// The `signed` part of a root document.
///
/// Fields this model does not know about are kept in `extra` so a
/// read-modify-write cycle does not change their canonical bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootMeta {
    #[serde(rename = "_type")]
    pub type_: String,
    #[serde(default)]
    pub consistent_snapshot: bool,
    pub expires: String,
    pub keys: BTreeMap<String, TufKey>,
    pub roles: BTreeMap<String, RoleKeys>,
    pub version: u64,
    #[serde(
        rename = "x-changelog",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub change_reason: Option<ChangeReason>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A root document with its signatures.
pub type SignedRoot = Signed<RootMeta>;

impl RootMeta {
    pub fn role(&self, role: Role) -> Result<&RoleKeys, TufError> {
        self.roles.get(role.name()).ok_or_else(|| {
            TufError::ParseError(format!("Root metadata has no '{}' role", role))
        })
    }

    pub fn role_mut(&mut self, role: Role) -> Result<&mut RoleKeys, TufError> {
        self.roles.get_mut(role.name()).ok_or_else(|| {
            TufError::ParseError(format!("Root metadata has no '{}' role", role))
        })
    }

    /// Public keys of every key id listed for `role`.
    pub fn role_keys(&self, role: Role) -> Result<BTreeMap<String, TufKey>, TufError> {
        let mut out = BTreeMap::new();
        for id in &self.role(role)?.keyids {
            let key = self.keys.get(id).ok_or_else(|| {
                TufError::ParseError(format!("Key {} of role '{}' is not in 'keys'", id, role))
            })?;
            out.insert(id.clone(), key.clone());
        }
        Ok(out)
    }

    /// Check the structural invariants of the document.
    pub fn validate(&self) -> Result<(), TufError> {
        if self.type_ != "Root" {
            return Err(TufError::ParseError(format!(
                "Unexpected metadata type '{}'",
                self.type_
            )));
        }
        for (name, role) in &self.roles {
            if role.threshold < 1 {
                return Err(TufError::Threshold(format!(
                    "Role '{}' has threshold 0",
                    name
                )));
            }
            if role.threshold as usize > role.keyids.len() {
                return Err(TufError::Threshold(format!(
                    "Role '{}' needs {} signatures but lists only {} keys",
                    name,
                    role.threshold,
                    role.keyids.len()
                )));
            }
            let unique: BTreeSet<&String> = role.keyids.iter().collect();
            if unique.len() != role.keyids.len() {
                return Err(TufError::ParseError(format!(
                    "Role '{}' lists a key id twice",
                    name
                )));
            }
            for id in &role.keyids {
                if !self.keys.contains_key(id) {
                    return Err(TufError::ParseError(format!(
                        "Key {} of role '{}' is not in 'keys'",
                        id, name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Drop key entries that no role references.
    pub fn remove_unused_keys(&mut self) {
        let used: BTreeSet<String> = self
            .roles
            .values()
            .flat_map(|r| r.keyids.iter().cloned())
            .collect();
        self.keys.retain(|id, _| {
            let keep = used.contains(id);
            if !keep {
                log::debug!("Pruning unused key {}", id);
            }
            keep
        });
    }

    /// Register a public key and return its id.
    pub fn add_key(&mut self, key: TufKey) -> Result<String, TufError> {
        let id = key.key_id()?;
        self.keys.insert(id.clone(), key);
        Ok(id)
    }

    /// Make this document the next version after `current`.
    pub fn bump_from(&mut self, current: &RootMeta) {
        self.version = current.version + 1;
        self.expires = expiry_from_now();
    }

    pub fn from_json(data: &[u8]) -> Result<SignedRoot, TufError> {
        let root: SignedRoot = serde_json::from_slice(data)
            .map_err(|e| TufError::ParseError(format!("Invalid root metadata: {}", e)))?;
        root.signed.validate()?;
        Ok(root)
    }
}

/// `now + ROOT_EXPIRY_DAYS`, formatted like every other TUF timestamp.
pub fn expiry_from_now() -> String {
    (chrono::Utc::now() + chrono::Duration::days(ROOT_EXPIRY_DAYS))
        .format(TIME_FORMAT)
        .to_string()
}

pub fn now_timestamp() -> String {
    chrono::Utc::now().format(TIME_FORMAT).to_string()
}

/// Signature status of `envelope` for `role`, using the keys listed by `authority`.
///
/// A new root version must be signed by the root quorum of both the previous
/// and the new document, so the authority may differ from the signed payload.
pub fn verify_root_role(
    envelope: &SignedRoot,
    authority: &RootMeta,
    role: Role,
) -> Result<SignatureStatus, TufError> {
    let threshold = authority.role(role)?.threshold;
    verify_envelope(envelope, &authority.role_keys(role)?, threshold)
}

/// Key and threshold changes of one role between two root versions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleDiff {
    pub role: String,
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub threshold: (u32, u32),
}

impl RoleDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.threshold.0 == self.threshold.1
    }
}

/// Difference between a published root and its staged successor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootDiff {
    pub version: (u64, u64),
    pub expires: (String, String),
    pub roles: Vec<RoleDiff>,
}

impl RootDiff {
    pub fn between(current: &RootMeta, staged: &RootMeta) -> Self {
        let names: BTreeSet<&String> = current.roles.keys().chain(staged.roles.keys()).collect();
        let empty = RoleKeys {
            keyids: vec![],
            threshold: 0,
        };
        let roles = names
            .into_iter()
            .map(|name| {
                let old = current.roles.get(name).unwrap_or(&empty);
                let new = staged.roles.get(name).unwrap_or(&empty);
                RoleDiff {
                    role: name.clone(),
                    added: new
                        .keyids
                        .iter()
                        .filter(|k| !old.contains(k))
                        .cloned()
                        .collect(),
                    removed: old
                        .keyids
                        .iter()
                        .filter(|k| !new.contains(k))
                        .cloned()
                        .collect(),
                    threshold: (old.threshold, new.threshold),
                }
            })
            .collect();
        Self {
            version: (current.version, staged.version),
            expires: (current.expires.clone(), staged.expires.clone()),
            roles,
        }
    }

    pub fn has_key_changes(&self) -> bool {
        self.roles.iter().any(|r| !r.is_empty())
    }
}

impl fmt::Display for RootDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "version: {} -> {}", self.version.0, self.version.1)?;
        writeln!(f, "expires: {} -> {}", self.expires.0, self.expires.1)?;
        for role in &self.roles {
            if role.is_empty() {
                continue;
            }
            writeln!(f, "{}:", role.role)?;
            if role.threshold.0 != role.threshold.1 {
                writeln!(f, "  threshold: {} -> {}", role.threshold.0, role.threshold.1)?;
            }
            for k in &role.added {
                writeln!(f, "  + {}", k)?;
            }
            for k in &role.removed {
                writeln!(f, "  - {}", k)?;
            }
        }
        if !self.has_key_changes() {
            writeln!(f, "no key changes")?;
        }
        Ok(())
    }
}
