//! Offline credentials archive
//!
//! A gzip-compressed tar holding one JSON key document per entry:
//! `tufrepo/keys/<name>.pub` and the matching `tufrepo/keys/<name>.sec`.
//! Entries outside `tufrepo/keys/` are carried along untouched.

use crate::error::TufError;
use crate::secure_file;
use crate::signature::{save_key_pair, Signer, TufKey};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};

/// Directory of key documents inside the archive.
pub const KEYS_DIR: &str = "tufrepo/keys/";

const PUB_SUFFIX: &str = ".pub";
const SEC_SUFFIX: &str = ".sec";

/// In-memory view of an offline credentials archive.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct OfflineCreds {
    entries: BTreeMap<String, Vec<u8>>,
}

impl std::fmt::Debug for OfflineCreds {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineCreds")
            .field("entries", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl OfflineCreds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load an archive from disk.
    pub fn open(path: &Path) -> Result<Self, TufError> {
        let data = secure_file::read_secure(path).map_err(|e| {
            TufError::ArchiveError(format!("Unable to read '{}': {}", path.display(), e))
        })?;
        let creds = Self::from_bytes(&data)
            .map_err(|e| TufError::ArchiveError(format!("'{}': {}", path.display(), e)))?;
        log::debug!(
            "Loaded {} entries from {}",
            creds.entries.len(),
            path.display()
        );
        Ok(creds)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, TufError> {
        let mut archive = tar::Archive::new(GzDecoder::new(data));
        let mut entries = BTreeMap::new();
        let iter = archive
            .entries()
            .map_err(|e| TufError::ArchiveError(format!("Malformed archive: {}", e)))?;
        for entry in iter {
            let mut entry =
                entry.map_err(|e| TufError::ArchiveError(format!("Malformed archive: {}", e)))?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let name = entry
                .path()
                .map_err(|e| TufError::ArchiveError(format!("Bad entry name: {}", e)))?
                .to_string_lossy()
                .into_owned();
            let mut content = Vec::new();
            entry
                .read_to_end(&mut content)
                .map_err(|e| TufError::ArchiveError(format!("Truncated entry {}: {}", name, e)))?;
            entries.insert(name, content);
        }
        Ok(Self { entries })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, TufError> {
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        for (name, content) in &self.entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o600);
            header.set_mtime(0);
            header.set_entry_type(tar::EntryType::Regular);
            builder.append_data(&mut header, name, content.as_slice())?;
        }
        let encoder = builder.into_inner()?;
        Ok(encoder.finish()?)
    }

    /// Back up the existing archive, then replace it atomically.
    ///
    /// Returns the backup path when there was a previous archive.
    pub fn save(&self, path: &Path) -> Result<Option<PathBuf>, TufError> {
        self.validate()?;
        secure_file::check_no_stale_tmp(path)?;
        let data = self.to_bytes()?;
        let backup = if path.exists() {
            Some(secure_file::backup(path)?)
        } else {
            None
        };
        secure_file::write_atomic(path, &data)?;
        if let Some(b) = &backup {
            log::info!("Saved {} (previous version backed up to {})", path.display(), b.display());
        }
        Ok(backup)
    }

    pub fn entry_names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.entries.get(name).map(Vec::as_slice)
    }

    pub fn insert(&mut self, name: impl Into<String>, content: Vec<u8>) {
        self.entries.insert(name.into(), content);
    }

    /// `(logical name, public key)` for every `.pub` key document.
    pub fn public_keys(&self) -> Result<Vec<(String, TufKey)>, TufError> {
        self.entries
            .iter()
            .filter_map(|(name, content)| {
                let stem = name.strip_prefix(KEYS_DIR)?.strip_suffix(PUB_SUFFIX)?;
                Some((stem.to_string(), content))
            })
            .map(|(stem, content)| {
                let key = TufKey::from_json(content).map_err(|e| {
                    TufError::ArchiveError(format!("{}{}{}: {}", KEYS_DIR, stem, PUB_SUFFIX, e))
                })?;
                Ok((stem, key))
            })
            .collect()
    }

    /// Check that every private key has a public half with the same key id.
    pub fn validate(&self) -> Result<(), TufError> {
        for name in self.entries.keys() {
            let Some(stem) = name
                .strip_prefix(KEYS_DIR)
                .and_then(|n| n.strip_suffix(SEC_SUFFIX))
            else {
                continue;
            };
            let pub_name = format!("{}{}{}", KEYS_DIR, stem, PUB_SUFFIX);
            let public = self.entries.get(&pub_name).ok_or_else(|| {
                TufError::ArchiveError(format!("{} has no matching {}", name, pub_name))
            })?;
            let public = TufKey::from_json(public)
                .map_err(|e| TufError::ArchiveError(format!("{}: {}", pub_name, e)))?;
            let signer = self.load_private(name)?;
            if signer.key_id()? != public.key_id()? {
                return Err(TufError::ArchiveError(format!(
                    "{} and {} hold different keys",
                    name, pub_name
                )));
            }
        }
        Ok(())
    }

    fn load_private(&self, name: &str) -> Result<Signer, TufError> {
        let content = self
            .entries
            .get(name)
            .ok_or_else(|| TufError::ArchiveError(format!("Missing entry {}", name)))?;
        TufKey::from_json(content)
            .and_then(|k| k.to_signer())
            .map_err(|e| TufError::ArchiveError(format!("{}: {}", name, e)))
    }

    /// Store both halves of a new key under `<prefix>-<key id>` and return the key id.
    pub fn add_key_pair(&mut self, prefix: &str, signer: &Signer) -> Result<String, TufError> {
        let (private, public) = save_key_pair(signer)?;
        let id = public.key_id()?;
        let stem = format!("{}{}-{}", KEYS_DIR, prefix, id);
        self.entries
            .insert(format!("{}{}", stem, PUB_SUFFIX), public.to_json()?);
        self.entries
            .insert(format!("{}{}", stem, SEC_SUFFIX), private.to_json()?);
        Ok(id)
    }

    /// Logical names whose public half equals `key`.
    fn matching_stems(&self, key: &TufKey) -> Result<Vec<String>, TufError> {
        let wanted = key.public_value().map(str::trim);
        Ok(self
            .public_keys()?
            .into_iter()
            .filter(|(_, k)| k.keytype == key.keytype && k.public_value().map(str::trim) == wanted)
            .map(|(stem, _)| stem)
            .filter(|stem| {
                self.entries
                    .contains_key(&format!("{}{}{}", KEYS_DIR, stem, SEC_SUFFIX))
            })
            .collect())
    }

    /// Whether the archive holds the private key for `key`.
    pub fn has_private_key(&self, key: &TufKey) -> Result<bool, TufError> {
        Ok(!self.matching_stems(key)?.is_empty())
    }

    /// Load the private key whose public half is `key`.
    pub fn find_signer(&self, key_id: &str, key: &TufKey) -> Result<Signer, TufError> {
        let stems = self.matching_stems(key)?;
        let stem = stems
            .first()
            .ok_or_else(|| TufError::KeyNotFound(format!("no private key for {}", key_id)))?;
        let signer = self.load_private(&format!("{}{}{}", KEYS_DIR, stem, SEC_SUFFIX))?;
        if signer.key_id()? != key_id {
            return Err(TufError::ArchiveError(format!(
                "Private key {} does not match key id {}",
                stem, key_id
            )));
        }
        Ok(signer)
    }

    /// Signers for every key in `keys` this archive holds; others are skipped.
    pub fn signers_for(
        &self,
        keys: &BTreeMap<String, TufKey>,
    ) -> Result<Vec<(String, Signer)>, TufError> {
        let mut out = Vec::new();
        for (id, key) in keys {
            match self.find_signer(id, key) {
                Ok(signer) => out.push((id.clone(), signer)),
                Err(TufError::KeyNotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::KeyType;

    #[test]
    fn test_archive_round_trip() {
        let mut creds = OfflineCreds::new();
        let signer = KeyType::Ed25519.generate_key().unwrap();
        let id = creds.add_key_pair("root", &signer).unwrap();
        creds.insert("tufrepo/root.json", b"{}".to_vec());

        let parsed = OfflineCreds::from_bytes(&creds.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed, creds);
        assert_eq!(parsed.get("tufrepo/root.json"), Some(&b"{}"[..]));
        let names: Vec<&str> = parsed.entry_names().collect();
        assert!(names.contains(&format!("tufrepo/keys/root-{}.pub", id).as_str()));
        assert!(names.contains(&format!("tufrepo/keys/root-{}.sec", id).as_str()));
        parsed.validate().unwrap();
    }

    #[test]
    fn test_malformed_archive() {
        assert!(matches!(
            OfflineCreds::from_bytes(b"not a tarball"),
            Err(TufError::ArchiveError(_))
        ));
    }

    #[test]
    fn test_find_signer() {
        let mut creds = OfflineCreds::new();
        let signer = KeyType::Ed25519.generate_key().unwrap();
        let id = creds.add_key_pair("targets", &signer).unwrap();
        let public = signer.public_key().unwrap();

        let found = creds.find_signer(&id, &public).unwrap();
        assert_eq!(found.key_id().unwrap(), id);
        assert!(creds.has_private_key(&public).unwrap());

        let other = KeyType::Ed25519.generate_key().unwrap();
        let err = creds
            .find_signer(&other.key_id().unwrap(), &other.public_key().unwrap())
            .unwrap_err();
        assert!(matches!(err, TufError::KeyNotFound(_)));
    }

    #[test]
    fn test_public_only_entry_is_not_a_signer() {
        let mut creds = OfflineCreds::new();
        let signer = KeyType::Ed25519.generate_key().unwrap();
        let public = signer.public_key().unwrap();
        creds.insert("tufrepo/keys/online.pub", public.to_json().unwrap());
        assert!(!creds.has_private_key(&public).unwrap());
        creds.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_mismatched_pair() {
        let mut creds = OfflineCreds::new();
        let a = KeyType::Ed25519.generate_key().unwrap();
        let b = KeyType::Ed25519.generate_key().unwrap();
        creds.insert(
            "tufrepo/keys/x.pub",
            a.public_key().unwrap().to_json().unwrap(),
        );
        creds.insert(
            "tufrepo/keys/x.sec",
            b.private_key().unwrap().to_json().unwrap(),
        );
        assert!(matches!(creds.validate(), Err(TufError::ArchiveError(_))));

        let mut lonely = OfflineCreds::new();
        lonely.insert(
            "tufrepo/keys/y.sec",
            a.private_key().unwrap().to_json().unwrap(),
        );
        assert!(lonely.validate().is_err());
    }

    #[test]
    fn test_save_backs_up_previous_archive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("offline-creds.tgz");

        let mut creds = OfflineCreds::new();
        creds
            .add_key_pair("root", &KeyType::Ed25519.generate_key().unwrap())
            .unwrap();
        assert!(creds.save(&path).unwrap().is_none());
        let first = std::fs::read(&path).unwrap();

        creds
            .add_key_pair("root", &KeyType::Ed25519.generate_key().unwrap())
            .unwrap();
        let backup = creds.save(&path).unwrap().unwrap();
        assert_eq!(std::fs::read(&backup).unwrap(), first);
        assert_eq!(OfflineCreds::open(&path).unwrap(), creds);
    }

    #[test]
    fn test_save_refuses_stale_tmp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("offline-creds.tgz");
        let creds = OfflineCreds::new();
        creds.save(&path).unwrap();
        std::fs::write(secure_file::tmp_path(&path), b"partial").unwrap();
        assert!(matches!(
            creds.save(&path),
            Err(TufError::ArchiveError(_))
        ));
    }
}
