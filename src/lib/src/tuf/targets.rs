//! Production and wave targets manifests

use crate::error::TufError;
use crate::signature::Signed;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// The `signed` part of a targets manifest.
///
/// Only the fields the signing workflow needs are typed; the target list
/// and anything else are carried through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetsMeta {
    #[serde(rename = "_type")]
    pub type_: String,
    pub expires: String,
    pub version: u64,
    #[serde(default)]
    pub targets: Map<String, Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

pub type SignedTargets = Signed<TargetsMeta>;

/// Manifests keyed by production tag or wave name.
pub type TargetsManifests = BTreeMap<String, SignedTargets>;

/// Which published manifests a signing command applies to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestFilter {
    /// Production tags; empty selects all tags unless only waves were requested
    pub tags: Vec<String>,
    /// Wave names; empty selects all waves unless only tags were requested
    pub waves: Vec<String>,
}

impl ManifestFilter {
    pub fn all() -> Self {
        Self::default()
    }

    fn is_all(&self) -> bool {
        self.tags.is_empty() && self.waves.is_empty()
    }

    pub fn selects_tag(&self, tag: &str) -> bool {
        self.is_all() || self.tags.iter().any(|t| t == tag)
    }

    pub fn selects_wave(&self, wave: &str) -> bool {
        self.is_all() || self.waves.iter().any(|w| w == wave)
    }

    /// Parse comma-separated `--tags` / `--waves` values.
    pub fn from_csv(tags: Option<&str>, waves: Option<&str>) -> Self {
        fn split(s: Option<&str>) -> Vec<String> {
            s.map(|s| {
                s.split(',')
                    .map(str::trim)
                    .filter(|x| !x.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
        }
        Self {
            tags: split(tags),
            waves: split(waves),
        }
    }
}

impl TargetsMeta {
    pub fn from_json(data: &[u8]) -> Result<SignedTargets, TufError> {
        let targets: SignedTargets = serde_json::from_slice(data)
            .map_err(|e| TufError::ParseError(format!("Invalid targets metadata: {}", e)))?;
        if targets.signed.type_ != "Targets" {
            return Err(TufError::ParseError(format!(
                "Unexpected metadata type '{}'",
                targets.signed.type_
            )));
        }
        Ok(targets)
    }
}
