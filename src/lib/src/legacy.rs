//! Single-shot rotation commands
//!
//! `rotate-root`, `rotate-targets` and `resign-root` open a transaction, make
//! one change and apply it right away. When anything fails after the
//! transaction was opened, it is left open on purpose: the credentials
//! archive may already hold the newly generated keys, and only the operator
//! can decide whether to retry `apply` or `cancel`.

use crate::api::FactoryApi;
use crate::error::TufError;
use crate::signature::KeyType;
use crate::transaction::{ApplyFailure, Transaction};
use crate::tuf::Role;
use crate::updates::{self, RotationSummary};

use std::fmt;
use std::path::Path;

/// Failure of a single-shot command.
#[derive(Debug)]
pub enum SingleShotError {
    /// No transaction was opened.
    Init(TufError),
    /// The change could not be staged; the transaction is still open.
    Staging { txid: String, error: TufError },
    /// The staged change could not be applied.
    Apply(ApplyFailure),
}

impl SingleShotError {
    pub fn txid(&self) -> Option<&str> {
        match self {
            SingleShotError::Init(_) => None,
            SingleShotError::Staging { txid, .. } => Some(txid),
            SingleShotError::Apply(failure) => Some(failure.tx.txid()),
        }
    }

    /// What the operator should do about the transaction left behind.
    pub fn guidance(&self) -> Option<String> {
        match self {
            SingleShotError::Init(_) => None,
            SingleShotError::Staging { txid, .. } => Some(format!(
                "Transaction {} is still open. Inspect it with `keys tuf updates review -x {}`, \
                 then cancel it with `keys tuf updates cancel -x {}` or finish it manually.",
                txid, txid, txid
            )),
            SingleShotError::Apply(failure) => Some(failure.guidance()),
        }
    }
}

impl fmt::Display for SingleShotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SingleShotError::Init(e) => write!(f, "{}", e),
            SingleShotError::Staging { error, .. } => write!(f, "{}", error),
            SingleShotError::Apply(failure) => write!(f, "{}", failure.error),
        }?;
        match self.guidance() {
            Some(guidance) => write!(f, "\n{}", guidance),
            None => Ok(()),
        }
    }
}

impl std::error::Error for SingleShotError {}

impl From<SingleShotError> for TufError {
    fn from(e: SingleShotError) -> Self {
        match e {
            SingleShotError::Init(e) => e,
            SingleShotError::Staging { error, .. } => error,
            SingleShotError::Apply(failure) => failure.error,
        }
    }
}

fn run<T, F>(api: &dyn FactoryApi, message: &str, stage: F) -> Result<T, SingleShotError>
where
    F: FnOnce(&Transaction) -> Result<T, TufError>,
{
    let tx = Transaction::init(api, message).map_err(SingleShotError::Init)?;
    let out = match stage(&tx) {
        Ok(out) => out,
        Err(error) => {
            log::error!("Staging failed; transaction {} left open", tx.txid());
            return Err(SingleShotError::Staging {
                txid: tx.txid().to_string(),
                error,
            });
        }
    };
    tx.apply(api).map_err(SingleShotError::Apply)?;
    Ok(out)
}

/// Rotate the offline root key held in `creds_path` and publish the new root.
pub fn rotate_root(
    api: &dyn FactoryApi,
    creds_path: &Path,
    key_type: KeyType,
    message: &str,
) -> Result<RotationSummary, SingleShotError> {
    run(api, message, |tx| {
        updates::rotate_offline_key(api, tx, creds_path, None, Role::Root, key_type, true)
    })
}

/// Rotate the offline targets key and publish the new root together with
/// the re-signed production manifests.
pub fn rotate_targets(
    api: &dyn FactoryApi,
    creds_path: &Path,
    targets_creds_path: Option<&Path>,
    key_type: KeyType,
    message: &str,
) -> Result<RotationSummary, SingleShotError> {
    run(api, message, |tx| {
        updates::rotate_offline_key(
            api,
            tx,
            creds_path,
            targets_creds_path,
            Role::Targets,
            key_type,
            true,
        )
    })
}

/// Publish a new root version with the same keys and a fresh expiry.
pub fn resign_root(
    api: &dyn FactoryApi,
    creds_path: &Path,
    message: &str,
) -> Result<(), SingleShotError> {
    run(api, message, |tx| updates::resign_root(api, tx, creds_path))
}
