//! Rotation and transaction engine for a Factory's TUF root metadata.
//!
//! The engine rotates the offline keys of the `root` and `targets` roles
//! under quorum, keeps the production root derived from the CI root, and
//! re-signs published production and wave manifests when a targets key is
//! retired. All changes go through a server-held transaction that is either
//! applied as a whole or canceled.

#![forbid(unsafe_code)]

mod error;
mod signature;

/// Factory API client
pub mod api;

/// Structured audit events for key and transaction operations
pub mod audit;

/// Configuration file and environment overrides
pub mod config;

/// Offline credentials archive (gzip tar of key documents)
pub mod creds;

/// Single-shot `rotate-root`, `rotate-targets` and `resign-root`
pub mod legacy;

/// Pure key rotation edits of a root document
pub mod rotation;

/// Secure file operations with restrictive permissions
///
/// Private key archives are created 0600 and replaced atomically with a
/// timestamped backup of the previous version.
pub mod secure_file;

/// Production / CI root synchronization and manifest re-signing
pub mod sync;

/// Server-held transaction state machine
pub mod transaction;

/// TUF root and targets metadata
pub mod tuf;

/// Staged update commands
pub mod updates;

pub use error::*;
pub use signature::*;

pub mod reexports {
    pub use {hmac_sha256, log, thiserror};
}
