//! TUF metadata documents handled by the rotation engine.

pub mod root;
pub mod targets;

pub use root::{
    expiry_from_now, now_timestamp, verify_root_role, ChangeReason, Role, RoleDiff, RoleKeys,
    RootDiff, RootMeta, SignedRoot,
};
pub use targets::{ManifestFilter, SignedTargets, TargetsManifests, TargetsMeta};
