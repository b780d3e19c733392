//! Transaction lifecycle against an in-memory Factory
//!
//! Run with: `cargo test --test transaction_flow`

mod common;

use common::Fixture;
use tufroot::creds::OfflineCreds;
use tufroot::legacy::{self, SingleShotError};
use tufroot::sync;
use tufroot::transaction::{ApplyFailureKind, Transaction};
use tufroot::tuf::Role;
use tufroot::updates;
use tufroot::{KeyType, TufError};

fn empty_archive(fx: &Fixture, name: &str) -> std::path::PathBuf {
    let path = fx.dir.path().join(name);
    OfflineCreds::new().save(&path).unwrap();
    path
}

#[test]
fn test_second_init_conflicts() {
    let fx = Fixture::new();
    let _tx = Transaction::init(&fx.api, "first").unwrap();
    let err = Transaction::init(&fx.api, "second").unwrap_err();
    assert!(matches!(err, TufError::Conflict(_)));
}

#[test]
fn test_init_requires_a_reason() {
    let fx = Fixture::new();
    assert!(Transaction::init(&fx.api, "  ").is_err());
    assert!(!fx.api.has_active_tx());
}

#[test]
fn test_two_offline_targets_keys_in_one_transaction() {
    let fx = Fixture::new();
    let operator = empty_archive(&fx, "operator.tgz");
    let tx = Transaction::init(&fx.api, "add targets keys").unwrap();

    let first =
        updates::add_offline_key(&fx.api, &tx, &operator, Role::Targets, KeyType::Ed25519, false)
            .unwrap();
    let second =
        updates::add_offline_key(&fx.api, &tx, &operator, Role::Targets, KeyType::Ed25519, false)
            .unwrap();
    assert_ne!(first, second);

    let staged = tx.state(&fx.api).unwrap().updated.signed;
    let targets = staged.role(Role::Targets).unwrap();
    assert!(targets.contains(&first));
    assert!(targets.contains(&second));
    assert!(targets.contains(&fx.targets_key_id()));
    assert_eq!(targets.threshold, 1);
    assert_eq!(staged.version, 2);

    let held = OfflineCreds::open(&operator).unwrap();
    assert_eq!(held.entry_names().count(), 4);

    updates::sign(&fx.api, &tx, &fx.creds_path).unwrap();
    tx.apply(&fx.api).unwrap();

    let published = fx.api.ci_root();
    assert_eq!(published.signed.version, 2);
    assert_eq!(published.signed.role(Role::Targets).unwrap().keyids.len(), 4);
}

#[test]
fn test_adding_a_second_generation_of_a_held_key_is_refused() {
    let fx = Fixture::new();
    let tx = Transaction::init(&fx.api, "add").unwrap();
    let err = updates::add_offline_key(
        &fx.api,
        &tx,
        &fx.creds_path,
        Role::Targets,
        KeyType::Ed25519,
        false,
    )
    .unwrap_err();
    assert!(matches!(err, TufError::InvalidArgument(_)));
}

#[test]
fn test_rejected_apply_keeps_staged_changes() {
    let fx = Fixture::new();
    let operator = empty_archive(&fx, "operator.tgz");
    let tx = Transaction::init(&fx.api, "add targets key").unwrap();
    updates::add_offline_key(&fx.api, &tx, &operator, Role::Targets, KeyType::Ed25519, false)
        .unwrap();
    updates::sign(&fx.api, &tx, &fx.creds_path).unwrap();

    let before = updates::review(&fx.api, &tx, false).unwrap();
    fx.api.fail_apply_with(Some(422));
    let failure = tx.apply(&fx.api).unwrap_err();
    assert_eq!(failure.kind, ApplyFailureKind::NonFatal);
    assert!(fx.api.has_active_tx());

    let tx = failure.tx;
    let after = updates::review(&fx.api, &tx, false).unwrap();
    assert_eq!(before, after);
    assert_eq!(before.to_string(), after.to_string());

    fx.api.fail_apply_with(None);
    tx.apply(&fx.api).unwrap();
    assert_eq!(fx.api.ci_root().signed.version, 2);
}

#[test]
fn test_unsigned_root_is_rejected_without_changes() {
    let fx = Fixture::new();
    let operator = empty_archive(&fx, "operator.tgz");
    let tx = Transaction::init(&fx.api, "add targets key").unwrap();
    updates::add_offline_key(&fx.api, &tx, &operator, Role::Targets, KeyType::Ed25519, false)
        .unwrap();

    let failure = tx.apply(&fx.api).unwrap_err();
    assert!(matches!(
        failure.error,
        TufError::Validation { status: 422, .. }
    ));
    assert!(!failure.is_fatal());
    assert_eq!(fx.api.ci_root().signed.version, 1);
    assert!(failure.guidance().contains("cancel"));
}

#[test]
fn test_fatal_apply_failure_warns_against_cancel() {
    let fx = Fixture::new();
    let tx = Transaction::init(&fx.api, "resign").unwrap();
    updates::resign_root(&fx.api, &tx, &fx.creds_path).unwrap();

    fx.api.fail_apply_with(Some(500));
    let failure = tx.apply(&fx.api).unwrap_err();
    assert!(failure.is_fatal());
    assert!(failure.guidance().contains("Do NOT cancel"));
    assert!(fx.api.has_active_tx());
}

#[test]
fn test_cancel_discards_staged_changes() {
    let fx = Fixture::new();
    let tx = Transaction::init(&fx.api, "resign").unwrap();
    updates::resign_root(&fx.api, &tx, &fx.creds_path).unwrap();
    tx.cancel(&fx.api).unwrap();

    assert!(!fx.api.has_active_tx());
    assert_eq!(fx.api.ci_root().signed.version, 1);
    Transaction::init(&fx.api, "again").unwrap();
}

#[test]
fn test_resign_root_bumps_version_and_expiry() {
    let fx = Fixture::new();
    let tx = Transaction::init(&fx.api, "resign").unwrap();
    updates::resign_root(&fx.api, &tx, &fx.creds_path).unwrap();
    tx.apply(&fx.api).unwrap();

    let published = fx.api.ci_root().signed;
    assert_eq!(published.version, 2);
    assert_ne!(published.expires, "2030-01-01T00:00:00Z");
    assert_eq!(
        published.role(Role::Root).unwrap().keyids,
        vec![fx.root_key_id()]
    );
    let reason = published.change_reason.unwrap();
    assert_eq!(reason.message, "resign");
}

#[test]
fn test_legacy_rotate_root_applies() {
    let fx = Fixture::new();
    let summary =
        legacy::rotate_root(&fx.api, &fx.creds_path, KeyType::Ed25519, "rotate root").unwrap();

    assert!(!fx.api.has_active_tx());
    assert_eq!(summary.old_key_id, fx.root_key_id());
    let published = fx.api.ci_root().signed;
    assert_eq!(
        published.role(Role::Root).unwrap().keyids,
        vec![summary.new_key_id.clone()]
    );
    let prod = fx.api.prod_root().unwrap().signed;
    assert_eq!(prod.version, published.version);
    assert_eq!(prod.role(Role::Targets).unwrap().threshold, 2);
}

#[test]
fn test_legacy_leaves_transaction_open_on_apply_failure() {
    let fx = Fixture::new();
    fx.api.fail_apply_with(Some(422));
    let err = legacy::resign_root(&fx.api, &fx.creds_path, "resign").unwrap_err();

    assert!(matches!(err, SingleShotError::Apply(_)));
    assert!(fx.api.has_active_tx());
    let txid = err.txid().unwrap().to_string();
    assert!(err.guidance().unwrap().contains(&txid));
}

#[test]
fn test_legacy_leaves_transaction_open_on_staging_failure() {
    let fx = Fixture::new();
    let missing = fx.dir.path().join("missing.tgz");
    let err = legacy::rotate_root(&fx.api, &missing, KeyType::Ed25519, "rotate").unwrap_err();

    match &err {
        SingleShotError::Staging { txid, .. } => assert!(err.guidance().unwrap().contains(txid)),
        other => panic!("unexpected {:?}", other),
    }
    assert!(fx.api.has_active_tx());
}

#[test]
fn test_legacy_reports_an_active_transaction() {
    let fx = Fixture::new();
    let _tx = Transaction::init(&fx.api, "someone else").unwrap();
    let err = legacy::resign_root(&fx.api, &fx.creds_path, "resign").unwrap_err();
    assert!(matches!(err, SingleShotError::Init(TufError::Conflict(_))));
    assert!(err.txid().is_none());
}

#[test]
fn test_sync_prod_root() {
    let fx = Fixture::with_production();
    let prod = sync::sync_prod_root(&fx.api, &fx.creds()).unwrap();
    assert_eq!(prod.signed.version, fx.api.ci_root().signed.version);
    assert_eq!(fx.api.prod_root().unwrap(), prod);
}

#[test]
fn test_sync_prod_root_out_of_sync() {
    let fx = Fixture::with_production();
    fx.api.reject_root_post();
    let err = sync::sync_prod_root(&fx.api, &fx.creds()).unwrap_err();
    assert!(matches!(err, TufError::ProdOutOfSync));
    assert!(err.to_string().contains("sync-prod-root"));
}
