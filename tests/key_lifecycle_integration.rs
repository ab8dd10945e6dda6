mod common;

use std::collections::HashSet;
use std::fs;

use secrecy::{ExposeSecret, SecretBox, SecretString};
use seal_keyring::{
    DeletionPolicy, Error, FileKeyStore, KeyLifecycleManager, KeyStatus, KeyStorage, StorageError,
};
use tempfile::tempdir;

use common::{MASTER_SECRET, cheap_config, open_manager, open_store};

#[test]
fn key_lifecycle_scenario() -> Result<(), Error> {
    let dir = tempdir().unwrap();
    let mut config = cheap_config(dir.path());
    // 保留期为 0：降级后的下一次轮换即会禁用
    config.rotation.retention_period_days = 0;
    let manager = open_manager(&config);

    // K1, version 1, Active
    let k1 = manager.create_key()?;
    assert_eq!((k1.version, k1.status), (1, KeyStatus::Active));
    let under_k1 = manager.encrypt(b"written under k1")?;

    // K2 Active, K1 Enabled
    let first = manager.rotate_keys()?;
    let k2 = manager.get_key(first.new_active)?;
    assert_eq!((k2.version, k2.status), (2, KeyStatus::Active));
    assert_eq!(manager.get_key(k1.id)?.status, KeyStatus::Enabled);
    assert_eq!(manager.decrypt(&under_k1)?, b"written under k1");

    let p = manager.encrypt(b"written under k2")?;
    assert_eq!(p.key_id, k2.id);
    assert_eq!(p.version, 2);
    assert_eq!(manager.decrypt(&p)?, b"written under k2");

    // K1 Disabled, K2 Enabled, K3 Active
    let second = manager.rotate_keys()?;
    assert_eq!(second.disabled, vec![k1.id]);
    assert!(matches!(
        manager.decrypt(&under_k1),
        Err(Error::KeyDisabled(id)) if id == k1.id
    ));
    assert_eq!(
        manager.decrypt(&under_k1).unwrap_err().to_string(),
        format!("Key is disabled: {}", k1.id)
    );
    assert_eq!(manager.decrypt(&p)?, b"written under k2");

    // K1 deleted on the following rotation
    let third = manager.rotate_keys()?;
    assert_eq!(third.deleted, vec![k1.id]);
    assert!(matches!(manager.get_key(k1.id), Err(Error::KeyNotFound(_))));
    assert!(matches!(manager.decrypt(&under_k1), Err(Error::KeyNotFound(_))));
    Ok(())
}

#[test]
fn exactly_one_active_key_at_every_step() -> Result<(), Error> {
    let dir = tempdir().unwrap();
    let manager = open_manager(&cheap_config(dir.path()));
    let mut last_version = 0;

    manager.create_key()?;
    for _ in 0..5 {
        let keys = manager.keys()?;
        let active: Vec<_> = keys.iter().filter(|k| k.status == KeyStatus::Active).collect();
        assert_eq!(active.len(), 1);
        assert!(active[0].version > last_version);
        last_version = active[0].version;

        let versions: HashSet<u32> = keys.iter().map(|k| k.version).collect();
        assert_eq!(versions.len(), keys.len());

        manager.rotate_keys()?;
    }
    assert!(matches!(manager.create_key(), Err(Error::ActiveKeyExists(_))));
    Ok(())
}

#[test]
fn historical_payloads_survive_restart() -> Result<(), Error> {
    let dir = tempdir().unwrap();
    let config = cheap_config(dir.path());

    let payloads = {
        let manager = open_manager(&config);
        let mut payloads = Vec::new();
        for i in 0..3 {
            payloads.push((i, manager.encrypt(format!("document {i}").as_bytes())?));
            manager.rotate_keys()?;
        }
        manager.shutdown();
        payloads
    };

    let manager = open_manager(&config);
    assert_eq!(manager.keys()?.len(), 4);
    for (i, payload) in &payloads {
        assert_eq!(manager.decrypt(payload)?, format!("document {i}").as_bytes());
    }
    assert_eq!(manager.rotate_keys()?.new_version, 5);
    Ok(())
}

#[test]
fn payload_sidecar_roundtrip_decrypts() -> Result<(), Error> {
    let dir = tempdir().unwrap();
    let manager = open_manager(&cheap_config(dir.path()));
    let payload = manager.encrypt(b"stored next to the document")?;

    let sidecar = payload.to_json()?;
    let restored = seal_keyring::EncryptedPayload::from_json(&sidecar)?;
    assert_eq!(manager.decrypt(&restored)?, b"stored next to the document");
    Ok(())
}

#[test]
fn after_retention_policy_keeps_disabled_keys_for_audit() -> Result<(), Error> {
    let dir = tempdir().unwrap();
    let mut config = cheap_config(dir.path());
    config.rotation.retention_period_days = 0;
    config.rotation.deletion = DeletionPolicy::AfterRetention;
    let manager = open_manager(&config);

    let k1 = manager.create_key()?;
    manager.rotate_keys()?;
    manager.rotate_keys()?;
    assert_eq!(manager.get_key(k1.id)?.status, KeyStatus::Disabled);

    // 保留期为 0 时，禁用后的下一次轮换即满足“完整保留期”
    let summary = manager.rotate_keys()?;
    assert_eq!(summary.deleted, vec![k1.id]);
    Ok(())
}

#[test]
fn key_store_contracts() -> Result<(), Error> {
    let dir = tempdir().unwrap();
    let config = cheap_config(dir.path());
    let store = FileKeyStore::open(
        config.storage.clone(),
        SecretBox::new(Box::from(common::STORAGE_SECRET)),
    )?;

    store.store("data-key", &[7u8; 32])?;
    assert_eq!(store.retrieve("data-key")?.expose_secret(), &[7u8; 32]);

    for round in 0..5u8 {
        store.store("data-key", &[round; 32])?;
        let expected = usize::from(round + 1).min(3);
        assert_eq!(store.backups("data-key")?.len(), expected);
    }

    assert!(matches!(
        store.store("short-key", &[1u8; 16]),
        Err(Error::Storage(StorageError::KeyTooShort { .. }))
    ));
    assert!(matches!(store.delete("never-stored"), Err(Error::NotFound(_))));

    let rotated = store.rotate("data-key")?;
    assert_eq!(store.retrieve("data-key")?.expose_secret(), rotated.expose_secret());

    store.delete("data-key")?;
    assert!(store.backups("data-key")?.is_empty());
    assert!(store.list()?.is_empty());
    Ok(())
}

#[test]
fn key_blobs_never_contain_plain_material() -> Result<(), Error> {
    let dir = tempdir().unwrap();
    let config = cheap_config(dir.path());
    let store = open_store(&config);
    store.store("plain-check", b"THIS-IS-A-RECOGNISABLE-KEY-32-BYTES!")?;

    let blob = fs::read_to_string(config.storage.storage_dir.join("plain-check.key")).unwrap();
    assert!(!blob.contains("RECOGNISABLE"));
    Ok(())
}

#[test]
fn manager_refuses_foreign_master_secret() -> Result<(), Error> {
    let dir = tempdir().unwrap();
    let config = cheap_config(dir.path());
    open_manager(&config).create_key()?;

    let other = KeyLifecycleManager::new(
        &config,
        SecretString::from(format!("{MASTER_SECRET}-other")),
        open_store(&config),
    )?;
    assert!(matches!(
        other.init(),
        Err(Error::Storage(StorageError::Corrupted(_)))
    ));
    Ok(())
}

#[test]
fn invalid_config_is_rejected_at_construction() {
    let dir = tempdir().unwrap();
    let mut config = cheap_config(dir.path());
    config.kdf.iterations = 0;
    let result = KeyLifecycleManager::new(
        &config,
        SecretString::from(MASTER_SECRET),
        open_store(&cheap_config(dir.path())),
    );
    assert!(matches!(result, Err(Error::Config(_))));
}
