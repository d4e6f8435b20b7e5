// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{collections::HashMap, sync::Arc, time::Duration};

use assert_matches::assert_matches;

use common::init_logger;

use volguard::{
    engine::{
        configure_binding,
        crypt::{
            DekStore, MetadataDekStore, MetadataKms, DEFAULT_SECRET_KEY, OPTION_ENCRYPTED,
            OPTION_ENCRYPTION_TYPE,
        },
        sim::{SimDeviceLocator, SimKms, SimLockService, SimLuks, SimVolume},
        Context, CryptConfig, EncryptedVolume, EncryptionBinding, EncryptionState,
        EncryptionType, KeyRotation, KmsRegistry, SizedKeyMemory, VolumeEncryption,
        VolumeId, VolumeMetadata,
    },
    guard::GuardError,
};

mod common;

fn config() -> CryptConfig {
    CryptConfig {
        device_discovery_interval_ms: 1,
        lock_acquire_timeout_secs: 1,
        ..Default::default()
    }
}

fn options(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

struct Cluster {
    luks: Arc<SimLuks>,
    locks: Arc<SimLockService>,
    locator: Arc<SimDeviceLocator>,
    kms: Arc<SimKms>,
}

impl Cluster {
    fn new() -> Cluster {
        Cluster {
            luks: Arc::new(SimLuks::default()),
            locks: Arc::new(SimLockService::default()),
            locator: Arc::new(SimDeviceLocator::default()),
            kms: Arc::new(SimKms::new("sim")),
        }
    }

    fn rotation(&self) -> KeyRotation {
        KeyRotation::new(
            self.luks.clone(),
            self.locks.clone(),
            self.locator.clone(),
            &config(),
        )
    }

    /// Create, encrypt and map a volume whose passphrase lives in the sim KMS.
    async fn encrypted_volume(&self, id: &str, device: &str) -> EncryptedVolume {
        let ctx = Context::background();
        let sim_volume = Arc::new(SimVolume::new(id));
        self.locator.map_after(sim_volume.image_spec(), device, 1);
        let volume = EncryptedVolume::with_binding(
            sim_volume,
            EncryptionBinding::Block(VolumeEncryption::new(self.kms.clone(), None).unwrap()),
            &config(),
        );
        self.luks.attach(device);
        volume.prepare(&ctx).await.unwrap();
        volume
            .encrypt_device(&ctx, self.luks.as_ref(), device)
            .await
            .unwrap();
        volume
    }
}

#[tokio::test]
// Two rotations in a row each leave exactly one working passphrase.
async fn test_rotate_twice() {
    init_logger();
    let cluster = Cluster::new();
    let volume = cluster.encrypted_volume("vol-a", "/dev/rbd0").await;
    let rotation = cluster.rotation();
    let ctx = Context::background();
    let id = VolumeId::from("vol-a");

    let first = cluster.kms.secret(&id).unwrap();
    rotation.rotate(&ctx, &volume).await.unwrap();
    let second = cluster.kms.secret(&id).unwrap();
    rotation.rotate(&ctx, &volume).await.unwrap();
    let third = cluster.kms.secret(&id).unwrap();

    assert_ne!(first, second);
    assert_ne!(second, third);
    assert!(cluster.luks.opens("/dev/rbd0", &third));
    assert!(!cluster.luks.opens("/dev/rbd0", &second));
    assert_eq!(cluster.luks.slots("/dev/rbd0"), vec![0]);
}

#[tokio::test]
// Rotations of the same volume are serialized; different volumes are not
// held up by each other.
async fn test_concurrent_rotations() {
    init_logger();
    let cluster = Arc::new(Cluster::new());
    cluster.luks.set_delay(Duration::from_millis(10));
    let a = Arc::new(cluster.encrypted_volume("vol-a", "/dev/rbd0").await);
    let b = Arc::new(cluster.encrypted_volume("vol-b", "/dev/rbd1").await);
    let rotation = Arc::new(cluster.rotation());

    let tasks: Vec<_> = [a.clone(), a.clone(), b.clone()]
        .into_iter()
        .map(|volume| {
            let rotation = Arc::clone(&rotation);
            tokio::spawn(async move { rotation.rotate(&Context::background(), &volume).await })
        })
        .collect();
    let mut results = Vec::new();
    for task in tasks {
        results.push(task.await.unwrap());
    }

    // The second rotation of vol-a either waited for the first or timed
    // out waiting; it never ran alongside it.
    assert!(results[2].is_ok());
    for result in &results[..2] {
        if let Err(err) = result {
            assert_matches!(err, GuardError::LockUnavailable { .. });
        }
    }
    assert!(results[..2].iter().any(|r| r.is_ok()));
    for (id, device) in [("vol-a", "/dev/rbd0"), ("vol-b", "/dev/rbd1")] {
        let current = cluster.kms.secret(&VolumeId::from(id)).unwrap();
        assert!(cluster.luks.opens(device, &current));
        assert_eq!(cluster.luks.slots(device), vec![0]);
    }
    assert!(!cluster.locks.is_held("vol-a-mutexlock"));
}

#[tokio::test]
// A KMS outage after the new key is installed leaves the volume openable
// with the old passphrase through the backup slot.
async fn test_rotate_kms_outage() {
    init_logger();
    let cluster = Cluster::new();
    let volume = cluster.encrypted_volume("vol-a", "/dev/rbd0").await;
    let id = VolumeId::from("vol-a");
    let old = cluster.kms.secret(&id).unwrap();
    cluster.kms.fail_stores(true);

    let err = cluster
        .rotation()
        .rotate(&Context::background(), &volume)
        .await
        .unwrap_err();
    assert_matches!(err, GuardError::Chained(..));
    assert_eq!(cluster.kms.secret(&id), Some(old.clone()));
    assert!(cluster.luks.opens("/dev/rbd0", &old));
    assert!(!cluster.locks.is_held("vol-a-mutexlock"));
}

#[tokio::test]
// Provisioning options select a binding; the metadata KMS wraps the DEK in
// the volume's own metadata.
async fn test_configure_and_prepare() {
    init_logger();
    let ctx = Context::background();
    let volume = Arc::new(SimVolume::new("vol-a"));
    let registry = KmsRegistry::default();
    let credentials = options(&[(DEFAULT_SECRET_KEY, "cluster-secret")]);

    let plain = configure_binding(
        volume.clone(),
        &options(&[]),
        &credentials,
        &registry,
        &config(),
    )
    .unwrap();
    assert_matches!(plain.binding(), EncryptionBinding::None);

    let encrypted = configure_binding(
        volume.clone(),
        &options(&[(OPTION_ENCRYPTED, "true")]),
        &credentials,
        &registry,
        &config(),
    )
    .unwrap();
    assert_eq!(encrypted.binding().encryption_type(), EncryptionType::Block);
    assert_eq!(
        encrypted.check_state(&ctx).await.unwrap(),
        EncryptionState::Unknown
    );
    encrypted.prepare(&ctx).await.unwrap();
    assert_eq!(
        encrypted.check_state(&ctx).await.unwrap(),
        EncryptionState::Prepared
    );
    assert!(volume.metadata("rbd.csi.ceph.com/dek").is_some());

    assert_matches!(
        configure_binding(
            volume,
            &options(&[(OPTION_ENCRYPTED, "true"), (OPTION_ENCRYPTION_TYPE, "disk")]),
            &credentials,
            &registry,
            &config(),
        ),
        Err(GuardError::Msg(_))
    );
}

#[tokio::test]
// A clone gets the source's KMS and the same plaintext, wrapped for its
// own identity.
async fn test_copy_binding_to_clone() {
    init_logger();
    let ctx = Context::background();
    let kms = Arc::new(MetadataKms::new("secrets-metadata", SizedKeyMemory::from("pw")).unwrap());
    let source_volume = Arc::new(SimVolume::new("vol-src"));
    let clone_volume = Arc::new(SimVolume::new("vol-clone"));

    let store: Arc<dyn DekStore> = Arc::new(MetadataDekStore::new(source_volume.clone(), &config()));
    let source = EncryptedVolume::with_binding(
        source_volume.clone(),
        EncryptionBinding::Block(VolumeEncryption::new(kms, Some(store)).unwrap()),
        &config(),
    );
    source.prepare(&ctx).await.unwrap();

    let mut clone = EncryptedVolume::unbound(clone_volume.clone(), &config());
    source.copy_binding(&ctx, &mut clone, false).await.unwrap();

    let (src_enc, clone_enc) = match (source.binding(), clone.binding()) {
        (EncryptionBinding::Block(s), EncryptionBinding::Block(c)) => (s, c),
        other => panic!("unexpected bindings {other:?}"),
    };
    assert_eq!(src_enc.kms_id(), clone_enc.kms_id());
    assert_eq!(
        src_enc
            .fetch_passphrase(&ctx, &VolumeId::from("vol-src"))
            .await
            .unwrap(),
        clone_enc
            .fetch_passphrase(&ctx, &VolumeId::from("vol-clone"))
            .await
            .unwrap()
    );
    assert_ne!(
        source_volume.metadata("rbd.csi.ceph.com/dek"),
        clone_volume.metadata("rbd.csi.ceph.com/dek")
    );
    assert_eq!(
        clone.check_state(&ctx).await.unwrap(),
        EncryptionState::Prepared
    );

    let mut itself = EncryptedVolume::unbound(source_volume, &config());
    assert_matches!(
        source.copy_binding(&ctx, &mut itself, false).await,
        Err(GuardError::InternalInvariantViolation(_))
    );
}
