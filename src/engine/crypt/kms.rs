// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Key management: the capability surface every KMS offers, the per-volume
//! `VolumeEncryption` that drives it, and the KMSs that ship with volguard.

use std::{
    collections::HashMap,
    fmt::Debug,
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
};

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use async_trait::async_trait;
use data_encoding::BASE64;
use rand::{rng, Rng};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use zeroize::Zeroizing;

use crate::{
    engine::{
        config::KmsDescription,
        context::Context,
        crypt::volume::DekStore,
        types::{SizedKeyMemory, VolumeId},
    },
    guard::{GuardError, GuardResult},
};

/// KMS id used when encryption is requested without naming a KMS.
pub const DEFAULT_KMS_ID: &str = "secrets-metadata";
/// Credential that holds the passphrase of the metadata KMS.
pub const DEFAULT_SECRET_KEY: &str = "encryptionPassphrase";

const NONCE_SIZE: usize = 12;

fn unsupported(kms_id: &str, capability: &str) -> GuardError {
    GuardError::UnsupportedKmsCapability {
        kms_id: kms_id.to_string(),
        capability: capability.to_string(),
    }
}

/// Capabilities of a key management service.
///
/// A KMS either keeps secrets itself (`store_secret`/`fetch_secret`) or
/// only wraps a DEK that some `DekStore` keeps (`encrypt_dek`/
/// `decrypt_dek`). The capability flags say which.
#[async_trait]
pub trait KeyManagement: Debug + Send + Sync {
    fn id(&self) -> &str;

    /// True if the DEK must be kept by a `DekStore` rather than the KMS.
    fn requires_dek_store(&self) -> bool;

    /// True if secrets can be read back directly, as file encryption needs.
    fn supports_direct_fetch(&self) -> bool;

    async fn store_secret(
        &self,
        _ctx: &Context,
        _volume_id: &VolumeId,
        _secret: &SizedKeyMemory,
    ) -> GuardResult<()> {
        Err(unsupported(self.id(), "store secret"))
    }

    async fn fetch_secret(&self, _ctx: &Context, _volume_id: &VolumeId) -> GuardResult<SizedKeyMemory> {
        Err(unsupported(self.id(), "fetch secret"))
    }

    async fn remove_secret(&self, _ctx: &Context, _volume_id: &VolumeId) -> GuardResult<()> {
        Err(unsupported(self.id(), "remove secret"))
    }

    async fn encrypt_dek(
        &self,
        _ctx: &Context,
        _volume_id: &VolumeId,
        _dek: &SizedKeyMemory,
    ) -> GuardResult<String> {
        Err(unsupported(self.id(), "encrypt DEK"))
    }

    async fn decrypt_dek(
        &self,
        _ctx: &Context,
        _volume_id: &VolumeId,
        _wrapped: &str,
    ) -> GuardResult<SizedKeyMemory> {
        Err(unsupported(self.id(), "decrypt DEK"))
    }
}

/// The passphrase handling of one volume: a KMS plus, when the KMS needs
/// one, the store that keeps the wrapped DEK.
#[derive(Clone, Debug)]
pub struct VolumeEncryption {
    kms: Arc<dyn KeyManagement>,
    dek_store: Option<Arc<dyn DekStore>>,
}

impl VolumeEncryption {
    /// Bind a KMS. `dek_store` is only kept if the KMS requires one, and is
    /// then mandatory.
    pub fn new(
        kms: Arc<dyn KeyManagement>,
        dek_store: Option<Arc<dyn DekStore>>,
    ) -> GuardResult<VolumeEncryption> {
        if kms.requires_dek_store() {
            match dek_store {
                Some(store) => Ok(VolumeEncryption {
                    kms,
                    dek_store: Some(store),
                }),
                None => Err(GuardError::InternalInvariantViolation(format!(
                    "KMS {} requires a DEK store but none was given",
                    kms.id()
                ))),
            }
        } else {
            Ok(VolumeEncryption {
                kms,
                dek_store: None,
            })
        }
    }

    pub fn kms(&self) -> &Arc<dyn KeyManagement> {
        &self.kms
    }

    pub fn kms_id(&self) -> &str {
        self.kms.id()
    }

    pub fn has_dek_store(&self) -> bool {
        self.dek_store.is_some()
    }

    fn dek_store(&self) -> GuardResult<&Arc<dyn DekStore>> {
        self.dek_store.as_ref().ok_or_else(|| {
            GuardError::InternalInvariantViolation(format!(
                "KMS {} requires a DEK store but none is configured",
                self.kms.id()
            ))
        })
    }

    /// A new random passphrase made from `size` random bytes.
    pub fn generate_passphrase(&self, size: usize) -> GuardResult<SizedKeyMemory> {
        SizedKeyMemory::generate(size)
    }

    /// Persist `passphrase` as the secret of `volume_id`.
    pub async fn store_passphrase(
        &self,
        ctx: &Context,
        volume_id: &VolumeId,
        passphrase: &SizedKeyMemory,
    ) -> GuardResult<()> {
        if self.kms.requires_dek_store() {
            let wrapped = self.kms.encrypt_dek(ctx, volume_id, passphrase).await?;
            self.dek_store()?.store_dek(ctx, volume_id, &wrapped).await
        } else {
            self.kms.store_secret(ctx, volume_id, passphrase).await
        }
    }

    /// Generate a passphrase, persist it for `volume_id`, and return it.
    pub async fn store_new_passphrase(
        &self,
        ctx: &Context,
        volume_id: &VolumeId,
        size: usize,
    ) -> GuardResult<SizedKeyMemory> {
        let passphrase = self.generate_passphrase(size)?;
        self.store_passphrase(ctx, volume_id, &passphrase).await?;
        Ok(passphrase)
    }

    pub async fn fetch_passphrase(
        &self,
        ctx: &Context,
        volume_id: &VolumeId,
    ) -> GuardResult<SizedKeyMemory> {
        if self.kms.requires_dek_store() {
            let wrapped = self.dek_store()?.fetch_dek(ctx, volume_id).await?;
            self.kms.decrypt_dek(ctx, volume_id, &wrapped).await
        } else {
            self.kms.fetch_secret(ctx, volume_id).await
        }
    }

    /// Forget the secret of `volume_id`, once the volume is going away.
    pub async fn remove_passphrase(&self, ctx: &Context, volume_id: &VolumeId) -> GuardResult<()> {
        if self.kms.requires_dek_store() {
            self.dek_store()?.remove_dek(ctx, volume_id).await
        } else {
            self.kms.remove_secret(ctx, volume_id).await
        }
    }
}

/// Wraps the DEK with a key derived from a passphrase handed over in the
/// request credentials. The wrapped DEK lives with the volume.
///
/// Wrapped form: base64 of a random 96 bit nonce followed by the AES-256-GCM
/// ciphertext. The key is SHA-256 over the passphrase and the volume id, so
/// the same DEK wraps differently for every volume.
#[derive(Debug)]
pub struct MetadataKms {
    id: String,
    passphrase: SizedKeyMemory,
}

impl MetadataKms {
    pub fn new(id: &str, passphrase: SizedKeyMemory) -> GuardResult<MetadataKms> {
        if passphrase.is_empty() {
            return Err(GuardError::Msg(format!(
                "KMS {id} requires a non-empty passphrase"
            )));
        }
        Ok(MetadataKms {
            id: id.to_string(),
            passphrase,
        })
    }

    /// Build from request credentials, reading the passphrase from
    /// `secret_key`.
    pub fn from_credentials(
        id: &str,
        secret_key: &str,
        credentials: &HashMap<String, String>,
    ) -> GuardResult<MetadataKms> {
        let passphrase = credentials.get(secret_key).ok_or_else(|| {
            GuardError::Msg(format!(
                "Credentials for KMS {id} do not contain {secret_key}"
            ))
        })?;
        MetadataKms::new(id, SizedKeyMemory::from(passphrase.as_str()))
    }

    fn cipher(&self, volume_id: &VolumeId) -> GuardResult<Aes256Gcm> {
        let mut hasher = Sha256::new();
        hasher.update(self.passphrase.as_ref());
        hasher.update(b":");
        hasher.update(volume_id.as_str().as_bytes());
        let key = Zeroizing::new(hasher.finalize().to_vec());
        Aes256Gcm::new_from_slice(&key)
            .map_err(|e| GuardError::Msg(format!("Failed to set up DEK cipher: {e}")))
    }
}

#[async_trait]
impl KeyManagement for MetadataKms {
    fn id(&self) -> &str {
        &self.id
    }

    fn requires_dek_store(&self) -> bool {
        true
    }

    fn supports_direct_fetch(&self) -> bool {
        false
    }

    async fn encrypt_dek(
        &self,
        _ctx: &Context,
        volume_id: &VolumeId,
        dek: &SizedKeyMemory,
    ) -> GuardResult<String> {
        let mut nonce = [0u8; NONCE_SIZE];
        rng().fill(&mut nonce[..]);
        let ciphertext = self
            .cipher(volume_id)?
            .encrypt(Nonce::from_slice(&nonce), dek.as_ref())
            .map_err(|e| GuardError::Msg(format!("Failed to wrap DEK of {volume_id}: {e}")))?;
        let mut blob = nonce.to_vec();
        blob.extend(ciphertext);
        Ok(BASE64.encode(&blob))
    }

    async fn decrypt_dek(
        &self,
        _ctx: &Context,
        volume_id: &VolumeId,
        wrapped: &str,
    ) -> GuardResult<SizedKeyMemory> {
        let blob = BASE64.decode(wrapped.trim().as_bytes())?;
        if blob.len() <= NONCE_SIZE {
            return Err(GuardError::Msg(format!(
                "Wrapped DEK of {volume_id} is too short"
            )));
        }
        let (nonce, ciphertext) = blob.split_at(NONCE_SIZE);
        let plain = self
            .cipher(volume_id)?
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| {
                GuardError::Msg(format!(
                    "Failed to unwrap DEK of {volume_id}; wrong passphrase? {e}"
                ))
            })?;
        Ok(SizedKeyMemory::new(plain))
    }
}

/// Keeps each volume's secret in its own file below a directory. Files are
/// replaced atomically and are only readable by the owner.
#[derive(Debug)]
pub struct IntegratedKms {
    id: String,
    dir: PathBuf,
}

impl IntegratedKms {
    pub fn new(id: &str, dir: &Path) -> IntegratedKms {
        IntegratedKms {
            id: id.to_string(),
            dir: dir.to_owned(),
        }
    }

    fn secret_path(&self, volume_id: &VolumeId) -> GuardResult<PathBuf> {
        let name = volume_id.as_str();
        if name.is_empty() || name.contains('/') || name.starts_with('.') {
            return Err(GuardError::Msg(format!(
                "Volume id {name:?} can not name a secret file"
            )));
        }
        Ok(self.dir.join(name))
    }
}

#[async_trait]
impl KeyManagement for IntegratedKms {
    fn id(&self) -> &str {
        &self.id
    }

    fn requires_dek_store(&self) -> bool {
        false
    }

    fn supports_direct_fetch(&self) -> bool {
        true
    }

    async fn store_secret(
        &self,
        ctx: &Context,
        volume_id: &VolumeId,
        secret: &SizedKeyMemory,
    ) -> GuardResult<()> {
        let path = self.secret_path(volume_id)?;
        let dir = self.dir.clone();
        let secret = secret.clone();
        // An abandoned write still either replaces the file whole or
        // leaves it untouched.
        ctx.run(async move {
            tokio::task::spawn_blocking(move || -> GuardResult<()> {
                std::fs::create_dir_all(&dir)?;
                let mut file = NamedTempFile::new_in(&dir)?;
                file.write_all(secret.as_ref())?;
                file.as_file().sync_all()?;
                file.persist(&path).map_err(|e| GuardError::Io(e.error))?;
                Ok(())
            })
            .await?
        })
        .await?;
        debug!("Stored secret of {volume_id} in KMS {}", self.id);
        Ok(())
    }

    async fn fetch_secret(&self, ctx: &Context, volume_id: &VolumeId) -> GuardResult<SizedKeyMemory> {
        let path = self.secret_path(volume_id)?;
        let data = chain_err!(
            ctx.run(async { tokio::fs::read(&path).await.map_err(GuardError::from) })
                .await,
            "Failed to read secret of {} from KMS {}",
            volume_id,
            self.id
        )?;
        Ok(SizedKeyMemory::new(data))
    }

    async fn remove_secret(&self, ctx: &Context, volume_id: &VolumeId) -> GuardResult<()> {
        let path = self.secret_path(volume_id)?;
        ctx.run(async {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            }
        })
        .await?;
        debug!("Removed secret of {volume_id} from KMS {}", self.id);
        Ok(())
    }
}

/// Resolves KMS ids to clients using the configured descriptions.
#[derive(Clone, Debug, Default)]
pub struct KmsRegistry {
    descriptions: HashMap<String, KmsDescription>,
}

impl KmsRegistry {
    pub fn new(descriptions: HashMap<String, KmsDescription>) -> KmsRegistry {
        KmsRegistry { descriptions }
    }

    /// Construct the client for `kms_id`. The default metadata KMS is
    /// available even if it is not configured.
    pub fn resolve(
        &self,
        kms_id: &str,
        credentials: &HashMap<String, String>,
    ) -> GuardResult<Arc<dyn KeyManagement>> {
        match self.descriptions.get(kms_id) {
            Some(KmsDescription::Metadata { secret_key }) => Ok(Arc::new(
                MetadataKms::from_credentials(kms_id, secret_key, credentials)?,
            )),
            Some(KmsDescription::Integrated { secrets_dir }) => {
                Ok(Arc::new(IntegratedKms::new(kms_id, secrets_dir)))
            }
            None if kms_id == DEFAULT_KMS_ID => Ok(Arc::new(MetadataKms::from_credentials(
                kms_id,
                DEFAULT_SECRET_KEY,
                credentials,
            )?)),
            None => Err(GuardError::Msg(format!(
                "No configuration for KMS {kms_id}"
            ))),
        }
    }
}
