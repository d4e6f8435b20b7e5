// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{collections::HashMap, sync::Arc};

use crate::{
    engine::{
        config::CryptConfig,
        context::Context,
        crypt::{
            kms::{KeyManagement, KmsRegistry, VolumeEncryption, DEFAULT_KMS_ID},
            luks::LuksWrapper,
            state::{check_state, set_state},
            volume::{DekStore, MetadataDekStore, VolumeMetadata},
        },
        types::{EncryptionState, EncryptionType, MappingCreateAction, VolumeId},
    },
    guard::{GuardError, GuardResult},
};

pub const OPTION_ENCRYPTED: &str = "encrypted";
pub const OPTION_KMS_ID: &str = "encryptionKMSID";
pub const OPTION_ENCRYPTION_TYPE: &str = "encryptionType";

/// Prefix of the device mapper name an encrypted volume is opened as.
const MAPPER_PREFIX: &str = "luks-rbd-";

/// Accepts the boolean spellings provisioning parameters use.
fn parse_bool(value: &str) -> GuardResult<bool> {
    match value {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Ok(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Ok(false),
        _ => Err(GuardError::Msg(format!(
            "Option {OPTION_ENCRYPTED} must be a boolean, not {value:?}"
        ))),
    }
}

/// Read the encryption request out of volume options: the KMS id and the
/// kind of encryption. `fallback` applies when encryption is requested
/// without a type.
pub fn parse_encryption_options(
    options: &HashMap<String, String>,
    fallback: EncryptionType,
) -> GuardResult<(String, EncryptionType)> {
    let encrypted = match options.get(OPTION_ENCRYPTED) {
        Some(value) => parse_bool(value.trim())?,
        None => false,
    };
    if !encrypted {
        return Ok((String::new(), EncryptionType::None));
    }

    let kms_id = match options.get(OPTION_KMS_ID).map(|s| s.trim()) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => DEFAULT_KMS_ID.to_string(),
    };
    let encryption_type = match options.get(OPTION_ENCRYPTION_TYPE).map(|s| s.trim()) {
        Some(t) if !t.is_empty() => match t.parse::<EncryptionType>() {
            Ok(EncryptionType::None) | Err(_) => {
                return Err(GuardError::Msg(format!("Invalid encryption type {t:?}")))
            }
            Ok(t) => t,
        },
        _ => fallback,
    };
    Ok((kms_id, encryption_type))
}

/// How a volume is encrypted. Chosen once when the volume is configured.
#[derive(Clone, Debug)]
pub enum EncryptionBinding {
    None,
    /// LUKS on the block device.
    Block(VolumeEncryption),
    /// Filesystem-level encryption, which reads secrets straight from the
    /// KMS.
    File(VolumeEncryption),
}

impl EncryptionBinding {
    pub fn encryption_type(&self) -> EncryptionType {
        match self {
            EncryptionBinding::None => EncryptionType::None,
            EncryptionBinding::Block(_) => EncryptionType::Block,
            EncryptionBinding::File(_) => EncryptionType::File,
        }
    }

    pub fn is_encrypted(&self) -> bool {
        !matches!(self, EncryptionBinding::None)
    }
}

/// A volume together with the encryption it is bound to.
#[derive(Clone, Debug)]
pub struct EncryptedVolume {
    volume: Arc<dyn VolumeMetadata>,
    binding: EncryptionBinding,
    config: CryptConfig,
}

impl EncryptedVolume {
    /// A volume that is not encrypted.
    pub fn unbound(volume: Arc<dyn VolumeMetadata>, config: &CryptConfig) -> EncryptedVolume {
        EncryptedVolume {
            volume,
            binding: EncryptionBinding::None,
            config: config.clone(),
        }
    }

    pub fn with_binding(
        volume: Arc<dyn VolumeMetadata>,
        binding: EncryptionBinding,
        config: &CryptConfig,
    ) -> EncryptedVolume {
        EncryptedVolume {
            volume,
            binding,
            config: config.clone(),
        }
    }

    /// Resolve the encryption requested in `options` for `volume`. A KMS
    /// that cannot keep secrets gets the volume's own metadata as its DEK
    /// store. File encryption refuses such a KMS unless it can also hand
    /// secrets back directly.
    pub fn configure(
        volume: Arc<dyn VolumeMetadata>,
        options: &HashMap<String, String>,
        credentials: &HashMap<String, String>,
        registry: &KmsRegistry,
        config: &CryptConfig,
    ) -> GuardResult<EncryptedVolume> {
        let (kms_id, encryption_type) = parse_encryption_options(options, EncryptionType::Block)?;
        let binding = match encryption_type {
            EncryptionType::None => EncryptionBinding::None,
            EncryptionType::Block => {
                let kms = registry.resolve(&kms_id, credentials)?;
                EncryptionBinding::Block(bind_kms(kms, &volume, config)?)
            }
            EncryptionType::File => {
                let kms = registry.resolve(&kms_id, credentials)?;
                EncryptionBinding::File(bind_file_kms(kms, &volume, config)?)
            }
        };
        debug!(
            "Volume {} uses {} encryption",
            volume.volume_id(),
            binding.encryption_type()
        );
        Ok(EncryptedVolume {
            volume,
            binding,
            config: config.clone(),
        })
    }

    pub fn volume(&self) -> &Arc<dyn VolumeMetadata> {
        &self.volume
    }

    pub fn volume_id(&self) -> &VolumeId {
        self.volume.volume_id()
    }

    pub fn binding(&self) -> &EncryptionBinding {
        &self.binding
    }

    pub fn config(&self) -> &CryptConfig {
        &self.config
    }

    pub async fn check_state(&self, ctx: &Context) -> GuardResult<EncryptionState> {
        check_state(ctx, self.volume.as_ref(), &self.config).await
    }

    pub async fn set_state(
        &self,
        ctx: &Context,
        state: EncryptionState,
    ) -> GuardResult<MappingCreateAction<EncryptionState>> {
        set_state(ctx, self.volume.as_ref(), &self.config, state).await
    }

    fn block_encryption(&self, operation: &str) -> GuardResult<&VolumeEncryption> {
        match &self.binding {
            EncryptionBinding::Block(enc) => Ok(enc),
            _ => Err(GuardError::UnsupportedOperation(format!(
                "{operation} requires block encryption, volume {} has {}",
                self.volume_id(),
                self.binding.encryption_type()
            ))),
        }
    }

    /// Generate the volume's passphrase, store it, and record the volume
    /// as `Prepared`. Runs before the device is formatted.
    pub async fn prepare(&self, ctx: &Context) -> GuardResult<()> {
        let enc = match &self.binding {
            EncryptionBinding::Block(enc) => enc,
            _ => {
                return Err(GuardError::UnsupportedOperation(format!(
                    "volume {} is not configured for block encryption",
                    self.volume_id()
                )))
            }
        };
        log_on_failure!(
            enc.store_new_passphrase(ctx, self.volume_id(), self.config.passphrase_size)
                .await,
            "Failed to save encryption passphrase for volume {}",
            self.volume_id()
        );
        log_on_failure!(
            self.set_state(ctx, EncryptionState::Prepared).await,
            "Failed to save encryption state of volume {}",
            self.volume_id()
        );
        Ok(())
    }

    /// Make `dest` use the same secret as this volume. Unless
    /// `copy_only_passphrase` is set, `dest` also takes over this volume's
    /// KMS, bound to its own storage. The plaintext passphrase is stored
    /// again under `dest`'s identity, so nothing stored for this volume is
    /// shared. The encryption state is copied last.
    pub async fn copy_binding(
        &self,
        ctx: &Context,
        dest: &mut EncryptedVolume,
        copy_only_passphrase: bool,
    ) -> GuardResult<()> {
        if !self.binding.is_encrypted() {
            return Ok(());
        }
        if self.volume_id() == dest.volume_id() {
            return Err(GuardError::InternalInvariantViolation(format!(
                "source {} and destination {} have the same volume id {}",
                self.volume.image_spec(),
                dest.volume.image_spec(),
                self.volume_id()
            )));
        }

        match &self.binding {
            EncryptionBinding::Block(enc) => {
                let passphrase = chain_err!(
                    enc.fetch_passphrase(ctx, self.volume_id()).await,
                    "Failed to fetch passphrase of volume {}",
                    self.volume_id()
                )?;
                if !copy_only_passphrase {
                    dest.binding =
                        EncryptionBinding::Block(bind_kms(enc.kms().clone(), &dest.volume, &dest.config)?);
                }
                let dest_enc = dest.block_encryption("Copying a passphrase")?;
                chain_err!(
                    dest_enc
                        .store_passphrase(ctx, dest.volume_id(), &passphrase)
                        .await,
                    "Failed to store passphrase for volume {}",
                    dest.volume_id()
                )?;
            }
            EncryptionBinding::File(enc) => {
                if !copy_only_passphrase {
                    dest.binding = EncryptionBinding::File(bind_file_kms(
                        enc.kms().clone(),
                        &dest.volume,
                        &dest.config,
                    )?);
                }
                // A KMS that keeps secrets itself holds one per volume;
                // with a DEK store the DEK travels with the volume data.
                if !enc.kms().requires_dek_store() {
                    let passphrase = chain_err!(
                        enc.fetch_passphrase(ctx, self.volume_id()).await,
                        "Failed to fetch passphrase of volume {}",
                        self.volume_id()
                    )?;
                    let dest_enc = match &dest.binding {
                        EncryptionBinding::File(dest_enc) => dest_enc,
                        _ => {
                            return Err(GuardError::InternalInvariantViolation(format!(
                                "destination {} is not configured for file encryption",
                                dest.volume_id()
                            )))
                        }
                    };
                    chain_err!(
                        dest_enc
                            .store_passphrase(ctx, dest.volume_id(), &passphrase)
                            .await,
                        "Failed to store passphrase for volume {}",
                        dest.volume_id()
                    )?;
                }
            }
            EncryptionBinding::None => (),
        }

        let state = chain_err!(
            self.check_state(ctx).await,
            "Failed to get encryption state of volume {}",
            self.volume_id()
        )?;
        chain_err!(
            dest.set_state(ctx, state).await,
            "Failed to store encryption state of volume {}",
            dest.volume_id()
        )?;
        Ok(())
    }

    /// Give `dest` this volume's encryption if it has none. A destination
    /// that is already bound is left alone. An unbound destination has no
    /// KMS to receive a passphrase alone, so the whole binding is copied.
    pub async fn repair_binding(&self, ctx: &Context, dest: &mut EncryptedVolume) -> GuardResult<()> {
        if !self.binding.is_encrypted() || dest.binding.is_encrypted() {
            return Ok(());
        }
        info!(
            "Volume {} is missing the encryption of {}; copying it",
            dest.volume_id(),
            self.volume_id()
        );
        self.copy_binding(ctx, dest, false).await
    }

    /// Forget the volume's secret when the volume is deleted. Volumes that
    /// are not encrypted have nothing to forget.
    pub async fn remove_encryption(&self, ctx: &Context) -> GuardResult<()> {
        let enc = match &self.binding {
            EncryptionBinding::Block(enc) | EncryptionBinding::File(enc) => enc,
            EncryptionBinding::None => return Ok(()),
        };
        chain_err!(
            enc.remove_passphrase(ctx, self.volume_id()).await,
            "Failed to remove passphrase of volume {} from KMS {}",
            self.volume_id(),
            enc.kms_id()
        )?;
        info!("Removed passphrase of volume {}", self.volume_id());
        Ok(())
    }

    /// Format `device` with the volume's passphrase and record the volume
    /// as `Encrypted`.
    pub async fn encrypt_device(
        &self,
        ctx: &Context,
        luks: &dyn LuksWrapper,
        device: &str,
    ) -> GuardResult<()> {
        let enc = self.block_encryption("Encrypting a device")?;
        let passphrase = log_on_failure!(
            enc.fetch_passphrase(ctx, self.volume_id()).await,
            "Failed to get passphrase of volume {}",
            self.volume_id()
        );
        let luks_ctx = ctx.with_timeout(self.config.luks_timeout());
        chain_err!(
            luks.format(&luks_ctx, device, &passphrase).await,
            "Failed to encrypt volume {}",
            self.volume_id()
        )?;
        log_on_failure!(
            self.set_state(ctx, EncryptionState::Encrypted).await,
            "Failed to record volume {} as encrypted",
            self.volume_id()
        );
        Ok(())
    }

    /// Name of the device mapper target the volume is opened as.
    pub fn mapper_name(&self) -> String {
        format!("{MAPPER_PREFIX}{}", self.volume_id())
    }

    /// Unlock `device` and return the path of the unlocked device. An
    /// already unlocked device is returned as is.
    pub async fn open_device(
        &self,
        ctx: &Context,
        luks: &dyn LuksWrapper,
        device: &str,
    ) -> GuardResult<String> {
        let enc = self.block_encryption("Opening a device")?;
        let mapper = self.mapper_name();
        let mapper_path = format!("/dev/mapper/{mapper}");
        let luks_ctx = ctx.with_timeout(self.config.luks_timeout());

        if luks.is_open(&luks_ctx, &mapper).await? {
            debug!("Encrypted device is already open at {mapper_path}");
            return Ok(mapper_path);
        }
        let passphrase = log_on_failure!(
            enc.fetch_passphrase(ctx, self.volume_id()).await,
            "Failed to get passphrase for encrypted device {}",
            device
        );
        log_on_failure!(
            luks.open(&luks_ctx, device, &mapper, &passphrase).await,
            "Failed to open device of volume {}",
            self.volume_id()
        );
        Ok(mapper_path)
    }
}

/// Configure the encryption of `volume` from its provisioning options.
pub fn configure_binding(
    volume: Arc<dyn VolumeMetadata>,
    options: &HashMap<String, String>,
    credentials: &HashMap<String, String>,
    registry: &KmsRegistry,
    config: &CryptConfig,
) -> GuardResult<EncryptedVolume> {
    EncryptedVolume::configure(volume, options, credentials, registry, config)
}

/// Bind `kms` to `volume`, giving it the volume's metadata as DEK store if
/// it needs one.
fn bind_kms(
    kms: Arc<dyn KeyManagement>,
    volume: &Arc<dyn VolumeMetadata>,
    config: &CryptConfig,
) -> GuardResult<VolumeEncryption> {
    let store = if kms.requires_dek_store() {
        let store: Arc<dyn DekStore> = Arc::new(MetadataDekStore::new(Arc::clone(volume), config));
        Some(store)
    } else {
        None
    };
    VolumeEncryption::new(kms, store)
}

fn bind_file_kms(
    kms: Arc<dyn KeyManagement>,
    volume: &Arc<dyn VolumeMetadata>,
    config: &CryptConfig,
) -> GuardResult<VolumeEncryption> {
    if kms.requires_dek_store() && !kms.supports_direct_fetch() {
        return Err(GuardError::UnsupportedKmsCapability {
            kms_id: kms.id().to_string(),
            capability: "direct secret retrieval for file encryption".to_string(),
        });
    }
    bind_kms(kms, volume, config)
}

#[cfg(test)]
mod tests {
    use crate::engine::{
        crypt::kms::{MetadataKms, DEFAULT_SECRET_KEY},
        sim::{SimKms, SimLuks, SimVolume},
        types::SizedKeyMemory,
    };

    use super::*;

    fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_encryption_options() {
        assert_eq!(
            parse_encryption_options(&map(&[]), EncryptionType::Block).unwrap(),
            (String::new(), EncryptionType::None)
        );
        assert_eq!(
            parse_encryption_options(&map(&[("encrypted", "false")]), EncryptionType::Block)
                .unwrap()
                .1,
            EncryptionType::None
        );
        assert_eq!(
            parse_encryption_options(&map(&[("encrypted", "true")]), EncryptionType::Block)
                .unwrap(),
            (DEFAULT_KMS_ID.to_string(), EncryptionType::Block)
        );
        assert_eq!(
            parse_encryption_options(
                &map(&[
                    ("encrypted", "True"),
                    ("encryptionKMSID", "vault"),
                    ("encryptionType", "file")
                ]),
                EncryptionType::Block
            )
            .unwrap(),
            ("vault".to_string(), EncryptionType::File)
        );
        assert_matches!(
            parse_encryption_options(&map(&[("encrypted", "yes")]), EncryptionType::Block),
            Err(GuardError::Msg(_))
        );
        assert_matches!(
            parse_encryption_options(
                &map(&[("encrypted", "true"), ("encryptionType", "tape")]),
                EncryptionType::Block
            ),
            Err(GuardError::Msg(_))
        );
    }

    #[test]
    fn test_configure_binding() {
        let registry = KmsRegistry::default();
        let creds = map(&[(DEFAULT_SECRET_KEY, "pw")]);
        let config = CryptConfig::default();

        let none = configure_binding(
            Arc::new(SimVolume::new("vol-1")),
            &map(&[]),
            &creds,
            &registry,
            &config,
        )
        .unwrap();
        assert_matches!(none.binding(), EncryptionBinding::None);

        let block = EncryptedVolume::configure(
            Arc::new(SimVolume::new("vol-1")),
            &map(&[("encrypted", "true")]),
            &creds,
            &registry,
            &config,
        )
        .unwrap();
        assert_matches!(block.binding(), EncryptionBinding::Block(enc) if enc.has_dek_store());

        assert_matches!(
            EncryptedVolume::configure(
                Arc::new(SimVolume::new("vol-1")),
                &map(&[("encrypted", "true"), ("encryptionType", "file")]),
                &creds,
                &registry,
                &config,
            ),
            Err(GuardError::UnsupportedKmsCapability { .. })
        );
    }

    #[tokio::test]
    async fn test_prepare_encrypt_open() {
        let ctx = Context::background();
        let config = CryptConfig::default();
        let kms = Arc::new(SimKms::new("sim"));
        let volume = EncryptedVolume::with_binding(
            Arc::new(SimVolume::new("vol-1")),
            EncryptionBinding::Block(VolumeEncryption::new(kms.clone(), None).unwrap()),
            &config,
        );
        let luks = SimLuks::default();
        luks.attach("/dev/rbd0");

        volume.prepare(&ctx).await.unwrap();
        assert_eq!(
            volume.check_state(&ctx).await.unwrap(),
            EncryptionState::Prepared
        );
        let passphrase = kms.secret(&VolumeId::from("vol-1")).unwrap();

        volume.encrypt_device(&ctx, &luks, "/dev/rbd0").await.unwrap();
        assert_eq!(
            volume.check_state(&ctx).await.unwrap(),
            EncryptionState::Encrypted
        );
        assert!(luks.opens("/dev/rbd0", &passphrase));

        let path = volume.open_device(&ctx, &luks, "/dev/rbd0").await.unwrap();
        assert_eq!(path, "/dev/mapper/luks-rbd-vol-1");
        assert_eq!(
            volume.open_device(&ctx, &luks, "/dev/rbd0").await.unwrap(),
            path
        );
    }

    #[tokio::test]
    async fn test_copy_binding_rejects_same_volume() {
        let ctx = Context::background();
        let config = CryptConfig::default();
        let kms = Arc::new(SimKms::new("sim"));
        let source = EncryptedVolume::with_binding(
            Arc::new(SimVolume::new("vol-1")),
            EncryptionBinding::Block(VolumeEncryption::new(kms, None).unwrap()),
            &config,
        );
        let mut dest = EncryptedVolume::unbound(Arc::new(SimVolume::new("vol-1")), &config);
        assert_matches!(
            source.copy_binding(&ctx, &mut dest, false).await,
            Err(GuardError::InternalInvariantViolation(_))
        );

        let plain = EncryptedVolume::unbound(Arc::new(SimVolume::new("vol-1")), &config);
        assert_matches!(plain.copy_binding(&ctx, &mut dest, false).await, Ok(()));
    }

    #[tokio::test]
    async fn test_unencrypted_volume_operations() {
        let ctx = Context::background();
        let volume = EncryptedVolume::unbound(Arc::new(SimVolume::new("vol-1")), &CryptConfig::default());
        let luks = SimLuks::default();
        assert_matches!(
            volume.prepare(&ctx).await,
            Err(GuardError::UnsupportedOperation(_))
        );
        assert_matches!(
            volume.open_device(&ctx, &luks, "/dev/rbd0").await,
            Err(GuardError::UnsupportedOperation(_))
        );
    }

    fn metadata_encrypted(volume: &Arc<SimVolume>, config: &CryptConfig) -> EncryptedVolume {
        let kms = Arc::new(MetadataKms::new("secrets-metadata", SizedKeyMemory::from("pw")).unwrap());
        let volume: Arc<dyn VolumeMetadata> = volume.clone();
        EncryptedVolume::with_binding(
            Arc::clone(&volume),
            EncryptionBinding::Block(bind_kms(kms, &volume, config).unwrap()),
            config,
        )
    }

    #[tokio::test]
    /// A clone whose encryption state was copied but whose binding and DEK
    /// were lost gets both back from its source.
    async fn test_repair_half_copied_binding() {
        let ctx = Context::background();
        let config = CryptConfig::default();
        let source_volume = Arc::new(SimVolume::new("vol-src"));
        let source = metadata_encrypted(&source_volume, &config);
        source.prepare(&ctx).await.unwrap();

        let clone_volume = Arc::new(SimVolume::new("vol-clone"));
        let mut clone = EncryptedVolume::unbound(clone_volume.clone(), &config);
        clone.set_state(&ctx, EncryptionState::Prepared).await.unwrap();
        assert!(clone_volume.metadata(&config.dek_key).is_none());

        // The destination is unbound, so copying only the passphrase would
        // have no binding to store it with; the full binding is copied.
        source.repair_binding(&ctx, &mut clone).await.unwrap();

        let clone_enc = clone.block_encryption("Checking a repair").unwrap();
        assert_eq!(clone_enc.kms_id(), "secrets-metadata");
        assert!(clone_volume.metadata(&config.dek_key).is_some());
        assert_eq!(
            clone_enc
                .fetch_passphrase(&ctx, &VolumeId::from("vol-clone"))
                .await
                .unwrap(),
            source
                .block_encryption("Checking a repair")
                .unwrap()
                .fetch_passphrase(&ctx, &VolumeId::from("vol-src"))
                .await
                .unwrap()
        );
        assert_eq!(
            clone.check_state(&ctx).await.unwrap(),
            EncryptionState::Prepared
        );
    }

    #[tokio::test]
    /// A bound destination and an unencrypted source both leave the
    /// destination as it is.
    async fn test_repair_binding_noop() {
        let ctx = Context::background();
        let config = CryptConfig::default();
        let source = metadata_encrypted(&Arc::new(SimVolume::new("vol-src")), &config);
        source.prepare(&ctx).await.unwrap();

        let mut bound = EncryptedVolume::with_binding(
            Arc::new(SimVolume::new("vol-clone")),
            EncryptionBinding::Block(VolumeEncryption::new(Arc::new(SimKms::new("sim")), None).unwrap()),
            &config,
        );
        source.repair_binding(&ctx, &mut bound).await.unwrap();
        assert_matches!(bound.binding(), EncryptionBinding::Block(enc) if enc.kms_id() == "sim");
        assert_eq!(
            bound.check_state(&ctx).await.unwrap(),
            EncryptionState::Unknown
        );

        let plain = EncryptedVolume::unbound(Arc::new(SimVolume::new("vol-plain")), &config);
        let mut dest = EncryptedVolume::unbound(Arc::new(SimVolume::new("vol-dest")), &config);
        plain.repair_binding(&ctx, &mut dest).await.unwrap();
        assert_matches!(dest.binding(), EncryptionBinding::None);
    }

    #[tokio::test]
    async fn test_remove_encryption() {
        let ctx = Context::background();
        let config = CryptConfig::default();
        let kms = Arc::new(SimKms::new("sim"));
        let volume = EncryptedVolume::with_binding(
            Arc::new(SimVolume::new("vol-1")),
            EncryptionBinding::Block(VolumeEncryption::new(kms.clone(), None).unwrap()),
            &config,
        );
        volume.prepare(&ctx).await.unwrap();
        assert!(kms.secret(&VolumeId::from("vol-1")).is_some());

        volume.remove_encryption(&ctx).await.unwrap();
        assert!(kms.secret(&VolumeId::from("vol-1")).is_none());

        let plain = EncryptedVolume::unbound(Arc::new(SimVolume::new("vol-2")), &config);
        assert_matches!(plain.remove_encryption(&ctx).await, Ok(()));
    }
}
