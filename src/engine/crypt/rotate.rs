// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Passphrase rotation of a LUKS device.
//!
//! The order of the steps keeps the device unlockable at every point:
//! until the new passphrase is installed in the primary slot the old one
//! opens both slots, and from then on the backup slot still holds the old
//! passphrase until the new one has been recorded and has proven itself
//! by authenticating the removal of the backup.

use std::sync::Arc;

use strum_macros::Display;

use crate::{
    engine::{
        config::CryptConfig,
        context::Context,
        crypt::{
            binding::{EncryptedVolume, EncryptionBinding},
            device::{wait_for_device, DeviceLocator},
            kms::VolumeEncryption,
            lock::{LockGuard, LockRequest, LockService},
            luks::LuksWrapper,
        },
        types::{EncryptionState, SizedKeyMemory},
    },
    guard::{GuardError, GuardResult},
};

/// Progress of one rotation attempt. Each value names the last step that
/// completed.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum RotationStep {
    Idle,
    LockHeld,
    DeviceLocated,
    BackupStored,
    NewKeyInstalled,
    KmsUpdated,
    BackupRemoved,
    Done,
    Failed,
}

#[derive(Debug)]
pub struct KeyRotation {
    luks: Arc<dyn LuksWrapper>,
    locks: Arc<dyn LockService>,
    locator: Arc<dyn DeviceLocator>,
    config: CryptConfig,
}

impl KeyRotation {
    pub fn new(
        luks: Arc<dyn LuksWrapper>,
        locks: Arc<dyn LockService>,
        locator: Arc<dyn DeviceLocator>,
        config: &CryptConfig,
    ) -> KeyRotation {
        KeyRotation {
            luks,
            locks,
            locator,
            config: config.clone(),
        }
    }

    /// Replace the passphrase of `volume` with a newly generated one.
    ///
    /// Only block encrypted volumes in the `Encrypted` state can be
    /// rotated. Rotations of the same volume are serialized by a cluster
    /// lock, which is released whatever the outcome, including when `ctx`
    /// is cancelled.
    pub async fn rotate(&self, ctx: &Context, volume: &EncryptedVolume) -> GuardResult<()> {
        let enc = match volume.binding() {
            EncryptionBinding::Block(enc) => enc,
            binding => {
                return Err(GuardError::UnsupportedOperation(format!(
                    "key rotation requires block encryption, volume {} has {}",
                    volume.volume_id(),
                    binding.encryption_type()
                )))
            }
        };
        let state = volume.check_state(ctx).await?;
        if state != EncryptionState::Encrypted {
            return Err(GuardError::UnsupportedOperation(format!(
                "volume {} is not encrypted (state {state:?}); nothing to rotate",
                volume.volume_id()
            )));
        }

        let lease = self.config.lock_lease();
        let guard = LockGuard::acquire(
            ctx,
            Arc::clone(&self.locks),
            LockRequest::rotation(volume.volume_id(), lease),
            self.config.lock_acquire_timeout(),
        )
        .await?;

        // One deadline for the whole locked section, started after the
        // lease and shorter than it, so the lock cannot lapse mid-rotation.
        let section = ctx.with_timeout(self.config.luks_timeout());
        let mut step = RotationStep::LockHeld;
        debug!("Key rotation of volume {}: {step}", volume.volume_id());
        let result = self.rotate_locked(&section, volume, enc, &mut step).await;

        // The caller's context may be cancelled or expired by now.
        if let Err(err) = guard.release(&Context::detached(lease)).await {
            warn!(
                "Failed to release key rotation lock of volume {}; it expires after {lease:?}: {err}",
                volume.volume_id()
            );
        }

        match result {
            Ok(()) => {
                info!("Rotated encryption passphrase of volume {}", volume.volume_id());
                Ok(())
            }
            Err(err) => {
                let completed = step;
                step = RotationStep::Failed;
                warn!(
                    "Key rotation of volume {}: {step} after {completed}: {err}",
                    volume.volume_id()
                );
                Err(GuardError::Chained(
                    format!(
                        "Key rotation of volume {} failed after step {completed}",
                        volume.volume_id()
                    ),
                    Box::new(err),
                ))
            }
        }
    }

    async fn rotate_locked(
        &self,
        ctx: &Context,
        volume: &EncryptedVolume,
        enc: &VolumeEncryption,
        step: &mut RotationStep,
    ) -> GuardResult<()> {
        let volume_id = volume.volume_id();
        let mut advance = |next: RotationStep| {
            *step = next;
            debug!("Key rotation of volume {volume_id}: {next}");
        };

        let device = wait_for_device(
            ctx,
            self.locator.as_ref(),
            volume.volume().image_spec(),
            self.config.device_discovery_attempts,
            self.config.device_discovery_interval(),
        )
        .await?;
        advance(RotationStep::DeviceLocated);

        let old = chain_err!(
            enc.fetch_passphrase(ctx, volume_id).await,
            "Failed to fetch current passphrase of volume {}",
            volume_id
        )?;

        chain_err!(
            self.luks
                .add_key(ctx, &device, &old, &old, self.config.backup_slot)
                .await,
            "Failed to copy current passphrase of {} to key slot {}",
            device,
            self.config.backup_slot
        )?;
        advance(RotationStep::BackupStored);

        let new: SizedKeyMemory = enc.generate_passphrase(self.config.passphrase_size)?;

        chain_err!(
            self.luks
                .add_key(ctx, &device, &old, &new, self.config.primary_slot)
                .await,
            "Failed to install new passphrase of {} in key slot {}",
            device,
            self.config.primary_slot
        )?;
        advance(RotationStep::NewKeyInstalled);

        // From here the backup slot is the only place the old passphrase
        // is kept.
        chain_err!(
            enc.store_passphrase(ctx, volume_id, &new).await,
            "Failed to store new passphrase of volume {}; key slot {} of {} still holds the old one",
            volume_id,
            self.config.backup_slot,
            device
        )?;
        advance(RotationStep::KmsUpdated);

        chain_err!(
            self.luks
                .remove_key(ctx, &device, &new, self.config.backup_slot)
                .await,
            "Failed to remove backup key slot {} of {}",
            self.config.backup_slot,
            device
        )?;
        advance(RotationStep::BackupRemoved);
        advance(RotationStep::Done);
        Ok(())
    }
}
