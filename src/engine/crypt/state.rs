// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use crate::{
    engine::{
        config::CryptConfig,
        context::Context,
        crypt::volume::{migrate_metadata, VolumeMetadata},
        types::{EncryptionState, MappingCreateAction},
    },
    guard::{GuardError, GuardResult},
};

/// Read the encryption state of `volume`, moving it from the legacy
/// metadata key if necessary. A missing or unrecognized value is
/// `Unknown`.
pub async fn check_state(
    ctx: &Context,
    volume: &dyn VolumeMetadata,
    config: &CryptConfig,
) -> GuardResult<EncryptionState> {
    let value = log_on_failure!(
        migrate_metadata(ctx, volume, &config.legacy_state_key, &config.state_key).await,
        "Checking encryption state of volume {} failed",
        volume.volume_id()
    );
    let state = match value {
        Some(value) => EncryptionState::from_metadata(&value),
        None => {
            debug!("Encryption state of volume {} is not set", volume.volume_id());
            EncryptionState::Unknown
        }
    };
    debug!(
        "Encryption state of volume {} is {state:?}",
        volume.volume_id()
    );
    Ok(state)
}

/// Record `state` for `volume`. The state only ever moves forward; a
/// request to move it back is a bug in the caller.
pub async fn set_state(
    ctx: &Context,
    volume: &dyn VolumeMetadata,
    config: &CryptConfig,
    state: EncryptionState,
) -> GuardResult<MappingCreateAction<EncryptionState>> {
    let current = check_state(ctx, volume, config).await?;
    if current == state {
        return Ok(MappingCreateAction::Identity);
    }
    if state < current {
        return Err(GuardError::InternalInvariantViolation(format!(
            "refusing to move encryption state of volume {} from {current:?} back to {state:?}",
            volume.volume_id()
        )));
    }
    chain_err!(
        volume
            .set_metadata(ctx, &config.state_key, state.as_metadata())
            .await,
        "Failed to save encryption state of volume {}",
        volume.volume_id()
    )?;
    let action = if current == EncryptionState::Unknown {
        MappingCreateAction::Created(state)
    } else {
        MappingCreateAction::ValueChanged(state)
    };
    info!("Volume {}: {action}", volume.volume_id());
    Ok(action)
}

#[cfg(test)]
mod tests {
    use crate::engine::{config::LEGACY_ENCRYPTION_STATE_KEY, sim::SimVolume};

    use super::*;

    #[tokio::test]
    async fn test_state_moves_forward_only() {
        let ctx = Context::background();
        let config = CryptConfig::default();
        let volume = SimVolume::new("vol-1");

        assert_eq!(
            check_state(&ctx, &volume, &config).await.unwrap(),
            EncryptionState::Unknown
        );
        assert_eq!(
            set_state(&ctx, &volume, &config, EncryptionState::Prepared)
                .await
                .unwrap(),
            MappingCreateAction::Created(EncryptionState::Prepared)
        );
        assert_eq!(
            set_state(&ctx, &volume, &config, EncryptionState::Prepared)
                .await
                .unwrap(),
            MappingCreateAction::Identity
        );
        assert_eq!(
            set_state(&ctx, &volume, &config, EncryptionState::Encrypted)
                .await
                .unwrap(),
            MappingCreateAction::ValueChanged(EncryptionState::Encrypted)
        );
        for state in [EncryptionState::Unknown, EncryptionState::Prepared] {
            assert_matches!(
                set_state(&ctx, &volume, &config, state).await,
                Err(GuardError::InternalInvariantViolation(_))
            );
        }
        assert_eq!(
            volume.metadata(&config.state_key),
            Some("encrypted".to_string())
        );
    }

    #[tokio::test]
    async fn test_legacy_state_is_migrated() {
        let ctx = Context::background();
        let config = CryptConfig::default();
        let volume = SimVolume::new("vol-1");
        volume
            .set_metadata(&ctx, LEGACY_ENCRYPTION_STATE_KEY, "encrypted")
            .await
            .unwrap();

        assert_eq!(
            check_state(&ctx, &volume, &config).await.unwrap(),
            EncryptionState::Encrypted
        );
        assert_eq!(volume.metadata(LEGACY_ENCRYPTION_STATE_KEY), None);
        assert_eq!(
            volume.metadata(&config.state_key),
            Some("encrypted".to_string())
        );
    }

    #[tokio::test]
    async fn test_unrecognized_state_reads_unknown() {
        let ctx = Context::background();
        let config = CryptConfig::default();
        let volume = SimVolume::new("vol-1");
        volume
            .set_metadata(&ctx, &config.state_key, "half-done")
            .await
            .unwrap();
        assert_eq!(
            check_state(&ctx, &volume, &config).await.unwrap(),
            EncryptionState::Unknown
        );
    }
}
