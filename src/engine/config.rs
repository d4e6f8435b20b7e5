// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Tunables for fencing and encryption. Every value that the cluster
//! protocol or the crash-safety argument depends on lives here so that it
//! is passed to components at construction rather than read from globals.

use std::{
    collections::HashMap,
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{
    engine::types::KeySlot,
    guard::{GuardError, GuardResult},
};

/// Ceph has no indefinite blocklist entry; about five years stands in for
/// one. Replace once the cluster can express an unbounded duration.
pub const DEFAULT_BLOCKLIST_DURATION_SECS: u64 = 157_784_760;
/// Every client holds a session with MDS rank 0.
pub const DEFAULT_MDS_RANK: u32 = 0;
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 120;
/// Substring of the ceph CLI failure reported for a command it does not
/// know, for example `osd blocklist range` on releases before Quincy.
pub const DEFAULT_UNSUPPORTED_MARKER: &str = "invalid command";
/// Nonce that makes `osd blocklist rm <ip>:0/<nonce>` match an entry added
/// without a specific connection instance.
pub const DEFAULT_REMOVAL_NONCE: &str = "0";
/// A /8 is already far more than a per-address blocklist fallback can
/// apply.
pub const DEFAULT_MAX_EXPANDED_HOST_BITS: u32 = 24;

pub const DEFAULT_PASSPHRASE_SIZE: usize = 20;
pub const DEFAULT_PRIMARY_SLOT: KeySlot = 0;
pub const DEFAULT_BACKUP_SLOT: KeySlot = 1;
pub const DEFAULT_LUKS_TIMEOUT_SECS: u64 = 150;
pub const DEFAULT_LEASE_MARGIN_SECS: u64 = 30;
pub const DEFAULT_LOCK_ACQUIRE_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_DEVICE_DISCOVERY_ATTEMPTS: usize = 10;
pub const DEFAULT_DEVICE_DISCOVERY_INTERVAL_MS: u64 = 1000;

pub const DEFAULT_SECRETS_DIR: &str = "/var/lib/volguard/secrets";

pub const ENCRYPTION_STATE_KEY: &str = "rbd.csi.ceph.com/encrypted";
pub const LEGACY_ENCRYPTION_STATE_KEY: &str = ".rbd.csi.ceph.com/encrypted";
pub const DEK_KEY: &str = "rbd.csi.ceph.com/dek";
pub const LEGACY_DEK_KEY: &str = ".rbd.csi.ceph.com/dek";

/// Identity and credentials used for every cluster command. This is the
/// cluster half of an address fence.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Comma separated monitor addresses, passed as `-m`.
    pub monitors: String,
    /// Ceph client id, passed as `--id`.
    pub client_id: String,
    /// Path of the file holding the client key, passed as `--keyfile=`.
    pub key_file: String,
    pub pool: String,
    pub rados_namespace: String,
}

impl ClusterConfig {
    /// Arguments that authenticate a ceph/rbd/rados command.
    pub fn auth_args(&self) -> Vec<String> {
        vec![
            "--id".to_string(),
            self.client_id.clone(),
            format!("--keyfile={}", self.key_file),
            "-m".to_string(),
            self.monitors.clone(),
        ]
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct FenceConfig {
    pub program: String,
    pub blocklist_duration_secs: u64,
    pub mds_rank: u32,
    pub command_timeout_secs: u64,
    pub unsupported_marker: String,
    pub removal_nonce: String,
    /// Largest block, in host bits, that is expanded into single
    /// addresses.
    pub max_expanded_host_bits: u32,
}

impl FenceConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

impl Default for FenceConfig {
    fn default() -> FenceConfig {
        FenceConfig {
            program: "ceph".to_string(),
            blocklist_duration_secs: DEFAULT_BLOCKLIST_DURATION_SECS,
            mds_rank: DEFAULT_MDS_RANK,
            command_timeout_secs: DEFAULT_COMMAND_TIMEOUT_SECS,
            unsupported_marker: DEFAULT_UNSUPPORTED_MARKER.to_string(),
            removal_nonce: DEFAULT_REMOVAL_NONCE.to_string(),
            max_expanded_host_bits: DEFAULT_MAX_EXPANDED_HOST_BITS,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct CryptConfig {
    pub passphrase_size: usize,
    pub primary_slot: KeySlot,
    pub backup_slot: KeySlot,
    /// Upper bound for a single cryptsetup invocation, and for all the
    /// steps of a key rotation taken together.
    pub luks_timeout_secs: u64,
    /// Added to the rotation bound to obtain the rotation lock lease.
    pub lease_margin_secs: u64,
    pub lock_acquire_timeout_secs: u64,
    pub device_discovery_attempts: usize,
    pub device_discovery_interval_ms: u64,
    /// Device type passed to `rbd device list`, e.g. `krbd` or `nbd`.
    pub device_type: String,
    pub state_key: String,
    pub legacy_state_key: String,
    pub dek_key: String,
    pub legacy_dek_key: String,
}

impl CryptConfig {
    pub fn luks_timeout(&self) -> Duration {
        Duration::from_secs(self.luks_timeout_secs)
    }

    /// The rotation lock must outlive the deadline of the rotation it
    /// guards so that it cannot expire while its holder still believes it
    /// owns it.
    pub fn lock_lease(&self) -> Duration {
        Duration::from_secs(self.luks_timeout_secs + self.lease_margin_secs)
    }

    pub fn lock_acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_acquire_timeout_secs)
    }

    pub fn device_discovery_interval(&self) -> Duration {
        Duration::from_millis(self.device_discovery_interval_ms)
    }

    /// Check the relationships between values that the rotation protocol
    /// relies on.
    pub fn validate(&self) -> GuardResult<()> {
        if self.primary_slot == self.backup_slot {
            return Err(GuardError::Msg(format!(
                "Primary and backup key slots must differ; both are {}",
                self.primary_slot
            )));
        }
        if self.passphrase_size == 0 {
            return Err(GuardError::Msg(
                "Passphrase size must be greater than zero".to_string(),
            ));
        }
        if self.lease_margin_secs == 0 {
            return Err(GuardError::Msg(
                "The lock lease must exceed the cryptsetup timeout".to_string(),
            ));
        }
        if self.state_key.is_empty() || self.dek_key.is_empty() {
            return Err(GuardError::Msg(
                "Metadata keys for encryption state and DEK must be set".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for CryptConfig {
    fn default() -> CryptConfig {
        CryptConfig {
            passphrase_size: DEFAULT_PASSPHRASE_SIZE,
            primary_slot: DEFAULT_PRIMARY_SLOT,
            backup_slot: DEFAULT_BACKUP_SLOT,
            luks_timeout_secs: DEFAULT_LUKS_TIMEOUT_SECS,
            lease_margin_secs: DEFAULT_LEASE_MARGIN_SECS,
            lock_acquire_timeout_secs: DEFAULT_LOCK_ACQUIRE_TIMEOUT_SECS,
            device_discovery_attempts: DEFAULT_DEVICE_DISCOVERY_ATTEMPTS,
            device_discovery_interval_ms: DEFAULT_DEVICE_DISCOVERY_INTERVAL_MS,
            device_type: "krbd".to_string(),
            state_key: ENCRYPTION_STATE_KEY.to_string(),
            legacy_state_key: LEGACY_ENCRYPTION_STATE_KEY.to_string(),
            dek_key: DEK_KEY.to_string(),
            legacy_dek_key: LEGACY_DEK_KEY.to_string(),
        }
    }
}

/// Description of one key management service, selected by KMS id.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(tag = "encryptionKMSType", rename_all = "lowercase")]
pub enum KmsDescription {
    /// The DEK is wrapped with a passphrase taken from the request
    /// credentials and stored in the volume's own metadata.
    Metadata {
        #[serde(default = "default_secret_key", rename = "secretKey")]
        secret_key: String,
    },
    /// The KMS stores secrets itself, one file per volume below
    /// `secretsDir`.
    Integrated {
        #[serde(default = "default_secrets_dir", rename = "secretsDir")]
        secrets_dir: PathBuf,
    },
}

fn default_secret_key() -> String {
    "encryptionPassphrase".to_string()
}

fn default_secrets_dir() -> PathBuf {
    PathBuf::from(DEFAULT_SECRETS_DIR)
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(default)]
pub struct GuardConfig {
    pub cluster: ClusterConfig,
    pub fence: FenceConfig,
    pub crypt: CryptConfig,
    pub kms: HashMap<String, KmsDescription>,
}

impl GuardConfig {
    /// Read a configuration from a JSON file. Fields that are not present
    /// take their default values.
    pub fn from_file(path: &Path) -> GuardResult<GuardConfig> {
        let file = chain_err!(
            File::open(path).map_err(GuardError::from),
            "Failed to open configuration file {}",
            path.display()
        )?;
        let config: GuardConfig = chain_err!(
            serde_json::from_reader(BufReader::new(file)).map_err(GuardError::from),
            "Failed to parse configuration file {}",
            path.display()
        )?;
        config.crypt.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config() {
        let config: GuardConfig = serde_json::from_value(json!({
            "cluster": {"monitors": "10.0.0.1:6789", "client_id": "csi"},
            "fence": {"mds_rank": 1},
            "kms": {
                "vault-1": {"encryptionKMSType": "integrated"},
                "meta": {"encryptionKMSType": "metadata"}
            }
        }))
        .unwrap();
        assert_eq!(config.fence.mds_rank, 1);
        assert_eq!(
            config.fence.blocklist_duration_secs,
            DEFAULT_BLOCKLIST_DURATION_SECS
        );
        assert_eq!(config.crypt, CryptConfig::default());
        assert_eq!(
            config.kms["vault-1"],
            KmsDescription::Integrated {
                secrets_dir: PathBuf::from(DEFAULT_SECRETS_DIR)
            }
        );
        assert_eq!(
            config.kms["meta"],
            KmsDescription::Metadata {
                secret_key: "encryptionPassphrase".to_string()
            }
        );
    }

    #[test]
    fn test_lock_lease_exceeds_luks_timeout() {
        let config = CryptConfig::default();
        assert!(config.lock_lease() > config.luks_timeout());
        assert_matches!(config.validate(), Ok(()));
    }

    #[test]
    fn test_validate_rejects_shared_slot() {
        let config = CryptConfig {
            backup_slot: DEFAULT_PRIMARY_SLOT,
            ..Default::default()
        };
        assert_matches!(config.validate(), Err(GuardError::Msg(_)));
    }
}
