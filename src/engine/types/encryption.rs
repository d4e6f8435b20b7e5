// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use strum_macros::{Display, EnumString, IntoStaticStr};

/// Progress of a volume through encryption setup. The value is persisted as
/// a string in volume metadata and is the only durable record of progress.
///
/// The derived ordering follows the only permitted direction of travel:
/// `Unknown < Prepared < Encrypted`.
#[derive(
    Clone, Copy, Debug, Display, EnumString, Eq, Hash, IntoStaticStr, Ord, PartialEq, PartialOrd,
)]
pub enum EncryptionState {
    /// No metadata, or a value this code does not recognize. Treated as not
    /// encrypted.
    #[strum(serialize = "")]
    Unknown,
    /// The passphrase was generated and stored, the device is not yet
    /// formatted.
    #[strum(serialize = "encryptionPrepared")]
    Prepared,
    /// The device was formatted and must be unlocked before use.
    #[strum(serialize = "encrypted")]
    Encrypted,
}

impl EncryptionState {
    /// Interpret a metadata value. Unrecognized values are never an error.
    pub fn from_metadata(value: &str) -> EncryptionState {
        value.trim().parse().unwrap_or(EncryptionState::Unknown)
    }

    pub fn as_metadata(self) -> &'static str {
        self.into()
    }
}

/// Where encryption is applied to a volume.
#[derive(Clone, Copy, Debug, Display, EnumString, Eq, Hash, IntoStaticStr, PartialEq)]
#[strum(serialize_all = "lowercase")]
pub enum EncryptionType {
    None,
    /// LUKS on the block device.
    Block,
    /// Encryption inside the filesystem; secrets are fetched directly from
    /// the KMS.
    File,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_metadata_strings() {
        for state in [
            EncryptionState::Unknown,
            EncryptionState::Prepared,
            EncryptionState::Encrypted,
        ] {
            assert_eq!(EncryptionState::from_metadata(state.as_metadata()), state);
        }
        assert_eq!(EncryptionState::Prepared.as_metadata(), "encryptionPrepared");
        assert_eq!(
            EncryptionState::from_metadata(" encrypted\n"),
            EncryptionState::Encrypted
        );
    }

    #[test]
    fn test_unrecognized_state_is_unknown() {
        assert_eq!(
            EncryptionState::from_metadata("half-done"),
            EncryptionState::Unknown
        );
        assert!(EncryptionState::Unknown < EncryptionState::Prepared);
        assert!(EncryptionState::Prepared < EncryptionState::Encrypted);
    }

    #[test]
    fn test_encryption_type_strings() {
        assert_eq!("block".parse::<EncryptionType>().unwrap(), EncryptionType::Block);
        assert_eq!("file".parse::<EncryptionType>().unwrap(), EncryptionType::File);
        assert_matches!("tape".parse::<EncryptionType>(), Err(_));
    }
}
