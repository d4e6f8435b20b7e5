// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

mod binding;
mod device;
mod kms;
mod lock;
mod luks;
mod rotate;
mod state;
mod volume;

pub use self::{
    binding::{
        configure_binding, parse_encryption_options, EncryptedVolume, EncryptionBinding,
        OPTION_ENCRYPTED, OPTION_ENCRYPTION_TYPE, OPTION_KMS_ID,
    },
    device::{wait_for_device, DeviceLocator, RbdDeviceLocator},
    kms::{
        IntegratedKms, KeyManagement, KmsRegistry, MetadataKms, VolumeEncryption,
        DEFAULT_KMS_ID, DEFAULT_SECRET_KEY,
    },
    lock::{LockGuard, LockRequest, LockService, RadosLock},
    luks::{CryptsetupLuks, LuksWrapper},
    rotate::{KeyRotation, RotationStep},
    state::{check_state, set_state},
    volume::{migrate_metadata, DekStore, ImageSpec, MetadataDekStore, RbdImage, VolumeMetadata},
};
