// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

pub use self::{
    cmd::{verify_binaries, CommandGateway, CommandOutput, ProcessGateway},
    config::{ClusterConfig, CryptConfig, FenceConfig, GuardConfig, KmsDescription},
    context::Context,
    crypt::{
        configure_binding, CryptsetupLuks, EncryptedVolume, EncryptionBinding, KeyRotation,
        KmsRegistry, LockService, LuksWrapper, RadosLock, RbdDeviceLocator, RbdImage,
        RotationStep, VolumeEncryption, VolumeMetadata,
    },
    fence::{expand_cidr, expand_cidr_within, AddressFence, BlocklistMode, NetworkFence},
    types::{
        CreateAction, DeleteAction, EncryptionState, EncryptionType, KeySlot,
        MappingCreateAction, SizedKeyMemory, VolumeId,
    },
};

#[macro_use]
mod macros;

pub mod cmd;
pub mod config;
pub mod context;
pub mod crypt;
pub mod fence;
pub mod sim;
pub mod types;
