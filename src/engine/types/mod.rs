// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{
    borrow::Borrow,
    fmt::{self, Display},
};

pub use crate::engine::types::{
    actions::{CreateAction, DeleteAction, MappingCreateAction},
    encryption::{EncryptionState, EncryptionType},
    keys::SizedKeyMemory,
};

mod actions;
mod encryption;
mod keys;

/// Index of a LUKS key slot.
pub type KeySlot = u32;

/// Identity of a volume as known to the provisioning layer. Locks, key
/// management entries and DEK storage are all keyed by this value.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct VolumeId(String);

impl VolumeId {
    pub fn new<S>(id: S) -> VolumeId
    where
        S: Into<String>,
    {
        VolumeId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for VolumeId {
    fn from(s: &str) -> VolumeId {
        VolumeId(s.to_string())
    }
}

impl From<String> for VolumeId {
    fn from(s: String) -> VolumeId {
        VolumeId(s)
    }
}

impl AsRef<str> for VolumeId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for VolumeId {
    fn borrow(&self) -> &str {
        &self.0
    }
}
