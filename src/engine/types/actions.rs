// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Contains types which encode the results of actions requested on a volume,
//! a key slot, or a lock. Each action type is designed to support
//! idempotency. In every case, the action type is used to indicate the
//! effect of the action at the time the action is requested. The action was
//! completed succesfully; this type indicates what changes had to be made.

use std::fmt::{self, Display};

use crate::engine::types::{EncryptionState, KeySlot};

#[derive(Debug, PartialEq, Eq)]
/// A single create action.
pub enum CreateAction<T> {
    /// The thing already existed.
    Identity,
    /// The thing did not already exist.
    Created(T),
}

impl Display for CreateAction<KeySlot> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CreateAction::Created(slot) => {
                write!(f, "Passphrase was added to key slot {slot} successfully")
            }
            CreateAction::Identity => write!(
                f,
                "The key slot already holds the requested passphrase; no action taken"
            ),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
/// A single delete action.
pub enum DeleteAction<T> {
    /// The thing was already gone.
    Identity,
    /// The thing existed and was removed.
    Deleted(T),
}

impl Display for DeleteAction<KeySlot> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeleteAction::Deleted(slot) => {
                write!(f, "Key slot {slot} was wiped successfully")
            }
            DeleteAction::Identity => {
                write!(f, "The key slot was not active; no action taken")
            }
        }
    }
}

/// Idempotent type representing a create action for a mapping from a key to a value
#[derive(Debug, PartialEq, Eq)]
pub enum MappingCreateAction<T> {
    /// The key did not exist and the key and value are newly created.
    Created(T),
    /// The key and the value were not changed.
    Identity,
    /// The key existed and the value was updated.
    ValueChanged(T),
}

impl Display for MappingCreateAction<EncryptionState> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MappingCreateAction::Created(state) => {
                write!(f, "Encryption state was recorded as {state:?}")
            }
            MappingCreateAction::Identity => write!(
                f,
                "The requested encryption state is already recorded; no action was taken"
            ),
            MappingCreateAction::ValueChanged(state) => {
                write!(f, "Encryption state was advanced to {state:?}")
            }
        }
    }
}

