// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! In-memory stand-ins for the cluster, the LUKS tooling, the lock
//! service, volume metadata and key management. They keep just enough
//! state to behave like the real collaborators under test.

pub use self::{
    cluster::SimCluster,
    gateway::{GatewayCall, ScriptedGateway},
    kms::SimKms,
    lock::SimLockService,
    luks::SimLuks,
    volume::{SimDeviceLocator, SimVolume},
};

mod cluster;
mod gateway;
mod kms;
mod lock;
mod luks;
mod volume;

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::{engine::cmd::CommandOutput, guard::GuardError};

/// Lock a sim's state. A panic in another test thread must not make every
/// later assertion fail on a poisoned mutex.
fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn failure(cmd: &str, status: i32, stderr: &str) -> GuardError {
    GuardError::CommandFailed {
        cmd: cmd.to_string(),
        status: Some(status),
        stderr: stderr.to_string(),
    }
}

fn stdout(text: String) -> CommandOutput {
    CommandOutput {
        stdout: text,
        stderr: String::new(),
    }
}
