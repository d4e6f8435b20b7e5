// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Mutex,
    time::Duration,
};

use async_trait::async_trait;

use crate::{
    engine::{
        cmd::CRYPTSETUP,
        context::Context,
        crypt::LuksWrapper,
        sim::{failure, locked},
        types::{CreateAction, DeleteAction, KeySlot, SizedKeyMemory},
    },
    guard::GuardResult,
};

const NO_KEY: &str = "No key available with this passphrase.";

#[derive(Debug, Default)]
struct LuksState {
    /// Key slots of every attached device; `None` until formatted.
    devices: HashMap<String, Option<BTreeMap<KeySlot, SizedKeyMemory>>>,
    open: HashSet<String>,
    fail_add_slots: HashSet<KeySlot>,
    fail_remove: bool,
    delay: Duration,
}

/// LUKS devices kept in memory. Every operation waits for the configured
/// delay first, so a cancelled context leaves the header untouched.
#[derive(Debug, Default)]
pub struct SimLuks {
    state: Mutex<LuksState>,
}

impl SimLuks {
    /// Make an unformatted block device available.
    pub fn attach(&self, device: &str) {
        locked(&self.state).devices.insert(device.to_string(), None);
    }

    /// Whether any active key slot of `device` holds `passphrase`.
    pub fn opens(&self, device: &str, passphrase: &SizedKeyMemory) -> bool {
        match locked(&self.state).devices.get(device) {
            Some(Some(slots)) => slots.values().any(|key| key == passphrase),
            _ => false,
        }
    }

    /// The active key slots of `device`, in ascending order.
    pub fn slots(&self, device: &str) -> Vec<KeySlot> {
        match locked(&self.state).devices.get(device) {
            Some(Some(slots)) => slots.keys().copied().collect(),
            _ => Vec::new(),
        }
    }

    pub fn fail_add_key_to_slot(&self, slot: KeySlot) {
        locked(&self.state).fail_add_slots.insert(slot);
    }

    pub fn fail_remove_key(&self) {
        locked(&self.state).fail_remove = true;
    }

    pub fn set_delay(&self, delay: Duration) {
        locked(&self.state).delay = delay;
    }

    async fn pause(&self, ctx: &Context) -> GuardResult<()> {
        let delay = locked(&self.state).delay;
        ctx.sleep(delay).await
    }

    /// Run `f` on the key slots of a formatted device, after checking that
    /// `auth` opens one of them.
    fn with_slots<T>(
        &self,
        device: &str,
        auth: &SizedKeyMemory,
        f: impl FnOnce(&mut LuksState, &str) -> GuardResult<T>,
    ) -> GuardResult<T> {
        let mut state = locked(&self.state);
        let slots = match state.devices.get(device) {
            Some(Some(slots)) => slots,
            Some(None) => {
                return Err(failure(
                    CRYPTSETUP,
                    1,
                    &format!("Device {device} is not a valid LUKS device."),
                ))
            }
            None => {
                return Err(failure(
                    CRYPTSETUP,
                    4,
                    &format!("Device {device} does not exist or access denied."),
                ))
            }
        };
        if !slots.values().any(|key| key == auth) {
            return Err(failure(CRYPTSETUP, 2, NO_KEY));
        }
        f(&mut *state, device)
    }
}

fn slots_mut<'a>(
    state: &'a mut LuksState,
    device: &str,
) -> GuardResult<&'a mut BTreeMap<KeySlot, SizedKeyMemory>> {
    match state.devices.get_mut(device) {
        Some(Some(slots)) => Ok(slots),
        _ => Err(failure(CRYPTSETUP, 4, "Device is gone.")),
    }
}

#[async_trait]
impl LuksWrapper for SimLuks {
    async fn format(
        &self,
        ctx: &Context,
        device: &str,
        passphrase: &SizedKeyMemory,
    ) -> GuardResult<()> {
        self.pause(ctx).await?;
        let mut state = locked(&self.state);
        match state.devices.get_mut(device) {
            Some(slots) => {
                *slots = Some([(0, passphrase.clone())].into_iter().collect());
                Ok(())
            }
            None => Err(failure(
                CRYPTSETUP,
                4,
                &format!("Device {device} does not exist or access denied."),
            )),
        }
    }

    async fn open(
        &self,
        ctx: &Context,
        device: &str,
        mapper_name: &str,
        passphrase: &SizedKeyMemory,
    ) -> GuardResult<()> {
        self.pause(ctx).await?;
        self.with_slots(device, passphrase, |state, _| {
            state.open.insert(mapper_name.to_string());
            Ok(())
        })
    }

    async fn is_open(&self, ctx: &Context, mapper_name: &str) -> GuardResult<bool> {
        ctx.check()?;
        Ok(locked(&self.state).open.contains(mapper_name))
    }

    async fn add_key(
        &self,
        ctx: &Context,
        device: &str,
        auth: &SizedKeyMemory,
        new: &SizedKeyMemory,
        slot: KeySlot,
    ) -> GuardResult<CreateAction<KeySlot>> {
        self.pause(ctx).await?;
        self.with_slots(device, auth, |state, device| {
            if state.fail_add_slots.contains(&slot) {
                return Err(failure(
                    CRYPTSETUP,
                    1,
                    &format!("Failed to write key slot {slot}."),
                ));
            }
            let slots = slots_mut(state, device)?;
            if slots.get(&slot) == Some(new) {
                return Ok(CreateAction::Identity);
            }
            slots.insert(slot, new.clone());
            Ok(CreateAction::Created(slot))
        })
    }

    async fn remove_key(
        &self,
        ctx: &Context,
        device: &str,
        auth: &SizedKeyMemory,
        slot: KeySlot,
    ) -> GuardResult<DeleteAction<KeySlot>> {
        self.pause(ctx).await?;
        self.with_slots(device, auth, |state, device| {
            if state.fail_remove {
                return Err(failure(
                    CRYPTSETUP,
                    1,
                    &format!("Failed to wipe key slot {slot}."),
                ));
            }
            match slots_mut(state, device)?.remove(&slot) {
                Some(_) => Ok(DeleteAction::Deleted(slot)),
                None => Ok(DeleteAction::Identity),
            }
        })
    }

    async fn verify_key(
        &self,
        ctx: &Context,
        device: &str,
        passphrase: &SizedKeyMemory,
        slot: KeySlot,
    ) -> GuardResult<bool> {
        self.pause(ctx).await?;
        match locked(&self.state).devices.get(device) {
            Some(Some(slots)) => Ok(slots.get(&slot) == Some(passphrase)),
            _ => Err(failure(
                CRYPTSETUP,
                4,
                &format!("Device {device} is not a valid LUKS device."),
            )),
        }
    }
}
