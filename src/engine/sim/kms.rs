// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
};

use async_trait::async_trait;

use crate::{
    engine::{
        context::Context,
        crypt::KeyManagement,
        sim::locked,
        types::{SizedKeyMemory, VolumeId},
    },
    guard::{GuardError, GuardResult},
};

/// A KMS that keeps one secret per volume in memory.
#[derive(Debug)]
pub struct SimKms {
    id: String,
    secrets: Mutex<HashMap<VolumeId, SizedKeyMemory>>,
    fail_stores: AtomicBool,
}

impl SimKms {
    pub fn new(id: &str) -> SimKms {
        SimKms {
            id: id.to_string(),
            secrets: Mutex::new(HashMap::new()),
            fail_stores: AtomicBool::new(false),
        }
    }

    pub fn secret(&self, volume_id: &VolumeId) -> Option<SizedKeyMemory> {
        locked(&self.secrets).get(volume_id).cloned()
    }

    /// Make every store fail, as an unreachable KMS would.
    pub fn fail_stores(&self, fail: bool) {
        self.fail_stores.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl KeyManagement for SimKms {
    fn id(&self) -> &str {
        &self.id
    }

    fn requires_dek_store(&self) -> bool {
        false
    }

    fn supports_direct_fetch(&self) -> bool {
        true
    }

    async fn store_secret(
        &self,
        ctx: &Context,
        volume_id: &VolumeId,
        secret: &SizedKeyMemory,
    ) -> GuardResult<()> {
        ctx.check()?;
        if self.fail_stores.load(Ordering::SeqCst) {
            return Err(GuardError::Msg(format!(
                "KMS {} is unreachable",
                self.id
            )));
        }
        locked(&self.secrets).insert(volume_id.clone(), secret.clone());
        Ok(())
    }

    async fn fetch_secret(&self, ctx: &Context, volume_id: &VolumeId) -> GuardResult<SizedKeyMemory> {
        ctx.check()?;
        self.secret(volume_id).ok_or_else(|| {
            GuardError::Msg(format!("KMS {} has no secret for {volume_id}", self.id))
        })
    }

    async fn remove_secret(&self, ctx: &Context, volume_id: &VolumeId) -> GuardResult<()> {
        ctx.check()?;
        locked(&self.secrets).remove(volume_id);
        Ok(())
    }
}
