// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{collections::HashMap, sync::Mutex};

use async_trait::async_trait;
use tokio::time::Instant;

use crate::{
    engine::{
        context::Context,
        crypt::{LockRequest, LockService},
        sim::locked,
        types::DeleteAction,
    },
    guard::{GuardError, GuardResult},
};

#[derive(Debug)]
struct Holder {
    cookie: String,
    expires: Instant,
}

#[derive(Debug, Default)]
struct LockTable {
    held: HashMap<String, Holder>,
    max_holders: usize,
}

impl LockTable {
    fn expire(&mut self) {
        let now = Instant::now();
        self.held.retain(|_, holder| holder.expires > now);
    }
}

/// Lease locks kept in memory, keyed by lock name. A lock whose lease has
/// run out is free again.
#[derive(Debug, Default)]
pub struct SimLockService {
    table: Mutex<LockTable>,
}

impl SimLockService {
    pub fn is_held(&self, name: &str) -> bool {
        let mut table = locked(&self.table);
        table.expire();
        table.held.contains_key(name)
    }

    /// The largest number of locks ever held at the same time.
    pub fn max_concurrent_holders(&self) -> usize {
        locked(&self.table).max_holders
    }
}

#[async_trait]
impl LockService for SimLockService {
    async fn acquire_exclusive(&self, ctx: &Context, request: &LockRequest) -> GuardResult<()> {
        ctx.check()?;
        let mut table = locked(&self.table);
        table.expire();
        if let Some(holder) = table.held.get(&request.name) {
            return Err(GuardError::LockUnavailable {
                resource: request.resource.clone(),
                reason: format!("{} is held by {}", request.name, holder.cookie),
            });
        }
        table.held.insert(
            request.name.clone(),
            Holder {
                cookie: request.cookie.clone(),
                expires: Instant::now() + request.lease,
            },
        );
        table.max_holders = table.max_holders.max(table.held.len());
        Ok(())
    }

    async fn release(
        &self,
        ctx: &Context,
        request: &LockRequest,
    ) -> GuardResult<DeleteAction<()>> {
        ctx.check()?;
        let mut table = locked(&self.table);
        table.expire();
        let owned = table
            .held
            .get(&request.name)
            .is_some_and(|holder| holder.cookie == request.cookie);
        if owned {
            table.held.remove(&request.name);
            Ok(DeleteAction::Deleted(()))
        } else {
            Ok(DeleteAction::Identity)
        }
    }
}
