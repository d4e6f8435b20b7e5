// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{fmt::Debug, sync::Arc, time::Duration};

use async_trait::async_trait;
use retry::delay::Fixed;

use crate::{
    engine::{
        cmd::{CommandGateway, RADOS},
        config::ClusterConfig,
        context::Context,
        types::{DeleteAction, VolumeId},
    },
    guard::{GuardError, GuardResult},
};

/// Interval between attempts to take a busy lock.
const ACQUIRE_RETRY_INTERVAL_MS: u64 = 500;

/// Identifies one exclusive lock and its holder.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LockRequest {
    /// Object the lock is attached to.
    pub resource: String,
    pub name: String,
    pub cookie: String,
    pub description: String,
    pub lease: Duration,
}

impl LockRequest {
    /// The lock that serializes key rotation of `volume_id`.
    pub fn rotation(volume_id: &VolumeId, lease: Duration) -> LockRequest {
        LockRequest {
            resource: volume_id.to_string(),
            name: format!("{volume_id}-mutexlock"),
            cookie: format!("{volume_id}-enc-key-rotate"),
            description: format!("Key rotation mutex lock for {volume_id}"),
            lease,
        }
    }
}

/// A cluster-wide lease lock.
#[async_trait]
pub trait LockService: Debug + Send + Sync {
    /// Take the lock, or fail with `LockUnavailable` if someone else holds
    /// it. Does not wait.
    async fn acquire_exclusive(&self, ctx: &Context, request: &LockRequest) -> GuardResult<()>;

    /// Give the lock up. Releasing a lock that has already expired succeeds.
    async fn release(&self, ctx: &Context, request: &LockRequest)
        -> GuardResult<DeleteAction<()>>;
}

/// A held lock. It must be given back with `release`; dropping it only
/// leaves the lock to expire with its lease.
#[derive(Debug)]
pub struct LockGuard {
    service: Arc<dyn LockService>,
    request: LockRequest,
    released: bool,
}

impl LockGuard {
    /// Take the lock described by `request`, waiting for at most
    /// `acquire_timeout` while another holder has it.
    pub async fn acquire(
        ctx: &Context,
        service: Arc<dyn LockService>,
        request: LockRequest,
        acquire_timeout: Duration,
    ) -> GuardResult<LockGuard> {
        let wait_ctx = ctx.with_timeout(acquire_timeout);
        let mut delays = Fixed::from_millis(ACQUIRE_RETRY_INTERVAL_MS);
        loop {
            match service.acquire_exclusive(&wait_ctx, &request).await {
                Ok(()) => break,
                Err(GuardError::LockUnavailable { reason, .. }) => {
                    trace!("Lock {} is busy: {reason}", request.name);
                    let delay = delays
                        .next()
                        .unwrap_or(Duration::from_millis(ACQUIRE_RETRY_INTERVAL_MS));
                    if let Err(err) = wait_ctx.sleep(delay).await {
                        return Err(match err {
                            GuardError::DeadlineExceeded if !ctx.is_cancelled() => {
                                GuardError::LockUnavailable {
                                    resource: request.resource.clone(),
                                    reason: format!(
                                        "lock {} still held by another client after {acquire_timeout:?}",
                                        request.name
                                    ),
                                }
                            }
                            err => err,
                        });
                    }
                }
                Err(err) => return Err(err),
            }
        }
        debug!("Acquired lock {} on {}", request.name, request.resource);
        Ok(LockGuard {
            service,
            request,
            released: false,
        })
    }

    pub fn request(&self) -> &LockRequest {
        &self.request
    }

    pub async fn release(mut self, ctx: &Context) -> GuardResult<DeleteAction<()>> {
        self.released = true;
        let action = self.service.release(ctx, &self.request).await?;
        debug!(
            "Released lock {} on {}",
            self.request.name, self.request.resource
        );
        Ok(action)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            warn!(
                "Lock {} on {} was not released; it expires when its {:?} lease ends",
                self.request.name, self.request.resource, self.request.lease
            );
        }
    }
}

/// Lockers as listed by `rados lock info`.
#[derive(Debug, Deserialize)]
struct LockInfo {
    #[serde(default)]
    lockers: Vec<Locker>,
}

#[derive(Debug, Deserialize)]
struct Locker {
    name: String,
    cookie: String,
}

/// `LockService` using RADOS object locks via the rados executable.
#[derive(Debug)]
pub struct RadosLock {
    gateway: Arc<dyn CommandGateway>,
    cluster: ClusterConfig,
    timeout: Duration,
}

impl RadosLock {
    pub fn new(
        gateway: Arc<dyn CommandGateway>,
        cluster: ClusterConfig,
        timeout: Duration,
    ) -> RadosLock {
        RadosLock {
            gateway,
            cluster,
            timeout,
        }
    }

    fn base_args(&self) -> Vec<String> {
        let mut args = vec!["-p".to_string(), self.cluster.pool.clone()];
        if !self.cluster.rados_namespace.is_empty() {
            args.push(format!("--namespace={}", self.cluster.rados_namespace));
        }
        args.extend(self.cluster.auth_args());
        args
    }

    async fn rados(&self, ctx: &Context, args: &[&str]) -> GuardResult<String> {
        let mut full = self.base_args();
        full.extend(args.iter().map(|a| a.to_string()));
        let output = self
            .gateway
            .execute(ctx, self.timeout, RADOS, &full, None)
            .await?;
        Ok(output.stdout)
    }
}

#[async_trait]
impl LockService for RadosLock {
    async fn acquire_exclusive(&self, ctx: &Context, request: &LockRequest) -> GuardResult<()> {
        let lease = request.lease.as_secs().to_string();
        let res = self
            .rados(
                ctx,
                &[
                    "lock",
                    "get",
                    &request.resource,
                    &request.name,
                    "--lock-type",
                    "exclusive",
                    "--lock-cookie",
                    &request.cookie,
                    "--lock-description",
                    &request.description,
                    "--lock-duration",
                    &lease,
                ],
            )
            .await;
        match res {
            Ok(_) => Ok(()),
            Err(GuardError::CommandFailed { stderr, .. })
                if stderr.contains("Device or resource busy") || stderr.contains("File exists") =>
            {
                Err(GuardError::LockUnavailable {
                    resource: request.resource.clone(),
                    reason: stderr.trim().to_string(),
                })
            }
            Err(err) => Err(err),
        }
    }

    async fn release(
        &self,
        ctx: &Context,
        request: &LockRequest,
    ) -> GuardResult<DeleteAction<()>> {
        let info = self
            .rados(ctx, &["lock", "info", &request.resource, &request.name])
            .await?;
        let info: LockInfo = serde_json::from_str(&info).map_err(|e| {
            GuardError::ProtocolError(format!("rados lock info is not JSON: {e}"))
        })?;
        let locker = match info.lockers.iter().find(|l| l.cookie == request.cookie) {
            Some(locker) => locker,
            None => return Ok(DeleteAction::Identity),
        };
        self.rados(
            ctx,
            &[
                "lock",
                "break",
                &request.resource,
                &request.name,
                &locker.name,
                "--lock-cookie",
                &request.cookie,
            ],
        )
        .await?;
        Ok(DeleteAction::Deleted(()))
    }
}
