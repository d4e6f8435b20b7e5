// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Network fencing: denying cluster access to address ranges and evicting
//! the live sessions that originate from them.

use std::sync::Arc;

pub use self::{
    blocklist::{
        address_entries_in_range, is_unsupported_command, parse_blocklist, BlocklistController,
        BlocklistEntry, BlocklistMode,
    },
    cidr::{address_in_range, expand_cidr, expand_cidr_within, CidrBlock, CidrHosts},
    eviction::{ActiveSession, EvictionController},
};

use crate::{
    engine::{
        cmd::{CommandGateway, CommandOutput},
        config::{ClusterConfig, FenceConfig},
        context::Context,
    },
    guard::{GuardError, GuardResult},
};

mod blocklist;
mod cidr;
mod eviction;

/// The ranges to fence and the credentials to fence them with. Every range
/// is validated at construction.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AddressFence {
    ranges: Vec<String>,
    cluster: ClusterConfig,
}

impl AddressFence {
    pub fn new(ranges: Vec<String>, cluster: ClusterConfig) -> GuardResult<AddressFence> {
        if ranges.is_empty() {
            return Err(GuardError::InvalidRange {
                range: String::new(),
                reason: "at least one address range is required".to_string(),
            });
        }
        for range in &ranges {
            CidrBlock::parse(range)?;
        }
        Ok(AddressFence { ranges, cluster })
    }

    pub fn ranges(&self) -> &[String] {
        &self.ranges
    }

    pub fn cluster(&self) -> &ClusterConfig {
        &self.cluster
    }
}

/// Issues `ceph` commands with the fence's credentials appended.
#[derive(Clone, Debug)]
pub(crate) struct CephCli {
    gateway: Arc<dyn CommandGateway>,
    cluster: ClusterConfig,
    config: FenceConfig,
}

impl CephCli {
    pub(crate) fn new(
        gateway: Arc<dyn CommandGateway>,
        cluster: ClusterConfig,
        config: FenceConfig,
    ) -> CephCli {
        CephCli {
            gateway,
            cluster,
            config,
        }
    }

    pub(crate) fn config(&self) -> &FenceConfig {
        &self.config
    }

    /// Run `ceph <args> <auth args>`. A failure whose stderr marks the
    /// command as unrecognized is reported as `UnsupportedCommand`.
    pub(crate) async fn run(&self, ctx: &Context, args: &[String]) -> GuardResult<CommandOutput> {
        let mut full = args.to_vec();
        full.extend(self.cluster.auth_args());
        self.gateway
            .execute(
                ctx,
                self.config.command_timeout(),
                &self.config.program,
                &full,
                None,
            )
            .await
            .map_err(|err| match err {
                GuardError::CommandFailed { cmd, stderr, .. }
                    if is_unsupported_command(&stderr, &self.config.unsupported_marker) =>
                {
                    GuardError::UnsupportedCommand { cmd, stderr }
                }
                err => err,
            })
    }
}

/// Entry point for fencing operations over one `AddressFence`.
#[derive(Debug)]
pub struct NetworkFence {
    fence: AddressFence,
    blocklist: BlocklistController,
    eviction: EvictionController,
}

impl NetworkFence {
    pub fn new(
        fence: AddressFence,
        gateway: Arc<dyn CommandGateway>,
        config: FenceConfig,
    ) -> NetworkFence {
        let cli = CephCli::new(gateway, fence.cluster.clone(), config);
        let blocklist = BlocklistController::new(cli.clone());
        let eviction = EvictionController::new(cli, blocklist.clone());
        NetworkFence {
            fence,
            blocklist,
            eviction,
        }
    }

    pub fn fence(&self) -> &AddressFence {
        &self.fence
    }

    /// Block every address in the fence's ranges.
    pub async fn add_fence(&self, ctx: &Context) -> GuardResult<BlocklistMode> {
        let mode = self.blocklist.add(ctx, &self.fence.ranges).await?;
        info!(
            "Fenced {} using {mode} blocklist entries",
            self.fence.ranges.join(", ")
        );
        Ok(mode)
    }

    /// Undo `add_fence`.
    pub async fn remove_fence(&self, ctx: &Context) -> GuardResult<BlocklistMode> {
        let mode = self.blocklist.remove(ctx, &self.fence.ranges).await?;
        info!(
            "Removed fence on {} using {mode} blocklist entries",
            self.fence.ranges.join(", ")
        );
        Ok(mode)
    }

    /// Evict every live session from the fence's ranges and then block the
    /// ranges. Returns the addresses whose sessions were evicted.
    pub async fn evict_and_fence(&self, ctx: &Context) -> GuardResult<Vec<String>> {
        self.eviction.evict_and_fence(ctx, &self.fence.ranges).await
    }

    /// Undo `evict_and_fence`, including the per-session entries the
    /// cluster added when it evicted sessions.
    pub async fn remove_eviction(&self, ctx: &Context) -> GuardResult<()> {
        self.eviction.remove_eviction(ctx, &self.fence.ranges).await
    }

    pub fn blocklist(&self) -> &BlocklistController {
        &self.blocklist
    }

    pub fn eviction(&self) -> &EvictionController {
        &self.eviction
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_fence_validation() {
        assert_matches!(
            AddressFence::new(vec![], ClusterConfig::default()),
            Err(GuardError::InvalidRange { .. })
        );
        assert_matches!(
            AddressFence::new(
                vec!["10.0.0.0/24".to_string(), "10.0.1.0".to_string()],
                ClusterConfig::default()
            ),
            Err(GuardError::InvalidRange { .. })
        );
        let fence =
            AddressFence::new(vec!["10.0.0.0/24".to_string()], ClusterConfig::default()).unwrap();
        assert_eq!(fence.ranges(), ["10.0.0.0/24".to_string()]);
    }
}
