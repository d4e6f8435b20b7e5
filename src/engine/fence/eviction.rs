// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{net::IpAddr, sync::LazyLock};

use indexmap::IndexSet;
use regex::Regex;

use crate::{
    engine::{
        context::Context,
        fence::{
            blocklist::{address_entries_in_range, BlocklistController},
            cidr::address_in_range,
            CephCli,
        },
    },
    guard::{GuardError, GuardResult},
};

/// An optional transport version tag, then a bracketed IPv6 address, a
/// full eight group IPv6 address, or a dotted IPv4 address.
const ADDRESS_PATTERN: &str = r"^(?:v[0-9]+:)?(?:\[([0-9a-fA-F:.]+)\]|([0-9a-fA-F]{1,4}(?::[0-9a-fA-F]{1,4}){7})|((?:\d+\.){3}\d+))";

static ADDRESS_RE: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(ADDRESS_PATTERN));

/// A client session as reported by `client ls`. Only the descriptor is
/// kept; the address and id are parsed from it when needed.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ActiveSession {
    inst: String,
}

impl ActiveSession {
    pub fn new<S: Into<String>>(descriptor: S) -> ActiveSession {
        ActiveSession {
            inst: descriptor.into(),
        }
    }

    pub fn descriptor(&self) -> &str {
        &self.inst
    }

    /// The client address, e.g. `172.21.9.34` for
    /// `client.4305 v1:172.21.9.34:0/422650892`.
    pub fn address(&self) -> GuardResult<String> {
        let malformed = || GuardError::MalformedDescriptor(self.inst.clone());
        let token = self.inst.split_whitespace().nth(1).ok_or_else(malformed)?;
        let re = ADDRESS_RE.as_ref().map_err(|e| GuardError::Regex(e.clone()))?;
        let caps = re.captures(token).ok_or_else(malformed)?;
        let literal = caps
            .get(1)
            .or_else(|| caps.get(2))
            .or_else(|| caps.get(3))
            .ok_or_else(malformed)?
            .as_str();
        let addr = literal.parse::<IpAddr>().map_err(|_| malformed())?;
        Ok(addr.to_string())
    }

    /// The numeric session id, e.g. `4305` for `client.4305 ...`.
    pub fn id(&self) -> GuardResult<u64> {
        let malformed = || GuardError::MalformedDescriptor(self.inst.clone());
        let (_, id) = self
            .inst
            .split_whitespace()
            .next()
            .and_then(|name| name.split_once('.'))
            .ok_or_else(malformed)?;
        id.parse::<u64>().map_err(|_| malformed())
    }
}

/// Lists and evicts CephFS client sessions held with the coordinating MDS.
#[derive(Clone, Debug)]
pub struct EvictionController {
    cli: CephCli,
    blocklist: BlocklistController,
}

impl EvictionController {
    pub(crate) fn new(cli: CephCli, blocklist: BlocklistController) -> EvictionController {
        EvictionController { cli, blocklist }
    }

    fn mds(&self) -> String {
        format!("mds.{}", self.cli.config().mds_rank)
    }

    /// Take a snapshot of the sessions known to the coordinating MDS. Every
    /// client holds a session with it, so one rank sees all of them.
    pub async fn list_sessions(&self, ctx: &Context) -> GuardResult<Vec<ActiveSession>> {
        let args = vec![
            "tell".to_string(),
            self.mds(),
            "client".to_string(),
            "ls".to_string(),
        ];
        let output = chain_err!(
            self.cli.run(ctx, &args).await,
            "Failed to list active clients"
        )?;
        serde_json::from_str(&output.stdout).map_err(|e| {
            GuardError::ProtocolError(format!("client list is not a JSON session array: {e}"))
        })
    }

    async fn evict(&self, ctx: &Context, id: u64) -> GuardResult<()> {
        let args = vec![
            "tell".to_string(),
            self.mds(),
            "client".to_string(),
            "evict".to_string(),
            format!("id={id}"),
        ];
        chain_err!(
            self.cli.run(ctx, &args).await,
            "Failed to evict client {}",
            id
        )?;
        Ok(())
    }

    /// Evict every session whose address lies in one of `ranges`, then
    /// block the ranges so that the evicted clients cannot reconnect.
    ///
    /// A session matching several ranges is evicted once. A session whose
    /// descriptor cannot be parsed is skipped. Returns the evicted
    /// addresses in eviction order.
    pub async fn evict_and_fence(
        &self,
        ctx: &Context,
        ranges: &[String],
    ) -> GuardResult<Vec<String>> {
        let sessions = self.list_sessions(ctx).await?;
        let mut evicted_ids = IndexSet::new();
        let mut evicted_addrs = IndexSet::new();

        for range in ranges {
            for session in &sessions {
                let address = match session.address() {
                    Ok(address) => address,
                    Err(err) => {
                        warn!("Skipping session during eviction: {err}");
                        continue;
                    }
                };
                if !address_in_range(&address, range) {
                    continue;
                }
                let id = match session.id() {
                    Ok(id) => id,
                    Err(err) => {
                        warn!("Skipping session at {address} during eviction: {err}");
                        continue;
                    }
                };
                if evicted_ids.contains(&id) {
                    continue;
                }
                self.evict(ctx, id).await?;
                info!("Evicted client {id} at {address}");
                evicted_ids.insert(id);
                evicted_addrs.insert(address);
            }
        }

        self.blocklist.add(ctx, ranges).await?;
        Ok(evicted_addrs.into_iter().collect())
    }

    /// Remove the range blocks, then every per-session entry that eviction
    /// left behind inside the ranges. The blocklist is read again rather
    /// than trusting what an earlier eviction reported.
    pub async fn remove_eviction(&self, ctx: &Context, ranges: &[String]) -> GuardResult<()> {
        self.blocklist.remove(ctx, ranges).await?;

        let entries = self.blocklist.list(ctx).await?;
        for range in ranges {
            let hosts = address_entries_in_range(&entries, range);
            debug!("Blocklist entries inside {range}: {hosts:?}");
            for (address, nonce) in hosts {
                self.blocklist.remove_address(ctx, &address, &nonce).await?;
            }
        }
        Ok(())
    }
}
