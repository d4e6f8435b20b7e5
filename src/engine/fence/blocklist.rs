// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use chrono::{DateTime, FixedOffset};
use strum_macros::Display;

use crate::{
    engine::{
        context::Context,
        fence::{
            cidr::{address_in_range, expand_cidr_within},
            CephCli,
        },
    },
    guard::{GuardError, GuardResult},
};

const EXPIRY_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f%z";

/// The single place where a cluster failure is recognized as "this cluster
/// does not know the command". No structured capability query exists for
/// blocklist ranges, so the text of the failure is all there is to go on.
pub fn is_unsupported_command(stderr: &str, marker: &str) -> bool {
    !marker.is_empty() && stderr.contains(marker)
}

/// The form of blocklist entry that an add or remove ended up using.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum BlocklistMode {
    #[strum(serialize = "range")]
    Range,
    #[strum(serialize = "per-address")]
    PerAddress,
}

/// One line of `ceph osd blocklist ls`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BlocklistEntry {
    Range {
        cidr: String,
        expires: Option<DateTime<FixedOffset>>,
    },
    Address {
        address: String,
        port: String,
        nonce: String,
        expires: Option<DateTime<FixedOffset>>,
    },
}

impl BlocklistEntry {
    pub fn expires(&self) -> Option<DateTime<FixedOffset>> {
        match self {
            BlocklistEntry::Range { expires, .. } | BlocklistEntry::Address { expires, .. } => {
                *expires
            }
        }
    }
}

/// Split `<ip>:<port>/<nonce>` at the last ':' before the '/'. Brackets
/// around an IPv6 address are removed.
fn parse_entity(entity: &str) -> Option<(String, String, String)> {
    let (ip_port, nonce) = entity.split_once('/')?;
    let (ip, port) = ip_port.rsplit_once(':')?;
    let ip = ip.trim_start_matches('[').trim_end_matches(']');
    if ip.is_empty() {
        return None;
    }
    Some((ip.to_string(), port.to_string(), nonce.to_string()))
}

/// Range entries are listed as `cidr:<ip>:<port>/<prefix>`.
fn parse_range_entity(entity: &str) -> Option<String> {
    let rest = entity.strip_prefix("cidr:")?;
    let (ip, _, prefix) = parse_entity(rest)?;
    Some(format!("{ip}/{prefix}"))
}

/// Parse the text of `ceph osd blocklist ls`. Lines that are neither range
/// nor address entries, such as the trailing entry count, are skipped.
pub fn parse_blocklist(text: &str) -> Vec<BlocklistEntry> {
    let mut entries = Vec::new();
    for line in text.lines().map(str::trim) {
        if !line.contains('/') {
            continue;
        }
        let mut fields = line.split_whitespace();
        let entity = match fields.next() {
            Some(entity) => entity,
            None => continue,
        };
        let expires = fields
            .next()
            .and_then(|s| DateTime::parse_from_str(s, EXPIRY_FORMAT).ok());

        if line.contains("cidr") {
            match parse_range_entity(entity) {
                Some(cidr) => entries.push(BlocklistEntry::Range { cidr, expires }),
                None => debug!("Skipping unrecognized blocklist range entry {line:?}"),
            }
        } else {
            match parse_entity(entity) {
                Some((address, port, nonce)) => entries.push(BlocklistEntry::Address {
                    address,
                    port,
                    nonce,
                    expires,
                }),
                None => debug!("Skipping unrecognized blocklist entry {line:?}"),
            }
        }
    }
    entries
}

/// The address entries that lie inside `cidr`, as (address, nonce) pairs.
/// Range entries are never included.
pub fn address_entries_in_range(entries: &[BlocklistEntry], cidr: &str) -> Vec<(String, String)> {
    entries
        .iter()
        .filter_map(|entry| match entry {
            BlocklistEntry::Address { address, nonce, .. } if address_in_range(address, cidr) => {
                Some((address.clone(), nonce.clone()))
            }
            _ => None,
        })
        .collect()
}

/// Format an address as a blocklist entity with port 0.
fn entity_addr(address: &str, nonce: &str) -> String {
    if address.contains(':') {
        format!("[{address}]:0/{nonce}")
    } else {
        format!("{address}:0/{nonce}")
    }
}

fn args(words: &[&str]) -> Vec<String> {
    words.iter().map(|w| w.to_string()).collect()
}

/// Adds and removes entries in the cluster's blocklist.
#[derive(Clone, Debug)]
pub struct BlocklistController {
    cli: CephCli,
}

impl BlocklistController {
    pub(crate) fn new(cli: CephCli) -> BlocklistController {
        BlocklistController { cli }
    }

    fn duration(&self) -> String {
        self.cli.config().blocklist_duration_secs.to_string()
    }

    async fn add_range(&self, ctx: &Context, cidr: &str) -> GuardResult<()> {
        let duration = self.duration();
        self.cli
            .run(ctx, &args(&["osd", "blocklist", "range", "add", cidr, &duration]))
            .await?;
        debug!("Blocklisted range {cidr}");
        Ok(())
    }

    async fn add_address(&self, ctx: &Context, address: &str) -> GuardResult<()> {
        let duration = self.duration();
        self.cli
            .run(ctx, &args(&["osd", "blocklist", "add", address, &duration]))
            .await?;
        debug!("Blocklisted address {address}");
        Ok(())
    }

    async fn remove_range(&self, ctx: &Context, cidr: &str) -> GuardResult<()> {
        self.cli
            .run(ctx, &args(&["osd", "blocklist", "range", "rm", cidr]))
            .await?;
        debug!("Removed blocklisted range {cidr}");
        Ok(())
    }

    /// Remove the entry for `address` with the given nonce, or the bare
    /// address if the nonce is empty.
    pub async fn remove_address(&self, ctx: &Context, address: &str, nonce: &str) -> GuardResult<()> {
        let entity = if nonce.is_empty() {
            address.to_string()
        } else {
            entity_addr(address, nonce)
        };
        self.cli
            .run(ctx, &args(&["osd", "blocklist", "rm", &entity]))
            .await?;
        debug!("Removed blocklisted address {entity}");
        Ok(())
    }

    /// Block every range. Range entries are tried first; the first range
    /// that the cluster rejects as an unknown command switches the rest of
    /// the call to one entry per address. Any other failure aborts the call
    /// with the ranges already applied left in place.
    pub async fn add(&self, ctx: &Context, ranges: &[String]) -> GuardResult<BlocklistMode> {
        let mut mode = BlocklistMode::Range;
        for range in ranges {
            if mode == BlocklistMode::Range {
                match self.add_range(ctx, range).await {
                    Ok(()) => continue,
                    Err(GuardError::UnsupportedCommand { cmd, .. }) => {
                        info!(
                            "Cluster does not support range blocklisting ({cmd}); blocklisting addresses individually"
                        );
                        mode = BlocklistMode::PerAddress;
                    }
                    Err(err) => {
                        return Err(GuardError::Chained(
                            format!("Failed to add blocklist range {range}"),
                            Box::new(err),
                        ))
                    }
                }
            }
            let limit = self.cli.config().max_expanded_host_bits;
            for address in expand_cidr_within(range, limit)? {
                self.add_address(ctx, &address).await?;
            }
        }
        Ok(mode)
    }

    /// Unblock every range, negotiating the entry form the same way `add`
    /// does. Per-address removal uses the configured placeholder nonce,
    /// which matches entries added without one.
    pub async fn remove(&self, ctx: &Context, ranges: &[String]) -> GuardResult<BlocklistMode> {
        let mut mode = BlocklistMode::Range;
        for range in ranges {
            if mode == BlocklistMode::Range {
                match self.remove_range(ctx, range).await {
                    Ok(()) => continue,
                    Err(GuardError::UnsupportedCommand { cmd, .. }) => {
                        info!(
                            "Cluster does not support range blocklisting ({cmd}); unblocking addresses individually"
                        );
                        mode = BlocklistMode::PerAddress;
                    }
                    Err(err) => {
                        return Err(GuardError::Chained(
                            format!("Failed to remove blocklist range {range}"),
                            Box::new(err),
                        ))
                    }
                }
            }
            let nonce = self.cli.config().removal_nonce.clone();
            let limit = self.cli.config().max_expanded_host_bits;
            for address in expand_cidr_within(range, limit)? {
                self.remove_address(ctx, &address, &nonce).await?;
            }
        }
        Ok(mode)
    }

    /// Read the cluster's current blocklist.
    pub async fn list(&self, ctx: &Context) -> GuardResult<Vec<BlocklistEntry>> {
        let output = chain_err!(
            self.cli.run(ctx, &args(&["osd", "blocklist", "ls"])).await,
            "Failed to get the cluster blocklist"
        )?;
        Ok(parse_blocklist(&output.stdout))
    }
}
