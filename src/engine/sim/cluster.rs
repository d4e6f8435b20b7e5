// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{collections::BTreeMap, net::IpAddr, sync::Mutex, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    engine::{
        cmd::{display_cmd, CommandGateway, CommandOutput, CEPH},
        context::Context,
        fence::CidrBlock,
        sim::{failure, locked, stdout},
    },
    guard::GuardResult,
};

const EINVAL: i32 = 22;
const INVALID_COMMAND: &str = "Error EINVAL: invalid command";
/// Longest blocklist duration the sim accepts, about ten years.
const MAX_DURATION_SECS: i64 = 315_569_520;

#[derive(Debug)]
struct Session {
    id: Option<u64>,
    inst: String,
}

#[derive(Debug, Default)]
struct ClusterState {
    ranges: BTreeMap<String, DateTime<Utc>>,
    addresses: BTreeMap<(String, String), DateTime<Utc>>,
    sessions: Vec<Session>,
    /// Replaces the generated `client ls` output when set.
    session_listing: Option<String>,
    evicted: Vec<u64>,
    commands: Vec<String>,
    failures: Vec<(String, String)>,
}

/// A cluster that keeps a blocklist and an MDS session table, driven
/// through the same `ceph` commands as a real one.
///
/// A cluster that is not range capable rejects `osd blocklist range`
/// commands the way releases without range support do.
#[derive(Debug)]
pub struct SimCluster {
    range_capable: bool,
    state: Mutex<ClusterState>,
}

/// Split a blocklist entity `<ip>:<port>/<nonce>` or a bare address into
/// a canonical address and nonce. A bare address has nonce "0".
fn split_entity(entity: &str) -> Option<(String, String)> {
    let (address, nonce) = match entity.rsplit_once('/') {
        Some((ip_port, nonce)) => {
            let (ip, _) = ip_port.rsplit_once(':')?;
            (ip, nonce)
        }
        None => (entity, "0"),
    };
    let address = match address.strip_prefix('v').and_then(|s| s.split_once(':')) {
        Some((version, rest)) if version.chars().all(|c| c.is_ascii_digit()) => rest,
        _ => address,
    };
    let address = address
        .trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .ok()?;
    Some((address.to_string(), nonce.to_string()))
}

fn format_addr(address: &str) -> String {
    if address.contains(':') {
        format!("[{address}]")
    } else {
        address.to_string()
    }
}

fn expiry(duration: Option<&str>) -> DateTime<Utc> {
    let secs = duration
        .and_then(|d| d.parse::<i64>().ok())
        .unwrap_or(3600)
        .clamp(0, MAX_DURATION_SECS);
    Utc::now() + chrono::Duration::seconds(secs)
}

fn format_expiry(expires: &DateTime<Utc>) -> String {
    expires.format("%Y-%m-%dT%H:%M:%S%.6f%z").to_string()
}

impl SimCluster {
    pub fn new(range_capable: bool) -> SimCluster {
        SimCluster {
            range_capable,
            state: Mutex::new(ClusterState::default()),
        }
    }

    pub fn add_session(&self, id: u64, address: &str) {
        locked(&self.state).sessions.push(Session {
            id: Some(id),
            inst: format!("client.{id} {address}"),
        });
    }

    /// Add a session whose descriptor is `inst` verbatim.
    pub fn add_raw_session(&self, inst: &str) {
        locked(&self.state).sessions.push(Session {
            id: None,
            inst: inst.to_string(),
        });
    }

    pub fn set_session_listing(&self, listing: &str) {
        locked(&self.state).session_listing = Some(listing.to_string());
    }

    /// Make every command whose text contains `pattern` fail with `stderr`.
    pub fn fail_commands_matching(&self, pattern: &str, stderr: &str) {
        locked(&self.state)
            .failures
            .push((pattern.to_string(), stderr.to_string()));
    }

    pub fn blocklisted_ranges(&self) -> Vec<String> {
        locked(&self.state).ranges.keys().cloned().collect()
    }

    /// Address entries as (address, nonce) pairs.
    pub fn blocklisted_addresses(&self) -> Vec<(String, String)> {
        locked(&self.state).addresses.keys().cloned().collect()
    }

    /// Ids of evicted sessions, in eviction order.
    pub fn evicted(&self) -> Vec<u64> {
        locked(&self.state).evicted.clone()
    }

    /// Every command received, without the authentication arguments.
    pub fn commands(&self) -> Vec<String> {
        locked(&self.state).commands.clone()
    }

    fn listing(state: &ClusterState) -> String {
        let mut out = String::new();
        for ((address, nonce), expires) in &state.addresses {
            out.push_str(&format!(
                "{}:0/{nonce} {}\n",
                format_addr(address),
                format_expiry(expires)
            ));
        }
        for (cidr, expires) in &state.ranges {
            let (ip, prefix) = cidr.split_once('/').unwrap_or((cidr, ""));
            out.push_str(&format!(
                "cidr:{}:0/{prefix} {}\n",
                format_addr(ip),
                format_expiry(expires)
            ));
        }
        out.push_str(&format!(
            "listed {} entries\n",
            state.addresses.len() + state.ranges.len()
        ));
        out
    }

    fn sessions_json(state: &ClusterState) -> String {
        let sessions: Vec<_> = state
            .sessions
            .iter()
            .map(|s| match s.id {
                Some(id) => json!({"id": id, "inst": s.inst, "state": "open"}),
                None => json!({"inst": s.inst, "state": "open"}),
            })
            .collect();
        serde_json::Value::Array(sessions).to_string()
    }

    fn evict(state: &mut ClusterState, id: u64) {
        let pos = match state.sessions.iter().position(|s| s.id == Some(id)) {
            Some(pos) => pos,
            None => return,
        };
        let session = state.sessions.remove(pos);
        state.evicted.push(id);
        // Eviction blocklists the session's own entity.
        if let Some((address, nonce)) = session
            .inst
            .split_whitespace()
            .nth(1)
            .and_then(split_entity)
        {
            state
                .addresses
                .insert((address, nonce), expiry(None));
        }
    }

    fn apply(&self, cmd: &str, words: &[&str]) -> GuardResult<CommandOutput> {
        let mut state = locked(&self.state);
        let line = words.join(" ");
        state.commands.push(line.clone());
        if let Some((_, stderr)) = state.failures.iter().find(|(p, _)| line.contains(p.as_str())) {
            return Err(failure(cmd, 1, stderr));
        }

        match words {
            ["osd", "blocklist", "range", ..] if !self.range_capable => {
                Err(failure(cmd, EINVAL, INVALID_COMMAND))
            }
            ["osd", "blocklist", "range", "add", cidr, rest @ ..] => {
                if CidrBlock::parse(cidr).is_err() {
                    return Err(failure(cmd, EINVAL, "Error EINVAL: invalid range"));
                }
                let expires = expiry(rest.first().copied());
                state.ranges.insert(cidr.to_string(), expires);
                Ok(stdout(format!("blocklisting cidr:{cidr}")))
            }
            ["osd", "blocklist", "range", "rm", cidr] => {
                state.ranges.remove(*cidr);
                Ok(stdout(format!("un-blocklisting cidr:{cidr}")))
            }
            ["osd", "blocklist", "add", entity, rest @ ..] => match split_entity(entity) {
                Some(key) => {
                    let expires = expiry(rest.first().copied());
                    state.addresses.insert(key, expires);
                    Ok(stdout(format!("blocklisting {entity}")))
                }
                None => Err(failure(cmd, EINVAL, "Error EINVAL: invalid entity")),
            },
            ["osd", "blocklist", "rm", entity] => match split_entity(entity) {
                Some(key) => {
                    state.addresses.remove(&key);
                    Ok(stdout(format!("un-blocklisting {entity}")))
                }
                None => Err(failure(cmd, EINVAL, "Error EINVAL: invalid entity")),
            },
            ["osd", "blocklist", "ls"] => Ok(stdout(SimCluster::listing(&state))),
            ["tell", _mds, "client", "ls"] => {
                let listing = match &state.session_listing {
                    Some(listing) => listing.clone(),
                    None => SimCluster::sessions_json(&state),
                };
                Ok(stdout(listing))
            }
            ["tell", _mds, "client", "evict", filter] => {
                let id = filter
                    .strip_prefix("id=")
                    .and_then(|id| id.parse::<u64>().ok());
                match id {
                    Some(id) => {
                        SimCluster::evict(&mut state, id);
                        Ok(CommandOutput::default())
                    }
                    None => Err(failure(cmd, EINVAL, "Error EINVAL: invalid filter")),
                }
            }
            _ => Err(failure(cmd, EINVAL, INVALID_COMMAND)),
        }
    }
}

#[async_trait]
impl CommandGateway for SimCluster {
    async fn execute(
        &self,
        ctx: &Context,
        _timeout: Duration,
        program: &str,
        args: &[String],
        _stdin: Option<&[u8]>,
    ) -> GuardResult<CommandOutput> {
        ctx.check()?;
        let cmd = display_cmd(program, args);
        if program != CEPH {
            return Err(failure(&cmd, 2, "No such file or directory"));
        }
        let end = args.iter().position(|a| a == "--id").unwrap_or(args.len());
        let words: Vec<&str> = args[..end].iter().map(String::as_str).collect();
        self.apply(&cmd, &words)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_entity() {
        assert_eq!(
            split_entity("10.0.0.5:0/77"),
            Some(("10.0.0.5".to_string(), "77".to_string()))
        );
        assert_eq!(
            split_entity("[2001:db8::7]:0/0"),
            Some(("2001:db8::7".to_string(), "0".to_string()))
        );
        assert_eq!(
            split_entity("v1:10.0.0.5:0/1"),
            Some(("10.0.0.5".to_string(), "1".to_string()))
        );
        assert_eq!(
            split_entity("10.0.0.6"),
            Some(("10.0.0.6".to_string(), "0".to_string()))
        );
        assert_eq!(split_entity("garbage"), None);
    }

    #[tokio::test]
    async fn test_listing_parses_back() {
        let cluster = SimCluster::new(true);
        let ctx = Context::background();
        for args in [
            vec!["osd", "blocklist", "add", "10.0.0.5:0/77", "60"],
            vec!["osd", "blocklist", "range", "add", "10.1.0.0/16", "60"],
        ] {
            let args: Vec<String> = args.into_iter().map(String::from).collect();
            cluster
                .execute(&ctx, Duration::from_secs(1), CEPH, &args, None)
                .await
                .unwrap();
        }
        let out = cluster
            .execute(
                &ctx,
                Duration::from_secs(1),
                CEPH,
                &["osd".to_string(), "blocklist".to_string(), "ls".to_string()],
                None,
            )
            .await
            .unwrap();
        let entries = crate::engine::fence::parse_blocklist(&out.stdout);
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.expires().is_some()));
    }
}
