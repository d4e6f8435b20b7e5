// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{
    fmt::{self, Display},
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
};

use crate::guard::{GuardError, GuardResult};

/// A parsed CIDR block, with the base address already masked to the
/// network boundary.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct CidrBlock {
    network: IpAddr,
    prefix_len: u8,
}

fn invalid(range: &str, reason: impl Into<String>) -> GuardError {
    GuardError::InvalidRange {
        range: range.to_string(),
        reason: reason.into(),
    }
}

fn octets(addr: &IpAddr) -> Vec<u8> {
    match addr {
        IpAddr::V4(a) => a.octets().to_vec(),
        IpAddr::V6(a) => a.octets().to_vec(),
    }
}

fn from_octets(is_v4: bool, bytes: &[u8]) -> IpAddr {
    if is_v4 {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(bytes);
        IpAddr::V4(Ipv4Addr::from(buf))
    } else {
        let mut buf = [0u8; 16];
        buf.copy_from_slice(bytes);
        IpAddr::V6(Ipv6Addr::from(buf))
    }
}

/// Zero every bit past the first `prefix_len` bits.
fn mask(bytes: &mut [u8], prefix_len: u8) {
    let prefix_len = usize::from(prefix_len);
    for (i, byte) in bytes.iter_mut().enumerate() {
        let start = i * 8;
        if start >= prefix_len {
            *byte = 0;
        } else if start + 8 > prefix_len {
            let keep = prefix_len - start;
            *byte &= 0xffu8 << (8 - keep);
        }
    }
}

/// Increment a big-endian byte vector by one. Returns false if the value
/// wrapped around to zero.
fn increment(bytes: &mut [u8]) -> bool {
    for byte in bytes.iter_mut().rev() {
        *byte = byte.wrapping_add(1);
        if *byte != 0 {
            return true;
        }
    }
    false
}

impl CidrBlock {
    /// Parse `<address>/<prefix length>`. The address need not be the
    /// network address; host bits are masked off.
    pub fn parse(cidr: &str) -> GuardResult<CidrBlock> {
        let (addr, prefix) = cidr
            .trim()
            .split_once('/')
            .ok_or_else(|| invalid(cidr, "missing '/<prefix length>'"))?;
        let addr = addr
            .parse::<IpAddr>()
            .map_err(|e| invalid(cidr, format!("bad address: {e}")))?;
        let prefix_len = prefix
            .parse::<u8>()
            .map_err(|e| invalid(cidr, format!("bad prefix length: {e}")))?;
        let max = if addr.is_ipv4() { 32 } else { 128 };
        if prefix_len > max {
            return Err(invalid(
                cidr,
                format!("prefix length {prefix_len} exceeds {max}"),
            ));
        }

        let mut bytes = octets(&addr);
        mask(&mut bytes, prefix_len);
        Ok(CidrBlock {
            network: from_octets(addr.is_ipv4(), &bytes),
            prefix_len,
        })
    }

    pub fn network(&self) -> IpAddr {
        self.network
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    fn host_bits(&self) -> u32 {
        let width = if self.network.is_ipv4() { 32 } else { 128 };
        width - u32::from(self.prefix_len)
    }

    /// Whether `addr` lies inside this block. An IPv4-mapped IPv6 address
    /// is compared as the IPv4 address it carries.
    pub fn contains(&self, addr: &IpAddr) -> bool {
        let addr = match (self.network, addr) {
            (IpAddr::V4(_), IpAddr::V6(v6)) => match v6.to_ipv4_mapped() {
                Some(v4) => IpAddr::V4(v4),
                None => return false,
            },
            (IpAddr::V6(_), IpAddr::V4(_)) => return false,
            _ => *addr,
        };
        let mut bytes = octets(&addr);
        mask(&mut bytes, self.prefix_len);
        bytes == octets(&self.network)
    }

    /// Every address inside the block in ascending order, network and
    /// broadcast addresses included.
    pub fn hosts(&self) -> CidrHosts {
        CidrHosts {
            block: *self,
            next: Some(octets(&self.network)),
        }
    }
}

impl Display for CidrBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix_len)
    }
}

/// Iterator over the addresses of a CIDR block.
#[derive(Debug)]
pub struct CidrHosts {
    block: CidrBlock,
    next: Option<Vec<u8>>,
}

impl Iterator for CidrHosts {
    type Item = IpAddr;

    fn next(&mut self) -> Option<IpAddr> {
        let mut bytes = self.next.take()?;
        let addr = from_octets(self.block.network.is_ipv4(), &bytes);
        if !self.block.contains(&addr) {
            return None;
        }
        if increment(&mut bytes) {
            self.next = Some(bytes);
        }
        Some(addr)
    }
}

/// Expand a CIDR block into the text form of every address inside it.
pub fn expand_cidr(cidr: &str) -> GuardResult<Vec<String>> {
    let block = CidrBlock::parse(cidr)?;
    Ok(block.hosts().map(|addr| addr.to_string()).collect())
}

/// Like `expand_cidr`, but refuse a block with more than `max_host_bits`
/// host bits instead of materializing it.
pub fn expand_cidr_within(cidr: &str, max_host_bits: u32) -> GuardResult<Vec<String>> {
    let block = CidrBlock::parse(cidr)?;
    if block.host_bits() > max_host_bits {
        return Err(invalid(
            cidr,
            format!(
                "range has {} host bits; at most {max_host_bits} can be expanded",
                block.host_bits()
            ),
        ));
    }
    Ok(block.hosts().map(|addr| addr.to_string()).collect())
}

/// Whether the address literal `address` lies inside `cidr`. Either side
/// failing to parse means no match.
pub fn address_in_range(address: &str, cidr: &str) -> bool {
    let block = match CidrBlock::parse(cidr) {
        Ok(b) => b,
        Err(e) => {
            warn!("Not matching {address} against range: {e}");
            return false;
        }
    };
    match address.trim().parse::<IpAddr>() {
        Ok(addr) => block.contains(&addr),
        Err(e) => {
            warn!("Not matching address {address:?} against range {cidr}: {e}");
            false
        }
    }
}
