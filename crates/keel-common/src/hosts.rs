//! Host set arithmetic.
//!
//! Host groups are sets of addresses: order is irrelevant and duplicates
//! collapse. Results keep first-appearance order so the same inputs always
//! produce the same plan.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};

use serde::{Deserialize, Deserializer};

use crate::{Error, Result};

/// Hosts to add and remove to move from one host set to another.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HostDiff {
    /// Present in the new set only.
    pub join: Vec<IpAddr>,
    /// Present in the old set only.
    pub delete: Vec<IpAddr>,
}

impl HostDiff {
    /// True when neither side has work.
    pub fn is_empty(&self) -> bool {
        self.join.is_empty() && self.delete.is_empty()
    }
}

/// Compute `(new \ old, old \ new)`.
///
/// Addresses in both sets contribute to neither side. Duplicates within one
/// list are reported at most once.
pub fn diff(old: &[IpAddr], new: &[IpAddr]) -> HostDiff {
    let old_set: HashSet<&IpAddr> = old.iter().collect();
    let new_set: HashSet<&IpAddr> = new.iter().collect();

    HostDiff {
        join: difference(new, &old_set),
        delete: difference(old, &new_set),
    }
}

fn difference(from: &[IpAddr], without: &HashSet<&IpAddr>) -> Vec<IpAddr> {
    let mut seen = HashSet::new();
    from.iter()
        .filter(|ip| !without.contains(ip) && seen.insert(**ip))
        .copied()
        .collect()
}

/// Remove duplicates, keeping the first occurrence.
pub fn dedup(ips: &[IpAddr]) -> Vec<IpAddr> {
    let mut seen = HashSet::new();
    ips.iter().filter(|ip| seen.insert(**ip)).copied().collect()
}

/// Parse an address list where entries may be inclusive IPv4 ranges.
///
/// `10.0.0.2-10.0.0.4` expands to three addresses. The result is deduplicated.
pub fn parse_ip_list<S: AsRef<str>>(entries: &[S]) -> Result<Vec<IpAddr>> {
    let mut out = Vec::new();
    for entry in entries {
        let entry = entry.as_ref().trim();
        if entry.is_empty() {
            continue;
        }
        match entry.split_once('-') {
            Some((start, end)) => out.extend(expand_range(start.trim(), end.trim())?),
            None => out.push(parse_ip(entry)?),
        }
    }
    Ok(dedup(&out))
}

fn parse_ip(s: &str) -> Result<IpAddr> {
    s.parse()
        .map_err(|_| Error::validation(format!("invalid IP address '{s}'")))
}

fn expand_range(start: &str, end: &str) -> Result<Vec<IpAddr>> {
    let (start, end) = match (parse_ip(start)?, parse_ip(end)?) {
        (IpAddr::V4(s), IpAddr::V4(e)) => (u32::from(s), u32::from(e)),
        _ => {
            return Err(Error::validation(format!(
                "IP ranges are only supported for IPv4: {start}-{end}"
            )))
        }
    };
    if start > end {
        return Err(Error::validation(format!(
            "IP range start {} is after end {}",
            Ipv4Addr::from(start),
            Ipv4Addr::from(end)
        )));
    }
    Ok((start..=end).map(|n| IpAddr::V4(Ipv4Addr::from(n))).collect())
}

/// Serde adapter so `ipList` accepts ranges in the persisted document.
pub fn deserialize_ip_list<'de, D>(deserializer: D) -> std::result::Result<Vec<IpAddr>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Vec<String> = Vec::deserialize(deserializer)?;
    parse_ip_list(&raw).map_err(serde::de::Error::custom)
}
