//! Scaling a recorded cluster.
//!
//! A scale request rewrites one host group of the recorded document and is
//! then applied like any other document. Count-driven providers scale by
//! count, statically addressed ones by address list.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use keel_common::hosts::parse_ip_list;
use keel_common::{diff, ClusterSpec, Error, Hosts, Result};

/// Host group being scaled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScaleRole {
    /// Control plane.
    Masters,
    /// Workers.
    Nodes,
}

impl fmt::Display for ScaleRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScaleRole::Masters => f.write_str("masters"),
            ScaleRole::Nodes => f.write_str("nodes"),
        }
    }
}

/// New size of a group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScaleValue {
    /// Target count, for count-driven providers.
    Count(u32),
    /// Full address list, for statically addressed providers.
    Ips(Vec<IpAddr>),
}

impl FromStr for ScaleValue {
    type Err = Error;

    /// `3` is a count; anything else is a comma-separated address list
    /// where entries may be `a-b` ranges.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()) {
            let count = s
                .parse()
                .map_err(|_| Error::parse("scale value", format!("count '{s}' is out of range")))?;
            return Ok(ScaleValue::Count(count));
        }
        let entries: Vec<&str> = s.split(',').map(str::trim).filter(|e| !e.is_empty()).collect();
        Ok(ScaleValue::Ips(parse_ip_list(&entries)?))
    }
}

/// One scale request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScaleTarget {
    /// Group to change.
    pub role: ScaleRole,
    /// Its new size.
    pub value: ScaleValue,
}

impl ScaleTarget {
    /// Request for `role`.
    pub fn new(role: ScaleRole, value: ScaleValue) -> Self {
        Self { role, value }
    }
}

/// The recorded document with `target` applied.
pub fn scaled(recorded: &ClusterSpec, target: &ScaleTarget) -> Result<ClusterSpec> {
    let name = recorded.name().to_string();
    let provider = recorded.spec.provider;
    let mut desired = recorded.clone();
    let (group, field): (&mut Hosts, &str) = match target.role {
        ScaleRole::Masters => (&mut desired.spec.masters, "spec.masters"),
        ScaleRole::Nodes => (&mut desired.spec.nodes, "spec.nodes"),
    };

    match &target.value {
        ScaleValue::Count(count) => {
            if !provider.count_authoritative() {
                return Err(Error::validation_for_field(
                    &name,
                    field,
                    format!("{provider} hosts are scaled by address list, not count"),
                ));
            }
            if target.role == ScaleRole::Masters && *count == 0 {
                return Err(Error::validation_for_field(
                    &name,
                    field,
                    "master count must be at least 1",
                ));
            }
            group.count = Some(*count);
        }
        ScaleValue::Ips(ips) => {
            if provider.count_authoritative() {
                return Err(Error::validation_for_field(
                    &name,
                    field,
                    format!("{provider} hosts are scaled by count, not address list"),
                ));
            }
            if target.role == ScaleRole::Masters && ips.is_empty() {
                return Err(Error::validation_for_field(
                    &name,
                    field,
                    "at least one master is required",
                ));
            }
            *group = Hosts::from_ips(ips.iter().copied());
        }
    }

    if target.role == ScaleRole::Masters && !provider.count_authoritative() {
        let changes = diff(recorded.masters(), desired.masters());
        if !changes.join.is_empty() && !changes.delete.is_empty() {
            return Err(Error::validation_for_field(
                &name,
                "spec.masters",
                "cannot add and remove masters in one scale operation",
            ));
        }
    }
    Ok(desired)
}
