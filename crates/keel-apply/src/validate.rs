//! Checks that must pass before anything is planned.
//!
//! Structural checks live on the document itself; the ones here need the
//! previous record or the observed cluster.

use std::net::IpAddr;

use keel_common::{diff, ClusterCurrent, ClusterSpec, Error, Result};

/// Validate a desired document against what is recorded and running.
pub fn validate(
    desired: &ClusterSpec,
    previous: Option<&ClusterSpec>,
    current: Option<&ClusterCurrent>,
) -> Result<()> {
    desired.validate()?;
    if desired.is_deleting() {
        return Ok(());
    }

    let name = desired.name();
    if desired.masters().is_empty() {
        return Err(Error::validation_for_field(
            name,
            "spec.masters.ipList",
            "at least one master is required",
        ));
    }

    let Some(current) = current else {
        return Ok(());
    };

    let masters = diff(&current.masters, desired.masters());
    if !masters.join.is_empty() && !masters.delete.is_empty() {
        return Err(Error::validation_for_field(
            name,
            "spec.masters",
            format!(
                "cannot add masters [{}] and remove masters [{}] in one pass",
                list(&masters.join),
                list(&masters.delete)
            ),
        ));
    }

    let master0 = previous
        .and_then(ClusterSpec::master0)
        .or_else(|| current.masters.first().copied());
    if let Some(master0) = master0 {
        if masters.delete.contains(&master0) {
            return Err(Error::validation_for_field(
                name,
                "spec.masters",
                format!("master0 {master0} cannot be removed"),
            ));
        }
    }
    Ok(())
}

fn list(ips: &[IpAddr]) -> String {
    ips.iter()
        .map(IpAddr::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
