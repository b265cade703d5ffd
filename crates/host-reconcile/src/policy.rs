//! Role conflict policy
//!
//! A declarative table from role to the units that must be stopped, disabled
//! and masked on a host with that role. The table is only ever evaluated
//! against the role being applied now; units masked under an earlier role are
//! unmasked by the lifecycle manager when they become canonical again.

use crate::product::Role;
use std::collections::BTreeMap;

const SERVER_CONFLICTS: &[&str] = &[
    "snapserver.service",
    "snapcast-server.service",
    "snapfleet-client.service",
    "snapclient.service",
    "snapcast-client.service",
];

const CLIENT_CONFLICTS: &[&str] = &[
    "snapclient.service",
    "snapcast-client.service",
    "snapfleet-server.service",
    "snapserver.service",
    "snapcast-server.service",
];

// Combined hosts keep both managed units; only distro and legacy units go
const COMBINED_CONFLICTS: &[&str] = &[
    "snapserver.service",
    "snapcast-server.service",
    "snapclient.service",
    "snapcast-client.service",
];

/// Role to conflicting-unit table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleConflictPolicy {
    table: BTreeMap<Role, Vec<String>>,
}

impl Default for RoleConflictPolicy {
    fn default() -> Self {
        Self::from_table([
            (Role::Server, SERVER_CONFLICTS),
            (Role::Client, CLIENT_CONFLICTS),
            (Role::Combined, COMBINED_CONFLICTS),
        ])
    }
}

impl RoleConflictPolicy {
    /// Build a policy from explicit rows
    pub fn from_table<'a, I>(rows: I) -> Self
    where
        I: IntoIterator<Item = (Role, &'a [&'a str])>,
    {
        let table = rows
            .into_iter()
            .map(|(role, units)| (role, units.iter().map(|u| u.to_string()).collect()))
            .collect();
        Self { table }
    }

    /// Units that must be neutralised for `role`, in order
    ///
    /// The role's own canonical units are never listed.
    pub fn conflicts(&self, role: Role) -> Vec<&str> {
        let canonical: Vec<&str> = role
            .components()
            .iter()
            .map(|c| c.canonical_unit())
            .collect();
        self.table
            .get(&role)
            .map(|units| {
                units
                    .iter()
                    .map(String::as_str)
                    .filter(|u| !canonical.contains(u))
                    .collect()
            })
            .unwrap_or_default()
    }
}
