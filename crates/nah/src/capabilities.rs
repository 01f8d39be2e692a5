// Copyright (c) Contributors to the NAH project.
// SPDX-License-Identifier: Apache-2.0

//! Mapping declared permissions to capabilities and host enforcement ids.

use std::collections::BTreeMap;

use crate::contract::{CapabilityUsage, EnforcementSection};
use crate::manifest::Permissions;
use crate::warnings::{Warning, WarningCollector};

#[cfg(test)]
#[path = "./capabilities_test.rs"]
mod capabilities_test;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityDomain {
    Filesystem,
    Network,
}

impl CapabilityDomain {
    pub fn as_str(&self) -> &'static str {
        match self {
            CapabilityDomain::Filesystem => "filesystem",
            CapabilityDomain::Network => "network",
        }
    }

    fn for_operation(operation: &str) -> Option<Self> {
        match operation {
            "read" | "write" | "execute" => Some(CapabilityDomain::Filesystem),
            "connect" | "listen" | "bind" => Some(CapabilityDomain::Network),
            _ => None,
        }
    }
}

/// A permission such as `read:/data` understood as `filesystem.read`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capability {
    pub domain: CapabilityDomain,
    pub operation: String,
    pub resource: String,
}

impl Capability {
    /// The key used in the host's capability map, e.g. `network.connect`.
    pub fn key(&self) -> String {
        format!("{}.{}", self.domain.as_str(), self.operation)
    }
}

/// Parse `operation:resource`, reporting why a permission was not understood.
pub fn parse_permission(permission: &str, warnings: &mut WarningCollector) -> Option<Capability> {
    let Some((operation, resource)) = permission.split_once(':') else {
        warnings.emit(Warning::CapabilityMalformed {
            permission: permission.to_string(),
        });
        return None;
    };
    let operation = operation.trim();
    let Some(domain) = CapabilityDomain::for_operation(operation) else {
        warnings.emit(Warning::CapabilityUnknown {
            permission: permission.to_string(),
            operation: operation.to_string(),
        });
        return None;
    };
    Some(Capability {
        domain,
        operation: operation.to_string(),
        resource: resource.to_string(),
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilityReport {
    pub usage: CapabilityUsage,
    pub enforcement: EnforcementSection,
    pub decisions: Vec<String>,
}

/// Derive the capabilities behind `permissions` and look each one up in the
/// host's `enforcement` map.
///
/// A capability the host has no mapping for is noted in the decisions only.
pub fn derive_capabilities(
    permissions: &Permissions,
    enforcement: &BTreeMap<String, String>,
    warnings: &mut WarningCollector,
) -> CapabilityReport {
    let mut report = CapabilityReport::default();
    report.usage.present = !permissions.is_empty();

    for permission in permissions.iter() {
        let Some(capability) = parse_permission(permission, warnings) else {
            continue;
        };
        let key = capability.key();
        if report.usage.required_capabilities.contains(&key) {
            continue;
        }

        match enforcement.get(&key) {
            Some(id) => {
                let ids = match capability.domain {
                    CapabilityDomain::Filesystem => &mut report.enforcement.filesystem,
                    CapabilityDomain::Network => &mut report.enforcement.network,
                };
                if !ids.contains(id) {
                    ids.push(id.clone());
                }
                report.decisions.push(format!("capability {key} enforced by {id}"));
            }
            None => report
                .decisions
                .push(format!("capability {key} has no enforcement mapping")),
        }
        report.usage.required_capabilities.push(key);
    }
    report
}
