// Copyright (c) Contributors to the NAH project.
// SPDX-License-Identifier: Apache-2.0

//! Host profile: site policy and defaults applied to every composition on a
//! host.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};

use crate::warnings::{WarningAction, WarningKind};

#[cfg(test)]
#[path = "./profile_test.rs"]
mod profile_test;

pub const HOST_PROFILE_SCHEMA: &str = "nah.host.profile.v1";

/// How an application's bundle requirement is turned into a concrete bundle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindingMode {
    /// Highest installed version satisfying the requirement.
    #[default]
    Canonical,
    /// Operator-maintained table keyed by the requirement's selection key.
    Mapped,
}

/// Which bundle versions a host accepts, and how they are picked.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NakPolicy {
    #[serde(default)]
    pub binding_mode: BindingMode,

    /// Version patterns (`3.0.2` or `3.*`). Empty allows every version.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allow_versions: Vec<String>,

    /// Version patterns that are never accepted, even when allowed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deny_versions: Vec<String>,

    /// Selection key (`MAJOR.MINOR`) to runtime record reference.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub map: BTreeMap<String, String>,
}

fn version_pattern_matches(pattern: &str, version: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => version.starts_with(prefix),
        None => pattern == version,
    }
}

impl NakPolicy {
    /// Deny patterns win over allow patterns.
    pub fn version_allowed(&self, version: &str) -> bool {
        if self
            .deny_versions
            .iter()
            .any(|pattern| version_pattern_matches(pattern, version))
        {
            return false;
        }
        self.allow_versions.is_empty()
            || self
                .allow_versions
                .iter()
                .any(|pattern| version_pattern_matches(pattern, version))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfilePaths {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub library_prepend: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub library_append: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverrideMode {
    #[default]
    Allow,
    Deny,
    Allowlist,
}

/// Which overrides a host accepts from install records and invocations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverridePolicy {
    #[serde(default)]
    pub mode: OverrideMode,

    /// Accepted targets in `allowlist` mode: environment variable names, or
    /// `WARNINGS_<KEY>` for warning policy overrides.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allow_keys: Vec<String>,
}

impl OverridePolicy {
    pub fn permits(&self, target: &str) -> bool {
        match self.mode {
            OverrideMode::Allow => true,
            OverrideMode::Deny => false,
            OverrideMode::Allowlist => self.allow_keys.iter().any(|key| key == target),
        }
    }
}

/// Site-specific policy and defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostProfile {
    #[serde(default)]
    pub nak: NakPolicy,

    /// Environment defaults, applied below everything else.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,

    #[serde(default)]
    pub paths: ProfilePaths,

    /// Per-key warning policy. Keys not listed use their default action.
    #[serde(
        default,
        skip_serializing_if = "BTreeMap::is_empty",
        deserialize_with = "deserialize_warning_policy"
    )]
    pub warnings: BTreeMap<WarningKind, WarningAction>,

    /// Capability key (`filesystem.read`) to enforcement id.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub capabilities: BTreeMap<String, String>,

    #[serde(default)]
    pub overrides: OverridePolicy,

    /// Path to the file this was loaded from (not serialized).
    #[serde(skip)]
    pub source_path: Option<PathBuf>,
}

/// Warning keys and actions are matched case-insensitively.
fn deserialize_warning_policy<'de, D>(
    deserializer: D,
) -> Result<BTreeMap<WarningKind, WarningAction>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = BTreeMap::<String, String>::deserialize(deserializer)?;
    raw.into_iter()
        .map(|(key, action)| {
            let key = key.parse::<WarningKind>().map_err(D::Error::custom)?;
            let action = action.parse::<WarningAction>().map_err(D::Error::custom)?;
            Ok((key, action))
        })
        .collect()
}

impl HostProfile {
    /// Parse a host profile from JSON.
    pub fn from_json(json: &str) -> crate::Result<Self> {
        crate::document::from_json(json, "host profile", HOST_PROFILE_SCHEMA)
    }

    /// Load a host profile from file.
    pub fn load<P: AsRef<std::path::Path>>(path: P) -> crate::Result<Self> {
        let path = path.as_ref();
        let json = crate::document::read(path)?;
        let mut profile = Self::from_json(&json)?;
        profile.source_path = Some(path.to_path_buf());
        Ok(profile)
    }

    /// Where this profile came from, for traces and warnings.
    pub fn source_label(&self) -> String {
        self.source_path
            .as_ref()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "host_profile".to_string())
    }
}
