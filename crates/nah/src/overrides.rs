// Copyright (c) Contributors to the NAH project.
// SPDX-License-Identifier: Apache-2.0

//! Overrides supplied at launch through `NAH_OVERRIDE_*` variables or an
//! overrides file.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::environment::{EnvOp, SourceKind};
use crate::profile::OverridePolicy;
use crate::warnings::{Warning, WarningAction, WarningCollector, WarningKind};

#[cfg(test)]
#[path = "./overrides_test.rs"]
mod overrides_test;

pub const OVERRIDE_PREFIX: &str = "NAH_OVERRIDE_";
/// Target name for environment overrides.
pub const ENVIRONMENT_TARGET: &str = "ENVIRONMENT";
/// Target prefix for warning policy overrides.
pub const WARNINGS_TARGET_PREFIX: &str = "WARNINGS_";

/// Target reported when an overrides file cannot be used.
pub const FILE_TARGET: &str = "OVERRIDES_FILE";

/// Raw overrides as found in a launcher's environment, plus an optional
/// overrides file.
///
/// Nothing is validated until [`OverrideSet::apply`], so that problems are
/// reported through the composition's warnings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OverrideSet {
    /// Target (the part after `NAH_OVERRIDE_`) to raw value.
    targets: BTreeMap<String, String>,
    file: Option<RawFile>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct RawFile {
    source_path: String,
    content: String,
}

/// The overrides file document:
/// `{"environment": {"K": "V"}, "warnings": {"trust_state_unknown": "ignore"}}`.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct OverridesFile {
    #[serde(default)]
    environment: BTreeMap<String, EnvOp>,

    #[serde(default)]
    warnings: BTreeMap<String, String>,
}

impl OverrideSet {
    /// Collect every `NAH_OVERRIDE_*` variable from `vars`.
    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let targets = vars
            .into_iter()
            .filter_map(|(name, value)| {
                let target = name.as_ref().strip_prefix(OVERRIDE_PREFIX)?;
                Some((target.to_string(), value.into()))
            })
            .collect();
        Self {
            targets,
            file: None,
        }
    }

    /// Add the content of an overrides file, applied after the variables.
    pub fn with_file(
        mut self,
        source_path: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        self.file = Some(RawFile {
            source_path: source_path.into(),
            content: content.into(),
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty() && self.file.is_none()
    }

    pub fn insert(&mut self, target: impl Into<String>, value: impl Into<String>) {
        self.targets.insert(target.into(), value.into());
    }

    /// Apply warning overrides to `warnings` and return the environment
    /// operations the host accepts.
    ///
    /// File entries come after the variables, so a file value wins.
    pub fn apply(
        &self,
        policy: &OverridePolicy,
        warnings: &mut WarningCollector,
    ) -> Vec<(String, EnvOp)> {
        // policy changes first, so they cover everything reported below
        for (target, value) in &self.targets {
            if let Some(key) = target.strip_prefix(WARNINGS_TARGET_PREFIX) {
                apply_warning_override(target, key, value, policy, warnings);
            }
        }
        let file = self.parse_file(warnings);
        if let Some(file) = &file {
            for (key, value) in &file.warnings {
                let target = format!("{WARNINGS_TARGET_PREFIX}{}", key.to_ascii_uppercase());
                apply_warning_override(&target, key, value, policy, warnings);
            }
        }

        let mut environment = Vec::new();
        for (target, value) in &self.targets {
            if target == ENVIRONMENT_TARGET {
                environment = self.parse_environment(value, policy, warnings);
            } else if !target.starts_with(WARNINGS_TARGET_PREFIX) {
                warnings.emit(Warning::OverrideInvalid {
                    target: target.clone(),
                    reason: "unknown_target".to_string(),
                });
            }
        }
        if let Some(file) = file {
            environment.extend(filter_environment(
                file.environment.into_iter().collect(),
                policy,
                SourceKind::InvocationOverride,
                warnings,
            ));
        }
        environment
    }

    fn parse_file(&self, warnings: &mut WarningCollector) -> Option<OverridesFile> {
        let raw = self.file.as_ref()?;
        match serde_json::from_str::<OverridesFile>(&raw.content) {
            Ok(file) => Some(file),
            Err(err) => {
                let reason = if err.is_data() {
                    "invalid_shape"
                } else {
                    "parse_failure"
                };
                tracing::debug!(path = %raw.source_path, "unusable overrides file: {err}");
                warnings.emit(Warning::OverrideInvalid {
                    target: FILE_TARGET.to_string(),
                    reason: reason.to_string(),
                });
                None
            }
        }
    }

    fn parse_environment(
        &self,
        raw: &str,
        policy: &OverridePolicy,
        warnings: &mut WarningCollector,
    ) -> Vec<(String, EnvOp)> {
        let parsed = match serde_json::from_str::<BTreeMap<String, serde_json::Value>>(raw) {
            Ok(parsed) => parsed,
            Err(err) => {
                warnings.emit(Warning::OverrideInvalid {
                    target: ENVIRONMENT_TARGET.to_string(),
                    reason: format!("invalid_json: {err}"),
                });
                return Vec::new();
            }
        };

        let mut entries = Vec::new();
        for (key, value) in parsed {
            match serde_json::from_value::<EnvOp>(value) {
                Ok(op) => entries.push((key, op)),
                Err(_) => {
                    warnings.emit(Warning::OverrideInvalid {
                        target: key,
                        reason: "invalid_value".to_string(),
                    });
                }
            }
        }
        filter_environment(entries, policy, SourceKind::InvocationOverride, warnings)
    }
}

fn apply_warning_override(
    target: &str,
    key: &str,
    value: &str,
    policy: &OverridePolicy,
    warnings: &mut WarningCollector,
) {
    if !policy.permits(target) {
        warnings.emit(Warning::OverrideDenied {
            target: target.to_string(),
            source_kind: SourceKind::InvocationOverride.to_string(),
        });
        return;
    }
    let Ok(kind) = key.parse::<WarningKind>() else {
        warnings.emit(Warning::OverrideInvalid {
            target: target.to_string(),
            reason: "unknown_warning_key".to_string(),
        });
        return;
    };
    let Ok(action) = value.parse::<WarningAction>() else {
        warnings.emit(Warning::OverrideInvalid {
            target: target.to_string(),
            reason: "invalid_action".to_string(),
        });
        return;
    };
    tracing::debug!(key = %kind, %action, "warning policy overridden");
    warnings.apply_override(kind, action);
}

/// Keep the environment entries `policy` accepts, reporting the rest as
/// denied.
///
/// In allowlist mode the variable name is what is matched.
pub fn filter_environment<T>(
    entries: Vec<(String, T)>,
    policy: &OverridePolicy,
    source_kind: SourceKind,
    warnings: &mut WarningCollector,
) -> Vec<(String, T)> {
    entries
        .into_iter()
        .filter(|(key, _)| {
            let permitted = policy.permits(key);
            if !permitted {
                warnings.emit(Warning::OverrideDenied {
                    target: key.clone(),
                    source_kind: source_kind.to_string(),
                });
            }
            permitted
        })
        .collect()
}
