// Copyright (c) Contributors to the NAH project.
// SPDX-License-Identifier: Apache-2.0

//! Warning keys, policy actions and the per-composition collector.
//!
//! Every non-fatal anomaly found while composing is described by a
//! [`Warning`]. The collector classifies it through the host policy and keeps
//! the surviving ones, in emission order, for the final result.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[cfg(test)]
#[path = "./warnings_test.rs"]
mod warnings_test;

/// The closed set of warning keys.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    InvalidManifest,
    InvalidConfiguration,
    NakPinInvalid,
    NakNotFound,
    NakVersionUnsupported,
    NakLoaderRequired,
    NakLoaderMissing,
    CapabilityMalformed,
    CapabilityUnknown,
    MissingEnvVar,
    OverrideDenied,
    OverrideInvalid,
    InvalidLibraryPath,
    TrustStateUnknown,
    TrustStateUnverified,
    TrustStateFailed,
    TrustStateStale,
}

impl WarningKind {
    pub const ALL: [WarningKind; 17] = [
        WarningKind::InvalidManifest,
        WarningKind::InvalidConfiguration,
        WarningKind::NakPinInvalid,
        WarningKind::NakNotFound,
        WarningKind::NakVersionUnsupported,
        WarningKind::NakLoaderRequired,
        WarningKind::NakLoaderMissing,
        WarningKind::CapabilityMalformed,
        WarningKind::CapabilityUnknown,
        WarningKind::MissingEnvVar,
        WarningKind::OverrideDenied,
        WarningKind::OverrideInvalid,
        WarningKind::InvalidLibraryPath,
        WarningKind::TrustStateUnknown,
        WarningKind::TrustStateUnverified,
        WarningKind::TrustStateFailed,
        WarningKind::TrustStateStale,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WarningKind::InvalidManifest => "invalid_manifest",
            WarningKind::InvalidConfiguration => "invalid_configuration",
            WarningKind::NakPinInvalid => "nak_pin_invalid",
            WarningKind::NakNotFound => "nak_not_found",
            WarningKind::NakVersionUnsupported => "nak_version_unsupported",
            WarningKind::NakLoaderRequired => "nak_loader_required",
            WarningKind::NakLoaderMissing => "nak_loader_missing",
            WarningKind::CapabilityMalformed => "capability_malformed",
            WarningKind::CapabilityUnknown => "capability_unknown",
            WarningKind::MissingEnvVar => "missing_env_var",
            WarningKind::OverrideDenied => "override_denied",
            WarningKind::OverrideInvalid => "override_invalid",
            WarningKind::InvalidLibraryPath => "invalid_library_path",
            WarningKind::TrustStateUnknown => "trust_state_unknown",
            WarningKind::TrustStateUnverified => "trust_state_unverified",
            WarningKind::TrustStateFailed => "trust_state_failed",
            WarningKind::TrustStateStale => "trust_state_stale",
        }
    }

    /// Action applied when neither the host policy nor an override names this
    /// key.
    pub fn default_action(&self) -> WarningAction {
        WarningAction::Warn
    }

    /// Field names a warning of this kind may carry.
    pub fn field_names(&self) -> &'static [&'static str] {
        match self {
            WarningKind::InvalidManifest => &["reason"],
            WarningKind::InvalidConfiguration => &["detail", "reason"],
            WarningKind::NakPinInvalid => &["reason", "record_ref"],
            WarningKind::NakNotFound => &["nak_id", "requirement"],
            WarningKind::NakVersionUnsupported => &["nak_id", "reason", "requirement", "version"],
            WarningKind::NakLoaderRequired => &["loaders"],
            WarningKind::NakLoaderMissing => &["loader", "nak_id"],
            WarningKind::CapabilityMalformed => &["permission"],
            WarningKind::CapabilityUnknown => &["operation", "permission"],
            WarningKind::MissingEnvVar => &["name", "source_path"],
            WarningKind::OverrideDenied => &["source_kind", "target"],
            WarningKind::OverrideInvalid => &["reason", "target"],
            WarningKind::InvalidLibraryPath => &["path", "source_kind"],
            WarningKind::TrustStateUnknown => &[],
            WarningKind::TrustStateUnverified | WarningKind::TrustStateFailed => &["source"],
            WarningKind::TrustStateStale => &["expires_at", "now"],
        }
    }
}

impl fmt::Display for WarningKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown warning key {0:?}")]
pub struct UnknownWarningKey(pub String);

impl FromStr for WarningKind {
    type Err = UnknownWarningKey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        WarningKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == lowered)
            .ok_or_else(|| UnknownWarningKey(s.to_string()))
    }
}

/// How a warning key is treated.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum WarningAction {
    Ignore,
    #[default]
    Warn,
    Error,
}

impl WarningAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            WarningAction::Ignore => "ignore",
            WarningAction::Warn => "warn",
            WarningAction::Error => "error",
        }
    }
}

impl fmt::Display for WarningAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown warning action {0:?}, expected one of: warn, ignore, error")]
pub struct UnknownWarningAction(pub String);

impl FromStr for WarningAction {
    type Err = UnknownWarningAction;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ignore" => Ok(WarningAction::Ignore),
            "warn" => Ok(WarningAction::Warn),
            "error" => Ok(WarningAction::Error),
            _ => Err(UnknownWarningAction(s.to_string())),
        }
    }
}

/// A single anomaly together with the fields that describe it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Warning {
    InvalidManifest {
        reason: String,
    },
    InvalidConfiguration {
        reason: String,
        detail: String,
    },
    NakPinInvalid {
        reason: String,
        record_ref: String,
    },
    NakNotFound {
        nak_id: String,
        requirement: String,
    },
    NakVersionUnsupported {
        nak_id: String,
        version: String,
        requirement: String,
        reason: String,
    },
    NakLoaderRequired {
        loaders: Vec<String>,
    },
    NakLoaderMissing {
        loader: String,
        nak_id: String,
    },
    CapabilityMalformed {
        permission: String,
    },
    CapabilityUnknown {
        permission: String,
        operation: String,
    },
    MissingEnvVar {
        name: String,
        source_path: String,
    },
    OverrideDenied {
        target: String,
        source_kind: String,
    },
    OverrideInvalid {
        target: String,
        reason: String,
    },
    InvalidLibraryPath {
        path: String,
        source_kind: String,
    },
    TrustStateUnknown,
    TrustStateUnverified {
        source: String,
    },
    TrustStateFailed {
        source: String,
    },
    TrustStateStale {
        expires_at: String,
        now: String,
    },
}

impl Warning {
    pub fn kind(&self) -> WarningKind {
        match self {
            Warning::InvalidManifest { .. } => WarningKind::InvalidManifest,
            Warning::InvalidConfiguration { .. } => WarningKind::InvalidConfiguration,
            Warning::NakPinInvalid { .. } => WarningKind::NakPinInvalid,
            Warning::NakNotFound { .. } => WarningKind::NakNotFound,
            Warning::NakVersionUnsupported { .. } => WarningKind::NakVersionUnsupported,
            Warning::NakLoaderRequired { .. } => WarningKind::NakLoaderRequired,
            Warning::NakLoaderMissing { .. } => WarningKind::NakLoaderMissing,
            Warning::CapabilityMalformed { .. } => WarningKind::CapabilityMalformed,
            Warning::CapabilityUnknown { .. } => WarningKind::CapabilityUnknown,
            Warning::MissingEnvVar { .. } => WarningKind::MissingEnvVar,
            Warning::OverrideDenied { .. } => WarningKind::OverrideDenied,
            Warning::OverrideInvalid { .. } => WarningKind::OverrideInvalid,
            Warning::InvalidLibraryPath { .. } => WarningKind::InvalidLibraryPath,
            Warning::TrustStateUnknown => WarningKind::TrustStateUnknown,
            Warning::TrustStateUnverified { .. } => WarningKind::TrustStateUnverified,
            Warning::TrustStateFailed { .. } => WarningKind::TrustStateFailed,
            Warning::TrustStateStale { .. } => WarningKind::TrustStateStale,
        }
    }

    /// The warning's fields, keyed by the names in
    /// [`WarningKind::field_names`]. Empty values are left out.
    pub fn fields(&self) -> BTreeMap<String, String> {
        let pairs: Vec<(&str, String)> = match self {
            Warning::InvalidManifest { reason } => vec![("reason", reason.clone())],
            Warning::InvalidConfiguration { reason, detail } => {
                vec![("reason", reason.clone()), ("detail", detail.clone())]
            }
            Warning::NakPinInvalid { reason, record_ref } => {
                vec![("reason", reason.clone()), ("record_ref", record_ref.clone())]
            }
            Warning::NakNotFound {
                nak_id,
                requirement,
            } => vec![
                ("nak_id", nak_id.clone()),
                ("requirement", requirement.clone()),
            ],
            Warning::NakVersionUnsupported {
                nak_id,
                version,
                requirement,
                reason,
            } => vec![
                ("nak_id", nak_id.clone()),
                ("version", version.clone()),
                ("requirement", requirement.clone()),
                ("reason", reason.clone()),
            ],
            Warning::NakLoaderRequired { loaders } => vec![("loaders", loaders.join(","))],
            Warning::NakLoaderMissing { loader, nak_id } => {
                vec![("loader", loader.clone()), ("nak_id", nak_id.clone())]
            }
            Warning::CapabilityMalformed { permission } => {
                vec![("permission", permission.clone())]
            }
            Warning::CapabilityUnknown {
                permission,
                operation,
            } => vec![
                ("permission", permission.clone()),
                ("operation", operation.clone()),
            ],
            Warning::MissingEnvVar { name, source_path } => {
                vec![("name", name.clone()), ("source_path", source_path.clone())]
            }
            Warning::OverrideDenied {
                target,
                source_kind,
            } => vec![
                ("target", target.clone()),
                ("source_kind", source_kind.clone()),
            ],
            Warning::OverrideInvalid { target, reason } => {
                vec![("target", target.clone()), ("reason", reason.clone())]
            }
            Warning::InvalidLibraryPath { path, source_kind } => {
                vec![("path", path.clone()), ("source_kind", source_kind.clone())]
            }
            Warning::TrustStateUnknown => Vec::new(),
            Warning::TrustStateUnverified { source } | Warning::TrustStateFailed { source } => {
                vec![("source", source.clone())]
            }
            Warning::TrustStateStale { expires_at, now } => {
                vec![("expires_at", expires_at.clone()), ("now", now.clone())]
            }
        };
        pairs
            .into_iter()
            .filter(|(_, value)| !value.is_empty())
            .map(|(name, value)| (name.to_string(), value))
            .collect()
    }
}

/// A classified warning as it appears in the composition result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WarningObject {
    pub key: WarningKind,
    pub action: WarningAction,
    pub fields: BTreeMap<String, String>,
}

/// Classifies warnings through a policy map and keeps the survivors in order.
#[derive(Debug, Clone, Default)]
pub struct WarningCollector {
    policy: BTreeMap<WarningKind, WarningAction>,
    overrides: BTreeMap<WarningKind, WarningAction>,
    emitted: Vec<WarningObject>,
}

impl WarningCollector {
    pub fn new(policy: BTreeMap<WarningKind, WarningAction>) -> Self {
        Self {
            policy,
            ..Default::default()
        }
    }

    /// The action the next warning of `kind` would receive.
    pub fn action_for(&self, kind: WarningKind) -> WarningAction {
        self.overrides
            .get(&kind)
            .or_else(|| self.policy.get(&kind))
            .copied()
            .unwrap_or_else(|| kind.default_action())
    }

    /// Change the action for `kind`. Only warnings emitted afterwards are
    /// affected.
    pub fn apply_override(&mut self, kind: WarningKind, action: WarningAction) {
        self.overrides.insert(kind, action);
    }

    /// Classify and record `warning`, returning the action it received.
    pub fn emit(&mut self, warning: Warning) -> WarningAction {
        let kind = warning.kind();
        let action = self.action_for(kind);
        if action == WarningAction::Ignore {
            tracing::trace!(key = %kind, "warning ignored by policy");
            return action;
        }
        let fields = warning.fields();
        tracing::debug!(key = %kind, %action, ?fields, "warning");
        self.emitted.push(WarningObject {
            key: kind,
            action,
            fields,
        });
        action
    }

    pub fn warnings(&self) -> &[WarningObject] {
        &self.emitted
    }

    /// True when any recorded warning was classified as an error.
    pub fn has_errors(&self) -> bool {
        self.emitted
            .iter()
            .any(|warning| warning.action == WarningAction::Error)
    }

    pub fn into_warnings(self) -> Vec<WarningObject> {
        self.emitted
    }
}
