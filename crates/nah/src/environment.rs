// Copyright (c) Contributors to the NAH project.
// SPDX-License-Identifier: Apache-2.0

//! Layered environment merging and `{NAME}` placeholder expansion.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::contract::{TraceContribution, TraceEntry};
use crate::warnings::{Warning, WarningCollector};

#[cfg(test)]
#[path = "./environment_test.rs"]
mod environment_test;

/// Most placeholders a single value may contain.
pub const MAX_PLACEHOLDERS: usize = 128;
/// Largest expanded value, in bytes.
pub const MAX_EXPANDED_LEN: usize = 64 * 1024;

/// Where a value came from, ordered strongest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    NahStandard,
    InvocationOverride,
    InstallRecord,
    HostProfile,
    NakRecord,
    Manifest,
}

impl SourceKind {
    /// Precedence rank, 1 being the strongest.
    pub fn rank(&self) -> u8 {
        match self {
            SourceKind::NahStandard => 1,
            SourceKind::InvocationOverride => 2,
            SourceKind::InstallRecord => 3,
            SourceKind::HostProfile => 4,
            SourceKind::NakRecord => 5,
            SourceKind::Manifest => 6,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::NahStandard => "nah_standard",
            SourceKind::InvocationOverride => "invocation_override",
            SourceKind::InstallRecord => "install_record",
            SourceKind::HostProfile => "host_profile",
            SourceKind::NakRecord => "nak_record",
            SourceKind::Manifest => "manifest",
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a layer treats keys that an earlier layer already set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePolicy {
    /// Only set keys that are still unset.
    Fill,
    /// Replace whatever is there.
    Overwrite,
}

impl MergePolicy {
    fn operation(&self) -> &'static str {
        match self {
            MergePolicy::Fill => "fill",
            MergePolicy::Overwrite => "overwrite",
        }
    }
}

/// Separator used by prepend and append when none is given.
pub const DEFAULT_SEPARATOR: &str = ":";

/// An operation on one environment variable.
///
/// In JSON a plain string is a `set`; the object form names the operation:
/// `{"op": "prepend", "value": "/opt/bin", "separator": ":"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawEnvOp", into = "RawEnvOp")]
pub enum EnvOp {
    Set(String),
    Prepend { value: String, separator: String },
    Append { value: String, separator: String },
    Unset,
}

impl EnvOp {
    pub fn name(&self) -> &'static str {
        match self {
            EnvOp::Set(_) => "set",
            EnvOp::Prepend { .. } => "prepend",
            EnvOp::Append { .. } => "append",
            EnvOp::Unset => "unset",
        }
    }

    /// The value after applying this operation to `current`, or `None` when
    /// the variable ends up unset.
    ///
    /// Prepend and append onto an unset or empty value give the bare value.
    pub fn apply(&self, current: Option<&str>) -> Option<String> {
        let current = current.filter(|value| !value.is_empty());
        match (self, current) {
            (EnvOp::Set(value), _) => Some(value.clone()),
            (EnvOp::Prepend { value, separator }, Some(current)) => {
                Some(format!("{value}{separator}{current}"))
            }
            (EnvOp::Append { value, separator }, Some(current)) => {
                Some(format!("{current}{separator}{value}"))
            }
            (EnvOp::Prepend { value, .. } | EnvOp::Append { value, .. }, None) => {
                Some(value.clone())
            }
            (EnvOp::Unset, _) => None,
        }
    }
}

impl From<String> for EnvOp {
    fn from(value: String) -> Self {
        EnvOp::Set(value)
    }
}

impl From<&str> for EnvOp {
    fn from(value: &str) -> Self {
        EnvOp::Set(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum OpName {
    Set,
    Prepend,
    Append,
    Unset,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RawEnvOp {
    Plain(String),
    Op {
        op: OpName,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        value: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        separator: Option<String>,
    },
}

impl From<RawEnvOp> for EnvOp {
    fn from(raw: RawEnvOp) -> Self {
        match raw {
            RawEnvOp::Plain(value) => EnvOp::Set(value),
            RawEnvOp::Op { op, value, separator } => {
                let separator = separator.unwrap_or_else(|| DEFAULT_SEPARATOR.to_string());
                match op {
                    OpName::Set => EnvOp::Set(value),
                    OpName::Prepend => EnvOp::Prepend { value, separator },
                    OpName::Append => EnvOp::Append { value, separator },
                    OpName::Unset => EnvOp::Unset,
                }
            }
        }
    }
}

impl From<EnvOp> for RawEnvOp {
    fn from(op: EnvOp) -> Self {
        let (op, value, separator) = match op {
            EnvOp::Set(value) => return RawEnvOp::Plain(value),
            EnvOp::Prepend { value, separator } => (OpName::Prepend, value, Some(separator)),
            EnvOp::Append { value, separator } => (OpName::Append, value, Some(separator)),
            EnvOp::Unset => (OpName::Unset, String::new(), None),
        };
        RawEnvOp::Op { op, value, separator }
    }
}

/// One source of environment values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvLayer {
    pub kind: SourceKind,
    pub source_path: String,
    pub policy: MergePolicy,
    /// Operations in declaration order; a key may repeat.
    pub values: Vec<(String, EnvOp)>,
}

impl EnvLayer {
    pub fn new(kind: SourceKind, source_path: impl Into<String>, policy: MergePolicy) -> Self {
        Self {
            kind,
            source_path: source_path.into(),
            policy,
            values: Vec::new(),
        }
    }

    pub fn with_values<I, K, V>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<EnvOp>,
    {
        self.values
            .extend(values.into_iter().map(|(key, value)| (key.into(), value.into())));
        self
    }
}

/// Merged values with the history of every contribution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergedEnv {
    pub values: BTreeMap<String, String>,
    pub trace: BTreeMap<String, TraceEntry>,
}

/// Apply `layers` in order.
///
/// A fill layer never replaces an existing key, so among fill layers the
/// first writer wins. Overwrite layers apply their operation to whatever is
/// there, and `unset` removes the key. Rejected attempts are kept in the
/// trace history.
pub fn merge_layers(layers: &[EnvLayer]) -> MergedEnv {
    let mut merged = MergedEnv::default();
    for layer in layers {
        tracing::trace!(source = %layer.kind, count = layer.values.len(), "applying environment layer");
        for (key, op) in &layer.values {
            let current = merged.values.get(key).map(String::as_str);
            let exists = current.is_some();
            let accepted = !exists || layer.policy == MergePolicy::Overwrite;
            let value = op.apply(current);
            if value.is_none() && !exists {
                continue;
            }
            let operation = match op {
                EnvOp::Set(_) if exists => layer.policy.operation(),
                _ => op.name(),
            };
            let contribution = TraceContribution {
                value: value.clone().unwrap_or_default(),
                source_kind: layer.kind,
                source_path: layer.source_path.clone(),
                precedence_rank: layer.kind.rank(),
                operation,
                accepted,
            };

            let entry = merged.trace.entry(key.clone()).or_insert_with(|| {
                TraceEntry::new(
                    contribution.value.clone(),
                    layer.kind,
                    layer.source_path.clone(),
                )
            });
            if accepted {
                entry.value = contribution.value.clone();
                entry.source_kind = layer.kind;
                entry.source_path = layer.source_path.clone();
                entry.precedence_rank = layer.kind.rank();
                match value {
                    Some(value) => merged.values.insert(key.clone(), value),
                    None => merged.values.remove(key),
                };
            }
            entry.history.push(contribution);
        }
    }
    merged
}

fn is_placeholder_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|byte| byte.is_ascii_alphanumeric() || byte == b'_')
}

/// Replace each `{NAME}` in `template` with its value in `env`, in a single
/// pass.
///
/// Missing names expand to nothing and are reported. Braces that do not
/// enclose a variable name are copied as-is. When a limit is exceeded the
/// template is returned unexpanded.
pub fn expand_placeholders(
    template: &str,
    env: &BTreeMap<String, String>,
    source_path: &str,
    warnings: &mut WarningCollector,
) -> String {
    let mut out = String::with_capacity(template.len());
    let mut missing = Vec::new();
    let mut count = 0;
    let mut rest = template;

    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let name = after.find('}').map(|end| &after[..end]);
        match name {
            Some(name) if is_placeholder_name(name) => {
                count += 1;
                if count > MAX_PLACEHOLDERS {
                    warnings.emit(Warning::InvalidConfiguration {
                        reason: "placeholder_limit_exceeded".to_string(),
                        detail: source_path.to_string(),
                    });
                    return template.to_string();
                }
                match env.get(name) {
                    Some(value) => out.push_str(value),
                    None => missing.push(name.to_string()),
                }
                rest = &after[name.len() + 1..];
            }
            _ => {
                out.push('{');
                rest = after;
            }
        }
        if out.len() > MAX_EXPANDED_LEN {
            break;
        }
    }
    out.push_str(rest);

    if out.len() > MAX_EXPANDED_LEN {
        warnings.emit(Warning::InvalidConfiguration {
            reason: "expansion_too_large".to_string(),
            detail: source_path.to_string(),
        });
        return template.to_string();
    }
    for name in missing {
        warnings.emit(Warning::MissingEnvVar {
            name,
            source_path: source_path.to_string(),
        });
    }
    out
}

/// Expand every value of `merged` except the keys in `skip`, against a
/// snapshot taken before any expansion.
pub fn expand_environment(
    merged: &mut MergedEnv,
    skip: &[&str],
    warnings: &mut WarningCollector,
) {
    let snapshot = merged.values.clone();
    for (key, value) in merged.values.iter_mut() {
        if skip.contains(&key.as_str()) || !value.contains('{') {
            continue;
        }
        let source_path = merged
            .trace
            .get(key)
            .map(|entry| entry.source_path.as_str())
            .unwrap_or_default();
        let expanded = expand_placeholders(value, &snapshot, source_path, warnings);
        if let Some(entry) = merged.trace.get_mut(key) {
            entry.value = expanded.clone();
        }
        *value = expanded;
    }
}
