// Copyright (c) Contributors to the NAH project.
// SPDX-License-Identifier: Apache-2.0

//! The launch contract and the composition result that carries it.

use std::collections::BTreeMap;

use miette::Diagnostic;
use serde::Serialize;
use thiserror::Error;

use crate::environment::SourceKind;
use crate::trust::TrustInfo;
use crate::warnings::{WarningAction, WarningObject};
use crate::{Error, Result};

#[cfg(test)]
#[path = "./contract_test.rs"]
mod contract_test;

pub const LAUNCH_CONTRACT_SCHEMA: &str = "nah.launch.contract.v1";

/// Conditions under which no contract can be produced safely.
#[derive(Error, Diagnostic, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CriticalError {
    #[error("entrypoint not found")]
    #[diagnostic(code(nah::entrypoint_not_found))]
    EntrypointNotFound,

    #[error("path escapes its root")]
    #[diagnostic(code(nah::path_traversal))]
    PathTraversal,

    #[error("requested loader is not provided by the runtime")]
    #[diagnostic(code(nah::nak_loader_invalid))]
    NakLoaderInvalid,

    #[error("no manifest present")]
    #[diagnostic(code(nah::manifest_missing))]
    ManifestMissing,

    #[error("manifest checksum mismatch")]
    #[diagnostic(code(nah::crc_mismatch))]
    CrcMismatch,
}

impl CriticalError {
    pub fn as_str(&self) -> &'static str {
        match self {
            CriticalError::EntrypointNotFound => "ENTRYPOINT_NOT_FOUND",
            CriticalError::PathTraversal => "PATH_TRAVERSAL",
            CriticalError::NakLoaderInvalid => "NAK_LOADER_INVALID",
            CriticalError::ManifestMissing => "MANIFEST_MISSING",
            CriticalError::CrcMismatch => "CRC_MISMATCH",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AppSection {
    pub id: String,
    pub version: String,
    pub root: String,
    pub entrypoint: String,
}

/// The resolved bundle. Every field is empty when running bundle-less.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NakSection {
    pub id: String,
    pub version: String,
    pub root: String,
    pub resource_root: String,
    pub record_ref: String,
    pub loader: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionSection {
    pub binary: String,
    pub arguments: Vec<String>,
    pub cwd: String,
    pub library_path_env_key: String,
    pub library_paths: Vec<String>,
}

/// Host enforcement ids for the application's declared permissions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EnforcementSection {
    pub filesystem: Vec<String>,
    pub network: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CapabilityUsage {
    pub present: bool,
    pub required_capabilities: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExportEntry {
    pub id: String,
    pub path: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// Everything needed to execute an application.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LaunchContract {
    pub app: AppSection,
    pub nak: NakSection,
    pub execution: ExecutionSection,
    pub environment: BTreeMap<String, String>,
    pub enforcement: EnforcementSection,
    pub trust: TrustInfo,
    pub capability_usage: CapabilityUsage,
    pub exports: BTreeMap<String, ExportEntry>,
}

/// One attempt by a source to set a value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraceContribution {
    pub value: String,
    pub source_kind: SourceKind,
    pub source_path: String,
    pub precedence_rank: u8,
    pub operation: &'static str,
    pub accepted: bool,
}

/// Where a generated value came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraceEntry {
    pub value: String,
    pub source_kind: SourceKind,
    pub source_path: String,
    pub precedence_rank: u8,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<TraceContribution>,
}

impl TraceEntry {
    pub fn new(value: impl Into<String>, source_kind: SourceKind, source_path: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            source_kind,
            source_path: source_path.into(),
            precedence_rank: source_kind.rank(),
            history: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CompositionTrace {
    pub environment: BTreeMap<String, TraceEntry>,
    pub library_paths: Vec<TraceEntry>,
    /// `binary` and `cwd`.
    pub execution: BTreeMap<String, TraceEntry>,
    /// Free-form notes on choices made along the way.
    pub decisions: Vec<String>,
}

/// The outcome of one composition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompositionResult {
    pub ok: bool,
    pub contract: Option<LaunchContract>,
    pub warnings: Vec<WarningObject>,
    pub critical_error: Option<CriticalError>,
    pub critical_error_context: String,
    pub trace: Option<CompositionTrace>,
}

impl CompositionResult {
    pub(crate) fn failed(
        error: CriticalError,
        context: impl Into<String>,
        warnings: Vec<WarningObject>,
    ) -> Self {
        let context = context.into();
        tracing::debug!(%error, %context, "composition failed");
        Self {
            ok: false,
            contract: None,
            warnings,
            critical_error: Some(error),
            critical_error_context: context,
            trace: None,
        }
    }

    /// True when a warning was classified as an error by policy. The
    /// contract is still present, but policy forbids running it.
    pub fn has_policy_errors(&self) -> bool {
        self.warnings
            .iter()
            .any(|warning| warning.action == WarningAction::Error)
    }

    /// The result as a JSON value with every object's keys sorted.
    pub fn to_value(&self, include_trace: bool) -> Result<serde_json::Value> {
        let mut document = serde_json::Map::new();
        document.insert("schema".into(), LAUNCH_CONTRACT_SCHEMA.into());
        document.insert("ok".into(), self.ok.into());
        document.insert(
            "critical_error".into(),
            self.critical_error
                .map(|error| error.as_str().into())
                .unwrap_or(serde_json::Value::Null),
        );
        document.insert(
            "critical_error_context".into(),
            self.critical_error_context.clone().into(),
        );
        document.insert("warnings".into(), to_value(&self.warnings)?);
        document.insert("contract".into(), to_value(&self.contract)?);
        if include_trace {
            document.insert("trace".into(), to_value(&self.trace)?);
        }
        Ok(serde_json::Value::Object(document))
    }

    /// Pretty-printed JSON. Identical results give byte-identical output.
    pub fn to_json(&self, include_trace: bool) -> Result<String> {
        serde_json::to_string_pretty(&self.to_value(include_trace)?).map_err(Error::Serialize)
    }
}

fn to_value<T: Serialize>(value: &T) -> Result<serde_json::Value> {
    serde_json::to_value(value).map_err(Error::Serialize)
}
