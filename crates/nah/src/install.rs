// Copyright (c) Contributors to the NAH project.
// SPDX-License-Identifier: Apache-2.0

//! Install records: what was installed where, and which bundle it was pinned
//! to at install time.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::environment::EnvOp;
use crate::path::is_absolute;
use crate::trust::TrustInfo;
use crate::{Error, Result};

#[cfg(test)]
#[path = "./install_test.rs"]
mod install_test;

pub const INSTALL_RECORD_SCHEMA: &str = "nah.app.install.v1";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallInstance {
    #[serde(default)]
    pub instance_id: String,
}

/// The application identity as it was seen at install time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppSnapshot {
    #[serde(default)]
    pub id: String,

    #[serde(default)]
    pub version: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub nak_id: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub nak_version_req: String,
}

/// The bundle an installation is bound to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NakPin {
    #[serde(default)]
    pub id: String,

    #[serde(default)]
    pub version: String,

    /// Key of the bundle's record in the runtime inventory.
    #[serde(default)]
    pub record_ref: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub loader: String,

    /// How the pin was chosen (`canonical`, `mapped`).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub selection_reason: String,
}

impl NakPin {
    /// True when any pin field is set.
    pub fn is_set(&self) -> bool {
        !(self.id.is_empty()
            && self.version.is_empty()
            && self.record_ref.is_empty()
            && self.loader.is_empty()
            && self.selection_reason.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallPaths {
    #[serde(default)]
    pub install_root: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub package_hash: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installed_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub installed_by: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgumentOverrides {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prepend: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub append: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathOverrides {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub library_prepend: Vec<String>,
}

/// Per-installation adjustments, subject to the host's override policy for
/// the environment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallOverrides {
    /// Operations applied over everything but invocation overrides.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, EnvOp>,

    #[serde(default)]
    pub arguments: ArgumentOverrides,

    #[serde(default)]
    pub paths: PathOverrides,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstallRecord {
    #[serde(default)]
    pub install: InstallInstance,

    #[serde(default)]
    pub app: AppSnapshot,

    #[serde(default)]
    pub nak: NakPin,

    pub paths: InstallPaths,

    #[serde(default)]
    pub provenance: Provenance,

    /// Absent means the installation was never evaluated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trust: Option<TrustInfo>,

    #[serde(default)]
    pub overrides: InstallOverrides,

    /// Path to the file this was loaded from (not serialized).
    #[serde(skip)]
    pub source_path: Option<PathBuf>,
}

impl InstallRecord {
    /// Parse an install record from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let record: Self = crate::document::from_json(json, "install record", INSTALL_RECORD_SCHEMA)?;
        if !is_absolute(&record.paths.install_root) {
            return Err(Error::InvalidShape {
                kind: "install record",
                reason: format!(
                    "paths.install_root must be absolute, got {:?}",
                    record.paths.install_root
                ),
            });
        }
        Ok(record)
    }

    /// Load an install record from file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let json = crate::document::read(path)?;
        let mut record = Self::from_json(&json)?;
        record.source_path = Some(path.to_path_buf());
        Ok(record)
    }

    pub fn install_root(&self) -> &str {
        &self.paths.install_root
    }

    /// Where this record came from, for traces and warnings.
    pub fn source_label(&self) -> String {
        self.source_path
            .as_ref()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "install_record".to_string())
    }
}
