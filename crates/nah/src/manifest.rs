// Copyright (c) Contributors to the NAH project.
// SPDX-License-Identifier: Apache-2.0

//! The typed application manifest.
//!
//! A manifest is normally shipped as a binary blob (see [`crate::codec`]), but
//! it can also be declared as JSON, which is how packaging tools author one
//! before encoding it.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::version::{VersionError, VersionRange};

#[cfg(test)]
#[path = "./manifest_test.rs"]
mod manifest_test;

/// Value of the schema-version record written into every manifest.
pub const MANIFEST_SCHEMA_VERSION: &str = "1";

/// Schema tag accepted on JSON manifest declarations.
pub const MANIFEST_DECLARATION_SCHEMA: &str = "nah.app.manifest.v1";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeclarationError {
    #[error("environment entry {0:?} is not KEY=VALUE")]
    EnvAssignment(String),

    #[error("asset export {0:?} is not id:path[:type]")]
    AssetExport(String),
}

/// A `KEY=VALUE` environment assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EnvAssignment {
    pub key: String,
    pub value: String,
}

impl EnvAssignment {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

impl FromStr for EnvAssignment {
    type Err = DeclarationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('=') {
            Some((key, value)) if !key.is_empty() => Ok(Self::new(key, value)),
            _ => Err(DeclarationError::EnvAssignment(s.to_string())),
        }
    }
}

impl TryFrom<String> for EnvAssignment {
    type Error = DeclarationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<EnvAssignment> for String {
    fn from(assignment: EnvAssignment) -> Self {
        assignment.to_string()
    }
}

impl fmt::Display for EnvAssignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// A named file or directory the application makes available to others.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetExportDecl {
    pub id: String,
    pub path: String,
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
}

impl FromStr for AssetExportDecl {
    type Err = DeclarationError;

    /// Parse the `id:path[:type]` record form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        let id = parts.next().unwrap_or_default();
        let path = parts.next().unwrap_or_default();
        let kind = parts.next().unwrap_or_default();
        if id.is_empty() || path.is_empty() {
            return Err(DeclarationError::AssetExport(s.to_string()));
        }
        Ok(Self {
            id: id.to_string(),
            path: path.to_string(),
            kind: kind.to_string(),
        })
    }
}

impl fmt::Display for AssetExportDecl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.kind.is_empty() {
            write!(f, "{}:{}", self.id, self.path)
        } else {
            write!(f, "{}:{}:{}", self.id, self.path, self.kind)
        }
    }
}

/// Declared `verb:resource` permission strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filesystem: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub network: Vec<String>,
}

impl Permissions {
    pub fn is_empty(&self) -> bool {
        self.filesystem.is_empty() && self.network.is_empty()
    }

    /// Filesystem permissions followed by network permissions.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.filesystem
            .iter()
            .chain(self.network.iter())
            .map(String::as_str)
    }
}

/// An application's declared identity, runtime dependency and layout.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub id: String,

    pub version: String,

    /// Id of the runtime bundle the application runs on, if any.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub nak_id: String,

    /// Version range of acceptable bundle versions.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub nak_version_req: String,

    /// Bundle loader the application asks for by name.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub nak_loader: String,

    /// Entrypoint, relative to the install root.
    #[serde(default)]
    pub entrypoint: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entrypoint_args: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvAssignment>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub lib_dirs: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub asset_dirs: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub asset_exports: Vec<AssetExportDecl>,

    #[serde(default, skip_serializing_if = "Permissions::is_empty")]
    pub permissions: Permissions,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub author: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub license: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub homepage: String,
}

impl Manifest {
    /// Parse a JSON manifest declaration.
    pub fn from_json(json: &str) -> crate::Result<Self> {
        crate::document::from_json(json, "manifest", MANIFEST_DECLARATION_SCHEMA)
    }

    /// Load a JSON manifest declaration from file.
    pub fn load<P: AsRef<std::path::Path>>(path: P) -> crate::Result<Self> {
        let json = crate::document::read(path.as_ref())?;
        Self::from_json(&json)
    }

    /// True when the application declares a runtime bundle.
    pub fn has_nak(&self) -> bool {
        !self.nak_id.is_empty()
    }

    /// The parsed bundle requirement, or `None` when none is declared.
    pub fn nak_requirement(&self) -> Option<Result<VersionRange, VersionError>> {
        if self.nak_version_req.trim().is_empty() {
            return None;
        }
        Some(VersionRange::parse(&self.nak_version_req))
    }
}
