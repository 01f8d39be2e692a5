// Copyright (c) Contributors to the NAH project.
// SPDX-License-Identifier: Apache-2.0

//! Installed runtime bundles and the inventory they are looked up in.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::path::is_absolute;
use crate::version::{SemVer, VersionError};
use crate::{Error, Result};

#[cfg(test)]
#[path = "./runtime_test.rs"]
mod runtime_test;

pub const RUNTIME_DESCRIPTOR_SCHEMA: &str = "nah.nak.install.v1";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NakIdentity {
    pub id: String,
    pub version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimePaths {
    /// Absolute install location of the bundle.
    pub root: String,

    /// Where bundle resources live. Empty means `root`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource_root: String,

    /// Absolute library directories, all beneath `root`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub lib_dirs: Vec<String>,
}

/// A launcher shipped by a bundle that runs the application for it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Loader {
    pub exec_path: String,

    /// Arguments with `{NAME}` placeholders filled from the final environment.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args_template: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeExecution {
    /// Working directory template, relative to the bundle root or absolute
    /// beneath it.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cwd: String,
}

/// An installed runtime bundle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeDescriptor {
    pub nak: NakIdentity,

    pub paths: RuntimePaths,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub loaders: BTreeMap<String, Loader>,

    #[serde(default)]
    pub execution: RuntimeExecution,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub provenance: BTreeMap<String, serde_json::Value>,

    /// Path to the file this was loaded from (not serialized).
    #[serde(skip)]
    pub source_path: Option<PathBuf>,
}

impl RuntimeDescriptor {
    /// Parse a runtime descriptor from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let descriptor: Self =
            crate::document::from_json(json, "runtime descriptor", RUNTIME_DESCRIPTOR_SCHEMA)?;
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// Load a runtime descriptor from file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let json = crate::document::read(path)?;
        let mut descriptor = Self::from_json(&json)?;
        descriptor.source_path = Some(path.to_path_buf());
        Ok(descriptor)
    }

    fn validate(&self) -> Result<()> {
        let invalid = |reason: String| Error::InvalidShape {
            kind: "runtime descriptor",
            reason,
        };
        if self.nak.id.is_empty() || self.nak.version.is_empty() {
            return Err(invalid("nak.id and nak.version are required".to_string()));
        }
        if !is_absolute(&self.paths.root) {
            return Err(invalid(format!(
                "paths.root must be absolute, got {:?}",
                self.paths.root
            )));
        }
        Ok(())
    }

    pub fn id(&self) -> &str {
        &self.nak.id
    }

    pub fn version(&self) -> &str {
        &self.nak.version
    }

    pub fn semver(&self) -> std::result::Result<SemVer, VersionError> {
        SemVer::parse(&self.nak.version)
    }

    pub fn root(&self) -> &str {
        &self.paths.root
    }

    pub fn resource_root(&self) -> &str {
        if self.paths.resource_root.is_empty() {
            &self.paths.root
        } else {
            &self.paths.resource_root
        }
    }

    /// Where this descriptor came from, for traces and warnings.
    pub fn source_label(&self, record_ref: &str) -> String {
        self.source_path
            .as_ref()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| record_ref.to_string())
    }
}

/// Installed bundles keyed by record reference.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuntimeInventory {
    records: BTreeMap<String, RuntimeDescriptor>,
}

impl RuntimeInventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, record_ref: impl Into<String>, descriptor: RuntimeDescriptor) {
        self.records.insert(record_ref.into(), descriptor);
    }

    pub fn get(&self, record_ref: &str) -> Option<&RuntimeDescriptor> {
        self.records.get(record_ref)
    }

    /// Records in record-reference order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &RuntimeDescriptor)> {
        self.records
            .iter()
            .map(|(record_ref, descriptor)| (record_ref.as_str(), descriptor))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Load every `*.json` descriptor in `dir`, keyed by file name.
    ///
    /// Descriptors that fail to load are skipped with a logged warning so one
    /// broken record does not hide the others.
    pub fn load_dir<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        let entries = std::fs::read_dir(dir).map_err(|error| Error::ReadFailed {
            path: dir.to_path_buf(),
            error,
        })?;

        let mut paths = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut inventory = Self::new();
        for path in paths {
            let Some(record_ref) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            match RuntimeDescriptor::load(&path) {
                Ok(descriptor) => inventory.insert(record_ref, descriptor),
                Err(err) => tracing::warn!(path = %path.display(), "skipping runtime record: {err}"),
            }
        }
        tracing::debug!(count = inventory.len(), dir = %dir.display(), "loaded runtime inventory");
        Ok(inventory)
    }
}

impl FromIterator<(String, RuntimeDescriptor)> for RuntimeInventory {
    fn from_iter<T: IntoIterator<Item = (String, RuntimeDescriptor)>>(iter: T) -> Self {
        Self {
            records: iter.into_iter().collect(),
        }
    }
}
