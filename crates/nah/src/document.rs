// Copyright (c) Contributors to the NAH project.
// SPDX-License-Identifier: Apache-2.0

//! Shared loading for schema-tagged JSON documents.

use std::path::Path;

use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::{Error, Result};

/// Helper for two-stage deserialization to check `$schema` first.
#[derive(Deserialize)]
struct SchemaMapping {
    #[serde(rename = "$schema", default)]
    schema: Option<String>,
}

/// Parse `json` as a `kind` document whose `$schema`, when present, must be
/// `expected`.
pub(crate) fn from_json<T: DeserializeOwned>(
    json: &str,
    kind: &'static str,
    expected: &'static str,
) -> Result<T> {
    // Stage 1: Parse to get the schema tag
    let value: serde_json::Value =
        serde_json::from_str(json).map_err(|error| Error::InvalidJson { kind, error })?;
    if !value.is_object() {
        return Err(Error::InvalidShape {
            kind,
            reason: "document must be a JSON object".to_string(),
        });
    }

    let mapping: SchemaMapping = serde_json::from_value(value.clone())
        .map_err(|error| Error::InvalidJson { kind, error })?;
    if let Some(found) = mapping.schema.filter(|schema| schema != expected) {
        return Err(Error::SchemaMismatch { expected, found });
    }

    // Stage 2: Deserialize the whole document
    serde_json::from_value(value).map_err(|error| Error::InvalidJson { kind, error })
}

pub(crate) fn read(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|error| Error::ReadFailed {
        path: path.to_path_buf(),
        error,
    })
}
