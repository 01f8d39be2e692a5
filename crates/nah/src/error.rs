// Copyright (c) Contributors to the NAH project.
// SPDX-License-Identifier: Apache-2.0

//! Error types for nah operations.

use miette::Diagnostic;
use std::path::PathBuf;
use thiserror::Error;

/// Convenience Result type with nah Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while loading or serializing composition inputs and outputs.
///
/// Composition itself never returns these; anomalies found while composing are
/// reported as warnings or as a [`crate::CriticalError`] on the result.
#[derive(Error, Diagnostic, Debug)]
pub enum Error {
    /// Document is not valid JSON, or does not fit the expected structure
    #[error("Invalid {kind} document: {error}")]
    #[diagnostic(
        code(nah::invalid_json),
        help("Check JSON syntax and that '$schema' names the expected document")
    )]
    InvalidJson {
        kind: &'static str,
        #[source]
        error: serde_json::Error,
    },

    /// Document parsed but violates a structural rule
    #[error("Invalid {kind} document: {reason}")]
    #[diagnostic(code(nah::invalid_shape))]
    InvalidShape { kind: &'static str, reason: String },

    /// `$schema` names a different document type or version
    #[error("Unexpected schema {found:?}, expected {expected:?}")]
    #[diagnostic(
        code(nah::schema_mismatch),
        help("Set '$schema' to the expected value or remove it")
    )]
    SchemaMismatch {
        expected: &'static str,
        found: String,
    },

    /// Failed to read file
    #[error("Failed to read file: {path:?}")]
    #[diagnostic(code(nah::read_failed))]
    ReadFailed {
        path: PathBuf,
        #[source]
        error: std::io::Error,
    },

    /// Binary manifest could not be encoded or decoded
    #[error(transparent)]
    #[diagnostic(code(nah::manifest))]
    Manifest(#[from] crate::codec::ManifestError),

    /// Failed to serialize output
    #[error("Failed to serialize output: {0}")]
    #[diagnostic(code(nah::serialize_failed))]
    Serialize(#[source] serde_json::Error),

    /// IO error passthrough
    #[error(transparent)]
    #[diagnostic(code(nah::io_error))]
    Io(#[from] std::io::Error),
}
