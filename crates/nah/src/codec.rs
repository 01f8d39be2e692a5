// Copyright (c) Contributors to the NAH project.
// SPDX-License-Identifier: Apache-2.0

//! Binary manifest encoding.
//!
//! ```text
//! 0..4    magic "NAHM"
//! 4..6    format version (u16 LE)
//! 6..8    reserved
//! 8..12   total size, header included (u32 LE)
//! 12..16  CRC32 of the payload (u32 LE)
//! 16..    payload: records of {tag: u16 LE, length: u16 LE, value}
//! ```
//!
//! Records appear in ascending tag order. Only repeatable tags may occur more
//! than once, and the payload ends with a zero-length END record.
//!
//! Decoding is lenient: a checksum mismatch or a missing header is fatal, and
//! every other problem is reported as a [`DecodeIssue`] while the rest of the
//! manifest is still recovered.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

use crate::manifest::{AssetExportDecl, EnvAssignment, MANIFEST_SCHEMA_VERSION, Manifest};
use crate::path::is_absolute;
use crate::version::{SemVer, VersionRange};

#[cfg(test)]
#[path = "./codec_test.rs"]
mod codec_test;

pub const MAGIC: [u8; 4] = *b"NAHM";
pub const FORMAT_VERSION: u16 = 1;
pub const HEADER_SIZE: usize = 16;
pub const MAX_TOTAL_SIZE: usize = 64 * 1024;
pub const MAX_ENTRIES: usize = 512;
pub const MAX_STRING_LEN: usize = 4096;
pub const MAX_REPEATS: usize = 128;

/// Known record tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u16)]
pub enum Tag {
    End = 0,
    SchemaVersion = 1,
    Id = 10,
    Version = 11,
    NakId = 12,
    NakVersionReq = 13,
    NakLoader = 14,
    EntrypointPath = 20,
    EntrypointArg = 21,
    EnvVar = 30,
    LibDir = 40,
    AssetDir = 41,
    AssetExport = 42,
    PermissionFilesystem = 50,
    PermissionNetwork = 51,
    Description = 60,
    Author = 61,
    License = 62,
    Homepage = 63,
}

impl Tag {
    pub fn from_code(code: u16) -> Option<Self> {
        let tag = match code {
            0 => Tag::End,
            1 => Tag::SchemaVersion,
            10 => Tag::Id,
            11 => Tag::Version,
            12 => Tag::NakId,
            13 => Tag::NakVersionReq,
            14 => Tag::NakLoader,
            20 => Tag::EntrypointPath,
            21 => Tag::EntrypointArg,
            30 => Tag::EnvVar,
            40 => Tag::LibDir,
            41 => Tag::AssetDir,
            42 => Tag::AssetExport,
            50 => Tag::PermissionFilesystem,
            51 => Tag::PermissionNetwork,
            60 => Tag::Description,
            61 => Tag::Author,
            62 => Tag::License,
            63 => Tag::Homepage,
            _ => return None,
        };
        Some(tag)
    }

    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn is_repeatable(self) -> bool {
        matches!(
            self,
            Tag::EntrypointArg
                | Tag::EnvVar
                | Tag::LibDir
                | Tag::AssetDir
                | Tag::AssetExport
                | Tag::PermissionFilesystem
                | Tag::PermissionNetwork
        )
    }
}

fn is_repeatable_code(code: u16) -> bool {
    Tag::from_code(code).is_some_and(Tag::is_repeatable)
}

/// Fatal manifest errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ManifestError {
    #[error("manifest header too small: {0} bytes")]
    HeaderTooSmall(usize),

    #[error("manifest magic not found")]
    BadMagic,

    #[error("manifest checksum mismatch: header says {expected:#010x}, payload is {actual:#010x}")]
    CrcMismatch { expected: u32, actual: u32 },

    #[error("cannot encode {tag:?} value: {reason}")]
    Unencodable { tag: Tag, reason: String },

    #[error("encoded manifest is {0} bytes, more than the {MAX_TOTAL_SIZE} byte limit")]
    TooLarge(usize),
}

impl ManifestError {
    /// True when the bytes do not hold a manifest at all.
    pub fn is_missing(&self) -> bool {
        matches!(self, ManifestError::HeaderTooSmall(_) | ManifestError::BadMagic)
    }
}

/// A non-fatal problem found while decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeIssue {
    FormatVersion(u16),
    TotalSizeMismatch { declared: usize, actual: usize },
    TotalSizeExceeded(usize),
    LengthOutOfBounds { offset: usize },
    TagOrder { tag: u16, previous: u16 },
    DuplicateTag(u16),
    RepeatLimit(u16),
    EntryLimit,
    EndNotFinal { offset: usize },
    EndLengthNonzero,
    InvalidValue { tag: u16, reason: &'static str },
    SchemaVersion(String),
    IdMissing,
    VersionMissing,
    VersionInvalid(String),
    EntrypointMissing,
}

impl DecodeIssue {
    /// Short machine-readable name of the problem.
    pub fn reason(&self) -> &'static str {
        match self {
            DecodeIssue::FormatVersion(_) => "format_version",
            DecodeIssue::TotalSizeMismatch { .. } => "total_size_mismatch",
            DecodeIssue::TotalSizeExceeded(_) => "total_size_exceeded",
            DecodeIssue::LengthOutOfBounds { .. } => "length_out_of_bounds",
            DecodeIssue::TagOrder { .. } => "tag_order",
            DecodeIssue::DuplicateTag(_) => "duplicate_nonrepeatable",
            DecodeIssue::RepeatLimit(_) => "repeat_limit",
            DecodeIssue::EntryLimit => "entry_limit_exceeded",
            DecodeIssue::EndNotFinal { .. } => "end_not_final",
            DecodeIssue::EndLengthNonzero => "end_length_nonzero",
            DecodeIssue::InvalidValue { .. } => "invalid_value",
            DecodeIssue::SchemaVersion(_) => "schema_version",
            DecodeIssue::IdMissing => "id_missing",
            DecodeIssue::VersionMissing => "version_missing",
            DecodeIssue::VersionInvalid(_) => "version_invalid",
            DecodeIssue::EntrypointMissing => "entrypoint_missing",
        }
    }
}

impl fmt::Display for DecodeIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeIssue::FormatVersion(version) => write!(f, "unsupported format version {version}"),
            DecodeIssue::TotalSizeMismatch { declared, actual } => {
                write!(f, "header declares {declared} bytes but blob has {actual}")
            }
            DecodeIssue::TotalSizeExceeded(size) => {
                write!(f, "{size} bytes exceeds the {MAX_TOTAL_SIZE} byte limit")
            }
            DecodeIssue::LengthOutOfBounds { offset } => {
                write!(f, "record at payload offset {offset} runs past the end")
            }
            DecodeIssue::TagOrder { tag, previous } => {
                write!(f, "tag {tag} follows tag {previous}, remaining records dropped")
            }
            DecodeIssue::DuplicateTag(tag) => write!(f, "tag {tag} repeated, later value dropped"),
            DecodeIssue::RepeatLimit(tag) => {
                write!(f, "tag {tag} repeated more than {MAX_REPEATS} times")
            }
            DecodeIssue::EntryLimit => write!(f, "more than {MAX_ENTRIES} records"),
            DecodeIssue::EndNotFinal { offset } => {
                write!(f, "END record at payload offset {offset} is not last")
            }
            DecodeIssue::EndLengthNonzero => write!(f, "END record carries a value"),
            DecodeIssue::InvalidValue { tag, reason } => {
                write!(f, "tag {tag} value dropped: {reason}")
            }
            DecodeIssue::SchemaVersion(found) => write!(f, "unexpected schema version {found:?}"),
            DecodeIssue::IdMissing => write!(f, "id is missing"),
            DecodeIssue::VersionMissing => write!(f, "version is missing"),
            DecodeIssue::VersionInvalid(version) => write!(f, "version {version:?} is not semver"),
            DecodeIssue::EntrypointMissing => write!(f, "entrypoint is missing"),
        }
    }
}

/// One raw payload record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlvEntry {
    pub tag: u16,
    pub value: Vec<u8>,
}

/// The best-effort result of decoding a manifest blob.
#[derive(Debug, Clone, Default)]
pub struct DecodedManifest {
    pub manifest: Manifest,
    /// Records accepted by the structural pass, in payload order.
    pub entries: Vec<TlvEntry>,
    pub issues: Vec<DecodeIssue>,
    /// False when the record structure itself could not be trusted.
    pub structurally_valid: bool,
}

fn read_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

/// Decode a manifest blob.
pub fn decode(blob: &[u8]) -> Result<DecodedManifest, ManifestError> {
    if blob.len() < HEADER_SIZE {
        return Err(ManifestError::HeaderTooSmall(blob.len()));
    }
    if blob[0..4] != MAGIC {
        return Err(ManifestError::BadMagic);
    }

    let mut decoded = DecodedManifest {
        structurally_valid: true,
        ..Default::default()
    };

    let format_version = read_u16(blob, 4);
    if format_version != FORMAT_VERSION {
        decoded.issues.push(DecodeIssue::FormatVersion(format_version));
    }

    let declared = read_u32(blob, 8) as usize;
    if blob.len() > MAX_TOTAL_SIZE {
        decoded.issues.push(DecodeIssue::TotalSizeExceeded(blob.len()));
        decoded.structurally_valid = false;
        return Ok(finish(decoded));
    }
    if declared != blob.len() {
        decoded.issues.push(DecodeIssue::TotalSizeMismatch {
            declared,
            actual: blob.len(),
        });
        decoded.structurally_valid = false;
        return Ok(finish(decoded));
    }

    let payload = &blob[HEADER_SIZE..];
    let expected = read_u32(blob, 12);
    let actual = crc32fast::hash(payload);
    if expected != actual {
        return Err(ManifestError::CrcMismatch { expected, actual });
    }

    read_records(payload, &mut decoded);
    populate(&mut decoded);
    Ok(finish(decoded))
}

/// Structural pass over the payload records.
fn read_records(payload: &[u8], decoded: &mut DecodedManifest) {
    let mut offset = 0;
    let mut previous: Option<u16> = None;
    let mut repeats: BTreeMap<u16, usize> = BTreeMap::new();
    let mut entry_limit_reported = false;

    while offset < payload.len() {
        let record_start = offset;
        if payload.len() - offset < 4 {
            decoded.issues.push(DecodeIssue::LengthOutOfBounds { offset });
            decoded.entries.clear();
            decoded.structurally_valid = false;
            return;
        }
        let tag = read_u16(payload, offset);
        let length = read_u16(payload, offset + 2) as usize;
        offset += 4;
        if length > payload.len() - offset {
            decoded.issues.push(DecodeIssue::LengthOutOfBounds {
                offset: record_start,
            });
            decoded.entries.clear();
            decoded.structurally_valid = false;
            return;
        }
        let value = &payload[offset..offset + length];
        offset += length;

        if tag == Tag::End.code() {
            if offset == payload.len() {
                if length != 0 {
                    decoded.issues.push(DecodeIssue::EndLengthNonzero);
                }
                return;
            }
            decoded.issues.push(DecodeIssue::EndNotFinal {
                offset: record_start,
            });
            continue;
        }

        if let Some(previous) = previous {
            if tag < previous {
                tracing::warn!(tag, previous, "manifest records out of order, truncating");
                decoded.issues.push(DecodeIssue::TagOrder { tag, previous });
                return;
            }
            if tag == previous && !is_repeatable_code(tag) {
                decoded.issues.push(DecodeIssue::DuplicateTag(tag));
                continue;
            }
        }
        previous = Some(tag);

        if decoded.entries.len() >= MAX_ENTRIES {
            if !entry_limit_reported {
                decoded.issues.push(DecodeIssue::EntryLimit);
                entry_limit_reported = true;
            }
            continue;
        }
        if is_repeatable_code(tag) {
            let count = repeats.entry(tag).or_default();
            if *count >= MAX_REPEATS {
                decoded.issues.push(DecodeIssue::RepeatLimit(tag));
                continue;
            }
            *count += 1;
        }

        decoded.entries.push(TlvEntry {
            tag,
            value: value.to_vec(),
        });
    }
}

fn text_value(value: &[u8]) -> Result<&str, &'static str> {
    let text = std::str::from_utf8(value).map_err(|_| "not_utf8")?;
    if text.contains('\0') {
        return Err("contains_nul");
    }
    if text.len() > MAX_STRING_LEN {
        return Err("too_long");
    }
    Ok(text)
}

fn relative_path(text: &str) -> Result<String, &'static str> {
    if text.is_empty() {
        return Err("empty_path");
    }
    if is_absolute(text) {
        return Err("absolute_path");
    }
    Ok(text.to_string())
}

/// Semantic pass: turn accepted records into manifest fields.
fn populate(decoded: &mut DecodedManifest) {
    let manifest = &mut decoded.manifest;
    for entry in &decoded.entries {
        let Some(tag) = Tag::from_code(entry.tag) else {
            continue;
        };
        let invalid = |reason| DecodeIssue::InvalidValue {
            tag: entry.tag,
            reason,
        };
        let text = match text_value(&entry.value) {
            Ok(text) => text,
            Err(reason) => {
                decoded.issues.push(invalid(reason));
                continue;
            }
        };

        let applied: Result<(), &'static str> = match tag {
            Tag::End => Ok(()),
            Tag::SchemaVersion => {
                if text != MANIFEST_SCHEMA_VERSION {
                    decoded.issues.push(DecodeIssue::SchemaVersion(text.to_string()));
                }
                Ok(())
            }
            Tag::Id => {
                manifest.id = text.to_string();
                Ok(())
            }
            Tag::Version => match SemVer::parse(text) {
                Ok(_) => {
                    manifest.version = text.to_string();
                    Ok(())
                }
                Err(_) => {
                    decoded.issues.push(DecodeIssue::VersionInvalid(text.to_string()));
                    Ok(())
                }
            },
            Tag::NakId => {
                manifest.nak_id = text.to_string();
                Ok(())
            }
            Tag::NakVersionReq => VersionRange::parse(text)
                .map(|_| manifest.nak_version_req = text.to_string())
                .map_err(|_| "invalid_range"),
            Tag::NakLoader => {
                manifest.nak_loader = text.to_string();
                Ok(())
            }
            Tag::EntrypointPath => {
                relative_path(text).map(|path| manifest.entrypoint = path)
            }
            Tag::EntrypointArg => {
                manifest.entrypoint_args.push(text.to_string());
                Ok(())
            }
            Tag::EnvVar => text
                .parse::<EnvAssignment>()
                .map(|assignment| manifest.env.push(assignment))
                .map_err(|_| "not_key_value"),
            Tag::LibDir => relative_path(text).map(|path| manifest.lib_dirs.push(path)),
            Tag::AssetDir => relative_path(text).map(|path| manifest.asset_dirs.push(path)),
            Tag::AssetExport => text
                .parse::<AssetExportDecl>()
                .map_err(|_| "not_id_path_type")
                .and_then(|export| {
                    relative_path(&export.path)?;
                    manifest.asset_exports.push(export);
                    Ok(())
                }),
            Tag::PermissionFilesystem => {
                manifest.permissions.filesystem.push(text.to_string());
                Ok(())
            }
            Tag::PermissionNetwork => {
                manifest.permissions.network.push(text.to_string());
                Ok(())
            }
            Tag::Description => {
                manifest.description = text.to_string();
                Ok(())
            }
            Tag::Author => {
                manifest.author = text.to_string();
                Ok(())
            }
            Tag::License => {
                manifest.license = text.to_string();
                Ok(())
            }
            Tag::Homepage => {
                manifest.homepage = text.to_string();
                Ok(())
            }
        };
        if let Err(reason) = applied {
            decoded.issues.push(invalid(reason));
        }
    }
}

/// Report required fields that are still missing.
fn finish(mut decoded: DecodedManifest) -> DecodedManifest {
    let manifest = &decoded.manifest;
    let mut missing = Vec::new();
    if manifest.id.is_empty() {
        missing.push(DecodeIssue::IdMissing);
    }
    let version_invalid = decoded
        .issues
        .iter()
        .any(|issue| matches!(issue, DecodeIssue::VersionInvalid(_)));
    if manifest.version.is_empty() && !version_invalid {
        missing.push(DecodeIssue::VersionMissing);
    }
    if manifest.entrypoint.is_empty() {
        missing.push(DecodeIssue::EntrypointMissing);
    }
    decoded.issues.extend(missing);
    decoded
}

/// Records for `manifest`, in the order they are written.
fn records(manifest: &Manifest) -> Vec<(Tag, String)> {
    let mut records = vec![(Tag::SchemaVersion, MANIFEST_SCHEMA_VERSION.to_string())];
    let mut single = |tag: Tag, value: &str| {
        if !value.is_empty() {
            records.push((tag, value.to_string()));
        }
    };
    single(Tag::Id, &manifest.id);
    single(Tag::Version, &manifest.version);
    single(Tag::NakId, &manifest.nak_id);
    single(Tag::NakVersionReq, &manifest.nak_version_req);
    single(Tag::NakLoader, &manifest.nak_loader);
    single(Tag::EntrypointPath, &manifest.entrypoint);

    let repeated = [
        (Tag::EntrypointArg, manifest.entrypoint_args.clone()),
        (Tag::EnvVar, manifest.env.iter().map(ToString::to_string).collect()),
        (Tag::LibDir, manifest.lib_dirs.clone()),
        (Tag::AssetDir, manifest.asset_dirs.clone()),
        (
            Tag::AssetExport,
            manifest.asset_exports.iter().map(ToString::to_string).collect(),
        ),
        (Tag::PermissionFilesystem, manifest.permissions.filesystem.clone()),
        (Tag::PermissionNetwork, manifest.permissions.network.clone()),
    ];
    for (tag, values) in repeated {
        records.extend(values.into_iter().map(|value| (tag, value)));
    }

    let trailing = [
        (Tag::Description, &manifest.description),
        (Tag::Author, &manifest.author),
        (Tag::License, &manifest.license),
        (Tag::Homepage, &manifest.homepage),
    ];
    for (tag, value) in trailing {
        if !value.is_empty() {
            records.push((tag, value.clone()));
        }
    }
    records
}

/// Encode `manifest` into a blob that [`decode`] reads back unchanged.
pub fn encode(manifest: &Manifest) -> Result<Vec<u8>, ManifestError> {
    // ':' separates the fields of an export record
    if let Some(export) = manifest
        .asset_exports
        .iter()
        .find(|export| export.id.contains(':') || export.path.contains(':'))
    {
        return Err(ManifestError::Unencodable {
            tag: Tag::AssetExport,
            reason: format!("export {:?} has ':' in its id or path", export.id),
        });
    }

    let records = records(manifest);
    if records.len() > MAX_ENTRIES {
        return Err(ManifestError::Unencodable {
            tag: Tag::End,
            reason: format!("{} records, limit is {MAX_ENTRIES}", records.len()),
        });
    }

    let mut repeats: BTreeMap<Tag, usize> = BTreeMap::new();
    let mut payload = Vec::new();
    for (tag, value) in &records {
        let unencodable = |reason: String| ManifestError::Unencodable { tag: *tag, reason };
        if value.len() > MAX_STRING_LEN {
            return Err(unencodable(format!(
                "{} bytes, limit is {MAX_STRING_LEN}",
                value.len()
            )));
        }
        if value.contains('\0') {
            return Err(unencodable("contains a NUL byte".to_string()));
        }
        if tag.is_repeatable() {
            let count = repeats.entry(*tag).or_default();
            *count += 1;
            if *count > MAX_REPEATS {
                return Err(unencodable(format!("more than {MAX_REPEATS} values")));
            }
        }
        payload.extend_from_slice(&tag.code().to_le_bytes());
        payload.extend_from_slice(&(value.len() as u16).to_le_bytes());
        payload.extend_from_slice(value.as_bytes());
    }
    payload.extend_from_slice(&Tag::End.code().to_le_bytes());
    payload.extend_from_slice(&0u16.to_le_bytes());

    let total = HEADER_SIZE + payload.len();
    if total > MAX_TOTAL_SIZE {
        return Err(ManifestError::TooLarge(total));
    }

    let mut blob = Vec::with_capacity(total);
    blob.extend_from_slice(&MAGIC);
    blob.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    blob.extend_from_slice(&0u16.to_le_bytes());
    blob.extend_from_slice(&(total as u32).to_le_bytes());
    blob.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    blob.extend_from_slice(&payload);
    Ok(blob)
}
