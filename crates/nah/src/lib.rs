// Copyright (c) Contributors to the NAH project.
// SPDX-License-Identifier: Apache-2.0

//! nah - launch composition for native application hosts
//!
//! This crate derives everything needed to execute an installed application
//! from four read-only inputs: the application's manifest, the host profile,
//! the install record, and the inventory of installed runtime bundles ("naks").
//!
//! # Overview
//!
//! Composition is deterministic and performs no I/O. Identical inputs always
//! give a byte-identical launch contract. Anomalies are classified by the
//! host's warning policy and only a small set of unsafe conditions stop
//! composition altogether.
//!
//! # Example
//!
//! ```json
//! {
//!   "$schema": "nah.host.profile.v1",
//!   "nak": {"binding_mode": "canonical", "deny_versions": ["5.4.0"]},
//!   "environment": {"LANG": "C.UTF-8"},
//!   "paths": {"library_prepend": ["/opt/host/lib"]},
//!   "warnings": {"trust_state_unknown": "error"},
//!   "overrides": {"mode": "allowlist", "allow_keys": ["DEBUG"]}
//! }
//! ```

pub mod capabilities;
pub mod codec;
pub mod compose;
pub mod contract;
mod document;
pub mod environment;
pub mod error;
pub mod install;
pub mod manifest;
pub mod overrides;
pub mod path;
pub mod profile;
pub mod runtime;
pub mod selection;
pub mod trust;
pub mod version;
pub mod warnings;

pub use codec::{DecodedManifest, ManifestError, decode, encode};
pub use compose::{ComposeOptions, HostFamily, compose, compose_blob};
pub use contract::{CompositionResult, CriticalError, LaunchContract};
pub use environment::EnvOp;
pub use error::{Error, Result};
pub use install::{InstallRecord, NakPin};
pub use manifest::Manifest;
pub use overrides::OverrideSet;
pub use path::{AbsolutePath, PathError, contain_absolute, normalize_under_root};
pub use profile::HostProfile;
pub use runtime::{RuntimeDescriptor, RuntimeInventory};
pub use selection::select_nak;
pub use trust::{TrustInfo, TrustState};
pub use version::{SemVer, VersionRange, parse_range, parse_version, select_best};
pub use warnings::{Warning, WarningAction, WarningCollector, WarningKind, WarningObject};

/// Conventional file extension for binary manifests.
pub const MANIFEST_EXTENSION: &str = "nahm";
