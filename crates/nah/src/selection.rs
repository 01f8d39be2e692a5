// Copyright (c) Contributors to the NAH project.
// SPDX-License-Identifier: Apache-2.0

//! Install-time choice of the runtime bundle an application is pinned to.

use crate::install::NakPin;
use crate::manifest::Manifest;
use crate::profile::{BindingMode, HostProfile};
use crate::runtime::RuntimeInventory;
use crate::version::{SemVer, VersionRange, select_best};
use crate::warnings::{Warning, WarningCollector};

#[cfg(test)]
#[path = "./selection_test.rs"]
mod selection_test;

/// Choose a bundle for `manifest` from `inventory` under the host's binding
/// mode.
///
/// Returns `None` when the application needs no bundle, or when no acceptable
/// bundle exists; the latter is reported through `warnings`.
pub fn select_nak(
    manifest: &Manifest,
    profile: &HostProfile,
    inventory: &RuntimeInventory,
    warnings: &mut WarningCollector,
) -> Option<NakPin> {
    if !manifest.has_nak() {
        return None;
    }

    let range = match manifest.nak_requirement() {
        None => VersionRange::any(),
        Some(Ok(range)) => range,
        Some(Err(err)) => {
            warnings.emit(Warning::NakVersionUnsupported {
                nak_id: manifest.nak_id.clone(),
                version: String::new(),
                requirement: manifest.nak_version_req.clone(),
                reason: err.to_string(),
            });
            return None;
        }
    };

    let pin = match profile.nak.binding_mode {
        BindingMode::Canonical => select_canonical(manifest, profile, inventory, &range, warnings),
        BindingMode::Mapped => select_mapped(manifest, profile, inventory, &range, warnings),
    }?;
    tracing::debug!(
        nak = %pin.id,
        version = %pin.version,
        record = %pin.record_ref,
        reason = %pin.selection_reason,
        "selected runtime"
    );
    Some(pin)
}

fn select_canonical(
    manifest: &Manifest,
    profile: &HostProfile,
    inventory: &RuntimeInventory,
    range: &VersionRange,
    warnings: &mut WarningCollector,
) -> Option<NakPin> {
    let mut installed = 0;
    let mut candidates: Vec<(SemVer, &str)> = Vec::new();
    for (record_ref, descriptor) in inventory.iter() {
        if descriptor.id() != manifest.nak_id {
            continue;
        }
        installed += 1;
        let Ok(version) = descriptor.semver() else {
            tracing::debug!(record = record_ref, "ignoring runtime with unparseable version");
            continue;
        };
        if profile.nak.version_allowed(descriptor.version()) {
            candidates.push((version, record_ref));
        }
    }

    if installed == 0 {
        warnings.emit(Warning::NakNotFound {
            nak_id: manifest.nak_id.clone(),
            requirement: range.to_string(),
        });
        return None;
    }

    let Some(best) = select_best(candidates.iter().map(|(version, _)| version), range) else {
        warnings.emit(Warning::NakVersionUnsupported {
            nak_id: manifest.nak_id.clone(),
            version: String::new(),
            requirement: range.to_string(),
            reason: "no_allowed_version_satisfies".to_string(),
        });
        return None;
    };

    // inventory iteration is sorted, so equal versions resolve to the first
    // record reference
    let (version, record_ref) = candidates
        .iter()
        .find(|(version, _)| version == best && version.build() == best.build())?;
    Some(NakPin {
        id: manifest.nak_id.clone(),
        version: version.to_string(),
        record_ref: record_ref.to_string(),
        loader: manifest.nak_loader.clone(),
        selection_reason: "canonical".to_string(),
    })
}

fn select_mapped(
    manifest: &Manifest,
    profile: &HostProfile,
    inventory: &RuntimeInventory,
    range: &VersionRange,
    warnings: &mut WarningCollector,
) -> Option<NakPin> {
    let key = range.selection_key();
    let Some(record_ref) = profile.nak.map.get(&key).filter(|_| !key.is_empty()) else {
        warnings.emit(Warning::NakNotFound {
            nak_id: manifest.nak_id.clone(),
            requirement: range.to_string(),
        });
        return None;
    };
    let Some(descriptor) = inventory.get(record_ref) else {
        warnings.emit(Warning::NakNotFound {
            nak_id: manifest.nak_id.clone(),
            requirement: range.to_string(),
        });
        return None;
    };

    let unsupported = |reason: &str| Warning::NakVersionUnsupported {
        nak_id: manifest.nak_id.clone(),
        version: descriptor.version().to_string(),
        requirement: range.to_string(),
        reason: reason.to_string(),
    };
    if descriptor.id() != manifest.nak_id {
        warnings.emit(unsupported("id_mismatch"));
        return None;
    }
    match descriptor.semver() {
        Ok(version) if range.satisfies(&version) => {}
        _ => {
            warnings.emit(unsupported("requirement_not_satisfied"));
            return None;
        }
    }
    if !profile.nak.version_allowed(descriptor.version()) {
        warnings.emit(unsupported("denied_by_profile"));
        return None;
    }

    Some(NakPin {
        id: manifest.nak_id.clone(),
        version: descriptor.version().to_string(),
        record_ref: record_ref.clone(),
        loader: manifest.nak_loader.clone(),
        selection_reason: "mapped".to_string(),
    })
}
