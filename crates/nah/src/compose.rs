// Copyright (c) Contributors to the NAH project.
// SPDX-License-Identifier: Apache-2.0

//! Composition of a launch contract from a manifest, a host profile, an
//! install record and the runtime inventory.
//!
//! Composition is a pure function of its inputs. It performs no I/O and never
//! fails with an [`crate::Error`]: anomalies are either routed through the
//! host's warning policy or, when no safe contract can exist, reported as a
//! [`CriticalError`] on the result.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::capabilities::derive_capabilities;
use crate::codec::{self, ManifestError};
use crate::contract::{
    AppSection, CompositionResult, CompositionTrace, CriticalError, ExecutionSection, ExportEntry,
    LaunchContract, NakSection, TraceEntry,
};
use crate::environment::{
    EnvLayer, EnvOp, MergePolicy, SourceKind, expand_environment, expand_placeholders,
    merge_layers,
};
use crate::install::InstallRecord;
use crate::manifest::Manifest;
use crate::overrides::{OverrideSet, filter_environment};
use crate::path::{PathError, contain_absolute, is_absolute, normalize_under_root};
use crate::profile::HostProfile;
use crate::runtime::{Loader, RuntimeDescriptor, RuntimeInventory};
use crate::trust::evaluate_trust;
use crate::version::VersionRange;
use crate::warnings::{Warning, WarningCollector};

#[cfg(test)]
#[path = "./compose_test.rs"]
mod compose_test;

pub const NAH_APP_ID: &str = "NAH_APP_ID";
pub const NAH_APP_VERSION: &str = "NAH_APP_VERSION";
pub const NAH_APP_ROOT: &str = "NAH_APP_ROOT";
pub const NAH_APP_ENTRY: &str = "NAH_APP_ENTRY";
pub const NAH_NAK_ID: &str = "NAH_NAK_ID";
pub const NAH_NAK_VERSION: &str = "NAH_NAK_VERSION";
pub const NAH_NAK_ROOT: &str = "NAH_NAK_ROOT";

/// Variables generated by composition. Values from any other source are
/// replaced, and without a runtime bundle the `NAH_NAK_*` ones are unset.
pub const IDENTITY_VARS: [&str; 7] = [
    NAH_APP_ID,
    NAH_APP_VERSION,
    NAH_APP_ROOT,
    NAH_APP_ENTRY,
    NAH_NAK_ID,
    NAH_NAK_VERSION,
    NAH_NAK_ROOT,
];

const DEFAULT_LOADER: &str = "default";

/// Operating system family the contract is composed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostFamily {
    Linux,
    MacOs,
    Windows,
    Other,
}

impl HostFamily {
    /// The family of the running host.
    pub fn current() -> Self {
        if cfg!(target_os = "linux") {
            HostFamily::Linux
        } else if cfg!(target_os = "macos") {
            HostFamily::MacOs
        } else if cfg!(target_os = "windows") {
            HostFamily::Windows
        } else {
            HostFamily::Other
        }
    }

    /// Environment variable the dynamic loader reads library paths from.
    pub fn library_path_key(&self) -> &'static str {
        match self {
            HostFamily::MacOs => "DYLD_LIBRARY_PATH",
            HostFamily::Windows => "PATH",
            HostFamily::Linux | HostFamily::Other => "LD_LIBRARY_PATH",
        }
    }
}

impl Default for HostFamily {
    fn default() -> Self {
        Self::current()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ComposeOptions {
    /// Record where each generated value came from.
    pub trace: bool,
    pub host: HostFamily,
    /// `NAH_OVERRIDE_*` values given for this launch.
    pub overrides: OverrideSet,
}

/// Compose the launch contract for an installed application.
pub fn compose(
    manifest: &Manifest,
    profile: &HostProfile,
    install: &InstallRecord,
    inventory: &RuntimeInventory,
    now: DateTime<Utc>,
    options: &ComposeOptions,
) -> CompositionResult {
    Composer::new(manifest, profile, install, inventory, now, options).run(Vec::new())
}

/// Decode a binary manifest and compose with it.
///
/// A blob with no recognizable header fails with
/// [`CriticalError::ManifestMissing`] and a checksum failure with
/// [`CriticalError::CrcMismatch`]. Anything else the decoder tolerated is
/// reported as an `invalid_manifest` warning.
pub fn compose_blob(
    blob: &[u8],
    profile: &HostProfile,
    install: &InstallRecord,
    inventory: &RuntimeInventory,
    now: DateTime<Utc>,
    options: &ComposeOptions,
) -> CompositionResult {
    let decoded = match codec::decode(blob) {
        Ok(decoded) => decoded,
        Err(err @ ManifestError::CrcMismatch { .. }) => {
            return CompositionResult::failed(CriticalError::CrcMismatch, err.to_string(), Vec::new());
        }
        Err(err) => {
            return CompositionResult::failed(
                CriticalError::ManifestMissing,
                err.to_string(),
                Vec::new(),
            );
        }
    };

    let issues = decoded
        .issues
        .iter()
        .map(|issue| Warning::InvalidManifest {
            reason: issue.reason().to_string(),
        })
        .collect();
    Composer::new(&decoded.manifest, profile, install, inventory, now, options).run(issues)
}

/// A condition that stops composition.
struct Fatal {
    error: CriticalError,
    context: String,
}

impl Fatal {
    fn new(error: CriticalError, context: impl Into<String>) -> Self {
        Self {
            error,
            context: context.into(),
        }
    }

    fn traversal(what: &str, err: PathError) -> Self {
        Self::new(CriticalError::PathTraversal, format!("{what}: {err}"))
    }
}

/// The bundle composition runs on.
#[derive(Clone, Copy)]
struct Bundle<'a> {
    record_ref: &'a str,
    descriptor: &'a RuntimeDescriptor,
    loader: Option<(&'a str, &'a Loader)>,
}

impl Bundle<'_> {
    fn source_path(&self) -> String {
        self.descriptor.source_label(self.record_ref)
    }
}

struct Composer<'a> {
    manifest: &'a Manifest,
    profile: &'a HostProfile,
    install: &'a InstallRecord,
    inventory: &'a RuntimeInventory,
    now: DateTime<Utc>,
    options: &'a ComposeOptions,
    warnings: WarningCollector,
    trace: CompositionTrace,
}

impl<'a> Composer<'a> {
    fn new(
        manifest: &'a Manifest,
        profile: &'a HostProfile,
        install: &'a InstallRecord,
        inventory: &'a RuntimeInventory,
        now: DateTime<Utc>,
        options: &'a ComposeOptions,
    ) -> Self {
        Self {
            manifest,
            profile,
            install,
            inventory,
            now,
            options,
            warnings: WarningCollector::new(profile.warnings.clone()),
            trace: CompositionTrace::default(),
        }
    }

    fn run(mut self, initial: Vec<Warning>) -> CompositionResult {
        // warning overrides must be in place before anything is reported
        let invocation_env = self
            .options
            .overrides
            .apply(&self.profile.overrides, &mut self.warnings);
        for warning in initial {
            self.warnings.emit(warning);
        }

        match self.build(invocation_env) {
            Ok(contract) => {
                tracing::debug!(app = %contract.app.id, nak = %contract.nak.id, "composed launch contract");
                CompositionResult {
                    ok: true,
                    contract: Some(contract),
                    warnings: self.warnings.into_warnings(),
                    critical_error: None,
                    critical_error_context: String::new(),
                    trace: self.options.trace.then_some(self.trace),
                }
            }
            Err(fatal) => {
                CompositionResult::failed(fatal.error, fatal.context, self.warnings.into_warnings())
            }
        }
    }

    fn build(&mut self, invocation_env: Vec<(String, EnvOp)>) -> Result<LaunchContract, Fatal> {
        let app = self.resolve_app()?;
        let bundle = match self.resolve_bundle() {
            Some((record_ref, descriptor)) => Some(Bundle {
                record_ref,
                descriptor,
                loader: self.select_loader(descriptor)?,
            }),
            None => None,
        };

        let environment = self.compose_environment(&app, bundle, invocation_env);
        let execution = self.resolve_execution(&app, bundle, &environment)?;
        let exports = self.resolve_exports(&app)?;

        let capabilities = derive_capabilities(
            &self.manifest.permissions,
            &self.profile.capabilities,
            &mut self.warnings,
        );
        self.trace.decisions.extend(capabilities.decisions);

        let trust = evaluate_trust(self.install.trust.as_ref(), self.now, &mut self.warnings);

        let nak = bundle
            .map(|bundle| NakSection {
                id: bundle.descriptor.id().to_string(),
                version: bundle.descriptor.version().to_string(),
                root: bundle.descriptor.root().to_string(),
                resource_root: bundle.descriptor.resource_root().to_string(),
                record_ref: bundle.record_ref.to_string(),
                loader: bundle
                    .loader
                    .map(|(name, _)| name.to_string())
                    .unwrap_or_default(),
            })
            .unwrap_or_default();

        Ok(LaunchContract {
            app,
            nak,
            execution,
            environment,
            enforcement: capabilities.enforcement,
            trust,
            capability_usage: capabilities.usage,
            exports,
        })
    }

    fn resolve_app(&mut self) -> Result<AppSection, Fatal> {
        let root = self.install.install_root();
        let entrypoint = self.manifest.entrypoint.as_str();
        if entrypoint.is_empty() || is_absolute(entrypoint) {
            return Err(Fatal::new(
                CriticalError::EntrypointNotFound,
                format!("entrypoint must be a non-empty relative path, got {entrypoint:?}"),
            ));
        }
        let entry = normalize_under_root(root, entrypoint, false)
            .map_err(|err| Fatal::traversal("entrypoint", err))?;

        let snapshot = &self.install.app;
        if !snapshot.id.is_empty() && snapshot.id != self.manifest.id {
            self.warnings.emit(Warning::InvalidConfiguration {
                reason: "app_id_mismatch".to_string(),
                detail: format!(
                    "install record has {:?}, manifest has {:?}",
                    snapshot.id, self.manifest.id
                ),
            });
        }
        if !snapshot.version.is_empty() && snapshot.version != self.manifest.version {
            self.warnings.emit(Warning::InvalidConfiguration {
                reason: "app_version_mismatch".to_string(),
                detail: format!(
                    "install record has {:?}, manifest has {:?}",
                    snapshot.version, self.manifest.version
                ),
            });
        }

        let pick = |recorded: &str, declared: &str| {
            if recorded.is_empty() {
                declared.to_string()
            } else {
                recorded.to_string()
            }
        };
        Ok(AppSection {
            id: pick(&snapshot.id, &self.manifest.id),
            version: pick(&snapshot.version, &self.manifest.version),
            root: root.to_string(),
            entrypoint: entry.into_string(),
        })
    }

    /// Look up the pinned bundle. Every problem here leaves the application
    /// running bundle-less.
    fn resolve_bundle(&mut self) -> Option<(&'a str, &'a RuntimeDescriptor)> {
        let install = self.install;
        let inventory = self.inventory;
        let manifest = self.manifest;
        let pin = &install.nak;
        if !manifest.has_nak() && !pin.is_set() {
            return None;
        }

        let record_ref = pin.record_ref.as_str();
        let pin_invalid = |reason: &str| Warning::NakPinInvalid {
            reason: reason.to_string(),
            record_ref: record_ref.to_string(),
        };
        if record_ref.is_empty() {
            self.warnings.emit(pin_invalid("record_ref_empty"));
            return None;
        }
        if pin.id.is_empty() || pin.version.is_empty() {
            self.warnings.emit(pin_invalid("pin_fields_missing"));
            return None;
        }
        let Some(descriptor) = inventory.get(record_ref) else {
            self.warnings.emit(pin_invalid("record_not_found"));
            return None;
        };
        if pin.version != descriptor.version() {
            self.warnings.emit(pin_invalid("version_mismatch"));
            return None;
        }

        let requirement = if manifest.nak_version_req.is_empty() {
            install.app.nak_version_req.as_str()
        } else {
            manifest.nak_version_req.as_str()
        };
        let unsupported = |reason: &str| Warning::NakVersionUnsupported {
            nak_id: descriptor.id().to_string(),
            version: descriptor.version().to_string(),
            requirement: requirement.to_string(),
            reason: reason.to_string(),
        };

        let expected_id = if manifest.nak_id.is_empty() {
            pin.id.as_str()
        } else {
            manifest.nak_id.as_str()
        };
        if (!expected_id.is_empty() && expected_id != descriptor.id())
            || (!pin.id.is_empty() && pin.id != descriptor.id())
        {
            self.warnings.emit(unsupported("id_mismatch"));
            return None;
        }
        if !requirement.trim().is_empty() {
            let satisfied = VersionRange::parse(requirement)
                .ok()
                .zip(descriptor.semver().ok())
                .is_some_and(|(range, version)| range.satisfies(&version));
            if !satisfied {
                self.warnings.emit(unsupported("requirement_not_satisfied"));
                return None;
            }
        }
        if !self.profile.nak.version_allowed(descriptor.version()) {
            self.warnings.emit(unsupported("denied_by_profile"));
            return None;
        }

        self.trace.decisions.push(format!(
            "runtime {}@{} resolved from {record_ref}",
            descriptor.id(),
            descriptor.version()
        ));
        Some((record_ref, descriptor))
    }

    fn select_loader(
        &mut self,
        descriptor: &'a RuntimeDescriptor,
    ) -> Result<Option<(&'a str, &'a Loader)>, Fatal> {
        let requested = if self.install.nak.loader.is_empty() {
            self.manifest.nak_loader.as_str()
        } else {
            self.install.nak.loader.as_str()
        };

        if !requested.is_empty() {
            return match descriptor.loaders.get_key_value(requested) {
                Some((name, loader)) => {
                    self.trace
                        .decisions
                        .push(format!("loader {name} requested explicitly"));
                    Ok(Some((name.as_str(), loader)))
                }
                None => {
                    self.warnings.emit(Warning::NakLoaderMissing {
                        loader: requested.to_string(),
                        nak_id: descriptor.id().to_string(),
                    });
                    Err(Fatal::new(
                        CriticalError::NakLoaderInvalid,
                        format!("runtime {} has no loader {requested:?}", descriptor.id()),
                    ))
                }
            };
        }

        let chosen = if descriptor.loaders.len() == 1 {
            descriptor.loaders.iter().next()
        } else {
            descriptor.loaders.get_key_value(DEFAULT_LOADER)
        };
        match chosen {
            Some((name, loader)) => {
                tracing::debug!(loader = %name, "selected runtime loader");
                self.trace
                    .decisions
                    .push(format!("loader {name} selected automatically"));
                Ok(Some((name.as_str(), loader)))
            }
            None => {
                if !descriptor.loaders.is_empty() {
                    self.warnings.emit(Warning::NakLoaderRequired {
                        loaders: descriptor.loaders.keys().cloned().collect(),
                    });
                }
                self.trace
                    .decisions
                    .push("no loader selected, running the entrypoint".to_string());
                Ok(None)
            }
        }
    }

    fn compose_environment(
        &mut self,
        app: &AppSection,
        bundle: Option<Bundle<'a>>,
        invocation_env: Vec<(String, EnvOp)>,
    ) -> BTreeMap<String, String> {
        let manifest = self.manifest;
        let mut layers = vec![
            EnvLayer::new(SourceKind::HostProfile, self.profile.source_label(), MergePolicy::Fill)
                .with_values(self.profile.environment.clone()),
        ];
        if let Some(bundle) = bundle {
            layers.push(
                EnvLayer::new(SourceKind::NakRecord, bundle.source_path(), MergePolicy::Fill)
                    .with_values(bundle.descriptor.environment.clone()),
            );
        }
        layers.push(
            EnvLayer::new(SourceKind::Manifest, "manifest", MergePolicy::Fill).with_values(
                manifest
                    .env
                    .iter()
                    .map(|assignment| (assignment.key.clone(), assignment.value.clone())),
            ),
        );

        let install_env = filter_environment(
            self.install.overrides.environment.clone().into_iter().collect(),
            &self.profile.overrides,
            SourceKind::InstallRecord,
            &mut self.warnings,
        );
        layers.push(
            EnvLayer::new(
                SourceKind::InstallRecord,
                self.install.source_label(),
                MergePolicy::Overwrite,
            )
            .with_values(install_env),
        );
        layers.push(
            EnvLayer::new(
                SourceKind::InvocationOverride,
                "NAH_OVERRIDE_ENVIRONMENT",
                MergePolicy::Overwrite,
            )
            .with_values(invocation_env),
        );

        let mut identity = vec![
            (NAH_APP_ID, EnvOp::from(app.id.clone())),
            (NAH_APP_VERSION, EnvOp::from(app.version.clone())),
            (NAH_APP_ROOT, EnvOp::from(app.root.clone())),
            (NAH_APP_ENTRY, EnvOp::from(app.entrypoint.clone())),
        ];
        match bundle {
            Some(bundle) => identity.extend([
                (NAH_NAK_ID, EnvOp::from(bundle.descriptor.id())),
                (NAH_NAK_VERSION, EnvOp::from(bundle.descriptor.version())),
                (NAH_NAK_ROOT, EnvOp::from(bundle.descriptor.root())),
            ]),
            None => identity.extend([
                (NAH_NAK_ID, EnvOp::Unset),
                (NAH_NAK_VERSION, EnvOp::Unset),
                (NAH_NAK_ROOT, EnvOp::Unset),
            ]),
        }
        layers.push(
            EnvLayer::new(SourceKind::NahStandard, "nah", MergePolicy::Overwrite)
                .with_values(identity),
        );

        let mut merged = merge_layers(&layers);
        expand_environment(&mut merged, &IDENTITY_VARS, &mut self.warnings);
        self.trace.environment = merged.trace;
        merged.values
    }

    fn resolve_execution(
        &mut self,
        app: &AppSection,
        bundle: Option<Bundle<'a>>,
        environment: &BTreeMap<String, String>,
    ) -> Result<ExecutionSection, Fatal> {
        let install = self.install;
        let overrides = &install.overrides.arguments;
        let mut arguments = overrides.prepend.clone();

        let binary = match bundle.and_then(|bundle| bundle.loader.map(|loader| (bundle, loader))) {
            Some((bundle, (name, loader))) => {
                let binary = contain_absolute(bundle.descriptor.root(), &loader.exec_path)
                    .map_err(|err| Fatal::traversal(&format!("loader {name}"), err))?;
                let source_path = bundle.source_path();
                arguments.extend(loader.args_template.iter().map(|template| {
                    expand_placeholders(template, environment, &source_path, &mut self.warnings)
                }));
                self.trace.execution.insert(
                    "binary".to_string(),
                    TraceEntry::new(binary.as_str(), SourceKind::NakRecord, source_path),
                );
                binary.into_string()
            }
            None => {
                self.trace.execution.insert(
                    "binary".to_string(),
                    TraceEntry::new(&app.entrypoint, SourceKind::Manifest, "manifest"),
                );
                app.entrypoint.clone()
            }
        };
        arguments.extend(self.manifest.entrypoint_args.iter().cloned());
        arguments.extend(overrides.append.iter().cloned());

        let cwd = match bundle.filter(|bundle| !bundle.descriptor.execution.cwd.is_empty()) {
            Some(bundle) => {
                let source_path = bundle.source_path();
                let template = &bundle.descriptor.execution.cwd;
                let expanded =
                    expand_placeholders(template, environment, &source_path, &mut self.warnings);
                let root = bundle.descriptor.root();
                let cwd = if is_absolute(&expanded) {
                    contain_absolute(root, &expanded)
                } else {
                    normalize_under_root(root, &expanded, false)
                }
                .map_err(|err| Fatal::traversal("working directory", err))?;
                self.trace.execution.insert(
                    "cwd".to_string(),
                    TraceEntry::new(cwd.as_str(), SourceKind::NakRecord, source_path),
                );
                cwd.into_string()
            }
            None => {
                self.trace.execution.insert(
                    "cwd".to_string(),
                    TraceEntry::new(&app.root, SourceKind::NahStandard, "nah"),
                );
                app.root.clone()
            }
        };

        Ok(ExecutionSection {
            binary,
            arguments,
            cwd,
            library_path_env_key: self.options.host.library_path_key().to_string(),
            library_paths: self.resolve_library_paths(app, bundle, environment)?,
        })
    }

    fn resolve_library_paths(
        &mut self,
        app: &AppSection,
        bundle: Option<Bundle<'a>>,
        environment: &BTreeMap<String, String>,
    ) -> Result<Vec<String>, Fatal> {
        let (profile, install, manifest) = (self.profile, self.install, self.manifest);
        let mut paths = Vec::new();
        let profile_source = profile.source_label();
        let install_source = install.source_label();

        self.push_host_paths(
            &mut paths,
            &profile.paths.library_prepend,
            SourceKind::HostProfile,
            &profile_source,
            environment,
        );
        self.push_host_paths(
            &mut paths,
            &install.overrides.paths.library_prepend,
            SourceKind::InstallRecord,
            &install_source,
            environment,
        );

        if let Some(bundle) = bundle {
            let source_path = bundle.source_path();
            for dir in &bundle.descriptor.paths.lib_dirs {
                let path = contain_absolute(bundle.descriptor.root(), dir)
                    .map_err(|err| Fatal::traversal("runtime library directory", err))?;
                self.push_trace(path.as_str(), SourceKind::NakRecord, &source_path);
                paths.push(path.into_string());
            }
        }

        for dir in &manifest.lib_dirs {
            let path = normalize_under_root(&app.root, dir, false)
                .map_err(|err| Fatal::traversal("library directory", err))?;
            self.push_trace(path.as_str(), SourceKind::Manifest, "manifest");
            paths.push(path.into_string());
        }

        self.push_host_paths(
            &mut paths,
            &profile.paths.library_append,
            SourceKind::HostProfile,
            &profile_source,
            environment,
        );
        Ok(paths)
    }

    /// Host-supplied paths are trusted but must still be absolute once
    /// expanded.
    fn push_host_paths(
        &mut self,
        paths: &mut Vec<String>,
        candidates: &[String],
        kind: SourceKind,
        source_path: &str,
        environment: &BTreeMap<String, String>,
    ) {
        for candidate in candidates {
            let expanded = expand_placeholders(candidate, environment, source_path, &mut self.warnings);
            if !is_absolute(&expanded) || expanded.contains('\0') {
                self.warnings.emit(Warning::InvalidLibraryPath {
                    path: expanded,
                    source_kind: kind.to_string(),
                });
                continue;
            }
            self.push_trace(&expanded, kind, source_path);
            paths.push(expanded);
        }
    }

    fn push_trace(&mut self, value: &str, kind: SourceKind, source_path: &str) {
        self.trace
            .library_paths
            .push(TraceEntry::new(value, kind, source_path));
    }

    fn resolve_exports(&mut self, app: &AppSection) -> Result<BTreeMap<String, ExportEntry>, Fatal> {
        let mut exports = BTreeMap::new();
        for export in &self.manifest.asset_exports {
            let path = normalize_under_root(&app.root, &export.path, false)
                .map_err(|err| Fatal::traversal(&format!("asset export {}", export.id), err))?;
            // later declarations of the same id win
            exports.insert(
                export.id.clone(),
                ExportEntry {
                    id: export.id.clone(),
                    path: path.into_string(),
                    kind: export.kind.clone(),
                },
            );
        }
        Ok(exports)
    }
}
