// Copyright (c) Contributors to the NAH project.
// SPDX-License-Identifier: Apache-2.0

use chrono::TimeZone;
use rstest::{fixture, rstest};

use super::*;
use crate::environment::SourceKind;
use crate::install::NakPin;
use crate::manifest::{AssetExportDecl, EnvAssignment};
use crate::runtime::{NakIdentity, RuntimeExecution, RuntimePaths};
use crate::trust::{TrustInfo, TrustState};
use crate::warnings::{WarningAction, WarningKind};

const APP_ROOT: &str = "/nah/apps/hello";
const NAK_ROOT: &str = "/nah/naks/lua/5.4.6";
const LUA_REF: &str = "lua@5.4.6.json";

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).unwrap()
}

fn options() -> ComposeOptions {
    ComposeOptions {
        trace: false,
        host: HostFamily::Linux,
        overrides: OverrideSet::default(),
    }
}

fn hello_manifest() -> Manifest {
    Manifest {
        id: "com.example.hello".to_string(),
        version: "1.0.0".to_string(),
        entrypoint: "bin/hello".to_string(),
        ..Default::default()
    }
}

fn lua_manifest() -> Manifest {
    Manifest {
        id: "com.example.script".to_string(),
        version: "2.1.0".to_string(),
        nak_id: "lua".to_string(),
        nak_version_req: "^5.4".to_string(),
        entrypoint: "main.lua".to_string(),
        entrypoint_args: vec!["--serve".to_string()],
        lib_dirs: vec!["lib".to_string()],
        ..Default::default()
    }
}

fn verified() -> Option<TrustInfo> {
    Some(TrustInfo {
        state: TrustState::Verified,
        source: "ci".to_string(),
        ..Default::default()
    })
}

fn install_for(manifest: &Manifest) -> InstallRecord {
    let mut install = InstallRecord::default();
    install.paths.install_root = APP_ROOT.to_string();
    install.app.id = manifest.id.clone();
    install.app.version = manifest.version.clone();
    install.trust = verified();
    if manifest.has_nak() {
        install.nak = NakPin {
            id: "lua".to_string(),
            version: "5.4.6".to_string(),
            record_ref: LUA_REF.to_string(),
            ..Default::default()
        };
    }
    install
}

fn lua_descriptor() -> RuntimeDescriptor {
    RuntimeDescriptor {
        nak: NakIdentity {
            id: "lua".to_string(),
            version: "5.4.6".to_string(),
        },
        paths: RuntimePaths {
            root: NAK_ROOT.to_string(),
            resource_root: String::new(),
            lib_dirs: vec![format!("{NAK_ROOT}/lib")],
        },
        environment: BTreeMap::from([(
            "LUA_INIT".to_string(),
            "@{NAH_NAK_ROOT}/init.lua".to_string(),
        )]),
        loaders: BTreeMap::from([(
            "default".to_string(),
            Loader {
                exec_path: format!("{NAK_ROOT}/bin/lua"),
                args_template: vec!["{NAH_APP_ENTRY}".to_string()],
            },
        )]),
        execution: RuntimeExecution {
            cwd: "work".to_string(),
        },
        ..Default::default()
    }
}

#[fixture]
fn inventory() -> RuntimeInventory {
    let mut inventory = RuntimeInventory::new();
    inventory.insert(LUA_REF, lua_descriptor());
    inventory
}

fn keys(result: &CompositionResult) -> Vec<WarningKind> {
    result.warnings.iter().map(|warning| warning.key).collect()
}

fn contract(result: &CompositionResult) -> &LaunchContract {
    result.contract.as_ref().expect("composition should succeed")
}

#[rstest]
fn test_hello_without_runtime(inventory: RuntimeInventory) {
    let manifest = hello_manifest();
    let result = compose(
        &manifest,
        &HostProfile::default(),
        &install_for(&manifest),
        &inventory,
        now(),
        &options(),
    );
    assert!(result.ok);
    assert!(result.critical_error.is_none());
    assert!(result.warnings.is_empty(), "{:?}", result.warnings);

    let contract = contract(&result);
    assert_eq!(contract.execution.binary, format!("{APP_ROOT}/bin/hello"));
    assert_eq!(contract.execution.cwd, APP_ROOT);
    assert!(contract.execution.arguments.is_empty());
    assert_eq!(contract.environment[NAH_APP_ID], "com.example.hello");
    assert_eq!(contract.environment[NAH_APP_ENTRY], format!("{APP_ROOT}/bin/hello"));
    assert!(!contract.environment.contains_key(NAH_NAK_ID));
    assert_eq!(contract.nak, NakSection::default());
    assert_eq!(contract.trust.state, TrustState::Verified);
    assert!(!contract.capability_usage.present);
    assert!(result.trace.is_none());
}

#[rstest]
#[case("../../../etc/passwd")]
#[case("bin/../../escape")]
fn test_entrypoint_traversal(inventory: RuntimeInventory, #[case] entrypoint: &str) {
    let mut manifest = hello_manifest();
    manifest.entrypoint = entrypoint.to_string();
    let result = compose(
        &manifest,
        &HostProfile::default(),
        &install_for(&manifest),
        &inventory,
        now(),
        &options(),
    );
    assert!(!result.ok);
    assert_eq!(result.critical_error, Some(CriticalError::PathTraversal));
    assert!(result.contract.is_none());
}

#[rstest]
#[case("")]
#[case("/usr/bin/hello")]
fn test_entrypoint_not_found(inventory: RuntimeInventory, #[case] entrypoint: &str) {
    let mut manifest = hello_manifest();
    manifest.entrypoint = entrypoint.to_string();
    let result = compose(
        &manifest,
        &HostProfile::default(),
        &install_for(&manifest),
        &inventory,
        now(),
        &options(),
    );
    assert_eq!(result.critical_error, Some(CriticalError::EntrypointNotFound));
    assert!(result.contract.is_none());
}

#[rstest]
fn test_relative_install_root(inventory: RuntimeInventory) {
    let manifest = hello_manifest();
    let mut install = install_for(&manifest);
    install.paths.install_root = "apps/hello".to_string();
    let result = compose(
        &manifest,
        &HostProfile::default(),
        &install,
        &inventory,
        now(),
        &options(),
    );
    assert_eq!(result.critical_error, Some(CriticalError::PathTraversal));
}

#[rstest]
fn test_empty_record_ref(inventory: RuntimeInventory) {
    let manifest = lua_manifest();
    let mut install = install_for(&manifest);
    install.nak.record_ref.clear();
    let result = compose(
        &manifest,
        &HostProfile::default(),
        &install,
        &inventory,
        now(),
        &options(),
    );
    assert!(result.ok);
    assert_eq!(keys(&result), vec![WarningKind::NakPinInvalid]);
    assert_eq!(result.warnings[0].fields["reason"], "record_ref_empty");
    let contract = contract(&result);
    assert_eq!(contract.nak.id, "");
    assert_eq!(contract.execution.binary, format!("{APP_ROOT}/main.lua"));
}

#[rstest]
#[case("missing.json", "5.4.6", "record_not_found")]
#[case(LUA_REF, "5.4.5", "version_mismatch")]
#[case(LUA_REF, "", "pin_fields_missing")]
fn test_invalid_pin(
    inventory: RuntimeInventory,
    #[case] record_ref: &str,
    #[case] version: &str,
    #[case] reason: &str,
) {
    let manifest = lua_manifest();
    let mut install = install_for(&manifest);
    install.nak.record_ref = record_ref.to_string();
    install.nak.version = version.to_string();
    let result = compose(
        &manifest,
        &HostProfile::default(),
        &install,
        &inventory,
        now(),
        &options(),
    );
    assert!(result.ok);
    assert_eq!(keys(&result), vec![WarningKind::NakPinInvalid]);
    assert_eq!(result.warnings[0].fields["reason"], reason);
    assert_eq!(contract(&result).nak.id, "");
}

#[rstest]
fn test_runtime_composition(inventory: RuntimeInventory) {
    let manifest = lua_manifest();
    let mut profile = HostProfile::default();
    profile.paths.library_prepend = vec!["/opt/host/lib".to_string()];
    profile.paths.library_append = vec!["/usr/local/lib".to_string()];
    let mut install = install_for(&manifest);
    install.overrides.paths.library_prepend = vec!["/opt/install/lib".to_string()];
    install.overrides.arguments.prepend = vec!["-W".to_string()];
    install.overrides.arguments.append = vec!["--verbose".to_string()];

    let result = compose(&manifest, &profile, &install, &inventory, now(), &options());
    assert!(result.ok, "{:?}", result.critical_error_context);
    assert!(result.warnings.is_empty(), "{:?}", result.warnings);

    let contract = contract(&result);
    assert_eq!(contract.nak.id, "lua");
    assert_eq!(contract.nak.loader, "default");
    assert_eq!(contract.nak.record_ref, LUA_REF);
    assert_eq!(contract.nak.resource_root, NAK_ROOT);
    assert_eq!(contract.execution.binary, format!("{NAK_ROOT}/bin/lua"));
    assert_eq!(
        contract.execution.arguments,
        vec![
            "-W".to_string(),
            format!("{APP_ROOT}/main.lua"),
            "--serve".to_string(),
            "--verbose".to_string(),
        ]
    );
    assert_eq!(contract.execution.cwd, format!("{NAK_ROOT}/work"));
    assert_eq!(contract.execution.library_path_env_key, "LD_LIBRARY_PATH");
    assert_eq!(
        contract.execution.library_paths,
        vec![
            "/opt/host/lib".to_string(),
            "/opt/install/lib".to_string(),
            format!("{NAK_ROOT}/lib"),
            format!("{APP_ROOT}/lib"),
            "/usr/local/lib".to_string(),
        ]
    );
    assert_eq!(contract.environment[NAH_NAK_ROOT], NAK_ROOT);
    assert_eq!(contract.environment["LUA_INIT"], format!("@{NAK_ROOT}/init.lua"));
}

#[rstest]
#[case(HostFamily::Linux, "LD_LIBRARY_PATH")]
#[case(HostFamily::MacOs, "DYLD_LIBRARY_PATH")]
#[case(HostFamily::Windows, "PATH")]
#[case(HostFamily::Other, "LD_LIBRARY_PATH")]
fn test_library_path_key(#[case] host: HostFamily, #[case] expected: &str) {
    assert_eq!(host.library_path_key(), expected);
}

#[rstest]
fn test_requested_loader_missing(inventory: RuntimeInventory) {
    let mut manifest = lua_manifest();
    manifest.nak_loader = "jit".to_string();
    let result = compose(
        &manifest,
        &HostProfile::default(),
        &install_for(&manifest),
        &inventory,
        now(),
        &options(),
    );
    assert!(!result.ok);
    assert_eq!(result.critical_error, Some(CriticalError::NakLoaderInvalid));
    assert_eq!(keys(&result), vec![WarningKind::NakLoaderMissing]);
}

#[rstest]
fn test_install_loader_wins_over_manifest() {
    let mut descriptor = lua_descriptor();
    descriptor.loaders.insert(
        "jit".to_string(),
        Loader {
            exec_path: format!("{NAK_ROOT}/bin/luajit"),
            args_template: Vec::new(),
        },
    );
    let inventory: RuntimeInventory = [(LUA_REF.to_string(), descriptor)].into_iter().collect();
    let mut manifest = lua_manifest();
    manifest.nak_loader = "missing".to_string();
    let mut install = install_for(&manifest);
    install.nak.loader = "jit".to_string();

    let result = compose(
        &manifest,
        &HostProfile::default(),
        &install,
        &inventory,
        now(),
        &options(),
    );
    assert!(result.ok);
    assert_eq!(contract(&result).execution.binary, format!("{NAK_ROOT}/bin/luajit"));
}

#[rstest]
fn test_ambiguous_loaders_fall_back_to_entrypoint() {
    let mut descriptor = lua_descriptor();
    let default = descriptor.loaders.remove("default").unwrap();
    descriptor.loaders.insert("a".to_string(), default.clone());
    descriptor.loaders.insert("b".to_string(), default);
    let inventory: RuntimeInventory = [(LUA_REF.to_string(), descriptor)].into_iter().collect();
    let manifest = lua_manifest();

    let result = compose(
        &manifest,
        &HostProfile::default(),
        &install_for(&manifest),
        &inventory,
        now(),
        &options(),
    );
    assert!(result.ok);
    assert_eq!(keys(&result), vec![WarningKind::NakLoaderRequired]);
    assert_eq!(result.warnings[0].fields["loaders"], "a,b");
    let contract = contract(&result);
    assert_eq!(contract.execution.binary, format!("{APP_ROOT}/main.lua"));
    assert_eq!(contract.nak.loader, "");
}

#[rstest]
fn test_loader_outside_runtime_root() {
    let mut descriptor = lua_descriptor();
    descriptor.loaders.insert(
        "default".to_string(),
        Loader {
            exec_path: format!("{NAK_ROOT}/../../../bin/sh"),
            args_template: Vec::new(),
        },
    );
    let inventory: RuntimeInventory = [(LUA_REF.to_string(), descriptor)].into_iter().collect();
    let manifest = lua_manifest();
    let result = compose(
        &manifest,
        &HostProfile::default(),
        &install_for(&manifest),
        &inventory,
        now(),
        &options(),
    );
    assert_eq!(result.critical_error, Some(CriticalError::PathTraversal));
}

#[rstest]
#[case("../work")]
#[case("/tmp")]
fn test_cwd_outside_runtime_root(#[case] cwd: &str) {
    let mut descriptor = lua_descriptor();
    descriptor.execution.cwd = cwd.to_string();
    let inventory: RuntimeInventory = [(LUA_REF.to_string(), descriptor)].into_iter().collect();
    let manifest = lua_manifest();
    let result = compose(
        &manifest,
        &HostProfile::default(),
        &install_for(&manifest),
        &inventory,
        now(),
        &options(),
    );
    assert_eq!(result.critical_error, Some(CriticalError::PathTraversal));
}

#[rstest]
fn test_runtime_lib_dir_outside_root() {
    let mut descriptor = lua_descriptor();
    descriptor.paths.lib_dirs = vec!["/usr/lib".to_string()];
    let inventory: RuntimeInventory = [(LUA_REF.to_string(), descriptor)].into_iter().collect();
    let manifest = lua_manifest();
    let result = compose(
        &manifest,
        &HostProfile::default(),
        &install_for(&manifest),
        &inventory,
        now(),
        &options(),
    );
    assert_eq!(result.critical_error, Some(CriticalError::PathTraversal));
}

#[rstest]
fn test_app_lib_dir_traversal(inventory: RuntimeInventory) {
    let mut manifest = hello_manifest();
    manifest.lib_dirs = vec!["../shared/lib".to_string()];
    let result = compose(
        &manifest,
        &HostProfile::default(),
        &install_for(&manifest),
        &inventory,
        now(),
        &options(),
    );
    assert_eq!(result.critical_error, Some(CriticalError::PathTraversal));
}

#[rstest]
fn test_relative_host_library_path_dropped(inventory: RuntimeInventory) {
    let manifest = hello_manifest();
    let mut profile = HostProfile::default();
    profile.paths.library_prepend = vec!["relative/lib".to_string(), "{NAH_APP_ROOT}/vendor".to_string()];
    let result = compose(
        &manifest,
        &profile,
        &install_for(&manifest),
        &inventory,
        now(),
        &options(),
    );
    assert!(result.ok);
    assert_eq!(keys(&result), vec![WarningKind::InvalidLibraryPath]);
    assert_eq!(
        contract(&result).execution.library_paths,
        vec![format!("{APP_ROOT}/vendor")]
    );
}

#[rstest]
#[case("^6", "requirement_not_satisfied")]
#[case("", "denied_by_profile")]
fn test_unsupported_pin(
    inventory: RuntimeInventory,
    #[case] requirement: &str,
    #[case] reason: &str,
) {
    let mut manifest = lua_manifest();
    manifest.nak_version_req = requirement.to_string();
    let mut profile = HostProfile::default();
    profile.nak.deny_versions = vec!["5.4.*".to_string()];
    let result = compose(
        &manifest,
        &profile,
        &install_for(&manifest),
        &inventory,
        now(),
        &options(),
    );
    assert!(result.ok);
    assert_eq!(keys(&result), vec![WarningKind::NakVersionUnsupported]);
    assert_eq!(result.warnings[0].fields["reason"], reason);
    assert_eq!(contract(&result).nak.id, "");
}

#[rstest]
#[case(Some("C"), "C")]
#[case(None, "A")]
fn test_environment_precedence(
    inventory: RuntimeInventory,
    #[case] invocation: Option<&str>,
    #[case] expected: &str,
) {
    let mut manifest = hello_manifest();
    manifest.env = vec![EnvAssignment::new("K", "B")];
    let mut profile = HostProfile::default();
    profile.environment.insert("K".to_string(), "A".to_string());
    let mut options = options();
    if let Some(value) = invocation {
        options
            .overrides
            .insert("ENVIRONMENT", format!(r#"{{"K": "{value}"}}"#));
    }

    let result = compose(
        &manifest,
        &profile,
        &install_for(&manifest),
        &inventory,
        now(),
        &options,
    );
    assert_eq!(contract(&result).environment["K"], expected);
}

#[rstest]
fn test_install_override_beats_profile(inventory: RuntimeInventory) {
    let mut manifest = hello_manifest();
    manifest.env = vec![EnvAssignment::new("K", "B")];
    let mut profile = HostProfile::default();
    profile.environment.insert("K".to_string(), "A".to_string());
    let mut install = install_for(&manifest);
    install
        .overrides
        .environment
        .insert("K".to_string(), "I".into());

    let result = compose(&manifest, &profile, &install, &inventory, now(), &options());
    assert_eq!(contract(&result).environment["K"], "I");

    profile.overrides.mode = crate::profile::OverrideMode::Deny;
    let result = compose(&manifest, &profile, &install, &inventory, now(), &options());
    assert_eq!(contract(&result).environment["K"], "A");
    assert_eq!(keys(&result), vec![WarningKind::OverrideDenied]);
    assert_eq!(result.warnings[0].fields["source_kind"], "install_record");
}

#[rstest]
fn test_pin_without_id(inventory: RuntimeInventory) {
    let manifest = lua_manifest();
    let mut install = install_for(&manifest);
    install.nak.id.clear();
    let result = compose(
        &manifest,
        &HostProfile::default(),
        &install,
        &inventory,
        now(),
        &options(),
    );
    assert!(result.ok);
    assert_eq!(keys(&result), vec![WarningKind::NakPinInvalid]);
    assert_eq!(result.warnings[0].fields["reason"], "pin_fields_missing");
    assert_eq!(contract(&result).nak.id, "");
}

#[rstest]
fn test_install_override_operations(inventory: RuntimeInventory) {
    let mut manifest = hello_manifest();
    manifest.env = vec![
        EnvAssignment::new("PATH", "/usr/bin"),
        EnvAssignment::new("CLASSPATH", "app.jar"),
        EnvAssignment::new("NOISY", "1"),
    ];
    let mut install = install_for(&manifest);
    install.overrides.environment = BTreeMap::from([
        (
            "PATH".to_string(),
            EnvOp::Prepend {
                value: "{NAH_APP_ROOT}/bin".to_string(),
                separator: ":".to_string(),
            },
        ),
        (
            "CLASSPATH".to_string(),
            EnvOp::Append {
                value: "extra.jar".to_string(),
                separator: ";".to_string(),
            },
        ),
        ("NOISY".to_string(), EnvOp::Unset),
    ]);
    let options = ComposeOptions {
        trace: true,
        ..options()
    };

    let result = compose(
        &manifest,
        &HostProfile::default(),
        &install,
        &inventory,
        now(),
        &options,
    );
    let environment = &contract(&result).environment;
    assert_eq!(environment["PATH"], format!("{APP_ROOT}/bin:/usr/bin"));
    assert_eq!(environment["CLASSPATH"], "app.jar;extra.jar");
    assert!(!environment.contains_key("NOISY"));

    let trace = result.trace.as_ref().expect("trace requested");
    let history = &trace.environment["PATH"].history;
    assert_eq!(history.last().map(|h| h.operation), Some("prepend"));
    assert_eq!(trace.environment["NOISY"].source_kind, SourceKind::InstallRecord);
}

#[rstest]
fn test_runtime_identity_unset_without_bundle(inventory: RuntimeInventory) {
    let mut manifest = hello_manifest();
    manifest.env = vec![
        EnvAssignment::new(NAH_NAK_ROOT, "/evil"),
        EnvAssignment::new(NAH_NAK_ID, "fake"),
    ];
    let result = compose(
        &manifest,
        &HostProfile::default(),
        &install_for(&manifest),
        &inventory,
        now(),
        &options(),
    );
    let environment = &contract(&result).environment;
    assert!(!environment.contains_key(NAH_NAK_ROOT));
    assert!(!environment.contains_key(NAH_NAK_ID));
    assert!(!environment.contains_key(NAH_NAK_VERSION));
    assert_eq!(environment[NAH_APP_ID], "com.example.hello");
}

#[rstest]
fn test_identity_cannot_be_spoofed(inventory: RuntimeInventory) {
    let mut manifest = hello_manifest();
    manifest.env = vec![EnvAssignment::new(NAH_APP_ID, "spoofed")];
    let mut install = install_for(&manifest);
    install
        .overrides
        .environment
        .insert(NAH_APP_ROOT.to_string(), "/elsewhere".into());
    let mut options = options();
    options
        .overrides
        .insert("ENVIRONMENT", r#"{"NAH_APP_ID": "also-spoofed"}"#);

    let result = compose(
        &manifest,
        &HostProfile::default(),
        &install,
        &inventory,
        now(),
        &options,
    );
    let contract = contract(&result);
    assert_eq!(contract.environment[NAH_APP_ID], "com.example.hello");
    assert_eq!(contract.environment[NAH_APP_ROOT], APP_ROOT);
}

#[rstest]
fn test_app_snapshot_mismatch(inventory: RuntimeInventory) {
    let manifest = hello_manifest();
    let mut install = install_for(&manifest);
    install.app.version = "0.9.0".to_string();
    let result = compose(
        &manifest,
        &HostProfile::default(),
        &install,
        &inventory,
        now(),
        &options(),
    );
    assert!(result.ok);
    assert_eq!(keys(&result), vec![WarningKind::InvalidConfiguration]);
    assert_eq!(result.warnings[0].fields["reason"], "app_version_mismatch");
    // identity comes from the install record
    assert_eq!(contract(&result).environment[NAH_APP_VERSION], "0.9.0");
}

#[rstest]
fn test_asset_exports(inventory: RuntimeInventory) {
    let mut manifest = hello_manifest();
    manifest.asset_exports = vec![
        AssetExportDecl {
            id: "icon".to_string(),
            path: "share/icon.png".to_string(),
            kind: "image/png".to_string(),
        },
        AssetExportDecl {
            id: "icon".to_string(),
            path: "share/icon@2x.png".to_string(),
            kind: String::new(),
        },
    ];
    let result = compose(
        &manifest,
        &HostProfile::default(),
        &install_for(&manifest),
        &inventory,
        now(),
        &options(),
    );
    let exports = &contract(&result).exports;
    assert_eq!(exports.len(), 1);
    assert_eq!(exports["icon"].path, format!("{APP_ROOT}/share/icon@2x.png"));

    manifest.asset_exports[1].path = "../../secrets".to_string();
    let result = compose(
        &manifest,
        &HostProfile::default(),
        &install_for(&manifest),
        &inventory,
        now(),
        &options(),
    );
    assert_eq!(result.critical_error, Some(CriticalError::PathTraversal));
}

#[rstest]
fn test_capabilities_in_contract(inventory: RuntimeInventory) {
    let mut manifest = hello_manifest();
    manifest.permissions.filesystem = vec!["read:/data".to_string()];
    manifest.permissions.network = vec!["listen:8080".to_string()];
    let mut profile = HostProfile::default();
    profile
        .capabilities
        .insert("network.listen".to_string(), "sandbox.net.in".to_string());
    let result = compose(
        &manifest,
        &profile,
        &install_for(&manifest),
        &inventory,
        now(),
        &options(),
    );
    assert!(result.warnings.is_empty());
    let contract = contract(&result);
    assert!(contract.capability_usage.present);
    assert_eq!(
        contract.capability_usage.required_capabilities,
        vec!["filesystem.read", "network.listen"]
    );
    assert!(contract.enforcement.filesystem.is_empty());
    assert_eq!(contract.enforcement.network, vec!["sandbox.net.in"]);
}

#[rstest]
fn test_trust_warnings(inventory: RuntimeInventory) {
    let manifest = hello_manifest();
    let mut install = install_for(&manifest);
    install.trust = None;
    let result = compose(
        &manifest,
        &HostProfile::default(),
        &install,
        &inventory,
        now(),
        &options(),
    );
    assert!(result.ok);
    assert_eq!(keys(&result), vec![WarningKind::TrustStateUnknown]);

    install.trust = Some(TrustInfo {
        state: TrustState::Verified,
        expires_at: Some(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()),
        ..Default::default()
    });
    let result = compose(
        &manifest,
        &HostProfile::default(),
        &install,
        &inventory,
        now(),
        &options(),
    );
    assert_eq!(keys(&result), vec![WarningKind::TrustStateStale]);
}

#[rstest]
fn test_policy_error_keeps_contract(inventory: RuntimeInventory) {
    let manifest = hello_manifest();
    let mut install = install_for(&manifest);
    install.trust = None;
    let mut profile = HostProfile::default();
    profile
        .warnings
        .insert(WarningKind::TrustStateUnknown, WarningAction::Error);
    let result = compose(&manifest, &profile, &install, &inventory, now(), &options());
    assert!(result.ok);
    assert!(result.contract.is_some());
    assert!(result.has_policy_errors());
}

#[rstest]
fn test_invocation_warning_override(inventory: RuntimeInventory) {
    let manifest = hello_manifest();
    let mut install = install_for(&manifest);
    install.trust = None;
    let options = ComposeOptions {
        overrides: OverrideSet::from_vars([("NAH_OVERRIDE_WARNINGS_TRUST_STATE_UNKNOWN", "ignore")]),
        ..options()
    };
    let result = compose(
        &manifest,
        &HostProfile::default(),
        &install,
        &inventory,
        now(),
        &options,
    );
    assert!(result.warnings.is_empty());
}

#[rstest]
fn test_trace(inventory: RuntimeInventory) {
    let mut manifest = lua_manifest();
    manifest.env = vec![EnvAssignment::new("K", "B")];
    let mut profile = HostProfile::default();
    profile.environment.insert("K".to_string(), "A".to_string());
    let options = ComposeOptions {
        trace: true,
        ..options()
    };
    let result = compose(
        &manifest,
        &profile,
        &install_for(&manifest),
        &inventory,
        now(),
        &options,
    );
    let trace = result.trace.as_ref().expect("trace requested");

    let entry = &trace.environment["K"];
    assert_eq!(entry.value, "A");
    assert_eq!(entry.source_kind, SourceKind::HostProfile);
    assert_eq!(entry.history.len(), 2);
    assert!(!entry.history[1].accepted);
    assert_eq!(trace.environment[NAH_APP_ID].precedence_rank, 1);

    assert_eq!(trace.execution["binary"].source_kind, SourceKind::NakRecord);
    assert_eq!(trace.execution["cwd"].value, format!("{NAK_ROOT}/work"));
    let kinds: Vec<_> = trace
        .library_paths
        .iter()
        .map(|entry| entry.source_kind)
        .collect();
    assert_eq!(kinds, vec![SourceKind::NakRecord, SourceKind::Manifest]);
    assert!(
        trace
            .decisions
            .iter()
            .any(|decision| decision.contains("loader default"))
    );
}

#[rstest]
fn test_deterministic_output(inventory: RuntimeInventory) {
    let mut manifest = lua_manifest();
    manifest.env = vec![
        EnvAssignment::new("Z", "{MISSING}"),
        EnvAssignment::new("A", "1"),
    ];
    manifest.permissions.network = vec!["connect:example.com:443".to_string()];
    let install = install_for(&manifest);
    let options = ComposeOptions {
        trace: true,
        ..options()
    };

    let first = compose(&manifest, &HostProfile::default(), &install, &inventory, now(), &options);
    let second = compose(&manifest, &HostProfile::default(), &install, &inventory, now(), &options);
    assert_eq!(first, second);
    assert_eq!(first.to_json(true).unwrap(), second.to_json(true).unwrap());
}

#[rstest]
fn test_compose_blob(inventory: RuntimeInventory) {
    let manifest = lua_manifest();
    let blob = codec::encode(&manifest).unwrap();
    let install = install_for(&manifest);

    let from_blob = compose_blob(&blob, &HostProfile::default(), &install, &inventory, now(), &options());
    let direct = compose(&manifest, &HostProfile::default(), &install, &inventory, now(), &options());
    assert!(from_blob.ok);
    assert_eq!(from_blob, direct);
}

#[rstest]
fn test_compose_blob_checksum_failure(inventory: RuntimeInventory) {
    let manifest = hello_manifest();
    let mut blob = codec::encode(&manifest).unwrap();
    let last = blob.len() - 1;
    blob[last] ^= 0x01;
    let result = compose_blob(
        &blob,
        &HostProfile::default(),
        &install_for(&manifest),
        &inventory,
        now(),
        &options(),
    );
    assert!(!result.ok);
    assert_eq!(result.critical_error, Some(CriticalError::CrcMismatch));
}

#[rstest]
#[case(b"".as_slice())]
#[case(b"NOPE\x01\x00\x00\x00\x10\x00\x00\x00\x00\x00\x00\x00".as_slice())]
fn test_compose_blob_missing_manifest(inventory: RuntimeInventory, #[case] blob: &[u8]) {
    let manifest = hello_manifest();
    let result = compose_blob(
        blob,
        &HostProfile::default(),
        &install_for(&manifest),
        &inventory,
        now(),
        &options(),
    );
    assert_eq!(result.critical_error, Some(CriticalError::ManifestMissing));
    assert!(result.contract.is_none());
}
