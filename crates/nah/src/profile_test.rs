// Copyright (c) Contributors to the NAH project.
// SPDX-License-Identifier: Apache-2.0

use rstest::rstest;
use tempfile::TempDir;

use super::*;

#[rstest]
fn test_parse_minimal_profile() {
    let profile = HostProfile::from_json(r#"{"$schema": "nah.host.profile.v1"}"#)
        .expect("Should parse minimal profile");
    assert_eq!(profile, HostProfile::default());
    assert_eq!(profile.nak.binding_mode, BindingMode::Canonical);
    assert_eq!(profile.overrides.mode, OverrideMode::Allow);
}

#[rstest]
fn test_parse_full_profile() {
    let json = r#"{
        "$schema": "nah.host.profile.v1",
        "nak": {
            "binding_mode": "mapped",
            "allow_versions": ["5.*"],
            "deny_versions": ["5.4.0"],
            "map": {"5.4": "lua@5.4.6.json"}
        },
        "environment": {"LANG": "C.UTF-8"},
        "paths": {"library_prepend": ["/opt/host/lib"], "library_append": ["/usr/lib/extra"]},
        "warnings": {"Trust_State_Unknown": "IGNORE", "nak_pin_invalid": "error"},
        "capabilities": {"filesystem.read": "sandbox.fs.read"},
        "overrides": {"mode": "allowlist", "allow_keys": ["DEBUG"]}
    }"#;
    let profile = HostProfile::from_json(json).expect("Should parse full profile");
    assert_eq!(profile.nak.binding_mode, BindingMode::Mapped);
    assert_eq!(profile.nak.map["5.4"], "lua@5.4.6.json");
    assert_eq!(profile.environment["LANG"], "C.UTF-8");
    assert_eq!(profile.paths.library_prepend, vec!["/opt/host/lib"]);
    assert_eq!(
        profile.warnings[&WarningKind::TrustStateUnknown],
        WarningAction::Ignore
    );
    assert_eq!(
        profile.warnings[&WarningKind::NakPinInvalid],
        WarningAction::Error
    );
    assert_eq!(profile.capabilities["filesystem.read"], "sandbox.fs.read");
    assert!(profile.overrides.permits("DEBUG"));
    assert!(!profile.overrides.permits("PATH"));
}

#[rstest]
#[case(r#"{"warnings": {"not_a_warning": "warn"}}"#)]
#[case(r#"{"warnings": {"nak_pin_invalid": "explode"}}"#)]
#[case(r#"{"nak": {"binding_mode": "sideways"}}"#)]
#[case(r#"{"environment": {"A": 1}}"#)]
#[case("not json")]
fn test_parse_invalid_profile(#[case] json: &str) {
    assert!(matches!(
        HostProfile::from_json(json),
        Err(crate::Error::InvalidJson { .. })
    ));
}

#[rstest]
fn test_profile_schema_mismatch() {
    let result = HostProfile::from_json(r#"{"$schema": "nah.host.profile.v2"}"#);
    assert!(matches!(result, Err(crate::Error::SchemaMismatch { .. })));
}

#[rstest]
#[case(&[], &[], "5.4.6", true)]
#[case(&["5.*"], &[], "5.4.6", true)]
#[case(&["5.*"], &[], "4.0.0", false)]
#[case(&["5.4.6"], &[], "5.4.6", true)]
#[case(&["5.4.6"], &[], "5.4.60", false)]
#[case(&[], &["5.4.*"], "5.4.6", false)]
#[case(&["5.*"], &["5.4.6"], "5.4.6", false)]
#[case(&["*"], &[], "0.0.1", true)]
fn test_version_allowed(
    #[case] allow: &[&str],
    #[case] deny: &[&str],
    #[case] version: &str,
    #[case] expected: bool,
) {
    let policy = NakPolicy {
        allow_versions: allow.iter().map(|s| s.to_string()).collect(),
        deny_versions: deny.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    };
    assert_eq!(policy.version_allowed(version), expected);
}

#[rstest]
#[case(OverrideMode::Allow, "ANY", true)]
#[case(OverrideMode::Deny, "ANY", false)]
#[case(OverrideMode::Allowlist, "DEBUG", true)]
#[case(OverrideMode::Allowlist, "WARNINGS_TRUST_STATE_UNKNOWN", false)]
fn test_override_policy(#[case] mode: OverrideMode, #[case] target: &str, #[case] expected: bool) {
    let policy = OverridePolicy {
        mode,
        allow_keys: vec!["DEBUG".to_string()],
    };
    assert_eq!(policy.permits(target), expected);
}

#[rstest]
fn test_load_profile_records_source() {
    let tmpdir = TempDir::new().unwrap();
    let path = tmpdir.path().join("host.json");
    std::fs::write(&path, r#"{"environment": {"A": "B"}}"#).unwrap();

    let profile = HostProfile::load(&path).unwrap();
    assert_eq!(profile.source_path.as_deref(), Some(path.as_path()));
    assert_eq!(profile.source_label(), path.display().to_string());
    assert_eq!(HostProfile::default().source_label(), "host_profile");
}

#[rstest]
fn test_load_missing_profile() {
    let tmpdir = TempDir::new().unwrap();
    let result = HostProfile::load(tmpdir.path().join("missing.json"));
    assert!(matches!(result, Err(crate::Error::ReadFailed { .. })));
}
