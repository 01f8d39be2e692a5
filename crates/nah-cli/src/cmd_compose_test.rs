// Copyright (c) Contributors to the NAH project.
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;

use clap::Parser;
use nah::profile::OverridePolicy;
use nah::{CriticalError, EnvOp, WarningCollector, WarningKind, WarningObject};
use rstest::rstest;

use super::*;

#[derive(Parser)]
struct Cli {
    #[clap(flatten)]
    cmd: CmdCompose,
}

fn parse(extra: &[&str]) -> std::result::Result<CmdCompose, clap::Error> {
    let args = ["compose", "-m", "app.nahm", "-i", "install.json"];
    Cli::try_parse_from(args.iter().chain(extra)).map(|cli| cli.cmd)
}

fn warning(action: WarningAction) -> WarningObject {
    WarningObject {
        key: WarningKind::TrustStateUnknown,
        action,
        fields: BTreeMap::new(),
    }
}

#[rstest]
#[case(true, None, 0)]
#[case(true, Some(WarningAction::Warn), 0)]
#[case(true, Some(WarningAction::Error), 2)]
#[case(false, Some(WarningAction::Error), 1)]
fn test_exit_code(#[case] ok: bool, #[case] action: Option<WarningAction>, #[case] expected: i32) {
    let result = CompositionResult {
        ok,
        critical_error: (!ok).then_some(CriticalError::ManifestMissing),
        warnings: action.into_iter().map(warning).collect(),
        ..Default::default()
    };
    assert_eq!(exit_code(&result), expected);
}

#[rstest]
fn test_parse_now() {
    let now = parse_now(Some("2026-01-02T03:04:05+01:00")).unwrap();
    assert_eq!(now.to_rfc3339(), "2026-01-02T02:04:05+00:00");
    assert!(parse_now(Some("yesterday")).is_err());
    assert!(parse_now(None).is_ok());
}

#[rstest]
#[case(&[], OutputFormat::Json)]
#[case(&["--format", "table"], OutputFormat::Table)]
#[case(&["--format", "yaml"], OutputFormat::Yaml)]
fn test_format(#[case] extra: &[&str], #[case] expected: OutputFormat) {
    assert_eq!(parse(extra).unwrap().format, expected);
}

#[rstest]
#[case("xml")]
#[case("tabel")]
fn test_unknown_format_rejected(#[case] format: &str) {
    assert!(parse(&["--format", format]).is_err());
}

#[rstest]
fn test_overrides_file() {
    let tmpdir = tempfile::tempdir().unwrap();
    let path = tmpdir.path().join("overrides.json");
    std::fs::write(
        &path,
        r#"{"environment": {"LEVEL": "2"}, "warnings": {"trust_state_unknown": "error"}}"#,
    )
    .unwrap();
    let cmd = parse(&["--overrides", path.to_str().unwrap()]).unwrap();

    let vars = [(
        "NAH_OVERRIDE_ENVIRONMENT".to_string(),
        r#"{"LEVEL": "1"}"#.to_string(),
    )];
    let overrides = cmd.load_overrides(vars).unwrap();
    let mut warnings = WarningCollector::default();
    let environment = overrides.apply(&OverridePolicy::default(), &mut warnings);
    assert_eq!(
        environment,
        vec![
            ("LEVEL".to_string(), EnvOp::from("1")),
            ("LEVEL".to_string(), EnvOp::from("2")),
        ]
    );
    assert_eq!(
        warnings.action_for(WarningKind::TrustStateUnknown),
        WarningAction::Error
    );
}

#[rstest]
fn test_missing_overrides_file() {
    let tmpdir = tempfile::tempdir().unwrap();
    let path = tmpdir.path().join("missing.json");
    let cmd = parse(&["--overrides", path.to_str().unwrap()]).unwrap();
    assert!(cmd.load_overrides(Vec::new()).is_err());

    let cmd = parse(&[]).unwrap();
    assert!(cmd.load_overrides(Vec::new()).unwrap().is_empty());
}
