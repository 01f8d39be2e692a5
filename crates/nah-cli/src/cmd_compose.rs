// Copyright (c) Contributors to the NAH project.
// SPDX-License-Identifier: Apache-2.0

//! Implementation of the `nah compose` command.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::Args;
use colored::Colorize;
use miette::{IntoDiagnostic, Result, WrapErr};
use nah::{CompositionResult, OverrideSet, WarningAction};

use crate::{ManifestInput, OutputFormat};

#[cfg(test)]
#[path = "./cmd_compose_test.rs"]
mod cmd_compose_test;

/// Compose the launch contract for an installed application
#[derive(Debug, Args)]
pub struct CmdCompose {
    /// Binary manifest or JSON manifest declaration
    #[clap(short, long)]
    manifest: PathBuf,

    /// Install record (nah.app.install.v1)
    #[clap(short, long, env = "NAH_INSTALL_RECORD")]
    install: PathBuf,

    #[clap(flatten)]
    host: crate::HostFlags,

    /// Include the composition trace
    #[clap(long)]
    trace: bool,

    /// Overrides file: {"environment": {..}, "warnings": {..}}
    #[clap(long, env = "NAH_OVERRIDES_FILE")]
    overrides: Option<PathBuf>,

    /// Evaluate trust as of this RFC 3339 time instead of now
    #[clap(long)]
    now: Option<String>,

    /// Output format
    #[clap(long, value_enum, default_value_t = OutputFormat::Json)]
    format: OutputFormat,
}

impl CmdCompose {
    pub fn run(&mut self) -> Result<i32> {
        let input = ManifestInput::read(&self.manifest)?;
        let profile = self.host.load_profile()?;
        let install = nah::InstallRecord::load(&self.install)?;
        let inventory = self.host.load_inventory()?;
        let now = parse_now(self.now.as_deref())?;

        let options = nah::ComposeOptions {
            trace: self.trace,
            host: nah::HostFamily::current(),
            overrides: self.load_overrides(std::env::vars())?,
        };

        let result = match &input {
            ManifestInput::Binary(bytes) => {
                nah::compose_blob(bytes, &profile, &install, &inventory, now, &options)
            }
            ManifestInput::Declared(manifest) => {
                nah::compose(manifest, &profile, &install, &inventory, now, &options)
            }
        };

        if !self.format.print_structured(&result.to_value(self.trace)?)? {
            show_table(&result);
        }

        Ok(exit_code(&result))
    }

    /// `NAH_OVERRIDE_*` entries of `vars`, plus the overrides file if given.
    fn load_overrides<I>(&self, vars: I) -> Result<OverrideSet>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let overrides = OverrideSet::from_vars(vars);
        let Some(path) = &self.overrides else {
            return Ok(overrides);
        };
        let content = std::fs::read_to_string(path)
            .into_diagnostic()
            .wrap_err_with(|| format!("Failed to read overrides file {}", path.display()))?;
        Ok(overrides.with_file(path.display().to_string(), content))
    }
}

/// 0 when the contract may run, 1 on a critical error, 2 when policy
/// classified a warning as an error.
pub fn exit_code(result: &CompositionResult) -> i32 {
    if !result.ok {
        1
    } else if result.has_policy_errors() {
        2
    } else {
        0
    }
}

pub fn parse_now(now: Option<&str>) -> Result<DateTime<Utc>> {
    match now {
        None => Ok(Utc::now()),
        Some(text) => DateTime::parse_from_rfc3339(text)
            .map(|time| time.with_timezone(&Utc))
            .map_err(|e| miette::miette!("Invalid --now value {text:?}: {e}")),
    }
}

fn show_table(result: &CompositionResult) {
    if let Some(error) = result.critical_error {
        println!("{} {}", "Critical:".red().bold(), error.as_str().red());
        if !result.critical_error_context.is_empty() {
            println!("  {}", result.critical_error_context.dimmed());
        }
    }

    if let Some(contract) = &result.contract {
        println!("{}", "Launch Contract:".bold());
        println!();
        println!("  app:     {} {}", contract.app.id.cyan(), contract.app.version);
        if contract.nak.id.is_empty() {
            println!("  runtime: {}", "(none)".dimmed());
        } else {
            println!(
                "  runtime: {} {} [{}]",
                contract.nak.id.cyan(),
                contract.nak.version,
                contract.nak.record_ref.dimmed()
            );
        }
        println!("  binary:  {}", contract.execution.binary.green());
        for arg in &contract.execution.arguments {
            println!("    {}", arg);
        }
        println!("  cwd:     {}", contract.execution.cwd);
        println!("  trust:   {}", contract.trust.state);

        if !contract.execution.library_paths.is_empty() {
            println!();
            println!("{}", contract.execution.library_path_env_key.bold());
            for (i, path) in contract.execution.library_paths.iter().enumerate() {
                println!("  {}. {}", i + 1, path);
            }
        }

        println!();
        println!("{}", "Environment Variables:".bold());
        for (key, value) in &contract.environment {
            println!("  {} = {}", key.cyan(), value.green());
        }
    }

    if !result.warnings.is_empty() {
        println!();
        println!("{}", "Warnings:".bold());
        for warning in &result.warnings {
            let key = match warning.action {
                WarningAction::Error => warning.key.as_str().red(),
                _ => warning.key.as_str().yellow(),
            };
            let fields = warning
                .fields
                .iter()
                .map(|(name, value)| format!("{name}={value}"))
                .collect::<Vec<_>>()
                .join(" ");
            println!("  [{}] {} {}", warning.action, key, fields.dimmed());
        }
    }
}
