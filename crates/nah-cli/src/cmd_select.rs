// Copyright (c) Contributors to the NAH project.
// SPDX-License-Identifier: Apache-2.0

//! Implementation of the `nah select` command.

use std::path::PathBuf;

use clap::Args;
use colored::Colorize;
use miette::Result;
use nah::{Manifest, NakPin, WarningObject};

use crate::{ManifestInput, OutputFormat};

#[cfg(test)]
#[path = "./cmd_select_test.rs"]
mod cmd_select_test;

/// Choose the runtime an application would be pinned to at install time
#[derive(Debug, Args)]
pub struct CmdSelect {
    /// Binary manifest or JSON manifest declaration
    #[clap(short, long)]
    manifest: PathBuf,

    #[clap(flatten)]
    host: crate::HostFlags,

    /// Output format
    #[clap(long, value_enum, default_value_t = OutputFormat::Table)]
    format: OutputFormat,
}

/// The outcome of selecting a bundle for one manifest.
#[derive(Debug)]
pub struct Selection {
    pub manifest: Manifest,
    pub pin: Option<NakPin>,
    pub warnings: Vec<WarningObject>,
}

impl Selection {
    /// 0 when a bundle was pinned or none is needed, otherwise 1.
    pub fn exit_code(&self) -> i32 {
        match self.pin {
            Some(_) => 0,
            None if !self.manifest.has_nak() => 0,
            None => 1,
        }
    }
}

impl CmdSelect {
    pub fn run(&mut self) -> Result<i32> {
        let selection = self.select()?;

        let value = serde_json::json!({
            "pin": selection.pin,
            "warnings": selection.warnings,
        });
        if !self.format.print_structured(&value)? {
            show_table(&selection);
        }

        Ok(selection.exit_code())
    }

    pub fn select(&self) -> Result<Selection> {
        let (manifest, issues) = ManifestInput::read(&self.manifest)?.manifest()?;
        for issue in &issues {
            tracing::warn!("manifest: {issue}");
        }
        let profile = self.host.load_profile()?;
        let inventory = self.host.load_inventory()?;
        tracing::debug!(runtimes = inventory.len(), "loaded runtime inventory");

        let mut warnings = nah::WarningCollector::new(profile.warnings.clone());
        let pin = nah::select_nak(&manifest, &profile, &inventory, &mut warnings);
        Ok(Selection {
            manifest,
            pin,
            warnings: warnings.into_warnings(),
        })
    }
}

fn show_table(selection: &Selection) {
    match &selection.pin {
        Some(pin) => {
            println!(
                "{} {} {} [{}]",
                "✓".green(),
                pin.id.cyan(),
                pin.version,
                pin.record_ref.dimmed()
            );
            println!("  {} {}", "reason:".dimmed(), pin.selection_reason);
        }
        None if !selection.manifest.has_nak() => {
            println!("{} application declares no runtime", "-".dimmed());
        }
        None => println!("{} no runtime selected", "✗".red()),
    }
    for warning in &selection.warnings {
        println!("  [{}] {}", warning.action, warning.key.as_str().yellow());
    }
}
