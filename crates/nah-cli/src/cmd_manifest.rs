// Copyright (c) Contributors to the NAH project.
// SPDX-License-Identifier: Apache-2.0

//! Implementation of the `nah manifest` commands.

use std::path::{Path, PathBuf};

use clap::{Args, Subcommand};
use colored::Colorize;
use miette::{IntoDiagnostic, Result, WrapErr};
use sha2::Digest;

use crate::{ManifestInput, OutputFormat};

#[cfg(test)]
#[path = "./cmd_manifest_test.rs"]
mod cmd_manifest_test;

/// Inspect or build binary manifests
#[derive(Debug, Args)]
pub struct CmdManifest {
    #[clap(subcommand)]
    action: ManifestAction,
}

#[derive(Debug, Subcommand)]
enum ManifestAction {
    /// Decode a manifest and report what it declares
    Inspect {
        /// Binary manifest or JSON manifest declaration
        path: PathBuf,

        /// Output format
        #[clap(long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },

    /// Encode a JSON manifest declaration into a binary manifest
    Build {
        /// JSON manifest declaration (nah.app.manifest.v1)
        declaration: PathBuf,

        /// Output file, defaults to the declaration with a .nahm extension
        #[clap(short, long)]
        output: Option<PathBuf>,
    },
}

impl CmdManifest {
    pub fn run(&mut self) -> Result<i32> {
        match &self.action {
            ManifestAction::Inspect { path, format } => inspect(path, *format),
            ManifestAction::Build {
                declaration,
                output,
            } => build(declaration, output.as_deref()),
        }
    }
}

/// Hex SHA-256 of the given bytes.
pub fn digest(bytes: &[u8]) -> String {
    format!("{:x}", sha2::Sha256::digest(bytes))
}

fn inspect(path: &Path, format: OutputFormat) -> Result<i32> {
    let bytes = std::fs::read(path)
        .into_diagnostic()
        .wrap_err_with(|| format!("Failed to read manifest {}", path.display()))?;
    let sha256 = digest(&bytes);
    let input = ManifestInput::from_bytes(bytes)?;
    let (manifest, issues) = input.manifest()?;

    let value = serde_json::json!({
        "manifest": manifest,
        "issues": issues,
        "sha256": sha256,
    });
    if !format.print_structured(&value)? {
        let kind = match input {
            ManifestInput::Binary(_) => "binary",
            ManifestInput::Declared(_) => "declaration",
        };
        println!("{} {}", "Manifest:".bold(), path.display());
        println!("  kind:       {kind}");
        println!("  sha256:     {}", sha256.dimmed());
        println!("  id:         {}", manifest.id.cyan());
        println!("  version:    {}", manifest.version);
        println!("  entrypoint: {}", manifest.entrypoint.green());
        if manifest.has_nak() {
            println!(
                "  runtime:    {} {}",
                manifest.nak_id.cyan(),
                manifest.nak_version_req
            );
            if !manifest.nak_loader.is_empty() {
                println!("  loader:     {}", manifest.nak_loader);
            }
        }
        for assignment in &manifest.env {
            println!("  env:        {assignment}");
        }
        for dir in &manifest.lib_dirs {
            println!("  lib_dir:    {dir}");
        }
        for export in &manifest.asset_exports {
            println!("  export:     {export}");
        }
        for permission in manifest.permissions.iter() {
            println!("  permission: {permission}");
        }

        if !issues.is_empty() {
            println!();
            println!("{}", "Issues:".yellow().bold());
            for issue in &issues {
                println!("  {} {}", "-".yellow(), issue);
            }
        }
    }

    Ok(if issues.is_empty() { 0 } else { 2 })
}

fn build(declaration: &Path, output: Option<&Path>) -> Result<i32> {
    let manifest = nah::Manifest::load(declaration)?;
    let blob = nah::encode(&manifest).map_err(nah::Error::from)?;

    let output = output
        .map(Path::to_path_buf)
        .unwrap_or_else(|| declaration.with_extension(nah::MANIFEST_EXTENSION));
    std::fs::write(&output, &blob)
        .into_diagnostic()
        .wrap_err_with(|| format!("Failed to write manifest {}", output.display()))?;

    let output = dunce::canonicalize(&output).unwrap_or(output);
    tracing::info!(path = %output.display(), bytes = blob.len(), "wrote manifest");

    println!("{} {}", "✓".green(), output.display());
    println!("  {} {}", "sha256:".dimmed(), digest(&blob));
    Ok(0)
}
