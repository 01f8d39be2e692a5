// Copyright (c) Contributors to the NAH project.
// SPDX-License-Identifier: Apache-2.0

//! nah - launch contract composition CLI

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result, WrapErr};

mod cmd_compose;
mod cmd_manifest;
mod cmd_select;

use cmd_compose::CmdCompose;
use cmd_manifest::CmdManifest;
use cmd_select::CmdSelect;

#[derive(Parser)]
#[clap(
    name = "nah",
    about = "Native application host launch composition",
    version,
    long_about = "Compose launch contracts from manifests, host profiles, install records and runtimes"
)]
struct Opt {
    #[clap(flatten)]
    logging: Logging,

    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Parser)]
struct Logging {
    /// Increase verbosity (-v, -vv, -vvv)
    #[clap(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-error output
    #[clap(short, long, global = true)]
    quiet: bool,
}

/// How a command prints its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Colored, human readable
    Table,
    Json,
    Yaml,
}

impl OutputFormat {
    /// Print `value` as JSON or YAML. Returns false for [`OutputFormat::Table`],
    /// which each command renders itself.
    pub fn print_structured(self, value: &serde_json::Value) -> Result<bool> {
        match self {
            OutputFormat::Json => {
                println!("{}", serde_json::to_string_pretty(value).into_diagnostic()?);
            }
            OutputFormat::Yaml => print!("{}", serde_yaml::to_string(value).into_diagnostic()?),
            OutputFormat::Table => return Ok(false),
        }
        Ok(true)
    }
}

/// Host-side inputs shared by commands that resolve runtimes.
#[derive(Parser, Clone, Debug, Default)]
pub struct HostFlags {
    /// Host profile (nah.host.profile.v1). Defaults apply when omitted
    #[clap(long, short = 'p', env = "NAH_PROFILE")]
    pub profile: Option<PathBuf>,

    /// Directory of installed runtime records (nah.nak.install.v1)
    #[clap(long, short = 'r', env = "NAH_RUNTIMES")]
    pub runtimes: Option<PathBuf>,
}

impl HostFlags {
    pub fn load_profile(&self) -> Result<nah::HostProfile> {
        match &self.profile {
            Some(path) => Ok(nah::HostProfile::load(path)?),
            None => {
                tracing::debug!("no host profile given, using defaults");
                Ok(nah::HostProfile::default())
            }
        }
    }

    pub fn load_inventory(&self) -> Result<nah::RuntimeInventory> {
        let Some(dir) = &self.runtimes else {
            return Ok(nah::RuntimeInventory::new());
        };
        let dir = dunce::canonicalize(dir)
            .into_diagnostic()
            .wrap_err_with(|| format!("Failed to resolve runtime directory {}", dir.display()))?;
        Ok(nah::RuntimeInventory::load_dir(dir)?)
    }
}

/// A manifest given on the command line, binary or JSON.
pub enum ManifestInput {
    Binary(Vec<u8>),
    Declared(nah::Manifest),
}

impl ManifestInput {
    /// Binary manifests are recognized by their magic bytes; anything else is
    /// read as a JSON declaration.
    pub fn read(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .into_diagnostic()
            .wrap_err_with(|| format!("Failed to read manifest {}", path.display()))?;
        Self::from_bytes(bytes)
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        if bytes.starts_with(&nah::codec::MAGIC) {
            return Ok(Self::Binary(bytes));
        }
        let json = String::from_utf8(bytes)
            .map_err(|_| miette::miette!("Manifest is neither a binary manifest nor UTF-8 JSON"))?;
        Ok(Self::Declared(nah::Manifest::from_json(&json)?))
    }

    /// The manifest itself, with any decode problems described.
    pub fn manifest(&self) -> Result<(nah::Manifest, Vec<String>)> {
        match self {
            Self::Declared(manifest) => Ok((manifest.clone(), Vec::new())),
            Self::Binary(bytes) => {
                let decoded = nah::decode(bytes).map_err(nah::Error::from)?;
                let issues = decoded.issues.iter().map(ToString::to_string).collect();
                Ok((decoded.manifest, issues))
            }
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Compose the launch contract for an installed application
    Compose(CmdCompose),

    /// Inspect or build binary manifests
    Manifest(CmdManifest),

    /// Choose the runtime an application would be pinned to
    Select(CmdSelect),
}

impl Opt {
    fn run(self) -> Result<i32> {
        // Setup logging
        let log_level = match (self.logging.quiet, self.logging.verbose) {
            (true, _) => tracing::Level::ERROR,
            (false, 0) => tracing::Level::WARN,
            (false, 1) => tracing::Level::INFO,
            (false, 2) => tracing::Level::DEBUG,
            (false, _) => tracing::Level::TRACE,
        };

        tracing_subscriber::fmt()
            .with_max_level(log_level)
            .with_writer(std::io::stderr)
            .init();

        // Dispatch to command
        match self.cmd {
            Command::Compose(mut cmd) => cmd.run(),
            Command::Manifest(mut cmd) => cmd.run(),
            Command::Select(mut cmd) => cmd.run(),
        }
    }
}

fn main() -> Result<()> {
    let opt = Opt::parse();
    let code = opt.run()?;
    std::process::exit(code);
}
