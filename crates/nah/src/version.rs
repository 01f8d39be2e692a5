// Copyright (c) Contributors to the NAH project.
// SPDX-License-Identifier: Apache-2.0

//! Semantic versions and version ranges.
//!
//! Version text is parsed by the `semver` crate. Ordering and equality are
//! defined here so that build metadata never participates, and ranges support
//! the comparator, caret, tilde, wildcard and `||` forms used by manifests.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use thiserror::Error;

#[cfg(test)]
#[path = "./version_test.rs"]
mod version_test;

/// Reasons a version or range failed to parse.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VersionError {
    #[error("invalid version {text:?}: {reason}")]
    InvalidVersion { text: String, reason: String },

    #[error("invalid version range {text:?}: {reason}")]
    InvalidRange { text: String, reason: String },
}

impl VersionError {
    fn range(text: &str, reason: impl Into<String>) -> Self {
        Self::InvalidRange {
            text: text.to_string(),
            reason: reason.into(),
        }
    }
}

/// A semantic version whose ordering ignores build metadata.
#[derive(Debug, Clone)]
pub struct SemVer(semver::Version);

impl SemVer {
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self(semver::Version::new(major, minor, patch))
    }

    pub fn parse(text: &str) -> Result<Self, VersionError> {
        semver::Version::parse(text.trim())
            .map(Self)
            .map_err(|err| VersionError::InvalidVersion {
                text: text.to_string(),
                reason: err.to_string(),
            })
    }

    pub fn major(&self) -> u64 {
        self.0.major
    }

    pub fn minor(&self) -> u64 {
        self.0.minor
    }

    pub fn patch(&self) -> u64 {
        self.0.patch
    }

    pub fn prerelease(&self) -> &str {
        self.0.pre.as_str()
    }

    pub fn build(&self) -> &str {
        self.0.build.as_str()
    }

    pub fn is_prerelease(&self) -> bool {
        !self.0.pre.is_empty()
    }

    // semver::Prerelease orders the empty prerelease above any other, which
    // puts a prerelease strictly below the matching release.
    fn precedence(&self) -> (u64, u64, u64, &semver::Prerelease) {
        (self.0.major, self.0.minor, self.0.patch, &self.0.pre)
    }
}

/// Parse a single version, e.g. `1.2.3-rc.1+build.5`.
pub fn parse_version(text: &str) -> Result<SemVer, VersionError> {
    SemVer::parse(text)
}

impl PartialEq for SemVer {
    fn eq(&self, other: &Self) -> bool {
        self.precedence() == other.precedence()
    }
}

impl Eq for SemVer {}

impl PartialOrd for SemVer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SemVer {
    fn cmp(&self, other: &Self) -> Ordering {
        self.precedence().cmp(&other.precedence())
    }
}

impl Hash for SemVer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.major.hash(state);
        self.0.minor.hash(state);
        self.0.patch.hash(state);
        self.0.pre.as_str().hash(state);
    }
}

impl fmt::Display for SemVer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SemVer {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Op {
    fn as_str(&self) -> &'static str {
        match self {
            Op::Eq => "=",
            Op::Lt => "<",
            Op::Le => "<=",
            Op::Gt => ">",
            Op::Ge => ">=",
        }
    }

    fn is_floor(&self) -> bool {
        matches!(self, Op::Eq | Op::Gt | Op::Ge)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comparator {
    pub op: Op,
    pub version: SemVer,
}

impl Comparator {
    fn new(op: Op, version: SemVer) -> Self {
        Self { op, version }
    }

    pub fn matches(&self, version: &SemVer) -> bool {
        match self.op {
            Op::Eq => version == &self.version,
            Op::Lt => version < &self.version,
            Op::Le => version <= &self.version,
            Op::Gt => version > &self.version,
            Op::Ge => version >= &self.version,
        }
    }
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.op.as_str(), self.version)
    }
}

/// An OR of AND-sets of comparators.
///
/// An AND-set with no comparators matches every version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionRange {
    text: String,
    sets: Vec<Vec<Comparator>>,
}

/// Parse a version range such as `>=1.2.0 <2.0.0 || ^3.1`.
pub fn parse_range(text: &str) -> Result<VersionRange, VersionError> {
    VersionRange::parse(text)
}

impl VersionRange {
    pub fn parse(text: &str) -> Result<Self, VersionError> {
        if text.trim().is_empty() {
            return Err(VersionError::range(text, "empty range"));
        }

        let mut sets = Vec::new();
        for alternative in text.split("||") {
            let alternative = alternative.trim();
            if alternative.is_empty() {
                return Err(VersionError::range(text, "empty alternative around '||'"));
            }
            sets.push(parse_and_set(text, alternative)?);
        }

        Ok(Self {
            text: text.trim().to_string(),
            sets,
        })
    }

    /// A range every version satisfies, written `*`.
    pub fn any() -> Self {
        Self {
            text: "*".to_string(),
            sets: vec![Vec::new()],
        }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn alternatives(&self) -> &[Vec<Comparator>] {
        &self.sets
    }

    pub fn satisfies(&self, version: &SemVer) -> bool {
        self.sets
            .iter()
            .any(|set| set.iter().all(|comparator| comparator.matches(version)))
    }

    /// The lowest version any alternative admits, or `None` when some
    /// alternative has no lower bound.
    pub fn min_version(&self) -> Option<SemVer> {
        let mut lowest: Option<SemVer> = None;
        for set in &self.sets {
            let floor = set
                .iter()
                .filter(|comparator| comparator.op.is_floor())
                .map(|comparator| &comparator.version)
                .max()?;
            if lowest.as_ref().is_none_or(|current| floor < current) {
                lowest = Some(floor.clone());
            }
        }
        lowest
    }

    /// `MAJOR.MINOR` of [`Self::min_version`], or empty when unbounded below.
    pub fn selection_key(&self) -> String {
        self.min_version()
            .map(|version| format!("{}.{}", version.major(), version.minor()))
            .unwrap_or_default()
    }
}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl FromStr for VersionRange {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Pick the highest version satisfying `range`.
///
/// Versions that differ only in build metadata are ordered by their build
/// text so the choice does not depend on iteration order.
pub fn select_best<'a, I>(candidates: I, range: &VersionRange) -> Option<&'a SemVer>
where
    I: IntoIterator<Item = &'a SemVer>,
{
    candidates
        .into_iter()
        .filter(|version| range.satisfies(version))
        .max_by(|a, b| a.cmp(b).then_with(|| a.build().cmp(b.build())))
}

fn parse_and_set(text: &str, alternative: &str) -> Result<Vec<Comparator>, VersionError> {
    let mut comparators = Vec::new();
    let mut tokens = alternative.split_whitespace();
    while let Some(token) = tokens.next() {
        // allow a space between an operator and its version: ">= 1.2.3"
        let term = if matches!(token, ">=" | "<=" | ">" | "<" | "=" | "^" | "~") {
            let version = tokens
                .next()
                .ok_or_else(|| VersionError::range(text, format!("dangling operator {token:?}")))?;
            format!("{token}{version}")
        } else {
            token.to_string()
        };
        parse_term(text, &term, &mut comparators)?;
    }
    Ok(comparators)
}

fn parse_term(text: &str, term: &str, out: &mut Vec<Comparator>) -> Result<(), VersionError> {
    if let Some(rest) = term.strip_prefix('^') {
        let floor = parse_floor(text, rest)?;
        let ceiling = if floor.major() > 0 {
            SemVer::new(bump(text, floor.major())?, 0, 0)
        } else if floor.minor() > 0 {
            SemVer::new(0, bump(text, floor.minor())?, 0)
        } else {
            SemVer::new(0, 0, bump(text, floor.patch())?)
        };
        out.push(Comparator::new(Op::Ge, floor));
        out.push(Comparator::new(Op::Lt, ceiling));
        return Ok(());
    }

    if let Some(rest) = term.strip_prefix('~') {
        let partial = parse_partial(text, rest)?;
        let floor = parse_floor(text, rest)?;
        let ceiling = match partial.minor {
            Some(_) => SemVer::new(floor.major(), bump(text, floor.minor())?, 0),
            None => SemVer::new(bump(text, floor.major())?, 0, 0),
        };
        out.push(Comparator::new(Op::Ge, floor));
        out.push(Comparator::new(Op::Lt, ceiling));
        return Ok(());
    }

    for (prefix, op) in [
        (">=", Op::Ge),
        ("<=", Op::Le),
        (">", Op::Gt),
        ("<", Op::Lt),
        ("=", Op::Eq),
    ] {
        if let Some(rest) = term.strip_prefix(prefix) {
            let version = SemVer::parse(rest)
                .map_err(|err| VersionError::range(text, err.to_string()))?;
            out.push(Comparator::new(op, version));
            return Ok(());
        }
    }

    let partial = parse_partial(text, term)?;
    match partial {
        Partial { major: None, .. } => {}
        Partial {
            major: Some(major),
            minor: None,
            ..
        } => {
            out.push(Comparator::new(Op::Ge, SemVer::new(major, 0, 0)));
            out.push(Comparator::new(Op::Lt, SemVer::new(bump(text, major)?, 0, 0)));
        }
        Partial {
            major: Some(major),
            minor: Some(minor),
            patch: None,
        } => {
            out.push(Comparator::new(Op::Ge, SemVer::new(major, minor, 0)));
            out.push(Comparator::new(Op::Lt, SemVer::new(major, bump(text, minor)?, 0)));
        }
        Partial { patch: Some(_), .. } => {
            let version = SemVer::parse(term)
                .map_err(|err| VersionError::range(text, err.to_string()))?;
            out.push(Comparator::new(Op::Eq, version));
        }
    }
    Ok(())
}

/// The next value of a version component, used for exclusive upper bounds.
fn bump(text: &str, component: u64) -> Result<u64, VersionError> {
    component
        .checked_add(1)
        .ok_or_else(|| {
            VersionError::range(text, format!("component {component} has no upper bound"))
        })
}

/// A possibly incomplete version where `None` marks a missing or wildcard
/// component.
struct Partial {
    major: Option<u64>,
    minor: Option<u64>,
    patch: Option<u64>,
}

fn parse_partial(text: &str, term: &str) -> Result<Partial, VersionError> {
    let core = term
        .split(['-', '+'])
        .next()
        .unwrap_or_default();
    let mut parts = core.split('.');
    let mut component = |required: bool| -> Result<Option<u64>, VersionError> {
        match parts.next() {
            None if required => Err(VersionError::range(text, format!("missing version in {term:?}"))),
            None | Some("*" | "x" | "X") => Ok(None),
            Some(part) => part
                .parse::<u64>()
                .map(Some)
                .map_err(|_| VersionError::range(text, format!("invalid component {part:?}"))),
        }
    };
    let major = component(true)?;
    let minor = major.map_or(Ok(None), |_| component(false))?;
    let patch = minor.map_or(Ok(None), |_| component(false))?;
    if parts.next().is_some() {
        return Err(VersionError::range(text, format!("too many components in {term:?}")));
    }
    Ok(Partial {
        major,
        minor,
        patch,
    })
}

/// The version a caret or tilde term starts at, with missing components as
/// zero.
fn parse_floor(text: &str, term: &str) -> Result<SemVer, VersionError> {
    let partial = parse_partial(text, term)?;
    match partial {
        Partial { patch: Some(_), .. } => {
            SemVer::parse(term).map_err(|err| VersionError::range(text, err.to_string()))
        }
        Partial {
            major: Some(major),
            minor,
            ..
        } => Ok(SemVer::new(major, minor.unwrap_or(0), 0)),
        Partial { major: None, .. } => Err(VersionError::range(
            text,
            format!("wildcard not allowed in {term:?}"),
        )),
    }
}
