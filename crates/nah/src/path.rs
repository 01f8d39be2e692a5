// Copyright (c) Contributors to the NAH project.
// SPDX-License-Identifier: Apache-2.0

//! Path containment for every path derived during composition.
//!
//! Paths are handled as strings with `/` as the joining separator so that the
//! resulting contract is identical regardless of the host that produced it.
//! Both `/` and `\` are accepted as separators on input.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

#[cfg(test)]
#[path = "./path_test.rs"]
mod path_test;

/// Reasons a path was refused.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PathError {
    #[error("path contains a NUL byte")]
    ContainsNul,

    #[error("absolute path not allowed here: {0}")]
    AbsoluteNotAllowed(String),

    #[error("path escapes its root: {0}")]
    EscapesRoot(String),

    #[error("root must be an absolute path: {0}")]
    RelativeRoot(String),

    #[error("path must be absolute: {0}")]
    NotAbsolute(String),
}

/// An absolute path that has passed a containment check.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct AbsolutePath(String);

impl AbsolutePath {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for AbsolutePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for AbsolutePath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<AbsolutePath> for String {
    fn from(path: AbsolutePath) -> Self {
        path.0
    }
}

fn is_separator(c: char) -> bool {
    c == '/' || c == '\\'
}

fn has_drive_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// True for `/x`, `\x` and drive-qualified `C:` paths.
pub fn is_absolute(path: &str) -> bool {
    path.starts_with(is_separator) || has_drive_prefix(path)
}

fn strip_absolute_prefix(path: &str) -> &str {
    let path = if has_drive_prefix(path) { &path[2..] } else { path };
    path.trim_start_matches(is_separator)
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split(is_separator)
        .filter(|segment| !segment.is_empty() && *segment != ".")
}

/// Resolve `.` and `..` segments, refusing to climb above the start.
fn resolve_segments<'a>(path: &'a str, original: &str) -> Result<Vec<&'a str>, PathError> {
    let mut stack = Vec::new();
    for segment in segments(path) {
        if segment == ".." {
            if stack.pop().is_none() {
                return Err(PathError::EscapesRoot(original.to_string()));
            }
        } else {
            stack.push(segment);
        }
    }
    Ok(stack)
}

fn join(root: &str, segments: &[&str]) -> String {
    if segments.is_empty() {
        return root.to_string();
    }
    let base = root.trim_end_matches(is_separator);
    let mut joined = String::with_capacity(root.len() + segments.len() * 8);
    joined.push_str(base);
    for segment in segments {
        joined.push('/');
        joined.push_str(segment);
    }
    joined
}

/// Normalize `candidate` beneath `root`.
///
/// Each `..` is resolved against the segments seen so far, and climbing past
/// the first segment fails with [`PathError::EscapesRoot`] at that point. An
/// absolute candidate is refused unless `allow_absolute` is set, in which case
/// it is re-rooted under `root`. An empty candidate, or one that resolves to
/// nothing, yields `root` unchanged.
pub fn normalize_under_root(
    root: &str,
    candidate: &str,
    allow_absolute: bool,
) -> Result<AbsolutePath, PathError> {
    if root.contains('\0') || candidate.contains('\0') {
        return Err(PathError::ContainsNul);
    }
    if !is_absolute(root) {
        return Err(PathError::RelativeRoot(root.to_string()));
    }

    let relative = if is_absolute(candidate) {
        if !allow_absolute {
            return Err(PathError::AbsoluteNotAllowed(candidate.to_string()));
        }
        strip_absolute_prefix(candidate)
    } else {
        candidate
    };

    let stack = resolve_segments(relative, candidate)?;
    Ok(AbsolutePath(join(root, &stack)))
}

/// Check that an already-absolute `path` lies beneath `root`.
///
/// Both sides are normalized lexically before comparison, and the result is
/// re-expressed relative to the caller's spelling of `root`.
pub fn contain_absolute(root: &str, path: &str) -> Result<AbsolutePath, PathError> {
    if root.contains('\0') || path.contains('\0') {
        return Err(PathError::ContainsNul);
    }
    if !is_absolute(root) {
        return Err(PathError::RelativeRoot(root.to_string()));
    }
    if !is_absolute(path) {
        return Err(PathError::NotAbsolute(path.to_string()));
    }

    let root_segments = resolve_segments(root, root)?;
    let path_segments = resolve_segments(path, path)?;
    if !path_segments.starts_with(&root_segments) {
        return Err(PathError::EscapesRoot(path.to_string()));
    }
    Ok(AbsolutePath(join(
        root,
        &path_segments[root_segments.len()..],
    )))
}
