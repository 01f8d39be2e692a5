// Copyright (c) Contributors to the NAH project.
// SPDX-License-Identifier: Apache-2.0

//! Trust state recorded at install time and its evaluation at launch.
//!
//! Trust is never computed here. The install record carries the outcome of an
//! earlier evaluation, and composition only reports on it.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::warnings::{Warning, WarningCollector};

#[cfg(test)]
#[path = "./trust_test.rs"]
mod trust_test;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustState {
    #[default]
    Unknown,
    Unverified,
    Verified,
    Failed,
}

impl TrustState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrustState::Unknown => "unknown",
            TrustState::Unverified => "unverified",
            TrustState::Verified => "verified",
            TrustState::Failed => "failed",
        }
    }
}

impl fmt::Display for TrustState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a trust evaluation as stored in an install record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrustInfo {
    #[serde(default)]
    pub state: TrustState,

    /// Who or what performed the evaluation.
    #[serde(default)]
    pub source: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluated_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,

    /// Digest of the inputs the evaluation looked at.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub inputs_hash: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, serde_json::Value>,
}

impl TrustInfo {
    /// True when the evaluation has an expiry that is already in the past.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires| expires < now)
    }
}

pub(crate) fn format_timestamp(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Report on the recorded trust state and return the snapshot for the
/// contract.
///
/// A missing trust section is treated as [`TrustState::Unknown`]. Staleness is
/// reported in addition to the state warning, whatever the state is.
pub fn evaluate_trust(
    trust: Option<&TrustInfo>,
    now: DateTime<Utc>,
    warnings: &mut WarningCollector,
) -> TrustInfo {
    let Some(trust) = trust else {
        warnings.emit(Warning::TrustStateUnknown);
        return TrustInfo::default();
    };

    match trust.state {
        TrustState::Verified => {}
        TrustState::Unknown => {
            warnings.emit(Warning::TrustStateUnknown);
        }
        TrustState::Unverified => {
            warnings.emit(Warning::TrustStateUnverified {
                source: trust.source.clone(),
            });
        }
        TrustState::Failed => {
            warnings.emit(Warning::TrustStateFailed {
                source: trust.source.clone(),
            });
        }
    }

    if let Some(expires_at) = trust.expires_at.filter(|_| trust.is_stale(now)) {
        warnings.emit(Warning::TrustStateStale {
            expires_at: format_timestamp(expires_at),
            now: format_timestamp(now),
        });
    }

    trust.clone()
}
