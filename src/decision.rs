//! Remediation decisions as emitted by the CrowdSec LAPI stream.
//!
//! The stream delivers loosely-typed JSON; [`normalize`] turns a raw batch
//! into validated [`Decision`] values, lower-casing every string field and
//! dropping entries the synchronizer cannot act on. Dropped entries never
//! fail the batch.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Identifier family a decision targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// A single textual IP address, v4 or v6.
    Ip,
    /// A CIDR block, collected into the aggregated `IP_RANGES` document.
    Range,
    /// An autonomous system number, as text.
    As,
    /// A two-letter country code, lower-cased.
    Country,
}

impl Scope {
    /// Scopes requested from the LAPI stream.
    pub const ALL: &'static str = "ip,range,as,country";
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Scope::Ip => "ip",
            Scope::Range => "range",
            Scope::As => "as",
            Scope::Country => "country",
        };
        write!(f, "{s}")
    }
}

impl FromStr for Scope {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ip" => Ok(Scope::Ip),
            "range" => Ok(Scope::Range),
            "as" => Ok(Scope::As),
            "country" => Ok(Scope::Country),
            _ => Err(()),
        }
    }
}

/// A decision exactly as it appears on the wire.
///
/// Every field is optional: the upstream models make them pointers and the
/// stream occasionally carries partial entries. [`normalize`] decides what
/// survives.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawDecision {
    pub origin: Option<String>,
    pub scenario: Option<String>,
    pub scope: Option<String>,
    #[serde(rename = "type")]
    pub remediation: Option<String>,
    pub value: Option<String>,
    pub duration: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<String>,
}

/// One `(new, deleted)` payload from the decision stream.
///
/// LAPI sends `null` rather than `[]` for the absent side of a batch.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DecisionBatch {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub new: Vec<RawDecision>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub deleted: Vec<RawDecision>,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<RawDecision>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<Vec<RawDecision>>::deserialize(deserializer)?.unwrap_or_default())
}

impl DecisionBatch {
    pub fn is_empty(&self) -> bool {
        self.new.is_empty() && self.deleted.is_empty()
    }
}

/// A validated decision. String fields are lower-case after normalization
/// and the value is never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub scope: Scope,
    pub remediation: String,
    pub value: String,
    pub origin: String,
    pub scenario: String,
    pub duration: String,
    pub until: Option<String>,
}

impl Decision {
    /// Origin label used on metrics. Decisions imported from blocklists all
    /// share the `lists` origin, so the scenario is appended to keep them
    /// distinguishable.
    pub fn metric_origin(&self) -> String {
        if self.origin == "lists" {
            format!("{}:{}", self.origin, self.scenario)
        } else {
            self.origin.clone()
        }
    }

    /// `ipv4`/`ipv6` for address-bearing scopes, `N/A` otherwise.
    pub fn ip_type(&self) -> &'static str {
        match self.scope {
            Scope::Ip | Scope::Range => {
                if self.value.contains(':') {
                    "ipv6"
                } else {
                    "ipv4"
                }
            }
            Scope::As | Scope::Country => "N/A",
        }
    }
}

/// Validate and lower-case a raw batch, preserving input order.
///
/// Structurally incomplete decisions are dropped at warn level, decisions
/// with an unsupported scope at debug level.
pub fn normalize(raw: &[RawDecision]) -> Vec<Decision> {
    raw.iter().filter_map(normalize_one).collect()
}

fn normalize_one(raw: &RawDecision) -> Option<Decision> {
    let (origin, scenario, scope, remediation, value, duration) = match (
        &raw.origin,
        &raw.scenario,
        &raw.scope,
        &raw.remediation,
        &raw.value,
        &raw.duration,
    ) {
        (Some(o), Some(sc), Some(s), Some(r), Some(v), Some(d)) => (o, sc, s, r, v, d),
        _ => {
            warn!(decision = ?raw, "dropping structurally incomplete decision");
            return None;
        }
    };

    let scope_lower = scope.to_lowercase();
    let scope = match Scope::from_str(&scope_lower) {
        Ok(scope) => scope,
        Err(()) => {
            debug!(scope = %scope_lower, value = %value, "dropping decision with unsupported scope");
            return None;
        }
    };

    Some(Decision {
        scope,
        remediation: remediation.to_lowercase(),
        value: value.to_lowercase(),
        origin: origin.clone(),
        scenario: scenario.clone(),
        duration: duration.clone(),
        until: raw.until.clone(),
    })
}
