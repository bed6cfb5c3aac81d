use chrono::{DateTime, Utc};

use crate::error::{Error, Result};

/// Name fragments that mark an identity as automated, across all supported
/// platforms. Matched case-insensitively as substrings.
const BOT_PATTERNS: &[&str] = &[
    "[bot]",
    "bot",
    "dependabot",
    "renovate",
    "bitbucket-pipelines",
    "pipeline",
    "build service",
    "service account",
    "automation",
    "ci/cd",
];

/// Classify an identity as automated.
///
/// `platform_flag` carries an explicit non-human marker from the platform
/// (e.g. GitHub's `Bot` actor type). A missing identity classifies as
/// automated so unattributed records never inflate human contributor
/// counts.
pub fn is_automated(identity: Option<&str>, platform_flag: bool) -> bool {
    if platform_flag {
        return true;
    }
    let Some(name) = identity else {
        return true;
    };
    if name.is_empty() {
        return true;
    }
    let lowered = name.to_lowercase();
    BOT_PATTERNS.iter().any(|p| lowered.contains(p))
}

/// Parse a platform timestamp into a UTC instant.
///
/// Accepts RFC 3339 including fractional seconds (Azure DevOps emits up to
/// seven fractional digits, which chrono truncates to nanoseconds).
pub fn parse_instant(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::MalformedResponse(format!("bad timestamp {raw:?}: {e}")))
}
