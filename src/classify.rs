//! Error classification for failed phases and agent invocations.
//!
//! The classifier reads an error message and buckets it into a coarse
//! taxonomy that the external dispatcher uses to decide whether a retry is
//! worth spawning. The engine itself never retries; it only attaches the
//! classification to the failure it propagates.

use serde::{Deserialize, Serialize};

/// Coarse error taxonomy attached to workflow failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Worth retrying as-is (rate limits, network hiccups, timeouts).
    Transient,
    /// Retrying unchanged will not help (syntax errors, missing files).
    Permanent,
    /// Insufficient signal to classify.
    Unknown,
    /// Requires human or coordinator judgment; the last-resort class
    /// after autonomous attempts are exhausted.
    NeedsClarity,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::Transient => write!(f, "transient"),
            ErrorClass::Permanent => write!(f, "permanent"),
            ErrorClass::Unknown => write!(f, "unknown"),
            ErrorClass::NeedsClarity => write!(f, "needs_clarity"),
        }
    }
}

/// Message fragments that indicate a transient failure.
const TRANSIENT_PATTERNS: &[&str] = &[
    "rate limit",
    "rate_limit",
    "too many requests",
    "quota exceeded",
    "timed out",
    "timeout",
    "connection refused",
    "connection reset",
    "temporarily unavailable",
    "service unavailable",
    "503",
    "retrying",
    "network",
    "overloaded",
];

/// Message fragments that indicate a permanent failure.
const PERMANENT_PATTERNS: &[&str] = &[
    "syntax error",
    "compilation error",
    "compile error",
    "does not exist",
    "no such file",
    "not found in scope",
    "cannot find",
    "permission denied",
    "invalid argument",
    "unauthorized",
    "authentication failed",
    "unresolved reference",
];

/// Message fragments that indicate human judgment is needed.
const NEEDS_CLARITY_PATTERNS: &[&str] = &[
    "ambiguous",
    "unclear",
    "which option",
    "please clarify",
    "requires confirmation",
    "conflicting requirements",
    "manual intervention",
    "cannot proceed without",
    "blocked on",
];

/// Classify an error message into the failure taxonomy.
///
/// Matching is case-insensitive substring lookup against fixed pattern
/// tables, checked in priority order: needs-clarity beats transient beats
/// permanent, so a "blocked on rate limit" message asks for judgment
/// rather than a blind retry. Deterministic given the same input text.
pub fn classify_error(message: &str) -> ErrorClass {
    let lower = message.to_lowercase();

    if NEEDS_CLARITY_PATTERNS.iter().any(|p| lower.contains(p)) {
        return ErrorClass::NeedsClarity;
    }
    if TRANSIENT_PATTERNS.iter().any(|p| lower.contains(p)) {
        return ErrorClass::Transient;
    }
    if PERMANENT_PATTERNS.iter().any(|p| lower.contains(p)) {
        return ErrorClass::Permanent;
    }

    ErrorClass::Unknown
}
