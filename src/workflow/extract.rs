//! Agent result extraction.
//!
//! Agent output is free-form text; the orchestrator needs one verdict per
//! phase. Extraction runs three deterministic tiers in order:
//!
//! 1. the `===TASK_SUMMARY_START===` block the prompt suffix asks for,
//! 2. phase-specific phrasing idioms matched by regex,
//! 3. the process exit code.
//!
//! Unrecognized values map through fixed per-phase alias tables; anything
//! truly unreadable lands on `NeedsReview` rather than a guess. Extraction
//! never panics on malformed output.

use crate::workflow::types::Phase;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// Verdict of one completed phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseResult {
    /// The phase did what it set out to do.
    Success,
    /// The phase ran and reported failure.
    Failed,
    /// The agent stopped on an external obstacle.
    Blocked,
    /// Review verdict: work accepted.
    Approved,
    /// Review verdict: work sent back.
    ChangesRequested,
    /// Output was unreadable or ambiguous; a human or the coordinator
    /// should look at the raw log.
    NeedsReview,
}

impl std::fmt::Display for PhaseResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PhaseResult::Success => write!(f, "success"),
            PhaseResult::Failed => write!(f, "failed"),
            PhaseResult::Blocked => write!(f, "blocked"),
            PhaseResult::Approved => write!(f, "approved"),
            PhaseResult::ChangesRequested => write!(f, "changes_requested"),
            PhaseResult::NeedsReview => write!(f, "needs_review"),
        }
    }
}

/// Which tier produced the verdict. Carried for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionTier {
    SummaryBlock,
    PhaseIdiom,
    ExitCode,
}

/// Structured extraction output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Extraction {
    pub result: PhaseResult,
    pub tier: ExtractionTier,
    /// MESSAGE line from the summary block, when present.
    pub message: Option<String>,
    /// FILES line from the summary block, split and trimmed.
    pub files: Vec<String>,
}

const BLOCK_START: &str = "===TASK_SUMMARY_START===";
const BLOCK_END: &str = "===TASK_SUMMARY_END===";

/// RESULT aliases accepted on non-review phases.
const GENERIC_ALIASES: &[(&str, PhaseResult)] = &[
    ("success", PhaseResult::Success),
    ("succeeded", PhaseResult::Success),
    ("done", PhaseResult::Success),
    ("complete", PhaseResult::Success),
    ("completed", PhaseResult::Success),
    ("ok", PhaseResult::Success),
    ("pass", PhaseResult::Success),
    ("passed", PhaseResult::Success),
    ("failed", PhaseResult::Failed),
    ("failure", PhaseResult::Failed),
    ("fail", PhaseResult::Failed),
    ("error", PhaseResult::Failed),
    ("blocked", PhaseResult::Blocked),
    ("waiting", PhaseResult::Blocked),
];

/// RESULT aliases accepted on the review phase.
const REVIEW_ALIASES: &[(&str, PhaseResult)] = &[
    ("approved", PhaseResult::Approved),
    ("approve", PhaseResult::Approved),
    ("accepted", PhaseResult::Approved),
    ("lgtm", PhaseResult::Approved),
    ("changes_requested", PhaseResult::ChangesRequested),
    ("changes-requested", PhaseResult::ChangesRequested),
    ("changes requested", PhaseResult::ChangesRequested),
    ("needs_changes", PhaseResult::ChangesRequested),
    ("rejected", PhaseResult::ChangesRequested),
    ("blocked", PhaseResult::Blocked),
];

static REVIEW_VERDICT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)Review Result:\s*(APPROVED|CHANGES_REQUESTED)").unwrap()
});

static TEST_VERDICT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:all tests passed|tests? (passed|failed))\b").unwrap());

static COMPILE_VERDICT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bcompil(?:e|ation)\s+(succeeded|passed|clean|failed|errors?)\b").unwrap()
});

/// Extract a phase verdict from agent output.
pub fn extract_result(phase: Phase, log_text: &str, exit_code: i32) -> Extraction {
    if let Some(extraction) = extract_from_block(phase, log_text) {
        return extraction;
    }
    if let Some(result) = extract_from_idiom(phase, log_text) {
        return Extraction {
            result,
            tier: ExtractionTier::PhaseIdiom,
            message: None,
            files: Vec::new(),
        };
    }
    let result = if exit_code != 0 {
        PhaseResult::NeedsReview
    } else {
        default_for(phase)
    };
    Extraction {
        result,
        tier: ExtractionTier::ExitCode,
        message: None,
        files: Vec::new(),
    }
}

/// Verdict a clean exit defaults to when the output says nothing.
///
/// Review never defaults to a verdict; silence there means someone has to
/// read the log.
fn default_for(phase: Phase) -> PhaseResult {
    match phase {
        Phase::Review => PhaseResult::NeedsReview,
        _ => PhaseResult::Success,
    }
}

fn alias_table(phase: Phase) -> &'static [(&'static str, PhaseResult)] {
    match phase {
        Phase::Review => REVIEW_ALIASES,
        _ => GENERIC_ALIASES,
    }
}

/// Tier 1: the structured summary block.
///
/// Uses the LAST block in the log; agents sometimes echo the instructions
/// (which contain an example block) before the real one.
fn extract_from_block(phase: Phase, log_text: &str) -> Option<Extraction> {
    let start = log_text.rfind(BLOCK_START)?;
    let after_start = &log_text[start + BLOCK_START.len()..];
    let body = match after_start.find(BLOCK_END) {
        Some(end) => &after_start[..end],
        // Unterminated block: take what is there rather than discarding it.
        None => after_start,
    };

    let mut result_line = None;
    let mut message = None;
    let mut files = Vec::new();
    for line in body.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("RESULT:") {
            result_line = Some(rest.trim().to_lowercase());
        } else if let Some(rest) = line.strip_prefix("MESSAGE:") {
            message = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("FILES:") {
            let rest = rest.trim();
            if !rest.eq_ignore_ascii_case("none") && !rest.is_empty() {
                files = rest
                    .split(',')
                    .map(|f| f.trim().to_string())
                    .filter(|f| !f.is_empty())
                    .collect();
            }
        }
    }

    // Block present but no RESULT line: the agent tried to report and the
    // report is broken. That is exactly what NeedsReview is for.
    let result = match result_line {
        Some(value) => alias_table(phase)
            .iter()
            .find(|(alias, _)| *alias == value)
            .map(|(_, r)| *r)
            .unwrap_or(PhaseResult::NeedsReview),
        None => PhaseResult::NeedsReview,
    };

    Some(Extraction {
        result,
        tier: ExtractionTier::SummaryBlock,
        message,
        files,
    })
}

/// Tier 2: phase-specific phrasing.
fn extract_from_idiom(phase: Phase, log_text: &str) -> Option<PhaseResult> {
    match phase {
        Phase::Review => {
            let captures = REVIEW_VERDICT.captures(log_text)?;
            match captures[1].to_uppercase().as_str() {
                "APPROVED" => Some(PhaseResult::Approved),
                _ => Some(PhaseResult::ChangesRequested),
            }
        }
        Phase::Test | Phase::Verify => {
            let matched = TEST_VERDICT.find(log_text)?;
            if matched.as_str().to_lowercase().contains("failed") {
                Some(PhaseResult::Failed)
            } else {
                Some(PhaseResult::Success)
            }
        }
        Phase::CompileCheck => {
            let captures = COMPILE_VERDICT.captures(log_text)?;
            let verdict = captures[1].to_lowercase();
            if verdict.starts_with("fail") || verdict.starts_with("error") {
                Some(PhaseResult::Failed)
            } else {
                Some(PhaseResult::Success)
            }
        }
        Phase::Implement | Phase::Analyze | Phase::Fix => None,
    }
}
