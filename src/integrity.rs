// src/integrity.rs
//
// Cross-entity consistency checks on an election snapshot. Nothing here
// mutates state; the report is used for audits and as an oracle in tests.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::client::{ElectionClient, ReadError};
use crate::types::{Address, ElectionSnapshot};

/// Allowed distance between reported and recomputed turnout, in percent.
const TURNOUT_TOLERANCE: u64 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssueCode {
    VoteCountMismatch,
    TurnoutCalculationError,
    WinnerMismatch,
    VoterTallyMismatch,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityIssue {
    pub code: IssueCode,
    pub message: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub is_valid: bool,
    pub issues: Vec<IntegrityIssue>,
}

impl IntegrityReport {
    pub fn has(&self, code: IssueCode) -> bool {
        self.issues.iter().any(|i| i.code == code)
    }
}

/// Check `snapshot` for internal consistency.
pub fn validate(snapshot: &ElectionSnapshot) -> IntegrityReport {
    let mut issues = Vec::new();
    let stats = &snapshot.statistics;

    // Candidate tallies vs. reported total.
    let tallied: u64 = snapshot.candidates.iter().map(|c| c.vote_count).sum();
    if tallied != stats.total_votes_cast {
        issues.push(IntegrityIssue {
            code: IssueCode::VoteCountMismatch,
            message: format!(
                "candidates hold {tallied} votes but {} votes were reported cast",
                stats.total_votes_cast
            ),
        });
    }

    let expected_turnout = stats
        .total_votes_cast
        .saturating_mul(100)
        .checked_div(stats.total_registered_voters)
        .unwrap_or(0);
    if stats.turnout_percentage.abs_diff(expected_turnout) > TURNOUT_TOLERANCE {
        issues.push(IntegrityIssue {
            code: IssueCode::TurnoutCalculationError,
            message: format!(
                "reported turnout {}% but {} of {} registered voters is {expected_turnout}%",
                stats.turnout_percentage, stats.total_votes_cast, stats.total_registered_voters
            ),
        });
    }

    if let Some(issue) = check_winner(snapshot) {
        issues.push(issue);
    }

    // Only meaningful when every registered voter is in the snapshot.
    let registered = snapshot.voters.iter().filter(|v| v.is_registered).count() as u64;
    if registered > 0 && registered == stats.total_registered_voters {
        let voted = snapshot.voters.iter().filter(|v| v.has_voted).count() as u64;
        if voted != stats.total_votes_cast {
            issues.push(IntegrityIssue {
                code: IssueCode::VoterTallyMismatch,
                message: format!(
                    "{voted} voters are marked as having voted but {} votes were reported cast",
                    stats.total_votes_cast
                ),
            });
        }
    }

    IntegrityReport {
        is_valid: issues.is_empty(),
        issues,
    }
}

fn check_winner(snapshot: &ElectionSnapshot) -> Option<IntegrityIssue> {
    let winner = &snapshot.winner;
    let active: Vec<_> = snapshot.candidates.iter().filter(|c| c.is_active).collect();
    let max = active.iter().map(|c| c.vote_count).max().unwrap_or(0);

    // Nothing to declare yet.
    if max == 0 && winner.vote_count == 0 {
        return None;
    }

    let leaders = active.iter().filter(|c| c.vote_count == max).count();
    let mismatch = |message: String| {
        Some(IntegrityIssue {
            code: IssueCode::WinnerMismatch,
            message,
        })
    };

    if winner.is_tie {
        if leaders < 2 {
            return mismatch(format!(
                "a tie is flagged but only one active candidate has {max} votes"
            ));
        }
        return None;
    }

    let declared = active.iter().find(|c| c.id == winner.candidate_id);
    match declared {
        Some(c) if c.vote_count == max && winner.vote_count == max && leaders == 1 => None,
        Some(c) if leaders > 1 && c.vote_count == max => mismatch(format!(
            "candidate {} is declared winner but {leaders} candidates share {max} votes and no tie is flagged",
            c.id
        )),
        Some(c) => mismatch(format!(
            "candidate {} is declared winner with {} votes but the leading active candidate has {max}",
            c.id, winner.vote_count
        )),
        None => mismatch(format!(
            "declared winner {} is not an active candidate",
            winner.candidate_id
        )),
    }
}

/// Read a fresh snapshot through `client` (voter reads batched) and validate it.
pub async fn audit(
    client: &ElectionClient,
    voters: &[Address],
) -> Result<(ElectionSnapshot, IntegrityReport), ReadError> {
    let snapshot = client.snapshot(voters).await?;
    let report = validate(&snapshot);
    if report.is_valid {
        info!(at_block = snapshot.at_block, voters = voters.len(), "integrity audit passed");
    } else {
        for issue in &report.issues {
            warn!(code = ?issue.code, "{}", issue.message);
        }
    }
    Ok((snapshot, report))
}
