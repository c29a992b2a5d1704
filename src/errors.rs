// src/errors.rs
//
// Write-path error taxonomy. Every failure of `TransactionManager::execute`
// is a `TransactionError`; callers that need a flat shape (UI, JSON output)
// use `TransactionError::normalize`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::gateway::GatewayError;
use crate::types::{TxHash, fmt_hash};

/// Revert reasons emitted by the contract and the text shown to users.
const REVERT_MESSAGES: &[(&str, &str)] = &[
    ("Already voted", "You have already voted in this election."),
    ("Not registered", "You must register as a voter before voting."),
    ("Already registered", "This address is already registered to vote."),
    ("Voting not active", "Voting is not open right now."),
    ("Registration closed", "The registration period has ended."),
    ("Invalid candidate", "The selected candidate does not exist or was withdrawn."),
    ("Not authorized", "Your account is not allowed to perform this action."),
    ("Election not ended", "The election has not ended yet."),
    ("Already finalized", "The election results are already final."),
    ("No votes cast", "An election without votes cannot be finalized."),
    ("Election exists", "An election has already been created."),
    ("No election", "No election has been created yet."),
    ("Invalid schedule", "The election schedule is not in chronological order."),
];

/// Truncate `s` to at most `max` characters, marking the cut.
fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let mut out: String = s.chars().take(max).collect();
        out.push('…');
        out
    }
}

/// User-facing message for a revert reason. Unknown reasons pass through,
/// truncated to `max_len` characters.
pub fn revert_message(reason: &str, max_len: usize) -> String {
    let trimmed = reason.trim();
    REVERT_MESSAGES
        .iter()
        .find(|(known, _)| trimmed.eq_ignore_ascii_case(known))
        .map(|(_, msg)| (*msg).to_string())
        .unwrap_or_else(|| {
            if trimmed.is_empty() {
                "The transaction was rejected by the ledger.".to_string()
            } else {
                truncate(trimmed, max_len)
            }
        })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    UserRejected,
    InsufficientFunds,
    GasEstimationFailed,
    NonceConflict,
    LedgerRevert,
    NetworkTimeout,
    TransactionTimeout,
    ValidationError,
    NetworkError,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransactionError {
    #[error("transaction rejected by user")]
    UserRejected,

    #[error("insufficient funds to pay for the transaction")]
    InsufficientFunds,

    #[error("gas estimation failed: {0}")]
    GasEstimationFailed(String),

    #[error("nonce conflict: {0}")]
    NonceConflict(String),

    /// `reason` is the raw contract reason, `message` its user-facing form.
    #[error("{message}")]
    LedgerRevert { reason: String, message: String },

    #[error("network timeout")]
    NetworkTimeout,

    /// Gave up waiting. The write may still land later.
    #[error("transaction timed out{}", .hash.as_ref().map(|h| format!(" (last hash {})", fmt_hash(h))).unwrap_or_default())]
    TransactionTimeout { hash: Option<TxHash> },

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("network error: {0}")]
    Network(String),
}

/// Flat error shape handed to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedError {
    pub kind: ErrorKind,
    pub message: String,
    pub raw: String,
}

impl TransactionError {
    pub fn validation(msg: impl Into<String>) -> Self {
        TransactionError::Validation(msg.into())
    }

    /// Build a revert error, mapping the reason through the message table.
    pub fn revert(reason: impl Into<String>, max_len: usize) -> Self {
        let reason = reason.into();
        let message = revert_message(&reason, max_len);
        TransactionError::LedgerRevert { reason, message }
    }

    /// Classify a gateway failure.
    pub fn from_gateway(err: GatewayError, max_len: usize) -> Self {
        match err {
            GatewayError::UserRejected => TransactionError::UserRejected,
            GatewayError::InsufficientFunds => TransactionError::InsufficientFunds,
            GatewayError::NonceConflict(m) => TransactionError::NonceConflict(m),
            GatewayError::Revert(reason) => TransactionError::revert(reason, max_len),
            GatewayError::Timeout => TransactionError::NetworkTimeout,
            GatewayError::Transport(m) | GatewayError::Decode(m) | GatewayError::Unsupported(m) => {
                TransactionError::Network(m)
            }
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            TransactionError::UserRejected => ErrorKind::UserRejected,
            TransactionError::InsufficientFunds => ErrorKind::InsufficientFunds,
            TransactionError::GasEstimationFailed(_) => ErrorKind::GasEstimationFailed,
            TransactionError::NonceConflict(_) => ErrorKind::NonceConflict,
            TransactionError::LedgerRevert { .. } => ErrorKind::LedgerRevert,
            TransactionError::NetworkTimeout => ErrorKind::NetworkTimeout,
            TransactionError::TransactionTimeout { .. } => ErrorKind::TransactionTimeout,
            TransactionError::Validation(_) => ErrorKind::ValidationError,
            TransactionError::Network(_) => ErrorKind::NetworkError,
        }
    }

    /// Terminal errors are never retried.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionError::UserRejected
                | TransactionError::InsufficientFunds
                | TransactionError::LedgerRevert { .. }
                | TransactionError::Validation(_)
                | TransactionError::TransactionTimeout { .. }
        )
    }

    fn user_message(&self) -> String {
        match self {
            TransactionError::UserRejected => "You rejected the transaction.".into(),
            TransactionError::InsufficientFunds => {
                "Your account does not have enough funds to pay for gas.".into()
            }
            TransactionError::GasEstimationFailed(_) => {
                "The transaction cost could not be estimated.".into()
            }
            TransactionError::NonceConflict(_) => {
                "Another transaction from this account is in flight; please retry.".into()
            }
            TransactionError::LedgerRevert { message, .. } => message.clone(),
            TransactionError::NetworkTimeout | TransactionError::Network(_) => {
                "The ledger could not be reached. Please try again.".into()
            }
            TransactionError::TransactionTimeout { .. } => {
                "The transaction is taking longer than expected and may still complete.".into()
            }
            TransactionError::Validation(m) => m.clone(),
        }
    }

    pub fn normalize(&self) -> NormalizedError {
        NormalizedError {
            kind: self.kind(),
            message: self.user_message(),
            raw: match self {
                TransactionError::LedgerRevert { reason, .. } => reason.clone(),
                other => other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_reverts_use_the_table() {
        let err = TransactionError::revert("Already voted", 100);
        assert_eq!(err.kind(), ErrorKind::LedgerRevert);
        assert!(err.is_terminal());
        let n = err.normalize();
        assert_eq!(n.message, "You have already voted in this election.");
        assert_eq!(n.raw, "Already voted");
    }

    #[test]
    fn unknown_reverts_are_truncated() {
        let long = "x".repeat(300);
        let msg = revert_message(&long, 50);
        assert_eq!(msg.chars().count(), 51);
        assert_eq!(revert_message("custom failure", 50), "custom failure");
    }

    #[test]
    fn gateway_errors_map_to_taxonomy() {
        let cases = [
            (GatewayError::UserRejected, ErrorKind::UserRejected, true),
            (GatewayError::InsufficientFunds, ErrorKind::InsufficientFunds, true),
            (GatewayError::NonceConflict("low".into()), ErrorKind::NonceConflict, false),
            (GatewayError::Timeout, ErrorKind::NetworkTimeout, false),
            (GatewayError::Transport("reset".into()), ErrorKind::NetworkError, false),
        ];
        for (gw, kind, terminal) in cases {
            let err = TransactionError::from_gateway(gw, 100);
            assert_eq!(err.kind(), kind);
            assert_eq!(err.is_terminal(), terminal, "{err:?}");
        }
    }

    #[test]
    fn timeout_display_carries_hash() {
        let err = TransactionError::TransactionTimeout {
            hash: Some([0xAA; 32]),
        };
        assert!(err.to_string().contains("0xaaaa"));
        assert_eq!(
            TransactionError::TransactionTimeout { hash: None }.to_string(),
            "transaction timed out"
        );
    }
}
