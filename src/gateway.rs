// src/gateway.rs
//
// `LedgerGateway` is the only way the rest of the crate talks to the ledger.
// Implementations decode raw ledger tuples into the typed entities of
// `types.rs` before returning, so no untyped shape crosses this seam.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::calls::WriteCall;
use crate::types::{
    Address, Candidate, CandidateId, ElectionInfo, ElectionStatistics, GasPrice, Timestamp,
    TxHash, UserRole, Voter, WinnerInfo,
};

/// Errors reported by a gateway. Classification into retry policy happens in
/// [`crate::errors`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    /// The signer refused the request.
    #[error("user rejected the request")]
    UserRejected,

    #[error("insufficient funds for gas * price + value")]
    InsufficientFunds,

    /// The nonce was already used or is out of sequence.
    #[error("nonce conflict: {0}")]
    NonceConflict(String),

    /// The ledger rejected the call on a business rule.
    #[error("execution reverted: {0}")]
    Revert(String),

    #[error("request timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),

    /// The ledger answered with a shape that could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// The gateway does not offer this capability (e.g. no event channel).
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl GatewayError {
    /// Map a JSON-RPC error object (code + message) to a gateway error.
    ///
    /// Wallet-style providers only report these conditions as text, so the
    /// message is inspected the same way the ledger node formats them.
    pub fn from_rpc(code: i32, message: &str, data: Option<&str>) -> Self {
        let lower = message.to_ascii_lowercase();

        if code == 4001 || lower.contains("user rejected") || lower.contains("user denied") {
            return GatewayError::UserRejected;
        }
        if lower.contains("insufficient funds") {
            return GatewayError::InsufficientFunds;
        }
        if lower.contains("nonce too low")
            || lower.contains("nonce too high")
            || lower.contains("replacement transaction underpriced")
            || lower.contains("already known")
        {
            return GatewayError::NonceConflict(message.to_string());
        }
        if let Some(idx) = lower.find("execution reverted") {
            let rest = message[idx + "execution reverted".len()..]
                .trim_start_matches(':')
                .trim();
            let reason = if rest.is_empty() {
                data.map(|d| d.trim_matches('"').to_string()).unwrap_or_default()
            } else {
                rest.to_string()
            };
            return GatewayError::Revert(reason);
        }
        if lower.contains("timeout") || lower.contains("timed out") {
            return GatewayError::Timeout;
        }
        GatewayError::Transport(format!("rpc error {code}: {message}"))
    }
}

/// A fully prepared write, ready for signing and broadcast.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxRequest {
    pub from: Address,
    pub call: WriteCall,
    pub gas_limit: u64,
    pub gas_price: GasPrice,
    pub nonce: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxReceipt {
    pub hash: TxHash,
    pub block_number: u64,
    pub gas_used: u64,
    pub success: bool,
    /// Revert reason when `success` is false.
    pub revert_reason: Option<String>,
}

/// Events emitted by the election contract.
///
/// Events synthesized by the polling fallback cannot attribute every field;
/// those fields are `None`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum LedgerEvent {
    VoteCast {
        voter: Option<Address>,
        candidate_id: CandidateId,
        timestamp: Timestamp,
        record_id: Option<u64>,
    },
    VoterRegistered {
        voter: Option<Address>,
        voter_id: Option<u64>,
        timestamp: Timestamp,
    },
    CandidateAdded {
        candidate_id: CandidateId,
        name: String,
        party: String,
        added_by: Option<Address>,
    },
    ElectionStarted {
        timestamp: Timestamp,
    },
    ElectionEnded {
        timestamp: Timestamp,
    },
}

/// Discriminant of [`LedgerEvent`], used for subscription filters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    VoteCast,
    VoterRegistered,
    CandidateAdded,
    ElectionStarted,
    ElectionEnded,
}

impl EventKind {
    pub const ALL: [EventKind; 5] = [
        EventKind::VoteCast,
        EventKind::VoterRegistered,
        EventKind::CandidateAdded,
        EventKind::ElectionStarted,
        EventKind::ElectionEnded,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::VoteCast => "VoteCast",
            EventKind::VoterRegistered => "VoterRegistered",
            EventKind::CandidateAdded => "CandidateAdded",
            EventKind::ElectionStarted => "ElectionStarted",
            EventKind::ElectionEnded => "ElectionEnded",
        }
    }
}

impl LedgerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            LedgerEvent::VoteCast { .. } => EventKind::VoteCast,
            LedgerEvent::VoterRegistered { .. } => EventKind::VoterRegistered,
            LedgerEvent::CandidateAdded { .. } => EventKind::CandidateAdded,
            LedgerEvent::ElectionStarted { .. } => EventKind::ElectionStarted,
            LedgerEvent::ElectionEnded { .. } => EventKind::ElectionEnded,
        }
    }

    /// Block timestamp carried by the event, when it has one.
    pub fn block_timestamp(&self) -> Option<Timestamp> {
        match self {
            LedgerEvent::VoteCast { timestamp, .. }
            | LedgerEvent::VoterRegistered { timestamp, .. }
            | LedgerEvent::ElectionStarted { timestamp }
            | LedgerEvent::ElectionEnded { timestamp } => Some(*timestamp),
            LedgerEvent::CandidateAdded { .. } => None,
        }
    }
}

/// Stream of decoded ledger events. Ends when the underlying channel closes.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<LedgerEvent, GatewayError>> + Send>>;

/// Async access to the ledger.
///
/// ## Contract
///
/// - Reads return decoded entities or [`GatewayError::Decode`]; they never
///   return partially decoded data.
/// - Implementations do not retry; retry policy belongs to the
///   [`crate::tx_manager::TransactionManager`].
/// - `estimate_gas` simulates the call and reports business-rule failures as
///   [`GatewayError::Revert`].
#[async_trait]
pub trait LedgerGateway: Send + Sync {
    /// `getElectionInfo()`; `None` when no election was created yet.
    async fn election_info(&self) -> Result<Option<ElectionInfo>, GatewayError>;

    /// `getAllCandidates()`, including deactivated candidates.
    async fn all_candidates(&self) -> Result<Vec<Candidate>, GatewayError>;

    /// `getVoterInfo(address)`.
    async fn voter_info(&self, who: Address) -> Result<Voter, GatewayError>;

    /// `getUserRole(address)`.
    async fn user_role(&self, who: Address) -> Result<UserRole, GatewayError>;

    /// `getCurrentWinner()`.
    async fn current_winner(&self) -> Result<WinnerInfo, GatewayError>;

    /// `getElectionStatistics()`.
    async fn election_statistics(&self) -> Result<ElectionStatistics, GatewayError>;

    async fn estimate_gas(&self, from: Address, call: &WriteCall) -> Result<u64, GatewayError>;

    async fn gas_price(&self) -> Result<GasPrice, GatewayError>;

    /// Next nonce for `who`, counting pending transactions.
    async fn transaction_count(&self, who: Address) -> Result<u64, GatewayError>;

    async fn send_transaction(&self, tx: &TxRequest) -> Result<TxHash, GatewayError>;

    /// `None` while the transaction is not yet mined.
    async fn transaction_receipt(&self, hash: TxHash) -> Result<Option<TxReceipt>, GatewayError>;

    async fn block_number(&self) -> Result<u64, GatewayError>;

    /// Open a new event subscription. Returns [`GatewayError::Unsupported`]
    /// when the gateway has no event channel.
    async fn subscribe_events(&self) -> Result<EventStream, GatewayError>;
}
