// src/types.rs
use serde::{Deserialize, Serialize};
use serde_json;

/// 20-byte account address on the ledger.
pub type Address = [u8; 20];

/// 32-byte transaction hash.
pub type TxHash = [u8; 32];

/// Candidate identifier. Ids are 1-based; `0` means "none".
pub type CandidateId = u64;

/// Ledger timestamps are unix seconds.
pub type Timestamp = u64;

/// Gas price in the ledger's smallest fee unit.
pub type GasPrice = u128;

/// Format an address as `0x`-prefixed hex.
pub fn fmt_address(addr: &Address) -> String {
    format!("0x{}", hex::encode(addr))
}

/// Format a transaction hash as `0x`-prefixed hex.
pub fn fmt_hash(hash: &TxHash) -> String {
    format!("0x{}", hex::encode(hash))
}

/// Parse a `0x`-prefixed (or bare) hex address.
pub fn parse_address(s: &str) -> Result<Address, hex::FromHexError> {
    let mut out = [0u8; 20];
    hex::decode_to_slice(s.trim_start_matches("0x"), &mut out)?;
    Ok(out)
}

/// Parse a `0x`-prefixed (or bare) hex transaction hash.
pub fn parse_hash(s: &str) -> Result<TxHash, hex::FromHexError> {
    let mut out = [0u8; 32];
    hex::decode_to_slice(s.trim_start_matches("0x"), &mut out)?;
    Ok(out)
}

/// Decoded `getElectionInfo()` tuple:
///
/// `(title, description, registrationDeadline, startTime, endTime,
///   isActive, isFinalized, totalVoters, totalVotes, winnerID)`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElectionInfo {
    pub title: String,
    pub description: String,
    pub registration_deadline: Timestamp,
    pub start_time: Timestamp,
    pub end_time: Timestamp,
    pub is_active: bool,
    pub is_finalized: bool,
    pub total_voters: u64,
    pub total_votes: u64,
    pub winner_id: CandidateId,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: CandidateId,
    pub name: String,
    pub party: String,
    pub manifesto: String,
    pub vote_count: u64,
    pub is_active: bool,
}

/// Registration and participation state of one address.
///
/// Unknown addresses decode to an unregistered voter rather than an error,
/// the same way the ledger answers with a zeroed record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Voter {
    pub address: Address,
    pub is_registered: bool,
    pub has_voted: bool,
    pub candidate_voted: CandidateId,
    pub voter_id: u64,
    pub registration_time: Timestamp,
}

impl Voter {
    pub fn unregistered(address: Address) -> Self {
        Self {
            address,
            is_registered: false,
            has_voted: false,
            candidate_voted: 0,
            voter_id: 0,
            registration_time: 0,
        }
    }
}

/// Access roles, ordered by privilege.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    #[default]
    None,
    Voter,
    Observer,
    Admin,
    Commissioner,
}

impl Role {
    /// Numeric encoding used by the ledger ABI.
    pub fn as_u8(self) -> u8 {
        match self {
            Role::None => 0,
            Role::Voter => 1,
            Role::Observer => 2,
            Role::Admin => 3,
            Role::Commissioner => 4,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Role::None),
            1 => Some(Role::Voter),
            2 => Some(Role::Observer),
            3 => Some(Role::Admin),
            4 => Some(Role::Commissioner),
            _ => None,
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "NONE" => Ok(Role::None),
            "VOTER" => Ok(Role::Voter),
            "OBSERVER" => Ok(Role::Observer),
            "ADMIN" => Ok(Role::Admin),
            "COMMISSIONER" => Ok(Role::Commissioner),
            other => Err(format!("unknown role `{other}`")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRole {
    pub address: Address,
    pub role: Role,
    pub is_active: bool,
    pub assigned_at: Timestamp,
    pub assigned_by: Address,
}

impl UserRole {
    pub fn none(address: Address) -> Self {
        Self {
            address,
            role: Role::None,
            is_active: false,
            assigned_at: 0,
            assigned_by: [0u8; 20],
        }
    }

    /// Role that counts for permission checks: a revoked assignment is `None`.
    pub fn effective(&self) -> Role {
        if self.is_active { self.role } else { Role::None }
    }
}

/// Append-only audit entry written by the ledger for each accepted vote.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRecord {
    pub id: u64,
    pub voter: Address,
    pub candidate_id: CandidateId,
    pub timestamp: Timestamp,
    pub verification_hash: TxHash,
}

/// Decoded `getElectionStatistics()` tuple.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElectionStatistics {
    pub total_registered_voters: u64,
    pub total_votes_cast: u64,
    /// Whole percent, floored.
    pub turnout_percentage: u64,
    pub active_candidates: u64,
}

/// Decoded `getCurrentWinner()` tuple.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WinnerInfo {
    pub candidate_id: CandidateId,
    pub name: String,
    pub vote_count: u64,
    pub is_tie: bool,
}

/// Everything needed to audit an election offline.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElectionSnapshot {
    /// Ledger block number at which the snapshot was read.
    pub at_block: u64,
    /// Local unix time at which the snapshot was taken.
    pub taken_at: Timestamp,
    pub election: Option<ElectionInfo>,
    pub candidates: Vec<Candidate>,
    pub statistics: ElectionStatistics,
    pub winner: WinnerInfo,
    /// Voters read for this snapshot; may be a subset of all registered voters.
    pub voters: Vec<Voter>,
}

/// Serialize an `ElectionSnapshot` to pretty JSON.
pub fn snapshot_to_json(snapshot: &ElectionSnapshot) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(snapshot)
}

/// Deserialize an `ElectionSnapshot` from JSON.
pub fn snapshot_from_json(data: &str) -> Result<ElectionSnapshot, serde_json::Error> {
    serde_json::from_str(data)
}

/// Current wall-clock time as unix seconds.
pub fn unix_now() -> Timestamp {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
