// src/calls.rs
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::errors::TransactionError;
use crate::gateway::LedgerEvent;
use crate::types::{Address, CandidateId, Role, Timestamp, fmt_address};

/// Upper bounds the contract enforces on string arguments.
const MAX_TITLE_LEN: usize = 200;
const MAX_TEXT_LEN: usize = 2_000;

/// Cache namespaces. Every cache key starts with one of these.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Namespace {
    Election,
    Candidate,
    Voter,
    Role,
}

impl Namespace {
    pub const ALL: [Namespace; 4] = [
        Namespace::Election,
        Namespace::Candidate,
        Namespace::Voter,
        Namespace::Role,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Namespace::Election => "election",
            Namespace::Candidate => "candidate",
            Namespace::Voter => "voter",
            Namespace::Role => "role",
        }
    }
}

/// Typed write calls of the election contract.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "camelCase")]
pub enum WriteCall {
    CreateElection {
        title: String,
        description: String,
        registration_deadline: Timestamp,
        start_time: Timestamp,
        end_time: Timestamp,
    },
    AddCandidate {
        name: String,
        party: String,
        manifesto: String,
    },
    RegisterVoter {
        voter: Address,
    },
    SelfRegister,
    Vote {
        candidate_id: CandidateId,
    },
    StartVoting,
    EndVoting,
    FinalizeElection,
    AssignRole {
        user: Address,
        role: Role,
    },
}

impl WriteCall {
    /// Contract method name.
    pub fn method(&self) -> &'static str {
        match self {
            WriteCall::CreateElection { .. } => "createElection",
            WriteCall::AddCandidate { .. } => "addCandidate",
            WriteCall::RegisterVoter { .. } => "registerVoter",
            WriteCall::SelfRegister => "selfRegister",
            WriteCall::Vote { .. } => "vote",
            WriteCall::StartVoting => "startVoting",
            WriteCall::EndVoting => "endVoting",
            WriteCall::FinalizeElection => "finalizeElection",
            WriteCall::AssignRole { .. } => "assignRole",
        }
    }

    /// Positional ABI arguments, as sent over JSON-RPC.
    pub fn params(&self) -> Value {
        match self {
            WriteCall::CreateElection {
                title,
                description,
                registration_deadline,
                start_time,
                end_time,
            } => json!([title, description, registration_deadline, start_time, end_time]),
            WriteCall::AddCandidate {
                name,
                party,
                manifesto,
            } => json!([name, party, manifesto]),
            WriteCall::RegisterVoter { voter } => json!([fmt_address(voter)]),
            WriteCall::Vote { candidate_id } => json!([candidate_id]),
            WriteCall::AssignRole { user, role } => json!([fmt_address(user), role.as_u8()]),
            WriteCall::SelfRegister
            | WriteCall::StartVoting
            | WriteCall::EndVoting
            | WriteCall::FinalizeElection => json!([]),
        }
    }

    /// Cache namespaces that go stale once this call lands.
    pub fn invalidates(&self) -> &'static [Namespace] {
        match self {
            WriteCall::Vote { .. } => &[Namespace::Election, Namespace::Voter, Namespace::Candidate],
            WriteCall::RegisterVoter { .. } | WriteCall::SelfRegister => {
                &[Namespace::Voter, Namespace::Election]
            }
            WriteCall::AssignRole { .. } => &[Namespace::Role],
            WriteCall::AddCandidate { .. } => &[Namespace::Candidate, Namespace::Election],
            WriteCall::CreateElection { .. }
            | WriteCall::StartVoting
            | WriteCall::EndVoting
            | WriteCall::FinalizeElection => &[Namespace::Election],
        }
    }

    /// Local pre-flight checks. A call that fails here never reaches the ledger.
    pub fn validate(&self) -> Result<(), TransactionError> {
        match self {
            WriteCall::CreateElection {
                title,
                description,
                registration_deadline,
                start_time,
                end_time,
            } => {
                if title.trim().is_empty() {
                    return Err(TransactionError::validation("election title is required"));
                }
                if title.len() > MAX_TITLE_LEN {
                    return Err(TransactionError::validation("election title is too long"));
                }
                if description.len() > MAX_TEXT_LEN {
                    return Err(TransactionError::validation("election description is too long"));
                }
                if !(registration_deadline < start_time && start_time < end_time) {
                    return Err(TransactionError::validation(
                        "expected registration deadline < start time < end time",
                    ));
                }
                Ok(())
            }
            WriteCall::AddCandidate {
                name,
                party,
                manifesto,
            } => {
                if name.trim().is_empty() {
                    return Err(TransactionError::validation("candidate name is required"));
                }
                if party.trim().is_empty() {
                    return Err(TransactionError::validation("candidate party is required"));
                }
                if name.len() > MAX_TITLE_LEN || party.len() > MAX_TITLE_LEN {
                    return Err(TransactionError::validation("candidate name or party is too long"));
                }
                if manifesto.len() > MAX_TEXT_LEN {
                    return Err(TransactionError::validation("candidate manifesto is too long"));
                }
                Ok(())
            }
            WriteCall::RegisterVoter { voter } => {
                if *voter == [0u8; 20] {
                    return Err(TransactionError::validation("voter address must not be zero"));
                }
                Ok(())
            }
            WriteCall::AssignRole { user, .. } => {
                if *user == [0u8; 20] {
                    return Err(TransactionError::validation("role address must not be zero"));
                }
                Ok(())
            }
            WriteCall::Vote { candidate_id } => {
                if *candidate_id == 0 {
                    return Err(TransactionError::validation("candidate ids start at 1"));
                }
                Ok(())
            }
            WriteCall::SelfRegister
            | WriteCall::StartVoting
            | WriteCall::EndVoting
            | WriteCall::FinalizeElection => Ok(()),
        }
    }

    /// Whether `event` is the ledger's acknowledgement of this call sent by
    /// `from`. Used to reconcile transactions whose confirmation wait timed out.
    pub fn produced(&self, from: &Address, event: &LedgerEvent) -> bool {
        match (self, event) {
            (
                WriteCall::Vote { candidate_id },
                LedgerEvent::VoteCast {
                    voter: Some(voter),
                    candidate_id: cast_for,
                    ..
                },
            ) => voter == from && candidate_id == cast_for,
            (WriteCall::SelfRegister, LedgerEvent::VoterRegistered { voter: Some(v), .. }) => {
                v == from
            }
            (
                WriteCall::RegisterVoter { voter },
                LedgerEvent::VoterRegistered { voter: Some(v), .. },
            ) => v == voter,
            (
                WriteCall::AddCandidate { name, party, .. },
                LedgerEvent::CandidateAdded {
                    name: added_name,
                    party: added_party,
                    added_by,
                    ..
                },
            ) => {
                name == added_name
                    && party == added_party
                    && added_by.is_none_or(|by| &by == from)
            }
            (WriteCall::StartVoting, LedgerEvent::ElectionStarted { .. }) => true,
            (WriteCall::EndVoting, LedgerEvent::ElectionEnded { .. }) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vote_family_invalidates_three_namespaces() {
        let ns = WriteCall::Vote { candidate_id: 1 }.invalidates();
        assert!(ns.contains(&Namespace::Election));
        assert!(ns.contains(&Namespace::Voter));
        assert!(ns.contains(&Namespace::Candidate));
        assert_eq!(
            WriteCall::AssignRole {
                user: [1; 20],
                role: Role::Admin
            }
            .invalidates(),
            &[Namespace::Role]
        );
        assert_eq!(
            WriteCall::SelfRegister.invalidates(),
            &[Namespace::Voter, Namespace::Election]
        );
    }

    #[test]
    fn preflight_rejects_bad_arguments() {
        assert!(WriteCall::Vote { candidate_id: 0 }.validate().is_err());
        assert!(
            WriteCall::CreateElection {
                title: "General".into(),
                description: String::new(),
                registration_deadline: 30,
                start_time: 20,
                end_time: 40,
            }
            .validate()
            .is_err()
        );
        assert!(
            WriteCall::AddCandidate {
                name: " ".into(),
                party: "P".into(),
                manifesto: String::new(),
            }
            .validate()
            .is_err()
        );
        assert!(WriteCall::RegisterVoter { voter: [0; 20] }.validate().is_err());
        assert!(WriteCall::StartVoting.validate().is_ok());
    }

    #[test]
    fn params_are_positional() {
        let call = WriteCall::AssignRole {
            user: [0x11; 20],
            role: Role::Commissioner,
        };
        assert_eq!(call.method(), "assignRole");
        assert_eq!(
            call.params(),
            json!([format!("0x{}", "11".repeat(20)), 4])
        );
    }

    #[test]
    fn vote_is_matched_by_voter_and_candidate() {
        let me = [7; 20];
        let call = WriteCall::Vote { candidate_id: 2 };
        let ev = |voter, candidate_id| LedgerEvent::VoteCast {
            voter,
            candidate_id,
            timestamp: 0,
            record_id: None,
        };
        assert!(call.produced(&me, &ev(Some(me), 2)));
        assert!(!call.produced(&me, &ev(Some(me), 1)));
        assert!(!call.produced(&me, &ev(Some([8; 20]), 2)));
        assert!(!call.produced(&me, &ev(None, 2)));
    }
}
