// src/decode.rs
//
// Decoding of raw ledger answers (positional JSON arrays and receipt/event
// objects) into the typed entities of `types.rs`. Every reader fails with
// `GatewayError::Decode` naming the field; nothing is partially decoded.

use serde_json::Value;

use crate::gateway::{GatewayError, LedgerEvent, TxReceipt};
use crate::types::{
    Address, Candidate, ElectionInfo, ElectionStatistics, Role, TxHash, UserRole, Voter,
    WinnerInfo, parse_address, parse_hash,
};

fn err(what: &str, expected: &str, got: &Value) -> GatewayError {
    GatewayError::Decode(format!("{what}: expected {expected}, got {got}"))
}

/// Unsigned integer given as a JSON number, a decimal string or a `0x` hex
/// string.
pub fn uint(what: &str, v: &Value) -> Result<u128, GatewayError> {
    match v {
        Value::Number(n) => n
            .as_u64()
            .map(u128::from)
            .ok_or_else(|| err(what, "unsigned integer", v)),
        Value::String(s) => {
            let s = s.trim();
            let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                Some("") => Ok(0),
                Some(hex) => u128::from_str_radix(hex, 16),
                None => s.parse::<u128>(),
            };
            parsed.map_err(|_| err(what, "unsigned integer", v))
        }
        _ => Err(err(what, "unsigned integer", v)),
    }
}

pub fn uint64(what: &str, v: &Value) -> Result<u64, GatewayError> {
    u64::try_from(uint(what, v)?).map_err(|_| err(what, "64-bit integer", v))
}

pub fn boolean(what: &str, v: &Value) -> Result<bool, GatewayError> {
    match v {
        Value::Bool(b) => Ok(*b),
        // Some nodes encode bools as 0/1.
        Value::Number(_) | Value::String(_) => match uint(what, v)? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(err(what, "bool", v)),
        },
        _ => Err(err(what, "bool", v)),
    }
}

pub fn string(what: &str, v: &Value) -> Result<String, GatewayError> {
    v.as_str()
        .map(str::to_string)
        .ok_or_else(|| err(what, "string", v))
}

pub fn address(what: &str, v: &Value) -> Result<Address, GatewayError> {
    let s = v.as_str().ok_or_else(|| err(what, "address", v))?;
    parse_address(s).map_err(|_| err(what, "20-byte hex address", v))
}

pub fn hash(what: &str, v: &Value) -> Result<TxHash, GatewayError> {
    let s = v.as_str().ok_or_else(|| err(what, "hash", v))?;
    parse_hash(s).map_err(|_| err(what, "32-byte hex hash", v))
}

/// Positional tuple with a fixed arity.
struct Tuple<'a> {
    what: &'static str,
    items: &'a [Value],
}

impl<'a> Tuple<'a> {
    fn new(what: &'static str, v: &'a Value, arity: usize) -> Result<Self, GatewayError> {
        let items = v
            .as_array()
            .ok_or_else(|| err(what, &format!("{arity}-tuple"), v))?;
        if items.len() != arity {
            return Err(GatewayError::Decode(format!(
                "{what}: expected {arity} fields, got {}",
                items.len()
            )));
        }
        Ok(Self { what, items })
    }

    fn field(&self, i: usize) -> String {
        format!("{}[{i}]", self.what)
    }

    fn u64(&self, i: usize) -> Result<u64, GatewayError> {
        uint64(&self.field(i), &self.items[i])
    }

    fn bool(&self, i: usize) -> Result<bool, GatewayError> {
        boolean(&self.field(i), &self.items[i])
    }

    fn string(&self, i: usize) -> Result<String, GatewayError> {
        string(&self.field(i), &self.items[i])
    }

    fn address(&self, i: usize) -> Result<Address, GatewayError> {
        address(&self.field(i), &self.items[i])
    }
}

/// `getElectionInfo()`. The ledger answers with a zeroed tuple before any
/// election exists; that decodes to `None`.
pub fn election_info(v: &Value) -> Result<Option<ElectionInfo>, GatewayError> {
    let t = Tuple::new("electionInfo", v, 10)?;
    let info = ElectionInfo {
        title: t.string(0)?,
        description: t.string(1)?,
        registration_deadline: t.u64(2)?,
        start_time: t.u64(3)?,
        end_time: t.u64(4)?,
        is_active: t.bool(5)?,
        is_finalized: t.bool(6)?,
        total_voters: t.u64(7)?,
        total_votes: t.u64(8)?,
        winner_id: t.u64(9)?,
    };
    let empty = info.title.is_empty()
        && info.registration_deadline == 0
        && info.start_time == 0
        && info.end_time == 0;
    Ok(if empty { None } else { Some(info) })
}

/// `getAllCandidates()`: array of `(id, name, party, manifesto, voteCount, isActive)`.
pub fn candidates(v: &Value) -> Result<Vec<Candidate>, GatewayError> {
    let items = v
        .as_array()
        .ok_or_else(|| err("candidates", "array", v))?;
    items
        .iter()
        .map(|item| {
            let t = Tuple::new("candidate", item, 6)?;
            Ok(Candidate {
                id: t.u64(0)?,
                name: t.string(1)?,
                party: t.string(2)?,
                manifesto: t.string(3)?,
                vote_count: t.u64(4)?,
                is_active: t.bool(5)?,
            })
        })
        .collect()
}

/// `getVoterInfo(who)`: `(isRegistered, hasVoted, candidateVoted, voterID, registrationTime)`.
pub fn voter(who: Address, v: &Value) -> Result<Voter, GatewayError> {
    let t = Tuple::new("voterInfo", v, 5)?;
    Ok(Voter {
        address: who,
        is_registered: t.bool(0)?,
        has_voted: t.bool(1)?,
        candidate_voted: t.u64(2)?,
        voter_id: t.u64(3)?,
        registration_time: t.u64(4)?,
    })
}

/// `getUserRole(who)`: `(role, isActive, assignedAt, assignedBy)`.
pub fn user_role(who: Address, v: &Value) -> Result<UserRole, GatewayError> {
    let t = Tuple::new("userRole", v, 4)?;
    let raw = t.u64(0)?;
    let role = u8::try_from(raw)
        .ok()
        .and_then(Role::from_u8)
        .ok_or_else(|| GatewayError::Decode(format!("userRole[0]: unknown role {raw}")))?;
    Ok(UserRole {
        address: who,
        role,
        is_active: t.bool(1)?,
        assigned_at: t.u64(2)?,
        assigned_by: t.address(3)?,
    })
}

/// `getCurrentWinner()`: `(candidateId, name, voteCount, isTie)`.
pub fn winner(v: &Value) -> Result<WinnerInfo, GatewayError> {
    let t = Tuple::new("currentWinner", v, 4)?;
    Ok(WinnerInfo {
        candidate_id: t.u64(0)?,
        name: t.string(1)?,
        vote_count: t.u64(2)?,
        is_tie: t.bool(3)?,
    })
}

/// `getElectionStatistics()`:
/// `(totalRegisteredVoters, totalVotesCast, turnoutPercentage, activeCandidates)`.
pub fn statistics(v: &Value) -> Result<ElectionStatistics, GatewayError> {
    let t = Tuple::new("electionStatistics", v, 4)?;
    Ok(ElectionStatistics {
        total_registered_voters: t.u64(0)?,
        total_votes_cast: t.u64(1)?,
        turnout_percentage: t.u64(2)?,
        active_candidates: t.u64(3)?,
    })
}

fn member<'a>(what: &str, obj: &'a Value, key: &str) -> Result<&'a Value, GatewayError> {
    obj.get(key)
        .ok_or_else(|| GatewayError::Decode(format!("{what}: missing `{key}`")))
}

/// Transaction receipt object; `null` while pending.
pub fn receipt(v: &Value) -> Result<Option<TxReceipt>, GatewayError> {
    if v.is_null() {
        return Ok(None);
    }
    let what = "receipt";
    let success = boolean("receipt.status", member(what, v, "status")?)?;
    let revert_reason = match v.get("revertReason") {
        None | Some(Value::Null) => None,
        Some(r) => Some(string("receipt.revertReason", r)?),
    };
    Ok(Some(TxReceipt {
        hash: hash("receipt.transactionHash", member(what, v, "transactionHash")?)?,
        block_number: uint64("receipt.blockNumber", member(what, v, "blockNumber")?)?,
        gas_used: uint64("receipt.gasUsed", member(what, v, "gasUsed")?)?,
        success,
        revert_reason,
    }))
}

/// Subscription notification: `{"event": "<name>", "args": [...]}`.
pub fn event(v: &Value) -> Result<LedgerEvent, GatewayError> {
    let name = string("event.event", member("event", v, "event")?)?;
    let args = member("event", v, "args")?;
    match name.as_str() {
        "VoteCast" => {
            let t = Tuple::new("VoteCast", args, 4)?;
            Ok(LedgerEvent::VoteCast {
                voter: Some(t.address(0)?),
                candidate_id: t.u64(1)?,
                timestamp: t.u64(2)?,
                record_id: Some(t.u64(3)?),
            })
        }
        "VoterRegistered" => {
            let t = Tuple::new("VoterRegistered", args, 3)?;
            Ok(LedgerEvent::VoterRegistered {
                voter: Some(t.address(0)?),
                voter_id: Some(t.u64(1)?),
                timestamp: t.u64(2)?,
            })
        }
        "CandidateAdded" => {
            let t = Tuple::new("CandidateAdded", args, 4)?;
            Ok(LedgerEvent::CandidateAdded {
                candidate_id: t.u64(0)?,
                name: t.string(1)?,
                party: t.string(2)?,
                added_by: Some(t.address(3)?),
            })
        }
        "ElectionStarted" => {
            let t = Tuple::new("ElectionStarted", args, 1)?;
            Ok(LedgerEvent::ElectionStarted { timestamp: t.u64(0)? })
        }
        "ElectionEnded" => {
            let t = Tuple::new("ElectionEnded", args, 1)?;
            Ok(LedgerEvent::ElectionEnded { timestamp: t.u64(0)? })
        }
        other => Err(GatewayError::Decode(format!("unknown event `{other}`"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;
    use serde_json::json;

    const ALICE: &str = "0xa1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1";
    const ALICE_BYTES: Address = hex!("a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1");

    #[test]
    fn integers_accept_numbers_and_strings() {
        assert_eq!(uint("n", &json!(7)).unwrap(), 7);
        assert_eq!(uint("n", &json!("42")).unwrap(), 42);
        assert_eq!(uint("n", &json!("0x2a")).unwrap(), 42);
        assert_eq!(uint("n", &json!("0x")).unwrap(), 0);
        assert!(uint("n", &json!(-1)).is_err());
        assert!(uint("n", &json!("abc")).is_err());
        assert!(uint64("n", &json!("0x1ffffffffffffffff")).is_err());
        assert!(boolean("b", &json!(1)).unwrap());
        assert!(boolean("b", &json!(2)).is_err());
    }

    #[test]
    fn zeroed_election_tuple_is_none() {
        let v = json!(["", "", 0, 0, 0, false, false, 0, 0, 0]);
        assert_eq!(election_info(&v).unwrap(), None);

        let v = json!(["Board", "", "100", "200", "0x12c", true, false, 3, 2, 0]);
        let info = election_info(&v).unwrap().unwrap();
        assert_eq!(info.end_time, 300);
        assert!(info.is_active);
        assert_eq!(info.total_voters, 3);
    }

    #[test]
    fn wrong_arity_is_a_decode_error() {
        let v = json!(["Board", "", 1, 2]);
        let e = election_info(&v).unwrap_err();
        assert!(matches!(e, GatewayError::Decode(m) if m.contains("expected 10 fields")));
    }

    #[test]
    fn candidates_and_role_decode() {
        let v = json!([[1, "Ada", "Blue", "Open books", "5", true]]);
        let c = candidates(&v).unwrap();
        assert_eq!(c[0].vote_count, 5);

        let who = parse_address(ALICE).unwrap();
        assert_eq!(who, ALICE_BYTES);
        let r = user_role(who, &json!([3, true, 10, ALICE])).unwrap();
        assert_eq!(r.role, Role::Admin);
        assert_eq!(r.assigned_by, ALICE_BYTES);
        assert!(user_role(who, &json!([9, true, 10, ALICE])).is_err());
    }

    #[test]
    fn receipts_and_events_decode() {
        assert_eq!(receipt(&Value::Null).unwrap(), None);
        let r = receipt(&json!({
            "transactionHash": format!("0x{}", "ab".repeat(32)),
            "blockNumber": "0x10",
            "gasUsed": 21000,
            "status": "0x0",
            "revertReason": "Already voted",
        }))
        .unwrap()
        .unwrap();
        assert_eq!(r.block_number, 16);
        assert!(!r.success);
        assert_eq!(r.revert_reason.as_deref(), Some("Already voted"));

        let ev = event(&json!({"event": "VoteCast", "args": [ALICE, 2, 1000, 7]})).unwrap();
        assert_eq!(
            ev,
            LedgerEvent::VoteCast {
                voter: Some(ALICE_BYTES),
                candidate_id: 2,
                timestamp: 1000,
                record_id: Some(7),
            }
        );
        assert!(event(&json!({"event": "Paused", "args": []})).is_err());
    }
}
