// src/mock_ledger.rs
//
// In-memory ledger implementing `LedgerGateway` with the election contract's
// external behaviour: role checks, phase windows, revert reasons, per-account
// nonces, receipts and events. Tests can inject failures per operation, hold
// receipts back, slow reads down, move the ledger clock and count calls.
//
// Reverts use the same reason strings as the deployed contract so that the
// revert message table in `errors.rs` applies.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::calls::WriteCall;
use crate::gateway::{EventStream, GatewayError, LedgerEvent, LedgerGateway, TxReceipt, TxRequest};
use crate::types::{
    Address, Candidate, ElectionInfo, ElectionStatistics, GasPrice, Role, Timestamp, TxHash,
    UserRole, VoteRecord, Voter, WinnerInfo,
};

/// Operations a test can fail or count.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MockOp {
    /// Any of the six contract reads.
    Read,
    EstimateGas,
    GasPrice,
    TransactionCount,
    Send,
    Receipt,
    BlockNumber,
    Subscribe,
}

/// Contract storage. Cloned to simulate calls for gas estimation.
#[derive(Clone, Debug, Default)]
struct Contract {
    owner: Address,
    election: Option<ElectionInfo>,
    candidates: Vec<Candidate>,
    voters: HashMap<Address, Voter>,
    roles: HashMap<Address, UserRole>,
    records: Vec<VoteRecord>,
}

impl Contract {
    fn role_of(&self, who: &Address) -> Role {
        if *who == self.owner {
            return Role::Commissioner;
        }
        self.roles
            .get(who)
            .map(UserRole::effective)
            .unwrap_or(Role::None)
    }

    fn require_role(&self, who: &Address, min: Role) -> Result<(), String> {
        if self.role_of(who) >= min {
            Ok(())
        } else {
            Err("Not authorized".into())
        }
    }

    fn election(&self) -> Result<&ElectionInfo, String> {
        self.election.as_ref().ok_or_else(|| "No election".to_string())
    }

    fn election_mut(&mut self) -> Result<&mut ElectionInfo, String> {
        self.election.as_mut().ok_or_else(|| "No election".to_string())
    }

    fn register(&mut self, who: Address, now: Timestamp) -> Result<LedgerEvent, String> {
        let election = self.election()?;
        if now >= election.registration_deadline {
            return Err("Registration closed".into());
        }
        if self.voters.get(&who).is_some_and(|v| v.is_registered) {
            return Err("Already registered".into());
        }
        let voter_id = self.voters.values().filter(|v| v.is_registered).count() as u64 + 1;
        self.voters.insert(
            who,
            Voter {
                address: who,
                is_registered: true,
                has_voted: false,
                candidate_voted: 0,
                voter_id,
                registration_time: now,
            },
        );
        self.election_mut()?.total_voters += 1;
        Ok(LedgerEvent::VoterRegistered {
            voter: Some(who),
            voter_id: Some(voter_id),
            timestamp: now,
        })
    }

    fn leader(&self) -> WinnerInfo {
        let active: Vec<&Candidate> = self.candidates.iter().filter(|c| c.is_active).collect();
        let max = active.iter().map(|c| c.vote_count).max().unwrap_or(0);
        if max == 0 {
            return WinnerInfo::default();
        }
        let leaders: Vec<&&Candidate> = active.iter().filter(|c| c.vote_count == max).collect();
        let first = leaders[0];
        WinnerInfo {
            candidate_id: first.id,
            name: first.name.clone(),
            vote_count: max,
            is_tie: leaders.len() > 1,
        }
    }

    fn statistics(&self) -> ElectionStatistics {
        let registered = self.voters.values().filter(|v| v.is_registered).count() as u64;
        let cast = self.election.as_ref().map(|e| e.total_votes).unwrap_or(0);
        ElectionStatistics {
            total_registered_voters: registered,
            total_votes_cast: cast,
            turnout_percentage: if registered == 0 {
                0
            } else {
                cast * 100 / registered
            },
            active_candidates: self.candidates.iter().filter(|c| c.is_active).count() as u64,
        }
    }

    /// Run `call` from `from` at ledger time `now`. On error the contract is
    /// left untouched; callers run this on a clone when they must not commit.
    fn apply(
        &mut self,
        from: Address,
        call: &WriteCall,
        now: Timestamp,
    ) -> Result<Vec<LedgerEvent>, String> {
        match call {
            WriteCall::CreateElection {
                title,
                description,
                registration_deadline,
                start_time,
                end_time,
            } => {
                self.require_role(&from, Role::Commissioner)?;
                if self.election.as_ref().is_some_and(|e| !e.is_finalized) {
                    return Err("Election exists".into());
                }
                if !(registration_deadline < start_time && start_time < end_time) {
                    return Err("Invalid schedule".into());
                }
                // A new election after a finalized one starts from a clean slate;
                // candidates added during setup are kept.
                if self.election.is_some() {
                    self.candidates.clear();
                    self.voters.clear();
                    self.records.clear();
                }
                self.election = Some(ElectionInfo {
                    title: title.clone(),
                    description: description.clone(),
                    registration_deadline: *registration_deadline,
                    start_time: *start_time,
                    end_time: *end_time,
                    is_active: false,
                    is_finalized: false,
                    total_voters: 0,
                    total_votes: 0,
                    winner_id: 0,
                });
                Ok(vec![])
            }
            WriteCall::AddCandidate {
                name,
                party,
                manifesto,
            } => {
                self.require_role(&from, Role::Admin)?;
                if let Some(e) = &self.election {
                    if e.is_active || now >= e.start_time {
                        return Err("Voting already started".into());
                    }
                }
                let id = self.candidates.len() as u64 + 1;
                self.candidates.push(Candidate {
                    id,
                    name: name.clone(),
                    party: party.clone(),
                    manifesto: manifesto.clone(),
                    vote_count: 0,
                    is_active: true,
                });
                Ok(vec![LedgerEvent::CandidateAdded {
                    candidate_id: id,
                    name: name.clone(),
                    party: party.clone(),
                    added_by: Some(from),
                }])
            }
            WriteCall::RegisterVoter { voter } => {
                self.require_role(&from, Role::Admin)?;
                Ok(vec![self.register(*voter, now)?])
            }
            WriteCall::SelfRegister => Ok(vec![self.register(from, now)?]),
            WriteCall::Vote { candidate_id } => {
                let e = self.election()?;
                if !e.is_active || e.is_finalized || now < e.start_time || now > e.end_time {
                    return Err("Voting not active".into());
                }
                let voter = self
                    .voters
                    .get(&from)
                    .filter(|v| v.is_registered)
                    .ok_or_else(|| "Not registered".to_string())?;
                if voter.has_voted {
                    return Err("Already voted".into());
                }
                let candidate = self
                    .candidates
                    .iter_mut()
                    .find(|c| c.id == *candidate_id && c.is_active)
                    .ok_or_else(|| "Invalid candidate".to_string())?;
                candidate.vote_count += 1;

                if let Some(v) = self.voters.get_mut(&from) {
                    v.has_voted = true;
                    v.candidate_voted = *candidate_id;
                }
                self.election_mut()?.total_votes += 1;

                let record_id = self.records.len() as u64 + 1;
                let mut verification_hash = [0u8; 32];
                verification_hash[..20].copy_from_slice(&from);
                verification_hash[20..28].copy_from_slice(&candidate_id.to_be_bytes());
                verification_hash[28..].copy_from_slice(&(record_id as u32).to_be_bytes());
                self.records.push(VoteRecord {
                    id: record_id,
                    voter: from,
                    candidate_id: *candidate_id,
                    timestamp: now,
                    verification_hash,
                });
                Ok(vec![LedgerEvent::VoteCast {
                    voter: Some(from),
                    candidate_id: *candidate_id,
                    timestamp: now,
                    record_id: Some(record_id),
                }])
            }
            WriteCall::StartVoting => {
                self.require_role(&from, Role::Commissioner)?;
                let e = self.election_mut()?;
                if e.is_active || e.is_finalized || now > e.end_time {
                    return Err("Voting cannot start".into());
                }
                if now < e.registration_deadline {
                    return Err("Registration still open".into());
                }
                e.is_active = true;
                Ok(vec![LedgerEvent::ElectionStarted { timestamp: now }])
            }
            WriteCall::EndVoting => {
                self.require_role(&from, Role::Commissioner)?;
                let e = self.election_mut()?;
                if !e.is_active {
                    return Err("Voting not active".into());
                }
                e.is_active = false;
                Ok(vec![LedgerEvent::ElectionEnded { timestamp: now }])
            }
            WriteCall::FinalizeElection => {
                self.require_role(&from, Role::Commissioner)?;
                let winner = self.leader();
                let e = self.election_mut()?;
                if e.is_finalized {
                    return Err("Already finalized".into());
                }
                if now <= e.end_time {
                    return Err("Election not ended".into());
                }
                if e.total_votes == 0 {
                    return Err("No votes cast".into());
                }
                e.is_finalized = true;
                e.is_active = false;
                e.winner_id = winner.candidate_id;
                Ok(vec![])
            }
            WriteCall::AssignRole { user, role } => {
                self.require_role(&from, Role::Commissioner)?;
                self.roles.insert(
                    *user,
                    UserRole {
                        address: *user,
                        role: *role,
                        is_active: *role != Role::None,
                        assigned_at: now,
                        assigned_by: from,
                    },
                );
                Ok(vec![])
            }
        }
    }
}

struct State {
    contract: Contract,
    now: Timestamp,
    block: u64,
    gas_price: GasPrice,
    gas_estimate: u64,
    nonces: HashMap<Address, u64>,
    receipts: HashMap<TxHash, TxReceipt>,
    unmined: VecDeque<(TxHash, TxRequest)>,
    auto_mine: bool,
    events_supported: bool,
    failures: HashMap<MockOp, VecDeque<GatewayError>>,
    lost_replies: VecDeque<GatewayError>,
    read_latency: Duration,
    calls: HashMap<MockOp, usize>,
    sent: Vec<TxRequest>,
    tx_counter: u64,
}

pub struct MockLedger {
    state: Mutex<State>,
    events: Mutex<broadcast::Sender<LedgerEvent>>,
}

impl MockLedger {
    /// A ledger whose contract is owned by `owner` (who acts as commissioner).
    pub fn new(owner: Address) -> Self {
        let (tx, _) = broadcast::channel(256);
        Self {
            state: Mutex::new(State {
                contract: Contract {
                    owner,
                    ..Contract::default()
                },
                now: 1_700_000_000,
                block: 1,
                gas_price: 20_000_000_000,
                gas_estimate: 100_000,
                nonces: HashMap::new(),
                receipts: HashMap::new(),
                unmined: VecDeque::new(),
                auto_mine: true,
                events_supported: true,
                failures: HashMap::new(),
                lost_replies: VecDeque::new(),
                read_latency: Duration::ZERO,
                calls: HashMap::new(),
                sent: Vec::new(),
                tx_counter: 0,
            }),
            events: Mutex::new(tx),
        }
    }

    pub fn now(&self) -> Timestamp {
        self.state.lock().now
    }

    pub fn set_time(&self, now: Timestamp) {
        self.state.lock().now = now;
    }

    pub fn advance_time(&self, secs: u64) {
        self.state.lock().now += secs;
    }

    pub fn set_gas_price(&self, price: GasPrice) {
        self.state.lock().gas_price = price;
    }

    pub fn set_gas_estimate(&self, gas: u64) {
        self.state.lock().gas_estimate = gas;
    }

    /// When off, sent transactions stay unmined until [`MockLedger::mine_pending`].
    pub fn set_auto_mine(&self, on: bool) {
        self.state.lock().auto_mine = on;
    }

    /// Make `subscribe_events` report [`GatewayError::Unsupported`].
    pub fn disable_events(&self) {
        self.state.lock().events_supported = false;
    }

    /// Queue a failure for the next call of `op`.
    pub fn fail_next(&self, op: MockOp, err: GatewayError) {
        self.state
            .lock()
            .failures
            .entry(op)
            .or_default()
            .push_back(err);
    }

    /// Apply the next sent transaction but answer with `err`, as when the
    /// connection drops after the node accepted it.
    pub fn lose_next_send_reply(&self, err: GatewayError) {
        self.state.lock().lost_replies.push_back(err);
    }

    /// Contract reads take their value on entry and answer after `latency`.
    pub fn set_read_latency(&self, latency: Duration) {
        self.state.lock().read_latency = latency;
    }

    pub fn calls(&self, op: MockOp) -> usize {
        self.state.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Every transaction accepted by `send_transaction`, in order.
    pub fn sent(&self) -> Vec<TxRequest> {
        self.state.lock().sent.clone()
    }

    pub fn vote_records(&self) -> Vec<VoteRecord> {
        self.state.lock().contract.records.clone()
    }

    /// Publish an event to current subscribers, e.g. to replay a duplicate.
    pub fn emit(&self, event: LedgerEvent) {
        // No receivers is fine.
        let _ = self.events.lock().send(event);
    }

    /// Close every open subscription stream, as a dropped connection would.
    pub fn drop_subscriptions(&self) {
        let (tx, _) = broadcast::channel(256);
        *self.events.lock() = tx;
    }

    pub fn subscriber_count(&self) -> usize {
        self.events.lock().receiver_count()
    }

    /// Mine every held-back transaction. Returns how many were mined.
    pub fn mine_pending(&self) -> usize {
        let mut emitted = Vec::new();
        let mined = {
            let mut st = self.state.lock();
            let queued: Vec<_> = st.unmined.drain(..).collect();
            for (hash, tx) in &queued {
                emitted.extend(Self::mine(&mut st, *hash, tx));
            }
            queued.len()
        };
        for ev in emitted {
            self.emit(ev);
        }
        mined
    }

    fn mine(st: &mut State, hash: TxHash, tx: &TxRequest) -> Vec<LedgerEvent> {
        st.block += 1;
        let now = st.now;
        let needed = st.gas_estimate;
        let outcome = if tx.gas_limit < needed {
            Err("out of gas".to_string())
        } else {
            let mut next = st.contract.clone();
            match next.apply(tx.from, &tx.call, now) {
                Ok(events) => {
                    st.contract = next;
                    Ok(events)
                }
                Err(reason) => Err(reason),
            }
        };
        let (success, revert_reason, events) = match outcome {
            Ok(events) => (true, None, events),
            Err(reason) => (false, Some(reason), Vec::new()),
        };
        st.receipts.insert(
            hash,
            TxReceipt {
                hash,
                block_number: st.block,
                gas_used: needed.min(tx.gas_limit),
                success,
                revert_reason,
            },
        );
        events
    }

    async fn answer<T>(&self, value: T) -> T {
        let latency = self.state.lock().read_latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        value
    }

    fn enter(&self, op: MockOp) -> Result<(), GatewayError> {
        let mut st = self.state.lock();
        *st.calls.entry(op).or_default() += 1;
        match st.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl LedgerGateway for MockLedger {
    async fn election_info(&self) -> Result<Option<ElectionInfo>, GatewayError> {
        self.enter(MockOp::Read)?;
        let election = self.state.lock().contract.election.clone();
        Ok(self.answer(election).await)
    }

    async fn all_candidates(&self) -> Result<Vec<Candidate>, GatewayError> {
        self.enter(MockOp::Read)?;
        let candidates = self.state.lock().contract.candidates.clone();
        Ok(self.answer(candidates).await)
    }

    async fn voter_info(&self, who: Address) -> Result<Voter, GatewayError> {
        self.enter(MockOp::Read)?;
        let voter = self
            .state
            .lock()
            .contract
            .voters
            .get(&who)
            .cloned()
            .unwrap_or_else(|| Voter::unregistered(who));
        Ok(self.answer(voter).await)
    }

    async fn user_role(&self, who: Address) -> Result<UserRole, GatewayError> {
        self.enter(MockOp::Read)?;
        let role = {
            let st = self.state.lock();
            if who == st.contract.owner {
                UserRole {
                    address: who,
                    role: Role::Commissioner,
                    is_active: true,
                    assigned_at: 0,
                    assigned_by: who,
                }
            } else {
                st.contract
                    .roles
                    .get(&who)
                    .cloned()
                    .unwrap_or_else(|| UserRole::none(who))
            }
        };
        Ok(self.answer(role).await)
    }

    async fn current_winner(&self) -> Result<WinnerInfo, GatewayError> {
        self.enter(MockOp::Read)?;
        let winner = self.state.lock().contract.leader();
        Ok(self.answer(winner).await)
    }

    async fn election_statistics(&self) -> Result<ElectionStatistics, GatewayError> {
        self.enter(MockOp::Read)?;
        let statistics = self.state.lock().contract.statistics();
        Ok(self.answer(statistics).await)
    }

    async fn estimate_gas(&self, from: Address, call: &WriteCall) -> Result<u64, GatewayError> {
        self.enter(MockOp::EstimateGas)?;
        let st = self.state.lock();
        let mut dry = st.contract.clone();
        dry.apply(from, call, st.now).map_err(GatewayError::Revert)?;
        Ok(st.gas_estimate)
    }

    async fn gas_price(&self) -> Result<GasPrice, GatewayError> {
        self.enter(MockOp::GasPrice)?;
        Ok(self.state.lock().gas_price)
    }

    async fn transaction_count(&self, who: Address) -> Result<u64, GatewayError> {
        self.enter(MockOp::TransactionCount)?;
        Ok(self.state.lock().nonces.get(&who).copied().unwrap_or(0))
    }

    async fn send_transaction(&self, tx: &TxRequest) -> Result<TxHash, GatewayError> {
        self.enter(MockOp::Send)?;
        let (hash, events, lost) = {
            let mut st = self.state.lock();
            let expected = st.nonces.get(&tx.from).copied().unwrap_or(0);
            if tx.nonce < expected {
                return Err(GatewayError::NonceConflict(format!(
                    "nonce too low: next nonce {expected}, tx nonce {}",
                    tx.nonce
                )));
            }
            if tx.nonce > expected {
                return Err(GatewayError::NonceConflict(format!(
                    "nonce too high: next nonce {expected}, tx nonce {}",
                    tx.nonce
                )));
            }
            st.nonces.insert(tx.from, expected + 1);
            st.sent.push(tx.clone());

            st.tx_counter += 1;
            let mut hash = [0u8; 32];
            hash[..20].copy_from_slice(&tx.from);
            hash[24..].copy_from_slice(&st.tx_counter.to_be_bytes());

            let events = if st.auto_mine {
                Self::mine(&mut st, hash, tx)
            } else {
                st.unmined.push_back((hash, tx.clone()));
                Vec::new()
            };
            (hash, events, st.lost_replies.pop_front())
        };
        for ev in events {
            self.emit(ev);
        }
        match lost {
            Some(err) => Err(err),
            None => Ok(hash),
        }
    }

    async fn transaction_receipt(&self, hash: TxHash) -> Result<Option<TxReceipt>, GatewayError> {
        self.enter(MockOp::Receipt)?;
        Ok(self.state.lock().receipts.get(&hash).cloned())
    }

    async fn block_number(&self) -> Result<u64, GatewayError> {
        self.enter(MockOp::BlockNumber)?;
        Ok(self.state.lock().block)
    }

    async fn subscribe_events(&self) -> Result<EventStream, GatewayError> {
        self.enter(MockOp::Subscribe)?;
        if !self.state.lock().events_supported {
            return Err(GatewayError::Unsupported("no event channel".into()));
        }
        let rx = self.events.lock().subscribe();
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(ev) => return Some((Ok(ev), rx)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(Box::pin(stream))
    }
}
