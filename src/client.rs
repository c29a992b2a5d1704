// src/client.rs
//
// `ElectionClient` owns one cache, one transaction manager and one event
// monitor, all wired to the same injected gateway. Reads go through the
// cache; writes go through the manager, which invalidates on success; the
// monitor invalidates on ledger events and settles writes nobody waits on.

use std::sync::Arc;

use anyhow::Result;
use futures::future::try_join_all;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cache::{ReadCache, keys};
use crate::calls::WriteCall;
use crate::config::ClientConfig;
use crate::errors::TransactionError;
use crate::events::{EventMonitor, EventSubscription};
use crate::gateway::{EventKind, GatewayError, LedgerGateway};
use crate::pending::{HistoryEntry, PendingTransaction, TxTracker};
use crate::phase::{Permissions, Phase, phase_of, time_remaining};
use crate::tx_manager::{TransactionManager, TxOptions, TxOutcome};
use crate::types::{
    Address, Candidate, CandidateId, ElectionInfo, ElectionSnapshot, ElectionStatistics, Role,
    Timestamp, UserRole, Voter, WinnerInfo, unix_now,
};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReadError {
    #[error("reading {what} failed: {source}")]
    Ledger {
        what: &'static str,
        #[source]
        source: GatewayError,
    },
}

impl ReadError {
    fn ledger(what: &'static str) -> impl FnOnce(GatewayError) -> Self {
        move |source| ReadError::Ledger { what, source }
    }
}

/// Decoded reads as stored in the cache.
#[derive(Clone, Debug)]
pub enum CachedRead {
    Election(Option<ElectionInfo>),
    Candidates(Vec<Candidate>),
    Voter(Voter),
    Role(UserRole),
    Winner(WinnerInfo),
    Statistics(ElectionStatistics),
}

type Clock = Arc<dyn Fn() -> Timestamp + Send + Sync>;

pub struct ElectionClient {
    gateway: Arc<dyn LedgerGateway>,
    cache: Arc<ReadCache<CachedRead>>,
    transactions: TransactionManager,
    monitor: EventMonitor,
    config: ClientConfig,
    clock: Clock,
}

impl ElectionClient {
    /// Build a client over `gateway`. Fails if `config` does not validate.
    ///
    /// The event monitor starts on the first read, write or subscription, so
    /// construction does not need a runtime.
    pub fn new(gateway: Arc<dyn LedgerGateway>, config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let cache = Arc::new(ReadCache::new(config.cache_ttl));
        let tracker = Arc::new(TxTracker::new(config.history_limit));
        let transactions = TransactionManager::new(
            gateway.clone(),
            cache.clone(),
            tracker.clone(),
            config.clone(),
        );
        let monitor = EventMonitor::new(gateway.clone(), cache.clone(), tracker, config.clone());
        Ok(Self {
            gateway,
            cache,
            transactions,
            monitor,
            config,
            clock: Arc::new(unix_now),
        })
    }

    /// Replace the wall clock used for phase derivation.
    pub fn with_clock(mut self, clock: impl Fn() -> Timestamp + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn cache(&self) -> &ReadCache<CachedRead> {
        &self.cache
    }

    pub fn now(&self) -> Timestamp {
        (self.clock)()
    }

    /// Read `key` through the cache. A failed refresh falls back to the last
    /// stored value, if any; failed reads are never cached.
    async fn read_through<T, Fut>(
        &self,
        what: &'static str,
        key: &str,
        fetch: Fut,
        wrap: fn(T) -> CachedRead,
        unwrap: fn(CachedRead) -> Option<T>,
    ) -> Result<T, ReadError>
    where
        T: Clone,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        self.monitor.start();
        if !self.cache.needs_refresh(key) {
            if let Some(v) = self.cache.get_stale(key).and_then(unwrap) {
                return Ok(v);
            }
        }

        // Taken before the fetch: a write confirmed while the read is in
        // flight invalidates, and the older value must not be stored over it.
        let generation = self.cache.generation();
        match fetch.await {
            Ok(v) => {
                if self.cache.set_if_current(key, wrap(v.clone()), generation) {
                    debug!(key, "cache refreshed");
                } else {
                    debug!(key, "cache invalidated during read; not storing");
                }
                Ok(v)
            }
            Err(e) => match self.cache.get_stale(key).and_then(unwrap) {
                Some(stale) => {
                    warn!(key, error = %e, "read failed; serving last cached value");
                    Ok(stale)
                }
                None => Err(ReadError::ledger(what)(e)),
            },
        }
    }

    pub async fn election_info(&self) -> Result<Option<ElectionInfo>, ReadError> {
        self.read_through(
            "election info",
            keys::ELECTION_INFO,
            self.gateway.election_info(),
            CachedRead::Election,
            |c| match c {
                CachedRead::Election(v) => Some(v),
                _ => None,
            },
        )
        .await
    }

    pub async fn candidates(&self) -> Result<Vec<Candidate>, ReadError> {
        self.read_through(
            "candidates",
            keys::CANDIDATES,
            self.gateway.all_candidates(),
            CachedRead::Candidates,
            |c| match c {
                CachedRead::Candidates(v) => Some(v),
                _ => None,
            },
        )
        .await
    }

    pub async fn voter(&self, who: Address) -> Result<Voter, ReadError> {
        self.read_through(
            "voter",
            &keys::voter(&who),
            self.gateway.voter_info(who),
            CachedRead::Voter,
            |c| match c {
                CachedRead::Voter(v) => Some(v),
                _ => None,
            },
        )
        .await
    }

    pub async fn role(&self, who: Address) -> Result<UserRole, ReadError> {
        self.read_through(
            "role",
            &keys::role(&who),
            self.gateway.user_role(who),
            CachedRead::Role,
            |c| match c {
                CachedRead::Role(v) => Some(v),
                _ => None,
            },
        )
        .await
    }

    pub async fn winner(&self) -> Result<WinnerInfo, ReadError> {
        self.read_through(
            "winner",
            keys::ELECTION_WINNER,
            self.gateway.current_winner(),
            CachedRead::Winner,
            |c| match c {
                CachedRead::Winner(v) => Some(v),
                _ => None,
            },
        )
        .await
    }

    pub async fn statistics(&self) -> Result<ElectionStatistics, ReadError> {
        self.read_through(
            "statistics",
            keys::ELECTION_STATS,
            self.gateway.election_statistics(),
            CachedRead::Statistics,
            |c| match c {
                CachedRead::Statistics(v) => Some(v),
                _ => None,
            },
        )
        .await
    }

    pub async fn phase(&self) -> Result<Phase, ReadError> {
        let info = self.election_info().await?;
        Ok(phase_of(info.as_ref(), self.now()))
    }

    /// Seconds until the current phase ends, when it has a time boundary.
    pub async fn time_remaining(&self) -> Result<Option<u64>, ReadError> {
        let info = self.election_info().await?;
        Ok(time_remaining(info.as_ref(), self.now()))
    }

    /// What `account` may attempt in the current phase.
    pub async fn permissions(&self, account: Address) -> Result<Permissions, ReadError> {
        let (info, voter, role) =
            tokio::try_join!(self.election_info(), self.voter(account), self.role(account))?;
        let phase = phase_of(info.as_ref(), self.now());
        Ok(Permissions::derive(&voter, &role, phase, info.as_ref()))
    }

    /// Uncached read of everything an audit needs. Voter reads run
    /// `batch_size` at a time.
    pub async fn snapshot(&self, voters: &[Address]) -> Result<ElectionSnapshot, ReadError> {
        let gw = &self.gateway;
        let (at_block, election, candidates, statistics, winner) = tokio::try_join!(
            async { gw.block_number().await.map_err(ReadError::ledger("block number")) },
            async { gw.election_info().await.map_err(ReadError::ledger("election info")) },
            async { gw.all_candidates().await.map_err(ReadError::ledger("candidates")) },
            async { gw.election_statistics().await.map_err(ReadError::ledger("statistics")) },
            async { gw.current_winner().await.map_err(ReadError::ledger("winner")) },
        )?;

        let mut fetched = Vec::with_capacity(voters.len());
        for (n, batch) in voters.chunks(self.config.batch_size.max(1)).enumerate() {
            debug!(batch = n, size = batch.len(), "reading voters");
            let read = try_join_all(batch.iter().map(|who| gw.voter_info(*who)))
                .await
                .map_err(ReadError::ledger("voter"))?;
            fetched.extend(read);
        }

        info!(at_block, voters = fetched.len(), "snapshot read");
        Ok(ElectionSnapshot {
            at_block,
            taken_at: unix_now(),
            election,
            candidates,
            statistics,
            winner,
            voters: fetched,
        })
    }

    pub async fn execute(
        &self,
        call: WriteCall,
        from: Address,
        options: TxOptions,
    ) -> Result<TxOutcome, TransactionError> {
        self.monitor.start();
        self.transactions.execute(call, from, options).await
    }

    pub async fn create_election(
        &self,
        from: Address,
        title: impl Into<String>,
        description: impl Into<String>,
        registration_deadline: Timestamp,
        start_time: Timestamp,
        end_time: Timestamp,
    ) -> Result<TxOutcome, TransactionError> {
        let call = WriteCall::CreateElection {
            title: title.into(),
            description: description.into(),
            registration_deadline,
            start_time,
            end_time,
        };
        self.execute(call, from, TxOptions::default()).await
    }

    pub async fn add_candidate(
        &self,
        from: Address,
        name: impl Into<String>,
        party: impl Into<String>,
        manifesto: impl Into<String>,
    ) -> Result<TxOutcome, TransactionError> {
        let call = WriteCall::AddCandidate {
            name: name.into(),
            party: party.into(),
            manifesto: manifesto.into(),
        };
        self.execute(call, from, TxOptions::default()).await
    }

    pub async fn register_voter(
        &self,
        from: Address,
        voter: Address,
    ) -> Result<TxOutcome, TransactionError> {
        self.execute(WriteCall::RegisterVoter { voter }, from, TxOptions::default())
            .await
    }

    pub async fn self_register(&self, from: Address) -> Result<TxOutcome, TransactionError> {
        self.execute(WriteCall::SelfRegister, from, TxOptions::default())
            .await
    }

    pub async fn vote(
        &self,
        from: Address,
        candidate_id: CandidateId,
    ) -> Result<TxOutcome, TransactionError> {
        self.execute(WriteCall::Vote { candidate_id }, from, TxOptions::default())
            .await
    }

    pub async fn start_voting(&self, from: Address) -> Result<TxOutcome, TransactionError> {
        self.execute(WriteCall::StartVoting, from, TxOptions::default())
            .await
    }

    pub async fn end_voting(&self, from: Address) -> Result<TxOutcome, TransactionError> {
        self.execute(WriteCall::EndVoting, from, TxOptions::default())
            .await
    }

    pub async fn finalize_election(&self, from: Address) -> Result<TxOutcome, TransactionError> {
        self.execute(WriteCall::FinalizeElection, from, TxOptions::default())
            .await
    }

    pub async fn assign_role(
        &self,
        from: Address,
        user: Address,
        role: Role,
    ) -> Result<TxOutcome, TransactionError> {
        self.execute(WriteCall::AssignRole { user, role }, from, TxOptions::default())
            .await
    }

    pub fn pending(&self) -> Vec<PendingTransaction> {
        self.transactions.pending()
    }

    pub fn history(&self) -> Vec<HistoryEntry> {
        self.transactions.history()
    }

    /// Receive ledger events of `kinds`. All subscribers share the client's
    /// one monitor. See [`EventMonitor::subscribe`].
    pub fn subscribe(&self, kinds: &[EventKind]) -> EventSubscription {
        self.monitor.subscribe(kinds)
    }

    /// Stop the monitor, end all subscriptions and drop cached reads.
    pub fn dispose(self) {
        self.monitor.shutdown();
        let cached = self.cache.len();
        self.cache.clear();
        info!(cached, pending = self.pending().len(), "election client disposed");
    }
}
