// src/tx_manager.rs
//
// execute(call, from)
//   ├─ validate locally          ── ValidationError, ledger never contacted
//   ├─ estimate gas × buffer     ── revert here is terminal
//   ├─ gas price, capped
//   ├─ nonce (per-account lock)
//   ├─ send
//   ├─ poll receipt until confirmed or timeout
//   └─ invalidate cache namespaces, append history
//
// Transient failures are retried with exponential backoff. User rejection,
// insufficient funds and reverts are not. A send whose outcome is unknown is
// retried with the same nonce, so at most one copy can land. Once a
// transaction is broadcast it is never re-sent after a confirmation timeout;
// the entry stays `TimedOut` until the event monitor settles it.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::{Instant, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use crate::cache::Invalidate;
use crate::calls::WriteCall;
use crate::config::ClientConfig;
use crate::errors::TransactionError;
use crate::gateway::{GatewayError, LedgerGateway, TxReceipt, TxRequest};
use crate::pending::{HistoryEntry, PendingTransaction, TxStatus, TxTracker};
use crate::types::{Address, GasPrice, TxHash, fmt_address, fmt_hash, unix_now};

/// Per-call overrides.
#[derive(Clone, Debug)]
pub struct TxOptions {
    /// Skip estimation and use this gas limit.
    pub gas_limit: Option<u64>,
    /// Preferred gas price; still capped at `max_gas_price`.
    pub gas_price: Option<GasPrice>,
    /// Return right after broadcast instead of waiting for the receipt.
    pub wait_for_confirmation: bool,
    /// Cancelling stops further retries. It cannot recall a broadcast write.
    pub cancel: Option<CancellationToken>,
}

impl Default for TxOptions {
    fn default() -> Self {
        Self {
            gas_limit: None,
            gas_price: None,
            wait_for_confirmation: true,
            cancel: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutcome {
    pub id: Uuid,
    pub success: bool,
    pub tx_hash: TxHash,
    /// `None` when the caller did not wait for confirmation.
    pub block_number: Option<u64>,
    pub gas_used: Option<u64>,
}

struct NonceSlot {
    next: u64,
    fetched_at: Instant,
}

/// Hands out nonces per account. Acquisition for one account is serialized
/// by an async mutex so concurrent sends never share a nonce.
struct NonceManager {
    slots: Mutex<HashMap<Address, Arc<tokio::sync::Mutex<Option<NonceSlot>>>>>,
    ttl: std::time::Duration,
}

impl NonceManager {
    fn new(ttl: std::time::Duration) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    fn slot(&self, who: Address) -> Arc<tokio::sync::Mutex<Option<NonceSlot>>> {
        self.slots.lock().entry(who).or_default().clone()
    }

    async fn acquire(&self, gateway: &dyn LedgerGateway, who: Address) -> Result<u64, GatewayError> {
        let slot = self.slot(who);
        let mut guard = slot.lock().await;

        let now = Instant::now();
        let nonce = match guard.as_ref() {
            Some(s) if now.duration_since(s.fetched_at) <= self.ttl => s.next,
            _ => {
                let fetched = gateway.transaction_count(who).await?;
                debug!(account = %fmt_address(&who), nonce = fetched, "fetched nonce");
                *guard = Some(NonceSlot {
                    next: fetched,
                    fetched_at: now,
                });
                fetched
            }
        };

        if let Some(s) = guard.as_mut() {
            s.next = nonce + 1;
        }
        Ok(nonce)
    }

    /// Forget the cached nonce so the next acquisition asks the ledger.
    async fn reset(&self, who: Address) {
        let slot = self.slot(who);
        *slot.lock().await = None;
    }
}

/// What one `execute` carries from attempt to attempt.
#[derive(Default)]
struct RetryState {
    attempt: u32,
    gas_fallback: bool,
    last_hash: Option<TxHash>,
    /// Nonce of a send that failed without saying whether it was broadcast.
    pinned_nonce: Option<u64>,
}

pub struct TransactionManager {
    gateway: Arc<dyn LedgerGateway>,
    cache: Arc<dyn Invalidate>,
    tracker: Arc<TxTracker>,
    nonces: NonceManager,
    config: ClientConfig,
}

impl TransactionManager {
    pub fn new(
        gateway: Arc<dyn LedgerGateway>,
        cache: Arc<dyn Invalidate>,
        tracker: Arc<TxTracker>,
        config: ClientConfig,
    ) -> Self {
        Self {
            gateway,
            cache,
            tracker,
            nonces: NonceManager::new(config.nonce_cache_ttl),
            config,
        }
    }

    pub fn tracker(&self) -> &Arc<TxTracker> {
        &self.tracker
    }

    pub fn pending(&self) -> Vec<PendingTransaction> {
        self.tracker.outstanding()
    }

    pub fn history(&self) -> Vec<HistoryEntry> {
        self.tracker.history()
    }

    /// Submit `call` from `from` and, unless told otherwise, wait for it to
    /// be confirmed.
    pub async fn execute(
        &self,
        call: WriteCall,
        from: Address,
        options: TxOptions,
    ) -> Result<TxOutcome, TransactionError> {
        let id = Uuid::new_v4();
        let span = info_span!("tx", tx_id = %id, method = call.method());
        self.run(id, call, from, options).instrument(span).await
    }

    async fn run(
        &self,
        id: Uuid,
        call: WriteCall,
        from: Address,
        options: TxOptions,
    ) -> Result<TxOutcome, TransactionError> {
        if let Err(e) = call.validate() {
            warn!(error = %e, "rejected before submission");
            return Err(e);
        }

        let mut state = RetryState::default();

        loop {
            let attempt = state.attempt;
            let err = match self.attempt(id, &call, from, &options, &mut state).await {
                Ok(outcome) => return Ok(self.succeed(id, &call, outcome)),
                Err(err) => err,
            };

            if err.is_terminal() {
                warn!(attempt, error = %err, "transaction failed");
                self.record_failure(id, &call, from, &err);
                return Err(err);
            }

            match &err {
                TransactionError::GasEstimationFailed(reason)
                    if !state.gas_fallback && self.config.default_gas_limit > 0 =>
                {
                    warn!(
                        %reason,
                        gas_limit = self.config.default_gas_limit,
                        "gas estimation failed; retrying with default gas limit"
                    );
                    state.gas_fallback = true;
                    continue;
                }
                TransactionError::NonceConflict(_) => self.nonces.reset(from).await,
                _ => {}
            }

            let cancelled = options.cancel.as_ref().is_some_and(|c| c.is_cancelled());
            if attempt >= self.config.max_retries || cancelled {
                let err = match err {
                    TransactionError::NetworkTimeout => {
                        TransactionError::TransactionTimeout {
                            hash: state.last_hash,
                        }
                    }
                    other => other,
                };
                warn!(attempt, cancelled, error = %err, "giving up on transaction");
                self.record_failure(id, &call, from, &err);
                return Err(err);
            }

            let delay = self.config.backoff(attempt);
            warn!(attempt, ?delay, error = %err, "transient failure; retrying");
            if let Some(token) = &options.cancel {
                tokio::select! {
                    _ = token.cancelled() => {
                        info!("retry cancelled");
                        self.record_failure(id, &call, from, &err);
                        return Err(err);
                    }
                    _ = sleep(delay) => {}
                }
            } else {
                sleep(delay).await;
            }
            state.attempt += 1;
        }
    }

    async fn attempt(
        &self,
        id: Uuid,
        call: &WriteCall,
        from: Address,
        options: &TxOptions,
        state: &mut RetryState,
    ) -> Result<TxOutcome, TransactionError> {
        let attempt = state.attempt;
        let max_len = self.config.revert_message_max_len;
        let classify = |e: GatewayError| TransactionError::from_gateway(e, max_len);

        let gas_limit = match options.gas_limit {
            Some(limit) => limit,
            None if state.gas_fallback => self.config.default_gas_limit,
            None => match self.gateway.estimate_gas(from, call).await {
                Ok(estimate) => self.config.buffered_gas(estimate),
                Err(GatewayError::Revert(reason)) => {
                    return Err(TransactionError::revert(reason, max_len));
                }
                Err(e @ (GatewayError::UserRejected | GatewayError::InsufficientFunds)) => {
                    return Err(classify(e));
                }
                Err(e) => return Err(TransactionError::GasEstimationFailed(e.to_string())),
            },
        };

        let current = self.gateway.gas_price().await.map_err(classify)?;
        let gas_price = options
            .gas_price
            .unwrap_or(current)
            .min(self.config.max_gas_price);

        let nonce = match state.pinned_nonce {
            Some(nonce) => nonce,
            None => self
                .nonces
                .acquire(self.gateway.as_ref(), from)
                .await
                .map_err(classify)?,
        };

        let request = TxRequest {
            from,
            call: call.clone(),
            gas_limit,
            gas_price,
            nonce,
        };
        let hash = match self.gateway.send_transaction(&request).await {
            Ok(hash) => hash,
            Err(e @ (GatewayError::Timeout | GatewayError::Transport(_))) => {
                // May have been broadcast; re-send under the same nonce.
                state.pinned_nonce = Some(nonce);
                return Err(classify(e));
            }
            Err(GatewayError::NonceConflict(msg)) if state.pinned_nonce.is_some() => {
                // The earlier send of this write took the nonce.
                warn!(nonce, %msg, "earlier broadcast consumed the nonce; outcome unknown");
                self.nonces.reset(from).await;
                self.cache.invalidate_namespaces(call.invalidates());
                return Err(TransactionError::TransactionTimeout { hash: None });
            }
            Err(e) => {
                self.nonces.reset(from).await;
                return Err(classify(e));
            }
        };

        state.pinned_nonce = None;
        state.last_hash = Some(hash);
        self.tracker
            .record_submission(id, call, from, hash, nonce, attempt);
        info!(
            attempt,
            nonce,
            gas_limit,
            gas_price,
            hash = %fmt_hash(&hash),
            "transaction submitted"
        );

        if !options.wait_for_confirmation {
            self.tracker.detach(id);
            return Ok(TxOutcome {
                id,
                success: true,
                tx_hash: hash,
                block_number: None,
                gas_used: None,
            });
        }

        let receipt = match timeout(self.config.confirmation_timeout, self.confirm(id, hash)).await
        {
            Ok(receipt) => receipt,
            Err(_) => {
                warn!(
                    hash = %fmt_hash(&hash),
                    timeout = ?self.config.confirmation_timeout,
                    "confirmation wait timed out; transaction may still land"
                );
                self.tracker.transition(id, TxStatus::TimedOut);
                return Err(TransactionError::TransactionTimeout { hash: Some(hash) });
            }
        };

        if !receipt.success {
            return Err(TransactionError::revert(
                receipt.revert_reason.unwrap_or_default(),
                max_len,
            ));
        }

        Ok(TxOutcome {
            id,
            success: true,
            tx_hash: hash,
            block_number: Some(receipt.block_number),
            gas_used: Some(receipt.gas_used),
        })
    }

    /// Poll until the receipt is `confirmations` blocks deep or reverted.
    /// Polling errors are logged and polling continues; the caller bounds
    /// the wait.
    async fn confirm(&self, id: Uuid, hash: TxHash) -> TxReceipt {
        let poll = self.config.confirmation_poll_interval;
        loop {
            match self.gateway.transaction_receipt(hash).await {
                Ok(Some(receipt)) if !receipt.success => return receipt,
                Ok(Some(receipt)) => {
                    self.tracker.transition(id, TxStatus::Mined);
                    let head = match self.gateway.block_number().await {
                        Ok(head) => head,
                        Err(e) => {
                            debug!(error = %e, "block number unavailable; using receipt block");
                            receipt.block_number
                        }
                    };
                    let depth = head.saturating_sub(receipt.block_number) + 1;
                    if depth >= self.config.confirmations {
                        return receipt;
                    }
                    debug!(depth, needed = self.config.confirmations, "waiting for confirmations");
                }
                Ok(None) => {}
                Err(e) => debug!(error = %e, "receipt poll failed"),
            }
            sleep(poll).await;
        }
    }

    fn succeed(&self, id: Uuid, call: &WriteCall, outcome: TxOutcome) -> TxOutcome {
        if outcome.block_number.is_some() {
            let removed = self.cache.invalidate_namespaces(call.invalidates());
            self.tracker.finish(
                id,
                TxStatus::Confirmed,
                outcome.block_number,
                outcome.gas_used,
                None,
            );
            info!(
                hash = %fmt_hash(&outcome.tx_hash),
                block = outcome.block_number,
                gas_used = outcome.gas_used,
                invalidated = removed,
                "transaction confirmed"
            );
        }
        outcome
    }

    fn record_failure(&self, id: Uuid, call: &WriteCall, from: Address, err: &TransactionError) {
        match err {
            // Not a failure yet; left for reconciliation.
            TransactionError::TransactionTimeout { hash: Some(_) } => {}
            // Never reached the ledger.
            TransactionError::Validation(_) => {}
            _ if self.tracker.get(id).is_some() => {
                self.tracker
                    .finish(id, TxStatus::Failed, None, None, Some(err.to_string()));
            }
            _ => self.tracker.push_history(HistoryEntry {
                id,
                method: call.method().to_string(),
                from,
                status: TxStatus::Failed,
                hash: None,
                block_number: None,
                gas_used: None,
                error: Some(err.to_string()),
                finished_at: unix_now(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{ReadCache, keys};
    use crate::errors::ErrorKind;
    use crate::mock_ledger::{MockLedger, MockOp};
    use crate::types::Role;
    use std::time::Duration;

    const OWNER: Address = [0xC0; 20];
    const ALICE: Address = [0xA1; 20];

    struct Harness {
        ledger: Arc<MockLedger>,
        cache: Arc<ReadCache<u32>>,
        manager: TransactionManager,
    }

    fn harness(config: ClientConfig) -> Harness {
        let ledger = Arc::new(MockLedger::new(OWNER));
        let cache = Arc::new(ReadCache::new(config.cache_ttl));
        let manager = TransactionManager::new(
            ledger.clone(),
            cache.clone(),
            Arc::new(TxTracker::new(config.history_limit)),
            config,
        );
        Harness {
            ledger,
            cache,
            manager,
        }
    }

    /// Election created, one candidate, ALICE registered, voting open.
    async fn voting_open(h: &Harness) {
        let now = h.ledger.now();
        let steps = [
            WriteCall::CreateElection {
                title: "Board".into(),
                description: String::new(),
                registration_deadline: now + 100,
                start_time: now + 200,
                end_time: now + 300,
            },
            WriteCall::AddCandidate {
                name: "Ada".into(),
                party: "Blue".into(),
                manifesto: "Open books".into(),
            },
        ];
        for call in steps {
            h.manager
                .execute(call, OWNER, TxOptions::default())
                .await
                .unwrap();
        }
        h.manager
            .execute(WriteCall::SelfRegister, ALICE, TxOptions::default())
            .await
            .unwrap();
        h.ledger.advance_time(200);
        h.manager
            .execute(WriteCall::StartVoting, OWNER, TxOptions::default())
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn vote_invalidates_related_namespaces() {
        let h = harness(ClientConfig::default());
        voting_open(&h).await;

        h.cache.set(keys::ELECTION_INFO, 1);
        h.cache.set(keys::CANDIDATES, 2);
        h.cache.set(keys::voter(&ALICE), 3);
        h.cache.set(keys::role(&ALICE), 4);

        let out = h
            .manager
            .execute(WriteCall::Vote { candidate_id: 1 }, ALICE, TxOptions::default())
            .await
            .unwrap();
        assert!(out.success);
        assert!(out.block_number.is_some());

        assert_eq!(h.cache.get(keys::ELECTION_INFO), None);
        assert_eq!(h.cache.get(keys::CANDIDATES), None);
        assert_eq!(h.cache.get(&keys::voter(&ALICE)), None);
        assert_eq!(h.cache.get(&keys::role(&ALICE)), Some(4));

        let last = h.manager.history().pop().unwrap();
        assert_eq!(last.method, "vote");
        assert_eq!(last.status, TxStatus::Confirmed);
        assert!(h.manager.pending().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn already_voted_is_terminal_and_not_retried() {
        let h = harness(ClientConfig::default());
        voting_open(&h).await;
        h.manager
            .execute(WriteCall::Vote { candidate_id: 1 }, ALICE, TxOptions::default())
            .await
            .unwrap();

        let estimates = h.ledger.calls(MockOp::EstimateGas);
        let sends = h.ledger.calls(MockOp::Send);
        let err = h
            .manager
            .execute(WriteCall::Vote { candidate_id: 1 }, ALICE, TxOptions::default())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::LedgerRevert);
        assert_eq!(err.normalize().raw, "Already voted");
        assert_eq!(h.ledger.calls(MockOp::EstimateGas), estimates + 1);
        assert_eq!(h.ledger.calls(MockOp::Send), sends);
        assert_eq!(h.manager.history().pop().unwrap().status, TxStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_send_failures_are_retried_with_backoff() {
        let h = harness(ClientConfig::default());
        h.ledger
            .fail_next(MockOp::Send, GatewayError::Transport("connection reset".into()));
        h.ledger
            .fail_next(MockOp::Send, GatewayError::Transport("connection reset".into()));

        let started = Instant::now();
        let out = h
            .manager
            .execute(
                WriteCall::AssignRole {
                    user: ALICE,
                    role: Role::Admin,
                },
                OWNER,
                TxOptions::default(),
            )
            .await
            .unwrap();
        assert!(out.success);
        assert_eq!(h.ledger.calls(MockOp::Send), 3);
        // 1s + 2s of backoff.
        assert!(started.elapsed() >= Duration::from_secs(3));
        // Re-sent under the nonce of the first attempt.
        assert_eq!(h.ledger.sent()[0].nonce, 0);
        assert_eq!(h.ledger.calls(MockOp::TransactionCount), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn lost_send_reply_is_not_sent_twice() {
        let h = harness(ClientConfig::default());
        h.cache.set(keys::role(&ALICE), 1);
        h.ledger.lose_next_send_reply(GatewayError::Timeout);

        let err = h
            .manager
            .execute(
                WriteCall::AssignRole {
                    user: ALICE,
                    role: Role::Admin,
                },
                OWNER,
                TxOptions::default(),
            )
            .await
            .unwrap_err();

        assert_eq!(err, TransactionError::TransactionTimeout { hash: None });
        assert_eq!(h.ledger.calls(MockOp::Send), 2);
        assert_eq!(h.ledger.sent().len(), 1);
        assert_eq!(h.cache.get(&keys::role(&ALICE)), None);

        // The next write picks up after the landed one.
        h.manager
            .execute(
                WriteCall::AssignRole {
                    user: ALICE,
                    role: Role::Observer,
                },
                OWNER,
                TxOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(h.ledger.sent()[1].nonce, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unawaited_writes_are_handed_to_the_monitor() {
        let h = harness(ClientConfig::default());
        let out = h
            .manager
            .execute(
                WriteCall::AssignRole {
                    user: ALICE,
                    role: Role::Admin,
                },
                OWNER,
                TxOptions {
                    wait_for_confirmation: false,
                    ..TxOptions::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(out.block_number, None);
        let pending = h.manager.tracker().unattended();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].status, TxStatus::Submitted);
        assert!(pending[0].detached);
    }

    #[tokio::test(start_paused = true)]
    async fn user_rejection_and_missing_funds_fail_immediately() {
        for (injected, kind) in [
            (GatewayError::UserRejected, ErrorKind::UserRejected),
            (GatewayError::InsufficientFunds, ErrorKind::InsufficientFunds),
        ] {
            let h = harness(ClientConfig::default());
            h.ledger.fail_next(MockOp::Send, injected);
            let err = h
                .manager
                .execute(
                    WriteCall::AssignRole {
                        user: ALICE,
                        role: Role::Observer,
                    },
                    OWNER,
                    TxOptions::default(),
                )
                .await
                .unwrap_err();
            assert_eq!(err.kind(), kind);
            assert_eq!(h.ledger.calls(MockOp::Send), 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn nonce_conflict_refetches_nonce() {
        let h = harness(ClientConfig::default());
        h.ledger
            .fail_next(MockOp::Send, GatewayError::NonceConflict("nonce too low".into()));
        let out = h
            .manager
            .execute(
                WriteCall::AssignRole {
                    user: ALICE,
                    role: Role::Observer,
                },
                OWNER,
                TxOptions::default(),
            )
            .await;
        assert!(out.is_ok());
        assert_eq!(h.ledger.calls(MockOp::TransactionCount), 2);
        assert_eq!(h.ledger.sent()[0].nonce, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn gas_is_buffered_and_price_capped() {
        let config = ClientConfig {
            max_gas_price: 50,
            ..ClientConfig::default()
        };
        let h = harness(config);
        h.ledger.set_gas_estimate(100_000);
        h.ledger.set_gas_price(80);

        h.manager
            .execute(
                WriteCall::AssignRole {
                    user: ALICE,
                    role: Role::Voter,
                },
                OWNER,
                TxOptions::default(),
            )
            .await
            .unwrap();
        let tx = &h.ledger.sent()[0];
        assert_eq!(tx.gas_limit, 120_000);
        assert_eq!(tx.gas_price, 50);

        h.ledger.set_gas_price(30);
        h.manager
            .execute(
                WriteCall::AssignRole {
                    user: ALICE,
                    role: Role::Observer,
                },
                OWNER,
                TxOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(h.ledger.sent()[1].gas_price, 30);
        assert_eq!(h.ledger.sent()[1].nonce, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_estimation_falls_back_to_default_gas() {
        let h = harness(ClientConfig::default());
        h.ledger
            .fail_next(MockOp::EstimateGas, GatewayError::Transport("node busy".into()));
        h.manager
            .execute(
                WriteCall::AssignRole {
                    user: ALICE,
                    role: Role::Admin,
                },
                OWNER,
                TxOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(h.ledger.calls(MockOp::EstimateGas), 1);
        assert_eq!(h.ledger.sent()[0].gas_limit, 500_000);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_network_timeouts_surface_as_transaction_timeout() {
        let h = harness(ClientConfig::default());
        for _ in 0..4 {
            h.ledger.fail_next(MockOp::GasPrice, GatewayError::Timeout);
        }
        let err = h
            .manager
            .execute(
                WriteCall::AssignRole {
                    user: ALICE,
                    role: Role::Admin,
                },
                OWNER,
                TxOptions::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err, TransactionError::TransactionTimeout { hash: None });
        assert_eq!(h.ledger.calls(MockOp::GasPrice), 4);
        assert_eq!(h.ledger.calls(MockOp::Send), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn confirmation_timeout_marks_pending_entry() {
        let h = harness(ClientConfig::default());
        h.ledger.set_auto_mine(false);
        let err = h
            .manager
            .execute(
                WriteCall::AssignRole {
                    user: ALICE,
                    role: Role::Admin,
                },
                OWNER,
                TxOptions::default(),
            )
            .await
            .unwrap_err();

        let TransactionError::TransactionTimeout { hash: Some(hash) } = err else {
            panic!("expected timeout with hash, got {err:?}");
        };
        assert_eq!(h.ledger.calls(MockOp::Send), 1);
        let pending = h.manager.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].status, TxStatus::TimedOut);
        assert_eq!(pending[0].hash, Some(hash));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_sends_from_one_account_get_distinct_nonces() {
        let h = harness(ClientConfig::default());
        let a = h.manager.execute(
            WriteCall::AssignRole {
                user: ALICE,
                role: Role::Admin,
            },
            OWNER,
            TxOptions::default(),
        );
        let b = h.manager.execute(
            WriteCall::AssignRole {
                user: [0xB2; 20],
                role: Role::Observer,
            },
            OWNER,
            TxOptions::default(),
        );
        let (a, b) = tokio::join!(a, b);
        assert!(a.is_ok() && b.is_ok());

        let mut nonces: Vec<u64> = h.ledger.sent().iter().map(|t| t.nonce).collect();
        nonces.sort();
        assert_eq!(nonces, vec![0, 1]);
        assert_eq!(h.ledger.calls(MockOp::TransactionCount), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn validation_errors_never_reach_the_ledger() {
        let h = harness(ClientConfig::default());
        let err = h
            .manager
            .execute(WriteCall::Vote { candidate_id: 0 }, ALICE, TxOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationError);
        assert_eq!(h.ledger.calls(MockOp::EstimateGas), 0);
        assert!(h.manager.history().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_retries() {
        let h = harness(ClientConfig::default());
        for _ in 0..4 {
            h.ledger
                .fail_next(MockOp::Send, GatewayError::Transport("down".into()));
        }
        let token = CancellationToken::new();
        token.cancel();
        let err = h
            .manager
            .execute(
                WriteCall::StartVoting,
                OWNER,
                TxOptions {
                    gas_limit: Some(90_000),
                    cancel: Some(token),
                    ..TxOptions::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NetworkError);
        assert_eq!(h.ledger.calls(MockOp::Send), 1);
        assert_eq!(h.ledger.calls(MockOp::EstimateGas), 0);
    }
}
