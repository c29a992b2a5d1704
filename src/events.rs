// src/events.rs
//
// Ledger event monitoring. One monitor task per client owns the gateway
// subscription. For every event it invalidates the cache namespaces the event
// touches, settles outstanding writes the event acknowledges and publishes an
// `EventRecord` to every subscriber.
//
// A dropped connection is re-established with exponential backoff, and the
// whole cache is invalidated once it is back since events in the gap are
// lost. A gateway without an event channel is polled instead and events are
// synthesized from the difference between successive reads. Next to the
// monitor a receipt sweep settles writes nobody is waiting on.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::{Instant, MissedTickBehavior, interval, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::Invalidate;
use crate::calls::Namespace;
use crate::config::ClientConfig;
use crate::errors::TransactionError;
use crate::gateway::{EventKind, GatewayError, LedgerEvent, LedgerGateway};
use crate::pending::{TxStatus, TxTracker};
use crate::types::{Candidate, CandidateId, ElectionInfo, Timestamp, fmt_hash, unix_now};

const CHANNEL_CAPACITY: usize = 256;

/// Cache namespaces made stale by an event of `kind`.
pub fn namespaces_for(kind: EventKind) -> &'static [Namespace] {
    match kind {
        EventKind::VoteCast => &[Namespace::Election, Namespace::Candidate, Namespace::Voter],
        EventKind::VoterRegistered => &[Namespace::Voter, Namespace::Election],
        EventKind::CandidateAdded => &[Namespace::Candidate, Namespace::Election],
        EventKind::ElectionStarted | EventKind::ElectionEnded => &[Namespace::Election],
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventSource {
    Subscription,
    /// Synthesized by the polling fallback.
    Polling,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub kind: EventKind,
    pub event: LedgerEvent,
    pub block_timestamp: Option<Timestamp>,
    /// Local unix time the event was handled.
    pub received_at: Timestamp,
    pub source: EventSource,
}

struct Shared {
    gateway: Arc<dyn LedgerGateway>,
    cache: Arc<dyn Invalidate>,
    tracker: Arc<TxTracker>,
    config: ClientConfig,
    records: broadcast::Sender<EventRecord>,
}

pub struct EventMonitor {
    shared: Arc<Shared>,
    shutdown: CancellationToken,
    started: AtomicBool,
}

impl EventMonitor {
    pub fn new(
        gateway: Arc<dyn LedgerGateway>,
        cache: Arc<dyn Invalidate>,
        tracker: Arc<TxTracker>,
        config: ClientConfig,
    ) -> Self {
        let (records, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                gateway,
                cache,
                tracker,
                config,
                records,
            }),
            shutdown: CancellationToken::new(),
            started: AtomicBool::new(false),
        }
    }

    /// Spawn the monitor and receipt sweep tasks. Later calls, and calls
    /// after [`EventMonitor::shutdown`], do nothing.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        if self.shutdown.is_cancelled() || self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let monitor = MonitorTask {
            shared: self.shared.clone(),
            token: self.shutdown.clone(),
        };
        tokio::spawn(monitor.run());
        tokio::spawn(sweep_receipts(self.shared.clone(), self.shutdown.clone()));
        info!("event monitor started");
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::Acquire) && !self.shutdown.is_cancelled()
    }

    /// Receive events of `kinds`, starting the monitor if needed. Cache
    /// invalidation and reconciliation run for every event whether or not
    /// anyone subscribes.
    pub fn subscribe(&self, kinds: &[EventKind]) -> EventSubscription {
        self.start();
        EventSubscription {
            rx: self.shared.records.subscribe(),
            kinds: kinds.to_vec(),
            token: self.shutdown.clone(),
        }
    }

    /// Stop the monitor. Every subscription ends.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

/// One subscriber's view of the monitor. Dropping it unsubscribes.
pub struct EventSubscription {
    rx: broadcast::Receiver<EventRecord>,
    kinds: Vec<EventKind>,
    token: CancellationToken,
}

impl EventSubscription {
    /// Next event of a requested kind; `None` once the monitor is shut down.
    pub async fn next(&mut self) -> Option<EventRecord> {
        loop {
            let received = tokio::select! {
                biased;
                _ = self.token.cancelled() => return None,
                r = self.rx.recv() => r,
            };
            match received {
                Ok(record) if self.kinds.contains(&record.kind) => return Some(record),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event subscriber lagged"),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = EventRecord> {
        futures::stream::unfold(self, |mut sub| async move {
            sub.next().await.map(|record| (record, sub))
        })
    }
}

struct MonitorTask {
    shared: Arc<Shared>,
    token: CancellationToken,
}

impl MonitorTask {
    fn resubscribe_delay(&self, failures: u32) -> Duration {
        let cfg = &self.shared.config;
        cfg.resubscribe_delay
            .saturating_mul(2u32.saturating_pow(failures))
            .min(cfg.max_resubscribe_delay)
    }

    async fn run(self) {
        let mut failures: u32 = 0;
        let mut interrupted = false;
        loop {
            let subscribed = tokio::select! {
                _ = self.token.cancelled() => return,
                r = self.shared.gateway.subscribe_events() => r,
            };

            match subscribed {
                Ok(mut stream) => {
                    info!("event subscription established");
                    if interrupted {
                        // Events emitted while disconnected are gone.
                        let removed = self.shared.cache.invalidate_all();
                        info!(invalidated = removed, "cache invalidated after resubscribe");
                    }
                    failures = 0;
                    loop {
                        let item = tokio::select! {
                            _ = self.token.cancelled() => return,
                            item = stream.next() => item,
                        };
                        match item {
                            Some(Ok(event)) => self.dispatch(event, EventSource::Subscription),
                            Some(Err(e)) => {
                                warn!(error = %e, "event stream failed");
                                break;
                            }
                            None => {
                                warn!("event stream closed");
                                break;
                            }
                        }
                    }
                }
                Err(GatewayError::Unsupported(reason)) => {
                    info!(%reason, "no event channel; falling back to polling");
                    self.poll().await;
                    return;
                }
                Err(e) => warn!(error = %e, failures, "event subscription failed"),
            }

            interrupted = true;
            let delay = self.resubscribe_delay(failures);
            failures = failures.saturating_add(1);
            debug!(?delay, "resubscribing");
            tokio::select! {
                _ = self.token.cancelled() => return,
                _ = sleep(delay) => {}
            }
        }
    }

    /// Apply side effects and publish to subscribers.
    fn dispatch(&self, event: LedgerEvent, source: EventSource) {
        let kind = event.kind();
        let removed = self.shared.cache.invalidate_namespaces(namespaces_for(kind));
        let reconciled = self.shared.tracker.reconcile(&event);
        debug!(
            kind = kind.as_str(),
            ?source,
            invalidated = removed,
            reconciled = reconciled.len(),
            "ledger event"
        );

        let record = EventRecord {
            kind,
            block_timestamp: event.block_timestamp(),
            event,
            received_at: unix_now(),
            source,
        };
        // No subscribers is fine.
        let _ = self.shared.records.send(record);
    }

    async fn poll(&self) {
        let mut ticker = interval(self.shared.config.event_polling_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut previous: Option<PollSnapshot> = None;

        loop {
            tokio::select! {
                _ = self.token.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let current = match self.read_snapshot().await {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "event poll failed");
                    continue;
                }
            };

            if let Some(prev) = &previous {
                for event in synthesize(prev, &current, unix_now()) {
                    self.dispatch(event, EventSource::Polling);
                }
            } else {
                debug!("event poll baseline recorded");
            }
            previous = Some(current);
        }
    }

    async fn read_snapshot(&self) -> Result<PollSnapshot, GatewayError> {
        let gateway = &self.shared.gateway;
        let (info, candidates) =
            futures::try_join!(gateway.election_info(), gateway.all_candidates())?;
        Ok(PollSnapshot {
            info,
            candidates: candidates.into_iter().map(|c| (c.id, c)).collect(),
        })
    }
}

/// Settle writes nobody is waiting on by polling their receipts: confirmed
/// ones invalidate what they changed, reverted ones fail, and entries still
/// without a receipt `pending_max_age` after the sweep first saw them are
/// dropped from the pending set.
async fn sweep_receipts(shared: Arc<Shared>, token: CancellationToken) {
    let cfg = &shared.config;
    let mut ticker = interval(cfg.receipt_sweep_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut first_seen: HashMap<Uuid, Instant> = HashMap::new();

    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let unattended = shared.tracker.unattended();
        first_seen.retain(|id, _| unattended.iter().any(|p| p.id == *id));
        if unattended.is_empty() {
            continue;
        }
        let head = shared.gateway.block_number().await.ok();

        for tx in unattended {
            let seen = *first_seen.entry(tx.id).or_insert_with(Instant::now);
            let Some(hash) = tx.hash else {
                continue;
            };

            match shared.gateway.transaction_receipt(hash).await {
                Ok(Some(receipt)) if !receipt.success => {
                    let reason = receipt.revert_reason.unwrap_or_default();
                    let err = TransactionError::revert(reason, cfg.revert_message_max_len);
                    warn!(tx_id = %tx.id, hash = %fmt_hash(&hash), error = %err, "unattended transaction reverted");
                    shared.tracker.finish(
                        tx.id,
                        TxStatus::Failed,
                        Some(receipt.block_number),
                        Some(receipt.gas_used),
                        Some(err.to_string()),
                    );
                    continue;
                }
                Ok(Some(receipt)) => {
                    let head = head.unwrap_or(receipt.block_number);
                    let depth = head.saturating_sub(receipt.block_number) + 1;
                    if depth >= cfg.confirmations {
                        let removed = shared.cache.invalidate_namespaces(tx.call.invalidates());
                        shared.tracker.finish(
                            tx.id,
                            TxStatus::Confirmed,
                            Some(receipt.block_number),
                            Some(receipt.gas_used),
                            None,
                        );
                        info!(
                            tx_id = %tx.id,
                            method = %tx.method,
                            block = receipt.block_number,
                            invalidated = removed,
                            "transaction confirmed by receipt"
                        );
                        continue;
                    }
                }
                Ok(None) => {}
                Err(e) => debug!(tx_id = %tx.id, error = %e, "receipt poll failed"),
            }

            if seen.elapsed() >= cfg.pending_max_age {
                warn!(
                    tx_id = %tx.id,
                    hash = %fmt_hash(&hash),
                    "no receipt; dropping transaction from pending"
                );
                shared.tracker.finish(
                    tx.id,
                    TxStatus::TimedOut,
                    None,
                    None,
                    Some(format!("no receipt after {:?}", cfg.pending_max_age)),
                );
            }
        }
    }
}

/// What the polling fallback compares between ticks.
#[derive(Clone, Debug, Default)]
struct PollSnapshot {
    info: Option<ElectionInfo>,
    candidates: BTreeMap<CandidateId, Candidate>,
}

/// Events implied by the change from `prev` to `next`, in the order the
/// ledger would have emitted them. Attribution the reads cannot provide is
/// left as `None`.
fn synthesize(prev: &PollSnapshot, next: &PollSnapshot, now: Timestamp) -> Vec<LedgerEvent> {
    let mut out = Vec::new();

    let was_active = prev.info.as_ref().is_some_and(|i| i.is_active);
    let is_active = next.info.as_ref().is_some_and(|i| i.is_active);
    if !was_active && is_active {
        out.push(LedgerEvent::ElectionStarted { timestamp: now });
    }

    for (id, c) in &next.candidates {
        if !prev.candidates.contains_key(id) {
            out.push(LedgerEvent::CandidateAdded {
                candidate_id: *id,
                name: c.name.clone(),
                party: c.party.clone(),
                added_by: None,
            });
        }
    }

    let voters_before = prev.info.as_ref().map_or(0, |i| i.total_voters);
    let voters_after = next.info.as_ref().map_or(0, |i| i.total_voters);
    for _ in voters_before..voters_after {
        out.push(LedgerEvent::VoterRegistered {
            voter: None,
            voter_id: None,
            timestamp: now,
        });
    }

    for (id, c) in &next.candidates {
        let before = prev.candidates.get(id).map_or(0, |p| p.vote_count);
        for _ in before..c.vote_count {
            out.push(LedgerEvent::VoteCast {
                voter: None,
                candidate_id: *id,
                timestamp: now,
                record_id: None,
            });
        }
    }

    if was_active && !is_active {
        out.push(LedgerEvent::ElectionEnded { timestamp: now });
    }
    out
}
