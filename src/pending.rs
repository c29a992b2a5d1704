// src/pending.rs
//
// Local bookkeeping of in-flight writes. The transaction manager records
// submissions; the event monitor settles entries nobody is waiting on, from
// ledger events or from receipts. None of this is authoritative.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::calls::WriteCall;
use crate::gateway::LedgerEvent;
use crate::types::{Address, Timestamp, TxHash, fmt_hash, unix_now};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxStatus {
    Submitted,
    Mined,
    Confirmed,
    Failed,
    TimedOut,
}

impl TxStatus {
    /// Allowed edges: Submitted → Mined → Confirmed, any non-terminal state
    /// → Failed/TimedOut, and TimedOut → Confirmed when the write lands late.
    pub fn can_transition_to(self, next: TxStatus) -> bool {
        use TxStatus::*;
        matches!(
            (self, next),
            (Submitted, Mined)
                | (Submitted, Confirmed)
                | (Submitted, Failed)
                | (Submitted, TimedOut)
                | (Mined, Confirmed)
                | (Mined, Failed)
                | (Mined, TimedOut)
                | (TimedOut, Confirmed)
                | (TimedOut, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TxStatus::Confirmed | TxStatus::Failed)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingTransaction {
    pub id: Uuid,
    pub method: String,
    pub call: WriteCall,
    pub from: Address,
    pub status: TxStatus,
    pub hash: Option<TxHash>,
    pub nonce: Option<u64>,
    pub retry_count: u32,
    pub submitted_at: Timestamp,
    /// No caller is polling for the receipt (sent without waiting).
    pub detached: bool,
}

/// Completed (or abandoned) transaction kept for display.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: Uuid,
    pub method: String,
    pub from: Address,
    pub status: TxStatus,
    pub hash: Option<TxHash>,
    pub block_number: Option<u64>,
    pub gas_used: Option<u64>,
    pub error: Option<String>,
    pub finished_at: Timestamp,
}

pub struct TxTracker {
    pending: Mutex<HashMap<Uuid, PendingTransaction>>,
    history: Mutex<VecDeque<HistoryEntry>>,
    history_limit: usize,
}

impl TxTracker {
    pub fn new(history_limit: usize) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            history: Mutex::new(VecDeque::with_capacity(history_limit)),
            history_limit,
        }
    }

    /// Record a broadcast. Re-submissions of the same id overwrite hash and
    /// nonce and bump the retry count.
    pub fn record_submission(
        &self,
        id: Uuid,
        call: &WriteCall,
        from: Address,
        hash: TxHash,
        nonce: u64,
        retry_count: u32,
    ) {
        let mut pending = self.pending.lock();
        let entry = pending.entry(id).or_insert_with(|| PendingTransaction {
            id,
            method: call.method().to_string(),
            call: call.clone(),
            from,
            status: TxStatus::Submitted,
            hash: None,
            nonce: None,
            retry_count: 0,
            submitted_at: unix_now(),
            detached: false,
        });
        entry.hash = Some(hash);
        entry.nonce = Some(nonce);
        entry.retry_count = retry_count;
        entry.status = TxStatus::Submitted;
    }

    /// Move `id` to `next`. Returns false (and changes nothing) for unknown
    /// ids and for edges the lifecycle does not allow.
    pub fn transition(&self, id: Uuid, next: TxStatus) -> bool {
        let mut pending = self.pending.lock();
        let Some(entry) = pending.get_mut(&id) else {
            return false;
        };
        if entry.status == next {
            return true;
        }
        if !entry.status.can_transition_to(next) {
            warn!(
                tx_id = %id,
                from = ?entry.status,
                to = ?next,
                "ignoring invalid transaction status transition"
            );
            return false;
        }
        entry.status = next;
        true
    }

    /// Hand `id` over to the monitor's receipt sweep.
    pub fn detach(&self, id: Uuid) {
        if let Some(entry) = self.pending.lock().get_mut(&id) {
            entry.detached = true;
        }
    }

    pub fn get(&self, id: Uuid) -> Option<PendingTransaction> {
        self.pending.lock().get(&id).cloned()
    }

    /// Entries not yet in a terminal state, oldest first.
    pub fn outstanding(&self) -> Vec<PendingTransaction> {
        let mut out: Vec<_> = self
            .pending
            .lock()
            .values()
            .filter(|p| !p.status.is_terminal())
            .cloned()
            .collect();
        out.sort_by_key(|p| p.submitted_at);
        out
    }

    /// Outstanding entries that only the monitor will settle: detached ones
    /// and those whose confirmation wait timed out.
    pub fn unattended(&self) -> Vec<PendingTransaction> {
        self.outstanding()
            .into_iter()
            .filter(|p| p.detached || p.status == TxStatus::TimedOut)
            .collect()
    }

    /// Remove `id` from the pending set and append it to the history.
    pub fn finish(
        &self,
        id: Uuid,
        status: TxStatus,
        block_number: Option<u64>,
        gas_used: Option<u64>,
        error: Option<String>,
    ) {
        let removed = self.pending.lock().remove(&id);
        let Some(tx) = removed else {
            return;
        };
        self.push_history(HistoryEntry {
            id,
            method: tx.method,
            from: tx.from,
            status,
            hash: tx.hash,
            block_number,
            gas_used,
            error,
            finished_at: unix_now(),
        });
    }

    /// Append to the bounded history, dropping the oldest entry when full.
    /// A limit of zero keeps no history.
    pub fn push_history(&self, entry: HistoryEntry) {
        if self.history_limit == 0 {
            return;
        }
        let mut history = self.history.lock();
        while history.len() >= self.history_limit {
            history.pop_front();
        }
        history.push_back(entry);
    }

    /// History, most recent last.
    pub fn history(&self) -> Vec<HistoryEntry> {
        self.history.lock().iter().cloned().collect()
    }

    /// Confirm unattended entries that `event` acknowledges. Entries a caller
    /// is still confirming are left to it. Returns the ids that were
    /// reconciled.
    pub fn reconcile(&self, event: &LedgerEvent) -> Vec<Uuid> {
        let matched: Vec<Uuid> = self
            .pending
            .lock()
            .values()
            .filter(|p| {
                !p.status.is_terminal()
                    && (p.detached || p.status == TxStatus::TimedOut)
                    && p.call.produced(&p.from, event)
            })
            .map(|p| p.id)
            .collect();

        for id in &matched {
            if let Some(tx) = self.get(*id) {
                info!(
                    tx_id = %id,
                    method = %tx.method,
                    hash = %tx.hash.as_ref().map(fmt_hash).unwrap_or_default(),
                    previous = ?tx.status,
                    "transaction confirmed by ledger event"
                );
            }
            self.finish(*id, TxStatus::Confirmed, None, None, None);
        }
        matched
    }
}
