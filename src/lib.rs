// src/lib.rs
//
// Client-side state sync and transaction management for an on-ledger
// election. The ledger is the only authority: reads are cached, writes go
// through gas, nonce, retry and confirmation handling, the cache is kept
// coherent from ledger events, and snapshots can be audited for consistency.
// `ElectionClient` wires these together over one `LedgerGateway`.

pub mod cache;
pub mod calls;
pub mod client;
pub mod config;
pub mod decode;
pub mod errors;
pub mod events;
pub mod gateway;
pub mod integrity;
pub mod mock_ledger;
pub mod pending;
pub mod phase;
pub mod rpc;
pub mod tx_manager;
pub mod types;

pub use client::{ElectionClient, ReadError};
pub use config::ClientConfig;
pub use errors::{ErrorKind, NormalizedError, TransactionError};
pub use gateway::{GatewayError, LedgerGateway};
pub use phase::{Permissions, Phase};
