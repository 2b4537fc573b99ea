#![forbid(unsafe_code)]
#![deny(clippy::all)]

//! summa-ledger: a PostgreSQL-backed double-entry accounting ledger.
//!
//! Monetary movements are recorded as hash-chained, append-only events;
//! per-account balances are append-only version snapshots protected by
//! HMAC checksums; two-phase holds reserve available funds; background
//! workers deliver the outbox, seal block checkpoints, and re-prove the
//! ledger's invariants.

pub mod account;
pub mod chain;
pub mod config;
pub mod error;
pub mod http;
pub mod outbox;
pub mod ratelimit;
pub mod recon;
pub mod schema;
pub mod state;
pub mod store;
pub mod transaction;
pub mod util;
pub mod worker;

pub use config::LedgerConfig;
pub use error::{ErrorCode, LedgerError};
pub use http::Dispatcher;
pub use state::{new_ledger_core, start_workers, LedgerCore};
