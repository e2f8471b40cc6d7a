//! Idempotent command execution over a dual in-memory/durable store, with a
//! hash-chained audit ledger recording every command outcome.

pub mod account;
pub mod audit;
pub mod auth;
pub mod change;
pub mod clock;
pub mod config;
pub mod critical;
pub mod envelope;
pub mod error;
pub mod executor;
pub mod idempotency;
pub mod identity;
pub mod lockout;
pub mod machine;
pub mod mirror;
pub mod store;
pub mod utils;
pub mod wager;

pub use envelope::{ResultCode, Response};
pub use executor::Substrate;
