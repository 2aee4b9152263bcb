//! B2 Message Relay - Library interface
//!
//! Re-exports internal modules for use by the binary and integration tests.

pub mod api;
pub mod builder;
pub mod clients;
pub mod config;
pub mod confirmation;
pub mod db;
pub mod eip712;
pub mod encoding;
pub mod feed;
pub mod hash;
pub mod ledger;
pub mod metrics;
pub mod p2p;
pub mod proposer;
pub mod redact;
pub mod types;
pub mod validator;
pub mod verification;
pub mod watchers;

#[cfg(test)]
mod testing;
