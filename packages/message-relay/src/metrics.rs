//! Prometheus metrics for the message relay
//!
//! Exposed on the /metrics endpoint for Prometheus scraping.

use lazy_static::lazy_static;
use prometheus::{register_counter_vec, register_gauge, register_gauge_vec, CounterVec, Gauge, GaugeVec};

lazy_static! {
    // Ingestion
    pub static ref MESSAGES_INGESTED: CounterVec = register_counter_vec!(
        "relay_messages_ingested_total",
        "Total number of messages inserted from chain events",
        &["chain"]
    ).unwrap();

    pub static ref LATEST_BLOCK: GaugeVec = register_gauge_vec!(
        "relay_latest_block",
        "Next block to scan per chain",
        &["chain"]
    ).unwrap();

    // Threshold signing
    pub static ref PROPOSALS_SENT: CounterVec = register_counter_vec!(
        "relay_proposals_sent_total",
        "Total number of proposal frames queued to validators",
        &["chain"]
    ).unwrap();

    pub static ref SIGNATURES: CounterVec = register_counter_vec!(
        "relay_signatures_total",
        "Validator signatures received, by outcome",
        &["chain", "outcome"]
    ).unwrap();

    pub static ref MESSAGES_PROMOTED: CounterVec = register_counter_vec!(
        "relay_messages_promoted_total",
        "Messages that reached the signature threshold",
        &["chain"]
    ).unwrap();

    pub static ref MESSAGES_INVALID: CounterVec = register_counter_vec!(
        "relay_messages_invalid_total",
        "Messages rejected by source-proof verification",
        &["chain"]
    ).unwrap();

    pub static ref VALIDATOR_SESSIONS: GaugeVec = register_gauge_vec!(
        "relay_validator_sessions",
        "Authenticated validator connections",
        &["chain"]
    ).unwrap();

    pub static ref PROPOSALS_REJECTED: CounterVec = register_counter_vec!(
        "relay_proposals_rejected_total",
        "Proposals a validator declined to sign, by reason",
        &["chain", "reason"]
    ).unwrap();

    // Builder
    pub static ref BUILDS: CounterVec = register_counter_vec!(
        "relay_builds_total",
        "Destination transactions built, by status",
        &["chain", "status"]
    ).unwrap();

    pub static ref BROADCASTS: CounterVec = register_counter_vec!(
        "relay_broadcasts_total",
        "Raw transaction broadcasts, by outcome",
        &["chain", "outcome"]
    ).unwrap();

    pub static ref MESSAGES_CONFIRMED: CounterVec = register_counter_vec!(
        "relay_messages_confirmed_total",
        "Call messages settled by their Send leg",
        &["chain"]
    ).unwrap();

    pub static ref TRANSACTIONS_FAILED: CounterVec = register_counter_vec!(
        "relay_transactions_failed_total",
        "Broadcast transactions whose receipt reported a revert",
        &["chain"]
    ).unwrap();

    // Error metrics
    pub static ref ERRORS: CounterVec = register_counter_vec!(
        "relay_errors_total",
        "Total number of errors",
        &["chain", "type"]
    ).unwrap();

    // Health metrics
    pub static ref UP: Gauge = register_gauge!(
        "relay_up",
        "Whether the relay is up and running"
    ).unwrap();
}

pub fn record_ingested(chain: &str, count: usize) {
    MESSAGES_INGESTED
        .with_label_values(&[chain])
        .inc_by(count as f64);
}

pub fn set_latest_block(chain: &str, block_number: i64) {
    LATEST_BLOCK
        .with_label_values(&[chain])
        .set(block_number as f64);
}

pub fn record_proposals(chain: &str, count: usize) {
    PROPOSALS_SENT
        .with_label_values(&[chain])
        .inc_by(count as f64);
}

/// `outcome` is one of `accepted`, `duplicate`, `rejected`
pub fn record_signature(chain: &str, outcome: &str) {
    SIGNATURES.with_label_values(&[chain, outcome]).inc();
}

pub fn record_promoted(chain: &str, count: u64) {
    MESSAGES_PROMOTED
        .with_label_values(&[chain])
        .inc_by(count as f64);
}

pub fn record_invalid(chain: &str) {
    MESSAGES_INVALID.with_label_values(&[chain]).inc();
}

pub fn set_validator_sessions(chain: &str, count: usize) {
    VALIDATOR_SESSIONS
        .with_label_values(&[chain])
        .set(count as f64);
}

/// `reason` is one of `proof`, `unverifiable`, `signing`
pub fn record_rejected_proposal(chain: &str, reason: &str) {
    PROPOSALS_REJECTED.with_label_values(&[chain, reason]).inc();
}

pub fn record_build(chain: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    BUILDS.with_label_values(&[chain, status]).inc();
}

pub fn record_broadcast(chain: &str, outcome: &str) {
    BROADCASTS.with_label_values(&[chain, outcome]).inc();
}

pub fn record_confirmed(chain: &str) {
    MESSAGES_CONFIRMED.with_label_values(&[chain]).inc();
}

pub fn record_failed_transaction(chain: &str) {
    TRANSACTIONS_FAILED.with_label_values(&[chain]).inc();
}

/// Record an error
pub fn record_error(chain: &str, error_type: &str) {
    ERRORS.with_label_values(&[chain, error_type]).inc();
}
