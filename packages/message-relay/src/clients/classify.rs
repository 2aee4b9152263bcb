//! Node error classification
//!
//! JSON-RPC nodes report transaction rejection as free text. This is the only
//! place that text is interpreted; everything past the client boundary sees
//! [`ErrorClass`] or [`super::BroadcastOutcome`].

use super::BroadcastOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Temporary failure (RPC timeout, network issues)
    Transient,
    /// The node already holds this transaction
    AlreadyKnown,
    /// Nonce already used on chain
    NonceTooLow,
    /// Too cheap to enter the pool
    Underpriced,
    /// Permanent failure (revert, bad signature, no funds)
    Permanent,
    Unknown,
}

pub fn classify_error(error: &str) -> ErrorClass {
    let error_lower = error.to_lowercase();

    if error_lower.contains("already known")
        || error_lower.contains("already imported")
        || error_lower.contains("known transaction")
    {
        return ErrorClass::AlreadyKnown;
    }

    if error_lower.contains("nonce too low") || error_lower.contains("already been processed") {
        return ErrorClass::NonceTooLow;
    }

    if error_lower.contains("timeout")
        || error_lower.contains("connection")
        || error_lower.contains("network")
        || error_lower.contains("rate limit")
        || error_lower.contains("too many requests")
        || error_lower.contains("503")
        || error_lower.contains("502")
        || error_lower.contains("temporarily unavailable")
    {
        return ErrorClass::Transient;
    }

    if error_lower.contains("underpriced")
        || error_lower.contains("replacement transaction")
        || error_lower.contains("gas price too low")
    {
        return ErrorClass::Underpriced;
    }

    if error_lower.contains("reverted")
        || error_lower.contains("invalid signature")
        || error_lower.contains("insufficient funds")
        || error_lower.contains("out of gas")
        || error_lower.contains("invalid sender")
    {
        return ErrorClass::Permanent;
    }

    ErrorClass::Unknown
}

/// Map a broadcast error to an outcome. `None` means the error is transient
/// and should surface as `Err`.
pub fn broadcast_outcome(error: &str) -> Option<BroadcastOutcome> {
    match classify_error(error) {
        ErrorClass::AlreadyKnown => Some(BroadcastOutcome::AlreadyKnown),
        ErrorClass::NonceTooLow => Some(BroadcastOutcome::NonceTooLow),
        ErrorClass::Transient => None,
        ErrorClass::Underpriced | ErrorClass::Permanent | ErrorClass::Unknown => {
            Some(BroadcastOutcome::Rejected(error.to_string()))
        }
    }
}
