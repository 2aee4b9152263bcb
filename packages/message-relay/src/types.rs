//! Persisted enums for the message ledger
//!
//! Every enum here is stored as a lowercase `VARCHAR` and decoded back through
//! `FromStr`, which is what `#[sqlx(try_from = "String")]` on the model fields
//! relies on.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A persisted enum column held an unexpected value
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} value: {value:?}")]
pub struct ParseStatusError {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! persisted_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "lowercase")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            /// Get the value as stored in the database
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseStatusError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(ParseStatusError {
                        kind: stringify!($name),
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl TryFrom<String> for $name {
            type Error = ParseStatusError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                value.parse()
            }
        }
    };
}

persisted_enum!(
    /// Which side of a relay a message row describes
    MessageType {
        Call => "call",
        Send => "send",
    }
);

persisted_enum!(
    /// Message lifecycle: validating -> pending -> broadcast -> valid, or invalid
    MessageStatus {
        Validating => "validating",
        Pending => "pending",
        Broadcast => "broadcast",
        Valid => "valid",
        Invalid => "invalid",
    }
);

persisted_enum!(
    /// Destination transaction lifecycle
    SignatureStatus {
        Pending => "pending",
        Broadcast => "broadcast",
        Success => "success",
        Failed => "failed",
        Invalid => "invalid",
    }
);

persisted_enum!(
    ChainType {
        Evm => "evm",
        Utxo => "utxo",
    }
);

persisted_enum!(
    SyncTaskStatus {
        Pending => "pending",
        Invalid => "invalid",
        Done => "done",
    }
);

impl SignatureStatus {
    /// Still waiting on the destination chain; its nonce cannot be reused yet
    pub fn is_in_flight(&self) -> bool {
        matches!(self, SignatureStatus::Pending | SignatureStatus::Broadcast)
    }

    /// Settled on the destination chain
    pub fn is_terminal(&self) -> bool {
        matches!(self, SignatureStatus::Success | SignatureStatus::Failed)
    }
}

/// Ledger columns are `BIGINT`; refuse chain ids and heights that would wrap
pub fn ledger_int(value: u64, what: &str) -> eyre::Result<i64> {
    i64::try_from(value).map_err(|_| eyre::eyre!("{} {} does not fit a BIGINT column", what, value))
}
