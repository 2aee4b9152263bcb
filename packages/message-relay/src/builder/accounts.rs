//! Hot-wallet accounts used to sign destination transactions
//!
//! Every account has its own lock. A build leases one for its whole duration;
//! dropping the [`AccountLease`] returns it to the pool.

use std::ops::Deref;
use std::sync::Arc;

use alloy::network::EthereumWallet;
use alloy::primitives::Address;
use alloy::signers::local::PrivateKeySigner;
use eyre::{eyre, Result, WrapErr};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::redact::Secret;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LeaseError {
    #[error("account is locked")]
    AccountLocked,
}

pub struct Account {
    pub address: Address,
    pub wallet: EthereumWallet,
}

impl Account {
    fn new(signer: PrivateKeySigner) -> Self {
        Self {
            address: signer.address(),
            wallet: EthereumWallet::from(signer),
        }
    }

    /// Address as stored in the ledger
    pub fn ledger_address(&self) -> String {
        format!("{:#x}", self.address)
    }
}

/// Exclusive use of one account until dropped
pub struct AccountLease {
    guard: OwnedMutexGuard<Account>,
}

impl Deref for AccountLease {
    type Target = Account;

    fn deref(&self) -> &Account {
        &self.guard
    }
}

pub struct AccountPool {
    accounts: Vec<Arc<Mutex<Account>>>,
}

impl AccountPool {
    pub fn new(signers: Vec<PrivateKeySigner>) -> Result<Self> {
        if signers.is_empty() {
            return Err(eyre!("at least one builder key is required"));
        }
        Ok(Self {
            accounts: signers
                .into_iter()
                .map(|signer| Arc::new(Mutex::new(Account::new(signer))))
                .collect(),
        })
    }

    pub fn from_keys(keys: &[Secret]) -> Result<Self> {
        let signers = keys
            .iter()
            .enumerate()
            .map(|(i, key)| {
                key.expose()
                    .parse::<PrivateKeySigner>()
                    .wrap_err_with(|| format!("Invalid builder key #{}", i))
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(signers)
    }

    /// Lease any free account without waiting
    pub fn borrow(&self) -> Result<AccountLease, LeaseError> {
        self.accounts
            .iter()
            .find_map(|account| account.clone().try_lock_owned().ok())
            .map(|guard| AccountLease { guard })
            .ok_or(LeaseError::AccountLocked)
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}
