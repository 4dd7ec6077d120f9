//! The on-chain wallet boundary.
//!
//! Wallet implementations live outside this crate; the daemon only depends
//! on the [`OnchainWallet`] trait for refund addresses, autoswap funding and
//! balance checks, plus the credentials model persisted (optionally
//! encrypted) in the database.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::swap::Currency;

/// Errors surfaced by a wallet implementation.
#[derive(Debug)]
pub enum WalletError {
    /// The wallet requires a passphrase before it can be used.
    Locked,
    /// The wallet is read-only and cannot sign.
    ReadOnly,
    /// The wallet backend failed.
    Backend(String),
    /// Not enough confirmed funds.
    InsufficientFunds {
        /// Amount the operation needed, in sat.
        required: u64,
        /// Amount available, in sat.
        available: u64,
    },
    /// The destination address failed to parse.
    InvalidAddress(String),
}

impl std::fmt::Display for WalletError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WalletError::Locked => f.write_str("wallet is locked"),
            WalletError::ReadOnly => f.write_str("wallet is read-only"),
            WalletError::Backend(e) => write!(f, "wallet backend error: {e}"),
            WalletError::InsufficientFunds {
                required,
                available,
            } => write!(
                f,
                "insufficient funds: required {required} sat, available {available} sat"
            ),
            WalletError::InvalidAddress(e) => write!(f, "invalid address: {e}"),
        }
    }
}

/// How a wallet authenticates: a signing mnemonic, or one of two read-only
/// forms.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Credentials {
    /// Mnemonic-derived signer.
    Mnemonic {
        /// BIP39 phrase.
        mnemonic: String,
        /// Derivation subaccount.
        subaccount: Option<u64>,
    },
    /// Watch-only extended public key.
    Xpub {
        /// The xpub.
        xpub: String,
    },
    /// Watch-only Core output descriptor.
    CoreDescriptor {
        /// The descriptor.
        descriptor: String,
    },
}

impl Credentials {
    /// Whether these credentials can sign.
    pub fn is_readonly(&self) -> bool {
        !matches!(self, Credentials::Mnemonic { .. })
    }
}

/// A named wallet's stored credentials.
#[derive(Debug, Clone, PartialEq)]
pub struct WalletCredentials {
    /// Wallet name, unique per daemon.
    pub name: String,
    /// Chain the wallet operates on.
    pub currency: Currency,
    /// The credentials themselves.
    pub credentials: Credentials,
}

/// Operations the daemon needs from a wallet.
///
/// Sending is single-writer: implementations serialize `send_to_address`
/// internally; reads may run concurrently.
pub trait OnchainWallet: Send + Sync {
    /// Wallet name.
    fn name(&self) -> &str;

    /// Chain the wallet operates on.
    fn currency(&self) -> Currency;

    /// Whether the wallet can sign.
    fn is_readonly(&self) -> bool;

    /// Derive a fresh receive address.
    fn new_address(&self) -> Result<String, WalletError>;

    /// Confirmed balance in sat.
    fn balance_sat(&self) -> Result<u64, WalletError>;

    /// Send `amount_sat` to `address` at `fee_rate` sat/vB, returning the
    /// txid.
    fn send_to_address(
        &self,
        address: &str,
        amount_sat: u64,
        fee_rate: f64,
    ) -> Result<String, WalletError>;
}

/// The daemon's wallets, keyed by name.
#[derive(Default)]
pub struct WalletRegistry {
    wallets: RwLock<HashMap<String, Arc<dyn OnchainWallet>>>,
}

impl WalletRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        WalletRegistry {
            wallets: RwLock::new(HashMap::new()),
        }
    }

    /// Register a wallet under its name, replacing any previous entry.
    pub fn register(&self, wallet: Arc<dyn OnchainWallet>) {
        let mut wallets = self.wallets.write().expect("wallet registry poisoned");
        wallets.insert(wallet.name().to_string(), wallet);
    }

    /// Look a wallet up by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn OnchainWallet>> {
        let wallets = self.wallets.read().expect("wallet registry poisoned");
        wallets.get(name).cloned()
    }

    /// First wallet on the given chain, preferring signers.
    pub fn get_for_currency(&self, currency: Currency) -> Option<Arc<dyn OnchainWallet>> {
        let wallets = self.wallets.read().expect("wallet registry poisoned");
        let mut candidates: Vec<_> = wallets
            .values()
            .filter(|w| w.currency() == currency)
            .cloned()
            .collect();
        candidates.sort_by_key(|w| w.is_readonly());
        candidates.into_iter().next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubWallet {
        name: String,
        currency: Currency,
        readonly: bool,
    }

    impl OnchainWallet for StubWallet {
        fn name(&self) -> &str {
            &self.name
        }
        fn currency(&self) -> Currency {
            self.currency
        }
        fn is_readonly(&self) -> bool {
            self.readonly
        }
        fn new_address(&self) -> Result<String, WalletError> {
            Ok("bcrt1qstub".to_string())
        }
        fn balance_sat(&self) -> Result<u64, WalletError> {
            Ok(0)
        }
        fn send_to_address(
            &self,
            _address: &str,
            _amount_sat: u64,
            _fee_rate: f64,
        ) -> Result<String, WalletError> {
            Err(WalletError::ReadOnly)
        }
    }

    #[test]
    fn test_registry_prefers_signing_wallets() {
        let registry = WalletRegistry::new();
        registry.register(Arc::new(StubWallet {
            name: "readonly".to_string(),
            currency: Currency::Btc,
            readonly: true,
        }));
        registry.register(Arc::new(StubWallet {
            name: "signer".to_string(),
            currency: Currency::Btc,
            readonly: false,
        }));

        let picked = registry.get_for_currency(Currency::Btc).unwrap();
        assert_eq!(picked.name(), "signer");
        assert!(registry.get_for_currency(Currency::Lbtc).is_none());
        assert!(registry.get("readonly").is_some());
    }

    #[test]
    fn test_credentials_readonly() {
        assert!(!Credentials::Mnemonic {
            mnemonic: "abandon".to_string(),
            subaccount: None
        }
        .is_readonly());
        assert!(Credentials::Xpub {
            xpub: "xpub661".to_string()
        }
        .is_readonly());
    }
}
