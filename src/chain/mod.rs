//! On-chain backends.
//!
//! Two interchangeable backends exist per currency: a public block explorer
//! (REST plus a WebSocket block stream) and an Electrum server. The nursery
//! talks to whichever is configured through [`ChainBackend`].

pub mod electrum;
pub mod mempool;

use std::str::FromStr;
use std::sync::{atomic::AtomicBool, mpsc, Arc};

use crate::swap::Currency;

/// A new chain tip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockEpoch {
    /// Currency whose chain advanced.
    pub currency: Currency,
    /// New tip height.
    pub height: u32,
}

/// Errors from chain backends.
#[derive(Debug)]
pub enum ChainError {
    /// HTTP transport failure; retryable.
    Http(minreq::Error),
    /// WebSocket failure; retryable.
    Ws(tungstenite::Error),
    /// Electrum failure.
    Electrum(electrum_client::Error),
    /// Response did not parse.
    InvalidResponse(String),
    /// The backend rejected a broadcast outright.
    BroadcastRejected(String),
    /// The backend has no data for the request.
    MissingData(String),
}

impl From<minreq::Error> for ChainError {
    fn from(value: minreq::Error) -> Self {
        ChainError::Http(value)
    }
}

impl From<tungstenite::Error> for ChainError {
    fn from(value: tungstenite::Error) -> Self {
        ChainError::Ws(value)
    }
}

impl From<electrum_client::Error> for ChainError {
    fn from(value: electrum_client::Error) -> Self {
        ChainError::Electrum(value)
    }
}

impl std::fmt::Display for ChainError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainError::Http(e) => write!(f, "http error: {e}"),
            ChainError::Ws(e) => write!(f, "websocket error: {e}"),
            ChainError::Electrum(e) => write!(f, "electrum error: {e}"),
            ChainError::InvalidResponse(e) => write!(f, "invalid response: {e}"),
            ChainError::BroadcastRejected(e) => write!(f, "broadcast rejected: {e}"),
            ChainError::MissingData(e) => write!(f, "missing data: {e}"),
        }
    }
}

/// One currency's view of its chain.
///
/// `register_block_listener` blocks until the connection drops or `stop` is
/// set; the nursery runs it on a dedicated thread per currency and
/// reconnects on the standard cadence.
pub trait ChainBackend: Send + Sync {
    /// Recommended fee rate in sat/vB.
    fn estimate_fee(&self) -> Result<f64, ChainError>;

    /// Current tip height.
    fn block_height(&self) -> Result<u32, ChainError>;

    /// Raw transaction hex by id.
    fn transaction_hex(&self, txid: &str) -> Result<String, ChainError>;

    /// Broadcast a raw transaction, returning its id.
    fn broadcast_transaction(&self, hex: &str) -> Result<String, ChainError>;

    /// Stream new tips into `epochs` until `stop` is set or the connection
    /// fails.
    fn register_block_listener(
        &self,
        epochs: mpsc::Sender<BlockEpoch>,
        stop: Arc<AtomicBool>,
    ) -> Result<(), ChainError>;
}

/// Liquid network context: address encoding plus the chain genesis hash the
/// Elements sighash commits to.
#[derive(Debug, Clone, Copy)]
pub struct LiquidNetwork {
    /// Address parameters.
    pub address_params: &'static elements::AddressParams,
    /// Genesis block hash.
    pub genesis_hash: elements::BlockHash,
}

/// Network parameters for both chains.
#[derive(Debug, Clone, Copy)]
pub struct Network {
    /// Bitcoin network.
    pub btc: bitcoin::Network,
    /// Liquid network.
    pub lbtc: LiquidNetwork,
}

impl Network {
    /// Bitcoin mainnet plus Liquid.
    pub fn mainnet() -> Self {
        Network {
            btc: bitcoin::Network::Bitcoin,
            lbtc: LiquidNetwork {
                address_params: &elements::AddressParams::LIQUID,
                genesis_hash: elements::BlockHash::from_str(
                    "1466275836220db2944ca059a3a10ef6fd2ea684b0688d2c379296888a206003",
                )
                .expect("valid genesis hash"),
            },
        }
    }

    /// Bitcoin testnet3 plus Liquid testnet.
    pub fn testnet() -> Self {
        Network {
            btc: bitcoin::Network::Testnet,
            lbtc: LiquidNetwork {
                address_params: &elements::AddressParams::LIQUID_TESTNET,
                genesis_hash: elements::BlockHash::from_str(
                    "a771da8e52ee6ad581ed1e9a99825e5b3b7992225534eaa2ae23244fe26ab1c1",
                )
                .expect("valid genesis hash"),
            },
        }
    }

    /// Regtest. The Elements genesis hash depends on the local chain and must
    /// be supplied by the embedder.
    pub fn regtest(lbtc_genesis_hash: elements::BlockHash) -> Self {
        Network {
            btc: bitcoin::Network::Regtest,
            lbtc: LiquidNetwork {
                address_params: &elements::AddressParams::ELEMENTS,
                genesis_hash: lbtc_genesis_hash,
            },
        }
    }
}
