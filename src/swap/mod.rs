//! The swap data model.
//!
//! Defines the two swap flavors and their shared vocabulary: currencies,
//! pairs, client-side lifecycle states and the exchange's status strings.
//! The cryptographic script model lives in [`tree`], transaction assembly in
//! [`txbuilder`].

pub mod error;
pub mod musig;
pub mod tree;
pub mod txbuilder;

use std::fmt;

use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use chrono::{DateTime, Utc};

use crate::swap::tree::SwapTree;

/// The currencies this daemon can settle on-chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Currency {
    /// Mainchain Bitcoin.
    Btc,
    /// Liquid Bitcoin.
    Lbtc,
}

impl Currency {
    /// The ticker the exchange API uses for this currency.
    pub fn as_str(&self) -> &'static str {
        match self {
            Currency::Btc => "BTC",
            Currency::Lbtc => "L-BTC",
        }
    }

    /// Parse an exchange ticker.
    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "BTC" => Some(Currency::Btc),
            "L-BTC" | "LBTC" => Some(Currency::Lbtc),
            _ => None,
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An ordered (from, to) currency tuple. The exchange publishes fees and
/// limits per pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pair {
    /// Currency the user sends.
    pub from: Currency,
    /// Currency the user receives.
    pub to: Currency,
}

impl fmt::Display for Pair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.from, self.to)
    }
}

/// Client-side lifecycle state of a swap row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapState {
    /// Swap is in flight.
    Pending,
    /// Swap settled successfully; terminal.
    Successful,
    /// Swap failed on our side; terminal.
    Error,
    /// Locked funds were reclaimed through the timeout path; terminal.
    Refunded,
    /// The exchange misbehaved (bad tree, bad address, rejected tx); terminal.
    ServerError,
}

impl SwapState {
    /// String form used in persistence.
    pub fn as_str(&self) -> &'static str {
        match self {
            SwapState::Pending => "pending",
            SwapState::Successful => "successful",
            SwapState::Error => "error",
            SwapState::Refunded => "refunded",
            SwapState::ServerError => "server_error",
        }
    }

    /// Parse the persisted form.
    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(SwapState::Pending),
            "successful" => Some(SwapState::Successful),
            "error" => Some(SwapState::Error),
            "refunded" => Some(SwapState::Refunded),
            "server_error" => Some(SwapState::ServerError),
            _ => None,
        }
    }

    /// Whether this state ends the lifecycle.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SwapState::Pending)
    }
}

impl fmt::Display for SwapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The exchange's status vocabulary, one logical stream per swap id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    /// Swap was created on the exchange.
    SwapCreated,
    /// An invoice was attached to the swap.
    InvoiceSet,
    /// Lockup transaction seen in the mempool.
    TransactionMempool,
    /// Lockup transaction confirmed.
    TransactionConfirmed,
    /// The exchange wants to claim the lockup cooperatively and is waiting
    /// for our partial signature.
    TransactionClaimPending,
    /// The exchange claimed the lockup (submarine success).
    TransactionClaimed,
    /// A refund transaction spent the lockup.
    TransactionRefunded,
    /// The lockup was malformed or underpaid.
    TransactionLockupFailed,
    /// A swap transaction failed on the exchange side.
    TransactionFailed,
    /// The exchange is paying the invoice.
    InvoicePending,
    /// The invoice was paid (preimage not yet revealed on-chain).
    InvoicePaid,
    /// The invoice settled (reverse success).
    InvoiceSettled,
    /// The exchange could not pay the invoice.
    InvoiceFailedToPay,
    /// The invoice expired before payment.
    InvoiceExpired,
    /// The swap timed out on the exchange.
    SwapExpired,
    /// Any status string this client does not know.
    Unknown(String),
}

impl Status {
    /// Parse an exchange status string.
    pub fn parse(s: &str) -> Self {
        match s {
            "swap.created" => Status::SwapCreated,
            "invoice.set" => Status::InvoiceSet,
            "transaction.mempool" => Status::TransactionMempool,
            "transaction.confirmed" => Status::TransactionConfirmed,
            "transaction.claim.pending" => Status::TransactionClaimPending,
            "transaction.claimed" => Status::TransactionClaimed,
            "transaction.refunded" => Status::TransactionRefunded,
            "transaction.lockupFailed" => Status::TransactionLockupFailed,
            "transaction.failed" => Status::TransactionFailed,
            "invoice.pending" => Status::InvoicePending,
            "invoice.paid" => Status::InvoicePaid,
            "invoice.settled" => Status::InvoiceSettled,
            "invoice.failedToPay" => Status::InvoiceFailedToPay,
            "invoice.expired" => Status::InvoiceExpired,
            "swap.expired" => Status::SwapExpired,
            other => Status::Unknown(other.to_string()),
        }
    }

    /// The wire form of this status.
    pub fn as_str(&self) -> &str {
        match self {
            Status::SwapCreated => "swap.created",
            Status::InvoiceSet => "invoice.set",
            Status::TransactionMempool => "transaction.mempool",
            Status::TransactionConfirmed => "transaction.confirmed",
            Status::TransactionClaimPending => "transaction.claim.pending",
            Status::TransactionClaimed => "transaction.claimed",
            Status::TransactionRefunded => "transaction.refunded",
            Status::TransactionLockupFailed => "transaction.lockupFailed",
            Status::TransactionFailed => "transaction.failed",
            Status::InvoicePending => "invoice.pending",
            Status::InvoicePaid => "invoice.paid",
            Status::InvoiceSettled => "invoice.settled",
            Status::InvoiceFailedToPay => "invoice.failedToPay",
            Status::InvoiceExpired => "invoice.expired",
            Status::SwapExpired => "swap.expired",
            Status::Unknown(other) => other.as_str(),
        }
    }

    /// Statuses after which the exchange will not emit further updates for a
    /// failed swap.
    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            Status::TransactionLockupFailed
                | Status::TransactionFailed
                | Status::InvoiceFailedToPay
                | Status::InvoiceExpired
                | Status::SwapExpired
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A submarine swap: on-chain funds in, Lightning payment out.
#[derive(Debug, Clone)]
pub struct Swap {
    /// Exchange-assigned swap id.
    pub id: String,
    /// (from, to) currency tuple.
    pub pair: Pair,
    /// Client-side lifecycle state.
    pub state: SwapState,
    /// Human-readable failure detail, kept for forensics.
    pub error: Option<String>,
    /// Last exchange-reported status.
    pub status: Status,
    /// Our refund key.
    pub private_key: SecretKey,
    /// Preimage, known only when we generated it (no invoice given).
    pub preimage: Option<[u8; 32]>,
    /// sha256 of the preimage, from the invoice or our own preimage.
    pub preimage_hash: [u8; 32],
    /// BOLT11 invoice the exchange pays.
    pub invoice: Option<String>,
    /// Lockup address the user must fund.
    pub address: String,
    /// Amount (sat) the exchange expects at the lockup address.
    pub expected_amount: u64,
    /// Absolute block height after which the refund leaf is spendable.
    pub timeout_block_height: u32,
    /// Liquid blinding secret for the lockup address, when `from` is L-BTC.
    pub blinding_key: Option<SecretKey>,
    /// Lockup transaction, once seen. Set at most once.
    pub lockup_transaction_id: Option<String>,
    /// Refund transaction, once broadcast. Set at most once.
    pub refund_transaction_id: Option<String>,
    /// Destination for a refund; derived from the wallet when unset.
    pub refund_address: Option<String>,
    /// Whether the autoswapper created this swap.
    pub is_auto: bool,
    /// Service fee percentage quoted at creation.
    pub service_fee_percent: f64,
    /// Service fee (sat), computed at settlement.
    pub service_fee: Option<u64>,
    /// On-chain miner fee (sat) attributed to this swap.
    pub onchain_fee: Option<u64>,
    /// Name of the wallet that funds the lockup, if any.
    pub wallet: Option<String>,
    /// The verified HTLC script tree.
    pub tree: SwapTree,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
}

/// A reverse swap: Lightning payment in, on-chain funds out.
#[derive(Debug, Clone)]
pub struct ReverseSwap {
    /// Exchange-assigned swap id.
    pub id: String,
    /// (from, to) currency tuple.
    pub pair: Pair,
    /// Client-side lifecycle state.
    pub state: SwapState,
    /// Human-readable failure detail, kept for forensics.
    pub error: Option<String>,
    /// Last exchange-reported status.
    pub status: Status,
    /// Our claim key.
    pub private_key: SecretKey,
    /// Preimage; always generated locally for reverse swaps.
    pub preimage: [u8; 32],
    /// sha256 of the preimage.
    pub preimage_hash: [u8; 32],
    /// BOLT11 invoice we (or an external payer) pay.
    pub invoice: String,
    /// Exchange's lockup address (the swap tree address).
    pub lockup_address: String,
    /// Amount (sat) the exchange locks on-chain.
    pub onchain_amount: u64,
    /// Absolute block height after which the exchange can reclaim its lockup.
    pub timeout_block_height: u32,
    /// Whether to claim an unconfirmed lockup.
    pub accept_zero_conf: bool,
    /// Our payout address.
    pub claim_address: String,
    /// Claim transaction, once broadcast. Set at most once.
    pub claim_transaction_id: Option<String>,
    /// Routing fee paid for the invoice, in msat.
    pub routing_fee_msat: Option<u64>,
    /// When set, the invoice is handed to the caller and never paid locally.
    pub external_pay: bool,
    /// Channel ids the Lightning payment should be scoped to.
    pub chan_ids: Vec<u64>,
    /// Liquid blinding secret for the lockup, when `to` is L-BTC.
    pub blinding_key: Option<SecretKey>,
    /// Whether the autoswapper created this swap.
    pub is_auto: bool,
    /// Service fee percentage quoted at creation.
    pub service_fee_percent: f64,
    /// Service fee (sat), computed at settlement.
    pub service_fee: Option<u64>,
    /// On-chain miner fee (sat) attributed to this swap.
    pub onchain_fee: Option<u64>,
    /// The verified HTLC script tree.
    pub tree: SwapTree,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
}

impl Swap {
    /// The currency whose chain carries the lockup.
    pub fn chain_currency(&self) -> Currency {
        self.pair.from
    }

    /// Our refund public key.
    pub fn public_key(&self) -> PublicKey {
        PublicKey::from_secret_key(&Secp256k1::new(), &self.private_key)
    }
}

impl ReverseSwap {
    /// The currency whose chain carries the lockup.
    pub fn chain_currency(&self) -> Currency {
        self.pair.to
    }

    /// Our claim public key.
    pub fn public_key(&self) -> PublicKey {
        PublicKey::from_secret_key(&Secp256k1::new(), &self.private_key)
    }
}

/// Common lifecycle surface over the two swap flavors, used by the registry
/// and the subscriber fan-out.
pub trait Lifecycle {
    /// Swap id.
    fn id(&self) -> &str;
    /// Current client-side state.
    fn state(&self) -> SwapState;
    /// Last exchange status.
    fn status(&self) -> &Status;
    /// Whether the lifecycle has ended.
    fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }
}

impl Lifecycle for Swap {
    fn id(&self) -> &str {
        &self.id
    }
    fn state(&self) -> SwapState {
        self.state
    }
    fn status(&self) -> &Status {
        &self.status
    }
}

impl Lifecycle for ReverseSwap {
    fn id(&self) -> &str {
        &self.id
    }
    fn state(&self) -> SwapState {
        self.state
    }
    fn status(&self) -> &Status {
        &self.status
    }
}

/// A snapshot published to subscriber streams after every persisted
/// transition. Exactly one of the two fields is set.
#[derive(Debug, Clone)]
pub struct SwapUpdate {
    /// Submarine swap snapshot.
    pub swap: Option<Swap>,
    /// Reverse swap snapshot.
    pub reverse_swap: Option<ReverseSwap>,
}

impl SwapUpdate {
    /// Wrap a submarine swap snapshot.
    pub fn from_swap(swap: Swap) -> Self {
        SwapUpdate {
            swap: Some(swap),
            reverse_swap: None,
        }
    }

    /// Wrap a reverse swap snapshot.
    pub fn from_reverse(swap: ReverseSwap) -> Self {
        SwapUpdate {
            swap: None,
            reverse_swap: Some(swap),
        }
    }

    fn lifecycle(&self) -> Option<&dyn Lifecycle> {
        match (&self.swap, &self.reverse_swap) {
            (Some(swap), _) => Some(swap),
            (_, Some(reverse)) => Some(reverse),
            _ => None,
        }
    }

    /// Id of whichever swap this update carries.
    pub fn id(&self) -> &str {
        self.lifecycle().map(Lifecycle::id).unwrap_or("")
    }

    /// Whether the carried swap reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.lifecycle()
            .map(Lifecycle::is_terminal)
            .unwrap_or(false)
    }
}
