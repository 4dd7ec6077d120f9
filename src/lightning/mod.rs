//! Boundary to the attached Lightning node.
//!
//! The daemon does not ship a node; embedders provide an implementation of
//! [`LightningNode`] over whatever RPC their node exposes. The nursery and
//! the autoswapper only consume this trait.

pub mod invoice;

/// Errors surfaced by a Lightning node implementation.
#[derive(Debug)]
pub enum LightningError {
    /// The node is unreachable.
    Connection(String),
    /// The node rejected or failed the call.
    Rpc(String),
    /// An invoice failed to parse.
    InvalidInvoice(String),
    /// Payment attempt failed after exhausting routes.
    PaymentFailed(String),
    /// The queried object does not exist on the node.
    NotFound,
}

impl std::fmt::Display for LightningError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LightningError::Connection(e) => write!(f, "node unreachable: {e}"),
            LightningError::Rpc(e) => write!(f, "node error: {e}"),
            LightningError::InvalidInvoice(e) => write!(f, "invalid invoice: {e}"),
            LightningError::PaymentFailed(e) => write!(f, "payment failed: {e}"),
            LightningError::NotFound => f.write_str("not found"),
        }
    }
}

/// Identity and sync state of the node.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    /// Node public key, hex.
    pub pubkey: String,
    /// Node alias.
    pub alias: String,
    /// The node's view of the chain tip.
    pub block_height: u32,
}

/// An invoice created on the node.
#[derive(Debug, Clone)]
pub struct CreatedInvoice {
    /// BOLT11 string.
    pub bolt11: String,
    /// Payment hash.
    pub payment_hash: [u8; 32],
}

/// One channel's balance sheet.
#[derive(Debug, Clone)]
pub struct ChannelInfo {
    /// Short channel id.
    pub id: u64,
    /// Remote node public key, hex.
    pub peer_pubkey: String,
    /// Total capacity in sat.
    pub capacity_sat: u64,
    /// Our side of the balance in sat.
    pub local_sat: u64,
    /// The remote side of the balance in sat.
    pub remote_sat: u64,
}

/// Settlement state of an invoice on the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvoiceState {
    /// Unpaid.
    Open,
    /// HTLCs accepted, not yet settled.
    Accepted,
    /// Paid out.
    Settled,
    /// Cancelled or expired.
    Cancelled,
}

/// Outcome of a successful payment.
#[derive(Debug, Clone)]
pub struct PaymentResult {
    /// Preimage revealed by the payee.
    pub preimage: [u8; 32],
    /// Routing fee paid, in msat.
    pub routing_fee_msat: u64,
}

/// Operations the daemon needs from the attached node.
///
/// `pay_invoice` blocks until the payment settles or fails; the nursery runs
/// it on a dedicated thread per payment.
pub trait LightningNode: Send + Sync {
    /// Identity and sync state.
    fn get_info(&self) -> Result<NodeInfo, LightningError>;

    /// Create an invoice for `amount_sat`.
    fn create_invoice(
        &self,
        amount_sat: u64,
        memo: &str,
        expiry_secs: u64,
    ) -> Result<CreatedInvoice, LightningError>;

    /// Pay an invoice, optionally scoped to outgoing channels `chan_ids`.
    fn pay_invoice(
        &self,
        invoice: &str,
        fee_limit_sat: u64,
        chan_ids: &[u64],
    ) -> Result<PaymentResult, LightningError>;

    /// Settlement state of one of our invoices.
    fn lookup_invoice(&self, payment_hash: &[u8; 32]) -> Result<InvoiceState, LightningError>;

    /// Fresh on-chain address from the node's wallet.
    fn new_address(&self) -> Result<String, LightningError>;

    /// All active channels.
    fn list_channels(&self) -> Result<Vec<ChannelInfo>, LightningError>;
}
