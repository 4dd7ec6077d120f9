//! Errors raised while building or spending the HTLC script tree.

use bitcoin::Amount;

/// Errors from swap tree construction and verification.
///
/// All variants are fatal for the affected swap.
#[derive(Debug)]
pub enum TreeError {
    /// The server-provided tree bytes do not reparse into valid scripts.
    InvalidTree(String),
    /// The server's leaves do not match the locally reconstructed scripts.
    LeafMismatch {
        /// Which leaf disagreed, `"claim"` or `"refund"`.
        leaf: &'static str,
    },
    /// The server's address does not reproduce from the local tree.
    AddressMismatch {
        /// Address the server sent.
        server: String,
        /// Address derived locally.
        local: String,
    },
    /// The timeout encoded in the refund leaf disagrees with the swap.
    TimeoutMismatch {
        /// Height in the server's leaf.
        server: u32,
        /// Height this client expects.
        local: u32,
    },
    /// The hashlock in the claim leaf disagrees with the preimage hash.
    PreimageHashMismatch,
    /// Taproot commitment could not be finalized.
    Taproot(String),
    /// Key material failed to parse.
    Secp(bitcoin::secp256k1::Error),
}

impl From<bitcoin::secp256k1::Error> for TreeError {
    fn from(value: bitcoin::secp256k1::Error) -> Self {
        TreeError::Secp(value)
    }
}

/// Errors from claim/refund transaction construction.
#[derive(Debug)]
pub enum TxBuildError {
    /// No output of the lockup transaction pays the lockup address.
    LockupVoutNotFound,
    /// The lockup output cannot cover the miner fee plus dust.
    AmountTooSmall {
        /// Value locked.
        available: Amount,
        /// Fee that was computed.
        fee: Amount,
    },
    /// Lockup transaction bytes failed to decode.
    InvalidLockupTransaction(String),
    /// A script tree operation failed during signing.
    Tree(TreeError),
    /// The counterparty's partial signature failed verification.
    InvalidPartialSignature,
    /// Liquid output unblinding or blinding failed.
    Blinding(String),
    /// Sighash computation failed.
    Sighash(String),
    /// The destination address is unusable for this chain.
    InvalidAddress(String),
}

impl From<TreeError> for TxBuildError {
    fn from(value: TreeError) -> Self {
        TxBuildError::Tree(value)
    }
}

impl From<bitcoin::sighash::TaprootError> for TxBuildError {
    fn from(value: bitcoin::sighash::TaprootError) -> Self {
        TxBuildError::Sighash(value.to_string())
    }
}
