//! Wire types for the exchange's HTTP and WebSocket APIs.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// One tapleaf as the exchange serializes it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TreeLeaf {
    /// Tapscript leaf version.
    pub version: u8,
    /// Leaf script, hex encoded.
    pub output: String,
}

/// The exchange's serialization of a swap tree.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TreeResponse {
    /// Preimage leaf.
    pub claim_leaf: TreeLeaf,
    /// Timeout leaf.
    pub refund_leaf: TreeLeaf,
}

/// `POST /v2/swap/submarine` request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSubmarineRequest {
    /// Currency the user locks.
    pub from: String,
    /// Currency the exchange pays out on.
    pub to: String,
    /// BOLT11 invoice the exchange should pay.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invoice: Option<String>,
    /// sha256 hash, hex, when the invoice is attached later.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preimage_hash: Option<String>,
    /// Our refund public key, hex.
    pub refund_public_key: String,
}

/// `POST /v2/swap/submarine` response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSubmarineResponse {
    /// Swap id.
    pub id: String,
    /// Lockup address the user must fund.
    pub address: String,
    /// Amount (sat) expected at the lockup address.
    pub expected_amount: u64,
    /// The exchange's claim public key, hex.
    pub claim_public_key: String,
    /// Absolute refund height.
    pub timeout_block_height: u32,
    /// The exchange's view of the script tree.
    pub swap_tree: TreeResponse,
    /// Blinding secret for Liquid lockups, hex.
    #[serde(default)]
    pub blinding_key: Option<String>,
    /// Whether the exchange accepts the lockup at zero conf.
    #[serde(default)]
    pub accept_zero_conf: bool,
}

/// `POST /v2/swap/reverse` request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateReverseRequest {
    /// Currency the exchange receives over Lightning.
    pub from: String,
    /// Currency the exchange locks on-chain.
    pub to: String,
    /// Invoice amount in sat.
    pub invoice_amount: u64,
    /// sha256 of our preimage, hex.
    pub preimage_hash: String,
    /// Our claim public key, hex.
    pub claim_public_key: String,
}

/// `POST /v2/swap/reverse` response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateReverseResponse {
    /// Swap id.
    pub id: String,
    /// Hold invoice to pay.
    pub invoice: String,
    /// Exchange lockup address (the tree address).
    pub lockup_address: String,
    /// Amount (sat) the exchange locks.
    pub onchain_amount: u64,
    /// The exchange's refund public key, hex.
    pub refund_public_key: String,
    /// Absolute height after which the exchange reclaims its lockup.
    pub timeout_block_height: u32,
    /// The exchange's view of the script tree.
    pub swap_tree: TreeResponse,
    /// Blinding secret for Liquid lockups, hex.
    #[serde(default)]
    pub blinding_key: Option<String>,
}

/// Transaction details attached to a status update.
#[derive(Debug, Clone, Deserialize)]
pub struct TransactionInfo {
    /// Transaction id.
    pub id: String,
    /// Raw transaction, hex, when the exchange includes it.
    #[serde(default)]
    pub hex: Option<String>,
}

/// `GET /v2/swap/{id}` response, also the per-swap payload of stream
/// updates.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwapStatusResponse {
    /// Status string from the closed vocabulary.
    pub status: String,
    /// Lockup or claim transaction info, when relevant.
    #[serde(default)]
    pub transaction: Option<TransactionInfo>,
    /// Failure detail on error statuses.
    #[serde(default)]
    pub failure_reason: Option<String>,
    /// Set when the exchange refuses to accept the lockup at zero conf.
    #[serde(default)]
    pub zero_conf_rejected: Option<bool>,
}

/// One update fanned out of the WebSocket, routed by id.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    /// Swap id this update belongs to.
    pub id: String,
    /// Status string.
    pub status: String,
    /// Transaction info, when relevant.
    #[serde(default)]
    pub transaction: Option<TransactionInfo>,
    /// Failure detail on error statuses.
    #[serde(default)]
    pub failure_reason: Option<String>,
    /// Zero-conf refusal signal.
    #[serde(default)]
    pub zero_conf_rejected: Option<bool>,
}

/// Amount limits of a pair, in sat.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairLimits {
    /// Smallest accepted swap.
    pub minimal: u64,
    /// Largest accepted swap.
    pub maximal: u64,
}

/// Fee schedule of a submarine pair.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmarineFees {
    /// Service fee in percent.
    pub percentage: f64,
    /// Lockup-claim miner fee quote in sat.
    pub miner_fees: u64,
}

/// One entry of `GET /v2/swap/submarine`.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmarinePair {
    /// Pair hash, echoed on creation.
    pub hash: String,
    /// Exchange rate.
    pub rate: f64,
    /// Amount limits.
    pub limits: PairLimits,
    /// Fee schedule.
    pub fees: SubmarineFees,
}

/// Claim/lockup miner fee quotes of a reverse pair.
#[derive(Debug, Clone, Deserialize)]
pub struct ReverseMinerFees {
    /// Our claim transaction.
    pub claim: u64,
    /// The exchange's lockup transaction.
    pub lockup: u64,
}

/// Fee schedule of a reverse pair.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReverseFees {
    /// Service fee in percent.
    pub percentage: f64,
    /// Miner fee quotes.
    pub miner_fees: ReverseMinerFees,
}

/// One entry of `GET /v2/swap/reverse`.
#[derive(Debug, Clone, Deserialize)]
pub struct ReversePair {
    /// Pair hash.
    pub hash: String,
    /// Exchange rate.
    pub rate: f64,
    /// Amount limits.
    pub limits: PairLimits,
    /// Fee schedule.
    pub fees: ReverseFees,
}

/// Pairs keyed `from -> to`.
pub type SubmarinePairs = HashMap<String, HashMap<String, SubmarinePair>>;
/// Reverse pairs keyed `from -> to`.
pub type ReversePairs = HashMap<String, HashMap<String, ReversePair>>;

/// `GET /v2/chain/{currency}/transaction/{id}` response.
#[derive(Debug, Clone, Deserialize)]
pub struct TransactionResponse {
    /// Raw transaction, hex.
    pub hex: String,
}

/// `POST /v2/chain/{currency}/transaction` request.
#[derive(Debug, Clone, Serialize)]
pub struct BroadcastRequest {
    /// Raw transaction, hex.
    pub hex: String,
}

/// `POST /v2/chain/{currency}/transaction` response.
#[derive(Debug, Clone, Deserialize)]
pub struct BroadcastResponse {
    /// Transaction id assigned by the chain.
    pub id: String,
}

/// Details the exchange publishes when it wants to claim a submarine swap
/// cooperatively: `GET /v2/swap/{id}/claim`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmarineClaimDetails {
    /// Preimage the exchange learned by paying the invoice, hex.
    pub preimage: String,
    /// The exchange's public nonce, hex.
    pub pub_nonce: String,
    /// Sighash of the exchange's claim transaction, hex.
    pub transaction_hash: String,
}

/// Counterparty material for a cooperative key-path spend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialSignatureResponse {
    /// Public nonce, hex.
    pub pub_nonce: String,
    /// Partial signature, hex.
    pub partial_signature: String,
}

/// Error body the exchange returns on non-2xx responses.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorResponse {
    /// Human-readable reason.
    pub error: String,
}

/// Outbound WebSocket frame.
#[derive(Debug, Serialize)]
pub struct WsRequest<'a> {
    /// Operation, `subscribe`.
    pub op: &'a str,
    /// Channel, `swap.update`.
    pub channel: &'a str,
    /// Swap ids.
    pub args: &'a [String],
}

/// Inbound WebSocket frame.
#[derive(Debug, Deserialize)]
pub struct WsResponse {
    /// Event kind: `update`, `subscribe`, `pong`.
    #[serde(default)]
    pub event: String,
    /// Channel the event belongs to.
    #[serde(default)]
    pub channel: Option<String>,
    /// Event payload.
    #[serde(default)]
    pub args: Option<serde_json::Value>,
    /// Error detail pushed by the server.
    #[serde(default)]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_status_update_args() {
        let raw = r#"{
            "event": "update",
            "channel": "swap.update",
            "args": [
                {"id": "abc123", "status": "transaction.mempool",
                 "transaction": {"id": "deadbeef", "hex": "0200"}},
                {"id": "def456", "status": "invoice.settled"}
            ]
        }"#;
        let response: WsResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(response.event, "update");
        assert_eq!(response.channel.as_deref(), Some("swap.update"));

        let updates: Vec<StatusUpdate> =
            serde_json::from_value(response.args.unwrap()).unwrap();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].id, "abc123");
        assert_eq!(updates[0].status, "transaction.mempool");
        assert_eq!(
            updates[0].transaction.as_ref().unwrap().id,
            "deadbeef"
        );
        assert!(updates[1].transaction.is_none());
    }

    #[test]
    fn test_parse_submarine_pairs() {
        let raw = r#"{
            "BTC": {
                "BTC": {
                    "hash": "a1b2",
                    "rate": 1.0,
                    "limits": {"minimal": 10000, "maximal": 10000000},
                    "fees": {"percentage": 0.1, "minerFees": 320}
                }
            }
        }"#;
        let pairs: SubmarinePairs = serde_json::from_str(raw).unwrap();
        let pair = &pairs["BTC"]["BTC"];
        assert_eq!(pair.limits.minimal, 10_000);
        assert!((pair.fees.percentage - 0.1).abs() < f64::EPSILON);
        assert_eq!(pair.fees.miner_fees, 320);
    }

    #[test]
    fn test_parse_create_submarine_response() {
        let raw = r#"{
            "id": "sub1",
            "address": "bcrt1p...",
            "expectedAmount": 100200,
            "claimPublicKey": "02aa",
            "timeoutBlockHeight": 800000,
            "swapTree": {
                "claimLeaf": {"version": 192, "output": "a914"},
                "refundLeaf": {"version": 192, "output": "20ab"}
            }
        }"#;
        let response: CreateSubmarineResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(response.expected_amount, 100_200);
        assert!(response.blinding_key.is_none());
        assert!(!response.accept_zero_conf);
        assert_eq!(response.swap_tree.claim_leaf.output, "a914");
    }
}
