//! Client for the exchange's HTTP API.
//!
//! All endpoints are JSON over a blocking HTTP client. The WebSocket status
//! stream lives in [`ws`]; its updates feed the nursery's event loop.

pub mod types;
pub mod ws;

use elements::secp256k1_zkp as zkp;

use crate::swap::txbuilder::{
    CooperativeSignError, CooperativeSigner, CounterpartySignature,
};
use crate::swap::Currency;
use crate::utill::{self, HTTP_TIMEOUT_SECS};
use types::*;

/// Errors from exchange interactions.
#[derive(Debug)]
pub enum ExchangeError {
    /// Transport-level failure; retryable.
    Http(minreq::Error),
    /// The exchange answered with a non-2xx status.
    Api {
        /// HTTP status code.
        status: i32,
        /// Error string from the response body.
        message: String,
    },
    /// The response did not parse into the expected shape.
    InvalidResponse(String),
    /// WebSocket-level failure; retryable.
    Ws(tungstenite::Error),
    /// The exchange did not acknowledge a subscription in time.
    SubscribeTimeout,
}

impl From<minreq::Error> for ExchangeError {
    fn from(value: minreq::Error) -> Self {
        ExchangeError::Http(value)
    }
}

impl From<tungstenite::Error> for ExchangeError {
    fn from(value: tungstenite::Error) -> Self {
        ExchangeError::Ws(value)
    }
}

impl std::fmt::Display for ExchangeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExchangeError::Http(e) => write!(f, "http error: {e}"),
            ExchangeError::Api { status, message } => {
                write!(f, "exchange rejected request ({status}): {message}")
            }
            ExchangeError::InvalidResponse(e) => write!(f, "invalid response: {e}"),
            ExchangeError::Ws(e) => write!(f, "websocket error: {e}"),
            ExchangeError::SubscribeTimeout => f.write_str("no answer from exchange"),
        }
    }
}

impl ExchangeError {
    /// Whether the failure was transport-level and worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            ExchangeError::Http(_) | ExchangeError::Ws(_) | ExchangeError::SubscribeTimeout => true,
            ExchangeError::Api { status, .. } => *status >= 500,
            ExchangeError::InvalidResponse(_) => false,
        }
    }
}

/// Blocking client for the exchange REST API.
#[derive(Debug, Clone)]
pub struct ExchangeClient {
    api_url: String,
}

impl ExchangeClient {
    /// Create a client for the given base URL, e.g. `https://api.example.com`.
    pub fn new(api_url: &str) -> Self {
        ExchangeClient {
            api_url: api_url.trim_end_matches('/').to_string(),
        }
    }

    /// Base URL this client talks to.
    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, ExchangeError> {
        let response = minreq::get(format!("{}{}", self.api_url, path))
            .with_timeout(HTTP_TIMEOUT_SECS)
            .send()?;
        Self::parse(response)
    }

    fn post<T: serde::de::DeserializeOwned, B: serde::Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ExchangeError> {
        let response = minreq::post(format!("{}{}", self.api_url, path))
            .with_timeout(HTTP_TIMEOUT_SECS)
            .with_json(body)?
            .send()?;
        Self::parse(response)
    }

    fn parse<T: serde::de::DeserializeOwned>(
        response: minreq::Response,
    ) -> Result<T, ExchangeError> {
        if !(200..300).contains(&response.status_code) {
            let message = response
                .json::<ApiErrorResponse>()
                .map(|e| e.error)
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(ExchangeError::Api {
                status: response.status_code,
                message,
            });
        }
        response
            .json::<T>()
            .map_err(|e| ExchangeError::InvalidResponse(e.to_string()))
    }

    /// Create a submarine swap.
    pub fn create_submarine_swap(
        &self,
        request: &CreateSubmarineRequest,
    ) -> Result<CreateSubmarineResponse, ExchangeError> {
        self.post("/v2/swap/submarine", request)
    }

    /// Create a reverse swap.
    pub fn create_reverse_swap(
        &self,
        request: &CreateReverseRequest,
    ) -> Result<CreateReverseResponse, ExchangeError> {
        self.post("/v2/swap/reverse", request)
    }

    /// Point query of a swap's status.
    pub fn swap_status(&self, id: &str) -> Result<SwapStatusResponse, ExchangeError> {
        self.get(&format!("/v2/swap/{id}"))
    }

    /// Published submarine pairs with fees and limits.
    pub fn submarine_pairs(&self) -> Result<SubmarinePairs, ExchangeError> {
        self.get("/v2/swap/submarine")
    }

    /// Published reverse pairs with fees and limits.
    pub fn reverse_pairs(&self) -> Result<ReversePairs, ExchangeError> {
        self.get("/v2/swap/reverse")
    }

    /// Fetch a raw transaction from the exchange's chain view.
    pub fn get_transaction(
        &self,
        currency: Currency,
        txid: &str,
    ) -> Result<String, ExchangeError> {
        let response: TransactionResponse =
            self.get(&format!("/v2/chain/{}/transaction/{txid}", currency.as_str()))?;
        Ok(response.hex)
    }

    /// Broadcast a raw transaction through the exchange.
    pub fn broadcast_transaction(
        &self,
        currency: Currency,
        hex: &str,
    ) -> Result<String, ExchangeError> {
        let response: BroadcastResponse = self.post(
            &format!("/v2/chain/{}/transaction", currency.as_str()),
            &BroadcastRequest {
                hex: hex.to_string(),
            },
        )?;
        Ok(response.id)
    }

    /// The exchange's pending cooperative claim of a submarine swap.
    pub fn submarine_claim_details(
        &self,
        id: &str,
    ) -> Result<SubmarineClaimDetails, ExchangeError> {
        self.get(&format!("/v2/swap/{id}/claim"))
    }

    /// Send our partial signature for the exchange's submarine claim.
    pub fn send_submarine_claim_signature(
        &self,
        id: &str,
        pub_nonce: &zkp::MusigPubNonce,
        partial_signature: &zkp::MusigPartialSignature,
    ) -> Result<(), ExchangeError> {
        let body = PartialSignatureResponse {
            pub_nonce: utill::to_hex(&pub_nonce.serialize()),
            partial_signature: utill::to_hex(&partial_signature.serialize()),
        };
        let _: serde_json::Value = self.post(&format!("/v2/swap/{id}/claim"), &body)?;
        Ok(())
    }

    fn partial_signature(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<CounterpartySignature, ExchangeError> {
        let response: PartialSignatureResponse = self.post(path, &body)?;
        let nonce_bytes = utill::from_hex(&response.pub_nonce)
            .map_err(|e| ExchangeError::InvalidResponse(format!("bad nonce hex: {e}")))?;
        let pub_nonce = zkp::MusigPubNonce::from_slice(&nonce_bytes)
            .map_err(|e| ExchangeError::InvalidResponse(format!("bad nonce: {e}")))?;
        let sig_bytes = utill::from_hex(&response.partial_signature)
            .map_err(|e| ExchangeError::InvalidResponse(format!("bad signature hex: {e}")))?;
        let partial_signature = zkp::MusigPartialSignature::from_slice(&sig_bytes)
            .map_err(|e| ExchangeError::InvalidResponse(format!("bad signature: {e}")))?;
        Ok(CounterpartySignature {
            pub_nonce,
            partial_signature,
        })
    }
}

impl CooperativeSigner for ExchangeClient {
    /// Two-round MuSig2 with the exchange. A present preimage means we are
    /// claiming a reverse swap; otherwise we are refunding a submarine swap.
    fn counterparty_sign(
        &self,
        swap_id: &str,
        preimage: Option<[u8; 32]>,
        our_pub_nonce: &zkp::MusigPubNonce,
        tx_hex: &str,
        vin: usize,
    ) -> Result<CounterpartySignature, CooperativeSignError> {
        let (path, body) = match preimage {
            Some(preimage) => (
                format!("/v2/swap/{swap_id}/claim"),
                serde_json::json!({
                    "preimage": utill::to_hex(&preimage),
                    "pubNonce": utill::to_hex(&our_pub_nonce.serialize()),
                    "transaction": tx_hex,
                    "index": vin,
                }),
            ),
            None => (
                format!("/v2/swap/{swap_id}/refund"),
                serde_json::json!({
                    "pubNonce": utill::to_hex(&our_pub_nonce.serialize()),
                    "transaction": tx_hex,
                    "index": vin,
                }),
            ),
        };
        self.partial_signature(&path, body)
            .map_err(|e| CooperativeSignError(e.to_string()))
    }
}
