//! Block explorer backend: REST for fees, transactions and the tip height,
//! WebSocket for the block stream.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering::Relaxed},
        mpsc, Arc,
    },
    time::{Duration, Instant},
};

use serde::Deserialize;
use tungstenite::Message;

use super::{BlockEpoch, ChainBackend, ChainError};
use crate::swap::Currency;
use crate::utill::{self, HTTP_TIMEOUT_SECS};

/// Keep-alive ping cadence on the block stream.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Read timeout on the block stream; doubles as the stop poll interval.
const READ_TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Deserialize)]
struct FeeRecommendation {
    #[serde(rename = "fastestFee")]
    #[allow(dead_code)]
    fastest_fee: f64,
    #[serde(rename = "halfHourFee")]
    half_hour_fee: f64,
    #[serde(rename = "hourFee")]
    #[allow(dead_code)]
    hour_fee: f64,
}

#[derive(Debug, Deserialize, Default)]
struct BlockMessage {
    #[serde(default)]
    block: Option<BlockInfo>,
}

#[derive(Debug, Deserialize)]
struct BlockInfo {
    height: u32,
}

/// Client for a mempool-style explorer instance.
pub struct MempoolClient {
    currency: Currency,
    api: String,
    api_v1: String,
}

impl MempoolClient {
    /// Create a client. `endpoint` is the explorer's API base, with or
    /// without the `/v1` suffix.
    pub fn new(currency: Currency, endpoint: &str) -> Self {
        let stripped = endpoint.trim_end_matches('/');
        let api = stripped.trim_end_matches("/v1").to_string();
        let api_v1 = format!("{api}/v1");
        MempoolClient {
            currency,
            api,
            api_v1,
        }
    }

    fn fee_recommendation(&self) -> Result<FeeRecommendation, ChainError> {
        let response = minreq::get(format!("{}/fees/recommended", self.api_v1))
            .with_timeout(HTTP_TIMEOUT_SECS)
            .send()?;
        if response.status_code != 200 {
            return Err(ChainError::InvalidResponse(format!(
                "fee recommendation failed with status {}",
                response.status_code
            )));
        }
        response
            .json::<FeeRecommendation>()
            .map_err(ChainError::Http)
    }

    fn ws_url(&self) -> String {
        let base = if let Some(rest) = self.api_v1.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.api_v1.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            self.api_v1.clone()
        };
        format!("{base}/ws")
    }
}

impl ChainBackend for MempoolClient {
    fn estimate_fee(&self) -> Result<f64, ChainError> {
        Ok(self.fee_recommendation()?.half_hour_fee)
    }

    fn block_height(&self) -> Result<u32, ChainError> {
        let response = minreq::get(format!("{}/blocks/tip/height", self.api))
            .with_timeout(HTTP_TIMEOUT_SECS)
            .send()?;
        if response.status_code != 200 {
            return Err(ChainError::InvalidResponse(format!(
                "tip height failed with status {}",
                response.status_code
            )));
        }
        let raw = response
            .as_str()
            .map_err(|e| ChainError::InvalidResponse(e.to_string()))?;
        raw.trim()
            .parse::<u32>()
            .map_err(|e| ChainError::InvalidResponse(format!("bad tip height: {e}")))
    }

    fn transaction_hex(&self, txid: &str) -> Result<String, ChainError> {
        let response = minreq::get(format!("{}/tx/{txid}/hex", self.api))
            .with_timeout(HTTP_TIMEOUT_SECS)
            .send()?;
        if response.status_code != 200 {
            return Err(ChainError::MissingData(format!(
                "could not get tx {txid}, status {}",
                response.status_code
            )));
        }
        Ok(response
            .as_str()
            .map_err(|e| ChainError::InvalidResponse(e.to_string()))?
            .trim()
            .to_string())
    }

    fn broadcast_transaction(&self, hex: &str) -> Result<String, ChainError> {
        let response = minreq::post(format!("{}/tx", self.api))
            .with_timeout(HTTP_TIMEOUT_SECS)
            .with_body(hex)
            .send()?;
        let body = response
            .as_str()
            .map_err(|e| ChainError::InvalidResponse(e.to_string()))?
            .trim()
            .to_string();
        if response.status_code != 200 {
            return Err(ChainError::BroadcastRejected(body));
        }
        Ok(body)
    }

    fn register_block_listener(
        &self,
        epochs: mpsc::Sender<BlockEpoch>,
        stop: Arc<AtomicBool>,
    ) -> Result<(), ChainError> {
        let url = self.ws_url();
        log::info!("connecting to explorer block stream: {}", url);

        let (mut socket, _) = tungstenite::connect(&url)?;
        utill::set_websocket_read_timeout(socket.get_ref(), READ_TICK)
            .map_err(|e| ChainError::InvalidResponse(format!("set read timeout: {e}")))?;

        socket.write(Message::Text(r#"{"action":"init"}"#.to_string()))?;
        socket.write(Message::Text(
            r#"{"action":"want","data":["blocks"]}"#.to_string(),
        ))?;
        socket.flush()?;

        let mut last_ping = Instant::now();
        loop {
            if stop.load(Relaxed) {
                socket.close(None).ok();
                return Ok(());
            }

            if last_ping.elapsed() >= PING_INTERVAL {
                socket.write(Message::Ping(Vec::new()))?;
                socket.flush()?;
                last_ping = Instant::now();
            }

            match socket.read() {
                Ok(Message::Text(text)) => {
                    self.handle_block_message(&text, &epochs);
                }
                Ok(Message::Ping(payload)) => {
                    socket.write(Message::Pong(payload)).ok();
                    socket.flush().ok();
                }
                Ok(Message::Close(_)) => {
                    return Err(ChainError::InvalidResponse(
                        "explorer closed the block stream".to_string(),
                    ));
                }
                Ok(_) => {}
                Err(e) if utill::is_websocket_timeout(&e) => {}
                Err(e) => return Err(ChainError::Ws(e)),
            }
        }
    }
}

impl MempoolClient {
    fn handle_block_message(&self, text: &str, epochs: &mpsc::Sender<BlockEpoch>) {
        let parsed: BlockMessage = match serde_json::from_str(text) {
            Ok(parsed) => parsed,
            Err(e) => {
                log::debug!("ignoring unparsable explorer message: {}", e);
                return;
            }
        };
        if let Some(block) = parsed.block {
            if block.height != 0 {
                epochs
                    .send(BlockEpoch {
                        currency: self.currency,
                        height: block.height,
                    })
                    .ok();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_normalization() {
        let client = MempoolClient::new(Currency::Btc, "https://mempool.example/api/v1/");
        assert_eq!(client.api, "https://mempool.example/api");
        assert_eq!(client.api_v1, "https://mempool.example/api/v1");

        let bare = MempoolClient::new(Currency::Btc, "https://mempool.example/api");
        assert_eq!(bare.api_v1, "https://mempool.example/api/v1");
    }

    #[test]
    fn test_ws_url() {
        let client = MempoolClient::new(Currency::Lbtc, "https://liquid.example/api");
        assert_eq!(client.ws_url(), "wss://liquid.example/api/v1/ws");
    }

    #[test]
    fn test_fee_recommendation_parsing() {
        let raw = r#"{"fastestFee": 32.0, "halfHourFee": 18.5, "hourFee": 12.0,
                      "economyFee": 6.0, "minimumFee": 1.0}"#;
        let fees: FeeRecommendation = serde_json::from_str(raw).unwrap();
        assert!((fees.half_hour_fee - 18.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_block_message_parsing() {
        let (tx, rx) = mpsc::channel();
        let client = MempoolClient::new(Currency::Btc, "https://mempool.example/api");

        client.handle_block_message(r#"{"block":{"height":812000}}"#, &tx);
        assert_eq!(
            rx.try_recv().unwrap(),
            BlockEpoch {
                currency: Currency::Btc,
                height: 812_000
            }
        );

        // Non-block chatter is ignored.
        client.handle_block_message(r#"{"mempoolInfo":{"size":123}}"#, &tx);
        client.handle_block_message("not json", &tx);
        assert!(rx.try_recv().is_err());
    }
}
