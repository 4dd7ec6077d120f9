//! Electrum backend: TCP/TLS connection with a headers subscription for the
//! block stream.

use std::{
    str::FromStr,
    sync::{
        atomic::{AtomicBool, Ordering::Relaxed},
        mpsc, Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use electrum_client::{Client, ElectrumApi};

use super::{BlockEpoch, ChainBackend, ChainError};
use crate::swap::Currency;
use crate::utill;

/// Keep-alive ping cadence.
const PING_INTERVAL: Duration = Duration::from_secs(60);

/// How often the header queue is drained.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Confirmation target used for fee estimates.
const FEE_TARGET: usize = 2;

/// An Electrum server as chain backend.
pub struct ElectrumBackend {
    currency: Currency,
    client: Mutex<Client>,
    tip_height: Mutex<u32>,
}

impl ElectrumBackend {
    /// Connect to `url`, e.g. `ssl://electrum.example.com:50002` or
    /// `tcp://127.0.0.1:50001`. The protocol handshake happens on connect.
    pub fn new(currency: Currency, url: &str) -> Result<Self, ChainError> {
        let client = Client::new(url)?;
        Ok(ElectrumBackend {
            currency,
            client: Mutex::new(client),
            tip_height: Mutex::new(0),
        })
    }

    fn client(&self) -> std::sync::MutexGuard<'_, Client> {
        self.client.lock().expect("electrum client poisoned")
    }
}

/// Electrum quotes fees in BTC/kvB; convert to sat/vB. A non-positive quote
/// means the server has no estimate.
fn fee_quote_to_sat_per_vb(btc_per_kvb: f64) -> Option<f64> {
    if btc_per_kvb <= 0.0 {
        return None;
    }
    Some(btc_per_kvb * 100_000_000.0 / 1_000.0)
}

impl ChainBackend for ElectrumBackend {
    fn estimate_fee(&self) -> Result<f64, ChainError> {
        let quote = self.client().estimate_fee(FEE_TARGET)?;
        fee_quote_to_sat_per_vb(quote).ok_or_else(|| {
            ChainError::MissingData(format!("no fee estimate for target {FEE_TARGET}"))
        })
    }

    fn block_height(&self) -> Result<u32, ChainError> {
        let cached = *self.tip_height.lock().expect("tip height poisoned");
        if cached != 0 {
            return Ok(cached);
        }
        let header = self.client().block_headers_subscribe()?;
        let height = header.height as u32;
        *self.tip_height.lock().expect("tip height poisoned") = height;
        Ok(height)
    }

    fn transaction_hex(&self, txid: &str) -> Result<String, ChainError> {
        let txid = bitcoin::Txid::from_str(txid)
            .map_err(|e| ChainError::InvalidResponse(format!("bad txid: {e}")))?;
        let raw = self.client().transaction_get_raw(&txid)?;
        Ok(utill::to_hex(&raw))
    }

    fn broadcast_transaction(&self, hex: &str) -> Result<String, ChainError> {
        let raw = utill::from_hex(hex)
            .map_err(|e| ChainError::InvalidResponse(format!("bad tx hex: {e}")))?;
        match self.client().transaction_broadcast_raw(&raw) {
            Ok(txid) => Ok(txid.to_string()),
            Err(electrum_client::Error::Protocol(e)) => {
                Err(ChainError::BroadcastRejected(e.to_string()))
            }
            Err(e) => Err(ChainError::Electrum(e)),
        }
    }

    fn register_block_listener(
        &self,
        epochs: mpsc::Sender<BlockEpoch>,
        stop: Arc<AtomicBool>,
    ) -> Result<(), ChainError> {
        let initial = {
            let client = self.client();
            client.block_headers_subscribe()?
        };
        let mut height = initial.height as u32;
        *self.tip_height.lock().expect("tip height poisoned") = height;
        epochs
            .send(BlockEpoch {
                currency: self.currency,
                height,
            })
            .ok();

        let mut last_ping = Instant::now();
        loop {
            if stop.load(Relaxed) {
                return Ok(());
            }

            if last_ping.elapsed() >= PING_INTERVAL {
                if let Err(e) = self.client().ping() {
                    log::error!("failed to ping electrum server: {}", e);
                    return Err(ChainError::Electrum(e));
                }
                last_ping = Instant::now();
            }

            while let Some(header) = self.client().block_headers_pop()? {
                let new_height = header.height as u32;
                if new_height > height {
                    height = new_height;
                    *self.tip_height.lock().expect("tip height poisoned") = height;
                    epochs
                        .send(BlockEpoch {
                            currency: self.currency,
                            height,
                        })
                        .ok();
                }
            }

            thread::sleep(POLL_INTERVAL);
        }
    }
}
