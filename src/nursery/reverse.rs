//! Reverse swap handlers: lockup verification, the claim path and
//! settlement.

use std::sync::Arc;

use super::submarine::{parse_btc_address, parse_lbtc_address};
use super::Nursery;
use crate::error::Error;
use crate::exchange::types::StatusUpdate;
use crate::lightning::invoice;
use crate::swap::txbuilder::{BtcSwapTx, LBtcSwapTx};
use crate::swap::{Currency, ReverseSwap, Status, SwapState};
use crate::utill;

impl Nursery {
    /// Process one exchange status update for a reverse swap. The caller
    /// holds the swap's lock.
    pub(crate) fn handle_reverse_status(self: &Arc<Self>, update: &StatusUpdate) {
        let swap = match self.database.query_reverse_swap(&update.id) {
            Ok(Some(swap)) => swap,
            Ok(None) => {
                log::warn!("status update for unknown reverse swap {}", update.id);
                return;
            }
            Err(e) => {
                log::error!("could not load reverse swap {}: {}", update.id, e);
                return;
            }
        };
        if swap.state.is_terminal() {
            log::debug!("ignoring status for settled reverse swap {}", swap.id);
            return;
        }
        let status = Status::parse(&update.status);

        match &status {
            Status::TransactionMempool => {
                let zero_conf_rejected = update.zero_conf_rejected.unwrap_or(false);
                if swap.accept_zero_conf && !zero_conf_rejected {
                    if let Err(e) = self.try_claim(&swap, lockup_hex_of(update)) {
                        log::error!(
                            "zero-conf claim of reverse swap {} failed: {}",
                            swap.id,
                            e
                        );
                    }
                } else {
                    // Verify the lockup now so a malformed one fails fast.
                    match self.verify_lockup(&swap, lockup_hex_of(update)) {
                        Ok(value) => log::info!(
                            "lockup of reverse swap {} seen in mempool ({} sat), waiting for confirmation",
                            swap.id,
                            value
                        ),
                        Err(e) => {
                            log::error!(
                                "lockup of reverse swap {} is unusable: {}",
                                swap.id,
                                e
                            );
                            self.fail_reverse_swap(&swap.id, &format!("bad lockup: {e}"));
                        }
                    }
                }
            }
            Status::TransactionConfirmed => {
                if let Err(e) = self.try_claim(&swap, lockup_hex_of(update)) {
                    log::error!("claim of reverse swap {} failed: {}", swap.id, e);
                }
            }
            Status::InvoiceSettled => {
                if let Err(e) = self.settle_reverse_swap(&swap) {
                    log::error!("could not settle reverse swap {}: {}", swap.id, e);
                }
            }
            status if status.is_failed() => {
                let reason = update
                    .failure_reason
                    .clone()
                    .unwrap_or_else(|| status.to_string());
                self.fail_reverse_swap(&swap.id, &reason);
            }
            _ => {}
        }

        if let Err(e) = self.database.update_reverse_swap_status(&swap.id, &status) {
            log::error!(
                "could not update status of reverse swap {}: {}",
                swap.id,
                e
            );
        }
        self.publish_reverse_by_id(&swap.id);
    }

    /// Check the lockup transaction pays the swap tree address at least the
    /// promised amount. Returns the locked value.
    fn verify_lockup(
        &self,
        swap: &ReverseSwap,
        lockup_hex: Option<String>,
    ) -> Result<u64, Error> {
        let (value, _) = self.prepare_claim(swap, lockup_hex)?;
        Ok(value)
    }

    /// Build the claim spend and verify the locked value in one pass.
    fn prepare_claim(
        &self,
        swap: &ReverseSwap,
        lockup_hex: Option<String>,
    ) -> Result<(u64, ClaimSpend), Error> {
        let currency = swap.chain_currency();
        let lockup_hex = match lockup_hex {
            Some(hex) => hex,
            None => {
                // No transaction in the update; ask the exchange which
                // transaction locked the funds.
                let status = self.exchange.swap_status(&swap.id)?;
                let info = status.transaction.ok_or_else(|| {
                    Error::FailedPrecondition(format!(
                        "reverse swap {} has no lockup transaction yet",
                        swap.id
                    ))
                })?;
                match info.hex {
                    Some(hex) => hex,
                    None => self.fetch_transaction_hex(currency, &info.id)?,
                }
            }
        };
        let lockup_bytes = utill::from_hex(&lockup_hex)
            .map_err(|e| Error::InvalidServerResponse(format!("bad lockup hex: {e}")))?;

        let spend = match currency {
            Currency::Btc => {
                let lockup_tx: bitcoin::Transaction =
                    bitcoin::consensus::encode::deserialize(&lockup_bytes).map_err(|e| {
                        Error::InvalidServerResponse(format!("bad lockup transaction: {e}"))
                    })?;
                let lockup_address = parse_btc_address(&swap.lockup_address, self.network.btc)?;
                let destination = parse_btc_address(&swap.claim_address, self.network.btc)?;
                ClaimSpend::Btc(BtcSwapTx::new_claim(
                    swap.tree.clone(),
                    lockup_tx,
                    &lockup_address,
                    destination,
                )?)
            }
            Currency::Lbtc => {
                let lockup_tx: elements::Transaction =
                    elements::encode::deserialize(&lockup_bytes).map_err(|e| {
                        Error::InvalidServerResponse(format!("bad lockup transaction: {e}"))
                    })?;
                let lockup_address = parse_lbtc_address(&swap.lockup_address)?;
                let destination = parse_lbtc_address(&swap.claim_address)?;
                let blinding_key = swap.blinding_key.ok_or_else(|| {
                    Error::FailedPrecondition(format!(
                        "reverse swap {} has no blinding key",
                        swap.id
                    ))
                })?;
                ClaimSpend::Lbtc(LBtcSwapTx::new_claim(
                    swap.tree.clone(),
                    lockup_tx,
                    &lockup_address,
                    destination,
                    blinding_key,
                    self.network.lbtc.genesis_hash,
                )?)
            }
        };

        let value = spend.lockup_value()?;
        if value < swap.onchain_amount {
            return Err(Error::InvalidServerResponse(format!(
                "lockup pays {} sat, expected at least {} sat",
                value, swap.onchain_amount
            )));
        }
        Ok((value, spend))
    }

    /// Build, sign and broadcast the claim. Idempotent: a swap that already
    /// has a claim transaction is left alone.
    pub(crate) fn try_claim(
        self: &Arc<Self>,
        swap: &ReverseSwap,
        lockup_hex: Option<String>,
    ) -> Result<(), Error> {
        if swap.state.is_terminal() {
            return Err(Error::FailedPrecondition(format!(
                "reverse swap {} is already {}",
                swap.id, swap.state
            )));
        }
        if swap.claim_transaction_id.is_some() {
            log::debug!("reverse swap {} is already claimed", swap.id);
            return Ok(());
        }

        let currency = swap.chain_currency();
        let (lockup_value, spend) = self.prepare_claim(swap, lockup_hex)?;
        let fee_rate = self.backend(currency)?.estimate_fee()?;

        let (raw_tx, onchain_fee) = match &spend {
            ClaimSpend::Btc(spend) => {
                let tx = spend.sign_claim(
                    &swap.private_key,
                    swap.preimage,
                    fee_rate,
                    Some((self.exchange.as_ref(), swap.id.as_str())),
                )?;
                let paid_out: u64 = tx.output.iter().map(|o| o.value.to_sat()).sum();
                (
                    bitcoin::consensus::encode::serialize_hex(&tx),
                    lockup_value.saturating_sub(paid_out),
                )
            }
            ClaimSpend::Lbtc(spend) => {
                let tx = spend.sign_claim(
                    &swap.private_key,
                    swap.preimage,
                    fee_rate,
                    Some((self.exchange.as_ref(), swap.id.as_str())),
                )?;
                let fee = tx
                    .output
                    .iter()
                    .find(|output| output.is_fee())
                    .and_then(|output| output.value.explicit())
                    .unwrap_or(0);
                (utill::to_hex(&elements::encode::serialize(&tx)), fee)
            }
        };

        let txid = match self.broadcast_with_retry(currency, &raw_tx) {
            Ok(txid) => txid,
            Err(e) => {
                let message = e.to_string();
                let state = match &e {
                    Error::BroadcastRejected(_) => SwapState::ServerError,
                    _ => SwapState::Pending,
                };
                if let Err(db_err) =
                    self.database
                        .set_reverse_swap_state(&swap.id, state, Some(&message))
                {
                    log::error!("could not record claim failure: {}", db_err);
                }
                self.publish_reverse_by_id(&swap.id);
                return Err(e);
            }
        };

        log::info!(
            "broadcast claim transaction of reverse swap {}: {}",
            swap.id,
            txid
        );
        self.database
            .set_reverse_swap_claim_transaction_id(&swap.id, &txid)?;
        self.database
            .set_reverse_swap_onchain_fee(&swap.id, onchain_fee)?;
        self.publish_reverse_by_id(&swap.id);
        Ok(())
    }

    /// Final fee accounting and the transition to `SUCCESSFUL`. The service
    /// fee is the spread between the invoice and the on-chain lockup.
    ///
    /// A settled invoice alone is not enough to succeed: the claim
    /// transaction must be persisted first. A crash between the claim
    /// broadcast and its database write, or a settled status recovered after
    /// a restart, lands here with no claim on record; in that case the claim
    /// is driven to completion (with a fresh lockup lookup) before the state
    /// transition.
    pub(crate) fn settle_reverse_swap(
        self: &Arc<Self>,
        swap: &ReverseSwap,
    ) -> Result<(), Error> {
        let swap = if swap.claim_transaction_id.is_none() {
            log::warn!(
                "invoice of reverse swap {} settled without a recorded claim, claiming now",
                swap.id
            );
            self.try_claim(swap, None)?;
            self.database
                .query_reverse_swap(&swap.id)?
                .ok_or_else(|| Error::NotFound(swap.id.clone()))?
        } else {
            swap.clone()
        };
        if swap.claim_transaction_id.is_none() {
            return Err(Error::FailedPrecondition(format!(
                "reverse swap {} settled its invoice but has no claim transaction",
                swap.id
            )));
        }

        let invoice_amount =
            invoice::amount_sat(&swap.invoice)?.unwrap_or(swap.onchain_amount);
        let service_fee = invoice_amount.saturating_sub(swap.onchain_amount);
        let onchain_fee = swap.onchain_fee.unwrap_or(0);

        self.database
            .set_reverse_swap_fees(&swap.id, service_fee, onchain_fee)?;
        self.database
            .set_reverse_swap_state(&swap.id, SwapState::Successful, None)?;
        log::info!("reverse swap {} succeeded", swap.id);
        Ok(())
    }
}

enum ClaimSpend {
    Btc(BtcSwapTx),
    Lbtc(LBtcSwapTx),
}

impl ClaimSpend {
    fn lockup_value(&self) -> Result<u64, Error> {
        match self {
            ClaimSpend::Btc(spend) => Ok(spend.lockup_value()),
            ClaimSpend::Lbtc(spend) => Ok(spend.lockup_value()?),
        }
    }
}

fn lockup_hex_of(update: &StatusUpdate) -> Option<String> {
    update
        .transaction
        .as_ref()
        .and_then(|transaction| transaction.hex.clone())
}
