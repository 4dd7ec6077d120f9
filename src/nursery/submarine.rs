//! Submarine swap handlers: status-driven settlement and the block-driven
//! refund path.

use std::str::FromStr;
use std::sync::Arc;

use bitcoin::hashes::{sha256, Hash};

use super::Nursery;
use crate::error::Error;
use crate::exchange::types::StatusUpdate;
use crate::lightning::{invoice, InvoiceState, LightningError};
use crate::swap::musig::KeypathSession;
use crate::swap::txbuilder::{BtcSwapTx, LBtcSwapTx};
use crate::swap::{Currency, Status, Swap, SwapState};
use crate::utill;

impl Nursery {
    /// Process one exchange status update for a submarine swap. The caller
    /// holds the swap's lock.
    pub(crate) fn handle_swap_status(self: &Arc<Self>, update: &StatusUpdate) {
        let swap = match self.database.query_swap(&update.id) {
            Ok(Some(swap)) => swap,
            Ok(None) => {
                log::warn!("status update for unknown swap {}", update.id);
                return;
            }
            Err(e) => {
                log::error!("could not load swap {}: {}", update.id, e);
                return;
            }
        };
        if swap.state.is_terminal() {
            log::debug!("ignoring status for settled swap {}", swap.id);
            return;
        }
        let status = Status::parse(&update.status);
        if swap.refund_transaction_id.is_some() && status.is_failed() {
            // The exchange lost the race against our refund broadcast.
            log::debug!("ignoring late terminal status for refunded swap {}", swap.id);
            return;
        }

        match &status {
            Status::TransactionMempool | Status::TransactionConfirmed => {
                if let Some(transaction) = &update.transaction {
                    if let Err(e) = self
                        .database
                        .set_swap_lockup_transaction_id(&swap.id, &transaction.id)
                    {
                        log::error!(
                            "could not record lockup of swap {}: {}",
                            swap.id,
                            e
                        );
                    }
                }
            }
            Status::TransactionClaimPending => {
                if let Err(e) = self.cooperative_claim(&swap) {
                    log::warn!(
                        "cooperative claim signature for swap {} failed: {}",
                        swap.id,
                        e
                    );
                }
            }
            Status::TransactionClaimed => {
                match self.verify_invoice_settled(&swap) {
                    Ok(true) => {
                        if let Err(e) = self.settle_swap(&swap) {
                            log::error!("could not settle swap {}: {}", swap.id, e);
                        }
                    }
                    Ok(false) => {
                        log::warn!(
                            "swap {} was not actually settled, refunding at block {}",
                            swap.id,
                            swap.timeout_block_height
                        );
                        return;
                    }
                    Err(e) => {
                        log::warn!(
                            "could not verify invoice of swap {}: {}",
                            swap.id,
                            e
                        );
                        return;
                    }
                }
            }
            status if status.is_failed() => {
                let reason = update
                    .failure_reason
                    .clone()
                    .unwrap_or_else(|| status.to_string());
                if swap.lockup_transaction_id.is_some() {
                    // Funds are locked; keep the swap pending so the block
                    // path refunds it once the timeout matures.
                    log::warn!(
                        "swap {} failed ({}), refund due at block {}",
                        swap.id,
                        reason,
                        swap.timeout_block_height
                    );
                    if let Err(e) = self.database.set_swap_state(
                        &swap.id,
                        SwapState::Pending,
                        Some(&reason),
                    ) {
                        log::error!("could not record error of swap {}: {}", swap.id, e);
                    }
                } else if let Err(e) =
                    self.database
                        .set_swap_state(&swap.id, SwapState::Error, Some(&reason))
                {
                    log::error!("could not fail swap {}: {}", swap.id, e);
                }
            }
            _ => {}
        }

        if let Err(e) = self.database.update_swap_status(&swap.id, &status) {
            log::error!("could not update status of swap {}: {}", swap.id, e);
        }
        self.publish_swap_by_id(&swap.id);
    }

    /// Verify that the swap's invoice was settled on the attached node. An
    /// invoice the node does not know is someone else's problem and trusted
    /// to the exchange.
    fn verify_invoice_settled(&self, swap: &Swap) -> Result<bool, Error> {
        if swap.invoice.is_none() {
            return Ok(true);
        }
        match self.lightning.lookup_invoice(&swap.preimage_hash) {
            Ok(InvoiceState::Settled) => Ok(true),
            Ok(_) => Ok(false),
            Err(LightningError::NotFound) => Ok(true),
            Err(e) => Err(e.into()),
        }
    }

    /// Final fee accounting and the transition to `SUCCESSFUL`. The service
    /// fee is what remains of the expected amount after the invoice and the
    /// miner fee quoted at creation.
    fn settle_swap(&self, swap: &Swap) -> Result<(), Error> {
        let invoice_amount = match &swap.invoice {
            Some(bolt11) => invoice::amount_sat(bolt11)?.unwrap_or(0),
            None => 0,
        };
        let onchain_fee = swap.onchain_fee.unwrap_or(0);
        let service_fee = swap
            .expected_amount
            .saturating_sub(invoice_amount)
            .saturating_sub(onchain_fee);

        self.database
            .set_swap_fees(&swap.id, service_fee, onchain_fee)?;
        self.database
            .set_swap_state(&swap.id, SwapState::Successful, None)?;
        log::info!("swap {} succeeded", swap.id);
        Ok(())
    }

    /// Contribute our MuSig2 partial signature to the exchange's cooperative
    /// claim, after checking its revealed preimage against the swap.
    fn cooperative_claim(&self, swap: &Swap) -> Result<(), Error> {
        let details = self.exchange.submarine_claim_details(&swap.id)?;

        let preimage = utill::from_hex(&details.preimage)
            .map_err(|e| Error::InvalidServerResponse(format!("bad preimage hex: {e}")))?;
        let preimage_hash = sha256::Hash::hash(&preimage).to_byte_array();
        if preimage_hash != swap.preimage_hash {
            return Err(Error::InvalidServerResponse(
                "exchange presented a preimage that does not match the swap".to_string(),
            ));
        }

        let sighash: [u8; 32] = utill::from_hex(&details.transaction_hash)
            .map_err(|e| Error::InvalidServerResponse(format!("bad sighash hex: {e}")))?
            .try_into()
            .map_err(|_| Error::InvalidServerResponse("sighash must be 32 bytes".to_string()))?;

        let their_nonce_bytes = utill::from_hex(&details.pub_nonce)
            .map_err(|e| Error::InvalidServerResponse(format!("bad nonce hex: {e}")))?;
        let their_nonce =
            elements::secp256k1_zkp::MusigPubNonce::from_slice(&their_nonce_bytes)
                .map_err(|e| Error::InvalidServerResponse(format!("bad nonce: {e}")))?;

        let tweak = match swap.chain_currency() {
            Currency::Btc => swap.tree.btc_spend_info()?.tap_tweak().to_byte_array(),
            Currency::Lbtc => swap.tree.lbtc_spend_info()?.tap_tweak().to_byte_array(),
        };

        let session = KeypathSession::new(
            swap.tree.claim_pubkey,
            swap.tree.refund_pubkey,
            tweak,
            sighash,
        )?;
        let (partial, our_nonce) = session.partial_sign_only(&swap.private_key, their_nonce)?;
        self.exchange
            .send_submarine_claim_signature(&swap.id, &our_nonce, &partial)?;

        log::info!("sent cooperative claim signature for swap {}", swap.id);
        Ok(())
    }

    /// Build, sign and broadcast the refund of a timed-out swap. The caller
    /// holds the swap's lock; failures are retried on the next block.
    pub(crate) fn try_refund(
        self: &Arc<Self>,
        swap: &Swap,
        current_height: u32,
        manual: bool,
    ) -> Result<(), Error> {
        if swap.state.is_terminal() {
            return Err(Error::FailedPrecondition(format!(
                "swap {} is already {}",
                swap.id, swap.state
            )));
        }
        if swap.refund_transaction_id.is_some() {
            return Err(Error::FailedPrecondition(format!(
                "swap {} already has a refund transaction",
                swap.id
            )));
        }
        let Some(lockup_txid) = &swap.lockup_transaction_id else {
            return Err(Error::FailedPrecondition(format!(
                "swap {} has no lockup transaction",
                swap.id
            )));
        };
        if !manual && current_height < swap.timeout_block_height {
            return Err(Error::FailedPrecondition(format!(
                "swap {} times out at {}, current height {}",
                swap.id, swap.timeout_block_height, current_height
            )));
        }

        let currency = swap.chain_currency();
        let refund_address = self.resolve_refund_address(swap, currency)?;
        log::info!("refunding swap {} to {}", swap.id, refund_address);

        let lockup_hex = self.fetch_transaction_hex(currency, lockup_txid)?;
        let lockup_bytes = utill::from_hex(&lockup_hex)
            .map_err(|e| Error::InvalidServerResponse(format!("bad lockup hex: {e}")))?;
        let fee_rate = self.backend(currency)?.estimate_fee()?;

        let (raw_tx, _txid) = match currency {
            Currency::Btc => {
                let lockup_tx: bitcoin::Transaction =
                    bitcoin::consensus::encode::deserialize(&lockup_bytes).map_err(|e| {
                        Error::InvalidServerResponse(format!("bad lockup transaction: {e}"))
                    })?;
                let lockup_address = parse_btc_address(&swap.address, self.network.btc)?;
                let destination = parse_btc_address(&refund_address, self.network.btc)?;
                let spend = BtcSwapTx::new_refund(
                    swap.tree.clone(),
                    lockup_tx,
                    &lockup_address,
                    destination,
                )?;
                let tx = spend.sign_refund(&swap.private_key, fee_rate)?;
                (
                    bitcoin::consensus::encode::serialize_hex(&tx),
                    tx.compute_txid().to_string(),
                )
            }
            Currency::Lbtc => {
                let lockup_tx: elements::Transaction =
                    elements::encode::deserialize(&lockup_bytes).map_err(|e| {
                        Error::InvalidServerResponse(format!("bad lockup transaction: {e}"))
                    })?;
                let lockup_address = parse_lbtc_address(&swap.address)?;
                let destination = parse_lbtc_address(&refund_address)?;
                let blinding_key = swap.blinding_key.ok_or_else(|| {
                    Error::FailedPrecondition(format!(
                        "swap {} has no blinding key",
                        swap.id
                    ))
                })?;
                let spend = LBtcSwapTx::new_refund(
                    swap.tree.clone(),
                    lockup_tx,
                    &lockup_address,
                    destination,
                    blinding_key,
                    self.network.lbtc.genesis_hash,
                )?;
                let tx = spend.sign_refund(&swap.private_key, fee_rate)?;
                (
                    utill::to_hex(&elements::encode::serialize(&tx)),
                    tx.txid().to_string(),
                )
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
                        .set_swap_state(&swap.id, state, Some(&message))
                {
                    log::error!("could not record refund failure: {}", db_err);
                }
                self.publish_swap_by_id(&swap.id);
                return Err(e);
            }
        };

        log::info!("broadcast refund transaction of swap {}: {}", swap.id, txid);
        self.database
            .set_swap_refund_transaction_id(&swap.id, &txid)?;
        self.database
            .update_swap_status(&swap.id, &Status::TransactionRefunded)?;
        self.database
            .set_swap_state(&swap.id, SwapState::Refunded, None)?;
        self.publish_swap_by_id(&swap.id);
        Ok(())
    }

    fn resolve_refund_address(
        &self,
        swap: &Swap,
        currency: Currency,
    ) -> Result<String, Error> {
        if let Some(address) = &swap.refund_address {
            return Ok(address.clone());
        }

        let address = match swap
            .wallet
            .as_ref()
            .and_then(|name| self.wallets.get(name))
            .or_else(|| self.wallets.get_for_currency(currency))
        {
            Some(wallet) => wallet.new_address()?,
            None if currency == Currency::Btc => self.lightning.new_address()?,
            None => {
                return Err(Error::FailedPrecondition(format!(
                    "no wallet available for {currency} refunds"
                )))
            }
        };
        self.database
            .set_swap_refund_address(&swap.id, &address)?;
        Ok(address)
    }
}

pub(crate) fn parse_btc_address(
    address: &str,
    network: bitcoin::Network,
) -> Result<bitcoin::Address, Error> {
    bitcoin::Address::from_str(address)
        .map_err(|e| Error::InvalidInput(format!("bad address {address}: {e}")))?
        .require_network(network)
        .map_err(|e| Error::InvalidInput(format!("address {address} on wrong network: {e}")))
}

pub(crate) fn parse_lbtc_address(address: &str) -> Result<elements::Address, Error> {
    elements::Address::from_str(address)
        .map_err(|e| Error::InvalidInput(format!("bad address {address}: {e}")))
}
