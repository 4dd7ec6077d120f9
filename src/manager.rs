//! Swap creation.
//!
//! Creation is all-or-nothing: keys and preimages are generated, the
//! exchange is asked to create the swap, and its response is verified —
//! script tree, lockup address, invoice commitment — before anything is
//! persisted and handed to the nursery. Any verification failure surfaces as
//! [`Error::InvalidServerResponse`] and leaves no trace in the database.

use std::sync::Arc;

use bitcoin::hashes::{sha256, Hash};
use bitcoin::key::rand::thread_rng;
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use chrono::Utc;

use crate::chain::Network;
use crate::database::Database;
use crate::error::Error;
use crate::exchange::types::{
    CreateReverseRequest, CreateSubmarineRequest, ReversePair, SubmarinePair,
};
use crate::exchange::ExchangeClient;
use crate::lightning::{invoice, LightningNode};
use crate::nursery::Nursery;
use crate::swap::tree::{SwapTree, TreeKind};
use crate::swap::txbuilder::generate_preimage;
use crate::swap::{Currency, Pair, ReverseSwap, Status, Swap, SwapState};
use crate::utill;
use crate::wallet::WalletRegistry;

/// Parameters for a new submarine swap.
#[derive(Debug, Clone)]
pub struct SubmarineRequest {
    /// (from, to) currency tuple; `from` is the chain being locked on.
    pub pair: Pair,
    /// Invoice the exchange should pay. When absent, a preimage is generated
    /// locally and its hash attached instead.
    pub invoice: Option<String>,
    /// Fixed refund destination; derived from the wallet when unset.
    pub refund_address: Option<String>,
    /// Wallet that funds the lockup.
    pub wallet: Option<String>,
    /// Marks swaps created by the autoswapper.
    pub is_auto: bool,
}

/// Parameters for a new reverse swap.
#[derive(Debug, Clone)]
pub struct ReverseRequest {
    /// (from, to) currency tuple; `to` is the chain being locked on.
    pub pair: Pair,
    /// Invoice amount in sat.
    pub amount_sat: u64,
    /// Payout destination; derived from the wallet when unset.
    pub claim_address: Option<String>,
    /// Claim the lockup while unconfirmed.
    pub accept_zero_conf: bool,
    /// Hand the invoice to the caller instead of paying it locally.
    pub external_pay: bool,
    /// Channel hints for the Lightning payment.
    pub chan_ids: Vec<u64>,
    /// Wallet the payout should land in (used to derive `claim_address`).
    pub wallet: Option<String>,
    /// Marks swaps created by the autoswapper.
    pub is_auto: bool,
}

/// Creates swaps and hands them to the nursery.
pub struct SwapManager {
    network: Network,
    exchange: Arc<ExchangeClient>,
    nursery: Arc<Nursery>,
    database: Arc<Database>,
    wallets: Arc<WalletRegistry>,
    lightning: Arc<dyn LightningNode>,
}

impl SwapManager {
    /// Wire up a manager over an already started nursery.
    pub fn new(
        network: Network,
        exchange: Arc<ExchangeClient>,
        nursery: Arc<Nursery>,
        database: Arc<Database>,
        wallets: Arc<WalletRegistry>,
        lightning: Arc<dyn LightningNode>,
    ) -> Self {
        SwapManager {
            network,
            exchange,
            nursery,
            database,
            wallets,
            lightning,
        }
    }

    /// Published fees and limits of a submarine pair.
    pub fn submarine_pair(&self, pair: Pair) -> Result<SubmarinePair, Error> {
        let pairs = self.exchange.submarine_pairs()?;
        pairs
            .get(pair.from.as_str())
            .and_then(|to| to.get(pair.to.as_str()))
            .cloned()
            .ok_or_else(|| Error::FailedPrecondition(format!("pair {pair} is not offered")))
    }

    /// Published fees and limits of a reverse pair.
    pub fn reverse_pair(&self, pair: Pair) -> Result<ReversePair, Error> {
        let pairs = self.exchange.reverse_pairs()?;
        pairs
            .get(pair.from.as_str())
            .and_then(|to| to.get(pair.to.as_str()))
            .cloned()
            .ok_or_else(|| Error::FailedPrecondition(format!("pair {pair} is not offered")))
    }

    /// Create a submarine swap: on-chain funds in, Lightning payment out.
    pub fn create_swap(&self, request: SubmarineRequest) -> Result<Swap, Error> {
        let chain = request.pair.from;

        // Exactly one of: the caller supplied an invoice, or we generate the
        // preimage and attach its hash.
        let (preimage, preimage_hash) = match &request.invoice {
            Some(bolt11) => {
                if invoice::is_expired(bolt11)? {
                    return Err(Error::InvalidInput("invoice is already expired".to_string()));
                }
                (None, invoice::payment_hash(bolt11)?)
            }
            None => {
                let preimage = generate_preimage();
                let hash = sha256::Hash::hash(&preimage).to_byte_array();
                (Some(preimage), hash)
            }
        };

        let secp = Secp256k1::new();
        let private_key = SecretKey::new(&mut thread_rng());
        let our_pubkey = PublicKey::from_secret_key(&secp, &private_key);

        let pair_info = self.submarine_pair(request.pair)?;

        let response = self.exchange.create_submarine_swap(&CreateSubmarineRequest {
            from: request.pair.from.as_str().to_string(),
            to: request.pair.to.as_str().to_string(),
            invoice: request.invoice.clone(),
            preimage_hash: preimage
                .as_ref()
                .map(|_| utill::to_hex(&preimage_hash)),
            refund_public_key: utill::to_hex(&our_pubkey.serialize()),
        })?;

        let exchange_pubkey = parse_pubkey(&response.claim_public_key)?;
        let tree = SwapTree::new(
            TreeKind::Submarine,
            &preimage_hash,
            exchange_pubkey,
            our_pubkey,
            response.timeout_block_height,
        );
        tree.check_leaves(
            &response.swap_tree.claim_leaf.output,
            &response.swap_tree.refund_leaf.output,
        )?;

        let blinding_key = self.check_lockup_address(
            &tree,
            chain,
            &response.address,
            response.blinding_key.as_deref(),
        )?;

        let swap = Swap {
            id: response.id,
            pair: request.pair,
            state: SwapState::Pending,
            error: None,
            status: Status::SwapCreated,
            private_key,
            preimage,
            preimage_hash,
            invoice: request.invoice,
            address: response.address,
            expected_amount: response.expected_amount,
            timeout_block_height: response.timeout_block_height,
            blinding_key,
            lockup_transaction_id: None,
            refund_transaction_id: None,
            refund_address: request.refund_address,
            is_auto: request.is_auto,
            service_fee_percent: pair_info.fees.percentage,
            service_fee: None,
            onchain_fee: Some(pair_info.fees.miner_fees),
            wallet: request.wallet,
            tree,
            created_at: Utc::now(),
        };

        self.database.insert_swap(&swap)?;
        log::info!(
            "created swap {} over {} for {} sat",
            swap.id,
            swap.pair,
            swap.expected_amount
        );
        self.nursery.register_swap(&swap)?;
        Ok(swap)
    }

    /// Create a reverse swap: Lightning payment in, on-chain funds out.
    pub fn create_reverse_swap(&self, request: ReverseRequest) -> Result<ReverseSwap, Error> {
        let chain = request.pair.to;

        let preimage = generate_preimage();
        let preimage_hash = sha256::Hash::hash(&preimage).to_byte_array();

        let secp = Secp256k1::new();
        let private_key = SecretKey::new(&mut thread_rng());
        let our_pubkey = PublicKey::from_secret_key(&secp, &private_key);

        let pair_info = self.reverse_pair(request.pair)?;

        let claim_address = match request.claim_address {
            Some(address) => {
                self.validate_address(&address, chain)?;
                address
            }
            None => {
                let wallet = request
                    .wallet
                    .as_ref()
                    .and_then(|name| self.wallets.get(name))
                    .or_else(|| self.wallets.get_for_currency(chain));
                match wallet {
                    Some(wallet) => wallet.new_address()?,
                    None if chain == Currency::Btc => self.lightning.new_address()?,
                    None => {
                        return Err(Error::FailedPrecondition(format!(
                            "no wallet available for {chain} payouts"
                        )))
                    }
                }
            }
        };

        let response = self.exchange.create_reverse_swap(&CreateReverseRequest {
            from: request.pair.from.as_str().to_string(),
            to: request.pair.to.as_str().to_string(),
            invoice_amount: request.amount_sat,
            preimage_hash: utill::to_hex(&preimage_hash),
            claim_public_key: utill::to_hex(&our_pubkey.serialize()),
        })?;

        // The hold invoice must commit to our preimage and the agreed
        // amount, otherwise paying it would hand the exchange free money.
        if !invoice::matches_preimage_hash(&response.invoice, &preimage_hash)? {
            return Err(Error::InvalidServerResponse(
                "invoice does not commit to our preimage hash".to_string(),
            ));
        }
        if let Some(amount) = invoice::amount_sat(&response.invoice)? {
            if amount != request.amount_sat {
                return Err(Error::InvalidServerResponse(format!(
                    "invoice is over {} sat, requested {} sat",
                    amount, request.amount_sat
                )));
            }
        }

        let exchange_pubkey = parse_pubkey(&response.refund_public_key)?;
        let tree = SwapTree::new(
            TreeKind::Reverse,
            &preimage_hash,
            our_pubkey,
            exchange_pubkey,
            response.timeout_block_height,
        );
        tree.check_leaves(
            &response.swap_tree.claim_leaf.output,
            &response.swap_tree.refund_leaf.output,
        )?;

        let blinding_key = self.check_lockup_address(
            &tree,
            chain,
            &response.lockup_address,
            response.blinding_key.as_deref(),
        )?;

        let swap = ReverseSwap {
            id: response.id,
            pair: request.pair,
            state: SwapState::Pending,
            error: None,
            status: Status::SwapCreated,
            private_key,
            preimage,
            preimage_hash,
            invoice: response.invoice,
            lockup_address: response.lockup_address,
            onchain_amount: response.onchain_amount,
            timeout_block_height: response.timeout_block_height,
            accept_zero_conf: request.accept_zero_conf,
            claim_address,
            claim_transaction_id: None,
            routing_fee_msat: None,
            external_pay: request.external_pay,
            chan_ids: request.chan_ids,
            blinding_key,
            is_auto: request.is_auto,
            service_fee_percent: pair_info.fees.percentage,
            service_fee: None,
            onchain_fee: None,
            tree,
            created_at: Utc::now(),
        };

        self.database.insert_reverse_swap(&swap)?;
        log::info!(
            "created reverse swap {} over {} for {} sat",
            swap.id,
            swap.pair,
            request.amount_sat
        );
        self.nursery.register_reverse_swap(&swap)?;
        Ok(swap)
    }

    /// Verify the lockup address reproduces from the tree, returning the
    /// parsed blinding key for Liquid lockups.
    fn check_lockup_address(
        &self,
        tree: &SwapTree,
        chain: Currency,
        address: &str,
        blinding_key_hex: Option<&str>,
    ) -> Result<Option<SecretKey>, Error> {
        match chain {
            Currency::Btc => {
                tree.check_btc_address(address, self.network.btc)?;
                Ok(None)
            }
            Currency::Lbtc => {
                let blinding_hex = blinding_key_hex.ok_or_else(|| {
                    Error::InvalidServerResponse(
                        "no blinding key for a Liquid lockup".to_string(),
                    )
                })?;
                let blinding_bytes = utill::from_hex(blinding_hex).map_err(|e| {
                    Error::InvalidServerResponse(format!("bad blinding key hex: {e}"))
                })?;
                let blinding_key = SecretKey::from_slice(&blinding_bytes).map_err(|e| {
                    Error::InvalidServerResponse(format!("bad blinding key: {e}"))
                })?;
                let secp = Secp256k1::new();
                let blinding_pub = crate::swap::musig::to_zkp_pubkey(
                    PublicKey::from_secret_key(&secp, &blinding_key),
                );
                tree.check_lbtc_address(
                    address,
                    self.network.lbtc.address_params,
                    Some(blinding_pub),
                )?;
                Ok(Some(blinding_key))
            }
        }
    }

    fn validate_address(&self, address: &str, chain: Currency) -> Result<(), Error> {
        match chain {
            Currency::Btc => {
                crate::nursery::parse_btc_address(address, self.network.btc)?;
            }
            Currency::Lbtc => {
                crate::nursery::parse_lbtc_address(address)?;
            }
        }
        Ok(())
    }

    /// Current fee rate of a chain, in sat/vB.
    pub fn fee_rate(&self, currency: Currency) -> Result<f64, Error> {
        Ok(self.nursery.backend(currency)?.estimate_fee()?)
    }

    /// Point query of a submarine swap.
    pub fn swap(&self, id: &str) -> Result<Swap, Error> {
        self.database
            .query_swap(id)?
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    /// Point query of a reverse swap.
    pub fn reverse_swap(&self, id: &str) -> Result<ReverseSwap, Error> {
        self.database
            .query_reverse_swap(id)?
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }
}

fn parse_pubkey(hex: &str) -> Result<PublicKey, Error> {
    let bytes = utill::from_hex(hex)
        .map_err(|e| Error::InvalidServerResponse(format!("bad public key hex: {e}")))?;
    PublicKey::from_slice(&bytes)
        .map_err(|e| Error::InvalidServerResponse(format!("bad public key: {e}")))
}
