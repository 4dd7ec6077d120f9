//! Claim and refund transaction construction.
//!
//! Builders here are pure: they take a fetched lockup transaction and key
//! material and return a signed, consensus-serializable transaction.
//! Broadcasting is the nursery's job. Each spend is single-input,
//! single-output; the fee is measured from a signed dry run and subtracted
//! from the lockup value.
//!
//! Claims prefer the cooperative MuSig2 key path when a counterparty signer
//! is supplied and fall back to the script path; refunds always use the
//! script path since the counterparty has no reason to cooperate.

use bitcoin::hashes::Hash;
use bitcoin::key::rand::{rngs::OsRng, thread_rng, RngCore};
use bitcoin::secp256k1::{Keypair, Message, Secp256k1, SecretKey};
use bitcoin::sighash::{Prevouts, SighashCache};
use bitcoin::taproot::LeafVersion;
use bitcoin::transaction::Version;
use bitcoin::{
    Address, Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness,
};
use elements::confidential::{Asset, AssetBlindingFactor, Value, ValueBlindingFactor};
use elements::secp256k1_zkp as zkp;

use super::error::TxBuildError;
use super::musig::KeypathSession;
use super::tree::SwapTree;
use crate::utill;

/// Outputs below this value are rejected rather than broadcast.
pub const DUST_LIMIT: u64 = 546;

/// Fee used for the sizing dry run before the real fee is known.
const DUMMY_FEE: u64 = 5_000;

/// Whether a spend follows the preimage or the timeout branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxKind {
    /// Preimage branch.
    Claim,
    /// Timeout branch.
    Refund,
}

/// Counterparty contribution to a cooperative key-path spend.
pub struct CounterpartySignature {
    /// The counterparty's public nonce.
    pub pub_nonce: zkp::MusigPubNonce,
    /// The counterparty's partial signature.
    pub partial_signature: zkp::MusigPartialSignature,
}

/// Error from a cooperative signing round trip.
#[derive(Debug)]
pub struct CooperativeSignError(
    /// Human-readable reason.
    pub String,
);

impl std::fmt::Display for CooperativeSignError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Seam for the two-round MuSig2 exchange with the counterparty. Implemented
/// by the exchange client; injected so the builder itself stays free of I/O.
pub trait CooperativeSigner {
    /// Hand the counterparty our nonce and the unsigned spend, and get its
    /// nonce and partial signature back.
    fn counterparty_sign(
        &self,
        swap_id: &str,
        preimage: Option<[u8; 32]>,
        our_pub_nonce: &zkp::MusigPubNonce,
        tx_hex: &str,
        vin: usize,
    ) -> Result<CounterpartySignature, CooperativeSignError>;
}

/// Locate the lockup vout: the first output whose script pays the lockup
/// address.
pub fn find_lockup_vout_btc(
    tx: &Transaction,
    lockup_address: &Address,
) -> Result<(u32, TxOut), TxBuildError> {
    let script_pubkey = lockup_address.script_pubkey();
    for (vout, output) in tx.output.iter().enumerate() {
        if output.script_pubkey == script_pubkey {
            return Ok((vout as u32, output.clone()));
        }
    }
    Err(TxBuildError::LockupVoutNotFound)
}

/// Liquid variant of the lockup vout search. Confidential lockup addresses
/// share the script pubkey of their unconfidential form.
pub fn find_lockup_vout_lbtc(
    tx: &elements::Transaction,
    lockup_address: &elements::Address,
) -> Result<(u32, elements::TxOut), TxBuildError> {
    let script_pubkey = lockup_address.script_pubkey();
    for (vout, output) in tx.output.iter().enumerate() {
        if output.script_pubkey == script_pubkey {
            return Ok((vout as u32, output.clone()));
        }
    }
    Err(TxBuildError::LockupVoutNotFound)
}

/// A mainchain Bitcoin claim or refund in the making.
pub struct BtcSwapTx {
    /// Claim or refund.
    pub kind: TxKind,
    /// The swap's script tree.
    pub tree: SwapTree,
    /// Lockup transaction being spent.
    pub lockup_tx: Transaction,
    /// Index of the lockup output.
    pub vout: u32,
    /// The lockup output itself.
    pub prevout: TxOut,
    /// Where the spend pays to.
    pub destination: Address,
}

impl BtcSwapTx {
    /// Prepare a claim spend of the lockup output.
    pub fn new_claim(
        tree: SwapTree,
        lockup_tx: Transaction,
        lockup_address: &Address,
        destination: Address,
    ) -> Result<Self, TxBuildError> {
        let (vout, prevout) = find_lockup_vout_btc(&lockup_tx, lockup_address)?;
        Ok(BtcSwapTx {
            kind: TxKind::Claim,
            tree,
            lockup_tx,
            vout,
            prevout,
            destination,
        })
    }

    /// Prepare a refund spend of the lockup output.
    pub fn new_refund(
        tree: SwapTree,
        lockup_tx: Transaction,
        lockup_address: &Address,
        destination: Address,
    ) -> Result<Self, TxBuildError> {
        let (vout, prevout) = find_lockup_vout_btc(&lockup_tx, lockup_address)?;
        Ok(BtcSwapTx {
            kind: TxKind::Refund,
            tree,
            lockup_tx,
            vout,
            prevout,
            destination,
        })
    }

    /// Value locked in the output being spent, in sat.
    pub fn lockup_value(&self) -> u64 {
        self.prevout.value.to_sat()
    }

    fn unsigned_tx(&self, fee: Amount) -> Result<Transaction, TxBuildError> {
        let available = self.prevout.value;
        if available <= fee || (available - fee).to_sat() < DUST_LIMIT {
            return Err(TxBuildError::AmountTooSmall { available, fee });
        }

        let (lock_time, sequence) = match self.kind {
            TxKind::Claim => (bitcoin::absolute::LockTime::ZERO, Sequence::ENABLE_RBF_NO_LOCKTIME),
            TxKind::Refund => (
                bitcoin::absolute::LockTime::from_consensus(self.tree.timeout_block_height),
                Sequence::ENABLE_LOCKTIME_NO_RBF,
            ),
        };

        Ok(Transaction {
            version: Version::TWO,
            lock_time,
            input: vec![TxIn {
                previous_output: OutPoint {
                    txid: self.lockup_tx.compute_txid(),
                    vout: self.vout,
                },
                script_sig: ScriptBuf::new(),
                sequence,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                script_pubkey: self.destination.script_pubkey(),
                value: available - fee,
            }],
        })
    }

    /// Sign the claim. With a cooperative signer the spend uses the MuSig2
    /// key path; any cooperation failure falls back to the script path.
    pub fn sign_claim(
        &self,
        our_secret: &SecretKey,
        preimage: [u8; 32],
        fee_rate: f64,
        cooperative: Option<(&dyn CooperativeSigner, &str)>,
    ) -> Result<Transaction, TxBuildError> {
        let fee = self.measure_fee(our_secret, Some(preimage), fee_rate)?;

        if let Some((signer, swap_id)) = cooperative {
            match self.sign_claim_keypath(our_secret, preimage, fee, signer, swap_id) {
                Ok(tx) => return Ok(tx),
                Err(e) => {
                    log::warn!(
                        "cooperative claim for {} failed, falling back to script path: {:?}",
                        swap_id,
                        e
                    );
                }
            }
        }

        self.sign_script_path(our_secret, Some(preimage), fee)
    }

    /// Sign the refund through the script path.
    pub fn sign_refund(
        &self,
        our_secret: &SecretKey,
        fee_rate: f64,
    ) -> Result<Transaction, TxBuildError> {
        let fee = self.measure_fee(our_secret, None, fee_rate)?;
        self.sign_script_path(our_secret, None, fee)
    }

    /// Fee for this spend: sign a dry run at a placeholder fee, measure its
    /// vsize, and price it at `fee_rate` sat/vB.
    fn measure_fee(
        &self,
        our_secret: &SecretKey,
        preimage: Option<[u8; 32]>,
        fee_rate: f64,
    ) -> Result<Amount, TxBuildError> {
        let draft = self.sign_script_path(our_secret, preimage, Amount::from_sat(DUMMY_FEE))?;
        let fee = (draft.vsize() as f64 * fee_rate).ceil() as u64;
        Ok(Amount::from_sat(fee.max(1)))
    }

    fn sign_script_path(
        &self,
        our_secret: &SecretKey,
        preimage: Option<[u8; 32]>,
        fee: Amount,
    ) -> Result<Transaction, TxBuildError> {
        let secp = Secp256k1::new();
        let mut tx = self.unsigned_tx(fee)?;

        let leaf_script = match self.kind {
            TxKind::Claim => self.tree.claim_script(),
            TxKind::Refund => self.tree.refund_script(),
        };
        let leaf_hash =
            bitcoin::taproot::TapLeafHash::from_script(&leaf_script, LeafVersion::TapScript);

        let prevouts = [self.prevout.clone()];
        let sighash = SighashCache::new(&tx).taproot_script_spend_signature_hash(
            0,
            &Prevouts::All(&prevouts),
            leaf_hash,
            bitcoin::TapSighashType::Default,
        )?;

        let keypair = Keypair::from_secret_key(&secp, our_secret);
        let msg = Message::from(sighash);
        let signature = secp.sign_schnorr(&msg, &keypair);
        let signature = bitcoin::taproot::Signature {
            signature,
            sighash_type: bitcoin::TapSighashType::Default,
        };

        let spend_info = self.tree.btc_spend_info()?;
        let control_block = spend_info
            .control_block(&(leaf_script.clone(), LeafVersion::TapScript))
            .ok_or_else(|| {
                TxBuildError::Tree(super::error::TreeError::Taproot(
                    "no control block for leaf".to_string(),
                ))
            })?;

        let mut witness = Witness::new();
        witness.push(signature.to_vec());
        if let Some(preimage) = preimage {
            witness.push(preimage.to_vec());
        }
        witness.push(leaf_script.as_bytes());
        witness.push(control_block.serialize());
        tx.input[0].witness = witness;

        Ok(tx)
    }

    fn sign_claim_keypath(
        &self,
        our_secret: &SecretKey,
        preimage: [u8; 32],
        fee: Amount,
        signer: &dyn CooperativeSigner,
        swap_id: &str,
    ) -> Result<Transaction, TxBuildError> {
        let mut tx = self.unsigned_tx(fee)?;

        let prevouts = [self.prevout.clone()];
        let sighash = SighashCache::new(&tx).taproot_key_spend_signature_hash(
            0,
            &Prevouts::All(&prevouts),
            bitcoin::TapSighashType::Default,
        )?;

        let spend_info = self.tree.btc_spend_info()?;
        let tweak = spend_info.tap_tweak().to_byte_array();

        // For a reverse swap claim, the counterparty key is the refund side.
        let session = KeypathSession::new(
            self.tree.refund_pubkey,
            self.tree.claim_pubkey,
            tweak,
            sighash.to_byte_array(),
        )?;

        let tx_hex = bitcoin::consensus::encode::serialize_hex(&tx);
        let theirs = signer
            .counterparty_sign(swap_id, Some(preimage), &session.pub_nonce(), &tx_hex, 0)
            .map_err(|e| TxBuildError::Sighash(format!("cooperative signing failed: {e}")))?;

        let signature = session.sign(
            our_secret,
            self.tree.refund_pubkey,
            theirs.pub_nonce,
            theirs.partial_signature,
        )?;

        let signature = bitcoin::secp256k1::schnorr::Signature::from_slice(signature.as_ref())
            .map_err(|e| TxBuildError::Sighash(format!("bad aggregated signature: {e}")))?;
        let signature = bitcoin::taproot::Signature {
            signature,
            sighash_type: bitcoin::TapSighashType::Default,
        };
        tx.input[0].witness = Witness::p2tr_key_spend(&signature);

        Ok(tx)
    }
}

/// A Liquid claim or refund in the making. Outputs are blinded to the
/// destination's blinding key; the fee is an explicit L-BTC output.
pub struct LBtcSwapTx {
    /// Claim or refund.
    pub kind: TxKind,
    /// The swap's script tree.
    pub tree: SwapTree,
    /// Lockup transaction being spent.
    pub lockup_tx: elements::Transaction,
    /// Index of the lockup output.
    pub vout: u32,
    /// The lockup output itself, still blinded.
    pub prevout: elements::TxOut,
    /// Where the spend pays to; must carry a blinding pubkey.
    pub destination: elements::Address,
    /// The swap's blinding secret, used to unblind the lockup.
    pub blinding_key: SecretKey,
    /// Chain genesis hash, part of the Elements sighash.
    pub genesis_hash: elements::BlockHash,
}

impl LBtcSwapTx {
    /// Prepare a claim spend of the Liquid lockup output.
    pub fn new_claim(
        tree: SwapTree,
        lockup_tx: elements::Transaction,
        lockup_address: &elements::Address,
        destination: elements::Address,
        blinding_key: SecretKey,
        genesis_hash: elements::BlockHash,
    ) -> Result<Self, TxBuildError> {
        let (vout, prevout) = find_lockup_vout_lbtc(&lockup_tx, lockup_address)?;
        Ok(LBtcSwapTx {
            kind: TxKind::Claim,
            tree,
            lockup_tx,
            vout,
            prevout,
            destination,
            blinding_key,
            genesis_hash,
        })
    }

    /// Prepare a refund spend of the Liquid lockup output.
    pub fn new_refund(
        tree: SwapTree,
        lockup_tx: elements::Transaction,
        lockup_address: &elements::Address,
        destination: elements::Address,
        blinding_key: SecretKey,
        genesis_hash: elements::BlockHash,
    ) -> Result<Self, TxBuildError> {
        let (vout, prevout) = find_lockup_vout_lbtc(&lockup_tx, lockup_address)?;
        Ok(LBtcSwapTx {
            kind: TxKind::Refund,
            tree,
            lockup_tx,
            vout,
            prevout,
            destination,
            blinding_key,
            genesis_hash,
        })
    }

    /// Value locked in the output being spent, in sat. Confidential outputs
    /// are unblinded with the swap's blinding key.
    pub fn lockup_value(&self) -> Result<u64, TxBuildError> {
        Ok(self.unblinded_secrets()?.value)
    }

    fn unblinded_secrets(&self) -> Result<elements::TxOutSecrets, TxBuildError> {
        let secp = zkp::Secp256k1::new();
        let blinding_secret = zkp::SecretKey::from_slice(&self.blinding_key.secret_bytes())
            .map_err(|e| TxBuildError::Blinding(format!("bad blinding key: {e}")))?;
        match self.prevout.value {
            Value::Explicit(value) => {
                let Asset::Explicit(asset) = self.prevout.asset else {
                    return Err(TxBuildError::Blinding(
                        "explicit value with confidential asset".to_string(),
                    ));
                };
                Ok(elements::TxOutSecrets {
                    asset,
                    asset_bf: AssetBlindingFactor::zero(),
                    value,
                    value_bf: ValueBlindingFactor::zero(),
                })
            }
            _ => self
                .prevout
                .unblind(&secp, blinding_secret)
                .map_err(|e| TxBuildError::Blinding(format!("unblind failed: {e}"))),
        }
    }

    /// Build the unsigned spend with blinded payment output and explicit fee
    /// output.
    fn unsigned_tx(&self, fee: Amount) -> Result<elements::Transaction, TxBuildError> {
        let secp = zkp::Secp256k1::new();
        let secrets = self.unblinded_secrets()?;

        let available = Amount::from_sat(secrets.value);
        if available <= fee || (available - fee).to_sat() < DUST_LIMIT {
            return Err(TxBuildError::AmountTooSmall { available, fee });
        }
        let output_value = available - fee;

        let asset_id = secrets.asset;
        let out_abf = AssetBlindingFactor::new(&mut thread_rng());
        let (blinded_asset, surjection_proof) = Asset::Explicit(asset_id)
            .blind(&mut thread_rng(), &secp, out_abf, &[secrets])
            .map_err(|e| TxBuildError::Blinding(format!("asset blinding failed: {e}")))?;

        let final_vbf = ValueBlindingFactor::last(
            &secp,
            output_value.to_sat(),
            out_abf,
            &[(secrets.value, secrets.asset_bf, secrets.value_bf)],
            &[(
                fee.to_sat(),
                AssetBlindingFactor::zero(),
                ValueBlindingFactor::zero(),
            )],
        );

        let blinding_pubkey = self
            .destination
            .blinding_pubkey
            .ok_or_else(|| TxBuildError::InvalidAddress("destination is not confidential".to_string()))?;
        let ephemeral_sk = zkp::SecretKey::new(&mut thread_rng());
        let rangeproof_message = elements::RangeProofMessage {
            asset: asset_id,
            bf: out_abf,
        };
        let (blinded_value, nonce, rangeproof) = Value::Explicit(output_value.to_sat())
            .blind(
                &secp,
                final_vbf,
                blinding_pubkey,
                ephemeral_sk,
                &self.destination.script_pubkey(),
                &rangeproof_message,
            )
            .map_err(|e| TxBuildError::Blinding(format!("value blinding failed: {e}")))?;

        let payment_output = elements::TxOut {
            asset: blinded_asset,
            value: blinded_value,
            nonce,
            script_pubkey: self.destination.script_pubkey(),
            witness: elements::TxOutWitness {
                surjection_proof: Some(Box::new(surjection_proof)),
                rangeproof: Some(Box::new(rangeproof)),
            },
        };
        let fee_output = elements::TxOut::new_fee(fee.to_sat(), asset_id);

        let (lock_time, sequence) = match self.kind {
            TxKind::Claim => (
                elements::LockTime::ZERO,
                elements::Sequence::ENABLE_RBF_NO_LOCKTIME,
            ),
            TxKind::Refund => (
                elements::LockTime::from_consensus(self.tree.timeout_block_height),
                elements::Sequence::ENABLE_LOCKTIME_NO_RBF,
            ),
        };

        Ok(elements::Transaction {
            version: 2,
            lock_time,
            input: vec![elements::TxIn {
                previous_output: elements::OutPoint {
                    txid: self.lockup_tx.txid(),
                    vout: self.vout,
                },
                is_pegin: false,
                script_sig: elements::Script::new(),
                sequence,
                asset_issuance: elements::AssetIssuance::default(),
                witness: elements::TxInWitness::default(),
            }],
            output: vec![payment_output, fee_output],
        })
    }

    /// Sign the claim, cooperatively when a signer is supplied.
    pub fn sign_claim(
        &self,
        our_secret: &SecretKey,
        preimage: [u8; 32],
        fee_rate: f64,
        cooperative: Option<(&dyn CooperativeSigner, &str)>,
    ) -> Result<elements::Transaction, TxBuildError> {
        let fee = self.measure_fee(our_secret, Some(preimage), fee_rate)?;

        if let Some((signer, swap_id)) = cooperative {
            match self.sign_claim_keypath(our_secret, preimage, fee, signer, swap_id) {
                Ok(tx) => return Ok(tx),
                Err(e) => {
                    log::warn!(
                        "cooperative claim for {} failed, falling back to script path: {:?}",
                        swap_id,
                        e
                    );
                }
            }
        }

        self.sign_script_path(our_secret, Some(preimage), fee)
    }

    /// Sign the refund through the script path.
    pub fn sign_refund(
        &self,
        our_secret: &SecretKey,
        fee_rate: f64,
    ) -> Result<elements::Transaction, TxBuildError> {
        let fee = self.measure_fee(our_secret, None, fee_rate)?;
        self.sign_script_path(our_secret, None, fee)
    }

    fn measure_fee(
        &self,
        our_secret: &SecretKey,
        preimage: Option<[u8; 32]>,
        fee_rate: f64,
    ) -> Result<Amount, TxBuildError> {
        let draft = self.sign_script_path(our_secret, preimage, Amount::from_sat(DUMMY_FEE))?;
        // Discount witness data the same way the chain does.
        let fee = (draft.vsize() as f64 * fee_rate).ceil() as u64;
        Ok(Amount::from_sat(fee.max(1)))
    }

    fn sign_script_path(
        &self,
        our_secret: &SecretKey,
        preimage: Option<[u8; 32]>,
        fee: Amount,
    ) -> Result<elements::Transaction, TxBuildError> {
        let secp = zkp::Secp256k1::new();
        let mut tx = self.unsigned_tx(fee)?;

        let leaf_script = match self.kind {
            TxKind::Claim => self.tree.lbtc_claim_script(),
            TxKind::Refund => self.tree.lbtc_refund_script(),
        };
        let leaf_hash = elements::taproot::TapLeafHash::from_script(
            &leaf_script,
            elements::taproot::LeafVersion::default(),
        );

        let sighash = elements::sighash::SighashCache::new(&tx)
            .taproot_script_spend_signature_hash(
                0,
                &elements::sighash::Prevouts::All(&[&self.prevout]),
                leaf_hash,
                elements::SchnorrSighashType::Default,
                self.genesis_hash,
            )
            .map_err(|e| TxBuildError::Sighash(e.to_string()))?;

        let msg = zkp::Message::from_digest_slice(sighash.as_byte_array())
            .map_err(|e| TxBuildError::Sighash(e.to_string()))?;
        let keypair = super::musig::to_zkp_keypair(our_secret);
        let signature = secp.sign_schnorr(&msg, &keypair);
        let signature = elements::SchnorrSig {
            sig: signature,
            hash_ty: elements::SchnorrSighashType::Default,
        };

        let spend_info = self.tree.lbtc_spend_info()?;
        let control_block = spend_info
            .control_block(&(leaf_script.clone(), elements::taproot::LeafVersion::default()))
            .ok_or_else(|| {
                TxBuildError::Tree(super::error::TreeError::Taproot(
                    "no control block for leaf".to_string(),
                ))
            })?;

        let mut witness: Vec<Vec<u8>> = Vec::new();
        witness.push(signature.to_vec());
        if let Some(preimage) = preimage {
            witness.push(preimage.to_vec());
        }
        witness.push(leaf_script.to_bytes());
        witness.push(control_block.serialize());

        tx.input[0].witness = elements::TxInWitness {
            amount_rangeproof: None,
            inflation_keys_rangeproof: None,
            script_witness: witness,
            pegin_witness: vec![],
        };

        Ok(tx)
    }

    fn sign_claim_keypath(
        &self,
        our_secret: &SecretKey,
        preimage: [u8; 32],
        fee: Amount,
        signer: &dyn CooperativeSigner,
        swap_id: &str,
    ) -> Result<elements::Transaction, TxBuildError> {
        let mut tx = self.unsigned_tx(fee)?;

        let sighash = elements::sighash::SighashCache::new(&tx)
            .taproot_key_spend_signature_hash(
                0,
                &elements::sighash::Prevouts::All(&[&self.prevout]),
                elements::SchnorrSighashType::Default,
                self.genesis_hash,
            )
            .map_err(|e| TxBuildError::Sighash(e.to_string()))?;

        let spend_info = self.tree.lbtc_spend_info()?;
        let tweak = spend_info.tap_tweak().to_byte_array();

        let session = KeypathSession::new(
            self.tree.refund_pubkey,
            self.tree.claim_pubkey,
            tweak,
            sighash.to_byte_array(),
        )?;

        let tx_hex = utill::to_hex(&elements::encode::serialize(&tx));
        let theirs = signer
            .counterparty_sign(swap_id, Some(preimage), &session.pub_nonce(), &tx_hex, 0)
            .map_err(|e| TxBuildError::Sighash(format!("cooperative signing failed: {e}")))?;

        let signature = session.sign(
            our_secret,
            self.tree.refund_pubkey,
            theirs.pub_nonce,
            theirs.partial_signature,
        )?;

        let signature = elements::SchnorrSig {
            sig: signature,
            hash_ty: elements::SchnorrSighashType::Default,
        };
        tx.input[0].witness = elements::TxInWitness {
            amount_rangeproof: None,
            inflation_keys_rangeproof: None,
            script_witness: vec![signature.to_vec()],
            pegin_witness: vec![],
        };

        Ok(tx)
    }
}

/// Generate a fresh 32-byte preimage.
pub fn generate_preimage() -> [u8; 32] {
    let mut preimage = [0u8; 32];
    OsRng.fill_bytes(&mut preimage);
    preimage
}
