//! Interface to the MuSig2 implementation in `secp256k1-zkp`.
//!
//! The swap tree's internal key is a 2-of-2 aggregation of the exchange key
//! and our key, and cooperative key-path spends run the two-round nonce and
//! partial-signature exchange. Everything else in the crate works with
//! `bitcoin::secp256k1` types; the conversions live here.

use bitcoin::key::rand::{rngs::OsRng, thread_rng, RngCore};
use bitcoin::secp256k1::{PublicKey, SecretKey};
use elements::secp256k1_zkp as zkp;

use super::error::{TreeError, TxBuildError};

/// Convert a public key into its zkp representation.
pub fn to_zkp_pubkey(key: PublicKey) -> zkp::PublicKey {
    zkp::PublicKey::from_slice(&key.serialize()).expect("valid public key bytes")
}

/// Convert a zkp x-only key back into the bitcoin representation.
pub fn from_zkp_xonly(key: zkp::XOnlyPublicKey) -> bitcoin::secp256k1::XOnlyPublicKey {
    bitcoin::secp256k1::XOnlyPublicKey::from_slice(&key.serialize())
        .expect("valid x-only key bytes")
}

/// Build a zkp keypair from our secret key.
pub fn to_zkp_keypair(key: &SecretKey) -> zkp::Keypair {
    let secp = zkp::Secp256k1::new();
    let secret =
        zkp::SecretKey::from_slice(&key.secret_bytes()).expect("valid secret key bytes");
    zkp::Keypair::from_secret_key(&secp, &secret)
}

/// Aggregate the two swap keys into the MuSig2 key cache.
///
/// The exchange's key always comes first; this is the order the exchange
/// itself aggregates with, and the resulting internal key must reproduce its
/// lockup address bit for bit.
pub fn key_agg_cache(exchange_key: PublicKey, our_key: PublicKey) -> zkp::MusigKeyAggCache {
    let secp = zkp::Secp256k1::new();
    let pubkeys = [to_zkp_pubkey(exchange_key), to_zkp_pubkey(our_key)];
    zkp::MusigKeyAggCache::new(&secp, &pubkeys)
}

/// A single cooperative key-path signing session over one sighash.
///
/// Created with our public nonce ready to hand to the exchange; consumed by
/// [`KeypathSession::sign`] once the counterparty's nonce and partial
/// signature arrive.
pub struct KeypathSession {
    cache: zkp::MusigKeyAggCache,
    msg: zkp::Message,
    sec_nonce: zkp::MusigSecNonce,
    pub_nonce: zkp::MusigPubNonce,
}

impl KeypathSession {
    /// Start a session: aggregate keys, apply the taproot tweak, generate our
    /// nonce pair for `sighash`.
    pub fn new(
        exchange_key: PublicKey,
        our_key: PublicKey,
        tap_tweak: [u8; 32],
        sighash: [u8; 32],
    ) -> Result<Self, TreeError> {
        let secp = zkp::Secp256k1::new();
        let mut cache = key_agg_cache(exchange_key, our_key);

        let tweak = zkp::SecretKey::from_slice(&tap_tweak)
            .map_err(|e| TreeError::Taproot(format!("invalid tap tweak: {e}")))?;
        cache
            .pubkey_xonly_tweak_add(&secp, tweak)
            .map_err(|e| TreeError::Taproot(format!("tweak add failed: {e}")))?;

        let msg = zkp::Message::from_digest_slice(&sighash)
            .map_err(|e| TreeError::Taproot(format!("invalid sighash: {e}")))?;

        let session_id = zkp::MusigSessionId::new(&mut thread_rng());
        let mut extra_rand = [0u8; 32];
        OsRng.fill_bytes(&mut extra_rand);

        let (sec_nonce, pub_nonce) = cache
            .nonce_gen(
                &secp,
                session_id,
                to_zkp_pubkey(our_key),
                msg,
                Some(extra_rand),
            )
            .map_err(|e| TreeError::Taproot(format!("nonce generation failed: {e}")))?;

        Ok(KeypathSession {
            cache,
            msg,
            sec_nonce,
            pub_nonce,
        })
    }

    /// Our public nonce, to be sent to the exchange.
    pub fn pub_nonce(&self) -> zkp::MusigPubNonce {
        self.pub_nonce
    }

    /// Produce only our partial signature, for spends the counterparty
    /// aggregates on its side (the exchange's own submarine claim). Returns
    /// our partial signature and public nonce.
    pub fn partial_sign_only(
        self,
        our_secret: &SecretKey,
        their_nonce: zkp::MusigPubNonce,
    ) -> Result<(zkp::MusigPartialSignature, zkp::MusigPubNonce), TxBuildError> {
        let secp = zkp::Secp256k1::new();
        let agg_nonce = zkp::MusigAggNonce::new(&secp, &[their_nonce, self.pub_nonce]);
        let session = zkp::MusigSession::new(&secp, &self.cache, agg_nonce, self.msg);
        let keypair = to_zkp_keypair(our_secret);
        let partial = session
            .partial_sign(&secp, self.sec_nonce, &keypair, &self.cache)
            .map_err(|e| TxBuildError::Sighash(format!("partial sign failed: {e}")))?;
        Ok((partial, self.pub_nonce))
    }

    /// Finish the session: verify the counterparty's partial signature,
    /// contribute ours, and aggregate into a full Schnorr signature valid
    /// under the tweaked output key.
    pub fn sign(
        self,
        our_secret: &SecretKey,
        their_key: PublicKey,
        their_nonce: zkp::MusigPubNonce,
        their_partial: zkp::MusigPartialSignature,
    ) -> Result<zkp::schnorr::Signature, TxBuildError> {
        let secp = zkp::Secp256k1::new();
        let agg_nonce = zkp::MusigAggNonce::new(&secp, &[their_nonce, self.pub_nonce]);
        let session = zkp::MusigSession::new(&secp, &self.cache, agg_nonce, self.msg);

        if !session.partial_verify(
            &secp,
            &self.cache,
            their_partial,
            their_nonce,
            to_zkp_pubkey(their_key),
        ) {
            return Err(TxBuildError::InvalidPartialSignature);
        }

        let keypair = to_zkp_keypair(our_secret);
        let our_partial = session
            .partial_sign(&secp, self.sec_nonce, &keypair, &self.cache)
            .map_err(|e| TxBuildError::Sighash(format!("partial sign failed: {e}")))?;

        let signature = session.partial_sig_agg(&[their_partial, our_partial]);

        secp.verify_schnorr(&signature, &self.msg, &self.cache.agg_pk())
            .map_err(|_| TxBuildError::InvalidPartialSignature)?;

        Ok(signature)
    }
}
