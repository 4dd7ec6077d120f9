//! The Taproot HTLC script tree backing every swap.
//!
//! A swap tree commits to two tapleaves under a MuSig2 2-of-2 internal key:
//! a claim leaf that releases funds against the preimage plus the claimer's
//! signature, and a refund leaf that releases funds to the refunder after an
//! absolute timeout. The exchange constructs the same tree on its side; the
//! address it returns must reproduce from this module byte for byte before a
//! swap is allowed to proceed.

use bitcoin::hashes::{ripemd160, Hash};
use bitcoin::opcodes::all::{
    OP_CHECKSIG, OP_CHECKSIGVERIFY, OP_CLTV, OP_EQUALVERIFY, OP_HASH160, OP_SIZE,
};
use bitcoin::script::{Builder, Instruction};
use bitcoin::secp256k1::{PublicKey, Secp256k1};
use bitcoin::ScriptBuf;
use elements::secp256k1_zkp as zkp;
use serde::{Deserialize, Serialize};

use super::error::TreeError;
use super::musig::{from_zkp_xonly, key_agg_cache};
use crate::utill;

/// Which side of the swap this tree locks funds for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeKind {
    /// Submarine swap: the user locks, the exchange claims with the preimage.
    Submarine,
    /// Reverse swap: the exchange locks, the user claims with the preimage.
    Reverse,
}

/// A fully specified swap tree.
///
/// `claim_pubkey` belongs to whichever side reveals the preimage; for a
/// submarine swap that is the exchange, for a reverse swap it is us.
/// `refund_pubkey` belongs to the side that funded the lockup.
#[derive(Debug, Clone, PartialEq)]
pub struct SwapTree {
    /// Claim vs refund role assignment.
    pub kind: TreeKind,
    /// ripemd160 of the preimage hash, as committed in the claim leaf.
    pub hashlock: ripemd160::Hash,
    /// Key of the preimage-revealing side.
    pub claim_pubkey: PublicKey,
    /// Key of the funding side.
    pub refund_pubkey: PublicKey,
    /// Absolute block height of the refund leaf's CLTV.
    pub timeout_block_height: u32,
}

/// Serialized form persisted alongside each swap row.
#[derive(Serialize, Deserialize)]
struct TreeData {
    kind: String,
    hashlock: String,
    claim_pubkey: String,
    refund_pubkey: String,
    timeout_block_height: u32,
}

impl SwapTree {
    /// Build a tree from the swap's preimage hash (sha256) and both keys.
    pub fn new(
        kind: TreeKind,
        preimage_hash: &[u8; 32],
        claim_pubkey: PublicKey,
        refund_pubkey: PublicKey,
        timeout_block_height: u32,
    ) -> Self {
        SwapTree {
            kind,
            hashlock: ripemd160::Hash::hash(preimage_hash),
            claim_pubkey,
            refund_pubkey,
            timeout_block_height,
        }
    }

    /// The claim tapleaf script.
    ///
    /// The reverse variant additionally pins the witness preimage to exactly
    /// 32 bytes, so the exchange cannot be griefed with an oversized push.
    pub fn claim_script(&self) -> ScriptBuf {
        let claim_xonly = self.claim_pubkey.x_only_public_key().0;
        match self.kind {
            TreeKind::Submarine => Builder::new()
                .push_opcode(OP_HASH160)
                .push_slice(self.hashlock.to_byte_array())
                .push_opcode(OP_EQUALVERIFY)
                .push_slice(claim_xonly.serialize())
                .push_opcode(OP_CHECKSIG)
                .into_script(),
            TreeKind::Reverse => Builder::new()
                .push_opcode(OP_SIZE)
                .push_int(32)
                .push_opcode(OP_EQUALVERIFY)
                .push_opcode(OP_HASH160)
                .push_slice(self.hashlock.to_byte_array())
                .push_opcode(OP_EQUALVERIFY)
                .push_slice(claim_xonly.serialize())
                .push_opcode(OP_CHECKSIG)
                .into_script(),
        }
    }

    /// The refund tapleaf script: refunder signature plus CLTV.
    pub fn refund_script(&self) -> ScriptBuf {
        let refund_xonly = self.refund_pubkey.x_only_public_key().0;
        Builder::new()
            .push_slice(refund_xonly.serialize())
            .push_opcode(OP_CHECKSIGVERIFY)
            .push_int(i64::from(self.timeout_block_height))
            .push_opcode(OP_CLTV)
            .into_script()
    }

    /// The MuSig2 key aggregation cache for the internal key.
    ///
    /// The exchange's key leads the aggregation on both swap kinds, matching
    /// the order the exchange derives the lockup address with.
    pub fn musig_cache(&self) -> zkp::MusigKeyAggCache {
        match self.kind {
            TreeKind::Submarine => key_agg_cache(self.claim_pubkey, self.refund_pubkey),
            TreeKind::Reverse => key_agg_cache(self.refund_pubkey, self.claim_pubkey),
        }
    }

    /// The untweaked internal key.
    pub fn internal_key(&self) -> bitcoin::secp256k1::XOnlyPublicKey {
        from_zkp_xonly(self.musig_cache().agg_pk())
    }

    /// Taproot commitment for mainchain Bitcoin.
    pub fn btc_spend_info(&self) -> Result<bitcoin::taproot::TaprootSpendInfo, TreeError> {
        let secp = Secp256k1::new();
        bitcoin::taproot::TaprootBuilder::new()
            .add_leaf(1, self.claim_script())
            .and_then(|builder| builder.add_leaf(1, self.refund_script()))
            .map_err(|e| TreeError::Taproot(format!("leaf insertion failed: {e}")))?
            .finalize(&secp, self.internal_key())
            .map_err(|_| TreeError::Taproot("taproot finalization failed".to_string()))
    }

    /// Taproot commitment for Liquid. Elements uses its own tagged hashes, so
    /// the merkle root differs from the Bitcoin one for the same leaves.
    pub fn lbtc_spend_info(&self) -> Result<elements::taproot::TaprootSpendInfo, TreeError> {
        let secp = zkp::Secp256k1::new();
        elements::taproot::TaprootBuilder::new()
            .add_leaf_with_ver(
                1,
                self.lbtc_claim_script(),
                elements::taproot::LeafVersion::default(),
            )
            .and_then(|builder| {
                builder.add_leaf_with_ver(
                    1,
                    self.lbtc_refund_script(),
                    elements::taproot::LeafVersion::default(),
                )
            })
            .map_err(|e| TreeError::Taproot(format!("leaf insertion failed: {e}")))?
            .finalize(&secp, self.musig_cache().agg_pk())
            .map_err(|_| TreeError::Taproot("taproot finalization failed".to_string()))
    }

    /// Claim leaf as an Elements script. Opcode encoding is identical across
    /// the two chains, only the script type differs.
    pub fn lbtc_claim_script(&self) -> elements::Script {
        elements::Script::from(self.claim_script().into_bytes())
    }

    /// Refund leaf as an Elements script.
    pub fn lbtc_refund_script(&self) -> elements::Script {
        elements::Script::from(self.refund_script().into_bytes())
    }

    /// P2TR lockup address on mainchain Bitcoin.
    pub fn btc_address(&self, network: bitcoin::Network) -> Result<bitcoin::Address, TreeError> {
        let secp = Secp256k1::new();
        let spend_info = self.btc_spend_info()?;
        Ok(bitcoin::Address::p2tr(
            &secp,
            spend_info.internal_key(),
            spend_info.merkle_root(),
            network,
        ))
    }

    /// Confidential P2TR lockup address on Liquid. `blinding_pubkey` comes
    /// from the swap's blinding key.
    pub fn lbtc_address(
        &self,
        params: &'static elements::AddressParams,
        blinding_pubkey: Option<zkp::PublicKey>,
    ) -> Result<elements::Address, TreeError> {
        let secp = zkp::Secp256k1::new();
        let spend_info = self.lbtc_spend_info()?;
        Ok(elements::Address::p2tr(
            &secp,
            spend_info.internal_key(),
            spend_info.merkle_root(),
            blinding_pubkey,
            params,
        ))
    }

    /// Verify the leaves the exchange sent against the local reconstruction.
    ///
    /// The timeout and hashlock are checked first with specific errors, then
    /// the raw bytes must match exactly.
    pub fn check_leaves(&self, claim_hex: &str, refund_hex: &str) -> Result<(), TreeError> {
        let server_claim = script_from_hex(claim_hex)?;
        let server_refund = script_from_hex(refund_hex)?;

        if let Some(server_timeout) = extract_locktime(&server_refund) {
            if server_timeout != self.timeout_block_height {
                return Err(TreeError::TimeoutMismatch {
                    server: server_timeout,
                    local: self.timeout_block_height,
                });
            }
        }
        if let Some(server_hashlock) = extract_hashlock(&server_claim) {
            if server_hashlock != self.hashlock.to_byte_array() {
                return Err(TreeError::PreimageHashMismatch);
            }
        }

        if server_claim != self.claim_script() {
            return Err(TreeError::LeafMismatch { leaf: "claim" });
        }
        if server_refund != self.refund_script() {
            return Err(TreeError::LeafMismatch { leaf: "refund" });
        }
        Ok(())
    }

    /// Verify the exchange's lockup address reproduces from this tree.
    pub fn check_btc_address(
        &self,
        server_address: &str,
        network: bitcoin::Network,
    ) -> Result<(), TreeError> {
        let local = self.btc_address(network)?;
        if local.to_string() != server_address {
            return Err(TreeError::AddressMismatch {
                server: server_address.to_string(),
                local: local.to_string(),
            });
        }
        Ok(())
    }

    /// Verify the exchange's confidential Liquid lockup address.
    pub fn check_lbtc_address(
        &self,
        server_address: &str,
        params: &'static elements::AddressParams,
        blinding_pubkey: Option<zkp::PublicKey>,
    ) -> Result<(), TreeError> {
        let local = self.lbtc_address(params, blinding_pubkey)?;
        if local.to_string() != server_address {
            return Err(TreeError::AddressMismatch {
                server: server_address.to_string(),
                local: local.to_string(),
            });
        }
        Ok(())
    }

    /// Serialize for persistence.
    pub fn to_json(&self) -> String {
        let data = TreeData {
            kind: match self.kind {
                TreeKind::Submarine => "submarine".to_string(),
                TreeKind::Reverse => "reverse".to_string(),
            },
            hashlock: utill::to_hex(&self.hashlock.to_byte_array()),
            claim_pubkey: utill::to_hex(&self.claim_pubkey.serialize()),
            refund_pubkey: utill::to_hex(&self.refund_pubkey.serialize()),
            timeout_block_height: self.timeout_block_height,
        };
        serde_json::to_string(&data).expect("tree serialization cannot fail")
    }

    /// Parse the persisted form.
    pub fn from_json(json: &str) -> Result<Self, TreeError> {
        let data: TreeData = serde_json::from_str(json)
            .map_err(|e| TreeError::InvalidTree(format!("bad tree json: {e}")))?;
        let kind = match data.kind.as_str() {
            "submarine" => TreeKind::Submarine,
            "reverse" => TreeKind::Reverse,
            other => {
                return Err(TreeError::InvalidTree(format!("unknown tree kind: {other}")));
            }
        };
        let hashlock_bytes = utill::from_hex(&data.hashlock)
            .map_err(|e| TreeError::InvalidTree(format!("bad hashlock hex: {e}")))?;
        let hashlock = ripemd160::Hash::from_slice(&hashlock_bytes)
            .map_err(|e| TreeError::InvalidTree(format!("bad hashlock: {e}")))?;
        let claim_pubkey = parse_pubkey(&data.claim_pubkey)?;
        let refund_pubkey = parse_pubkey(&data.refund_pubkey)?;
        Ok(SwapTree {
            kind,
            hashlock,
            claim_pubkey,
            refund_pubkey,
            timeout_block_height: data.timeout_block_height,
        })
    }
}

fn parse_pubkey(hex: &str) -> Result<PublicKey, TreeError> {
    let bytes =
        utill::from_hex(hex).map_err(|e| TreeError::InvalidTree(format!("bad key hex: {e}")))?;
    Ok(PublicKey::from_slice(&bytes)?)
}

fn script_from_hex(hex: &str) -> Result<ScriptBuf, TreeError> {
    let bytes = utill::from_hex(hex)
        .map_err(|e| TreeError::InvalidTree(format!("bad script hex: {e}")))?;
    Ok(ScriptBuf::from_bytes(bytes))
}

/// Pull the CLTV height out of a refund leaf: the push that follows
/// `OP_CHECKSIGVERIFY`, script-number encoded.
fn extract_locktime(script: &ScriptBuf) -> Option<u32> {
    let mut after_checksigverify = false;
    for instruction in script.instructions() {
        match instruction {
            Ok(Instruction::Op(op)) => {
                after_checksigverify = op == OP_CHECKSIGVERIFY;
            }
            Ok(Instruction::PushBytes(bytes)) => {
                if after_checksigverify {
                    return Some(script_num_to_u32(bytes.as_bytes()));
                }
            }
            Err(_) => return None,
        }
    }
    None
}

/// Pull the 20-byte hashlock push out of a claim leaf.
fn extract_hashlock(script: &ScriptBuf) -> Option<[u8; 20]> {
    for instruction in script.instructions() {
        if let Ok(Instruction::PushBytes(bytes)) = instruction {
            if bytes.len() == 20 {
                let mut out = [0u8; 20];
                out.copy_from_slice(bytes.as_bytes());
                return Some(out);
            }
        }
    }
    None
}

fn script_num_to_u32(bytes: &[u8]) -> u32 {
    let mut result = 0u32;
    for (i, byte) in bytes.iter().enumerate() {
        result |= u32::from(*byte) << (8 * i);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::sha256;
    use bitcoin::key::rand::thread_rng;
    use bitcoin::secp256k1::SecretKey;

    fn test_tree(kind: TreeKind) -> SwapTree {
        let secp = Secp256k1::new();
        let claim_secret = SecretKey::from_slice(&[0x11; 32]).unwrap();
        let refund_secret = SecretKey::from_slice(&[0x22; 32]).unwrap();
        let preimage = [0x42u8; 32];
        let preimage_hash = sha256::Hash::hash(&preimage).to_byte_array();
        SwapTree::new(
            kind,
            &preimage_hash,
            PublicKey::from_secret_key(&secp, &claim_secret),
            PublicKey::from_secret_key(&secp, &refund_secret),
            812_345,
        )
    }

    #[test]
    fn test_reverse_claim_leaf_pins_preimage_size() {
        let tree = test_tree(TreeKind::Reverse);
        let asm = tree.claim_script().to_asm_string();
        assert!(asm.starts_with("OP_SIZE"));
        assert!(asm.contains("OP_HASH160"));
        assert!(asm.contains("OP_CHECKSIG"));

        let submarine = test_tree(TreeKind::Submarine);
        assert!(!submarine.claim_script().to_asm_string().contains("OP_SIZE"));
    }

    #[test]
    fn test_refund_leaf_encodes_timeout() {
        let tree = test_tree(TreeKind::Submarine);
        assert_eq!(extract_locktime(&tree.refund_script()), Some(812_345));
        assert_eq!(
            extract_hashlock(&tree.claim_script()),
            Some(tree.hashlock.to_byte_array())
        );
    }

    #[test]
    fn test_check_leaves_accepts_own_scripts() {
        let tree = test_tree(TreeKind::Reverse);
        let claim_hex = utill::to_hex(tree.claim_script().as_bytes());
        let refund_hex = utill::to_hex(tree.refund_script().as_bytes());
        tree.check_leaves(&claim_hex, &refund_hex).unwrap();
    }

    #[test]
    fn test_check_leaves_rejects_wrong_timeout() {
        let tree = test_tree(TreeKind::Submarine);
        let mut other = tree.clone();
        other.timeout_block_height += 10;

        let claim_hex = utill::to_hex(tree.claim_script().as_bytes());
        let refund_hex = utill::to_hex(other.refund_script().as_bytes());
        assert!(matches!(
            tree.check_leaves(&claim_hex, &refund_hex),
            Err(TreeError::TimeoutMismatch {
                server,
                local
            }) if server == tree.timeout_block_height + 10 && local == tree.timeout_block_height
        ));
    }

    #[test]
    fn test_check_leaves_rejects_wrong_hashlock() {
        let tree = test_tree(TreeKind::Reverse);
        let other = SwapTree::new(
            TreeKind::Reverse,
            &sha256::Hash::hash(&[0x43u8; 32]).to_byte_array(),
            tree.claim_pubkey,
            tree.refund_pubkey,
            tree.timeout_block_height,
        );
        let claim_hex = utill::to_hex(other.claim_script().as_bytes());
        let refund_hex = utill::to_hex(tree.refund_script().as_bytes());
        assert!(matches!(
            tree.check_leaves(&claim_hex, &refund_hex),
            Err(TreeError::PreimageHashMismatch)
        ));
    }

    #[test]
    fn test_address_check_detects_mismatch() {
        let tree = test_tree(TreeKind::Submarine);
        let address = tree.btc_address(bitcoin::Network::Regtest).unwrap();
        tree.check_btc_address(&address.to_string(), bitcoin::Network::Regtest)
            .unwrap();

        let mut other = tree.clone();
        other.timeout_block_height += 1;
        let err = other
            .check_btc_address(&address.to_string(), bitcoin::Network::Regtest)
            .unwrap_err();
        assert!(matches!(err, TreeError::AddressMismatch { .. }));
    }

    #[test]
    fn test_lbtc_address_is_confidential_when_blinded() {
        let secp = Secp256k1::new();
        let tree = test_tree(TreeKind::Reverse);
        let blinding_secret = SecretKey::new(&mut thread_rng());
        let blinding_pub = super::super::musig::to_zkp_pubkey(PublicKey::from_secret_key(
            &secp,
            &blinding_secret,
        ));

        let confidential = tree
            .lbtc_address(&elements::AddressParams::ELEMENTS, Some(blinding_pub))
            .unwrap();
        assert!(confidential.blinding_pubkey.is_some());

        let bare = tree
            .lbtc_address(&elements::AddressParams::ELEMENTS, None)
            .unwrap();
        assert_eq!(confidential.to_unconfidential(), bare);
    }

    #[test]
    fn test_serialization_roundtrip() {
        for kind in [TreeKind::Submarine, TreeKind::Reverse] {
            let tree = test_tree(kind);
            let parsed = SwapTree::from_json(&tree.to_json()).unwrap();
            assert_eq!(parsed, tree);
        }
    }

    #[test]
    fn test_internal_key_differs_between_kinds() {
        // Same keys, different aggregation order: the two kinds must not
        // share an internal key.
        let submarine = test_tree(TreeKind::Submarine);
        let reverse = test_tree(TreeKind::Reverse);
        assert_ne!(submarine.internal_key(), reverse.internal_key());
    }
}
