//! BOLT11 invoice helpers.

use std::str::FromStr;
use std::time::{Duration, SystemTime};

use bitcoin::hashes::{sha256, Hash};
use lightning_invoice::Bolt11Invoice;

use super::LightningError;

fn parse(invoice: &str) -> Result<Bolt11Invoice, LightningError> {
    Bolt11Invoice::from_str(invoice)
        .map_err(|e| LightningError::InvalidInvoice(format!("{e:?}")))
}

/// Payment hash of a BOLT11 invoice.
pub fn payment_hash(invoice: &str) -> Result<[u8; 32], LightningError> {
    Ok(parse(invoice)?.payment_hash().to_byte_array())
}

/// Invoice amount in msat, if the invoice carries one.
pub fn amount_msat(invoice: &str) -> Result<Option<u64>, LightningError> {
    Ok(parse(invoice)?.amount_milli_satoshis())
}

/// Invoice amount in whole sat, if the invoice carries one.
pub fn amount_sat(invoice: &str) -> Result<Option<u64>, LightningError> {
    Ok(amount_msat(invoice)?.map(|msat| msat / 1_000))
}

/// Whether the invoice's expiry has passed.
pub fn is_expired(invoice: &str) -> Result<bool, LightningError> {
    let invoice = parse(invoice)?;
    let Some(expires_at) = invoice.expires_at() else {
        return Ok(false);
    };
    let now = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0));
    Ok(now >= expires_at)
}

/// Check that an invoice's payment hash commits to `preimage_hash`.
pub fn matches_preimage_hash(
    invoice: &str,
    preimage_hash: &[u8; 32],
) -> Result<bool, LightningError> {
    Ok(payment_hash(invoice)? == *preimage_hash)
}

/// sha256 of a preimage.
pub fn sha256_preimage(preimage: &[u8]) -> [u8; 32] {
    sha256::Hash::hash(preimage).to_byte_array()
}
