//! Encryption of sensitive data at rest.
//!
//! Wallet credentials can be stored encrypted; this module provides the
//! AES-256-GCM envelope and the PBKDF2 key derivation for it. Serialization
//! of the plaintext payload uses CBOR.

use aes_gcm::{
    aead::{rand_core::RngCore, Aead, OsRng},
    AeadCore, Aes256Gcm, Key, KeyInit,
};
use pbkdf2::pbkdf2_hmac_array;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::Sha256;

use crate::utill;

/// Errors that can occur during the encryption process.
#[derive(Debug)]
pub enum EncryptError {
    /// CBOR serialization of the payload failed.
    Serialization(serde_cbor::Error),
    /// AES-GCM encryption failed.
    ///
    /// Carries no detail because the underlying AES-GCM error is a
    /// zero-sized marker.
    Encryption,
}

impl From<serde_cbor::Error> for EncryptError {
    fn from(err: serde_cbor::Error) -> Self {
        EncryptError::Serialization(err)
    }
}

impl From<aes_gcm::Error> for EncryptError {
    fn from(_: aes_gcm::Error) -> Self {
        EncryptError::Encryption
    }
}

/// Errors that can occur during decryption.
#[derive(Debug)]
pub enum DecryptError {
    /// Ciphertext did not authenticate; usually a wrong passphrase.
    WrongPassphrase,
    /// The decrypted payload failed to deserialize.
    Deserialization(serde_cbor::Error),
}

impl From<serde_cbor::Error> for DecryptError {
    fn from(err: serde_cbor::Error) -> Self {
        DecryptError::Deserialization(err)
    }
}

/// 16-byte PBKDF2 salt, freshly generated per encryption so equal passwords
/// derive distinct keys.
type Pbkdf2Salt = [u8; 16];
/// 12-byte AES-GCM nonce.
type EncryptionNonce = [u8; 12];
/// 256-bit AES key derived from the passphrase.
type EncryptionKey = [u8; 32];

/// PBKDF2 iteration count. Production strength per current OWASP guidance;
/// reduced to 1 in tests.
const PBKDF2_ITERATIONS: u32 = if cfg!(feature = "integration-test") || cfg!(test) {
    1
} else {
    600_000
};

/// Derived key material for encrypting and decrypting credentials.
#[derive(Debug, Clone)]
pub struct KeyMaterial {
    /// The PBKDF2-derived AES key.
    pub key: EncryptionKey,
    /// AES-GCM nonce.
    pub nonce: EncryptionNonce,
    /// Key derivation salt.
    pub pbkdf2_salt: Pbkdf2Salt,
}

impl KeyMaterial {
    /// Derive fresh key material from a passphrase, with random nonce and
    /// salt.
    pub fn new_from_password(password: &str) -> Self {
        let mut pbkdf2_salt = Pbkdf2Salt::default();
        OsRng.fill_bytes(&mut pbkdf2_salt);
        KeyMaterial {
            key: pbkdf2_hmac_array::<Sha256, 32>(
                password.as_bytes(),
                &pbkdf2_salt,
                PBKDF2_ITERATIONS,
            ),
            nonce: Aes256Gcm::generate_nonce(&mut OsRng).into(),
            pbkdf2_salt,
        }
    }

    /// Rebuild key material for decryption from the stored nonce and salt.
    pub fn existing(password: &str, nonce: EncryptionNonce, pbkdf2_salt: Pbkdf2Salt) -> Self {
        KeyMaterial {
            key: pbkdf2_hmac_array::<Sha256, 32>(
                password.as_bytes(),
                &pbkdf2_salt,
                PBKDF2_ITERATIONS,
            ),
            nonce,
            pbkdf2_salt,
        }
    }
}

/// Encrypted envelope as stored on disk or in the database.
#[derive(Serialize, Deserialize, Debug)]
pub struct EncryptedData {
    /// Nonce used for AES-GCM encryption.
    nonce: EncryptionNonce,
    /// AES-GCM ciphertext of the CBOR-serialized payload.
    encrypted_payload: Vec<u8>,
    /// Salt for the PBKDF2 key derivation.
    pbkdf2_salt: Pbkdf2Salt,
}

impl EncryptedData {
    /// The stored nonce, needed to rebuild [`KeyMaterial`].
    pub fn nonce(&self) -> EncryptionNonce {
        self.nonce
    }

    /// The stored salt, needed to rebuild [`KeyMaterial`].
    pub fn pbkdf2_salt(&self) -> Pbkdf2Salt {
        self.pbkdf2_salt
    }
}

/// Encrypt a serializable struct: CBOR-serialize, then AES-GCM under the
/// given key material.
pub fn encrypt_struct<T: Serialize>(
    plain_struct: &T,
    enc_material: &KeyMaterial,
) -> Result<EncryptedData, EncryptError> {
    let packed = serde_cbor::ser::to_vec(plain_struct)?;

    let nonce = aes_gcm::Nonce::from_slice(&enc_material.nonce);
    let key = Key::<Aes256Gcm>::from_slice(&enc_material.key);
    let cipher = Aes256Gcm::new(key);

    let encrypted_payload = cipher.encrypt(nonce, packed.as_ref())?;

    Ok(EncryptedData {
        nonce: enc_material.nonce,
        encrypted_payload,
        pbkdf2_salt: enc_material.pbkdf2_salt,
    })
}

/// Decrypt an [`EncryptedData`] envelope and deserialize the payload.
pub fn decrypt_struct<T: DeserializeOwned>(
    encrypted_struct: &EncryptedData,
    enc_material: &KeyMaterial,
) -> Result<T, DecryptError> {
    let key = Key::<Aes256Gcm>::from_slice(&enc_material.key);
    let cipher = Aes256Gcm::new(key);
    let nonce = aes_gcm::Nonce::from_slice(&encrypted_struct.nonce);

    let plaintext = cipher
        .decrypt(nonce, encrypted_struct.encrypted_payload.as_ref())
        .map_err(|_| DecryptError::WrongPassphrase)?;

    Ok(utill::deserialize_from_cbor::<T>(plaintext)?)
}
