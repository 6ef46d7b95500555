//! Cryptographic primitives: hashing, PoW digest, ECDSA signing.
//!
//! - SHA-256 / double SHA-256 for identities, checksums, and merkle nodes
//! - RIPEMD-160(SHA-256(x)) for address payloads
//! - scrypt (N=2^14, r=8, p=1, 32-byte output) as the memory-hard PoW hash
//! - ECDSA over secp256k1 with RFC-6979 deterministic nonces for transaction
//!   signatures (DER-encoded, SEC1 compressed public keys)
//!
//! # Signing scheme
//!
//! Inputs sign the transaction [`sighash`](crate::types::Transaction::sighash),
//! which commits to the whole transaction with all witness fields emptied.
//! Signatures and public keys are therefore independent of signing order.

use k256::ecdsa::signature::{Signer, Verifier};
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use ripemd::Ripemd160;
use sha2::{Digest, Sha256};
use std::fmt;

use crate::address::Address;
use crate::constants::{POW_SCRYPT_LOG_N, POW_SCRYPT_P, POW_SCRYPT_R};
use crate::error::CryptoError;
use crate::types::{Hash256, Transaction};

/// SHA-256 of `data`.
pub fn sha256(data: &[u8]) -> Hash256 {
    Hash256(Sha256::digest(data).into())
}

/// Double SHA-256 of `data`.
pub fn sha256d(data: &[u8]) -> Hash256 {
    let first = Sha256::digest(data);
    Hash256(Sha256::digest(first).into())
}

/// RIPEMD-160(SHA-256(`data`)), the address payload hash.
pub fn hash160(data: &[u8]) -> [u8; 20] {
    let sha = Sha256::digest(data);
    Ripemd160::digest(sha).into()
}

/// Memory-hard PoW hash: scrypt with the fixed protocol parameters,
/// salted with the input itself.
pub fn pow_hash(data: &[u8]) -> Hash256 {
    let params = scrypt::Params::new(POW_SCRYPT_LOG_N, POW_SCRYPT_R, POW_SCRYPT_P, 32)
        .expect("protocol scrypt parameters are valid");
    let mut out = [0u8; 32];
    scrypt::scrypt(data, data, &params, &mut out)
        .expect("output length is nonzero");
    Hash256(out)
}

/// secp256k1 keypair for signing transactions.
///
/// Signatures use RFC-6979 deterministic nonces, so signing is reproducible
/// and needs no entropy source.
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    /// Generate a random keypair using the OS cryptographic RNG.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::random(&mut rand::rngs::OsRng),
        }
    }

    /// Create a keypair from 32-byte secret scalar material.
    ///
    /// Fails for zero or out-of-range scalars.
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Result<Self, CryptoError> {
        let signing_key =
            SigningKey::from_bytes(&bytes.into()).map_err(|_| CryptoError::InvalidPublicKey)?;
        Ok(Self { signing_key })
    }

    /// SEC1 compressed public key bytes (33 bytes).
    pub fn public_key_bytes(&self) -> Vec<u8> {
        self.signing_key
            .verifying_key()
            .to_encoded_point(true)
            .as_bytes()
            .to_vec()
    }

    /// The address of this keypair's public key on `network`.
    pub fn address(&self, network: crate::address::Network) -> Address {
        Address::from_public_key(network, &self.public_key_bytes())
    }

    /// Sign a message, returning the DER-encoded ECDSA signature.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        let signature: Signature = self.signing_key.sign(message);
        signature.to_der().as_bytes().to_vec()
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &hex::encode(self.public_key_bytes()))
            .finish_non_exhaustive()
    }
}

/// Verify a DER-encoded ECDSA signature against a SEC1 public key.
pub fn verify_signature(
    public_key: &[u8],
    message: &[u8],
    signature_der: &[u8],
) -> Result<(), CryptoError> {
    let verifying_key =
        VerifyingKey::from_sec1_bytes(public_key).map_err(|_| CryptoError::InvalidPublicKey)?;
    let signature =
        Signature::from_der(signature_der).map_err(|_| CryptoError::InvalidSignature)?;
    verifying_key
        .verify(message, &signature)
        .map_err(|_| CryptoError::VerificationFailed)
}

/// Sign a transaction input in place.
///
/// Writes the signature and public key bytes into the input. Inputs can be
/// signed in any order since the sighash excludes witness data.
pub fn sign_transaction_input(
    tx: &mut Transaction,
    input_index: usize,
    keypair: &KeyPair,
) -> Result<(), CryptoError> {
    if input_index >= tx.inputs.len() {
        return Err(CryptoError::InputIndexOutOfBounds {
            index: input_index,
            len: tx.inputs.len(),
        });
    }
    let sighash = tx.sighash();
    tx.inputs[input_index].signature = keypair.sign(sighash.as_bytes());
    tx.inputs[input_index].public_key = keypair.public_key_bytes();
    Ok(())
}

/// Verify a transaction input's signature against the spent output's address.
///
/// Checks that:
/// 1. The input's public key hashes to `expected_address`
/// 2. The DER signature verifies over the transaction sighash
pub fn verify_transaction_input(
    tx: &Transaction,
    input_index: usize,
    expected_address: &Address,
) -> Result<(), CryptoError> {
    let input = tx
        .inputs
        .get(input_index)
        .ok_or(CryptoError::InputIndexOutOfBounds {
            index: input_index,
            len: tx.inputs.len(),
        })?;
    if !expected_address.matches_public_key(&input.public_key) {
        return Err(CryptoError::AddressMismatch);
    }
    let sighash = tx.sighash();
    verify_signature(&input.public_key, sighash.as_bytes(), &input.signature)
}
