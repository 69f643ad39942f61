//! The service's in-process signing key.

use super::address::strip_hex_prefix;
use super::{Address, LegacyTransaction, SignedTransaction, keccak256};
use k256::ecdsa::SigningKey;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use primitive_types::U256;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignerError {
    #[error("private key is not valid hex")]
    Hex,
    #[error("private key is not a valid secp256k1 scalar")]
    InvalidKey,
    #[error("signing failed: {0}")]
    Signing(String),
}

/// A secp256k1 key held by the process, with its derived address.
pub struct LocalSigner {
    key: SigningKey,
    address: Address,
}

impl LocalSigner {
    /// Load from a 32-byte hex private key, with or without `0x`.
    pub fn from_hex(private_key: &str) -> Result<Self, SignerError> {
        let bytes = hex::decode(strip_hex_prefix(private_key.trim())).map_err(|_| SignerError::Hex)?;
        let key = SigningKey::from_slice(&bytes).map_err(|_| SignerError::InvalidKey)?;
        Ok(Self::from_key(key))
    }

    pub fn from_key(key: SigningKey) -> Self {
        let point = key.verifying_key().to_encoded_point(false);
        // Uncompressed SEC1: 0x04 || x || y; the address hashes x || y.
        let digest = keccak256(&point.as_bytes()[1..]);
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&digest[12..]);
        Self {
            key,
            address: Address::new(bytes),
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// Sign per EIP-155: `v = recovery_id + chain_id * 2 + 35`.
    pub fn sign_transaction(
        &self,
        tx: &LegacyTransaction,
        chain_id: u64,
    ) -> Result<SignedTransaction, SignerError> {
        let hash = tx.signing_hash(chain_id);
        let (signature, recovery_id) = self
            .key
            .sign_prehash_recoverable(&hash)
            .map_err(|e| SignerError::Signing(e.to_string()))?;
        let rs = signature.to_bytes();
        let r = U256::from_big_endian(&rs[..32]);
        let s = U256::from_big_endian(&rs[32..]);
        let v = u64::from(recovery_id.to_byte()) + chain_id * 2 + 35;
        Ok(tx.encode_signed(v, r, s))
    }
}

impl std::fmt::Debug for LocalSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalSigner")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::TxHash;

    #[test]
    fn test_address_derivation() {
        let signer = LocalSigner::from_hex(
            "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318",
        )
        .unwrap();
        assert_eq!(
            signer.address().to_string(),
            "0x2c7536e3605d9c16a7a3d7b1898e529396a65c23"
        );
    }

    #[test]
    fn test_eip155_reference_signature() {
        let signer = LocalSigner::from_hex(
            "4646464646464646464646464646464646464646464646464646464646464646",
        )
        .unwrap();
        let tx = LegacyTransaction {
            nonce: 9,
            gas_price: U256::from(20_000_000_000u64),
            gas_limit: 21_000,
            to: "0x3535353535353535353535353535353535353535".parse().unwrap(),
            value: U256::from(1_000_000_000_000_000_000u64),
            data: Vec::new(),
        };
        let signed = signer.sign_transaction(&tx, 1).unwrap();
        assert_eq!(
            hex::encode(&signed.raw),
            "f86c098504a817c800825208943535353535353535353535353535353535353535880de0b6b3a76400008025a028ef61340bd939bc2195fe537567866003e1a15d3c71ff63e1590620aa636276a067cbe9d8997f761aecb703304b3800ccf555c9f3dc64214b297fb1966a3b6d83"
        );
        assert_eq!(signed.hash, TxHash::from_digest(&keccak256(&signed.raw)));
    }

    #[test]
    fn test_rejects_bad_keys() {
        assert!(matches!(LocalSigner::from_hex("zz"), Err(SignerError::Hex)));
        assert!(matches!(
            LocalSigner::from_hex(&"00".repeat(32)),
            Err(SignerError::InvalidKey)
        ));
    }
}
