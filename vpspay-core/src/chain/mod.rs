//! EVM chain primitives used by the ledger client and the executor.
//!
//! The ledger exposes an ERC-20 style token contract over an Ethereum
//! compatible JSON-RPC endpoint, so addresses, transaction hashes, ABI words
//! and legacy (EIP-155) transactions are all that is needed here.

pub mod abi;
pub mod address;
pub mod signer;
pub mod transaction;

pub use address::{Address, AddressParseError, TxHash};
pub use signer::{LocalSigner, SignerError};
pub use transaction::{LegacyTransaction, SignedTransaction};

use sha3::{Digest, Keccak256};

/// Keccak-256 digest.
pub fn keccak256(data: impl AsRef<[u8]>) -> [u8; 32] {
    Keccak256::digest(data.as_ref()).into()
}
