//! Legacy (EIP-155) transaction encoding.

use super::{Address, TxHash, keccak256};
use primitive_types::U256;
use rlp::RlpStream;

/// An unsigned legacy transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyTransaction {
    pub nonce: u64,
    pub gas_price: U256,
    pub gas_limit: u64,
    pub to: Address,
    pub value: U256,
    pub data: Vec<u8>,
}

/// A signed, RLP encoded transaction ready for `eth_sendRawTransaction`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction {
    pub raw: Vec<u8>,
    pub hash: TxHash,
}

impl LegacyTransaction {
    fn append_body(&self, stream: &mut RlpStream) {
        stream.append(&self.nonce);
        stream.append(&self.gas_price);
        stream.append(&self.gas_limit);
        stream.append(&self.to.as_bytes().to_vec());
        stream.append(&self.value);
        stream.append(&self.data);
    }

    /// The EIP-155 signing payload: the body followed by `chain_id, 0, 0`.
    pub fn signing_payload(&self, chain_id: u64) -> Vec<u8> {
        let mut stream = RlpStream::new_list(9);
        self.append_body(&mut stream);
        stream.append(&chain_id);
        stream.append(&0u8);
        stream.append(&0u8);
        stream.out().to_vec()
    }

    pub fn signing_hash(&self, chain_id: u64) -> [u8; 32] {
        keccak256(self.signing_payload(chain_id))
    }

    /// Encode with the signature fields in place of the chain id trailer.
    pub fn encode_signed(&self, v: u64, r: U256, s: U256) -> SignedTransaction {
        let mut stream = RlpStream::new_list(9);
        self.append_body(&mut stream);
        stream.append(&v);
        stream.append(&r);
        stream.append(&s);
        let raw = stream.out().to_vec();
        let hash = TxHash::from_digest(&keccak256(&raw));
        SignedTransaction { raw, hash }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eip155_example() -> LegacyTransaction {
        LegacyTransaction {
            nonce: 9,
            gas_price: U256::from(20_000_000_000u64),
            gas_limit: 21_000,
            to: "0x3535353535353535353535353535353535353535".parse().unwrap(),
            value: U256::from(1_000_000_000_000_000_000u64),
            data: Vec::new(),
        }
    }

    #[test]
    fn test_eip155_signing_payload() {
        let tx = eip155_example();
        assert_eq!(
            hex::encode(tx.signing_payload(1)),
            "ec098504a817c800825208943535353535353535353535353535353535353535880de0b6b3a764000080018080"
        );
        assert_eq!(
            hex::encode(tx.signing_hash(1)),
            "daf5a779ae972f972197303d7b574746c7ef83eadac0f2791ad23db92e4c8e53"
        );
    }
}
