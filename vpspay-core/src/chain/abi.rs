//! Minimal ERC-20 ABI encoding.
//!
//! Only the calls the service issues (`transfer`, `mint`, `balanceOf`) and the
//! `Transfer` event it watches are covered.

use super::{Address, keccak256};
use vpspay_sdk::objects::TokenAmount;

pub const TRANSFER_SIGNATURE: &str = "transfer(address,uint256)";
pub const MINT_SIGNATURE: &str = "mint(address,uint256)";
pub const BALANCE_OF_SIGNATURE: &str = "balanceOf(address)";
pub const TRANSFER_EVENT_SIGNATURE: &str = "Transfer(address,address,uint256)";

/// First four bytes of the keccak hash of a function signature.
pub fn selector(signature: &str) -> [u8; 4] {
    let digest = keccak256(signature.as_bytes());
    [digest[0], digest[1], digest[2], digest[3]]
}

/// `topics[0]` of every ERC-20 `Transfer` log.
pub fn transfer_event_topic() -> [u8; 32] {
    keccak256(TRANSFER_EVENT_SIGNATURE.as_bytes())
}

fn encode_address_amount(signature: &str, to: &Address, amount: &TokenAmount) -> Vec<u8> {
    let mut data = Vec::with_capacity(4 + 64);
    data.extend_from_slice(&selector(signature));
    data.extend_from_slice(&to.to_word());
    data.extend_from_slice(&amount.to_be_bytes());
    data
}

pub fn encode_transfer(to: &Address, amount: &TokenAmount) -> Vec<u8> {
    encode_address_amount(TRANSFER_SIGNATURE, to, amount)
}

pub fn encode_mint(to: &Address, amount: &TokenAmount) -> Vec<u8> {
    encode_address_amount(MINT_SIGNATURE, to, amount)
}

pub fn encode_balance_of(owner: &Address) -> Vec<u8> {
    let mut data = Vec::with_capacity(4 + 32);
    data.extend_from_slice(&selector(BALANCE_OF_SIGNATURE));
    data.extend_from_slice(&owner.to_word());
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_selectors() {
        assert_eq!(hex::encode(selector(TRANSFER_SIGNATURE)), "a9059cbb");
        assert_eq!(hex::encode(selector(BALANCE_OF_SIGNATURE)), "70a08231");
        assert_eq!(hex::encode(selector(MINT_SIGNATURE)), "40c10f19");
    }

    #[test]
    fn test_transfer_topic() {
        assert_eq!(
            hex::encode(transfer_event_topic()),
            "ddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"
        );
    }

    #[test]
    fn test_transfer_call_layout() {
        let to: Address = "0x00000000000000000000000000000000000000aa".parse().unwrap();
        let data = encode_transfer(&to, &TokenAmount::from(100u64));
        assert_eq!(data.len(), 68);
        assert_eq!(&data[..4], &[0xa9, 0x05, 0x9c, 0xbb]);
        assert_eq!(data[35], 0xaa);
        assert_eq!(data[67], 100);
    }
}
