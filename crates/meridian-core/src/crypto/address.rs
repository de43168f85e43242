use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use crate::crypto::hash::hash_blake3;
use crate::crypto::keys::PublicKey;
use crate::error::CoreError;

pub const ADDRESS_LEN: usize = 20;

/// 20-byte identity derived from a public key.
///
/// Addresses double as Kademlia node ids: the XOR of two addresses,
/// read as a big-endian unsigned integer, is their distance.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct Address(pub [u8; ADDRESS_LEN]);

impl Address {
    /// Derive the address of a public key (leading bytes of its Blake3 hash)
    pub fn from_public_key(public_key: &PublicKey) -> Self {
        let digest = hash_blake3(public_key.as_bytes());
        let mut bytes = [0u8; ADDRESS_LEN];
        bytes.copy_from_slice(&digest.0[..ADDRESS_LEN]);
        Address(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ADDRESS_LEN] {
        &self.0
    }

    pub fn from_slice(slice: &[u8]) -> Result<Self, CoreError> {
        let bytes: [u8; ADDRESS_LEN] = slice
            .try_into()
            .map_err(|_| CoreError::InvalidAddressLength)?;
        Ok(Address(bytes))
    }

    pub fn from_hex(s: &str) -> Result<Self, CoreError> {
        let bytes = hex::decode(s)?;
        Self::from_slice(&bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// XOR distance to another address
    pub fn distance(&self, other: &Address) -> [u8; ADDRESS_LEN] {
        let mut out = [0u8; ADDRESS_LEN];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    /// Compare which of `a` and `b` is closer to `self`
    pub fn cmp_distance(&self, a: &Address, b: &Address) -> Ordering {
        self.distance(a).cmp(&self.distance(b))
    }

    /// Number of leading zero bits shared with `other` (160 when equal)
    pub fn common_prefix_len(&self, other: &Address) -> usize {
        let distance = self.distance(other);
        let mut bits = 0;
        for byte in distance {
            if byte == 0 {
                bits += 8;
            } else {
                bits += byte.leading_zeros() as usize;
                break;
            }
        }
        bits
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.to_hex())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::KeyPair;

    fn addr(first: u8) -> Address {
        let mut bytes = [0u8; ADDRESS_LEN];
        bytes[0] = first;
        Address(bytes)
    }

    #[test]
    fn test_address_from_public_key_is_stable() {
        let kp = KeyPair::generate();
        assert_eq!(kp.address(), Address::from_public_key(&kp.public));
        assert_eq!(kp.address(), kp.address());
    }

    #[test]
    fn test_distance_to_self_is_zero() {
        let a = addr(0xAB);
        assert_eq!(a.distance(&a), [0u8; ADDRESS_LEN]);
        assert_eq!(a.common_prefix_len(&a), ADDRESS_LEN * 8);
    }

    #[test]
    fn test_distance_ordering() {
        let origin = addr(0b0000_0000);
        let near = addr(0b0000_0001);
        let far = addr(0b1000_0000);
        assert_eq!(origin.cmp_distance(&near, &far), Ordering::Less);
        assert_eq!(origin.common_prefix_len(&near), 7);
        assert_eq!(origin.common_prefix_len(&far), 0);
    }

    #[test]
    fn test_from_slice_length() {
        assert!(Address::from_slice(&[0u8; 19]).is_err());
        assert!(Address::from_slice(&[0u8; 20]).is_ok());
    }
}
