//! Meridian Core - Identities, cryptography, and consensus data types
//!
//! This crate provides the types shared by the networking and consensus
//! layers: addresses, keys, signatures, peers, validators, votes, blocks
//! and misbehavior evidence.

pub mod crypto;
pub mod error;
pub mod serialize;
pub mod types;

pub use crypto::{
    hash_blake3, sign, verify, Address, Hash, KeyPair, PublicKey, SecretKey, Sig, ADDRESS_LEN,
};
pub use error::CoreError;
pub use types::*;
