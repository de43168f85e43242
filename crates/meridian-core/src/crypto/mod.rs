pub mod address;
pub mod hash;
pub mod keys;
pub mod signature;

pub use address::{Address, ADDRESS_LEN};
pub use hash::{hash_blake3, Hash};
pub use keys::{KeyPair, PublicKey, SecretKey};
pub use signature::{sign, sign_body, verify, verify_body, Sig};
