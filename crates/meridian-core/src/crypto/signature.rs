use ed25519_dalek::{Signature as DalekSignature, Signer, Verifier};
use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;
use std::fmt;

use crate::crypto::keys::{PublicKey, SecretKey};
use crate::error::CoreError;
use crate::serialize;

/// Ed25519 signature (64 bytes)
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sig(#[serde(with = "BigArray")] pub [u8; 64]);

impl Sig {
    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl Default for Sig {
    fn default() -> Self {
        Sig([0u8; 64])
    }
}

impl fmt::Debug for Sig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sig({}...)", &self.to_hex()[..16])
    }
}

/// Sign a message with a secret key
pub fn sign(secret_key: &SecretKey, message: &[u8]) -> Sig {
    Sig(secret_key.signing_key().sign(message).to_bytes())
}

/// Verify a signature against a public key and message
pub fn verify(public_key: &PublicKey, message: &[u8], signature: &Sig) -> Result<(), CoreError> {
    let verifying_key = public_key.to_verifying_key()?;
    let dalek_sig = DalekSignature::from_bytes(&signature.0);
    verifying_key
        .verify(message, &dalek_sig)
        .map_err(|_| CoreError::InvalidSignature)
}

/// Sign the bincode encoding of a message body
pub fn sign_body<T: Serialize>(secret_key: &SecretKey, body: &T) -> Result<Sig, CoreError> {
    let bytes = serialize::to_bytes(body)?;
    Ok(sign(secret_key, &bytes))
}

/// Verify a signature over the bincode encoding of a message body
pub fn verify_body<T: Serialize>(
    public_key: &PublicKey,
    body: &T,
    signature: &Sig,
) -> Result<(), CoreError> {
    let bytes = serialize::to_bytes(body)?;
    verify(public_key, &bytes, signature)
}
