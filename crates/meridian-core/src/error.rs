use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Invalid public key")]
    InvalidPublicKey,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Invalid hash length")]
    InvalidHashLength,

    #[error("Invalid address length")]
    InvalidAddressLength,

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Invalid validator set: {0}")]
    InvalidValidatorSet(String),

    #[error("Invalid commit: {0}")]
    InvalidCommit(String),

    #[error("Invalid evidence: {0}")]
    InvalidEvidence(String),

    #[error("Hex decode error: {0}")]
    HexDecode(#[from] hex::FromHexError),
}
