//! Byzantine misbehavior evidence.
//!
//! Every evidence record travels as an [`EvidenceRecord`]: a type tag, the
//! fields common to all kinds (height, target validator, timestamp) and an
//! opaque kind-specific payload. Decoding never fails on an unrecognized tag;
//! such records become [`Evidence::Unknown`] so nodes running an older
//! version keep gossiping with newer ones.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

use crate::crypto::{hash_blake3, Address, Hash};
use crate::error::CoreError;
use crate::serialize;
use crate::types::validator::ValidatorSet;
use crate::types::vote::Vote;

pub const DUPLICATE_VOTE_TAG: &str = "duplicate_vote";

/// Content identifier of an evidence record (Blake3 of its encoding)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct EvidenceId(pub Hash);

impl EvidenceId {
    pub const LEN: usize = Hash::LEN;

    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        Hash::from_slice(slice).map(EvidenceId)
    }
}

impl fmt::Debug for EvidenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EvidenceId({})", self.0.to_hex())
    }
}

impl fmt::Display for EvidenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.short())
    }
}

/// Wire form shared by all evidence kinds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceRecord {
    pub tag: String,
    pub height: u64,
    pub target: Address,
    pub timestamp: DateTime<Utc>,
    pub payload: Vec<u8>,
}

impl EvidenceRecord {
    pub fn encode(&self) -> Result<Vec<u8>, CoreError> {
        serialize::to_bytes(self)
    }
}

#[derive(Serialize, Deserialize)]
struct DuplicateVotePayload {
    vote_a: Vote,
    vote_b: Vote,
    validator_power: u64,
    total_power: u64,
}

/// Two conflicting votes signed by one validator for the same
/// (height, round, step)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateVoteEvidence {
    id: EvidenceId,
    vote_a: Vote,
    vote_b: Vote,
    validator_power: u64,
    total_power: u64,
}

impl DuplicateVoteEvidence {
    /// Package two conflicting votes. The pair is stored in a canonical
    /// order so every node detecting the same equivocation derives the
    /// same evidence id.
    pub fn new(
        vote_a: Vote,
        vote_b: Vote,
        validator_power: u64,
        total_power: u64,
    ) -> Result<Self, CoreError> {
        if !vote_a.conflicts_with(&vote_b) {
            return Err(CoreError::InvalidEvidence(
                "votes do not conflict".to_string(),
            ));
        }
        let (vote_a, vote_b) = if vote_a.block_hash <= vote_b.block_hash {
            (vote_a, vote_b)
        } else {
            (vote_b, vote_a)
        };

        let mut evidence = DuplicateVoteEvidence {
            id: EvidenceId::default(),
            vote_a,
            vote_b,
            validator_power,
            total_power,
        };
        evidence.id = EvidenceId(hash_blake3(&evidence.record()?.encode()?));
        Ok(evidence)
    }

    pub fn id(&self) -> EvidenceId {
        self.id
    }

    pub fn votes(&self) -> (&Vote, &Vote) {
        (&self.vote_a, &self.vote_b)
    }

    pub fn height(&self) -> u64 {
        self.vote_a.height
    }

    pub fn target(&self) -> Address {
        self.vote_a.validator_address()
    }

    /// The later of the two vote timestamps
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.vote_a.timestamp.max(self.vote_b.timestamp)
    }

    pub fn validator_power(&self) -> u64 {
        self.validator_power
    }

    pub fn total_power(&self) -> u64 {
        self.total_power
    }

    fn record(&self) -> Result<EvidenceRecord, CoreError> {
        let payload = serialize::to_bytes(&DuplicateVotePayload {
            vote_a: self.vote_a.clone(),
            vote_b: self.vote_b.clone(),
            validator_power: self.validator_power,
            total_power: self.total_power,
        })?;
        Ok(EvidenceRecord {
            tag: DUPLICATE_VOTE_TAG.to_string(),
            height: self.height(),
            target: self.target(),
            timestamp: self.timestamp(),
            payload,
        })
    }

    /// Check signatures and recorded powers against the validator set of
    /// the evidence height
    pub fn verify(&self, validators: &ValidatorSet) -> Result<(), CoreError> {
        self.vote_a.verify()?;
        self.vote_b.verify()?;

        let validator = validators.get(&self.vote_a.validator).ok_or_else(|| {
            CoreError::InvalidEvidence(format!("{} is not a validator", self.target()))
        })?;
        if validator.power != self.validator_power || validators.total_power() != self.total_power {
            return Err(CoreError::InvalidEvidence(
                "recorded voting power does not match validator set".to_string(),
            ));
        }
        Ok(())
    }
}

/// Fallback for evidence kinds this node does not recognize. Only the common
/// fields survive decoding; the kind-specific payload is dropped.
#[derive(Debug, Clone)]
pub struct UnknownEvidence {
    pub id: EvidenceId,
    pub tag: String,
    pub height: u64,
    pub target: Address,
    pub timestamp: DateTime<Utc>,
}

// Two fallbacks with identical common fields are equal even if their
// dropped payloads differed.
impl PartialEq for UnknownEvidence {
    fn eq(&self, other: &Self) -> bool {
        self.height == other.height
            && self.target == other.target
            && self.timestamp == other.timestamp
    }
}

impl Eq for UnknownEvidence {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Evidence {
    DuplicateVote(DuplicateVoteEvidence),
    Unknown(UnknownEvidence),
}

impl Evidence {
    pub fn id(&self) -> EvidenceId {
        match self {
            Evidence::DuplicateVote(e) => e.id(),
            Evidence::Unknown(e) => e.id,
        }
    }

    pub fn tag(&self) -> &str {
        match self {
            Evidence::DuplicateVote(_) => DUPLICATE_VOTE_TAG,
            Evidence::Unknown(e) => &e.tag,
        }
    }

    pub fn height(&self) -> u64 {
        match self {
            Evidence::DuplicateVote(e) => e.height(),
            Evidence::Unknown(e) => e.height,
        }
    }

    pub fn target(&self) -> Address {
        match self {
            Evidence::DuplicateVote(e) => e.target(),
            Evidence::Unknown(e) => e.target,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Evidence::DuplicateVote(e) => e.timestamp(),
            Evidence::Unknown(e) => e.timestamp,
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Evidence::Unknown(_))
    }

    /// Encode to the record wire form. Unknown evidence re-encodes with an
    /// empty payload.
    pub fn encode(&self) -> Result<Vec<u8>, CoreError> {
        let record = match self {
            Evidence::DuplicateVote(e) => e.record()?,
            Evidence::Unknown(e) => EvidenceRecord {
                tag: e.tag.clone(),
                height: e.height,
                target: e.target,
                timestamp: e.timestamp,
                payload: Vec::new(),
            },
        };
        record.encode()
    }

    /// Decode a record. Fails only if the bytes are not a record at all or
    /// a recognized kind carries a corrupt payload.
    pub fn decode(bytes: &[u8]) -> Result<Self, CoreError> {
        let record: EvidenceRecord = serialize::from_bytes(bytes)?;

        match record.tag.as_str() {
            DUPLICATE_VOTE_TAG => {
                let payload: DuplicateVotePayload = serialize::from_bytes(&record.payload)?;
                let evidence = DuplicateVoteEvidence::new(
                    payload.vote_a,
                    payload.vote_b,
                    payload.validator_power,
                    payload.total_power,
                )?;
                if evidence.height() != record.height
                    || evidence.target() != record.target
                    || evidence.timestamp() != record.timestamp
                {
                    return Err(CoreError::InvalidEvidence(
                        "common fields disagree with payload".to_string(),
                    ));
                }
                Ok(Evidence::DuplicateVote(evidence))
            }
            _ => Ok(Evidence::Unknown(UnknownEvidence {
                id: EvidenceId(hash_blake3(bytes)),
                tag: record.tag,
                height: record.height,
                target: record.target,
                timestamp: record.timestamp,
            })),
        }
    }
}

impl From<DuplicateVoteEvidence> for Evidence {
    fn from(evidence: DuplicateVoteEvidence) -> Self {
        Evidence::DuplicateVote(evidence)
    }
}

impl Serialize for Evidence {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::Error;
        let bytes = self.encode().map_err(S::Error::custom)?;
        bytes.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Evidence {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::Error;
        let bytes = Vec::<u8>::deserialize(deserializer)?;
        Evidence::decode(&bytes).map_err(D::Error::custom)
    }
}
