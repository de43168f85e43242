use meridian_core::{Address, Evidence, EvidenceId, Peer, Proposal, Vote};
use rand::RngCore;
use std::fmt;

use crate::error::CodecError;

/// Message discriminant, the first frame of every message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum MessageKind {
    Ping = 0x01,
    Pong = 0x02,
    PeerRequest = 0x03,
    PeerResponse = 0x04,
    GetEvidences = 0x10,
    EvidencesResponse = 0x11,
    EvidenceIds = 0x12,
    Proposal = 0x20,
    PreVote = 0x21,
    PreCommit = 0x22,
}

impl MessageKind {
    /// Kinds that answer a correlated request
    pub fn is_reply(self) -> bool {
        matches!(
            self,
            MessageKind::Pong | MessageKind::PeerResponse | MessageKind::EvidencesResponse
        )
    }
}

impl TryFrom<u8> for MessageKind {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        let kind = match value {
            0x01 => MessageKind::Ping,
            0x02 => MessageKind::Pong,
            0x03 => MessageKind::PeerRequest,
            0x04 => MessageKind::PeerResponse,
            0x10 => MessageKind::GetEvidences,
            0x11 => MessageKind::EvidencesResponse,
            0x12 => MessageKind::EvidenceIds,
            0x20 => MessageKind::Proposal,
            0x21 => MessageKind::PreVote,
            0x22 => MessageKind::PreCommit,
            other => return Err(CodecError::UnknownMessageKind(other)),
        };
        Ok(kind)
    }
}

/// Opaque correlation token linking a reply to its request
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Identity(pub [u8; 16]);

impl Identity {
    pub const LEN: usize = 16;

    pub fn random() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        Identity(bytes)
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({})", hex::encode(self.0))
    }
}

/// Who sent a message and how to answer it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub sender: Peer,
    /// Present when the sender waits for a correlated reply
    pub identity: Option<Identity>,
    pub kind: MessageKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Ping,
    Pong,
    PeerRequest { target: Address, k: u32 },
    PeerResponse { peers: Vec<Peer> },
    GetEvidences { ids: Vec<EvidenceId> },
    EvidencesResponse { evidences: Vec<Evidence> },
    EvidenceIds { ids: Vec<EvidenceId> },
    Proposal(Proposal),
    PreVote(Vote),
    PreCommit(Vote),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Ping => MessageKind::Ping,
            Message::Pong => MessageKind::Pong,
            Message::PeerRequest { .. } => MessageKind::PeerRequest,
            Message::PeerResponse { .. } => MessageKind::PeerResponse,
            Message::GetEvidences { .. } => MessageKind::GetEvidences,
            Message::EvidencesResponse { .. } => MessageKind::EvidencesResponse,
            Message::EvidenceIds { .. } => MessageKind::EvidenceIds,
            Message::Proposal(_) => MessageKind::Proposal,
            Message::PreVote(_) => MessageKind::PreVote,
            Message::PreCommit(_) => MessageKind::PreCommit,
        }
    }
}
