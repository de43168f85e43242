//! Multi-frame wire encoding.
//!
//! A message is `[frame_count: u32][len: u32][bytes]...`, big-endian. Frame 0
//! holds the kind, frame 1 the correlation identity (empty when absent),
//! frame 2 the sender and the remaining frames the kind-specific payload.

use meridian_core::{serialize, Address, Evidence, EvidenceId, Peer, VoteStep, ADDRESS_LEN};
use thiserror::Error;

use crate::error::CodecError;
use crate::message::{Envelope, Identity, Message, MessageKind};

pub type Frame = Vec<u8>;

/// Largest encoded message accepted from the wire
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

const HEADER_FRAMES: usize = 3;

/// Failed to decode inbound bytes. `sender` is set when the header frames
/// were readable, so the failure can be charged to that peer.
#[derive(Debug, Error)]
#[error("{source}")]
pub struct DecodeError {
    pub sender: Option<Peer>,
    #[source]
    pub source: CodecError,
}

impl DecodeError {
    fn anonymous(source: CodecError) -> Self {
        DecodeError {
            sender: None,
            source,
        }
    }
}

fn malformed(reason: impl Into<String>) -> CodecError {
    CodecError::MalformedFrame(reason.into())
}

/// Encode a message sent by `sender`
pub fn encode(
    sender: &Peer,
    identity: Option<Identity>,
    message: &Message,
) -> Result<Vec<u8>, CodecError> {
    let mut frames = vec![
        vec![message.kind() as u8],
        identity.map(|id| id.0.to_vec()).unwrap_or_default(),
        serialize::to_bytes(sender)?,
    ];
    frames.extend(encode_payload(message)?);

    let bytes = encode_frames(&frames);
    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(CodecError::MessageTooLarge {
            size: bytes.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(bytes)
}

/// Decode a message and the envelope describing its origin
pub fn decode(bytes: &[u8]) -> Result<(Envelope, Message), DecodeError> {
    let frames = decode_frames(bytes).map_err(DecodeError::anonymous)?;
    if frames.len() < HEADER_FRAMES {
        return Err(DecodeError::anonymous(malformed(format!(
            "expected at least {} header frames, got {}",
            HEADER_FRAMES,
            frames.len()
        ))));
    }

    let sender: Peer = serialize::from_bytes(&frames[2])
        .map_err(|e| DecodeError::anonymous(CodecError::from(e)))?;
    let attribute = |source: CodecError| DecodeError {
        sender: Some(sender.clone()),
        source,
    };

    let kind = match frames[0].as_slice() {
        [discriminant] => MessageKind::try_from(*discriminant).map_err(attribute)?,
        _ => return Err(attribute(malformed("kind frame must be one byte"))),
    };
    let identity = match frames[1].len() {
        0 => None,
        Identity::LEN => {
            let mut id = [0u8; Identity::LEN];
            id.copy_from_slice(&frames[1]);
            Some(Identity(id))
        }
        n => return Err(attribute(malformed(format!("identity frame of {} bytes", n)))),
    };

    let message = decode_payload(kind, &frames[HEADER_FRAMES..]).map_err(attribute)?;
    Ok((
        Envelope {
            sender,
            identity,
            kind,
        },
        message,
    ))
}

/// Payload frames for a message, excluding the header frames
pub fn encode_payload(message: &Message) -> Result<Vec<Frame>, CodecError> {
    let frames = match message {
        Message::Ping | Message::Pong => Vec::new(),
        Message::PeerRequest { target, k } => {
            vec![target.as_bytes().to_vec(), k.to_be_bytes().to_vec()]
        }
        Message::PeerResponse { peers } => {
            let mut frames = vec![count_frame(peers.len())?];
            for peer in peers {
                frames.push(serialize::to_bytes(peer)?);
            }
            frames
        }
        Message::GetEvidences { ids } | Message::EvidenceIds { ids } => encode_id_list(ids)?,
        Message::EvidencesResponse { evidences } => {
            let mut frames = vec![count_frame(evidences.len())?];
            for evidence in evidences {
                frames.push(evidence.encode()?);
            }
            frames
        }
        Message::Proposal(proposal) => vec![serialize::to_bytes(proposal)?],
        Message::PreVote(vote) | Message::PreCommit(vote) => vec![serialize::to_bytes(vote)?],
    };
    Ok(frames)
}

/// Decode payload frames for `kind`. Frames past the declared content are
/// ignored.
pub fn decode_payload(kind: MessageKind, frames: &[Frame]) -> Result<Message, CodecError> {
    let message = match kind {
        MessageKind::Ping => Message::Ping,
        MessageKind::Pong => Message::Pong,
        MessageKind::PeerRequest => {
            let [target, k, ..] = frames else {
                return Err(malformed("peer request needs target and k frames"));
            };
            let target = Address::from_slice(target).map_err(|_| {
                malformed(format!("target frame must be {} bytes", ADDRESS_LEN))
            })?;
            let k: [u8; 4] = k
                .as_slice()
                .try_into()
                .map_err(|_| malformed("k frame must be 4 bytes"))?;
            Message::PeerRequest {
                target,
                k: u32::from_be_bytes(k),
            }
        }
        MessageKind::PeerResponse => {
            let items = counted_frames(frames)?;
            let peers = items
                .iter()
                .map(|frame| serialize::from_bytes(frame).map_err(CodecError::from))
                .collect::<Result<Vec<Peer>, _>>()?;
            Message::PeerResponse { peers }
        }
        MessageKind::GetEvidences => Message::GetEvidences {
            ids: decode_id_list(frames)?,
        },
        MessageKind::EvidenceIds => Message::EvidenceIds {
            ids: decode_id_list(frames)?,
        },
        MessageKind::EvidencesResponse => {
            let items = counted_frames(frames)?;
            let evidences = items
                .iter()
                .map(|frame| Evidence::decode(frame).map_err(CodecError::from))
                .collect::<Result<Vec<_>, _>>()?;
            Message::EvidencesResponse { evidences }
        }
        MessageKind::Proposal => {
            let frame = frames.first().ok_or_else(|| malformed("missing proposal frame"))?;
            Message::Proposal(serialize::from_bytes(frame)?)
        }
        MessageKind::PreVote | MessageKind::PreCommit => {
            let frame = frames.first().ok_or_else(|| malformed("missing vote frame"))?;
            let vote: meridian_core::Vote = serialize::from_bytes(frame)?;
            match (kind, vote.step) {
                (MessageKind::PreVote, VoteStep::PreVote) => Message::PreVote(vote),
                (MessageKind::PreCommit, VoteStep::PreCommit) => Message::PreCommit(vote),
                _ => return Err(malformed(format!("{} vote in {:?} message", vote.step, kind))),
            }
        }
    };
    Ok(message)
}

/// `[count: i32][id]*count`
pub fn encode_id_list(ids: &[EvidenceId]) -> Result<Vec<Frame>, CodecError> {
    let mut frames = Vec::with_capacity(ids.len() + 1);
    frames.push(count_frame(ids.len())?);
    frames.extend(ids.iter().map(|id| id.as_bytes().to_vec()));
    Ok(frames)
}

pub fn decode_id_list(frames: &[Frame]) -> Result<Vec<EvidenceId>, CodecError> {
    counted_frames(frames)?
        .iter()
        .map(|frame| {
            EvidenceId::from_slice(frame).ok_or_else(|| {
                malformed(format!(
                    "evidence id frame of {} bytes, expected {}",
                    frame.len(),
                    EvidenceId::LEN
                ))
            })
        })
        .collect()
}

fn count_frame(count: usize) -> Result<Frame, CodecError> {
    let count = i32::try_from(count).map_err(|_| malformed("too many items for one message"))?;
    Ok(count.to_be_bytes().to_vec())
}

/// Split a `[count][item]*` list into its item frames
fn counted_frames(frames: &[Frame]) -> Result<&[Frame], CodecError> {
    let (count, items) = frames
        .split_first()
        .ok_or_else(|| malformed("missing count frame"))?;
    let count: [u8; 4] = count
        .as_slice()
        .try_into()
        .map_err(|_| malformed("count frame must be 4 bytes"))?;
    let count = usize::try_from(i32::from_be_bytes(count))
        .map_err(|_| malformed("negative item count"))?;

    if items.len() < count {
        return Err(malformed(format!(
            "declared {} items, only {} frames present",
            count,
            items.len()
        )));
    }
    Ok(&items[..count])
}

pub fn encode_frames(frames: &[Frame]) -> Vec<u8> {
    let size = 4 + frames.iter().map(|f| 4 + f.len()).sum::<usize>();
    let mut bytes = Vec::with_capacity(size);
    bytes.extend_from_slice(&(frames.len() as u32).to_be_bytes());
    for frame in frames {
        bytes.extend_from_slice(&(frame.len() as u32).to_be_bytes());
        bytes.extend_from_slice(frame);
    }
    bytes
}

pub fn decode_frames(bytes: &[u8]) -> Result<Vec<Frame>, CodecError> {
    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(CodecError::MessageTooLarge {
            size: bytes.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }

    let mut cursor = bytes;
    let count = read_u32(&mut cursor)? as usize;
    // Every frame costs at least its length prefix
    if count > cursor.len() / 4 {
        return Err(malformed(format!("frame count {} exceeds message", count)));
    }

    let mut frames = Vec::with_capacity(count);
    for _ in 0..count {
        let len = read_u32(&mut cursor)? as usize;
        if len > cursor.len() {
            return Err(malformed(format!(
                "frame of {} bytes, {} remaining",
                len,
                cursor.len()
            )));
        }
        let (frame, rest) = cursor.split_at(len);
        frames.push(frame.to_vec());
        cursor = rest;
    }
    if !cursor.is_empty() {
        return Err(malformed(format!("{} trailing bytes", cursor.len())));
    }
    Ok(frames)
}

fn read_u32(cursor: &mut &[u8]) -> Result<u32, CodecError> {
    if cursor.len() < 4 {
        return Err(malformed("truncated length prefix"));
    }
    let (head, rest) = cursor.split_at(4);
    *cursor = rest;
    let mut raw = [0u8; 4];
    raw.copy_from_slice(head);
    Ok(u32::from_be_bytes(raw))
}
