use meridian_core::VoteStep;
use meridian_net::{
    Dispatcher, Envelope, HandlerError, Message, MessageHandler, MessageKind, Outbound,
};
use std::sync::Arc;
use tracing::debug;

use crate::runner::ConsensusHandle;
use crate::state_machine::{ConsensusEvent, ConsensusMessage};

pub(crate) fn to_message(message: ConsensusMessage) -> Message {
    match message {
        ConsensusMessage::Proposal(proposal) => Message::Proposal(proposal),
        ConsensusMessage::Vote(vote) => match vote.step {
            VoteStep::PreVote => Message::PreVote(vote),
            VoteStep::PreCommit => Message::PreCommit(vote),
        },
    }
}

/// Bridges consensus messages from the dispatcher into the consensus queue
#[derive(Clone)]
pub struct ConsensusReactor {
    handle: ConsensusHandle,
}

impl ConsensusReactor {
    pub fn new(handle: ConsensusHandle) -> Self {
        ConsensusReactor { handle }
    }

    pub fn register(&self, dispatcher: &mut Dispatcher) {
        let reactor = Arc::new(self.clone());
        dispatcher.register(MessageKind::Proposal, reactor.clone());
        dispatcher.register(MessageKind::PreVote, reactor.clone());
        dispatcher.register(MessageKind::PreCommit, reactor);
    }
}

impl MessageHandler for ConsensusReactor {
    fn handle(
        &self,
        envelope: &Envelope,
        message: &Message,
    ) -> Result<Vec<Outbound>, HandlerError> {
        let event = match message {
            Message::Proposal(proposal) => ConsensusEvent::ProposalReceived(proposal.clone()),
            Message::PreVote(vote) | Message::PreCommit(vote) => {
                ConsensusEvent::VoteReceived(vote.clone())
            }
            other => return Err(HandlerError::UnexpectedMessage(other.kind())),
        };

        debug!(
            "Queued {:?} from {}",
            message.kind(),
            envelope.sender.address()
        );
        self.handle
            .try_send(event)
            .map_err(|e| HandlerError::Rejected(e.to_string()))?;
        Ok(Vec::new())
    }
}
