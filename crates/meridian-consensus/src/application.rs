use meridian_core::{Block, CommittedBlock};

/// The execution engine sitting behind consensus. Payloads are opaque
/// to everything else.
pub trait Application: Send {
    /// Payload for the block this node proposes at `height`
    fn propose_payload(&mut self, height: u64) -> Vec<u8>;

    /// Accept or reject a proposed block. Rejected blocks get a nil prevote.
    fn validate_block(&self, block: &Block) -> Result<(), String>;

    fn on_commit(&mut self, _committed: &CommittedBlock) {}
}

/// Proposes the height as payload and accepts every block
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopApplication;

impl Application for NoopApplication {
    fn propose_payload(&mut self, height: u64) -> Vec<u8> {
        height.to_be_bytes().to_vec()
    }

    fn validate_block(&self, _block: &Block) -> Result<(), String> {
        Ok(())
    }
}
