use meridian_core::{serialize, CommittedBlock, EvidenceId, Hash};
use tracing::{debug, info};

use crate::error::StateError;
use crate::storage::{Storage, WriteBatch};

const TIP_KEY: &[u8] = b"meta/tip";
const BLOCK_PREFIX: &[u8] = b"block/";
const EVIDENCE_PREFIX: &[u8] = b"evidence/";

fn block_key(height: u64) -> Vec<u8> {
    let mut key = BLOCK_PREFIX.to_vec();
    key.extend_from_slice(&height.to_be_bytes());
    key
}

fn evidence_key(id: &EvidenceId) -> Vec<u8> {
    let mut key = EVIDENCE_PREFIX.to_vec();
    key.extend_from_slice(id.as_bytes());
    key
}

fn decode_height(bytes: &[u8]) -> Result<u64, StateError> {
    let raw: [u8; 8] = bytes.try_into().map_err(|_| StateError::Corrupt {
        what: "height",
        reason: format!("{} bytes", bytes.len()),
    })?;
    Ok(u64::from_be_bytes(raw))
}

fn decode_evidence_id(key: &[u8]) -> Result<EvidenceId, StateError> {
    let raw: [u8; 32] = key[EVIDENCE_PREFIX.len()..]
        .try_into()
        .map_err(|_| StateError::Corrupt {
            what: "evidence index key",
            reason: format!("{} bytes", key.len()),
        })?;
    Ok(EvidenceId(Hash(raw)))
}

/// Height-ordered log of committed blocks, each stored with the precommit
/// quorum that committed it. Evidence included in committed blocks is
/// indexed by id so it is never included twice.
pub struct BlockStore<S: Storage> {
    storage: S,
}

impl<S: Storage> BlockStore<S> {
    pub fn new(storage: S) -> Self {
        BlockStore { storage }
    }

    /// Height of the highest committed block
    pub fn tip_height(&self) -> Result<Option<u64>, StateError> {
        self.storage
            .get(TIP_KEY)?
            .map(|bytes| decode_height(&bytes))
            .transpose()
    }

    /// The highest committed block
    pub fn tip(&self) -> Result<Option<CommittedBlock>, StateError> {
        match self.tip_height()? {
            Some(height) => self.get(height),
            None => Ok(None),
        }
    }

    pub fn get(&self, height: u64) -> Result<Option<CommittedBlock>, StateError> {
        self.storage
            .get(&block_key(height))?
            .map(|bytes| serialize::from_bytes(&bytes).map_err(StateError::from))
            .transpose()
    }

    /// Committed blocks in `[from, to]`, stopping at the first gap
    pub fn range(&self, from: u64, to: u64) -> Result<Vec<CommittedBlock>, StateError> {
        let mut blocks = Vec::new();
        for height in from..=to {
            match self.get(height)? {
                Some(block) => blocks.push(block),
                None => break,
            }
        }
        Ok(blocks)
    }

    /// Append the next committed block. The first block may have any
    /// height; every later one must extend the tip by exactly one.
    pub fn append(&mut self, committed: CommittedBlock) -> Result<(), StateError> {
        let height = committed.block.height();
        let block_hash = committed.block.hash()?;

        if committed.commit.height != height || committed.commit.block_hash != block_hash {
            return Err(StateError::CommitMismatch {
                height,
                block_hash,
                commit_height: committed.commit.height,
                commit_hash: committed.commit.block_hash,
            });
        }

        if self.storage.contains(&block_key(height))? {
            return Err(StateError::BlockExists(height));
        }
        if let Some(tip) = self.tip_height()? {
            if height != tip + 1 {
                return Err(StateError::HeightGap {
                    expected: tip + 1,
                    got: height,
                });
            }
        }

        let mut batch = WriteBatch::new();
        batch
            .put(block_key(height), serialize::to_bytes(&committed)?)
            .put(TIP_KEY, height.to_be_bytes());
        for evidence in &committed.block.evidence {
            batch.put(evidence_key(&evidence.id()), height.to_be_bytes());
        }
        self.storage.write(batch)?;

        debug!(
            "Stored block {} with {} precommits",
            block_hash,
            committed.commit.votes.len()
        );
        info!("Committed block at height {}", height);
        Ok(())
    }

    /// Height at which evidence was committed, if it was
    pub fn evidence_height(&self, id: &EvidenceId) -> Result<Option<u64>, StateError> {
        self.storage
            .get(&evidence_key(id))?
            .map(|bytes| decode_height(&bytes))
            .transpose()
    }

    pub fn contains_evidence(&self, id: &EvidenceId) -> Result<bool, StateError> {
        self.storage.contains(&evidence_key(id))
    }

    /// Evidence committed at `from` or later, with the height of the block
    /// that included it
    pub fn evidence_since(&self, from: u64) -> Result<Vec<(EvidenceId, u64)>, StateError> {
        let mut found = Vec::new();
        for (key, value) in self.storage.scan_prefix(EVIDENCE_PREFIX)? {
            let height = decode_height(&value)?;
            if height >= from {
                found.push((decode_evidence_id(&key)?, height));
            }
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{FileStorage, MemoryStorage};
    use chrono::{DateTime, Utc};
    use meridian_core::{
        Block, Commit, DuplicateVoteEvidence, Evidence, Hash, KeyPair, Vote, VoteStep,
    };

    fn ts() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn committed(height: u64, prev_hash: Hash, evidence: Vec<Evidence>) -> CommittedBlock {
        let proposer = KeyPair::from_seed(1);
        let block = Block::new(height, prev_hash, proposer.public, ts(), vec![height as u8], evidence);
        let hash = block.hash().unwrap();
        let vote = Vote::new_signed(&proposer, height, 0, VoteStep::PreCommit, Some(hash), ts()).unwrap();
        CommittedBlock {
            block,
            commit: Commit {
                height,
                round: 0,
                block_hash: hash,
                votes: vec![vote],
            },
        }
    }

    #[test]
    fn test_append_and_read_back() {
        let mut store = BlockStore::new(MemoryStorage::new());
        assert_eq!(store.tip_height().unwrap(), None);

        let first = committed(1, Hash::ZERO, vec![]);
        let first_hash = first.block.hash().unwrap();
        store.append(first.clone()).unwrap();
        store.append(committed(2, first_hash, vec![])).unwrap();

        assert_eq!(store.tip_height().unwrap(), Some(2));
        assert_eq!(store.get(1).unwrap(), Some(first));
        assert_eq!(store.tip().unwrap().unwrap().block.header.prev_hash, first_hash);
        assert_eq!(store.range(1, 5).unwrap().len(), 2);
    }

    #[test]
    fn test_gap_and_duplicate_rejected() {
        let mut store = BlockStore::new(MemoryStorage::new());
        store.append(committed(1, Hash::ZERO, vec![])).unwrap();

        assert!(matches!(
            store.append(committed(3, Hash::ZERO, vec![])),
            Err(StateError::HeightGap { expected: 2, got: 3 })
        ));
        assert!(matches!(
            store.append(committed(1, Hash::ZERO, vec![])),
            Err(StateError::BlockExists(1))
        ));
    }

    #[test]
    fn test_commit_must_match_block() {
        let mut store = BlockStore::new(MemoryStorage::new());
        let mut entry = committed(1, Hash::ZERO, vec![]);
        entry.commit.block_hash = Hash::ZERO;
        assert!(matches!(
            store.append(entry),
            Err(StateError::CommitMismatch { height: 1, .. })
        ));
        assert_eq!(store.tip_height().unwrap(), None);
    }

    #[test]
    fn test_committed_evidence_indexed() {
        let offender = KeyPair::from_seed(7);
        let a = Vote::new_signed(&offender, 1, 0, VoteStep::PreVote, None, ts()).unwrap();
        let b = Vote::new_signed(&offender, 1, 0, VoteStep::PreVote, Some(Hash([1u8; 32])), ts()).unwrap();
        let evidence: Evidence = DuplicateVoteEvidence::new(a, b, 1, 4).unwrap().into();
        let id = evidence.id();

        let mut store = BlockStore::new(MemoryStorage::new());
        assert!(!store.contains_evidence(&id).unwrap());
        store.append(committed(1, Hash::ZERO, vec![evidence])).unwrap();

        assert!(store.contains_evidence(&id).unwrap());
        assert_eq!(store.evidence_height(&id).unwrap(), Some(1));
    }

    #[test]
    fn test_evidence_since_scans_index() {
        let offender = KeyPair::from_seed(7);
        let record = |seed: u8| -> Evidence {
            let a = Vote::new_signed(&offender, 1, 0, VoteStep::PreVote, None, ts()).unwrap();
            let b = Vote::new_signed(&offender, 1, 0, VoteStep::PreVote, Some(Hash([seed; 32])), ts())
                .unwrap();
            DuplicateVoteEvidence::new(a, b, 1, 4).unwrap().into()
        };
        let (early, late) = (record(1), record(2));

        let mut store = BlockStore::new(MemoryStorage::new());
        let first = committed(1, Hash::ZERO, vec![early.clone()]);
        let first_hash = first.block.hash().unwrap();
        store.append(first).unwrap();
        store.append(committed(2, first_hash, vec![late.clone()])).unwrap();

        let mut all = store.evidence_since(0).unwrap();
        all.sort_by_key(|(_, height)| *height);
        assert_eq!(all, vec![(early.id(), 1), (late.id(), 2)]);
        assert_eq!(store.evidence_since(2).unwrap(), vec![(late.id(), 2)]);
    }

    #[test]
    fn test_file_backed_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocks.bin");

        {
            let mut store = BlockStore::new(FileStorage::new(&path).unwrap());
            store.append(committed(1, Hash::ZERO, vec![])).unwrap();
        }

        let store = BlockStore::new(FileStorage::new(&path).unwrap());
        assert_eq!(store.tip_height().unwrap(), Some(1));
    }
}
