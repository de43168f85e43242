//! Kademlia peer directory.
//!
//! Peers are bucketed by the length of the prefix their address shares with
//! the local address. Buckets hold at most `bucket_size` entries ordered from
//! least to most recently seen; a full bucket evicts its oldest entry.

use meridian_core::{Address, Peer, ADDRESS_LEN};
use parking_lot::RwLock;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// One bucket per bit of the address
pub const NUM_BUCKETS: usize = ADDRESS_LEN * 8;

#[derive(Debug, Clone)]
pub struct PeerDirectoryConfig {
    /// Maximum peers per bucket (Kademlia k)
    pub bucket_size: usize,
    /// Consecutive failures before a peer is dropped
    pub max_failures: u32,
}

impl Default for PeerDirectoryConfig {
    fn default() -> Self {
        PeerDirectoryConfig {
            bucket_size: 16,
            max_failures: 3,
        }
    }
}

/// Result of `add_or_update`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    Inserted,
    Refreshed,
    /// The bucket was full; the returned peer made room
    Evicted(Peer),
    IgnoredSelf,
}

/// A directory entry as seen from outside
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub peer: Peer,
    pub last_seen: Instant,
    pub failures: u32,
}

#[derive(Debug, Clone, Default)]
pub struct DirectoryStats {
    pub total_peers: usize,
    pub buckets_used: usize,
    pub failing_peers: usize,
}

#[derive(Debug, Default)]
struct Bucket {
    /// Least recently seen first
    entries: Vec<PeerRecord>,
}

impl Bucket {
    fn position(&self, address: &Address) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.peer.address() == *address)
    }
}

pub struct PeerDirectory {
    local: Address,
    config: PeerDirectoryConfig,
    buckets: Vec<RwLock<Bucket>>,
}

impl PeerDirectory {
    pub fn new(local: Address, config: PeerDirectoryConfig) -> Self {
        let buckets = (0..NUM_BUCKETS).map(|_| RwLock::new(Bucket::default())).collect();
        PeerDirectory {
            local,
            config,
            buckets,
        }
    }

    pub fn local_address(&self) -> Address {
        self.local
    }

    pub fn config(&self) -> &PeerDirectoryConfig {
        &self.config
    }

    /// Bucket for a non-local address
    fn bucket_index(&self, address: &Address) -> usize {
        self.local.common_prefix_len(address).min(NUM_BUCKETS - 1)
    }

    /// Insert a peer or refresh its recency
    pub fn add_or_update(&self, peer: Peer) -> AddOutcome {
        let address = peer.address();
        if address == self.local {
            return AddOutcome::IgnoredSelf;
        }

        let now = Instant::now();
        let mut bucket = self.buckets[self.bucket_index(&address)].write();

        if let Some(pos) = bucket.position(&address) {
            let mut entry = bucket.entries.remove(pos);
            entry.peer = peer;
            entry.last_seen = now;
            bucket.entries.push(entry);
            return AddOutcome::Refreshed;
        }

        let record = PeerRecord {
            peer,
            last_seen: now,
            failures: 0,
        };
        if bucket.entries.len() >= self.config.bucket_size {
            let evicted = bucket.entries.remove(0);
            bucket.entries.push(record);
            debug!(
                "Evicted {} to make room for {}",
                evicted.peer.address(),
                address
            );
            return AddOutcome::Evicted(evicted.peer);
        }

        bucket.entries.push(record);
        debug!("Added peer {}", address);
        AddOutcome::Inserted
    }

    /// Up to `k` peers closest to `target` by XOR distance. A peer whose
    /// address equals `target` is only returned with `include_target`.
    pub fn get_neighbors(&self, target: &Address, k: usize, include_target: bool) -> Vec<Peer> {
        let mut candidates: Vec<Peer> = Vec::new();
        for bucket in &self.buckets {
            let bucket = bucket.read();
            candidates.extend(
                bucket
                    .entries
                    .iter()
                    .filter(|entry| include_target || entry.peer.address() != *target)
                    .map(|entry| entry.peer.clone()),
            );
        }

        candidates.sort_by(|a, b| target.cmp_distance(&a.address(), &b.address()));
        candidates.truncate(k);
        candidates
    }

    pub fn remove(&self, address: &Address) -> Option<Peer> {
        if *address == self.local {
            return None;
        }
        let mut bucket = self.buckets[self.bucket_index(address)].write();
        let pos = bucket.position(address)?;
        Some(bucket.entries.remove(pos).peer)
    }

    pub fn get(&self, address: &Address) -> Option<PeerRecord> {
        if *address == self.local {
            return None;
        }
        let bucket = self.buckets[self.bucket_index(address)].read();
        bucket.position(address).map(|pos| bucket.entries[pos].clone())
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.get(address).is_some()
    }

    /// Count a failed exchange. Returns true if the peer was dropped.
    pub fn record_failure(&self, address: &Address) -> bool {
        if *address == self.local {
            return false;
        }
        let mut bucket = self.buckets[self.bucket_index(address)].write();
        let Some(pos) = bucket.position(address) else {
            return false;
        };

        let mut entry = bucket.entries.remove(pos);
        entry.failures += 1;
        if entry.failures >= self.config.max_failures {
            info!(
                "Dropping peer {} after {} failures",
                address, entry.failures
            );
            return true;
        }
        // Failing peers go to the eviction end of the bucket
        bucket.entries.insert(0, entry);
        false
    }

    /// Reset the failure count and refresh recency
    pub fn record_success(&self, address: &Address) {
        if *address == self.local {
            return;
        }
        let mut bucket = self.buckets[self.bucket_index(address)].write();
        if let Some(pos) = bucket.position(address) {
            let mut entry = bucket.entries.remove(pos);
            entry.failures = 0;
            entry.last_seen = Instant::now();
            bucket.entries.push(entry);
        }
    }

    /// Peers not seen within `older_than`
    pub fn stale_peers(&self, older_than: Duration) -> Vec<Peer> {
        let now = Instant::now();
        self.records()
            .into_iter()
            .filter(|record| now.duration_since(record.last_seen) >= older_than)
            .map(|record| record.peer)
            .collect()
    }

    pub fn records(&self) -> Vec<PeerRecord> {
        self.buckets
            .iter()
            .flat_map(|bucket| bucket.read().entries.clone())
            .collect()
    }

    pub fn peers(&self) -> Vec<Peer> {
        self.records().into_iter().map(|record| record.peer).collect()
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|bucket| bucket.read().entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> DirectoryStats {
        let mut stats = DirectoryStats::default();
        for bucket in &self.buckets {
            let bucket = bucket.read();
            if bucket.entries.is_empty() {
                continue;
            }
            stats.buckets_used += 1;
            stats.total_peers += bucket.entries.len();
            stats.failing_peers += bucket.entries.iter().filter(|e| e.failures > 0).count();
        }
        stats
    }
}
