use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use meridian_consensus::{
    recent_evidence, start_position, ConsensusHandle, ConsensusReactor, ConsensusRunner,
    ConsensusState, EvidencePool, ValidatorSetProvider,
};
use meridian_core::{KeyPair, Peer, ValidatorSet};
use meridian_net::{
    Discovery, DiscoveryConfig, Dispatcher, EvidenceExchange, EvidenceSource, PeerDirectory,
    PeerDirectoryConfig, RequestTracker, TcpTransport, TcpTransportConfig, Transport,
};
use meridian_state::{BlockStore, FileStorage};
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::NodeConfig;

/// The Meridian node
pub struct Node {
    config: NodeConfig,
    keypair: KeyPair,
    is_validator: bool,
    validators: Arc<ValidatorSet>,
    validator_peers: Vec<Peer>,
    seeds: Vec<Peer>,
}

/// Background tasks of a started node
pub struct RunningNode {
    pub local: Peer,
    /// Height consensus resumed at
    pub start_height: u64,
    pub consensus: ConsensusHandle,
    pub directory: Arc<PeerDirectory>,
    tasks: Vec<JoinHandle<()>>,
}

impl RunningNode {
    /// Stop every task started for this node
    pub fn shutdown(self) {
        for task in &self.tasks {
            task.abort();
        }
        info!("Node {} stopped", self.local.address());
    }
}

impl Node {
    /// Create a new node from configuration
    pub fn new(config: NodeConfig) -> Result<Self> {
        let validators = Arc::new(config.validator_set()?);
        let validator_peers = config.validator_peers()?;
        let seeds = config.seed_peers()?;

        let (keypair, is_validator) = match config.keypair()? {
            Some(keypair) => {
                let is_validator = validators.contains(&keypair.public);
                (keypair, is_validator)
            }
            None => (KeyPair::generate(), false),
        };

        Ok(Node {
            config,
            keypair,
            is_validator,
            validators,
            validator_peers,
            seeds,
        })
    }

    pub fn is_validator(&self) -> bool {
        self.is_validator
    }

    /// Bind the transport and spawn networking and consensus tasks
    pub async fn start(self) -> Result<RunningNode> {
        let local = Peer::new(self.keypair.public, self.config.local_endpoint());
        let transport = Arc::new(
            TcpTransport::bind(
                local,
                TcpTransportConfig {
                    listen_addr: self.config.listen_addr,
                    connect_timeout: self.config.transport.connect_timeout(),
                    write_timeout: self.config.transport.write_timeout(),
                },
            )
            .await?,
        );
        let local = transport.local_peer().clone();
        info!(
            "Node {} listening on {}",
            local.address(),
            transport.local_addr()
        );

        let tracker = Arc::new(RequestTracker::new());
        let directory = Arc::new(PeerDirectory::new(
            local.address(),
            PeerDirectoryConfig {
                bucket_size: self.config.discovery.bucket_size,
                ..Default::default()
            },
        ));
        for peer in self
            .validator_peers
            .iter()
            .filter(|peer| peer.address() != local.address())
        {
            directory.add_or_update(peer.clone());
        }

        let discovery = Arc::new(Discovery::new(
            transport.clone(),
            tracker.clone(),
            directory.clone(),
            DiscoveryConfig {
                k: self.config.discovery.bucket_size,
                alpha: self.config.discovery.alpha,
                request_timeout: self.config.transport.request_timeout(),
                ..Default::default()
            },
        ));

        let provider: Arc<dyn ValidatorSetProvider> = Arc::new(self.validators.clone());
        let pool = Arc::new(EvidencePool::new(provider.clone()));
        let exchange = Arc::new(EvidenceExchange::new(
            transport.clone(),
            tracker.clone(),
            pool.clone(),
            self.config.transport.request_timeout(),
        ));

        let storage = FileStorage::new(self.config.data_dir.join("blocks.bin"))?;
        let store = BlockStore::new(storage);
        let (start_height, prev_hash) = start_position(&store)?;
        let evidence_max_age = self.config.consensus.evidence_max_age;
        for (id, height) in store.evidence_since(start_height.saturating_sub(evidence_max_age))? {
            pool.mark_committed([id], height);
        }
        let committed_evidence = recent_evidence(&store, evidence_max_age)?;
        let store = Arc::new(RwLock::new(store));

        let keypair = if self.is_validator {
            info!("Starting as validator: {}", self.keypair.public);
            Some(self.keypair.clone())
        } else {
            info!("Starting as non-validator node");
            None
        };
        let state = ConsensusState::new(
            start_height,
            prev_hash,
            provider,
            keypair,
            self.config.consensus.clone(),
        )?
        .with_committed_evidence(committed_evidence.iter().map(|(evidence, _)| evidence));
        let (runner, consensus) = ConsensusRunner::new(
            state,
            transport.clone(),
            self.validator_peers.clone(),
            store,
            pool,
            self.config.consensus.clone(),
        );

        let mut dispatcher = Dispatcher::default().with_directory(directory.clone());
        discovery.register(&mut dispatcher);
        exchange.register(&mut dispatcher);
        ConsensusReactor::new(consensus.clone()).register(&mut dispatcher);
        let dispatcher = Arc::new(dispatcher);

        let mut tasks = Vec::new();
        {
            let transport = transport.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = dispatcher.run(transport, tracker).await {
                    error!("Dispatcher failed: {}", e);
                }
            }));
        }
        tasks.push(tokio::spawn(async move {
            if let Err(e) = runner.run().await {
                error!("Consensus halted: {}", e);
            }
        }));

        let seeds = self.seeds.clone();
        let refresh_interval =
            Duration::from_secs(self.config.discovery.refresh_interval_secs.max(1));
        tasks.push(tokio::spawn(async move {
            discovery.bootstrap(&seeds).await;
            discovery.run_refresh(refresh_interval).await;
        }));

        let gossip_interval =
            Duration::from_secs(self.config.evidence_gossip_interval_secs.max(1));
        tasks.push(tokio::spawn(gossip_evidence(
            exchange,
            directory.clone(),
            gossip_interval,
        )));

        Ok(RunningNode {
            local,
            start_height,
            consensus,
            directory,
            tasks,
        })
    }

    /// Run the node until interrupted
    pub async fn run(self) -> Result<()> {
        info!("Starting Meridian node");
        let running = self.start().await?;

        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for shutdown signal: {}", e);
        }
        info!(
            "Shutting down at committed height {:?} with {} known peers",
            running.consensus.committed_height(),
            running.directory.len()
        );
        running.shutdown();
        Ok(())
    }
}

/// Periodically advertise pending evidence and fetch what peers advertised
async fn gossip_evidence<T, E>(
    exchange: Arc<EvidenceExchange<T, E>>,
    directory: Arc<PeerDirectory>,
    interval: Duration,
) where
    T: Transport,
    E: EvidenceSource + 'static,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let sent = exchange.broadcast_ids(&directory.peers()).await;
        let received = exchange.fetch_missing().await;
        if sent > 0 || received > 0 {
            debug!(
                "Evidence gossip: advertised to {} peers, received {} records",
                sent, received
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{generate_sample_config, PeerEntry};
    use std::net::SocketAddr;

    fn local_config(data_dir: &std::path::Path) -> NodeConfig {
        let mut config = generate_sample_config();
        config.listen_addr = SocketAddr::from(([127, 0, 0, 1], 0));
        config.data_dir = data_dir.to_path_buf();
        config.consensus.timeout_propose_ms = 200;
        config.consensus.timeout_prevote_ms = 100;
        config.consensus.timeout_precommit_ms = 100;
        config.consensus.timeout_commit_ms = 20;
        config
    }

    #[test]
    fn test_node_creation() {
        let config = generate_sample_config();
        let node = Node::new(config).unwrap();

        assert!(node.is_validator());
        assert_eq!(node.validators.len(), 1);
    }

    #[test]
    fn test_observer_without_key() {
        let mut config = generate_sample_config();
        config.secret_key = None;
        let node = Node::new(config).unwrap();
        assert!(!node.is_validator());

        let mut config = generate_sample_config();
        config.secret_key = Some(KeyPair::generate().secret.to_hex());
        assert!(!Node::new(config).unwrap().is_validator());
    }

    #[test]
    fn test_rejects_bad_seed() {
        let mut config = generate_sample_config();
        config.seeds.push(PeerEntry {
            public_key: KeyPair::generate().public.to_hex(),
            endpoint: "missing-port".to_string(),
        });
        assert!(Node::new(config).is_err());
    }

    #[tokio::test]
    async fn test_single_validator_commits_and_resumes() {
        let dir = tempfile::tempdir().unwrap();
        let config = local_config(dir.path());

        let running = Node::new(config.clone()).unwrap().start().await.unwrap();
        assert_eq!(running.start_height, 1);
        tokio::time::timeout(Duration::from_secs(10), running.consensus.wait_for_height(3))
            .await
            .unwrap()
            .unwrap();
        running.shutdown();

        let running = Node::new(config).unwrap().start().await.unwrap();
        assert!(running.start_height > 3);
        let next = running.start_height;
        tokio::time::timeout(Duration::from_secs(10), running.consensus.wait_for_height(next))
            .await
            .unwrap()
            .unwrap();
        running.shutdown();
    }
}
