use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use meridian_consensus::ConsensusConfig;
use meridian_core::{Endpoint, KeyPair, Peer, PublicKey, SecretKey, Validator, ValidatorSet};
use serde::{Deserialize, Serialize};

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Address the transport listens on
    pub listen_addr: SocketAddr,

    /// Host other peers use to reach this node
    pub host: String,

    /// Node secret key (hex). Required for validators; other nodes get an
    /// ephemeral identity when unset.
    pub secret_key: Option<String>,

    /// Node data directory
    pub data_dir: PathBuf,

    /// Peers contacted at startup
    pub seeds: Vec<PeerEntry>,

    /// Validator set used from the first height
    pub validators: Vec<ValidatorEntry>,

    pub consensus: ConsensusConfig,

    pub discovery: DiscoverySettings,

    pub transport: TransportSettings,

    /// Seconds between evidence id gossip rounds
    pub evidence_gossip_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerEntry {
    pub public_key: String,
    /// `host:port`
    pub endpoint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorEntry {
    pub public_key: String,
    pub power: u64,
    /// `host:port`
    pub endpoint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoverySettings {
    /// Kademlia bucket size, also the neighbor count per lookup
    pub bucket_size: usize,
    /// Parallel queries per lookup round
    pub alpha: usize,
    pub refresh_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    pub connect_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 7600)),
            host: "127.0.0.1".to_string(),
            secret_key: None,
            data_dir: PathBuf::from("./meridian-data"),
            seeds: Vec::new(),
            validators: Vec::new(),
            consensus: ConsensusConfig::default(),
            discovery: DiscoverySettings::default(),
            transport: TransportSettings::default(),
            evidence_gossip_interval_secs: 10,
        }
    }
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        DiscoverySettings {
            bucket_size: 16,
            alpha: 3,
            refresh_interval_secs: 60,
        }
    }
}

impl Default for TransportSettings {
    fn default() -> Self {
        TransportSettings {
            connect_timeout_ms: 3000,
            write_timeout_ms: 3000,
            request_timeout_ms: 5000,
        }
    }
}

impl TransportSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl PeerEntry {
    pub fn to_peer(&self) -> Result<Peer> {
        parse_peer(&self.public_key, &self.endpoint)
    }
}

impl ValidatorEntry {
    pub fn to_peer(&self) -> Result<Peer> {
        parse_peer(&self.public_key, &self.endpoint)
    }
}

fn parse_peer(public_key: &str, endpoint: &str) -> Result<Peer> {
    let public_key = PublicKey::from_hex(public_key)?;
    let endpoint = Endpoint::parse(endpoint)?;
    Ok(Peer::new(public_key, endpoint))
}

impl NodeConfig {
    /// Load config from file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: NodeConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save config to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Configured keypair, if any
    pub fn keypair(&self) -> Result<Option<KeyPair>> {
        self.secret_key
            .as_deref()
            .map(|hex| Ok(KeyPair::from_secret(SecretKey::from_hex(hex)?)))
            .transpose()
    }

    pub fn validator_set(&self) -> Result<ValidatorSet> {
        if self.validators.is_empty() {
            bail!("no validators configured");
        }
        let validators = self
            .validators
            .iter()
            .map(|entry| {
                PublicKey::from_hex(&entry.public_key)
                    .map(|pk| Validator::new(pk, entry.power))
                    .map_err(|e| anyhow!(e))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(ValidatorSet::new(validators)?)
    }

    pub fn validator_peers(&self) -> Result<Vec<Peer>> {
        self.validators.iter().map(ValidatorEntry::to_peer).collect()
    }

    pub fn seed_peers(&self) -> Result<Vec<Peer>> {
        self.seeds.iter().map(PeerEntry::to_peer).collect()
    }

    /// Endpoint advertised to peers
    pub fn local_endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.clone(), self.listen_addr.port())
    }
}

/// Generate a single-validator configuration for testing
pub fn generate_sample_config() -> NodeConfig {
    let validator = KeyPair::generate();
    let port = 7600;

    NodeConfig {
        listen_addr: SocketAddr::from(([0, 0, 0, 0], port)),
        secret_key: Some(validator.secret.to_hex()),
        validators: vec![ValidatorEntry {
            public_key: validator.public.to_hex(),
            power: 1,
            endpoint: format!("127.0.0.1:{}", port),
        }],
        ..Default::default()
    }
}

/// Configurations for `count` validators on localhost with equal power.
/// Every node seeds from all the others.
pub fn generate_cluster_configs(count: usize, base_port: u16) -> Result<Vec<NodeConfig>> {
    if count == 0 {
        bail!("validator count must be at least 1");
    }
    let ports = (0..count)
        .map(|i| {
            u16::try_from(i)
                .ok()
                .and_then(|i| base_port.checked_add(i))
                .ok_or_else(|| anyhow!("port range starting at {} overflows", base_port))
        })
        .collect::<Result<Vec<u16>>>()?;

    let keys: Vec<KeyPair> = (0..count).map(|_| KeyPair::generate()).collect();
    let validators: Vec<ValidatorEntry> = keys
        .iter()
        .zip(&ports)
        .map(|(key, port)| ValidatorEntry {
            public_key: key.public.to_hex(),
            power: 1,
            endpoint: format!("127.0.0.1:{}", port),
        })
        .collect();

    let configs = keys
        .iter()
        .zip(&ports)
        .enumerate()
        .map(|(i, (key, port))| NodeConfig {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], *port)),
            secret_key: Some(key.secret.to_hex()),
            data_dir: PathBuf::from(format!("./meridian-data/node{}", i)),
            seeds: validators
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != i)
                .map(|(_, v)| PeerEntry {
                    public_key: v.public_key.clone(),
                    endpoint: v.endpoint.clone(),
                })
                .collect(),
            validators: validators.clone(),
            ..Default::default()
        })
        .collect();
    Ok(configs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert_eq!(config.listen_addr.port(), 7600);
        assert!(config.keypair().unwrap().is_none());
        assert!(config.validator_set().is_err());
    }

    #[test]
    fn test_sample_config() {
        let config = generate_sample_config();
        let keypair = config.keypair().unwrap().unwrap();
        let set = config.validator_set().unwrap();

        assert_eq!(set.total_power(), 1);
        assert!(set.contains(&keypair.public));
        assert_eq!(config.validator_peers().unwrap()[0].public_key, keypair.public);
    }

    #[test]
    fn test_cluster_configs() {
        let configs = generate_cluster_configs(4, 9000).unwrap();
        assert_eq!(configs.len(), 4);

        for (i, config) in configs.iter().enumerate() {
            assert_eq!(config.listen_addr.port(), 9000 + i as u16);
            assert_eq!(config.seeds.len(), 3);
            assert_eq!(config.validator_set().unwrap().total_power(), 4);

            let me = config.keypair().unwrap().unwrap();
            let seeds = config.seed_peers().unwrap();
            assert!(seeds.iter().all(|seed| seed.public_key != me.public));
        }
        assert_ne!(configs[0].data_dir, configs[1].data_dir);
    }

    #[test]
    fn test_cluster_configs_bounds() {
        assert!(generate_cluster_configs(0, 9000).is_err());
        assert!(generate_cluster_configs(3, u16::MAX - 1).is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = generate_sample_config();
        config.save(&path).unwrap();

        let loaded = NodeConfig::load(&path).unwrap();
        assert_eq!(loaded.secret_key, config.secret_key);
        assert_eq!(loaded.consensus, config.consensus);
        assert_eq!(loaded.validators.len(), 1);
    }

    #[test]
    fn test_invalid_entries_rejected() {
        let mut config = generate_sample_config();
        config.seeds.push(PeerEntry {
            public_key: "zz".to_string(),
            endpoint: "127.0.0.1:1".to_string(),
        });
        assert!(config.seed_peers().is_err());

        config.validators[0].endpoint = "no-port".to_string();
        assert!(config.validator_peers().is_err());

        config.secret_key = Some("00".to_string());
        assert!(config.keypair().is_err());
    }
}
