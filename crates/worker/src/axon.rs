//! Serving endpoint and peer priorities
//!
//! The axon owns the identity's network endpoint. After every publish the
//! synchronizer hands it the refreshed priority column so inbound requests
//! can be ranked by how much the fleet trusts the sender.

use crate::metagraph::PeerId;
use crate::weights::WeightVector;
use axonfleet_common::config::AxonConfig;
use axonfleet_common::{FleetError, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use tracing::{debug, info};

/// Routing collaborator driven by the synchronizer
pub trait Axon: Send {
    /// Replace the priority table. `peers` and `priorities` are parallel.
    fn set_priority(&mut self, peers: &[PeerId], priorities: &WeightVector) -> Result<()>;
}

/// Priority entry for one peer
#[derive(Debug, Clone, PartialEq)]
pub struct PeerPriority {
    pub peer: PeerId,
    pub priority: f32,
}

/// Priority table bound to a reserved endpoint
pub struct PriorityAxon {
    table: Arc<RwLock<HashMap<PeerId, f32>>>,
    listener: Option<TcpListener>,
    endpoint: String,
    updates: u64,
}

impl PriorityAxon {
    /// Create an axon for `config`, binding its port when `reserve_port` is set
    pub fn new(config: &AxonConfig) -> Result<Self> {
        let endpoint = format!("{}:{}", config.bind_address, config.port);

        let listener = if config.reserve_port {
            let addr: SocketAddr = endpoint
                .parse()
                .map_err(|e| FleetError::axon(format!("invalid endpoint {}: {}", endpoint, e)))?;
            let listener = TcpListener::bind(addr)
                .map_err(|e| FleetError::axon(format!("Failed to bind {}: {}", endpoint, e)))?;
            info!("Axon reserved endpoint {}", endpoint);
            Some(listener)
        } else {
            None
        };

        Ok(Self {
            table: Arc::new(RwLock::new(HashMap::new())),
            listener,
            endpoint,
            updates: 0,
        })
    }

    /// Axon without an endpoint (tests and single-process dry runs)
    pub fn unbound() -> Self {
        Self {
            table: Arc::new(RwLock::new(HashMap::new())),
            listener: None,
            endpoint: String::new(),
            updates: 0,
        }
    }

    /// Endpoint as configured
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Address actually bound, if the endpoint is reserved
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Number of priority updates received
    pub fn updates(&self) -> u64 {
        self.updates
    }

    /// Read handle on the table, for request handlers
    pub fn table(&self) -> Arc<RwLock<HashMap<PeerId, f32>>> {
        Arc::clone(&self.table)
    }

    /// Priority of one peer; unknown peers rank lowest
    pub fn priority_of(&self, peer: &str) -> f32 {
        self.table.read().get(peer).copied().unwrap_or(0.0)
    }

    /// All known peers, highest priority first (ties by peer id)
    pub fn ranked_peers(&self) -> Vec<PeerPriority> {
        let table = self.table.read();
        let mut ranked: Vec<PeerPriority> = table
            .iter()
            .map(|(peer, priority)| PeerPriority {
                peer: peer.clone(),
                priority: *priority,
            })
            .collect();

        ranked.sort_by(|a, b| {
            b.priority
                .partial_cmp(&a.priority)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.peer.cmp(&b.peer))
        });
        ranked
    }
}

impl Axon for PriorityAxon {
    fn set_priority(&mut self, peers: &[PeerId], priorities: &WeightVector) -> Result<()> {
        if peers.len() != priorities.len() {
            return Err(FleetError::axon(format!(
                "{} peers but {} priorities",
                peers.len(),
                priorities.len()
            )));
        }

        let mut table = self.table.write();
        table.clear();
        for (peer, priority) in peers.iter().zip(priorities.as_slice()) {
            table.insert(peer.clone(), *priority);
        }
        self.updates += 1;

        debug!(peers = peers.len(), updates = self.updates, "priority table updated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peers(names: &[&str]) -> Vec<PeerId> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_set_priority_and_rank() {
        let mut axon = PriorityAxon::unbound();
        axon.set_priority(&peers(&["a", "b", "c"]), &WeightVector::new(vec![0.2, 0.5, 0.2]))
            .unwrap();

        assert_eq!(axon.priority_of("b"), 0.5);
        assert_eq!(axon.priority_of("zz"), 0.0);

        let ranked: Vec<_> = axon.ranked_peers().into_iter().map(|p| p.peer).collect();
        assert_eq!(ranked, vec!["b", "a", "c"]);
        assert_eq!(axon.updates(), 1);
    }

    #[test]
    fn test_set_priority_replaces_table() {
        let mut axon = PriorityAxon::unbound();
        axon.set_priority(&peers(&["a", "b"]), &WeightVector::uniform(2)).unwrap();
        axon.set_priority(&peers(&["c"]), &WeightVector::uniform(1)).unwrap();
        assert_eq!(axon.priority_of("a"), 0.0);
        assert_eq!(axon.priority_of("c"), 1.0);
    }

    #[test]
    fn test_set_priority_length_mismatch() {
        let mut axon = PriorityAxon::unbound();
        let err = axon
            .set_priority(&peers(&["a", "b"]), &WeightVector::uniform(3))
            .unwrap_err();
        assert!(matches!(err, FleetError::Axon(_)));
    }

    #[test]
    fn test_reserved_port_is_exclusive() {
        let config = AxonConfig {
            port: 0,
            ..AxonConfig::default()
        };
        let first = PriorityAxon::new(&config).unwrap();
        let addr = first.local_addr().unwrap();

        let taken = AxonConfig {
            port: addr.port(),
            ..AxonConfig::default()
        };
        assert!(matches!(PriorityAxon::new(&taken), Err(FleetError::Axon(_))));
    }

    #[test]
    fn test_unreserved_axon_does_not_bind() {
        let config = AxonConfig {
            reserve_port: false,
            ..AxonConfig::default()
        };
        let axon = PriorityAxon::new(&config).unwrap();
        assert!(axon.local_addr().is_none());
        assert_eq!(axon.endpoint(), "127.0.0.1:8091");
    }
}
