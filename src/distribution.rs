//! Ownership of receivers among worker nodes
//!
//! Exactly one worker evaluates conditions of a receiver. The ring maps each
//! receiver key to the first virtual node clockwise from its hash, so adding
//! or removing a node moves only the receivers of that node.

use crate::model::ReceiverKey;
use fnv::FnvHasher;
use parking_lot::RwLock;
use std::hash::Hasher;
use std::sync::Arc;
use tracing::info;

/// Virtual nodes per worker node (default: 64)
pub const DEFAULT_VIRTUAL_NODES: usize = 64;

pub trait Assigner: Send + Sync + 'static {
    fn is_owner(&self, key: &ReceiverKey) -> bool;
}

pub type SharedAssigner = Arc<dyn Assigner>;

/// The only worker, owns everything.
pub struct SingleNodeAssigner;

impl Assigner for SingleNodeAssigner {
    fn is_owner(&self, _key: &ReceiverKey) -> bool {
        true
    }
}

/// Consistent hash ring over worker node IDs.
pub struct HashRingAssigner {
    node_id: String,
    virtual_nodes: usize,
    ring: RwLock<Vec<(u64, String)>>,
}

impl HashRingAssigner {
    pub fn new(node_id: impl Into<String>, nodes: &[String]) -> Self {
        Self::with_virtual_nodes(node_id, nodes, DEFAULT_VIRTUAL_NODES)
    }

    pub fn with_virtual_nodes(node_id: impl Into<String>, nodes: &[String], virtual_nodes: usize) -> Self {
        let assigner = HashRingAssigner {
            node_id: node_id.into(),
            virtual_nodes: virtual_nodes.max(1),
            ring: RwLock::new(Vec::new()),
        };
        assigner.set_nodes(nodes);
        assigner
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Rebuild the ring from the current list of worker nodes.
    pub fn set_nodes(&self, nodes: &[String]) {
        let mut ring: Vec<(u64, String)> = nodes
            .iter()
            .flat_map(|node| {
                (0..self.virtual_nodes).map(move |i| (hash(&format!("{}#{}", node, i)), node.clone()))
            })
            .collect();
        ring.sort();
        ring.dedup_by_key(|(point, _)| *point);
        *self.ring.write() = ring;
        info!(node = %self.node_id, nodes = nodes.len(), "distribution: nodes changed");
    }

    /// Node owning the receiver, `None` for an empty ring.
    pub fn owner(&self, key: &ReceiverKey) -> Option<String> {
        let ring = self.ring.read();
        if ring.is_empty() {
            return None;
        }
        let point = hash(&key.to_string());
        let idx = ring.partition_point(|(p, _)| *p < point);
        let (_, node) = &ring[idx % ring.len()];
        Some(node.clone())
    }
}

impl Assigner for HashRingAssigner {
    fn is_owner(&self, key: &ReceiverKey) -> bool {
        self.owner(key).as_deref() == Some(self.node_id.as_str())
    }
}

fn hash(s: &str) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(s.as_bytes());
    hasher.finish()
}
