// src/frontier.rs

//! The frontier: nodes that may advance on the next scheduler tick.
//!
//! Thread-safe add/remove/enumerate; keyed by fqname so enumeration order
//! is stable and logs are reproducible.

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::graph::NodeId;

#[derive(Debug, Default)]
pub struct Frontier {
    nodes: Mutex<BTreeMap<String, NodeId>>,
}

impl Frontier {
    pub fn new() -> Self {
        Frontier::default()
    }

    pub fn add(&self, fqname: &str, id: NodeId) {
        self.nodes
            .lock()
            .unwrap()
            .insert(fqname.to_string(), id);
    }

    pub fn remove(&self, fqname: &str) {
        self.nodes.lock().unwrap().remove(fqname);
    }

    pub fn contains(&self, fqname: &str) -> bool {
        self.nodes.lock().unwrap().contains_key(fqname)
    }

    /// Snapshot of the current frontier, in fqname order.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.lock().unwrap().values().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.lock().unwrap().is_empty()
    }
}
