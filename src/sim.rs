use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use crate::chord_node::ChordNode;
use crate::error::{Error, Result};
use crate::node_info::{NodeIdentity, Slot};
use crate::rpc::{DataReply, DataRequest, PeerClient, TossMessage};
use crate::stabilizer;

/// In-process network: every registered node is reachable by address and
/// calls are dispatched straight to its handlers. Nodes can be killed and
/// revived to simulate crashes.
#[derive(Default)]
pub struct SimNetwork {
    all_node_dict: RwLock<HashMap<String, Weak<ChordNode>>>,
    downed: RwLock<HashSet<String>>,
}

impl SimNetwork {
    pub fn new() -> Arc<SimNetwork> {
        Arc::new(SimNetwork::default())
    }

    pub fn register(&self, node: &Arc<ChordNode>) {
        self.all_node_dict
            .write()
            .insert(node.identity.address.clone(), Arc::downgrade(node));
    }

    /// The node stops answering; its state is kept so it can be revived.
    pub fn kill(&self, address: &str) {
        self.downed.write().insert(address.to_string());
    }

    pub fn revive(&self, address: &str) {
        self.downed.write().remove(address);
    }

    pub fn is_down(&self, address: &str) -> bool {
        self.downed.read().contains(address)
    }

    fn get_node_by_address(&self, address: &str) -> Result<Arc<ChordNode>> {
        if self.is_down(address) {
            return Err(Error::unreachable(address, "node is down"));
        }
        self.all_node_dict
            .read()
            .get(address)
            .and_then(Weak::upgrade)
            .ok_or_else(|| Error::unreachable(address, "no such node"))
    }

    /// Live nodes that have not left the ring, sorted by key.
    pub fn live_nodes(&self) -> Vec<Arc<ChordNode>> {
        let downed = self.downed.read();
        let mut nodes: Vec<Arc<ChordNode>> = self
            .all_node_dict
            .read()
            .iter()
            .filter(|(addr, _)| !downed.contains(*addr))
            .filter_map(|(_, node)| node.upgrade())
            .filter(|node| !node.is_leaving())
            .collect();
        nodes.sort_by_key(|node| node.identity.key);
        nodes
    }

    /// Runs `rounds` stabilize cycles on every live node, letting spawned
    /// background work settle after each round.
    pub async fn stabilize_all(&self, rounds: usize) {
        for _ in 0..rounds {
            for node in self.live_nodes() {
                stabilizer::stabilize_once(&node).await;
                settle().await;
            }
            settle().await;
        }
    }

    /// Walks the successor chain from `start` and checks that every hop is
    /// mirrored by the predecessor link of the next node. Returns the number
    /// of nodes on the ring.
    pub fn check_nodes_connectivity(&self, start: &Arc<ChordNode>) -> Result<usize> {
        let expected = self.live_nodes().len();
        let mut current = Arc::clone(start);
        let mut visited = 0;
        loop {
            let successor = current.successor();
            let next = self.get_node_by_address(&successor.address)?;
            if next.predecessor() != current.identity {
                return Err(Error::RingCorruption(format!(
                    "{} -> {} but predecessor of the latter is {}",
                    current.identity,
                    next.identity,
                    next.predecessor()
                )));
            }
            visited += 1;
            debug!(from = %current.identity, to = %next.identity, "connectivity hop");
            if next.identity == start.identity {
                break;
            }
            if visited > expected {
                return Err(Error::RingCorruption(format!(
                    "successor chain from {} does not close after {} hops",
                    start.identity, visited
                )));
            }
            current = next;
        }
        if visited != expected {
            return Err(Error::RingCorruption(format!(
                "successor chain holds {visited} of {expected} live nodes"
            )));
        }
        Ok(visited)
    }
}

/// Gives spawned forwarding tasks a chance to run.
pub async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(2)).await;
}

#[async_trait]
impl PeerClient for SimNetwork {
    async fn health_check(&self, address: &str) -> Result<()> {
        self.get_node_by_address(address)?.health_check()
    }

    async fn get_node_value(&self, address: &str, slot: Slot) -> Result<Option<NodeIdentity>> {
        self.get_node_by_address(address)?.get_node_value(slot)
    }

    async fn notify_node_changed(&self, address: &str, slot: Slot, node: NodeIdentity) -> Result<()> {
        self.get_node_by_address(address)?.notify_node_changed(slot, node)
    }

    async fn toss_message(&self, address: &str, msg: TossMessage) -> Result<bool> {
        let node = self.get_node_by_address(address)?;
        node.toss_message(msg).await
    }

    async fn handle_data(&self, address: &str, req: DataRequest) -> Result<DataReply> {
        let node = self.get_node_by_address(address)?;
        node.handle_data(req).await
    }
}
