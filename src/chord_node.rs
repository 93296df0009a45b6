use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, info};

use crate::chord_util::{self, RingKey};
use crate::config::NodeConfig;
use crate::data_store::{KeyOwnership, SharedStore};
use crate::error::{Error, Result};
use crate::gval;
use crate::node_info::{Membership, NodeIdentity, RingMembership, Slot};
use crate::router;
use crate::rpc::{DataOp, DataReply, DataRequest, PeerClient, TossMessage};
use crate::stabilizer;

/// One ring member: its tables, its view of the network and the handlers
/// peers invoke on it.
///
/// Shared as `Arc<ChordNode>` between the RPC server, the stabilize loop and
/// the operator console. Every table sits behind its own lock inside the
/// `RingMembership` / `KeyOwnership` implementations; no lock is held across
/// an await point.
pub struct ChordNode {
    pub identity: NodeIdentity,
    pub config: NodeConfig,
    pub membership: Arc<dyn RingMembership>,
    pub store: Arc<dyn KeyOwnership>,
    pub peers: Arc<dyn PeerClient>,
    leaving: AtomicBool,
    // false between a join and the first finger refresh that measures the ring
    estimate_measured: AtomicBool,
    refresh_needed: AtomicBool,
    cycles_since_refresh: AtomicU32,
    table_changed: Notify,
    pending_gets: Mutex<HashMap<RingKey, Vec<oneshot::Sender<Option<String>>>>>,
}

impl ChordNode {
    pub fn new(config: NodeConfig, peers: Arc<dyn PeerClient>) -> Arc<ChordNode> {
        let identity = NodeIdentity::from_address(config.listen_address.clone());
        ChordNode::with_identity(identity, config, peers)
    }

    /// Builds a node whose key is not derived from its address.
    pub fn with_identity(identity: NodeIdentity, config: NodeConfig, peers: Arc<dyn PeerClient>) -> Arc<ChordNode> {
        Arc::new(ChordNode {
            membership: Arc::new(Membership::new(identity.clone())),
            store: Arc::new(SharedStore::new()),
            identity,
            config,
            peers,
            leaving: AtomicBool::new(false),
            estimate_measured: AtomicBool::new(true),
            refresh_needed: AtomicBool::new(false),
            cycles_since_refresh: AtomicU32::new(0),
            table_changed: Notify::new(),
            pending_gets: Mutex::new(HashMap::new()),
        })
    }

    pub fn is_leaving(&self) -> bool {
        self.leaving.load(Ordering::SeqCst)
    }

    pub(crate) fn set_leaving(&self, leaving: bool) {
        self.leaving.store(leaving, Ordering::SeqCst);
    }

    pub fn estimate_measured(&self) -> bool {
        self.estimate_measured.load(Ordering::SeqCst)
    }

    pub(crate) fn set_estimate_measured(&self, measured: bool) {
        self.estimate_measured.store(measured, Ordering::SeqCst);
    }

    pub fn request_refresh(&self) {
        self.refresh_needed.store(true, Ordering::SeqCst);
    }

    /// Counts one stabilize cycle and reports whether this node should start
    /// a finger refresh now. Resets the trigger when it fires.
    pub(crate) fn refresh_due(&self) -> bool {
        let cycles = self.cycles_since_refresh.fetch_add(1, Ordering::SeqCst) + 1;
        let flagged = self.refresh_needed.swap(false, Ordering::SeqCst);
        if flagged || cycles >= self.config.finger_refresh_cycles {
            self.cycles_since_refresh.store(0, Ordering::SeqCst);
            return true;
        }
        false
    }

    /// Resolves once the membership table has been modified by a peer.
    /// Call before re-checking the condition being waited for.
    pub(crate) fn table_changed(&self) -> tokio::sync::futures::Notified<'_> {
        self.table_changed.notified()
    }

    pub fn successor(&self) -> NodeIdentity {
        self.membership.successor()
    }

    pub fn predecessor(&self) -> NodeIdentity {
        self.membership.predecessor()
    }

    /// Overwrites `slot` of `target`, locally when `target` is this node.
    pub async fn notify(&self, target: &NodeIdentity, slot: Slot, node: NodeIdentity) -> Result<()> {
        if *target == self.identity {
            self.membership.set_slot(slot, node)?;
            self.table_changed.notify_waiters();
            return Ok(());
        }
        self.peers.notify_node_changed(&target.address, slot, node).await
    }

    //
    // handlers invoked by peers
    //

    pub fn health_check(&self) -> Result<()> {
        if self.is_leaving() {
            return Err(Error::Leaving);
        }
        Ok(())
    }

    pub fn get_node_value(&self, slot: Slot) -> Result<Option<NodeIdentity>> {
        if let Slot::Finger(idx) = slot {
            if idx >= gval::ID_SPACE_BITS as usize {
                return Err(Error::ProtocolViolation(format!("no finger {idx} in a {}-bit ring", gval::ID_SPACE_BITS)));
            }
        }
        Ok(self.membership.get_slot(slot))
    }

    pub fn notify_node_changed(self: &Arc<Self>, slot: Slot, node: NodeIdentity) -> Result<()> {
        let changed = self.membership.set_slot(slot, node.clone())?;
        if !changed {
            return Ok(());
        }
        info!(node = %self.identity, %slot, to = %node, "table slot updated by peer");
        self.table_changed.notify_waiters();
        if slot == Slot::Predecessor {
            // the ownership interval moved; hand over what is no longer ours
            let me = Arc::clone(self);
            tokio::spawn(async move {
                stabilizer::repair_ownership(&me).await;
            });
        }
        Ok(())
    }

    pub async fn toss_message(self: &Arc<Self>, msg: TossMessage) -> Result<bool> {
        router::dispatch_toss(self, msg).await
    }

    pub async fn handle_data(self: &Arc<Self>, req: DataRequest) -> Result<DataReply> {
        router::handle_data(self, req).await
    }

    /// Completes every local `get` waiting on `key`.
    pub(crate) fn deliver_get_result(&self, key: &RingKey, value: Option<String>) {
        let waiters = self.pending_gets.lock().remove(key).unwrap_or_default();
        debug!(node = %self.identity, key = ?key, waiters = waiters.len(), "get result delivered");
        for waiter in waiters {
            let _ = waiter.send(value.clone());
        }
    }

    //
    // operator operations
    //

    pub async fn set(self: &Arc<Self>, name: &str, value: &str) -> Result<()> {
        self.set_key(chord_util::hash_str_to_key(name), name, value).await
    }

    pub async fn get(self: &Arc<Self>, name: &str) -> Result<String> {
        self.get_key(chord_util::hash_str_to_key(name), name).await
    }

    pub async fn delete(self: &Arc<Self>, name: &str) -> Result<()> {
        self.delete_key(chord_util::hash_str_to_key(name), name).await
    }

    pub async fn set_key(self: &Arc<Self>, key: RingKey, name: &str, value: &str) -> Result<()> {
        let req = DataRequest::new(DataOp::Set, key, name, Some(value.to_string()), self.identity.clone());
        match router::handle_data(self, req).await? {
            DataReply::Stored => Ok(()),
            other => Err(Error::ProtocolViolation(format!("unexpected reply {other:?} to set"))),
        }
    }

    pub async fn get_key(self: &Arc<Self>, key: RingKey, name: &str) -> Result<String> {
        let (tx, rx) = oneshot::channel();
        self.pending_gets.lock().entry(key).or_default().push(tx);

        let req = DataRequest::new(DataOp::Get, key, name, None, self.identity.clone());
        if let Err(err) = router::handle_data(self, req).await {
            self.drop_closed_waiters(&key);
            return Err(err);
        }

        let outcome = tokio::time::timeout(self.config.get_result_timeout, rx).await;
        self.drop_closed_waiters(&key);
        match outcome {
            Ok(Ok(Some(value))) => Ok(value),
            Ok(Ok(None)) => Err(Error::KeyNotFound(name.to_string())),
            Ok(Err(_)) | Err(_) => Err(Error::Timeout(format!("get result for {name}"))),
        }
    }

    pub async fn delete_key(self: &Arc<Self>, key: RingKey, name: &str) -> Result<()> {
        let req = DataRequest::new(DataOp::Delete, key, name, None, self.identity.clone());
        match router::handle_data(self, req).await? {
            DataReply::Deleted => Ok(()),
            DataReply::NotFound => Err(Error::KeyNotFound(name.to_string())),
            other => Err(Error::ProtocolViolation(format!("unexpected reply {other:?} to delete"))),
        }
    }

    fn drop_closed_waiters(&self, key: &RingKey) {
        let mut pending = self.pending_gets.lock();
        let now_empty = match pending.get_mut(key) {
            Some(waiters) => {
                waiters.retain(|w| !w.is_closed());
                waiters.is_empty()
            }
            None => false,
        };
        if now_empty {
            pending.remove(key);
        }
    }

    pub async fn join(self: &Arc<Self>, bootstrap: &str) -> Result<()> {
        stabilizer::join(self, bootstrap).await
    }

    pub async fn leave(self: &Arc<Self>) -> Result<()> {
        stabilizer::leave(self).await
    }

    /// Human readable dump of the membership table.
    pub fn show(&self) -> String {
        let table = self.membership.snapshot();
        let mut out = String::new();
        let _ = writeln!(out, "self        {}", table.self_node);
        let _ = writeln!(out, "predecessor {}", table.predecessor);
        for (idx, finger) in table.fingers.iter().enumerate() {
            let start = table.self_node.key.add_pow2(idx as u32);
            let _ = writeln!(out, "finger[{idx}] start={} -> {}", start.short(), finger);
        }
        let _ = write!(out, "ring size estimate {}", table.ring_size_estimate);
        if self.is_leaving() {
            let _ = write!(out, " (departed)");
        }
        out
    }

    /// Human readable dump of the key ownership store.
    pub fn summary(&self) -> String {
        let entries = self.store.entries();
        let mut out = format!("{} entries", entries.len());
        for (key, entry) in entries {
            let _ = write!(out, "\n{} {}: {}", key.short(), entry.name, entry.value);
        }
        out
    }
}
