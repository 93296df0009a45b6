use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::chord_util::RingKey;
use crate::error::Result;
use crate::node_info::{NodeIdentity, Slot};

#[derive(Serialize, Deserialize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TossKind {
    Join,
    FingerResize,
    Leave,
}

/// Membership change a resize traversal reports to every node it visits.
#[derive(Serialize, Deserialize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RingEvent {
    Join,
    Leave,
    Refresh,
}

/// Ring traversal control message. For `Join`, `origin` is the joining
/// node; for the other kinds it is the node the traversal started at and
/// must return to.
#[derive(Serialize, Deserialize)]
#[derive(Debug, Clone)]
pub struct TossMessage {
    pub kind: TossKind,
    pub origin: NodeIdentity,
    pub hop_count: u32,
    pub event: RingEvent,
}

impl TossMessage {
    pub fn new(kind: TossKind, origin: NodeIdentity, event: RingEvent) -> TossMessage {
        TossMessage { kind, origin, hop_count: 0, event }
    }

    pub fn next_hop(&self) -> TossMessage {
        TossMessage { hop_count: self.hop_count + 1, ..self.clone() }
    }
}

#[derive(Serialize, Deserialize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DataOp {
    Get,
    Set,
    Delete,
    GetResult,
}

#[derive(Serialize, Deserialize)]
#[derive(Debug, Clone)]
pub struct DataRequest {
    pub op: DataOp,
    pub key: RingKey,
    /// operator-facing key string, carried along for display on the owner
    pub name: String,
    /// value to store for `Set`; result for `GetResult` (None = not found)
    pub value: Option<String>,
    pub requester: NodeIdentity,
    pub hops: u32,
}

impl DataRequest {
    pub fn new(op: DataOp, key: RingKey, name: impl Into<String>, value: Option<String>, requester: NodeIdentity) -> DataRequest {
        DataRequest { op, key, name: name.into(), value, requester, hops: 0 }
    }

    pub fn forwarded(&self) -> DataRequest {
        DataRequest { hops: self.hops + 1, ..self.clone() }
    }
}

#[derive(Serialize, Deserialize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DataReply {
    /// request taken; for `Get` the value follows as a `GetResult`
    Accepted,
    Stored,
    Deleted,
    NotFound,
}

#[derive(Serialize, Deserialize)]
#[derive(Debug, Clone)]
pub struct GetNodeValueReq {
    pub slot: Slot,
}

#[derive(Serialize, Deserialize)]
#[derive(Debug, Clone)]
pub struct NotifyNodeChangedReq {
    pub slot: Slot,
    pub node: NodeIdentity,
}

/// The five verbs one node can invoke on another. Any transport failure or
/// timeout comes back as `Error::PeerUnreachable`.
#[async_trait]
pub trait PeerClient: Send + Sync {
    async fn health_check(&self, address: &str) -> Result<()>;

    async fn get_node_value(&self, address: &str, slot: Slot) -> Result<Option<NodeIdentity>>;

    async fn notify_node_changed(&self, address: &str, slot: Slot, node: NodeIdentity) -> Result<()>;

    /// `Ok(false)` is a nack: the receiver refused to carry the traversal.
    async fn toss_message(&self, address: &str, msg: TossMessage) -> Result<bool>;

    async fn handle_data(&self, address: &str, req: DataRequest) -> Result<DataReply>;
}
