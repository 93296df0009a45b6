use std::fmt;
use std::hash::{Hash, Hasher};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::chord_util::{self, RingKey};
use crate::error::{Error, Result};
use crate::gval;

/// Who a ring member is. Immutable once built; two identities are the same
/// node when their keys match.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub key: RingKey,
    pub address: String,
}

impl NodeIdentity {
    pub fn new(key: RingKey, address: impl Into<String>) -> NodeIdentity {
        NodeIdentity { key, address: address.into() }
    }

    pub fn from_address(address: impl Into<String>) -> NodeIdentity {
        let address = address.into();
        NodeIdentity { key: RingKey::from_address(&address), address }
    }
}

impl PartialEq for NodeIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for NodeIdentity {}

impl Hash for NodeIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}%,{}", self.key.short(), chord_util::conv_id_to_ratio_str(&self.key), self.address)
    }
}

/// One addressable entry of a membership table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "slot", content = "index", rename_all = "snake_case")]
pub enum Slot {
    Predecessor,
    Finger(usize),
}

impl Slot {
    pub const SUCCESSOR: Slot = Slot::Finger(0);
    pub const DOUBLE_SUCCESSOR: Slot = Slot::Finger(1);
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Slot::Predecessor => write!(f, "predecessor"),
            Slot::Finger(idx) => write!(f, "finger[{idx}]"),
        }
    }
}

/// Predecessor plus finger list of one node.
///
/// `fingers` is never empty: index 0 is the successor, index i the node
/// reached after 2^i hops clockwise. A node that is alone on the ring has
/// itself in both the predecessor slot and `fingers[0]`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MembershipTable {
    pub self_node: NodeIdentity,
    pub predecessor: NodeIdentity,
    pub fingers: Vec<NodeIdentity>,
    pub ring_size_estimate: usize,
}

impl MembershipTable {
    pub fn new(self_node: NodeIdentity) -> MembershipTable {
        MembershipTable {
            predecessor: self_node.clone(),
            fingers: vec![self_node.clone()],
            ring_size_estimate: 1,
            self_node,
        }
    }

    pub fn reset_singleton(&mut self) {
        self.predecessor = self.self_node.clone();
        self.fingers = vec![self.self_node.clone()];
        self.ring_size_estimate = 1;
    }

    pub fn is_singleton(&self) -> bool {
        self.successor() == &self.self_node && self.predecessor == self.self_node
    }

    pub fn successor(&self) -> &NodeIdentity {
        &self.fingers[0]
    }

    pub fn double_successor(&self) -> &NodeIdentity {
        self.fingers.get(1).unwrap_or(&self.fingers[0])
    }

    /// Whether `key` lies in this node's ownership interval `(predecessor, self]`.
    pub fn owns(&self, key: &RingKey) -> bool {
        chord_util::in_half_open(key, &self.predecessor.key, &self.self_node.key)
    }

    pub fn get_slot(&self, slot: Slot) -> Option<NodeIdentity> {
        match slot {
            Slot::Predecessor => Some(self.predecessor.clone()),
            Slot::Finger(idx) => self.fingers.get(idx).cloned(),
        }
    }

    /// Overwrites one slot and reports whether its content changed.
    ///
    /// A finger index past the end of the list is not an error: the list is
    /// first padded with copies of its last entry so it stays dense and
    /// ordered by ring distance.
    pub fn set_slot(&mut self, slot: Slot, node: NodeIdentity) -> Result<bool> {
        match slot {
            Slot::Predecessor => {
                let changed = self.predecessor != node;
                self.predecessor = node;
                Ok(changed)
            }
            Slot::Finger(idx) => {
                if idx >= gval::ID_SPACE_BITS as usize {
                    return Err(Error::ProtocolViolation(format!(
                        "finger index {idx} outside a {}-bit id space",
                        gval::ID_SPACE_BITS
                    )));
                }
                while self.fingers.len() <= idx {
                    let placeholder = self.fingers[self.fingers.len() - 1].clone();
                    self.fingers.push(placeholder);
                }
                let changed = self.fingers[idx] != node;
                self.fingers[idx] = node;
                Ok(changed)
            }
        }
    }

    /// Makes `fingers[index]` the successor, dropping the entries ahead of it.
    pub fn promote_successor(&mut self, index: usize) {
        if index > 0 && index < self.fingers.len() {
            self.fingers.drain(..index);
        }
    }

    /// Inserts `node` as the new successor; the old successor becomes the
    /// double successor.
    pub fn splice_successor(&mut self, node: NodeIdentity) {
        let old_successor = std::mem::replace(&mut self.fingers[0], node);
        if self.fingers.len() < 2 {
            self.fingers.push(old_successor);
        } else {
            self.fingers[1] = old_successor;
        }
    }

    /// Removes every finger pointing at `dead`, except that the list never
    /// becomes empty.
    pub fn forget(&mut self, dead: &RingKey) {
        let self_node = self.self_node.clone();
        self.fingers.retain(|f| &f.key != dead);
        if self.fingers.is_empty() {
            self.fingers.push(self_node);
        }
    }

    pub fn reset_fingers(&mut self, successor: NodeIdentity) {
        self.fingers = vec![successor];
    }

    /// ceil(log2(ring_size)), at least one entry for the successor.
    pub fn expected_finger_len(ring_size: usize) -> usize {
        if ring_size <= 2 {
            return 1;
        }
        (usize::BITS - (ring_size - 1).leading_zeros()) as usize
    }

    /// Drops fingers beyond what the current estimate calls for.
    pub fn fit_fingers(&mut self) {
        let len = MembershipTable::expected_finger_len(self.ring_size_estimate);
        if self.fingers.len() > len {
            self.fingers.truncate(len);
        }
    }
}

/// Read/write access to a node's membership table, safe to share between the
/// RPC handlers and the stabilize loop.
pub trait RingMembership: Send + Sync {
    fn self_node(&self) -> NodeIdentity;
    fn predecessor(&self) -> NodeIdentity;
    fn successor(&self) -> NodeIdentity;
    fn fingers(&self) -> Vec<NodeIdentity>;
    fn ring_size_estimate(&self) -> usize;
    fn snapshot(&self) -> MembershipTable;
    fn owns(&self, key: &RingKey) -> bool;
    fn get_slot(&self, slot: Slot) -> Option<NodeIdentity>;
    fn set_slot(&self, slot: Slot, node: NodeIdentity) -> Result<bool>;
    fn promote_successor(&self, index: usize);
    fn splice_successor(&self, node: NodeIdentity);
    fn forget(&self, dead: &RingKey);
    fn reset_fingers(&self, successor: NodeIdentity);
    fn reset_singleton(&self);
    /// Applies a join (+1) or leave (-1) to the estimate; never drops below 1.
    fn adjust_ring_size_estimate(&self, delta: i64) -> usize;
    /// Records a measured ring size and trims the finger list to match.
    fn complete_ring_size(&self, ring_size: usize);
}

pub struct Membership {
    table: Mutex<MembershipTable>,
}

impl Membership {
    pub fn new(self_node: NodeIdentity) -> Membership {
        Membership { table: Mutex::new(MembershipTable::new(self_node)) }
    }
}

impl RingMembership for Membership {
    fn self_node(&self) -> NodeIdentity {
        self.table.lock().self_node.clone()
    }

    fn predecessor(&self) -> NodeIdentity {
        self.table.lock().predecessor.clone()
    }

    fn successor(&self) -> NodeIdentity {
        self.table.lock().successor().clone()
    }

    fn fingers(&self) -> Vec<NodeIdentity> {
        self.table.lock().fingers.clone()
    }

    fn ring_size_estimate(&self) -> usize {
        self.table.lock().ring_size_estimate
    }

    fn snapshot(&self) -> MembershipTable {
        self.table.lock().clone()
    }

    fn owns(&self, key: &RingKey) -> bool {
        self.table.lock().owns(key)
    }

    fn get_slot(&self, slot: Slot) -> Option<NodeIdentity> {
        self.table.lock().get_slot(slot)
    }

    fn set_slot(&self, slot: Slot, node: NodeIdentity) -> Result<bool> {
        self.table.lock().set_slot(slot, node)
    }

    fn promote_successor(&self, index: usize) {
        self.table.lock().promote_successor(index);
    }

    fn splice_successor(&self, node: NodeIdentity) {
        self.table.lock().splice_successor(node);
    }

    fn forget(&self, dead: &RingKey) {
        self.table.lock().forget(dead);
    }

    fn reset_fingers(&self, successor: NodeIdentity) {
        self.table.lock().reset_fingers(successor);
    }

    fn reset_singleton(&self) {
        self.table.lock().reset_singleton();
    }

    fn adjust_ring_size_estimate(&self, delta: i64) -> usize {
        let mut table = self.table.lock();
        let next = (table.ring_size_estimate as i64 + delta).max(1);
        table.ring_size_estimate = next as usize;
        table.ring_size_estimate
    }

    fn complete_ring_size(&self, ring_size: usize) {
        let mut table = self.table.lock();
        table.ring_size_estimate = ring_size.max(1);
        table.fit_fingers();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(v: u64) -> NodeIdentity {
        NodeIdentity::new(RingKey::from_u64(v), format!("n{v}"))
    }

    #[test]
    fn new_table_is_a_singleton_owning_everything() {
        let table = MembershipTable::new(node(10));
        assert!(table.is_singleton());
        assert_eq!(table.successor(), &node(10));
        assert!(table.owns(&RingKey::from_u64(99)));
        assert!(table.owns(&RingKey::from_u64(10)));
    }

    #[test]
    fn identity_equality_ignores_address() {
        let a = NodeIdentity::new(RingKey::from_u64(1), "x:1");
        let b = NodeIdentity::new(RingKey::from_u64(1), "y:2");
        assert_eq!(a, b);
    }

    #[test]
    fn ownership_is_predecessor_to_self() {
        let mut table = MembershipTable::new(node(10));
        table.set_slot(Slot::Predecessor, node(50)).unwrap();
        assert!(table.owns(&RingKey::from_u64(60)));
        assert!(table.owns(&RingKey::from_u64(10)));
        assert!(!table.owns(&RingKey::from_u64(20)));
        assert!(!table.owns(&RingKey::from_u64(50)));
    }

    #[test]
    fn far_finger_is_densified_with_placeholders() {
        let mut table = MembershipTable::new(node(10));
        table.set_slot(Slot::SUCCESSOR, node(20)).unwrap();
        assert!(table.set_slot(Slot::Finger(3), node(80)).unwrap());
        assert_eq!(table.fingers.len(), 4);
        assert_eq!(table.fingers[1], node(20));
        assert_eq!(table.fingers[2], node(20));
        assert_eq!(table.fingers[3], node(80));
        assert!(!table.set_slot(Slot::Finger(3), node(80)).unwrap());
    }

    #[test]
    fn finger_outside_id_space_is_rejected() {
        let mut table = MembershipTable::new(node(10));
        let err = table.set_slot(Slot::Finger(160), node(20)).unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation(_)));
    }

    #[test]
    fn splice_shifts_old_successor_to_double_successor() {
        let mut table = MembershipTable::new(node(10));
        table.splice_successor(node(30));
        assert_eq!(table.fingers, vec![node(30), node(10)]);
        table.splice_successor(node(20));
        assert_eq!(table.fingers, vec![node(20), node(30)]);
    }

    #[test]
    fn promote_drops_dead_entries_ahead() {
        let mut table = MembershipTable::new(node(10));
        table.fingers = vec![node(20), node(30), node(40)];
        table.promote_successor(2);
        assert_eq!(table.fingers, vec![node(40)]);
        table.promote_successor(5);
        assert_eq!(table.fingers, vec![node(40)]);
    }

    #[test]
    fn forget_never_empties_the_list() {
        let mut table = MembershipTable::new(node(10));
        table.fingers = vec![node(20), node(20)];
        table.forget(&RingKey::from_u64(20));
        assert_eq!(table.fingers, vec![node(10)]);
    }

    #[test]
    fn expected_finger_len_is_ceil_log2() {
        assert_eq!(MembershipTable::expected_finger_len(1), 1);
        assert_eq!(MembershipTable::expected_finger_len(2), 1);
        assert_eq!(MembershipTable::expected_finger_len(3), 2);
        assert_eq!(MembershipTable::expected_finger_len(4), 2);
        assert_eq!(MembershipTable::expected_finger_len(5), 3);
        assert_eq!(MembershipTable::expected_finger_len(1024), 10);
    }

    #[test]
    fn complete_ring_size_trims_fingers() {
        let membership = Membership::new(node(10));
        for (i, v) in [20, 30, 50].into_iter().enumerate() {
            membership.set_slot(Slot::Finger(i), node(v)).unwrap();
        }
        membership.complete_ring_size(4);
        assert_eq!(membership.fingers(), vec![node(20), node(30)]);
        assert_eq!(membership.ring_size_estimate(), 4);
        assert_eq!(membership.adjust_ring_size_estimate(-10), 1);
    }

    #[test]
    fn slot_wire_format_is_tagged() {
        let json = serde_json::to_string(&Slot::Finger(2)).unwrap();
        assert_eq!(json, r#"{"slot":"finger","index":2}"#);
        let back: Slot = serde_json::from_str(r#"{"slot":"predecessor"}"#).unwrap();
        assert_eq!(back, Slot::Predecessor);
    }
}
