use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::chord_node::ChordNode;
use crate::chord_util;
use crate::data_store::Entry;
use crate::error::{Error, Result};
use crate::node_info::{MembershipTable, NodeIdentity, Slot};
use crate::rpc::{DataOp, DataReply, DataRequest, RingEvent, TossKind, TossMessage};
use crate::stabilizer;

// Keys are routed along the successor chain only, one hop per node. The
// finger table is bookkeeping for the resize traversal and is not consulted
// here.
pub async fn handle_data(node: &Arc<ChordNode>, req: DataRequest) -> Result<DataReply> {
    if req.op == DataOp::GetResult {
        node.deliver_get_result(&req.key, req.value);
        return Ok(DataReply::Accepted);
    }

    let successor = node.successor();
    // a departing node hands every request on; a node that only knows
    // itself has nobody to hand it to
    let serve_here = successor == node.identity
        || (!node.is_leaving() && node.membership.owns(&req.key));
    if serve_here {
        return serve_locally(node, req);
    }

    let bound = node.config.hop_bound(node.membership.ring_size_estimate());
    if node.estimate_measured() && req.hops >= bound {
        error!(node = %node.identity, key = ?req.key, hops = req.hops, bound, "data request is looping");
        return Err(Error::RingCorruption(format!(
            "{:?} for {} exceeded {} hops",
            req.op, req.key, bound
        )));
    }
    debug!(node = %node.identity, op = ?req.op, key = ?req.key, to = %successor, "forwarding data request");
    node.peers.handle_data(&successor.address, req.forwarded()).await
}

fn serve_locally(node: &Arc<ChordNode>, req: DataRequest) -> Result<DataReply> {
    match req.op {
        DataOp::Set => {
            let value = req.value.ok_or_else(|| {
                Error::ProtocolViolation(format!("set of {} without a value", req.key))
            })?;
            let replaced = node.store.set(req.key, Entry::new(req.name, value));
            debug!(node = %node.identity, key = ?req.key, replaced, "stored");
            Ok(DataReply::Stored)
        }
        DataOp::Delete => match node.store.delete(&req.key) {
            Ok(_) => Ok(DataReply::Deleted),
            Err(Error::KeyNotFound(_)) => Ok(DataReply::NotFound),
            Err(err) => Err(err),
        },
        DataOp::Get => {
            let value = node.store.get(&req.key).ok().map(|entry| entry.value);
            if req.requester == node.identity {
                node.deliver_get_result(&req.key, value);
            } else {
                send_get_result(node, req.requester, req.key, req.name, value);
            }
            Ok(DataReply::Accepted)
        }
        DataOp::GetResult => Err(Error::ProtocolViolation("get result routed as a request".to_string())),
    }
}

fn send_get_result(node: &Arc<ChordNode>, requester: NodeIdentity, key: chord_util::RingKey, name: String, value: Option<String>) {
    let me = Arc::clone(node);
    tokio::spawn(async move {
        let reply = DataRequest::new(DataOp::GetResult, key, name, value, me.identity.clone());
        if let Err(err) = me.peers.handle_data(&requester.address, reply).await {
            warn!(node = %me.identity, requester = %requester, %err, "could not deliver get result");
        }
    });
}

pub async fn dispatch_toss(node: &Arc<ChordNode>, msg: TossMessage) -> Result<bool> {
    match msg.kind {
        TossKind::Join => forward_join(node, msg).await,
        TossKind::FingerResize | TossKind::Leave => relay_resize(node, msg),
    }
}

// The member whose (self, successor] interval holds the joining key splices
// it in; everybody else passes the request one hop clockwise.
async fn forward_join(node: &Arc<ChordNode>, msg: TossMessage) -> Result<bool> {
    let joiner = msg.origin.clone();
    if joiner == node.identity {
        warn!(node = %node.identity, "join request for this node itself");
        return Ok(false);
    }
    let successor = node.successor();
    if joiner == successor {
        debug!(node = %node.identity, joiner = %joiner, "joiner is already our successor");
        return Ok(true);
    }
    if chord_util::in_half_open(&joiner.key, &node.identity.key, &successor.key) {
        stabilizer::splice(node, joiner).await?;
        return Ok(true);
    }

    if !within_hop_bound(node, &msg) {
        return Ok(false);
    }
    forward_toss(node, successor, msg.next_hop());
    Ok(true)
}

// Finger resize / leave traversal. Every node visited at hop h tells the
// origin it is finger[log2 h] when h is a power of two. The message comes
// back to the origin after one lap and the final hop count is the ring size.
pub fn relay_resize(node: &Arc<ChordNode>, msg: TossMessage) -> Result<bool> {
    let successor = node.successor();

    if msg.origin == node.identity {
        if msg.hop_count > 0 {
            complete_traversal(node, msg.hop_count);
        } else if successor == node.identity {
            complete_traversal(node, 1);
        } else {
            debug!(node = %node.identity, event = ?msg.event, "starting finger traversal");
            forward_toss(node, successor, msg.next_hop());
        }
        return Ok(true);
    }

    if !within_hop_bound(node, &msg) {
        return Ok(false);
    }

    apply_ring_event(node, &msg);

    if msg.hop_count.is_power_of_two() {
        let idx = msg.hop_count.trailing_zeros() as usize;
        let me = Arc::clone(node);
        let origin = msg.origin.clone();
        tokio::spawn(async move {
            let self_node = me.identity.clone();
            if let Err(err) = me.notify(&origin, Slot::Finger(idx), self_node).await {
                warn!(node = %me.identity, origin = %origin, idx, %err, "finger notification failed");
            }
        });
    }

    if successor == node.identity {
        warn!(node = %node.identity, origin = %msg.origin, "traversal reached a node with no successor, dropped");
        return Ok(true);
    }
    forward_toss(node, successor, msg.next_hop());
    Ok(true)
}

fn within_hop_bound(node: &Arc<ChordNode>, msg: &TossMessage) -> bool {
    let bound = node.config.hop_bound(node.membership.ring_size_estimate());
    if node.estimate_measured() && msg.hop_count > bound {
        let err = Error::RingCorruption(format!(
            "{:?} from {} reached hop {} (bound {})",
            msg.kind, msg.origin, msg.hop_count, bound
        ));
        error!(node = %node.identity, %err, "traversal aborted");
        return false;
    }
    true
}

fn apply_ring_event(node: &Arc<ChordNode>, msg: &TossMessage) {
    let before = node.membership.ring_size_estimate();
    let delta = match msg.event {
        RingEvent::Join => 1,
        RingEvent::Leave => -1,
        RingEvent::Refresh => 0,
    };
    let mut after = node.membership.adjust_ring_size_estimate(delta);
    // being reached at hop h proves at least h + 1 members
    let seen = msg.hop_count as usize + 1;
    if after < seen {
        after = node.membership.adjust_ring_size_estimate((seen - after) as i64);
    }
    if MembershipTable::expected_finger_len(before) != MembershipTable::expected_finger_len(after) {
        node.request_refresh();
    }
}

fn complete_traversal(node: &Arc<ChordNode>, ring_size: u32) {
    node.membership.complete_ring_size(ring_size as usize);
    node.set_estimate_measured(true);
    info!(
        node = %node.identity,
        ring_size,
        fingers = node.membership.fingers().len(),
        "finger traversal completed"
    );
}

fn forward_toss(node: &Arc<ChordNode>, to: NodeIdentity, msg: TossMessage) {
    let me = Arc::clone(node);
    tokio::spawn(async move {
        match me.peers.toss_message(&to.address, msg.clone()).await {
            Ok(true) => {}
            Ok(false) => warn!(node = %me.identity, to = %to, kind = ?msg.kind, "toss message refused"),
            Err(err) => warn!(node = %me.identity, to = %to, kind = ?msg.kind, %err, "toss message lost"),
        }
    });
}
