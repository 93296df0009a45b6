use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, info, warn};

use crate::chord_node::ChordNode;
use crate::chord_util;
use crate::error::{Error, Result};
use crate::node_info::{NodeIdentity, Slot};
use crate::router;
use crate::rpc::{DataOp, DataRequest, RingEvent, TossKind, TossMessage};

/// Runs `stabilize_once` forever with the configured period plus jitter.
pub async fn stabilize_loop(node: Arc<ChordNode>) {
    let jitter_ms = node.config.stabilize_jitter.as_millis() as u64;
    loop {
        let extra = Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms));
        tokio::time::sleep(node.config.stabilize_interval + extra).await;
        stabilize_once(&node).await;
    }
}

/// One stabilization cycle. Every step tolerates dead peers and leaves the
/// rest of the repair to the next cycle.
pub async fn stabilize_once(node: &Arc<ChordNode>) {
    if node.is_leaving() {
        return;
    }
    repair_successor(node).await;
    check_successor_consistency(node).await;
    check_predecessor(node).await;
    repair_ownership(node).await;
    if node.refresh_due() {
        start_finger_refresh(node);
    }
}

async fn is_alive(node: &Arc<ChordNode>, target: &NodeIdentity) -> bool {
    if *target == node.identity {
        return true;
    }
    node.peers.health_check(&target.address).await.is_ok()
}

// a dead successor is replaced by the first live finger after it
async fn repair_successor(node: &Arc<ChordNode>) {
    let fingers = node.membership.fingers();
    let successor = fingers[0].clone();
    if successor == node.identity {
        return;
    }
    if let Err(err) = node.peers.health_check(&successor.address).await {
        warn!(node = %node.identity, successor = %successor, %err, "successor is down");
    } else {
        return;
    }

    for (idx, candidate) in fingers.iter().enumerate().skip(1) {
        if *candidate == successor || *candidate == node.identity {
            continue;
        }
        if !is_alive(node, candidate).await {
            continue;
        }
        node.membership.promote_successor(idx);
        node.membership.forget(&successor.key);
        info!(node = %node.identity, successor = %candidate, "promoted finger to successor");
        match node.peers.get_node_value(&candidate.address, Slot::SUCCESSOR).await {
            Ok(Some(next)) => {
                if let Err(err) = node.membership.set_slot(Slot::DOUBLE_SUCCESSOR, next) {
                    debug!(node = %node.identity, %err, "double successor rejected");
                }
            }
            Ok(None) => {}
            Err(err) => debug!(node = %node.identity, %err, "could not refill double successor"),
        }
        node.request_refresh();
        return;
    }

    let predecessor = node.membership.predecessor();
    if predecessor != node.identity && predecessor != successor && is_alive(node, &predecessor).await {
        info!(node = %node.identity, successor = %predecessor, "no live finger, falling back to predecessor");
        node.membership.reset_fingers(predecessor);
    } else {
        info!(node = %node.identity, "no live neighbour left, now alone on the ring");
        node.membership.reset_singleton();
    }
    node.request_refresh();
}

async fn check_successor_consistency(node: &Arc<ChordNode>) {
    let mut successor = node.membership.successor();
    if successor == node.identity {
        let predecessor = node.membership.predecessor();
        if predecessor == node.identity {
            return;
        }
        // the predecessor is the only other member we know of
        node.membership.reset_fingers(predecessor.clone());
        successor = predecessor;
    }

    let reported = match node.peers.get_node_value(&successor.address, Slot::Predecessor).await {
        Ok(reported) => reported,
        Err(err) => {
            debug!(node = %node.identity, successor = %successor, %err, "successor did not answer");
            return;
        }
    };

    if let Some(candidate) = reported {
        if candidate == node.identity {
            return;
        }
        if chord_util::in_open(&candidate.key, &node.identity.key, &successor.key)
            && is_alive(node, &candidate).await
        {
            info!(node = %node.identity, successor = %candidate, "adopting node spliced in ahead of us");
            node.membership.splice_successor(candidate);
            return;
        }
    }

    debug!(node = %node.identity, successor = %successor, "claiming predecessor slot of successor");
    if let Err(err) = node.notify(&successor, Slot::Predecessor, node.identity.clone()).await {
        warn!(node = %node.identity, successor = %successor, %err, "could not claim predecessor slot");
    }
}

// Passive: a dead predecessor is replaced only when the node that took over
// its interval notifies us.
async fn check_predecessor(node: &Arc<ChordNode>) {
    let predecessor = node.membership.predecessor();
    if predecessor == node.identity {
        return;
    }
    if let Err(err) = node.peers.health_check(&predecessor.address).await {
        warn!(node = %node.identity, predecessor = %predecessor, %err, "predecessor is not answering");
    }
}

/// Moves every stored entry that falls outside `(predecessor, self]` to the
/// neighbour on its side of the ring. Entries whose transfer fails are put
/// back and retried on the next cycle.
pub async fn repair_ownership(node: &Arc<ChordNode>) {
    let table = node.membership.snapshot();
    let predecessor = table.predecessor.clone();
    let successor = table.successor().clone();
    let misplaced = node.store.drain_outside(&predecessor.key, &node.identity.key);
    if misplaced.is_empty() {
        return;
    }
    info!(node = %node.identity, count = misplaced.len(), "handing over entries outside our interval");

    for (key, entry) in misplaced {
        let target = if successor != node.identity
            && chord_util::in_half_open(&key, &node.identity.key, &successor.key)
        {
            successor.clone()
        } else {
            predecessor.clone()
        };
        let req = DataRequest::new(DataOp::Set, key, entry.name.clone(), Some(entry.value.clone()), node.identity.clone());
        if let Err(err) = node.peers.handle_data(&target.address, req).await {
            warn!(node = %node.identity, to = %target, key = ?key, %err, "handover failed, keeping entry");
            node.store.set(key, entry);
        }
    }
}

pub fn start_finger_refresh(node: &Arc<ChordNode>) {
    let msg = TossMessage::new(TossKind::FingerResize, node.identity.clone(), RingEvent::Refresh);
    if let Err(err) = router::relay_resize(node, msg) {
        warn!(node = %node.identity, %err, "finger refresh not started");
    }
}

/// Inserts `joiner` between this node and its successor.
///
/// Called on the member whose `(self, successor]` interval holds the
/// joiner's key. The joiner learns its whole neighbourhood before this node
/// points at it, and `fingers[0]` of the joiner is written last since the
/// joiner treats it as the completion signal.
pub async fn splice(node: &Arc<ChordNode>, joiner: NodeIdentity) -> Result<()> {
    node.peers.health_check(&joiner.address).await?;

    let table = node.membership.snapshot();
    let successor = table.successor().clone();
    let predecessor = table.predecessor.clone();
    let alone = successor == node.identity;

    let double_successor = if alone {
        joiner.clone()
    } else {
        match node.peers.get_node_value(&successor.address, Slot::SUCCESSOR).await {
            Ok(Some(next)) => next,
            _ => table.double_successor().clone(),
        }
    };
    info!(node = %node.identity, joiner = %joiner, successor = %successor, "splicing joiner");

    node.notify(&successor, Slot::Predecessor, joiner.clone()).await?;
    node.peers.notify_node_changed(&joiner.address, Slot::Predecessor, node.identity.clone()).await?;
    node.peers.notify_node_changed(&joiner.address, Slot::DOUBLE_SUCCESSOR, double_successor).await?;
    node.peers.notify_node_changed(&joiner.address, Slot::SUCCESSOR, successor).await?;

    node.membership.splice_successor(joiner.clone());

    if predecessor != node.identity {
        let me = Arc::clone(node);
        tokio::spawn(async move {
            if let Err(err) = me.notify(&predecessor, Slot::DOUBLE_SUCCESSOR, joiner).await {
                warn!(node = %me.identity, predecessor = %predecessor, %err, "could not update double successor of predecessor");
            }
        });
    }
    if alone {
        let me = Arc::clone(node);
        tokio::spawn(async move {
            repair_ownership(&me).await;
        });
    }
    Ok(())
}

pub async fn join(node: &Arc<ChordNode>, bootstrap: &str) -> Result<()> {
    if bootstrap == node.identity.address {
        return Err(Error::InvalidCommand("cannot join through this node itself".to_string()));
    }
    node.set_leaving(false);
    node.membership.reset_singleton();
    node.set_estimate_measured(false);
    info!(node = %node.identity, bootstrap, "joining");

    let request = TossMessage::new(TossKind::Join, node.identity.clone(), RingEvent::Join);
    if !node.peers.toss_message(bootstrap, request).await? {
        return Err(Error::RingCorruption(format!("{bootstrap} refused to route our join")));
    }

    let spliced = async {
        loop {
            let changed = node.table_changed();
            if node.membership.successor() != node.identity {
                return;
            }
            changed.await;
        }
    };
    tokio::time::timeout(node.config.join_timeout, spliced)
        .await
        .map_err(|_| Error::Timeout(format!("splice after joining via {bootstrap}")))?;

    let successor = node.membership.successor();
    info!(node = %node.identity, successor = %successor, predecessor = %node.membership.predecessor(), "joined the ring");

    let resize = TossMessage::new(TossKind::FingerResize, successor.clone(), RingEvent::Join);
    if let Err(err) = node.peers.toss_message(&successor.address, resize).await {
        warn!(node = %node.identity, %err, "could not start the join resize traversal");
    }
    node.request_refresh();
    Ok(())
}

/// Graceful departure. Stops answering health checks, gives the neighbours
/// one stabilize period to route around this node, then hands every entry
/// to the predecessor and announces the departure around the ring.
pub async fn leave(node: &Arc<ChordNode>) -> Result<()> {
    if node.is_leaving() {
        return Err(Error::Leaving);
    }
    node.set_leaving(true);
    let alone = node.membership.snapshot().is_singleton();
    info!(node = %node.identity, "leaving the ring");
    if alone {
        return Ok(());
    }

    tokio::time::sleep(node.config.stabilize_interval).await;

    let mut pending = node.store.entries();
    for attempt in 0..2 {
        if attempt > 0 {
            tokio::time::sleep(node.config.stabilize_interval).await;
        }
        let predecessor = node.membership.predecessor();
        let mut failed = Vec::new();
        for (key, entry) in pending {
            let req = DataRequest::new(DataOp::Set, key, entry.name.clone(), Some(entry.value.clone()), node.identity.clone());
            match node.peers.handle_data(&predecessor.address, req).await {
                Ok(_) => {
                    let _ = node.store.delete(&key);
                }
                Err(err) => {
                    debug!(node = %node.identity, key = ?key, %err, "handover attempt failed");
                    failed.push((key, entry));
                }
            }
        }
        pending = failed;
        if pending.is_empty() {
            break;
        }
    }
    if !pending.is_empty() {
        warn!(node = %node.identity, lost = pending.len(), "entries could not be handed over");
    }

    let successor = node.membership.successor();
    let announce = TossMessage::new(TossKind::Leave, successor.clone(), RingEvent::Leave);
    if let Err(err) = node.peers.toss_message(&successor.address, announce).await {
        warn!(node = %node.identity, successor = %successor, %err, "could not announce departure");
    }

    node.membership.reset_singleton();
    node.store.clear();
    info!(node = %node.identity, "left the ring");
    Ok(())
}
