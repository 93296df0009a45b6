use std::sync::Arc;
use std::time::Duration;

use rust_chord_kvs::chord_util::{self, RingKey};
use rust_chord_kvs::config::NodeConfig;
use rust_chord_kvs::node_info::{NodeIdentity, Slot};
use rust_chord_kvs::sim::{self, SimNetwork};
use rust_chord_kvs::{ChordNode, Error};

fn test_config(address: &str) -> NodeConfig {
    let mut config = NodeConfig::new(address);
    config.stabilize_interval = Duration::from_millis(20);
    config.stabilize_jitter = Duration::ZERO;
    config.get_result_timeout = Duration::from_secs(2);
    config.join_timeout = Duration::from_secs(2);
    config
}

fn spawn_node(net: &Arc<SimNetwork>, key: u64) -> Arc<ChordNode> {
    let address = format!("node-{key}");
    let identity = NodeIdentity::new(RingKey::from_u64(key), address.clone());
    let node = ChordNode::with_identity(identity, test_config(&address), net.clone());
    net.register(&node);
    node
}

async fn build_ring(net: &Arc<SimNetwork>, keys: &[u64]) -> Vec<Arc<ChordNode>> {
    let first = spawn_node(net, keys[0]);
    let mut nodes = vec![Arc::clone(&first)];
    for key in &keys[1..] {
        let node = spawn_node(net, *key);
        node.join(&first.identity.address).await.unwrap();
        net.stabilize_all(2).await;
        nodes.push(node);
    }
    net.stabilize_all(8).await;
    nodes
}

fn owner_of(nodes: &[Arc<ChordNode>], key: &RingKey) -> Arc<ChordNode> {
    let owners: Vec<_> = nodes
        .iter()
        .filter(|n| chord_util::in_half_open(key, &n.predecessor().key, &n.identity.key))
        .cloned()
        .collect();
    assert_eq!(owners.len(), 1, "key {key} must have exactly one owner");
    Arc::clone(&owners[0])
}

fn k(v: u64) -> RingKey {
    RingKey::from_u64(v)
}

#[tokio::test]
async fn two_node_ring_routes_to_the_interval_owner() {
    let net = SimNetwork::new();
    let nodes = build_ring(&net, &[10, 50]).await;
    let (a, b) = (&nodes[0], &nodes[1]);

    assert_eq!(a.successor(), b.identity);
    assert_eq!(a.predecessor(), b.identity);
    assert_eq!(b.successor(), a.identity);
    assert_eq!(b.predecessor(), a.identity);

    // 20 is in (10, 50], owned by B; 60 is in (50, 10], owned by A
    a.set_key(k(20), "twenty", "x").await.unwrap();
    b.set_key(k(60), "sixty", "y").await.unwrap();
    assert_eq!(b.store.get(&k(20)).unwrap().value, "x");
    assert!(a.store.get(&k(20)).is_err());
    assert_eq!(a.store.get(&k(60)).unwrap().value, "y");

    assert_eq!(b.get_key(k(20), "twenty").await.unwrap(), "x");
    assert_eq!(a.get_key(k(20), "twenty").await.unwrap(), "x");
    assert_eq!(b.get_key(k(60), "sixty").await.unwrap(), "y");
}

#[tokio::test]
async fn joins_converge_to_a_consistent_ring() {
    let net = SimNetwork::new();
    let first = ChordNode::new(test_config("10.0.0.1:5000"), net.clone());
    net.register(&first);
    // the network only keeps weak references, so the test owns every node
    let mut nodes = vec![Arc::clone(&first)];
    for i in 2..=6 {
        let node = ChordNode::new(test_config(&format!("10.0.0.{i}:5000")), net.clone());
        net.register(&node);
        node.join(&first.identity.address).await.unwrap();
        net.stabilize_all(2).await;
        nodes.push(node);
    }
    net.stabilize_all(6).await;

    let live = net.live_nodes();
    assert_eq!(live.len(), 6);
    for node in &live {
        assert_eq!(net.check_nodes_connectivity(node).unwrap(), 6);
        assert_eq!(node.membership.ring_size_estimate(), 6);
    }
    // live_nodes is sorted by key, so neighbours in the vector are ring neighbours
    for (i, node) in live.iter().enumerate() {
        let next = &live[(i + 1) % live.len()];
        assert_eq!(node.successor(), next.identity);
        assert_eq!(next.predecessor(), node.identity);
    }
}

#[tokio::test]
async fn set_then_get_from_every_entry_point() {
    let net = SimNetwork::new();
    let nodes = build_ring(&net, &[10, 30, 50, 70]).await;

    for (i, writer) in nodes.iter().enumerate() {
        let name = format!("key-{i}");
        writer.set(&name, &format!("value-{i}")).await.unwrap();
    }
    for reader in &nodes {
        for i in 0..nodes.len() {
            assert_eq!(reader.get(&format!("key-{i}")).await.unwrap(), format!("value-{i}"));
        }
    }

    // every entry sits on the unique owner of its key
    for node in &nodes {
        for (key, _) in node.store.entries() {
            assert_eq!(owner_of(&nodes, &key).identity, node.identity);
        }
    }
}

#[tokio::test]
async fn deleted_key_is_not_found_anywhere() {
    let net = SimNetwork::new();
    let nodes = build_ring(&net, &[10, 30, 50]).await;

    nodes[0].set("doomed", "soon").await.unwrap();
    nodes[1].delete("doomed").await.unwrap();
    for node in &nodes {
        assert!(matches!(node.get("doomed").await, Err(Error::KeyNotFound(_))));
    }
    assert!(matches!(nodes[2].delete("doomed").await, Err(Error::KeyNotFound(_))));
}

#[tokio::test]
async fn dead_successor_is_replaced_by_next_live_finger() {
    let net = SimNetwork::new();
    let nodes = build_ring(&net, &[10, 30, 50, 70]).await;
    let (n30, n50, n70) = (&nodes[1], &nodes[2], &nodes[3]);
    assert_eq!(n30.successor(), n50.identity);

    net.kill(&n50.identity.address);
    net.stabilize_all(3).await;

    assert_eq!(n30.successor(), n70.identity);
    assert_eq!(n70.predecessor(), n30.identity);
    for node in net.live_nodes() {
        assert_eq!(net.check_nodes_connectivity(&node).unwrap(), 3);
    }
}

#[tokio::test]
async fn finger_tables_grow_when_the_ring_doubles() {
    let net = SimNetwork::new();
    let mut nodes = build_ring(&net, &[10, 50]).await;
    for node in &nodes {
        assert_eq!(node.membership.fingers().len(), 1);
    }

    for key in [30, 70] {
        let node = spawn_node(&net, key);
        node.join(&nodes[0].identity.address).await.unwrap();
        net.stabilize_all(2).await;
        nodes.push(node);
    }
    net.stabilize_all(8).await;

    let ring = net.live_nodes();
    assert_eq!(ring.len(), 4);
    for (pos, node) in ring.iter().enumerate() {
        let fingers = node.membership.fingers();
        assert_eq!(fingers.len(), 2, "fingers of {}", node.identity);
        for (i, finger) in fingers.iter().enumerate() {
            let hops = 1usize << i;
            assert_eq!(*finger, ring[(pos + hops) % ring.len()].identity);
        }
    }
}

#[tokio::test]
async fn graceful_leave_hands_entries_to_the_ring() {
    let net = SimNetwork::new();
    let nodes = build_ring(&net, &[10, 30, 50]).await;
    let (a, c, b) = (&nodes[0], &nodes[1], &nodes[2]);

    a.set_key(k(20), "k20", "v20").await.unwrap();
    a.set_key(k(40), "k40", "v40").await.unwrap();
    a.set_key(k(60), "k60", "v60").await.unwrap();
    assert_eq!(b.store.len(), 1);

    let leaving = Arc::clone(b);
    let departure = tokio::spawn(async move { leaving.leave().await });
    while !departure.is_finished() {
        net.stabilize_all(1).await;
    }
    departure.await.unwrap().unwrap();
    net.stabilize_all(3).await;

    assert!(matches!(b.health_check(), Err(Error::Leaving)));
    assert_eq!(b.store.len(), 0);
    assert_eq!(c.successor(), a.identity);
    assert_eq!(a.predecessor(), c.identity);
    for node in [a, c] {
        assert_eq!(node.get_key(k(40), "k40").await.unwrap(), "v40");
        assert_eq!(node.get_key(k(20), "k20").await.unwrap(), "v20");
        assert_eq!(node.membership.ring_size_estimate(), 2);
    }
    assert_eq!(a.store.get(&k(40)).unwrap().value, "v40");

    // a departed node may come back
    b.join(&a.identity.address).await.unwrap();
    net.stabilize_all(4).await;
    assert_eq!(net.check_nodes_connectivity(a).unwrap(), 3);
    assert_eq!(b.store.get(&k(40)).unwrap().value, "v40");
}

#[tokio::test]
async fn join_is_spliced_by_exactly_one_member() {
    let net = SimNetwork::new();
    let nodes = build_ring(&net, &[10, 30, 50, 70]).await;
    let before: Vec<NodeIdentity> = nodes.iter().map(|n| n.successor()).collect();

    // 60 belongs between 50 and 70; ask 10 so the request has to travel
    let joiner = spawn_node(&net, 60);
    joiner.join(&nodes[0].identity.address).await.unwrap();
    sim::settle().await;

    assert_eq!(joiner.predecessor(), nodes[2].identity);
    assert_eq!(joiner.successor(), nodes[3].identity);
    for (i, node) in nodes.iter().enumerate() {
        if i == 2 {
            assert_eq!(node.successor(), joiner.identity);
        } else {
            assert_eq!(node.successor(), before[i]);
        }
    }
    assert_eq!(nodes[3].predecessor(), joiner.identity);
}

#[tokio::test]
async fn node_spliced_in_behind_our_back_is_adopted() {
    let net = SimNetwork::new();
    let nodes = build_ring(&net, &[10, 50]).await;
    let (a, b) = (&nodes[0], &nodes[1]);

    // 30 sits between 10 and 50 and 50 already knows it; 10 does not
    let c = spawn_node(&net, 30);
    c.membership.set_slot(Slot::Predecessor, a.identity.clone()).unwrap();
    c.membership.set_slot(Slot::SUCCESSOR, b.identity.clone()).unwrap();
    b.membership.set_slot(Slot::Predecessor, c.identity.clone()).unwrap();
    assert_eq!(a.successor(), b.identity);

    net.stabilize_all(4).await;

    assert_eq!(a.successor(), c.identity);
    assert_eq!(c.predecessor(), a.identity);
    assert_eq!(b.predecessor(), c.identity);
    assert_eq!(net.check_nodes_connectivity(a).unwrap(), 3);
}

#[tokio::test]
async fn entries_written_early_follow_their_owner_as_the_ring_grows() {
    let net = SimNetwork::new();
    let first = ChordNode::new(test_config("10.0.1.1:5000"), net.clone());
    net.register(&first);
    for i in 0..10 {
        first.set(&format!("early-{i}"), &format!("v{i}")).await.unwrap();
    }
    assert_eq!(first.store.len(), 10);

    let mut nodes = vec![Arc::clone(&first)];
    for i in 2..=5 {
        let node = ChordNode::new(test_config(&format!("10.0.1.{i}:5000")), net.clone());
        net.register(&node);
        node.join(&first.identity.address).await.unwrap();
        net.stabilize_all(2).await;
        nodes.push(node);
    }
    net.stabilize_all(8).await;

    let stored: usize = nodes.iter().map(|n| n.store.len()).sum();
    assert_eq!(stored, 10);
    for node in &nodes {
        for (key, _) in node.store.entries() {
            assert_eq!(owner_of(&nodes, &key).identity, node.identity);
        }
    }
    for i in 0..10 {
        assert_eq!(nodes[3].get(&format!("early-{i}")).await.unwrap(), format!("v{i}"));
    }
}

#[tokio::test]
async fn joining_through_oneself_is_rejected() {
    let net = SimNetwork::new();
    let node = spawn_node(&net, 10);
    let err = node.join(&node.identity.address.clone()).await.unwrap_err();
    assert!(matches!(err, Error::InvalidCommand(_)));
}
