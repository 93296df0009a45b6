//! A Chord distributed hash table node: ring membership, stabilization,
//! join/leave splicing, finger table resizing and successor-chain key
//! routing, served over HTTP/JSON.

pub mod gval;
pub mod chord_util;
pub mod error;
pub mod config;
pub mod node_info;
pub mod data_store;
pub mod rpc;
pub mod chord_node;
pub mod router;
pub mod stabilizer;
pub mod endpoints;
pub mod sim;
pub mod console;

pub use chord_node::ChordNode;
pub use config::NodeConfig;
pub use error::{Error, Result};
