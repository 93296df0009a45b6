// width of sha1 output; the id space is 2^160
pub const ID_SPACE_BITS : u32 = 160;
pub const ID_BYTES : usize = (ID_SPACE_BITS / 8) as usize;

// period of the stabilize loop
pub const STABILIZE_INTERVAL_MS : u64 = 3000;
// upper bound of the random delay added to each period so that
// neighbours do not stabilize in lockstep
pub const STABILIZE_JITTER_MS : u64 = 250;

// every RPC is cut off after this; the callee is then treated as down
pub const RPC_TIMEOUT_MS : u64 = 2000;
pub const GET_RESULT_TIMEOUT_MS : u64 = 5000;
pub const JOIN_TIMEOUT_MS : u64 = 10000;

// a finger table refresh originating at this node runs every N cycles
pub const FINGER_REFRESH_CYCLES : u32 = 5;

// a traversal whose hop count exceeds
// HOP_BOUND_FACTOR * ring_size_estimate + HOP_BOUND_SLACK is dropped
pub const HOP_BOUND_FACTOR : u32 = 4;
pub const HOP_BOUND_SLACK : u32 = 8;
