use std::fmt;
use std::str::FromStr;

use num_bigint::BigUint;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha1::{Digest, Sha1};

use crate::error::{Error, Result};
use crate::gval;

/// A position on the ring: an unsigned 160-bit integer kept as big-endian
/// bytes, so the derived byte order is the numeric order.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct RingKey([u8; gval::ID_BYTES]);

impl RingKey {
    pub const ZERO: RingKey = RingKey([0u8; gval::ID_BYTES]);

    pub fn from_bytes(bytes: [u8; gval::ID_BYTES]) -> RingKey {
        RingKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; gval::ID_BYTES] {
        &self.0
    }

    /// Node ids and data ids are both the sha1 of their textual name.
    pub fn from_address(address: &str) -> RingKey {
        hash_str_to_key(address)
    }

    pub fn from_u64(val: u64) -> RingKey {
        let mut bytes = [0u8; gval::ID_BYTES];
        bytes[gval::ID_BYTES - 8..].copy_from_slice(&val.to_be_bytes());
        RingKey(bytes)
    }

    pub fn to_biguint(&self) -> BigUint {
        BigUint::from_bytes_be(&self.0)
    }

    /// Reduces `val` modulo 2^160 before converting.
    pub fn from_biguint(val: &BigUint) -> RingKey {
        let reduced = val % id_space_range();
        let raw = reduced.to_bytes_be();
        let mut bytes = [0u8; gval::ID_BYTES];
        bytes[gval::ID_BYTES - raw.len()..].copy_from_slice(&raw);
        RingKey(bytes)
    }

    /// `self + 2^exp` on the ring: the start of finger `exp`.
    pub fn add_pow2(&self, exp: u32) -> RingKey {
        let offset = BigUint::from(1u8) << exp;
        RingKey::from_biguint(&(self.to_biguint() + offset))
    }

    /// First ten hex digits, enough to tell nodes apart in logs.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..5])
    }
}

fn id_space_range() -> BigUint {
    BigUint::from(1u8) << gval::ID_SPACE_BITS
}

pub fn hash_str_to_key(input_str: &str) -> RingKey {
    let digest = Sha1::digest(input_str.as_bytes());
    let mut bytes = [0u8; gval::ID_BYTES];
    bytes.copy_from_slice(&digest);
    RingKey(bytes)
}

/// `target ∈ (from, end]` walking clockwise. `from == end` covers the whole
/// ring, which is what a node that is its own predecessor owns.
pub fn in_half_open(target: &RingKey, from: &RingKey, end: &RingKey) -> bool {
    if from < end {
        from < target && target <= end
    } else if from > end {
        target > from || target <= end
    } else {
        true
    }
}

/// `target ∈ (from, end)` walking clockwise. `from == end` covers every key
/// except `from` itself.
pub fn in_open(target: &RingKey, from: &RingKey, end: &RingKey) -> bool {
    if from < end {
        from < target && target < end
    } else if from > end {
        target > from || target < end
    } else {
        target != from
    }
}

/// Percentage of the id space, handy for eyeballing a ring in `show`.
pub fn conv_id_to_ratio_str(id: &RingKey) -> String {
    let mut head = [0u8; 8];
    head.copy_from_slice(&id.0[..8]);
    let ratio = (u64::from_be_bytes(head) as f64 / u64::MAX as f64) * 100.0;
    format!("{:.4}", ratio)
}

impl fmt::Display for RingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for RingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RingKey({})", self.short())
    }
}

impl FromStr for RingKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<RingKey> {
        let raw = hex::decode(s)
            .map_err(|err| Error::ProtocolViolation(format!("bad ring key {s:?}: {err}")))?;
        if raw.len() != gval::ID_BYTES {
            return Err(Error::ProtocolViolation(format!(
                "ring key must be {} bytes, got {}",
                gval::ID_BYTES,
                raw.len()
            )));
        }
        let mut bytes = [0u8; gval::ID_BYTES];
        bytes.copy_from_slice(&raw);
        Ok(RingKey(bytes))
    }
}

impl Serialize for RingKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for RingKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<RingKey, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}
