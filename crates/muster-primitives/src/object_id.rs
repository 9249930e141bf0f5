//! Object identifiers (12 bytes)

use crate::error::PrimitiveError;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

/// Wrapping counter shared by every id generated in this process.
static COUNTER: AtomicU32 = AtomicU32::new(0);

/// Five random bytes identifying this process, drawn once.
static PROCESS_BYTES: OnceLock<[u8; 5]> = OnceLock::new();

fn process_bytes() -> [u8; 5] {
    *PROCESS_BYTES.get_or_init(|| {
        let mut bytes = [0u8; 5];
        rand::Rng::fill(&mut rand::thread_rng(), &mut bytes);
        bytes
    })
}

/// 12-byte object identifier.
///
/// Identifies objects, processes and federations. A freshly created id is
/// globally unique: 4 bytes of unix time, 5 process-random bytes, and a
/// 3-byte wrapping counter. The all-zero id denotes "none".
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ObjectId([u8; 12]);

impl ObjectId {
    /// Size in bytes
    pub const LEN: usize = 12;

    /// The "none" id
    pub const ZERO: ObjectId = ObjectId([0u8; 12]);

    /// Create from raw bytes
    pub const fn from_bytes(bytes: [u8; 12]) -> Self {
        ObjectId(bytes)
    }

    /// Create from a byte slice
    pub fn from_slice(slice: &[u8]) -> Result<Self, PrimitiveError> {
        if slice.len() != Self::LEN {
            return Err(PrimitiveError::InvalidLength {
                expected: Self::LEN,
                got: slice.len(),
            });
        }
        let mut bytes = [0u8; 12];
        bytes.copy_from_slice(slice);
        Ok(ObjectId(bytes))
    }

    /// Generate a fresh globally unique id
    pub fn create() -> Self {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);
        let count = COUNTER.fetch_add(1, Ordering::Relaxed);
        let mut bytes = [0u8; 12];
        bytes[..4].copy_from_slice(&secs.to_be_bytes());
        bytes[4..9].copy_from_slice(&process_bytes());
        bytes[9..].copy_from_slice(&count.to_be_bytes()[1..]);
        ObjectId(bytes)
    }

    /// Parse from a 24-digit hex string
    pub fn from_hex(s: &str) -> Result<Self, PrimitiveError> {
        let bytes = hex::decode(s).map_err(|e| PrimitiveError::InvalidHex(e.to_string()))?;
        Self::from_slice(&bytes)
    }

    /// Get as bytes
    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }

    /// Whether this is the "none" id
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 12]
    }

    /// Convert to a hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", hex::encode(&self.0[..4]))
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; 12]> for ObjectId {
    fn from(bytes: [u8; 12]) -> Self {
        ObjectId(bytes)
    }
}

impl AsRef<[u8]> for ObjectId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for ObjectId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for ObjectId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ObjectId::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_unique() {
        let a = ObjectId::create();
        let b = ObjectId::create();
        assert_ne!(a, b);
        assert!(!a.is_zero());
    }

    #[test]
    fn test_zero() {
        let id = ObjectId::ZERO;
        assert!(id.is_zero());
        assert_eq!(id, ObjectId::default());
    }

    #[test]
    fn test_hex_round_trip() {
        let id = ObjectId::create();
        let hex = id.to_hex();
        assert_eq!(hex.len(), 24);
        let parsed = ObjectId::from_hex(&hex).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_from_hex_invalid() {
        assert!(ObjectId::from_hex("zz").is_err());
        assert!(ObjectId::from_hex("aabb").is_err());
    }

    #[test]
    fn test_from_slice() {
        let id = ObjectId::from_slice(&[7u8; 12]).unwrap();
        assert_eq!(*id.as_bytes(), [7u8; 12]);
        assert!(ObjectId::from_slice(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_ordering() {
        let a = ObjectId::from_bytes([1u8; 12]);
        let b = ObjectId::from_bytes([2u8; 12]);
        assert!(a < b);
    }

    #[test]
    fn test_hash_map_key() {
        use std::collections::HashSet;
        let mut set = HashSet::new();
        let a = ObjectId::create();
        set.insert(a);
        set.insert(a);
        set.insert(ObjectId::create());
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_counter_in_low_bytes() {
        let a = ObjectId::create();
        let b = ObjectId::create();
        // the two ids differ only in the trailing counter bytes
        assert_eq!(a.as_bytes()[4..9], b.as_bytes()[4..9]);
        assert_ne!(a.as_bytes()[9..], b.as_bytes()[9..]);
    }
}
