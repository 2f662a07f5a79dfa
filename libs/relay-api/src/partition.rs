use std::sync::atomic::{AtomicU32, Ordering};

const FNV_OFFSET: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

/// FNV-1a 64-bit. Stable across processes, platforms and compiler versions,
/// unlike `std::collections::hash_map::DefaultHasher`.
pub fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Maps a partition key onto one of `partitions` partitions.
///
/// Implementations must be deterministic for keyed messages: the same key
/// always lands on the same partition while the partition count is unchanged.
pub trait Partitioner: Send + Sync {
    /// `partitions` is always > 0. Result must be `< partitions`.
    fn partition(&self, key: Option<&[u8]>, partitions: u32) -> u32;
}

/// Default partitioner: FNV-1a of the key; keyless messages are spread round-robin.
#[derive(Debug, Default)]
pub struct HashPartitioner {
    next: AtomicU32,
}

impl HashPartitioner {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Partitioner for HashPartitioner {
    fn partition(&self, key: Option<&[u8]>, partitions: u32) -> u32 {
        match key {
            Some(key) => (fnv1a(key) % u64::from(partitions)) as u32,
            None => self.next.fetch_add(1, Ordering::Relaxed) % partitions,
        }
    }
}

/// Routes every message to one partition (clamped to the partition count).
#[derive(Debug, Clone, Copy)]
pub struct FixedPartitioner(pub u32);

impl Partitioner for FixedPartitioner {
    fn partition(&self, _key: Option<&[u8]>, partitions: u32) -> u32 {
        self.0.min(partitions - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fnv1a_known_values() {
        assert_eq!(fnv1a(b""), 0xcbf29ce484222325);
        assert_eq!(fnv1a(b"A"), 0xaf63fc4c860222ec);
        assert_eq!(fnv1a(b"B"), 0xaf63ff4c86022805);
    }

    #[test]
    fn test_same_key_same_partition() {
        let p = HashPartitioner::new();
        for partitions in 1..16 {
            let first = p.partition(Some(b"user-1"), partitions);
            for _ in 0..10 {
                assert_eq!(p.partition(Some(b"user-1"), partitions), first);
            }
            assert!(first < partitions);
        }
        assert_eq!(p.partition(Some(b"A"), 2), 0);
        assert_eq!(p.partition(Some(b"B"), 2), 1);
    }

    #[test]
    fn test_keyless_round_robin() {
        let p = HashPartitioner::new();
        let picked: Vec<u32> = (0..6).map(|_| p.partition(None, 3)).collect();
        assert_eq!(picked, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_fixed_partitioner_clamps() {
        assert_eq!(FixedPartitioner(0).partition(Some(b"x"), 2), 0);
        assert_eq!(FixedPartitioner(5).partition(None, 2), 1);
    }
}
