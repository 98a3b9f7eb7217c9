//! Rings already committed to per key image, plus the set of outputs known
//! to be spent (blackballed) that decoy selection should avoid.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use umbra_types::KeyImage;

/// An output identified by amount class and global index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutputId {
    pub amount: u64,
    pub index: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingDatabase {
    /// Absolute global indices, sorted ascending.
    rings: HashMap<KeyImage, Vec<u64>>,
    blackballed: HashSet<OutputId>,
}

impl RingDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_ring(&self, key_image: &KeyImage) -> Option<&[u64]> {
        self.rings.get(key_image).map(Vec::as_slice)
    }

    /// Record the ring used to spend `key_image`, replacing any earlier one.
    pub fn set_ring(&mut self, key_image: KeyImage, mut ring: Vec<u64>) {
        ring.sort_unstable();
        ring.dedup();
        self.rings.insert(key_image, ring);
    }

    pub fn remove_ring(&mut self, key_image: &KeyImage) -> bool {
        self.rings.remove(key_image).is_some()
    }

    pub fn ring_count(&self) -> usize {
        self.rings.len()
    }

    pub fn blackball(&mut self, output: OutputId) -> bool {
        self.blackballed.insert(output)
    }

    pub fn unblackball(&mut self, output: &OutputId) -> bool {
        self.blackballed.remove(output)
    }

    pub fn is_blackballed(&self, output: &OutputId) -> bool {
        self.blackballed.contains(output)
    }

    pub fn blackballed_count(&self) -> usize {
        self.blackballed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rings_are_stored_sorted_and_deduplicated() {
        let mut db = RingDatabase::new();
        let ki = KeyImage([1u8; 32]);
        db.set_ring(ki, vec![9, 3, 3, 7]);
        assert_eq!(db.get_ring(&ki), Some(&[3u64, 7, 9][..]));
        assert!(db.remove_ring(&ki));
        assert_eq!(db.get_ring(&ki), None);
    }

    #[test]
    fn blackball_round_trip() {
        let mut db = RingDatabase::new();
        let out = OutputId { amount: 0, index: 42 };
        assert!(db.blackball(out));
        assert!(!db.blackball(out));
        assert!(db.is_blackballed(&out));
        assert!(db.unblackball(&out));
        assert_eq!(db.blackballed_count(), 0);
    }
}
