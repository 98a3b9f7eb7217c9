use proptest::prelude::*;

use umbra_types::transaction::{absolute_to_relative, relative_to_absolute};
use umbra_types::{BlockHash, Timestamp, TxHash};

proptest! {
    /// Relative key offsets decode back to the sorted absolute indices.
    #[test]
    fn key_offsets_round_trip(mut offsets in prop::collection::vec(0u64..1_000_000, 0..16)) {
        offsets.sort_unstable();
        offsets.dedup();
        let relative = absolute_to_relative(&offsets);
        prop_assert_eq!(relative_to_absolute(&relative), offsets);
    }

    /// Hash hex encoding parses back to the same value.
    #[test]
    fn hash_hex_round_trip(bytes in prop::array::uniform32(0u8..)) {
        let block = BlockHash::new(bytes);
        prop_assert_eq!(BlockHash::from_hex(&block.to_string()), Some(block));
        let tx = TxHash::new(bytes);
        prop_assert_eq!(TxHash::from_hex(&tx.to_string()), Some(tx));
    }

    /// BlockHash::is_zero is true only for all-zero bytes.
    #[test]
    fn block_hash_is_zero_correct(bytes in prop::array::uniform32(0u8..)) {
        let hash = BlockHash::new(bytes);
        prop_assert_eq!(hash.is_zero(), bytes == [0u8; 32]);
    }

    /// has_expired agrees with elapsed_since.
    #[test]
    fn timestamp_expiry_consistent(start in 0u64..1_000_000, dur in 0u64..1_000_000, now in 0u64..3_000_000) {
        let ts = Timestamp::new(start);
        let now = Timestamp::new(now);
        prop_assert_eq!(ts.has_expired(dur, now), now.as_secs() >= start && ts.elapsed_since(now) >= dur);
    }
}
