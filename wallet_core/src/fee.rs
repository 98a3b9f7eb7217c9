//! Fee and ring-size policy.
//!
//! Everything here is a function of the priority the user asked for and the
//! consensus version in force, captured once per operation in a
//! [`ForkRules`] snapshot.

use std::collections::BTreeMap;
use tracing::{debug, info, trace, warn};
use umbra_types::amount::DISPLAY_DECIMAL_POINT;
use umbra_types::params::{
    BLOCK_GRANTED_FULL_REWARD_ZONE_V1, BLOCK_GRANTED_FULL_REWARD_ZONE_V2,
    BLOCK_GRANTED_FULL_REWARD_ZONE_V5, COINBASE_BLOB_RESERVED_SIZE, DYNAMIC_FEE_PER_KB_BASE_BLOCK_REWARD,
    DYNAMIC_FEE_PER_KB_BASE_FEE, DYNAMIC_FEE_PER_KB_BASE_FEE_V5,
    DYNAMIC_FEE_REFERENCE_TRANSACTION_WEIGHT, FEE_PER_KB, FEE_QUANTIZATION_DECIMALS,
    HF_VERSION_DYNAMIC_FEE, HF_VERSION_FEE_V2, HF_VERSION_MIN_MIXIN_10, HF_VERSION_MIN_MIXIN_4,
    HF_VERSION_MIN_MIXIN_6, HF_VERSION_PER_BYTE_FEE,
};
use umbra_types::NetworkParams;

use crate::daemon::{BlockSource, ConsensusOracle};
use crate::error::WalletError;

/// Highest version the wallet asks the oracle about.
pub const MAX_KNOWN_VERSION: u8 = 9;

/// Blocks per day at the two-minute target.
const BLOCKS_PER_DAY: i64 = 720;

/// Number of recent blocks inspected by [`adjust_priority`].
const RECENT_BLOCKS_FOR_PRIORITY: u64 = 10;

/// Fill percentage of the full reward zone above which low priority is unsafe.
const LOW_PRIORITY_MAX_FILL_PERCENT: u64 = 80;

/// Ring size once it became fixed.
const FIXED_RING_SIZE: u64 = 11;

const MULTIPLIERS: [&[u64]; 4] = [&[1, 2, 3], &[1, 20, 166], &[1, 4, 20, 166], &[1, 5, 25, 1000]];

/// Chain height plus the first height of each consensus version.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ForkRules {
    pub height: u64,
    pub earliest: BTreeMap<u8, u64>,
}

impl ForkRules {
    pub fn new(height: u64, earliest: BTreeMap<u8, u64>) -> Self {
        Self { height, earliest }
    }

    /// Ask the oracle for every known version's activation height.
    pub fn from_oracle(oracle: &dyn ConsensusOracle, height: u64) -> Result<Self, WalletError> {
        let mut earliest = BTreeMap::new();
        for version in 1..=MAX_KNOWN_VERSION {
            if let Some(h) = oracle.get_earliest_height(version)? {
                earliest.insert(version, h);
            }
        }
        Ok(Self { height, earliest })
    }

    /// Rules from the network's static fork schedule.
    pub fn from_schedule(params: &NetworkParams, height: u64) -> Self {
        let earliest = params
            .hard_forks
            .iter()
            .map(|f| (f.version, f.height))
            .collect();
        Self { height, earliest }
    }

    /// Whether `version` is active, counting it as active `early_blocks`
    /// before its activation (or only after, for a negative value).
    pub fn use_fork_rules(&self, version: u8, early_blocks: i64) -> bool {
        let Some(&earliest) = self.earliest.get(&version) else {
            return false;
        };
        let gate = earliest as i128 - early_blocks as i128;
        self.height as i128 >= gate
    }

    pub fn per_byte_fee(&self) -> bool {
        self.use_fork_rules(HF_VERSION_PER_BYTE_FEE, 0)
    }
}

/// 3 per-byte, 2 from the second fee version, 1 two weeks into dynamic
/// fees, 0 before.
pub fn fee_algorithm(rules: &ForkRules) -> i32 {
    if rules.use_fork_rules(HF_VERSION_PER_BYTE_FEE, 0) {
        3
    } else if rules.use_fork_rules(HF_VERSION_FEE_V2, 0) {
        2
    } else if rules.use_fork_rules(HF_VERSION_DYNAMIC_FEE, -BLOCKS_PER_DAY * 14) {
        1
    } else {
        0
    }
}

/// Multiplier for `priority` under `algorithm`. Priority 0 means default:
/// 2 from algorithm 2 on, 1 before.
pub fn get_fee_multiplier(priority: u32, algorithm: i32) -> Result<u64, WalletError> {
    let table = usize::try_from(algorithm)
        .ok()
        .and_then(|a| MULTIPLIERS.get(a))
        .ok_or(WalletError::InvalidFeeAlgorithm(algorithm))?;
    let priority = match priority {
        0 if algorithm >= 2 => 2,
        0 => 1,
        p => p,
    };
    table
        .get((priority as usize).wrapping_sub(1))
        .copied()
        .ok_or(WalletError::InvalidPriority(priority))
}

pub fn get_min_ring_size(rules: &ForkRules) -> u64 {
    if rules.use_fork_rules(HF_VERSION_MIN_MIXIN_10, 10) {
        FIXED_RING_SIZE
    } else if rules.use_fork_rules(HF_VERSION_MIN_MIXIN_6, 10) {
        7
    } else if rules.use_fork_rules(HF_VERSION_MIN_MIXIN_4, 10) {
        5
    } else if rules.use_fork_rules(2, 10) {
        3
    } else {
        0
    }
}

/// 0 means unbounded.
pub fn get_max_ring_size(rules: &ForkRules) -> u64 {
    if rules.use_fork_rules(HF_VERSION_MIN_MIXIN_10, 10) {
        FIXED_RING_SIZE
    } else {
        0
    }
}

/// Clamp a requested decoy count into the allowed ring size range.
pub fn adjust_mixin(mixin: u64, rules: &ForkRules) -> u64 {
    let mut mixin = mixin;
    let min = get_min_ring_size(rules);
    if mixin + 1 < min {
        warn!(requested = mixin, adjusted = min - 1, "ring size too small, raising");
        mixin = min - 1;
    }
    let max = get_max_ring_size(rules);
    if max != 0 && mixin + 1 > max {
        warn!(requested = mixin, adjusted = max - 1, "ring size too large, lowering");
        mixin = max - 1;
    }
    mixin
}

/// Base fee for the current rules: from the daemon once dynamic fees are
/// in force, the fixed per-kB fee before.
pub fn get_base_fee(rules: &ForkRules, daemon: &dyn BlockSource) -> Result<u64, WalletError> {
    if rules.use_fork_rules(HF_VERSION_DYNAMIC_FEE, -BLOCKS_PER_DAY * 14) {
        Ok(daemon.get_fee_estimate()?.base_fee)
    } else {
        Ok(FEE_PER_KB)
    }
}

/// Per-byte fees are rounded up to this many atomic units.
pub fn fee_quantization_mask() -> u64 {
    10u64.pow(DISPLAY_DECIMAL_POINT - FEE_QUANTIZATION_DECIMALS)
}

fn min_block_weight(version: u8) -> u64 {
    if version < 2 {
        BLOCK_GRANTED_FULL_REWARD_ZONE_V1
    } else if version < HF_VERSION_FEE_V2 {
        BLOCK_GRANTED_FULL_REWARD_ZONE_V2
    } else {
        BLOCK_GRANTED_FULL_REWARD_ZONE_V5
    }
}

/// The daemon-side base fee for a block reward and median block weight.
pub fn get_dynamic_base_fee(block_reward: u64, median_block_weight: u64, version: u8) -> u64 {
    let min_weight = min_block_weight(version);
    let median = median_block_weight.max(min_weight) as u128;

    if version >= HF_VERSION_PER_BYTE_FEE {
        let fee = block_reward as u128 * DYNAMIC_FEE_REFERENCE_TRANSACTION_WEIGHT as u128
            / median
            / median
            / 5;
        return u64::try_from(fee).unwrap_or(u64::MAX);
    }

    let fee_base = if version >= HF_VERSION_FEE_V2 {
        DYNAMIC_FEE_PER_KB_BASE_FEE_V5
    } else {
        DYNAMIC_FEE_PER_KB_BASE_FEE
    } as u128;
    let unscaled = fee_base * min_weight as u128 / median;
    let fee = unscaled * block_reward as u128 / DYNAMIC_FEE_PER_KB_BASE_BLOCK_REWARD as u128;
    let mask = fee_quantization_mask() as u128;
    let quantized = fee.div_ceil(mask) * mask;
    u64::try_from(quantized).unwrap_or(u64::MAX)
}

/// Fee for a transaction of `weight` bytes.
pub fn calculate_fee(per_byte: bool, weight: u64, base_fee: u64, multiplier: u64, mask: u64) -> u64 {
    if per_byte {
        let fee = weight as u128 * base_fee as u128 * multiplier as u128;
        let mask = mask.max(1) as u128;
        u64::try_from(fee.div_ceil(mask) * mask).unwrap_or(u64::MAX)
    } else {
        let kb = weight.div_ceil(1024) as u128;
        u64::try_from(kb * base_fee as u128 * multiplier as u128).unwrap_or(u64::MAX)
    }
}

/// Serialized size of a transaction extra field.
pub fn extra_weight(additional_keys: usize, has_payment_id: bool, nonce_len: usize) -> u64 {
    let tx_pub_key = 1 + 32;
    let additional = 8 + 32 * additional_keys as u64;
    let payment_id = if has_payment_id { 9 } else { 1 };
    let nonce = 8 + nonce_len as u64;
    tx_pub_key + additional + payment_id + nonce
}

/// Serialized size of a confidential transaction with this shape. Exact
/// for outputs with view tags.
pub fn estimate_tx_weight(n_inputs: usize, ring_size: usize, n_outputs: usize, extra_weight: u64) -> u64 {
    let (n_in, ring, n_out) = (n_inputs as u64, ring_size as u64, n_outputs as u64);

    let input = 4 + 8 + (8 + 8 * ring) + 32;
    let output = 8 + 4 + 32 + 1;
    let prefix = 1 + 8 + (8 + n_in * input) + (8 + n_out * output) + extra_weight;

    let ring_sig = 32 + 8 + 32 * ring;
    let rct = 4
        + 8
        + (8 + 32 * n_out)
        + (8 + 8 * n_out)
        + (8 + 32 * n_in)
        + (8 + n_in * ring_sig);

    prefix + rct
}

#[allow(clippy::too_many_arguments)]
pub fn estimate_fee(
    per_byte: bool,
    n_inputs: usize,
    ring_size: usize,
    n_outputs: usize,
    extra_weight: u64,
    base_fee: u64,
    multiplier: u64,
    mask: u64,
) -> u64 {
    let weight = estimate_tx_weight(n_inputs, ring_size, n_outputs, extra_weight);
    calculate_fee(per_byte, weight, base_fee, multiplier, mask)
}

/// Largest transaction the wallet will build.
pub fn upper_transaction_weight_limit(rules: &ForkRules) -> u64 {
    let full_reward_zone = if rules.use_fork_rules(HF_VERSION_FEE_V2, 10) {
        BLOCK_GRANTED_FULL_REWARD_ZONE_V5
    } else if rules.use_fork_rules(2, 10) {
        BLOCK_GRANTED_FULL_REWARD_ZONE_V2
    } else {
        BLOCK_GRANTED_FULL_REWARD_ZONE_V1
    };
    if rules.use_fork_rules(HF_VERSION_PER_BYTE_FEE, 10) {
        full_reward_zone / 2 - COINBASE_BLOB_RESERVED_SIZE
    } else {
        full_reward_zone - COINBASE_BLOB_RESERVED_SIZE
    }
}

/// Size a transaction is allowed to grow to before the builder starts a new one.
pub fn tx_weight_target(limit: u64) -> u64 {
    limit * 2 / 3
}

/// Inputs to [`adjust_priority`].
#[derive(Clone, Copy, Debug)]
pub struct PriorityPolicy {
    pub default_priority: u32,
    pub auto_low_priority: bool,
    /// Blocks in the wallet's hash chain.
    pub chain_size: u64,
}

/// Drop priority 0 to 1 when the pool has no backlog at the lowest fee
/// level and recent blocks are not close to full. Any daemon failure
/// leaves the priority unchanged.
pub fn adjust_priority(
    priority: u32,
    policy: PriorityPolicy,
    rules: &ForkRules,
    daemon: &dyn BlockSource,
) -> u32 {
    if priority != 0 || policy.default_priority != 0 || !policy.auto_low_priority {
        return priority;
    }
    match low_priority_is_safe(policy, rules, daemon) {
        Ok(true) => {
            info!("using low priority, recent blocks have room");
            1
        }
        Ok(false) => priority,
        Err(e) => {
            debug!(error = %e, "could not check network load, keeping priority");
            priority
        }
    }
}

fn low_priority_is_safe(
    policy: PriorityPolicy,
    rules: &ForkRules,
    daemon: &dyn BlockSource,
) -> Result<bool, WalletError> {
    let per_byte = rules.per_byte_fee();
    let base_fee = get_base_fee(rules, daemon)?;
    let multiplier = get_fee_multiplier(1, fee_algorithm(rules))?;
    let fee_level = if per_byte {
        multiplier * base_fee
    } else {
        (multiplier as f64 * base_fee as f64 * 12.0 / 13.0 / 1024.0) as u64
    };

    let backlog = daemon.estimate_backlog(&[fee_level])?;
    match backlog.as_slice() {
        [0] => {}
        [blocks] => {
            info!(blocks, "not using low priority, pool has a backlog");
            return Ok(false);
        }
        _ => {
            warn!(len = backlog.len(), "bad backlog estimate size");
            return Ok(false);
        }
    }

    let full_reward_zone = daemon.get_block_weight_limit()? / 2;
    if policy.chain_size < RECENT_BLOCKS_FOR_PRIORITY || full_reward_zone == 0 {
        debug!("chain too short to judge block fill");
        return Ok(false);
    }
    let weights = daemon.get_recent_block_weights(RECENT_BLOCKS_FOR_PRIORITY)?;
    if weights.len() as u64 != RECENT_BLOCKS_FOR_PRIORITY {
        warn!(len = weights.len(), "bad recent weight list size");
        return Ok(false);
    }
    let sum: u64 = weights.iter().sum();
    let fill = 100 * sum / (RECENT_BLOCKS_FOR_PRIORITY * full_reward_zone);
    trace!(fill, "recent block fill percentage");
    if fill > LOW_PRIORITY_MAX_FILL_PERCENT {
        info!(fill, "not using low priority, recent blocks are quite full");
        return Ok(false);
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use umbra_types::{
        KeyImage, PublicKey, RctSignatures, RctType, RingSignature, Transaction,
        TransactionPrefix, TxExtra, TxIn, TxOut, TxOutTarget,
    };

    fn rules_at(height: u64, forks: &[(u8, u64)]) -> ForkRules {
        ForkRules::new(height, forks.iter().copied().collect())
    }

    #[test]
    fn multiplier_table() {
        assert_eq!(get_fee_multiplier(1, 0).unwrap(), 1);
        assert_eq!(get_fee_multiplier(3, 0).unwrap(), 3);
        assert_eq!(get_fee_multiplier(3, 1).unwrap(), 166);
        assert_eq!(get_fee_multiplier(4, 2).unwrap(), 166);
        assert_eq!(get_fee_multiplier(4, 3).unwrap(), 1000);
        assert_eq!(get_fee_multiplier(0, 1).unwrap(), 1);
        assert_eq!(get_fee_multiplier(0, 3).unwrap(), 5);
    }

    #[test]
    fn invalid_priority_or_algorithm_is_an_error() {
        assert!(matches!(
            get_fee_multiplier(4, 0),
            Err(WalletError::InvalidPriority(4))
        ));
        assert!(matches!(
            get_fee_multiplier(5, 3),
            Err(WalletError::InvalidPriority(5))
        ));
        assert!(matches!(
            get_fee_multiplier(1, 4),
            Err(WalletError::InvalidFeeAlgorithm(4))
        ));
        assert!(matches!(
            get_fee_multiplier(1, -1),
            Err(WalletError::InvalidFeeAlgorithm(-1))
        ));
    }

    #[test]
    fn fee_algorithm_follows_forks() {
        let forks = [(3, 1_000), (5, 50_000), (8, 90_000)];
        assert_eq!(fee_algorithm(&rules_at(500, &forks)), 0);
        assert_eq!(fee_algorithm(&rules_at(1_000, &forks)), 0);
        assert_eq!(fee_algorithm(&rules_at(1_000 + 10_080, &forks)), 1);
        assert_eq!(fee_algorithm(&rules_at(50_000, &forks)), 2);
        assert_eq!(fee_algorithm(&rules_at(90_000, &forks)), 3);
    }

    #[test]
    fn ring_size_gates_open_ten_blocks_early() {
        let forks = [(2, 100), (6, 200), (7, 300), (8, 400)];
        assert_eq!(get_min_ring_size(&rules_at(50, &forks)), 0);
        assert_eq!(get_min_ring_size(&rules_at(90, &forks)), 3);
        assert_eq!(get_min_ring_size(&rules_at(195, &forks)), 5);
        assert_eq!(get_min_ring_size(&rules_at(290, &forks)), 7);
        assert_eq!(get_max_ring_size(&rules_at(290, &forks)), 0);
        assert_eq!(get_min_ring_size(&rules_at(390, &forks)), 11);
        assert_eq!(get_max_ring_size(&rules_at(390, &forks)), 11);
    }

    #[test]
    fn mixin_is_clamped() {
        let fixed = rules_at(1_000, &[(8, 10)]);
        assert_eq!(adjust_mixin(2, &fixed), 10);
        assert_eq!(adjust_mixin(20, &fixed), 10);
        let open = rules_at(1_000, &[(2, 10)]);
        assert_eq!(adjust_mixin(0, &open), 2);
        assert_eq!(adjust_mixin(20, &open), 20);
    }

    #[test]
    fn quantization_mask_keeps_eight_decimals() {
        assert_eq!(fee_quantization_mask(), 10_000);
    }

    #[test]
    fn calculate_fee_rounding() {
        // Per byte: rounded up to the mask.
        assert_eq!(calculate_fee(true, 1_500, 3, 1, 10_000), 10_000);
        assert_eq!(calculate_fee(true, 10_000, 3, 2, 10_000), 60_000);
        // Per kB: partial kilobytes count as whole ones.
        assert_eq!(calculate_fee(false, 1_025, 1_000, 2, 1), 4_000);
        assert_eq!(calculate_fee(false, 1_024, 1_000, 2, 1), 2_000);
    }

    #[test]
    fn dynamic_base_fee_clamps_median_to_reward_zone() {
        let reward = 10_000_000_000_000;
        let low = get_dynamic_base_fee(reward, 1, 5);
        let at_zone = get_dynamic_base_fee(reward, BLOCK_GRANTED_FULL_REWARD_ZONE_V5, 5);
        assert_eq!(low, at_zone);
        assert_eq!(at_zone, DYNAMIC_FEE_PER_KB_BASE_FEE_V5);
        assert_eq!(at_zone % fee_quantization_mask(), 0);

        let per_byte = get_dynamic_base_fee(reward, BLOCK_GRANTED_FULL_REWARD_ZONE_V5, 8);
        assert_eq!(per_byte, reward * 3_000 / 300_000 / 300_000 / 5);
        assert!(get_dynamic_base_fee(reward, 600_000, 8) < per_byte);
    }

    #[test]
    fn upper_weight_limit_by_version() {
        assert_eq!(upper_transaction_weight_limit(&rules_at(0, &[])), 20_000 - 600);
        assert_eq!(
            upper_transaction_weight_limit(&rules_at(100, &[(2, 50), (5, 100)])),
            300_000 - 600
        );
        let per_byte = rules_at(100, &[(2, 50), (5, 60), (8, 100)]);
        assert_eq!(upper_transaction_weight_limit(&per_byte), 150_000 - 600);
        assert_eq!(tx_weight_target(149_400), 99_600);
    }

    fn shaped_tx(n_in: usize, ring: usize, n_out: usize, additional: usize, nonce: usize) -> Transaction {
        Transaction {
            prefix: TransactionPrefix {
                version: 2,
                unlock_time: 0,
                inputs: (0..n_in)
                    .map(|i| TxIn::ToKey {
                        amount: 0,
                        key_offsets: vec![7; ring],
                        key_image: KeyImage([i as u8; 32]),
                    })
                    .collect(),
                outputs: (0..n_out)
                    .map(|_| TxOut {
                        amount: 0,
                        target: TxOutTarget::ToTaggedKey {
                            key: PublicKey([1; 32]),
                            view_tag: 3,
                        },
                    })
                    .collect(),
                extra: TxExtra {
                    tx_pub_key: Some(PublicKey([2; 32])),
                    additional_pub_keys: vec![PublicKey([4; 32]); additional],
                    payment_id: None,
                    nonce: vec![0; nonce],
                },
            },
            rct: RctSignatures {
                rct_type: RctType::Simple,
                fee: 123,
                out_commitments: vec![PublicKey([5; 32]); n_out],
                encrypted_amounts: vec![[6; 8]; n_out],
                pseudo_outs: vec![PublicKey([8; 32]); n_in],
                ring_signatures: vec![
                    RingSignature {
                        c0: [9; 32],
                        responses: vec![[1; 32]; ring],
                    };
                    n_in
                ],
            },
        }
    }

    #[test]
    fn weight_estimate_is_exact() {
        for (n_in, ring, n_out, add, nonce) in [(1, 11, 2, 0, 0), (3, 16, 5, 5, 12), (7, 3, 1, 0, 40)] {
            let tx = shaped_tx(n_in, ring, n_out, add, nonce);
            let extra = extra_weight(add, false, nonce);
            assert_eq!(estimate_tx_weight(n_in, ring, n_out, extra), tx.weight());
        }
    }

    #[test]
    fn schedule_rules_read_the_fork_table() {
        let params = NetworkParams::for_network(umbra_types::NetworkId::Dev);
        let rules = ForkRules::from_schedule(&params, 100);
        assert!(rules.per_byte_fee());
        assert_eq!(fee_algorithm(&rules), 3);
        assert_eq!(get_min_ring_size(&rules), 11);
    }
}
