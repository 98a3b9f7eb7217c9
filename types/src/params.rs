//! Consensus constants and per-network parameters.

use crate::hash::BlockHash;
use crate::network::NetworkId;
use serde::{Deserialize, Serialize};

// ── Timing ───────────────────────────────────────────────────────────────

/// Target seconds between blocks.
pub const DIFFICULTY_TARGET_SECS: u64 = 120;

/// Blocks an output must age before it can be spent.
pub const DEFAULT_TX_SPENDABLE_AGE: u64 = 10;

/// Coinbase outputs unlock this many blocks after the block that mints them.
pub const MINED_MONEY_UNLOCK_WINDOW: u64 = 60;

pub const LOCKED_TX_ALLOWED_DELTA_BLOCKS: u64 = 1;
pub const LOCKED_TX_ALLOWED_DELTA_SECS: u64 = DIFFICULTY_TARGET_SECS * LOCKED_TX_ALLOWED_DELTA_BLOCKS;

/// `unlock_time` values below this are block heights, at or above are timestamps.
pub const MAX_BLOCK_NUMBER: u64 = 500_000_000;

// ── Block weight ─────────────────────────────────────────────────────────

pub const BLOCK_GRANTED_FULL_REWARD_ZONE_V1: u64 = 20_000;
pub const BLOCK_GRANTED_FULL_REWARD_ZONE_V2: u64 = 60_000;
pub const BLOCK_GRANTED_FULL_REWARD_ZONE_V5: u64 = 300_000;
pub const COINBASE_BLOB_RESERVED_SIZE: u64 = 600;

// ── Fees ─────────────────────────────────────────────────────────────────

pub const FEE_PER_KB_OLD: u64 = 10_000_000_000;
pub const FEE_PER_KB: u64 = 2_000_000_000;
pub const DYNAMIC_FEE_PER_KB_BASE_FEE: u64 = 2_000_000_000;
pub const DYNAMIC_FEE_PER_KB_BASE_BLOCK_REWARD: u64 = 10_000_000_000_000;
pub const DYNAMIC_FEE_PER_KB_BASE_FEE_V5: u64 =
    DYNAMIC_FEE_PER_KB_BASE_FEE * BLOCK_GRANTED_FULL_REWARD_ZONE_V2 / BLOCK_GRANTED_FULL_REWARD_ZONE_V5;
pub const DYNAMIC_FEE_REFERENCE_TRANSACTION_WEIGHT: u64 = 3_000;
/// Decimal places kept in per-byte fees; the rest are rounded up.
pub const FEE_QUANTIZATION_DECIMALS: u32 = 8;

// ── Hard-fork voting ─────────────────────────────────────────────────────

pub const DEFAULT_VOTE_WINDOW: u64 = 10_080;
pub const DEFAULT_VOTE_THRESHOLD: u8 = 80;
/// One year: a node this far past the last scheduled fork has likely forked off.
pub const DEFAULT_FORKED_TIME_SECS: u64 = 31_557_600;
pub const DEFAULT_UPDATE_TIME_SECS: u64 = DEFAULT_FORKED_TIME_SECS / 2;

// ── Version gates ────────────────────────────────────────────────────────

pub const HF_VERSION_DYNAMIC_FEE: u8 = 3;
pub const HF_VERSION_RCT: u8 = 4;
pub const HF_VERSION_FEE_V2: u8 = 5;
pub const HF_VERSION_MIN_MIXIN_4: u8 = 6;
pub const HF_VERSION_MIN_MIXIN_6: u8 = 7;
pub const HF_VERSION_MIN_MIXIN_10: u8 = 8;
pub const HF_VERSION_PER_BYTE_FEE: u8 = 8;
pub const HF_VERSION_VIEW_TAGS: u8 = 9;

/// One entry in a network's scheduled fork table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardforkEntry {
    pub version: u8,
    pub height: u64,
    /// Vote percentage needed before activation; 0 activates on height alone.
    pub threshold: u8,
    pub time: u64,
}

const fn fork(version: u8, height: u64, threshold: u8, time: u64) -> HardforkEntry {
    HardforkEntry {
        version,
        height,
        threshold,
        time,
    }
}

const MAINNET_FORKS: &[HardforkEntry] = &[
    fork(1, 1, 0, 1_341_378_000),
    fork(2, 1_009_827, 0, 1_442_763_710),
    fork(3, 1_141_317, 0, 1_458_558_528),
    fork(4, 1_220_516, 0, 1_483_574_400),
    fork(5, 1_288_616, 0, 1_489_520_158),
    fork(6, 1_400_000, 0, 1_503_046_577),
    fork(7, 1_546_000, 0, 1_521_303_150),
    fork(8, 1_685_555, 0, 1_535_889_547),
    fork(9, 1_686_275, 0, 1_535_889_548),
];

const TESTNET_FORKS: &[HardforkEntry] = &[
    fork(1, 1, 0, 1_341_378_000),
    fork(2, 624_634, 0, 1_445_355_000),
    fork(3, 800_500, 0, 1_472_415_034),
    fork(4, 801_219, 0, 1_472_415_035),
    fork(5, 802_660, 0, 1_472_415_036),
    fork(6, 971_400, 0, 1_501_709_789),
    fork(7, 1_057_027, 0, 1_512_211_236),
    fork(8, 1_057_058, 0, 1_533_211_200),
    fork(9, 1_057_778, 0, 1_533_297_600),
];

const DEV_FORKS: &[HardforkEntry] = &[
    fork(1, 1, 0, 1_600_000_000),
    fork(2, 2, 0, 1_600_000_001),
    fork(3, 3, 0, 1_600_000_002),
    fork(4, 4, 0, 1_600_000_003),
    fork(5, 5, 0, 1_600_000_004),
    fork(6, 6, 0, 1_600_000_005),
    fork(7, 7, 0, 1_600_000_006),
    fork(8, 8, 0, 1_600_000_007),
    fork(9, 9, 0, 1_600_000_008),
];

/// A trusted block used to skip full downloads during the first sync.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub height: u64,
    pub hash: BlockHash,
}

/// Parameters that differ between networks.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NetworkParams {
    pub network: NetworkId,
    pub hard_forks: Vec<HardforkEntry>,
    pub original_version: u8,
    pub vote_window: u64,
    pub default_threshold: u8,
    /// Highest trusted block; fast refresh pulls hashes only up to here.
    pub checkpoint: Option<Checkpoint>,
    /// Outputs created before this height are kept apart from later ones
    /// when picking decoys for pre-fork outputs.
    pub segregation_fork_height: u64,
}

impl NetworkParams {
    pub fn for_network(network: NetworkId) -> Self {
        let (forks, segregation_fork_height) = match network {
            NetworkId::Mainnet => (MAINNET_FORKS, 1_546_000),
            NetworkId::Testnet => (TESTNET_FORKS, 1_000_000),
            NetworkId::Dev => (DEV_FORKS, 0),
        };
        Self {
            network,
            hard_forks: forks.to_vec(),
            original_version: 1,
            vote_window: DEFAULT_VOTE_WINDOW,
            default_threshold: DEFAULT_VOTE_THRESHOLD,
            checkpoint: None,
            segregation_fork_height,
        }
    }

    /// Height at which `version` is scheduled, if the table has it.
    pub fn fork_height(&self, version: u8) -> Option<u64> {
        self.hard_forks
            .iter()
            .find(|f| f.version == version)
            .map(|f| f.height)
    }
}

impl Default for NetworkParams {
    fn default() -> Self {
        Self::for_network(NetworkId::Mainnet)
    }
}
