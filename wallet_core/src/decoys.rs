//! Decoy selection.
//!
//! Confidential outputs draw decoys from a gamma distribution over output
//! age, fitted to observed spend behaviour and mapped onto the daemon's
//! cumulative per-block output counts. Legacy amounts mix recent and
//! triangular draws over the amount's histogram. A ring already committed
//! to for a key image is reused, so the same output is never spent against
//! two different rings.

use rand::Rng;
use rand_distr::{Distribution, Gamma};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, trace};
use umbra_crypto::commit;
use umbra_types::params::{DEFAULT_TX_SPENDABLE_AGE, DIFFICULTY_TARGET_SECS};

use crate::daemon::{Daemon, OutputDistribution, OutputInfo, OutputRequest};
use crate::error::{DaemonError, WalletError};
use crate::ring_db::OutputId;
use crate::transfers::TransferDetail;
use crate::tx_builder::OutputEntry;
use crate::wallet::Wallet;

pub const GAMMA_SHAPE: f64 = 19.28;
pub const GAMMA_SCALE: f64 = 1.0 / 1.61;
/// Seconds before a fresh output becomes spendable.
pub const DEFAULT_UNLOCK_TIME: u64 = DEFAULT_TX_SPENDABLE_AGE * DIFFICULTY_TARGET_SECS;
pub const RECENT_SPEND_WINDOW: u64 = 15 * DIFFICULTY_TARGET_SECS;
pub const BLOCKS_IN_A_YEAR: u64 = 86_400 * 365 / DIFFICULTY_TARGET_SECS;

/// Share of a legacy ring drawn from recent outputs.
pub const RECENT_OUTPUT_RATIO: f64 = 0.5;
/// 1.8 days, in seconds.
pub const RECENT_OUTPUT_ZONE: u64 = 155_520;

const MAX_PICK_ROUNDS: usize = 100;
const DRAWS_PER_SLOT: u64 = 200;

/// Gamma-distributed age picker over confidential outputs.
pub struct GammaPicker {
    /// Cumulative output count through each block.
    offsets: Vec<u64>,
    /// Outputs before the first block in `offsets`.
    base: u64,
    /// Blocks old enough to spend from.
    end: usize,
    num_rct_outputs: u64,
    average_output_time: f64,
    gamma: Gamma<f64>,
}

impl GammaPicker {
    /// `None` when the distribution holds no spendable outputs.
    pub fn new(offsets: Vec<u64>, base: u64) -> Option<Self> {
        let n = offsets.len();
        if n <= DEFAULT_TX_SPENDABLE_AGE as usize {
            return None;
        }
        let blocks_to_consider = n.min(BLOCKS_IN_A_YEAR as usize);
        let first = if blocks_to_consider < n {
            offsets[n - blocks_to_consider - 1]
        } else {
            base
        };
        let outputs_to_consider = offsets[n - 1].saturating_sub(first);
        let end = n - DEFAULT_TX_SPENDABLE_AGE as usize;
        let num_rct_outputs = offsets[end - 1];
        if num_rct_outputs == 0 || outputs_to_consider == 0 {
            return None;
        }
        let gamma = Gamma::new(GAMMA_SHAPE, GAMMA_SCALE).ok()?;
        Some(Self {
            average_output_time: DIFFICULTY_TARGET_SECS as f64 * blocks_to_consider as f64
                / outputs_to_consider as f64,
            offsets,
            base,
            end,
            num_rct_outputs,
            gamma,
        })
    }

    pub fn from_distribution(dist: &OutputDistribution) -> Option<Self> {
        Self::new(dist.cumulative.clone(), dist.base)
    }

    /// Outputs in spendable blocks; draws land in `0..num_rct_outputs`.
    pub fn num_rct_outputs(&self) -> u64 {
        self.num_rct_outputs
    }

    /// One draw. `None` when it lands past the oldest output or in an
    /// empty block; the caller simply draws again.
    pub fn pick<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<u64> {
        let mut x = self.gamma.sample(rng).exp();
        if x > DEFAULT_UNLOCK_TIME as f64 {
            x -= DEFAULT_UNLOCK_TIME as f64;
        } else {
            x = rng.gen_range(0..RECENT_SPEND_WINDOW) as f64;
        }

        let age = (x / self.average_output_time) as u64;
        if age >= self.num_rct_outputs {
            return None;
        }
        let output_index = self.num_rct_outputs - 1 - age;

        let block = self.offsets[..self.end].partition_point(|&c| c <= output_index);
        if block == self.end {
            return None;
        }
        let first = if block == 0 {
            self.base
        } else {
            self.offsets[block - 1]
        };
        let in_block = self.offsets[block].saturating_sub(first);
        if in_block == 0 {
            return None;
        }
        Some(first + rng.gen_range(0..in_block))
    }
}

/// Recent-plus-triangular picker over one legacy amount.
pub struct LegacyPicker {
    num_outs: u64,
    num_recent: u64,
}

impl LegacyPicker {
    pub fn new(num_outs: u64, num_recent: u64) -> Self {
        Self {
            num_outs,
            num_recent: num_recent.min(num_outs),
        }
    }

    pub fn num_outs(&self) -> u64 {
        self.num_outs
    }

    /// How many of a ring's draws come from the recent zone.
    pub fn recent_quota(&self, ring_size: u64, real_index: u64) -> u64 {
        let mut quota = ((ring_size as f64 * RECENT_OUTPUT_RATIO) as u64).min(self.num_recent);
        if quota == 0 && self.num_recent > 0 && real_index >= self.num_outs - self.num_recent {
            quota = 1;
        }
        quota
    }

    fn triangular<R: Rng + ?Sized>(rng: &mut R, span: u64) -> u64 {
        let r = rng.gen::<u64>() % (1u64 << 53);
        let frac = (r as f64 / (1u64 << 53) as f64).sqrt();
        ((frac * span as f64) as u64).min(span.saturating_sub(1))
    }

    pub fn pick_recent<R: Rng + ?Sized>(&self, rng: &mut R) -> u64 {
        Self::triangular(rng, self.num_recent) + self.num_outs - self.num_recent
    }

    pub fn pick<R: Rng + ?Sized>(&self, rng: &mut R) -> u64 {
        Self::triangular(rng, self.num_outs)
    }
}

enum Picker {
    Gamma(GammaPicker),
    Legacy { picker: LegacyPicker, recent_quota: u64 },
}

impl Picker {
    fn total(&self) -> u64 {
        match self {
            Picker::Gamma(g) => g.num_rct_outputs(),
            Picker::Legacy { picker, .. } => picker.num_outs(),
        }
    }

    fn draw<R: Rng + ?Sized>(&self, rng: &mut R, drawn: u64) -> Option<u64> {
        match self {
            Picker::Gamma(g) => g.pick(rng),
            Picker::Legacy { picker, recent_quota } if drawn < *recent_quota => {
                Some(picker.pick_recent(rng))
            }
            Picker::Legacy { picker, .. } => Some(picker.pick(rng)),
        }
    }
}

fn fetch_outputs(
    daemon: &dyn Daemon,
    amount: u64,
    indices: &[u64],
) -> Result<Vec<OutputInfo>, WalletError> {
    let requests: Vec<OutputRequest> = indices
        .iter()
        .map(|&index| OutputRequest { amount, index })
        .collect();
    let infos = daemon.get_outputs(&requests)?;
    if infos.len() != requests.len() {
        return Err(DaemonError::Malformed(format!(
            "get_outputs returned {} entries for {} requests",
            infos.len(),
            requests.len()
        ))
        .into());
    }
    Ok(infos)
}

/// Cumulative count through `height - 1`, i.e. outputs created before it.
fn count_before(dist: &OutputDistribution, height: u64) -> u64 {
    if height <= dist.start_height {
        return dist.base;
    }
    let idx = (height - dist.start_height - 1) as usize;
    match dist.cumulative.get(idx) {
        Some(&c) => c,
        None => dist.cumulative.last().copied().unwrap_or(dist.base),
    }
}

impl Wallet {
    fn is_after_segregation_fork(&self) -> bool {
        let height = self.network.segregation_fork_height;
        (self.config.segregate_pre_fork_outputs || self.config.key_reuse_mitigation)
            && height > 0
            && self.hash_chain.size() >= height
    }

    /// Pick a ring of `fake_outs + 1` members for each selected transfer,
    /// in `selected` order. Each ring is sorted by global index and
    /// contains the real output.
    pub(crate) fn get_rings(
        &mut self,
        selected: &[usize],
        fake_outs: u64,
    ) -> Result<Vec<Vec<OutputEntry>>, WalletError> {
        let daemon = self.daemon()?;
        let ring_size = fake_outs + 1;
        let tds: Vec<TransferDetail> = selected
            .iter()
            .map(|&i| self.transfer(i).cloned())
            .collect::<Result<_, _>>()?;
        let segregation_height = self.network.segregation_fork_height;
        let segregate = self.is_after_segregation_fork();

        let mut distributions: HashMap<u64, OutputDistribution> = HashMap::new();
        let legacy_amounts: Vec<u64> = tds
            .iter()
            .filter(|td| !td.rct)
            .map(|td| td.amount)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let histogram = if legacy_amounts.is_empty() {
            HashMap::new()
        } else {
            let cutoff = self.clock.now().saturating_sub(RECENT_OUTPUT_ZONE);
            daemon
                .get_output_histogram(&legacy_amounts, 0, 0, true, cutoff)?
                .into_iter()
                .map(|e| (e.amount, e))
                .collect()
        };

        let mut rings = Vec::with_capacity(tds.len());
        for td in &tds {
            let class = td.amount_class();
            let pre_fork = segregate && td.block_height < segregation_height;
            let picker = if td.rct {
                if !distributions.contains_key(&class) {
                    distributions.insert(class, daemon.get_output_distribution(class, 0)?);
                }
                let dist = &distributions[&class];
                let offsets = if pre_fork {
                    let cut = segregation_height.saturating_sub(dist.start_height) as usize;
                    dist.cumulative[..cut.min(dist.cumulative.len())].to_vec()
                } else {
                    dist.cumulative.clone()
                };
                GammaPicker::new(offsets, dist.base).map(Picker::Gamma)
            } else {
                let entry = histogram.get(&td.amount).ok_or_else(|| {
                    DaemonError::Malformed(format!("no histogram entry for amount {}", td.amount))
                })?;
                let picker = if pre_fork {
                    if !distributions.contains_key(&class) {
                        distributions.insert(class, daemon.get_output_distribution(class, 0)?);
                    }
                    LegacyPicker::new(count_before(&distributions[&class], segregation_height), 0)
                } else {
                    LegacyPicker::new(entry.unlocked_instances, entry.recent_instances)
                };
                let recent_quota = picker.recent_quota(ring_size, td.global_output_index);
                Some(Picker::Legacy {
                    picker,
                    recent_quota,
                })
            };
            let picker = picker.ok_or(WalletError::NotEnoughOutsToMix {
                amount: class,
                available: 0,
                required: ring_size,
            })?;
            rings.push(self.pick_ring(&*daemon, td, ring_size, &picker)?);
        }
        Ok(rings)
    }

    fn pick_ring(
        &mut self,
        daemon: &dyn Daemon,
        td: &TransferDetail,
        ring_size: u64,
        picker: &Picker,
    ) -> Result<Vec<OutputEntry>, WalletError> {
        let class = td.amount_class();
        let real = td.global_output_index;
        let mut seeds = BTreeSet::from([real]);

        if td.key_image_known && !td.key_image_partial {
            if let Some(existing) = self.ring_db.get_ring(&td.key_image) {
                if existing.len() as u64 > ring_size {
                    return Err(WalletError::RingSizeTooSmall {
                        requested: ring_size,
                        previous: existing.len() as u64,
                    });
                }
                if !existing.contains(&real) {
                    return Err(WalletError::Internal(format!(
                        "stored ring for {} lacks output {real}",
                        td.key_image
                    )));
                }
                debug!(key_image = %td.key_image, size = existing.len(), "reusing stored ring");
                seeds.extend(existing.iter().copied());
            }
        }

        let available = picker.total();
        if available < ring_size {
            return Err(WalletError::NotEnoughOutsToMix {
                amount: class,
                available,
                required: ring_size,
            });
        }

        let mut members: BTreeMap<u64, OutputEntry> = BTreeMap::new();
        let seed_list: Vec<u64> = seeds.into_iter().collect();
        for (&index, info) in seed_list.iter().zip(fetch_outputs(daemon, class, &seed_list)?) {
            if index == real {
                if info.key != td.public_key {
                    return Err(DaemonError::Malformed(format!(
                        "daemon reports a different key for our output {real}"
                    ))
                    .into());
                }
                if info.commitment != commit(td.amount, &td.mask) {
                    return Err(DaemonError::Malformed(format!(
                        "daemon reports a different commitment for our output {real}"
                    ))
                    .into());
                }
            }
            members.insert(
                index,
                OutputEntry {
                    index,
                    key: info.key,
                    commitment: info.commitment,
                },
            );
        }

        let mut relaxed = false;
        let mut rounds = 0;
        let mut drawn = 0u64;
        while (members.len() as u64) < ring_size {
            if rounds == MAX_PICK_ROUNDS {
                if relaxed {
                    return Err(WalletError::NotEnoughOutsToMix {
                        amount: class,
                        available: members.len() as u64,
                        required: ring_size,
                    });
                }
                debug!(amount = class, "too few clean outputs, allowing blackballed decoys");
                relaxed = true;
                rounds = 0;
            }
            rounds += 1;

            let missing = ring_size - members.len() as u64;
            let mut candidates = BTreeSet::new();
            let usable = |i: u64, relaxed: bool| {
                !members.contains_key(&i)
                    && (relaxed || !self.ring_db.is_blackballed(&OutputId { amount: class, index: i }))
            };
            if available <= ring_size {
                candidates.extend((0..available).filter(|&i| usable(i, relaxed)));
            } else {
                let mut attempts = 0;
                while (candidates.len() as u64) < missing * 2 && attempts < missing * DRAWS_PER_SLOT {
                    attempts += 1;
                    let Some(i) = picker.draw(&mut self.rng, drawn) else {
                        continue;
                    };
                    drawn += 1;
                    if usable(i, relaxed) {
                        candidates.insert(i);
                    }
                }
            }
            if candidates.is_empty() {
                continue;
            }

            let list: Vec<u64> = candidates.into_iter().collect();
            trace!(amount = class, candidates = list.len(), "checking decoy candidates");
            for (&index, info) in list.iter().zip(fetch_outputs(daemon, class, &list)?) {
                if (members.len() as u64) >= ring_size {
                    break;
                }
                if !info.unlocked {
                    continue;
                }
                members.insert(
                    index,
                    OutputEntry {
                        index,
                        key: info.key,
                        commitment: info.commitment,
                    },
                );
            }
        }

        Ok(members.into_values().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use umbra_crypto::rng_from_seed;

    fn linear_offsets(blocks: u64, per_block: u64) -> Vec<u64> {
        (1..=blocks).map(|b| b * per_block).collect()
    }

    #[test]
    fn gamma_picks_stay_inside_spendable_range() {
        let offsets = linear_offsets(1000, 10);
        let limit = offsets[1000 - DEFAULT_TX_SPENDABLE_AGE as usize - 1];
        let picker = GammaPicker::new(offsets, 0).unwrap();
        assert_eq!(picker.num_rct_outputs(), limit);

        let mut rng = rng_from_seed(3);
        let picks: Vec<u64> = (0..2000).filter_map(|_| picker.pick(&mut rng)).collect();
        assert!(picks.len() > 200, "only {} usable draws", picks.len());
        assert!(picks.iter().all(|&p| p < limit));
    }

    #[test]
    fn gamma_picker_needs_spendable_blocks() {
        assert!(GammaPicker::new(linear_offsets(DEFAULT_TX_SPENDABLE_AGE, 5), 0).is_none());
        assert!(GammaPicker::new(vec![0; 20], 0).is_none());
    }

    #[test]
    fn gamma_picks_skip_empty_blocks() {
        // Outputs only in even blocks.
        let offsets: Vec<u64> = (0..400u64).map(|b| (b + 2) / 2 * 3).collect();
        let picker = GammaPicker::new(offsets.clone(), 0).unwrap();
        let mut rng = rng_from_seed(8);
        for _ in 0..500 {
            if let Some(p) = picker.pick(&mut rng) {
                let block = offsets.partition_point(|&c| c <= p);
                let first = if block == 0 { 0 } else { offsets[block - 1] };
                assert!(offsets[block] > first);
            }
        }
    }

    #[test]
    fn legacy_recent_quota() {
        let picker = LegacyPicker::new(100, 4);
        assert_eq!(picker.recent_quota(11, 0), 4);
        let sparse = LegacyPicker::new(100, 1);
        assert_eq!(sparse.recent_quota(1, 99), 1);
        assert_eq!(sparse.recent_quota(1, 10), 0);
        assert_eq!(LegacyPicker::new(100, 0).recent_quota(11, 99), 0);
    }

    #[test]
    fn legacy_picks_in_range() {
        let picker = LegacyPicker::new(50, 10);
        let mut rng = rng_from_seed(1);
        for _ in 0..1000 {
            assert!(picker.pick(&mut rng) < 50);
            let recent = picker.pick_recent(&mut rng);
            assert!((40..50).contains(&recent));
        }
    }

    #[test]
    fn count_before_height() {
        let dist = OutputDistribution {
            amount: 0,
            start_height: 0,
            base: 0,
            cumulative: vec![2, 4, 7, 9],
        };
        assert_eq!(count_before(&dist, 0), 0);
        assert_eq!(count_before(&dist, 3), 7);
        assert_eq!(count_before(&dist, 10), 9);
    }
}
