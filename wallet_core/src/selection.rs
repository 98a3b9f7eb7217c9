//! Output selection and multi-transaction planning.
//!
//! Picks which owned outputs fund a payment, splits large payments over
//! several transactions, and iterates each transaction's fee to the exact
//! value its serialized weight calls for.

use rand::seq::SliceRandom;
use std::collections::HashMap;
use tracing::{debug, info, trace};
use umbra_types::params::HF_VERSION_VIEW_TAGS;
use umbra_types::{KeyImage, SubaddressIndex, TxExtra};

use crate::error::WalletError;
use crate::fee::{
    adjust_mixin, calculate_fee, estimate_fee, estimate_tx_weight, extra_weight, fee_algorithm,
    get_base_fee, get_fee_multiplier, tx_weight_target, upper_transaction_weight_limit,
};
use crate::keys::Address;
use crate::transfers::{is_transfer_unlocked, TransferDetail};
use crate::tx_builder::{need_additional_tx_keys, PendingTx, TxDestination};
use crate::wallet::Wallet;

/// A second input is only added when it is at most this related to the first.
pub const SECOND_OUTPUT_RELATEDNESS_THRESHOLD: f32 = 0.0;

/// Rebuilds allowed while settling on a fee.
const MAX_FEE_ITERATIONS: usize = 10;

/// How likely two outputs are to be linked by an observer if spent together.
pub fn get_output_relatedness(a: &TransferDetail, b: &TransferDetail) -> f32 {
    if a.txid == b.txid {
        return 1.0;
    }
    match a.block_height.abs_diff(b.block_height) {
        0 => 0.9,
        1 => 0.8,
        d if d < 10 => 0.2,
        _ => 0.0,
    }
}

/// One output big enough for `needed`, else the least related pair from a
/// single subaddress that is. An exactly unrelated pair is returned at
/// once; among equally related pairs the oldest wins. `candidates` must be
/// in ledger order.
pub fn pick_preferred_rct_inputs(
    transfers: &[TransferDetail],
    candidates: &[usize],
    needed: u64,
) -> Vec<usize> {
    let rct: Vec<usize> = candidates
        .iter()
        .copied()
        .filter(|&i| transfers[i].rct)
        .collect();

    if let Some(&single) = rct.iter().find(|&&i| transfers[i].amount >= needed) {
        return vec![single];
    }

    let mut picks = Vec::new();
    let mut best = 1.0f32;
    for (n, &i) in rct.iter().enumerate() {
        let a = &transfers[i];
        for &j in &rct[n + 1..] {
            let b = &transfers[j];
            if a.subaddr_index != b.subaddr_index || a.amount.saturating_add(b.amount) < needed {
                continue;
            }
            let relatedness = get_output_relatedness(a, b);
            if relatedness < best {
                picks = vec![i, j];
                if relatedness == 0.0 {
                    return picks;
                }
                best = relatedness;
            }
        }
    }
    picks
}

/// Remove and return the unused output least related to any already
/// selected one, preferring the smallest amount among ties.
pub fn pop_best_value(
    unused: &mut Vec<usize>,
    selected: &[usize],
    transfers: &[TransferDetail],
) -> Option<usize> {
    let best = best_value_position(unused, selected, transfers)?;
    Some(unused.remove(best))
}

fn best_value_position(unused: &[usize], selected: &[usize], transfers: &[TransferDetail]) -> Option<usize> {
    let mut best: Option<(usize, f32, u64)> = None;
    for (n, &i) in unused.iter().enumerate() {
        let candidate = &transfers[i];
        let relatedness = selected
            .iter()
            .map(|&s| get_output_relatedness(candidate, &transfers[s]))
            .fold(0.0f32, f32::max);
        let better = match best {
            None => true,
            Some((_, r, amount)) => relatedness < r || (relatedness == r && candidate.amount < amount),
        };
        if better {
            best = Some((n, relatedness, candidate.amount));
        }
    }
    best.map(|(n, _, _)| n)
}

/// Fee inputs fixed for one planning call.
#[derive(Clone, Copy, Debug)]
struct FeeParams {
    per_byte: bool,
    base_fee: u64,
    multiplier: u64,
    mask: u64,
    fake_outs: u64,
    use_view_tags: bool,
    weight_limit: u64,
}

impl FeeParams {
    fn ring_size(&self) -> usize {
        self.fake_outs as usize + 1
    }

    fn weight(&self, n_inputs: usize, n_outputs: usize, extra_w: u64) -> u64 {
        estimate_tx_weight(n_inputs, self.ring_size(), n_outputs, extra_w)
    }

    fn estimate(&self, n_inputs: usize, n_outputs: usize, extra_w: u64) -> u64 {
        estimate_fee(
            self.per_byte,
            n_inputs,
            self.ring_size(),
            n_outputs,
            extra_w,
            self.base_fee,
            self.multiplier,
            self.mask,
        )
    }

    fn for_tx(&self, ptx: &PendingTx) -> u64 {
        calculate_fee(self.per_byte, ptx.tx.weight(), self.base_fee, self.multiplier, self.mask)
    }
}

/// A transaction being planned.
#[derive(Default)]
struct PlannedTx {
    selected: Vec<usize>,
    dsts: Vec<TxDestination>,
    ptx: Option<PendingTx>,
}

impl PlannedTx {
    fn add(
        &mut self,
        dest: &TxDestination,
        amount: u64,
        original_output_index: usize,
        merge: bool,
    ) -> Result<(), WalletError> {
        if merge {
            match self.dsts.iter_mut().find(|d| d.address == dest.address) {
                Some(d) => d.amount += amount,
                None => self.dsts.push(TxDestination::new(dest.address, amount)),
            }
            return Ok(());
        }
        if original_output_index > self.dsts.len() {
            return Err(WalletError::Internal(format!(
                "destination index {original_output_index} past {} outputs",
                self.dsts.len()
            )));
        }
        if original_output_index == self.dsts.len() {
            self.dsts.push(TxDestination::new(dest.address, 0));
        }
        let slot = &mut self.dsts[original_output_index];
        if slot.address != dest.address {
            return Err(WalletError::Internal("mismatched destination address".into()));
        }
        slot.amount += amount;
        Ok(())
    }
}

impl Wallet {
    fn fee_params(&self, priority: u32, fake_outs: u64) -> Result<FeeParams, WalletError> {
        let daemon = self.daemon()?;
        let rules = self.fork_rules()?;
        let per_byte = rules.per_byte_fee();
        let (base_fee, mask) = if per_byte {
            let estimate = daemon.get_fee_estimate()?;
            (estimate.base_fee, estimate.quantization_mask.max(1))
        } else {
            (get_base_fee(&rules, &*daemon)?, 1)
        };
        let priority = self.adjust_priority(priority);
        Ok(FeeParams {
            per_byte,
            base_fee,
            multiplier: get_fee_multiplier(priority, fee_algorithm(&rules))?,
            mask,
            fake_outs: adjust_mixin(fake_outs, &rules),
            use_view_tags: rules.use_fork_rules(HF_VERSION_VIEW_TAGS, 0),
            weight_limit: upper_transaction_weight_limit(&rules),
        })
    }

    /// Spendable confidential outputs of `account` inside the configured
    /// amount bounds.
    fn spendable_outputs(&self, account: u32, minors: &[u32]) -> Vec<usize> {
        let ctx = self.spend_context();
        let (below, above) = (self.config.ignore_outputs_below, self.config.outputs_above_limit());
        let transfers = self.transfers.transfers();
        self.transfers
            .unspent_indices(account, minors, ctx)
            .into_iter()
            .filter(|&i| {
                let td = &transfers[i];
                td.rct && td.amount >= below && td.amount <= above
            })
            .collect()
    }

    fn extra_weight_for(&self, dsts: &[TxDestination], change: &Address, extra: &TxExtra) -> u64 {
        let n_outputs = dsts.len() + 1;
        let additional = if need_additional_tx_keys(dsts, Some(change)) {
            n_outputs
        } else {
            0
        };
        extra_weight(additional, extra.payment_id.is_some(), extra.nonce.len())
    }

    /// Build and rebuild until the signed fee is exactly what the
    /// transaction's weight calls for.
    #[allow(clippy::too_many_arguments)]
    fn settle_fee(
        &mut self,
        dsts: &[TxDestination],
        selected: &[usize],
        fee: &FeeParams,
        mut ptx: PendingTx,
        mut needed_fee: u64,
        mut force: bool,
        outs: &mut Vec<Vec<crate::tx_builder::OutputEntry>>,
        unlock_time: u64,
        extra: &TxExtra,
    ) -> Result<PendingTx, WalletError> {
        let mut iterations = 0;
        while force || needed_fee != ptx.fee {
            if iterations == MAX_FEE_ITERATIONS {
                return Err(WalletError::Internal(format!(
                    "fee did not settle: {needed_fee} needed, {} signed",
                    ptx.fee
                )));
            }
            iterations += 1;
            force = false;
            ptx = self.transfer_selected(
                dsts,
                selected,
                fee.fake_outs,
                outs,
                unlock_time,
                needed_fee,
                extra,
                fee.use_view_tags,
            )?;
            needed_fee = fee.for_tx(&ptx);
            trace!(fee = ptx.fee, needed_fee, weight = ptx.tx.weight(), "fee iteration");
        }
        Ok(ptx)
    }

    /// Plan transactions paying `dsts` from `account`, restricted to the
    /// given subaddress minors (all of them when empty). Large payments are
    /// split over as many transactions as the weight target requires.
    #[allow(clippy::too_many_arguments)]
    pub fn create_transactions_2(
        &mut self,
        mut dsts: Vec<TxDestination>,
        fake_outs: u64,
        unlock_time: u64,
        priority: u32,
        extra: &TxExtra,
        account: u32,
        subaddr_indices: &[u32],
    ) -> Result<Vec<PendingTx>, WalletError> {
        if dsts.is_empty() {
            return Err(WalletError::ZeroDestination);
        }
        if dsts.iter().any(|d| d.amount == 0) {
            return Err(WalletError::ZeroAmount);
        }
        let needed_money = dsts
            .iter()
            .try_fold(0u64, |acc, d| acc.checked_add(d.amount))
            .ok_or_else(|| WalletError::Internal("destination sum overflow".into()))?;
        let original_dsts = dsts.clone();

        let fee = self.fee_params(priority, fake_outs)?;
        let ctx = self.spend_context();
        let change_address = self.keys.subaddress(SubaddressIndex::new(account, 0))?;
        let base_extra_w = extra_weight(0, extra.payment_id.is_some(), extra.nonce.len());

        let in_scope = |minor: &u32| subaddr_indices.is_empty() || subaddr_indices.contains(minor);
        let balance: u64 = self
            .transfers
            .balance_per_subaddress(account)
            .iter()
            .filter(|(m, _)| in_scope(m))
            .map(|(_, b)| b)
            .sum();
        let unlocked_per_subaddr = self.transfers.unlocked_balance_per_subaddress(account, ctx);
        let unlocked: u64 = unlocked_per_subaddr
            .iter()
            .filter(|(m, _)| in_scope(m))
            .map(|(_, b)| b)
            .sum();
        let min_fee = fee.estimate(1, 2, base_extra_w);
        for available in [balance, unlocked] {
            if needed_money.saturating_add(min_fee) > available {
                return Err(WalletError::NotEnoughMoney {
                    available,
                    needed: needed_money,
                    fee: min_fee,
                });
            }
        }

        let candidates = self.spendable_outputs(account, subaddr_indices);
        let mut groups: HashMap<u32, Vec<usize>> = HashMap::new();
        for &i in &candidates {
            let minor = self.transfers.transfers()[i].subaddr_index.minor;
            groups.entry(minor).or_default().push(i);
        }
        let mut groups: Vec<(u32, Vec<usize>)> = groups.into_iter().collect();
        groups.sort_by_key(|(minor, _)| *minor);
        for (_, list) in groups.iter_mut() {
            list.shuffle(&mut self.rng);
        }
        groups.sort_by(|(a, _), (b, _)| {
            let ua = unlocked_per_subaddr.get(a).copied().unwrap_or(0);
            let ub = unlocked_per_subaddr.get(b).copied().unwrap_or(0);
            ub.cmp(&ua)
        });

        let estimated_fee = fee.estimate(2, 2, base_extra_w);
        let mut preferred =
            pick_preferred_rct_inputs(self.transfers.transfers(), &candidates, needed_money + estimated_fee);
        debug!(
            needed = needed_money,
            outputs = candidates.len(),
            preferred = preferred.len(),
            "planning transfer"
        );

        let target = tx_weight_target(fee.weight_limit);
        let merge = self.config.merge_destinations;
        let mut txes = vec![PlannedTx::default()];
        let mut adding_fee = false;
        let mut available_for_fee = 0u64;
        let mut needed_fee = 0u64;
        let mut original_output_index = 0usize;

        loop {
            let tx_inputs = txes.last().map_or(0, |t| t.selected.len());
            let current_has_rct = groups.first().is_some_and(|(_, l)| !l.is_empty());
            let pick_second = tx_inputs == 1 && current_has_rct;
            let paying = dsts.first().is_some_and(|d| d.amount > 0);
            if !(paying || adding_fee || !preferred.is_empty() || pick_second) {
                break;
            }

            if groups.first().is_some_and(|(_, l)| l.is_empty()) && groups.len() > 1 && preferred.is_empty() {
                groups.remove(0);
            }

            let transfers = self.transfers.transfers();
            let Some(tx) = txes.last_mut() else {
                return Err(WalletError::Internal("no transaction being planned".into()));
            };
            let idx = if let Some(idx) = preferred.pop() {
                for (_, list) in groups.iter_mut() {
                    list.retain(|&i| i != idx);
                }
                idx
            } else {
                let Some(list) = groups.first_mut().map(|(_, l)| l).filter(|l| !l.is_empty()) else {
                    return Err(WalletError::NotEnoughMoney {
                        available: unlocked,
                        needed: needed_money,
                        fee: needed_fee,
                    });
                };
                if !paying && !adding_fee {
                    // Optional second input: only worth it if unrelated.
                    let Some(pos) = best_value_position(list, &tx.selected, transfers) else {
                        break;
                    };
                    let relatedness =
                        get_output_relatedness(&transfers[list[pos]], &transfers[tx.selected[0]]);
                    if relatedness > SECOND_OUTPUT_RELATEDNESS_THRESHOLD {
                        trace!(relatedness, "second output not needed and too related, not adding");
                        break;
                    }
                    list.remove(pos)
                } else {
                    match pop_best_value(list, &tx.selected, transfers) {
                        Some(i) => i,
                        None => break,
                    }
                }
            };

            let amount = transfers[idx].amount;
            trace!(idx, amount, "picking output");
            tx.selected.push(idx);
            let mut available_amount = amount;

            let extra_w = |dsts: &[TxDestination]| {
                let n = dsts.len() + 1;
                let additional = if need_additional_tx_keys(dsts, Some(&change_address)) { n } else { 0 };
                extra_weight(additional, extra.payment_id.is_some(), extra.nonce.len())
            };

            if adding_fee {
                available_for_fee += available_amount;
            } else {
                while let Some(front) = dsts.first().copied() {
                    if front.amount > available_amount
                        || fee.weight(tx.selected.len(), tx.dsts.len() + 1, extra_w(&tx.dsts)) >= target
                    {
                        break;
                    }
                    tx.add(&front, front.amount, original_output_index, merge)?;
                    available_amount -= front.amount;
                    dsts.remove(0);
                    original_output_index += 1;
                }
                if available_amount > 0 {
                    if let Some(front) = dsts.first_mut() {
                        if fee.weight(tx.selected.len(), tx.dsts.len() + 1, extra_w(&tx.dsts)) < target {
                            let partial = TxDestination::new(front.address, available_amount);
                            front.amount -= available_amount;
                            tx.add(&partial, available_amount, original_output_index, merge)?;
                        }
                    }
                }
            }

            let try_tx = if !preferred.is_empty() {
                false
            } else if adding_fee {
                available_for_fee >= needed_fee
            } else {
                let weight = fee.weight(tx.selected.len(), tx.dsts.len() + 1, extra_w(&tx.dsts));
                let try_tx = dsts.is_empty() || weight >= target;
                if try_tx && tx.dsts.is_empty() {
                    return Err(WalletError::TxTooBig {
                        weight,
                        limit: fee.weight_limit,
                    });
                }
                try_tx
            };
            if !try_tx {
                continue;
            }

            let selected = tx.selected.clone();
            let mut tx_dsts = tx.dsts.clone();
            needed_fee = fee.estimate(selected.len(), tx_dsts.len() + 1, extra_w(&tx_dsts));
            let inputs: u64 = selected.iter().map(|&i| transfers[i].amount).sum();
            let outputs = tx_dsts.iter().map(|d| d.amount).sum::<u64>() + needed_fee;
            if inputs < outputs {
                debug!(inputs, outputs, "not enough for the basic fee, adding inputs for it");
                adding_fee = true;
                available_for_fee = inputs.saturating_sub(outputs - needed_fee);
                continue;
            }

            let mut outs = Vec::new();
            let ptx = self.transfer_selected(
                &tx_dsts,
                &selected,
                fee.fake_outs,
                &mut outs,
                unlock_time,
                needed_fee,
                extra,
                fee.use_view_tags,
            )?;
            needed_fee = fee.for_tx(&ptx);
            available_for_fee = ptx.fee + ptx.change_dts.amount;
            trace!(weight = ptx.tx.weight(), available_for_fee, needed_fee, "made a transaction");

            let mut carved = false;
            if needed_fee > available_for_fee {
                if let Some(front) = dsts.first_mut().filter(|d| d.amount > 0) {
                    let paid = tx_dsts
                        .iter_mut()
                        .find(|d| d.address == front.address)
                        .ok_or_else(|| WalletError::Internal("paid address not found in outputs".into()))?;
                    if paid.amount > needed_fee {
                        let new_paid = paid.amount - needed_fee;
                        debug!(from = paid.amount, to = new_paid, needed_fee, "carving fee from partial payment");
                        front.amount += paid.amount - new_paid;
                        paid.amount = new_paid;
                        available_for_fee = needed_fee;
                        carved = true;
                    }
                }
            }

            if needed_fee > available_for_fee {
                debug!(needed_fee, available_for_fee, "could not make a transaction, accumulating fee");
                adding_fee = true;
                continue;
            }

            let ptx = self.settle_fee(
                &tx_dsts,
                &selected,
                &fee,
                ptx,
                needed_fee,
                carved,
                &mut outs,
                unlock_time,
                extra,
            )?;
            debug!(fee = ptx.fee, change = ptx.change_dts.amount, inputs = selected.len(), "transaction planned");
            let Some(tx) = txes.last_mut() else {
                return Err(WalletError::Internal("no transaction being planned".into()));
            };
            tx.dsts = tx_dsts;
            tx.ptx = Some(ptx);
            adding_fee = false;
            needed_fee = 0;
            if !dsts.is_empty() {
                debug!("more to pay, starting another transaction");
                txes.push(PlannedTx::default());
                original_output_index = 0;
            }
        }

        let ptxs = finish_plan(txes)?;
        if ptxs.is_empty() {
            return Err(WalletError::Internal("no transactions were built".into()));
        }
        self.sanity_check(&ptxs, Some(&original_dsts))?;
        info!(
            transactions = ptxs.len(),
            fee = ptxs.iter().map(|p| p.fee).sum::<u64>(),
            "transfer planned"
        );
        Ok(ptxs)
    }

    /// Sweep every spendable output of `account` below `below` (no bound
    /// when 0) to `address`, split over `outputs` outputs per transaction.
    /// Without explicit minors one subaddress is picked at random.
    #[allow(clippy::too_many_arguments)]
    pub fn create_transactions_all(
        &mut self,
        below: u64,
        address: Address,
        outputs: usize,
        fake_outs: u64,
        unlock_time: u64,
        priority: u32,
        extra: &TxExtra,
        account: u32,
        subaddr_indices: &[u32],
    ) -> Result<Vec<PendingTx>, WalletError> {
        let candidates: Vec<usize> = self
            .spendable_outputs(account, subaddr_indices)
            .into_iter()
            .filter(|&i| below == 0 || self.transfers.transfers()[i].amount < below)
            .collect();

        let unused = if subaddr_indices.is_empty() {
            let mut minors: Vec<u32> = candidates
                .iter()
                .map(|&i| self.transfers.transfers()[i].subaddr_index.minor)
                .collect();
            minors.sort_unstable();
            minors.dedup();
            match minors.choose(&mut self.rng).copied() {
                Some(minor) => candidates
                    .into_iter()
                    .filter(|&i| self.transfers.transfers()[i].subaddr_index.minor == minor)
                    .collect(),
                None => Vec::new(),
            }
        } else {
            candidates
        };
        self.create_transactions_from(address, outputs, unused, fake_outs, unlock_time, priority, extra)
    }

    /// Sweep the single output with `key_image`.
    #[allow(clippy::too_many_arguments)]
    pub fn create_transactions_single(
        &mut self,
        key_image: &KeyImage,
        address: Address,
        outputs: usize,
        fake_outs: u64,
        unlock_time: u64,
        priority: u32,
        extra: &TxExtra,
    ) -> Result<Vec<PendingTx>, WalletError> {
        let idx = self
            .transfers
            .find_by_key_image(key_image)
            .ok_or(WalletError::OutputNotSpendable { key_image: *key_image })?;
        let td = self.transfer(idx)?;
        if td.spent || td.frozen || !td.rct || !is_transfer_unlocked(td, self.spend_context()) {
            return Err(WalletError::OutputNotSpendable { key_image: *key_image });
        }
        self.create_transactions_from(address, outputs, vec![idx], fake_outs, unlock_time, priority, extra)
    }

    /// Spend all of `unused` to `address`. Each transaction's inputs minus
    /// fee are divided evenly over `outputs` outputs, the remainder handed
    /// out one atomic unit at a time.
    #[allow(clippy::too_many_arguments)]
    pub fn create_transactions_from(
        &mut self,
        address: Address,
        outputs: usize,
        mut unused: Vec<usize>,
        fake_outs: u64,
        unlock_time: u64,
        priority: u32,
        extra: &TxExtra,
    ) -> Result<Vec<PendingTx>, WalletError> {
        if outputs == 0 {
            return Err(WalletError::ZeroDestination);
        }
        if unused.is_empty() {
            return Err(WalletError::NotEnoughMoney {
                available: 0,
                needed: 0,
                fee: 0,
            });
        }
        let fee = self.fee_params(priority, fake_outs)?;
        let target = tx_weight_target(fee.weight_limit);
        let account = self.transfer(unused[0])?.subaddr_index.major;
        let change_address = self.keys.subaddress(SubaddressIndex::new(account, 0))?;

        let one_ring = fee.weight(1, 2, 0);
        let two_rings = fee.weight(2, 2, 0);
        let weight_per_ring = two_rings - one_ring;
        let fractional_threshold = if fee.per_byte {
            fee.multiplier * fee.base_fee * weight_per_ring
        } else {
            fee.multiplier * fee.base_fee * weight_per_ring / 1024
        };

        let dests = vec![TxDestination::new(address, 0); outputs];
        let extra_w = self.extra_weight_for(&dests, &change_address, extra);

        let mut txes = vec![PlannedTx::default()];
        while !unused.is_empty() {
            let transfers = self.transfers.transfers();
            let Some(tx) = txes.last_mut() else {
                return Err(WalletError::Internal("no transaction being planned".into()));
            };
            let Some(idx) = pop_best_value(&mut unused, &tx.selected, transfers) else {
                break;
            };
            let amount = transfers[idx].amount;
            if amount < fractional_threshold {
                debug!(idx, amount, fractional_threshold, "skipping output below fee it costs");
                continue;
            }
            tx.selected.push(idx);

            let weight = fee.weight(tx.selected.len(), outputs + 1, extra_w);
            let exhausted = unused.iter().all(|&i| transfers[i].amount < fractional_threshold);
            if !(exhausted || weight >= target) {
                continue;
            }

            let selected = tx.selected.clone();
            let inputs: u64 = selected.iter().map(|&i| transfers[i].amount).sum();
            let mut needed_fee = fee.estimate(selected.len(), outputs + 1, extra_w);
            let mut tx_dsts = dests.clone();
            let mut outs = Vec::new();
            let mut ptx: Option<PendingTx> = None;
            for _ in 0..MAX_FEE_ITERATIONS {
                let transferred = inputs.checked_sub(needed_fee).filter(|t| *t >= outputs as u64).ok_or(
                    WalletError::NotEnoughMoney {
                        available: inputs,
                        needed: outputs as u64,
                        fee: needed_fee,
                    },
                )?;
                split_evenly(&mut tx_dsts, transferred);
                let built = self.transfer_selected(
                    &tx_dsts,
                    &selected,
                    fee.fake_outs,
                    &mut outs,
                    unlock_time,
                    needed_fee,
                    extra,
                    fee.use_view_tags,
                )?;
                needed_fee = fee.for_tx(&built);
                trace!(fee = built.fee, needed_fee, "sweep fee iteration");
                let settled = needed_fee == built.fee;
                ptx = Some(built);
                if settled {
                    break;
                }
            }
            let ptx = ptx
                .filter(|p| p.fee == needed_fee)
                .ok_or_else(|| WalletError::Internal(format!("sweep fee did not settle at {needed_fee}")))?;
            debug!(fee = ptx.fee, inputs = selected.len(), "sweep transaction planned");

            let Some(tx) = txes.last_mut() else {
                return Err(WalletError::Internal("no transaction being planned".into()));
            };
            tx.dsts = tx_dsts;
            tx.ptx = Some(ptx);
            if !unused.is_empty() {
                txes.push(PlannedTx::default());
            }
        }

        let ptxs = finish_plan(txes)?;
        if ptxs.is_empty() {
            return Err(WalletError::NotEnoughMoney {
                available: 0,
                needed: 0,
                fee: fractional_threshold,
            });
        }
        self.sanity_check(&ptxs, None)?;
        info!(transactions = ptxs.len(), "sweep planned");
        Ok(ptxs)
    }
}

/// Divide `total` over `dsts`, earlier entries taking the remainder.
fn split_evenly(dsts: &mut [TxDestination], total: u64) {
    let n = dsts.len() as u64;
    let share = total / n;
    let mut residue = total % n;
    for d in dsts {
        d.amount = share + u64::from(residue > 0);
        residue = residue.saturating_sub(1);
    }
}

fn finish_plan(txes: Vec<PlannedTx>) -> Result<Vec<PendingTx>, WalletError> {
    let mut ptxs = Vec::with_capacity(txes.len());
    for tx in txes {
        match tx.ptx {
            Some(ptx) => ptxs.push(ptx),
            None if tx.selected.is_empty() => {}
            None => {
                return Err(WalletError::Internal(format!(
                    "planned transaction with {} inputs was never built",
                    tx.selected.len()
                )))
            }
        }
    }
    Ok(ptxs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfers::tests::td;

    fn at(n: u8, height: u64, amount: u64) -> TransferDetail {
        let mut t = td(n, height);
        t.amount = amount;
        t.rct = true;
        t
    }

    #[test]
    fn relatedness_table() {
        let a = at(1, 100, 1);
        let mut same_tx = at(2, 100, 1);
        same_tx.txid = a.txid;
        assert_eq!(get_output_relatedness(&a, &same_tx), 1.0);
        assert_eq!(get_output_relatedness(&a, &at(3, 100, 1)), 0.9);
        assert_eq!(get_output_relatedness(&a, &at(4, 101, 1)), 0.8);
        assert_eq!(get_output_relatedness(&a, &at(5, 99, 1)), 0.8);
        assert_eq!(get_output_relatedness(&a, &at(6, 109, 1)), 0.2);
        assert_eq!(get_output_relatedness(&a, &at(7, 110, 1)), 0.0);
        assert_eq!(get_output_relatedness(&a, &at(8, 50, 1)), 0.0);
    }

    #[test]
    fn preferred_single_output_first() {
        let transfers = vec![at(1, 10, 5), at(2, 50, 20), at(3, 90, 30)];
        assert_eq!(pick_preferred_rct_inputs(&transfers, &[0, 1, 2], 15), vec![1]);
    }

    #[test]
    fn preferred_pair_least_related() {
        let transfers = vec![at(1, 10, 6), at(2, 11, 6), at(3, 40, 6)];
        assert_eq!(pick_preferred_rct_inputs(&transfers, &[0, 1, 2], 10), vec![0, 2]);

        // Equally related pairs keep the oldest.
        let close = vec![at(1, 10, 6), at(2, 11, 6), at(3, 11, 6)];
        assert_eq!(pick_preferred_rct_inputs(&close, &[0, 1, 2], 10), vec![0, 1]);
    }

    #[test]
    fn preferred_pair_needs_one_subaddress() {
        let mut transfers = vec![at(1, 10, 6), at(2, 40, 6)];
        transfers[1].subaddr_index = SubaddressIndex::new(0, 3);
        assert!(pick_preferred_rct_inputs(&transfers, &[0, 1], 10).is_empty());
    }

    #[test]
    fn pop_best_value_prefers_unrelated_then_small() {
        let transfers = vec![at(1, 100, 9), at(2, 101, 1), at(3, 300, 7), at(4, 400, 5)];
        let mut unused = vec![1, 2, 3];
        assert_eq!(pop_best_value(&mut unused, &[0], &transfers), Some(3));
        assert_eq!(unused, vec![1, 2]);
        assert_eq!(pop_best_value(&mut unused, &[0], &transfers), Some(2));
        assert_eq!(pop_best_value(&mut unused, &[0], &transfers), Some(1));
        assert_eq!(pop_best_value(&mut unused, &[0], &transfers), None);
    }

    #[test]
    fn pop_best_value_with_nothing_selected_takes_smallest() {
        let transfers = vec![at(1, 100, 9), at(2, 100, 2), at(3, 100, 4)];
        let mut unused = vec![0, 1, 2];
        assert_eq!(pop_best_value(&mut unused, &[], &transfers), Some(1));
    }

    #[test]
    fn split_evenly_hands_out_residue() {
        let address = crate::keys::AccountKeys::from_seed(&[1; 32]).address();
        let mut dsts = vec![TxDestination::new(address, 0); 3];
        split_evenly(&mut dsts, 11);
        let amounts: Vec<u64> = dsts.iter().map(|d| d.amount).collect();
        assert_eq!(amounts, vec![4, 4, 3]);
    }
}
