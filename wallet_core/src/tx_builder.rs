//! Transaction construction.
//!
//! Turns selected outputs, their rings and a destination list into one
//! balanced, signed confidential transaction. Also holds the post-build
//! sanity check and the broadcast step.

use rand::seq::SliceRandom;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};
use umbra_crypto::{
    commit, commitment_mask, commitments_balance, decrypt_amount, derivation_to_scalar,
    derive_public_key, derive_secret_key, derive_view_tag, encrypt_amount,
    generate_key_derivation, generate_key_image, generate_ring_signature, random_scalar,
    scalar_mult_key, secret_to_public, sub_secrets, sum_secrets,
};
use umbra_types::params::MINED_MONEY_UNLOCK_WINDOW;
use umbra_types::transaction::absolute_to_relative;
use umbra_types::{
    KeyDerivation, KeyImage, PublicKey, RctSignatures, RctType, SecretKey, SubaddressIndex,
    Transaction, TransactionPrefix, TxExtra, TxHash, TxIn, TxOut, TxOutTarget,
};

use crate::error::WalletError;
use crate::keys::{AccountKeys, Address};
use crate::payments::{TxState, UnconfirmedTransferDetail};
use crate::wallet::Wallet;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxDestination {
    pub address: Address,
    pub amount: u64,
}

impl TxDestination {
    pub fn new(address: Address, amount: u64) -> Self {
        Self { address, amount }
    }
}

/// One ring member.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputEntry {
    pub index: u64,
    pub key: PublicKey,
    pub commitment: PublicKey,
}

/// An input to sign: the ring, and what re-derives the real member's secret.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxSource {
    /// Ordered by global index.
    pub outputs: Vec<OutputEntry>,
    pub real_output: usize,
    pub real_out_tx_key: PublicKey,
    pub real_output_in_tx_index: u64,
    pub amount: u64,
    pub rct: bool,
    pub mask: SecretKey,
    pub key_image: KeyImage,
    pub subaddr_index: SubaddressIndex,
}

impl TxSource {
    pub fn ring_indices(&self) -> Vec<u64> {
        self.outputs.iter().map(|o| o.index).collect()
    }
}

/// Everything needed to rebuild and re-sign a transaction offline.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxConstructionData {
    /// In input order.
    pub sources: Vec<TxSource>,
    pub change_dts: TxDestination,
    /// Destinations plus change, in output order.
    pub splitted_dsts: Vec<TxDestination>,
    pub selected_transfers: Vec<usize>,
    pub extra: TxExtra,
    pub unlock_time: u64,
    pub use_view_tags: bool,
    pub dests: Vec<TxDestination>,
    pub subaddr_account: u32,
    pub subaddr_indices: Vec<u32>,
}

/// A signed transaction ready for [`Wallet::commit_tx`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingTx {
    pub tx: Transaction,
    pub dust: u64,
    pub fee: u64,
    pub dust_added_to_fee: bool,
    pub change_dts: TxDestination,
    /// Ledger indices in input order.
    pub selected_transfers: Vec<usize>,
    pub key_images: Vec<KeyImage>,
    pub tx_key: SecretKey,
    pub additional_tx_keys: Vec<SecretKey>,
    pub dests: Vec<TxDestination>,
    pub construction_data: TxConstructionData,
}

pub(crate) struct BuiltTx {
    pub tx: Transaction,
    pub tx_key: SecretKey,
    pub additional_tx_keys: Vec<SecretKey>,
    /// `order[k]` is the caller's position of the source now at input `k`.
    pub order: Vec<usize>,
    pub sources: Vec<TxSource>,
}

struct AddressClasses<'a> {
    standard: usize,
    sub: usize,
    last_sub: Option<&'a Address>,
}

/// Count distinct non-change destinations by address kind.
fn classify_addresses<'a>(dsts: &'a [TxDestination], change: Option<&Address>) -> AddressClasses<'a> {
    let mut seen = HashSet::new();
    let mut classes = AddressClasses {
        standard: 0,
        sub: 0,
        last_sub: None,
    };
    for d in dsts {
        if change == Some(&d.address) || !seen.insert(d.address) {
            continue;
        }
        if d.address.is_subaddress {
            classes.sub += 1;
            classes.last_sub = Some(&d.address);
        } else {
            classes.standard += 1;
        }
    }
    classes
}

/// Whether paying `dsts` needs one transaction key per output.
pub fn need_additional_tx_keys(dsts: &[TxDestination], change: Option<&Address>) -> bool {
    let c = classify_addresses(dsts, change);
    c.sub > 0 && (c.standard > 0 || c.sub > 1)
}

pub(crate) fn source_secret(keys: &AccountKeys, src: &TxSource) -> Result<SecretKey, WalletError> {
    let real = src.outputs.get(src.real_output).ok_or_else(|| {
        WalletError::Internal(format!(
            "real output position {} outside ring of {}",
            src.real_output,
            src.outputs.len()
        ))
    })?;
    let derivation = generate_key_derivation(&src.real_out_tx_key, &keys.view_secret)?;
    let secret = derive_secret_key(
        &derivation,
        src.real_output_in_tx_index,
        &keys.subaddress_spend_secret(src.subaddr_index),
    );
    if secret_to_public(&secret) != real.key {
        return Err(WalletError::Internal(format!(
            "derived key does not match ring member {} for {}",
            real.index, src.key_image
        )));
    }
    if generate_key_image(&real.key, &secret) != src.key_image {
        return Err(WalletError::Internal(format!(
            "key image mismatch for ring member {}",
            real.index
        )));
    }
    Ok(secret)
}

/// Build and sign one transaction. `destinations` are used in the given
/// order and must already include change; inputs are sorted by key image,
/// descending.
#[allow(clippy::too_many_arguments)]
pub(crate) fn construct_tx<R: RngCore + CryptoRng>(
    keys: &AccountKeys,
    sources: &[TxSource],
    destinations: &[TxDestination],
    change: Option<&TxDestination>,
    fee: u64,
    extra: &TxExtra,
    unlock_time: u64,
    use_view_tags: bool,
    rng: &mut R,
) -> Result<BuiltTx, WalletError> {
    if sources.is_empty() {
        return Err(WalletError::Internal("transaction without inputs".into()));
    }
    if destinations.is_empty() {
        return Err(WalletError::ZeroDestination);
    }
    let overflow = || WalletError::Internal("amount overflow".into());
    let inputs_total = sources
        .iter()
        .try_fold(0u64, |acc, s| acc.checked_add(s.amount))
        .ok_or_else(overflow)?;
    let outputs_total = destinations
        .iter()
        .try_fold(fee, |acc, d| acc.checked_add(d.amount))
        .ok_or_else(overflow)?;
    if inputs_total != outputs_total {
        return Err(WalletError::Internal(format!(
            "inputs {inputs_total} do not balance outputs plus fee {outputs_total}"
        )));
    }

    let mut order: Vec<usize> = (0..sources.len()).collect();
    order.sort_by(|&a, &b| sources[b].key_image.cmp(&sources[a].key_image));
    let sorted: Vec<TxSource> = order.iter().map(|&i| sources[i].clone()).collect();

    let change_address = change.map(|c| c.address);
    let classes = classify_addresses(destinations, change_address.as_ref());
    let tx_key = random_scalar(rng);
    let tx_pub_key = match (classes.standard, classes.sub, classes.last_sub) {
        (0, 1, Some(sub)) => scalar_mult_key(&sub.spend_public, &tx_key)?,
        _ => secret_to_public(&tx_key),
    };
    let need_additional = classes.sub > 0 && (classes.standard > 0 || classes.sub > 1);

    let mut outputs = Vec::with_capacity(destinations.len());
    let mut out_commitments = Vec::with_capacity(destinations.len());
    let mut encrypted_amounts = Vec::with_capacity(destinations.len());
    let mut out_masks = Vec::with_capacity(destinations.len());
    let mut additional_tx_keys = Vec::new();
    let mut additional_pub_keys = Vec::new();

    for (i, dst) in destinations.iter().enumerate() {
        let index = i as u64;
        let (key_pub, key_secret) = if need_additional {
            let r = random_scalar(rng);
            let public = if dst.address.is_subaddress {
                scalar_mult_key(&dst.address.spend_public, &r)?
            } else {
                secret_to_public(&r)
            };
            additional_tx_keys.push(r.clone());
            additional_pub_keys.push(public);
            (public, r)
        } else {
            (tx_pub_key, tx_key.clone())
        };
        let derivation = if change_address == Some(dst.address) {
            generate_key_derivation(&key_pub, &keys.view_secret)?
        } else {
            generate_key_derivation(&dst.address.view_public, &key_secret)?
        };
        let key = derive_public_key(&derivation, index, &dst.address.spend_public)?;
        let target = if use_view_tags {
            TxOutTarget::ToTaggedKey {
                key,
                view_tag: derive_view_tag(&derivation, index),
            }
        } else {
            TxOutTarget::ToKey { key }
        };
        let shared = derivation_to_scalar(&derivation, index);
        let mask = commitment_mask(&shared);
        out_commitments.push(commit(dst.amount, &mask));
        encrypted_amounts.push(encrypt_amount(dst.amount, &shared));
        out_masks.push(mask);
        outputs.push(TxOut { amount: 0, target });
    }

    let inputs = sorted
        .iter()
        .map(|s| TxIn::ToKey {
            amount: if s.rct { 0 } else { s.amount },
            key_offsets: absolute_to_relative(&s.ring_indices()),
            key_image: s.key_image,
        })
        .collect();

    let mut pseudo_masks: Vec<SecretKey> = (1..sorted.len()).map(|_| random_scalar(rng)).collect();
    let last_mask = sub_secrets(&sum_secrets(&out_masks), &sum_secrets(&pseudo_masks));
    pseudo_masks.push(last_mask);
    let pseudo_outs: Vec<PublicKey> = sorted
        .iter()
        .zip(&pseudo_masks)
        .map(|(s, m)| commit(s.amount, m))
        .collect();
    if !commitments_balance(&pseudo_outs, &out_commitments, fee)? {
        return Err(WalletError::Internal("commitments do not balance".into()));
    }

    let mut tx = Transaction {
        prefix: TransactionPrefix {
            version: 2,
            unlock_time,
            inputs,
            outputs,
            extra: TxExtra {
                tx_pub_key: Some(tx_pub_key),
                additional_pub_keys,
                payment_id: extra.payment_id,
                nonce: extra.nonce.clone(),
            },
        },
        rct: RctSignatures {
            rct_type: RctType::Simple,
            fee,
            out_commitments,
            encrypted_amounts,
            pseudo_outs,
            ring_signatures: Vec::new(),
        },
    };

    let message = tx.signing_message();
    let mut signatures = Vec::with_capacity(sorted.len());
    for src in &sorted {
        let secret = source_secret(keys, src)?;
        let ring: Vec<PublicKey> = src.outputs.iter().map(|o| o.key).collect();
        signatures.push(generate_ring_signature(
            &message,
            &ring,
            &src.key_image,
            &secret,
            src.real_output,
            rng,
        )?);
    }
    tx.rct.ring_signatures = signatures;

    Ok(BuiltTx {
        tx,
        tx_key,
        additional_tx_keys,
        order,
        sources: sorted,
    })
}

/// Coinbase paying `reward` to `address` at `height`, spendable after the
/// mined-money unlock window.
pub fn construct_miner_tx<R: RngCore + CryptoRng>(
    address: &Address,
    height: u64,
    reward: u64,
    use_view_tags: bool,
    rng: &mut R,
) -> Result<Transaction, WalletError> {
    let tx_key = random_scalar(rng);
    let tx_pub_key = if address.is_subaddress {
        scalar_mult_key(&address.spend_public, &tx_key)?
    } else {
        secret_to_public(&tx_key)
    };
    let derivation = generate_key_derivation(&address.view_public, &tx_key)?;
    let key = derive_public_key(&derivation, 0, &address.spend_public)?;
    let target = if use_view_tags {
        TxOutTarget::ToTaggedKey {
            key,
            view_tag: derive_view_tag(&derivation, 0),
        }
    } else {
        TxOutTarget::ToKey { key }
    };
    Ok(Transaction {
        prefix: TransactionPrefix {
            version: 2,
            unlock_time: height + MINED_MONEY_UNLOCK_WINDOW,
            inputs: vec![TxIn::Gen { height }],
            outputs: vec![TxOut { amount: reward, target }],
            extra: TxExtra {
                tx_pub_key: Some(tx_pub_key),
                ..TxExtra::default()
            },
        },
        rct: RctSignatures::default(),
    })
}

/// Sum of the outputs of `tx` paying `address`, given candidate
/// derivations (main, then per output).
fn received_by(
    tx: &Transaction,
    address: &Address,
    main: Option<&KeyDerivation>,
    additional: &[KeyDerivation],
) -> Result<u64, WalletError> {
    let mut total = 0u64;
    for (i, out) in tx.prefix.outputs.iter().enumerate() {
        let index = i as u64;
        for derivation in main.into_iter().chain(additional.get(i)) {
            if derive_public_key(derivation, index, &address.spend_public)? != *out.target.key() {
                continue;
            }
            let (Some(encrypted), Some(commitment)) =
                (tx.rct.encrypted_amounts.get(i), tx.rct.out_commitments.get(i))
            else {
                return Err(WalletError::Internal(format!("output {i} has no amount data")));
            };
            let shared = derivation_to_scalar(derivation, index);
            let amount = decrypt_amount(encrypted, &shared);
            if commit(amount, &commitment_mask(&shared)) != *commitment {
                return Err(WalletError::Internal(format!("output {i} commitment mismatch")));
            }
            total = total
                .checked_add(amount)
                .ok_or_else(|| WalletError::Internal("amount overflow".into()))?;
            break;
        }
    }
    Ok(total)
}

impl Wallet {
    /// Build a transaction spending exactly `selected` to `dsts` plus
    /// change. Rings are fetched into `outs` on first use and reused on
    /// later rebuilds with the same inputs.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn transfer_selected(
        &mut self,
        dsts: &[TxDestination],
        selected: &[usize],
        fake_outs: u64,
        outs: &mut Vec<Vec<OutputEntry>>,
        unlock_time: u64,
        fee: u64,
        extra: &TxExtra,
        use_view_tags: bool,
    ) -> Result<PendingTx, WalletError> {
        if selected.is_empty() {
            return Err(WalletError::Internal("no inputs selected".into()));
        }
        let mut found = 0u64;
        for &idx in selected {
            let td = self.transfer(idx)?;
            found = found
                .checked_add(td.amount)
                .ok_or_else(|| WalletError::Internal("input sum overflow".into()))?;
        }
        let paid = dsts
            .iter()
            .try_fold(0u64, |acc, d| acc.checked_add(d.amount))
            .ok_or_else(|| WalletError::Internal("destination sum overflow".into()))?;
        let needed = paid
            .checked_add(fee)
            .ok_or_else(|| WalletError::Internal("destination sum overflow".into()))?;
        if found < needed {
            return Err(WalletError::NotEnoughMoney {
                available: found,
                needed: paid,
                fee,
            });
        }

        if outs.is_empty() {
            *outs = self.get_rings(selected, fake_outs)?;
        }
        if outs.len() != selected.len() {
            return Err(WalletError::Internal(format!(
                "{} rings for {} inputs",
                outs.len(),
                selected.len()
            )));
        }

        let first = self.transfer(selected[0])?;
        let account = first.subaddr_index.major;
        let change = TxDestination::new(
            self.keys.subaddress(SubaddressIndex::new(account, 0))?,
            found - needed,
        );

        let mut sources = Vec::with_capacity(selected.len());
        let mut minors = Vec::new();
        for (&idx, ring) in selected.iter().zip(outs.iter()) {
            let td = self.transfer(idx)?;
            let real_output = ring
                .iter()
                .position(|o| o.index == td.global_output_index)
                .ok_or_else(|| {
                    WalletError::Internal(format!(
                        "output {} missing from its own ring",
                        td.global_output_index
                    ))
                })?;
            minors.push(td.subaddr_index.minor);
            sources.push(TxSource {
                outputs: ring.clone(),
                real_output,
                real_out_tx_key: td.tx_pub_key,
                real_output_in_tx_index: td.internal_output_index,
                amount: td.amount,
                rct: td.rct,
                mask: td.mask.clone(),
                key_image: td.key_image,
                subaddr_index: td.subaddr_index,
            });
        }
        minors.sort_unstable();
        minors.dedup();

        let mut splitted = dsts.to_vec();
        splitted.push(change);
        splitted.shuffle(&mut self.rng);

        let built = construct_tx(
            &self.keys,
            &sources,
            &splitted,
            Some(&change),
            fee,
            extra,
            unlock_time,
            use_view_tags,
            &mut self.rng,
        )?;
        let selected_transfers: Vec<usize> = built.order.iter().map(|&k| selected[k]).collect();
        debug!(
            inputs = selected.len(),
            outputs = splitted.len(),
            fee,
            change = change.amount,
            weight = built.tx.weight(),
            "built transaction"
        );

        Ok(PendingTx {
            key_images: built.sources.iter().map(|s| s.key_image).collect(),
            tx: built.tx,
            dust: 0,
            fee,
            dust_added_to_fee: false,
            change_dts: change,
            selected_transfers: selected_transfers.clone(),
            tx_key: built.tx_key,
            additional_tx_keys: built.additional_tx_keys,
            dests: dsts.to_vec(),
            construction_data: TxConstructionData {
                sources: built.sources,
                change_dts: change,
                splitted_dsts: splitted,
                selected_transfers,
                extra: extra.clone(),
                unlock_time,
                use_view_tags,
                dests: dsts.to_vec(),
                subaddr_account: account,
                subaddr_indices: minors,
            },
        })
    }

    fn is_own_address(&self, address: &Address) -> Result<bool, WalletError> {
        match self.subaddresses.lookup(&address.spend_public) {
            Some(index) => Ok(self.keys.subaddress(index)? == *address),
            None => Ok(false),
        }
    }

    /// Check built transactions against what was asked for: every input
    /// is accounted for by destinations, change and fee; change goes back
    /// to this wallet; and each address receives exactly its amount.
    /// `original_dsts` is `None` for sweeps, whose amounts are derived.
    pub fn sanity_check(
        &self,
        ptxs: &[PendingTx],
        original_dsts: Option<&[TxDestination]>,
    ) -> Result<(), WalletError> {
        let fail = |msg: String| Err(WalletError::Internal(format!("sanity check: {msg}")));
        let mut seen_key_images = HashSet::new();
        let mut paid: HashMap<Address, u64> = HashMap::new();

        for ptx in ptxs {
            let inputs = ptx.tx.prefix.inputs.len();
            if ptx.key_images.len() != inputs || ptx.selected_transfers.len() != inputs {
                return fail(format!(
                    "{inputs} inputs, {} key images, {} selected",
                    ptx.key_images.len(),
                    ptx.selected_transfers.len()
                ));
            }
            for ki in &ptx.key_images {
                if !seen_key_images.insert(*ki) {
                    return fail(format!("key image {ki} spent twice"));
                }
            }
            if ptx.tx.rct.fee != ptx.fee {
                return fail(format!("fee {} differs from signed fee {}", ptx.fee, ptx.tx.rct.fee));
            }

            let mut in_total = 0u64;
            for &idx in &ptx.selected_transfers {
                in_total += self.transfer(idx)?.amount;
            }
            let dest_total: u64 = ptx.dests.iter().map(|d| d.amount).sum();
            if in_total != dest_total + ptx.change_dts.amount + ptx.fee {
                return fail(format!(
                    "inputs {in_total} != destinations {dest_total} + change {} + fee {}",
                    ptx.change_dts.amount, ptx.fee
                ));
            }

            let change_address = ptx.change_dts.address;
            if !self.is_own_address(&change_address)? {
                return fail("change address is not ours".into());
            }

            let mut required: HashMap<Address, u64> = HashMap::new();
            for d in &ptx.dests {
                *required.entry(d.address).or_insert(0) += d.amount;
                *paid.entry(d.address).or_insert(0) += d.amount;
            }
            *required.entry(change_address).or_insert(0) += ptx.change_dts.amount;

            let tx_pub_key = ptx
                .tx
                .prefix
                .extra
                .tx_pub_key
                .ok_or_else(|| WalletError::Internal("sanity check: no tx public key".into()))?;
            for (address, amount) in &required {
                let received = if *address == change_address {
                    let main = generate_key_derivation(&tx_pub_key, &self.keys.view_secret)?;
                    let additional = ptx
                        .tx
                        .prefix
                        .extra
                        .additional_pub_keys
                        .iter()
                        .map(|k| generate_key_derivation(k, &self.keys.view_secret))
                        .collect::<Result<Vec<_>, _>>()?;
                    received_by(&ptx.tx, address, Some(&main), &additional)?
                } else {
                    let main = generate_key_derivation(&address.view_public, &ptx.tx_key)?;
                    let additional = ptx
                        .additional_tx_keys
                        .iter()
                        .map(|r| generate_key_derivation(&address.view_public, r))
                        .collect::<Result<Vec<_>, _>>()?;
                    received_by(&ptx.tx, address, Some(&main), &additional)?
                };
                if received != *amount {
                    return fail(format!("{address} receives {received}, expected {amount}"));
                }
            }
        }

        if let Some(original) = original_dsts {
            let mut wanted: HashMap<Address, u64> = HashMap::new();
            for d in original {
                *wanted.entry(d.address).or_insert(0) += d.amount;
            }
            if wanted != paid {
                return fail("paid amounts differ from requested destinations".into());
            }
        }
        Ok(())
    }

    /// Broadcast a transaction and record it as pending: inputs are marked
    /// spent at the current chain height and rings go into the ring
    /// database.
    pub fn commit_tx(&mut self, ptx: &PendingTx) -> Result<TxHash, WalletError> {
        let daemon = self.daemon()?;
        let blob = ptx.tx.to_blob()?;
        let txid = ptx.tx.hash();
        if let Err(e) = daemon.send_raw_tx(&blob) {
            warn!(%txid, error = %e, "daemon did not accept transaction");
            return Err(e.into());
        }

        self.add_unconfirmed_tx(ptx, txid);
        for src in &ptx.construction_data.sources {
            self.ring_db.set_ring(src.key_image, src.ring_indices());
        }
        let height = self.hash_chain.size();
        for &idx in &ptx.selected_transfers {
            self.transfers.set_spent(idx, height)?;
        }
        info!(%txid, fee = ptx.fee, inputs = ptx.selected_transfers.len(), "transaction committed");
        Ok(txid)
    }

    pub fn commit_txs(&mut self, ptxs: &[PendingTx]) -> Result<Vec<TxHash>, WalletError> {
        ptxs.iter().map(|ptx| self.commit_tx(ptx)).collect()
    }

    fn add_unconfirmed_tx(&mut self, ptx: &PendingTx, txid: TxHash) {
        let now = self.clock.now();
        let data = &ptx.construction_data;
        let amount_in = data.sources.iter().map(|s| s.amount).sum();
        let amount_out = ptx.dests.iter().map(|d| d.amount).sum::<u64>() + ptx.change_dts.amount;
        self.unconfirmed_txs.insert(
            txid,
            UnconfirmedTransferDetail {
                tx: ptx.tx.prefix.clone(),
                amount_in,
                amount_out,
                change: ptx.change_dts.amount,
                sent_time: now,
                dests: ptx.dests.clone(),
                state: TxState::Pending,
                timestamp: now,
                subaddr_account: data.subaddr_account,
                subaddr_indices: data.subaddr_indices.clone(),
                rings: data
                    .sources
                    .iter()
                    .map(|s| (s.key_image, s.ring_indices()))
                    .collect(),
            },
        );
    }
}
