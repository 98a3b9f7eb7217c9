//! M-of-N candidate transaction sets.
//!
//! Which co-signers take part changes the ring signature material but not
//! the prefix, so the creator prepares one candidate per possible set of
//! absent co-signers, each signed with nonces drawn from its own exclusion
//! set. Each signature narrows the set to the candidates that include that
//! signer; after M signatures exactly one is left, and it verifies.

use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::BTreeSet;
use tracing::debug;
use umbra_crypto::{blake2b_256_multi, generate_ring_signature};
use umbra_types::{PublicKey, Transaction};

use crate::error::WalletError;
use crate::keys::AccountKeys;
use crate::tx_builder::{source_secret, PendingTx};

const CANDIDATE_DOMAIN: &[u8] = b"umbra-multisig-candidate";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MultisigCandidate {
    /// Co-signers this candidate is built without.
    pub excluded: BTreeSet<u32>,
    pub signers: BTreeSet<u32>,
    pub tx: Transaction,
}

#[derive(Clone, Debug)]
pub struct MultisigTxSet {
    threshold: u32,
    participants: u32,
    prefix_hash: [u8; 32],
    candidates: Vec<MultisigCandidate>,
}

/// Every `k`-element subset of `items`, in lexicographic order of position.
pub(crate) fn combinations(items: &[u32], k: usize) -> Vec<Vec<u32>> {
    if k > items.len() {
        return Vec::new();
    }
    let mut out = Vec::new();
    let mut idx: Vec<usize> = (0..k).collect();
    loop {
        out.push(idx.iter().map(|&i| items[i]).collect());
        let Some(pos) = (0..k).rev().find(|&p| idx[p] != p + items.len() - k) else {
            return out;
        };
        idx[pos] += 1;
        for p in pos + 1..k {
            idx[p] = idx[p - 1] + 1;
        }
    }
}

/// Nonce seed for the candidate built without `excluded`.
fn candidate_seed(prefix_hash: &[u8; 32], excluded: &BTreeSet<u32>) -> [u8; 32] {
    let tag: Vec<u8> = excluded.iter().flat_map(|i| i.to_le_bytes()).collect();
    blake2b_256_multi(&[CANDIDATE_DOMAIN, prefix_hash, &tag])
}

/// Re-sign every input of `ptx` with nonces bound to `excluded`.
fn candidate_tx(ptx: &PendingTx, keys: &AccountKeys, excluded: &BTreeSet<u32>) -> Result<Transaction, WalletError> {
    let sources = &ptx.construction_data.sources;
    if sources.len() != ptx.tx.prefix.inputs.len() {
        return Err(WalletError::Multisig(format!(
            "{} sources for {} inputs",
            sources.len(),
            ptx.tx.prefix.inputs.len()
        )));
    }
    let mut tx = ptx.tx.clone();
    let message = tx.signing_message();
    let mut rng = StdRng::from_seed(candidate_seed(&tx.prefix_hash(), excluded));
    let mut signatures = Vec::with_capacity(sources.len());
    for src in sources {
        let secret = source_secret(keys, src)?;
        let ring: Vec<PublicKey> = src.outputs.iter().map(|o| o.key).collect();
        signatures.push(generate_ring_signature(
            &message,
            &ring,
            &src.key_image,
            &secret,
            src.real_output,
            &mut rng,
        )?);
    }
    tx.rct.ring_signatures = signatures;
    Ok(tx)
}

impl MultisigTxSet {
    /// Prepare `C(N-1, N-M)` candidates for `ptx`, signed so far by
    /// `creator` alone. `keys` must own every input of `ptx`.
    pub fn build(
        ptx: &PendingTx,
        keys: &AccountKeys,
        creator: u32,
        threshold: u32,
        participants: u32,
    ) -> Result<Self, WalletError> {
        if threshold == 0 || threshold > participants {
            return Err(WalletError::Multisig(format!(
                "invalid {threshold}-of-{participants} scheme"
            )));
        }
        if creator >= participants {
            return Err(WalletError::Multisig(format!("creator {creator} is not a participant")));
        }

        let others: Vec<u32> = (0..participants).filter(|&i| i != creator).collect();
        let prefix_hash = ptx.tx.prefix_hash();
        let mut candidates = Vec::new();
        for excluded in combinations(&others, (participants - threshold) as usize) {
            let excluded: BTreeSet<u32> = excluded.into_iter().collect();
            let tx = candidate_tx(ptx, keys, &excluded)?;
            if tx.prefix_hash() != prefix_hash {
                return Err(WalletError::Internal("multisig candidates have different prefixes".into()));
            }
            candidates.push(MultisigCandidate {
                excluded,
                signers: BTreeSet::from([creator]),
                tx,
            });
        }
        debug!(threshold, participants, candidates = candidates.len(), "built multisig candidate set");
        Ok(Self {
            threshold,
            participants,
            prefix_hash,
            candidates,
        })
    }

    pub fn candidates(&self) -> &[MultisigCandidate] {
        &self.candidates
    }

    pub fn candidate_count(&self) -> usize {
        self.candidates.len()
    }

    pub fn prefix_hash(&self) -> [u8; 32] {
        self.prefix_hash
    }

    /// Add `signer`'s signature, dropping candidates built without them.
    pub fn sign(&mut self, signer: u32) -> Result<(), WalletError> {
        if signer >= self.participants {
            return Err(WalletError::Multisig(format!("signer {signer} is not a participant")));
        }
        if self.candidates.iter().any(|c| c.signers.contains(&signer)) {
            return Err(WalletError::Multisig(format!("signer {signer} already signed")));
        }
        if self.candidates.iter().all(|c| c.excluded.contains(&signer)) {
            return Err(WalletError::Multisig(format!("no candidate includes signer {signer}")));
        }
        self.candidates.retain(|c| !c.excluded.contains(&signer));
        for c in &mut self.candidates {
            c.signers.insert(signer);
        }
        Ok(())
    }

    pub fn signature_count(&self) -> usize {
        self.candidates.first().map_or(0, |c| c.signers.len())
    }

    pub fn is_complete(&self) -> bool {
        self.signature_count() >= self.threshold as usize
    }

    /// The one transaction whose signer set is complete.
    pub fn finalize(self) -> Result<Transaction, WalletError> {
        let have = self.signature_count();
        if have < self.threshold as usize {
            return Err(WalletError::Multisig(format!(
                "need {} signatures, have {have}",
                self.threshold
            )));
        }
        let mut complete = self.candidates.into_iter().filter(|c| {
            (0..self.participants).all(|i| c.excluded.contains(&i) != c.signers.contains(&i))
        });
        match (complete.next(), complete.next()) {
            (Some(c), None) => Ok(c.tx),
            _ => Err(WalletError::Internal("multisig set does not resolve to one candidate".into())),
        }
    }
}
