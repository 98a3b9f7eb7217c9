//! Transaction data model.
//!
//! Inputs and output targets are closed sum types; every consumer matches
//! them exhaustively so a new variant is a compile error everywhere it
//! matters.

use crate::error::UmbraError;
use crate::hash::{digest, TxHash};
use crate::keys::{KeyImage, PublicKey};
use bincode::Options;
use serde::{Deserialize, Serialize};

/// Upper bound accepted when decoding a transaction blob.
pub const MAX_TX_BLOB_SIZE: u64 = 1_000_000;

/// A transaction input.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxIn {
    /// Coinbase input, carries the height of the block that mints it.
    Gen { height: u64 },
    /// Spend of one output out of a ring. `key_offsets` are relative global
    /// output indices: the first is absolute, each later one is the gap
    /// from its predecessor.
    ToKey {
        amount: u64,
        key_offsets: Vec<u64>,
        key_image: KeyImage,
    },
}

/// Destination of an output.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxOutTarget {
    ToKey { key: PublicKey },
    /// Output key with a one-byte hint that lets scanners skip most
    /// non-matching outputs before the full derivation.
    ToTaggedKey { key: PublicKey, view_tag: u8 },
}

impl TxOutTarget {
    pub fn key(&self) -> &PublicKey {
        match self {
            Self::ToKey { key } | Self::ToTaggedKey { key, .. } => key,
        }
    }

    pub fn view_tag(&self) -> Option<u8> {
        match self {
            Self::ToKey { .. } => None,
            Self::ToTaggedKey { view_tag, .. } => Some(*view_tag),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOut {
    /// Plaintext amount; zero for confidential outputs.
    pub amount: u64,
    pub target: TxOutTarget,
}

/// Structured extra field.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxExtra {
    pub tx_pub_key: Option<PublicKey>,
    /// Per-output transaction keys, present when paying subaddresses.
    pub additional_pub_keys: Vec<PublicKey>,
    pub payment_id: Option<[u8; 8]>,
    pub nonce: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionPrefix {
    pub version: u8,
    pub unlock_time: u64,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub extra: TxExtra,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RctType {
    /// Plaintext amounts (legacy transactions and coinbase).
    #[default]
    Null,
    /// Confidential amounts with one pseudo output per input.
    Simple,
}

/// A linkable ring signature: the initial challenge plus one response per
/// ring member.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingSignature {
    pub c0: [u8; 32],
    pub responses: Vec<[u8; 32]>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RctSignatures {
    pub rct_type: RctType,
    pub fee: u64,
    pub out_commitments: Vec<PublicKey>,
    pub encrypted_amounts: Vec<[u8; 8]>,
    pub pseudo_outs: Vec<PublicKey>,
    pub ring_signatures: Vec<RingSignature>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub prefix: TransactionPrefix,
    pub rct: RctSignatures,
}

fn blob_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_limit(MAX_TX_BLOB_SIZE)
        .reject_trailing_bytes()
}

impl TransactionPrefix {
    pub fn hash(&self) -> [u8; 32] {
        digest(&[&encode(self)])
    }

    pub fn key_images(&self) -> impl Iterator<Item = &KeyImage> {
        self.inputs.iter().filter_map(|input| match input {
            TxIn::Gen { .. } => None,
            TxIn::ToKey { key_image, .. } => Some(key_image),
        })
    }
}

impl Transaction {
    pub fn prefix_hash(&self) -> [u8; 32] {
        self.prefix.hash()
    }

    /// Hash of the signature-free part of the rct section.
    pub fn rct_base_hash(&self) -> [u8; 32] {
        let rct = &self.rct;
        digest(&[
            &encode(&rct.rct_type),
            &rct.fee.to_le_bytes(),
            &encode(&rct.out_commitments),
            &encode(&rct.encrypted_amounts),
            &encode(&rct.pseudo_outs),
        ])
    }

    /// The message every ring signature in this transaction signs.
    pub fn signing_message(&self) -> [u8; 32] {
        digest(&[&self.prefix_hash(), &self.rct_base_hash()])
    }

    pub fn hash(&self) -> TxHash {
        TxHash::new(digest(&[
            &self.prefix_hash(),
            &self.rct_base_hash(),
            &encode(&self.rct.ring_signatures),
        ]))
    }

    pub fn to_blob(&self) -> Result<Vec<u8>, UmbraError> {
        Ok(blob_options().serialize(self)?)
    }

    /// Decode a blob, rejecting oversized input and trailing bytes.
    pub fn from_blob(blob: &[u8]) -> Result<Self, UmbraError> {
        if blob.len() as u64 > MAX_TX_BLOB_SIZE {
            return Err(UmbraError::InvalidData(format!(
                "transaction blob of {} bytes exceeds limit",
                blob.len()
            )));
        }
        Ok(blob_options().deserialize(blob)?)
    }

    /// Transaction weight, equal to the serialized size.
    pub fn weight(&self) -> u64 {
        blob_options().serialized_size(self).unwrap_or(u64::MAX)
    }

    pub fn is_coinbase(&self) -> bool {
        matches!(self.prefix.inputs.as_slice(), [TxIn::Gen { .. }])
    }

    /// Confidential-era transactions carry commitments for their outputs.
    pub fn is_rct(&self) -> bool {
        self.prefix.version >= 2
    }

    /// Fee paid: explicit for confidential transactions, implied by the
    /// plaintext amounts otherwise.
    pub fn fee(&self) -> u64 {
        if self.is_coinbase() {
            return 0;
        }
        match self.rct.rct_type {
            RctType::Simple => self.rct.fee,
            RctType::Null => {
                let inputs: u64 = self
                    .prefix
                    .inputs
                    .iter()
                    .map(|i| match i {
                        TxIn::Gen { .. } => 0,
                        TxIn::ToKey { amount, .. } => *amount,
                    })
                    .sum();
                let outputs: u64 = self.prefix.outputs.iter().map(|o| o.amount).sum();
                inputs.saturating_sub(outputs)
            }
        }
    }
}

/// Serialize plain in-memory data for hashing. Writing into a `Vec`
/// cannot fail for these types.
fn encode<T: Serialize + ?Sized>(value: &T) -> Vec<u8> {
    bincode::serialize(value).unwrap_or_default()
}

/// Convert absolute global output indices into the relative form stored in inputs.
pub fn absolute_to_relative(offsets: &[u64]) -> Vec<u64> {
    let mut relative = Vec::with_capacity(offsets.len());
    let mut prev = 0u64;
    for (i, &offset) in offsets.iter().enumerate() {
        relative.push(if i == 0 { offset } else { offset - prev });
        prev = offset;
    }
    relative
}

/// Inverse of [`absolute_to_relative`].
pub fn relative_to_absolute(offsets: &[u64]) -> Vec<u64> {
    let mut absolute = Vec::with_capacity(offsets.len());
    let mut acc = 0u64;
    for &offset in offsets {
        acc = acc.saturating_add(offset);
        absolute.push(acc);
    }
    absolute
}
