//! Subaddress lookup table.
//!
//! Maps derived subaddress spend keys back to their `(major, minor)` index.
//! The table always covers a lookahead window past the highest index seen
//! in use, so outputs to not-yet-handed-out subaddresses are still found.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use umbra_crypto::subaddress_spend_public_key;
use umbra_types::{PublicKey, SubaddressIndex};

use crate::error::WalletError;
use crate::keys::AccountKeys;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubaddressTable {
    map: HashMap<PublicKey, SubaddressIndex>,
    /// Number of minor indices generated per major index.
    extents: Vec<u32>,
    lookahead_major: u32,
    lookahead_minor: u32,
}

impl SubaddressTable {
    pub fn new(
        keys: &AccountKeys,
        lookahead_major: u32,
        lookahead_minor: u32,
    ) -> Result<Self, WalletError> {
        let mut table = Self {
            map: HashMap::new(),
            extents: Vec::new(),
            lookahead_major: lookahead_major.max(1),
            lookahead_minor: lookahead_minor.max(1),
        };
        table.expand(keys, SubaddressIndex::PRIMARY)?;
        Ok(table)
    }

    pub fn lookup(&self, spend_public: &PublicKey) -> Option<SubaddressIndex> {
        self.map.get(spend_public).copied()
    }

    /// Make sure the window past `used` is generated. Returns how many keys
    /// were added.
    pub fn expand(&mut self, keys: &AccountKeys, used: SubaddressIndex) -> Result<usize, WalletError> {
        let majors = used.major.saturating_add(self.lookahead_major);
        let before = self.map.len();
        for major in 0..majors {
            let wanted = if major == used.major {
                used.minor.saturating_add(self.lookahead_minor)
            } else {
                self.lookahead_minor
            };
            self.generate(keys, major, wanted)?;
        }
        Ok(self.map.len() - before)
    }

    fn generate(&mut self, keys: &AccountKeys, major: u32, minors: u32) -> Result<(), WalletError> {
        let major_idx = major as usize;
        if self.extents.len() <= major_idx {
            self.extents.resize(major_idx + 1, 0);
        }
        let have = self.extents[major_idx];
        for minor in have..minors {
            let index = SubaddressIndex::new(major, minor);
            let spend = subaddress_spend_public_key(&keys.spend_public, &keys.view_secret, index)?;
            self.map.insert(spend, index);
        }
        self.extents[major_idx] = have.max(minors);
        Ok(())
    }

    /// Minor indices generated for `major`.
    pub fn extent(&self, major: u32) -> u32 {
        self.extents.get(major as usize).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
