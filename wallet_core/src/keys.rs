//! Account keys and addresses.

use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use std::fmt;
use umbra_crypto::{
    derive_view_secret, generate_keys, keys_from_seed, secret_to_public, subaddress_secret_key,
    subaddress_spend_public_key, subaddress_view_public_key, sum_secrets,
};
use umbra_types::{PublicKey, SecretKey, SubaddressIndex};

use crate::error::WalletError;

/// The spend and view key pairs of one wallet.
///
/// The view secret is always derived from the spend secret, so the spend
/// secret alone restores the account.
#[derive(Clone)]
pub struct AccountKeys {
    pub spend_secret: SecretKey,
    pub view_secret: SecretKey,
    pub spend_public: PublicKey,
    pub view_public: PublicKey,
}

/// A public address: where outputs can be sent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    pub spend_public: PublicKey,
    pub view_public: PublicKey,
    pub is_subaddress: bool,
}

impl AccountKeys {
    pub fn from_spend_secret(spend_secret: SecretKey) -> Self {
        let view_secret = derive_view_secret(&spend_secret);
        Self {
            spend_public: secret_to_public(&spend_secret),
            view_public: secret_to_public(&view_secret),
            spend_secret,
            view_secret,
        }
    }

    /// Deterministic account from 32 bytes of seed material.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self::from_spend_secret(keys_from_seed(seed).secret)
    }

    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self::from_spend_secret(generate_keys(rng).secret)
    }

    /// The primary address `(0, 0)`.
    pub fn address(&self) -> Address {
        Address {
            spend_public: self.spend_public,
            view_public: self.view_public,
            is_subaddress: false,
        }
    }

    pub fn subaddress(&self, index: SubaddressIndex) -> Result<Address, WalletError> {
        if index.is_primary() {
            return Ok(self.address());
        }
        let spend_public = subaddress_spend_public_key(&self.spend_public, &self.view_secret, index)?;
        let view_public = subaddress_view_public_key(&spend_public, &self.view_secret)?;
        Ok(Address {
            spend_public,
            view_public,
            is_subaddress: true,
        })
    }

    /// Spend secret for outputs received on `index`: `b + m`.
    pub fn subaddress_spend_secret(&self, index: SubaddressIndex) -> SecretKey {
        if index.is_primary() {
            return self.spend_secret.clone();
        }
        sum_secrets(&[
            self.spend_secret.clone(),
            subaddress_secret_key(&self.view_secret, index),
        ])
    }
}

impl fmt::Debug for AccountKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountKeys")
            .field("spend_public", &self.spend_public)
            .field("view_public", &self.view_public)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.spend_public, self.view_public)
    }
}
