//! Subaddress indices.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Position of a subaddress: `major` is the account, `minor` the address
/// within it. `(0, 0)` is the primary address.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct SubaddressIndex {
    pub major: u32,
    pub minor: u32,
}

impl SubaddressIndex {
    pub const PRIMARY: Self = Self { major: 0, minor: 0 };

    pub fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    pub fn is_primary(&self) -> bool {
        self.major == 0 && self.minor == 0
    }
}

impl fmt::Display for SubaddressIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.major, self.minor)
    }
}
