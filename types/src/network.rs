//! Network identifier.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Identifies which Umbra network a node or wallet talks to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkId {
    /// The production network.
    #[default]
    Mainnet,
    /// The public test network.
    Testnet,
    /// Local development network with compressed fork heights.
    Dev,
}

impl NetworkId {
    /// Default daemon RPC port for this network.
    pub fn default_rpc_port(&self) -> u16 {
        match self {
            Self::Mainnet => 18081,
            Self::Testnet => 28081,
            Self::Dev => 38081,
        }
    }

    /// Human-readable name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mainnet => "mainnet",
            Self::Testnet => "testnet",
            Self::Dev => "dev",
        }
    }
}

impl FromStr for NetworkId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mainnet" => Ok(Self::Mainnet),
            "testnet" => Ok(Self::Testnet),
            "dev" => Ok(Self::Dev),
            other => Err(format!("unknown network: {other}")),
        }
    }
}
