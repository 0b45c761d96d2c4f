//! Per-network consensus parameters.

use crate::deployments::{
    Bip9Deployment, DEPLOYMENT_CHECKLOCKTIMEVERIFY, DEPLOYMENT_DEPRECATE_MASTERNODES, NO_TIMEOUT,
};
use crate::money::{Amount, COIN};
use crate::Hash256;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "main" | "mainnet" => Some(Network::Mainnet),
            "test" | "testnet" => Some(Network::Testnet),
            "regtest" => Some(Network::Regtest),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Regtest => "regtest",
        }
    }

    /// Subdirectory of the data dir used for this network's stores.
    pub fn data_subdir(self) -> Option<&'static str> {
        match self {
            Network::Mainnet => None,
            Network::Testnet => Some("testnet3"),
            Network::Regtest => Some("regtest"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ConsensusParams {
    pub network: Network,
    /// `None` accepts any parentless block as genesis.
    pub hash_genesis_block: Option<Hash256>,
    pub pow_limit: Hash256,
    /// Target ceiling once blocks switch to proof of stake.
    pub pos_limit: Hash256,
    pub pow_target_spacing: i64,
    pub retarget_difficulty: bool,
    /// Confirmations required before coinbase or coinstake outputs may be spent.
    pub coinbase_maturity: i32,
    pub max_money_out: Amount,
    pub premine: Amount,
    pub subsidy_halving_interval: i32,
    pub last_pow_block: i32,
    pub lottery_start_block: i32,
    pub lottery_cycle: i32,
    pub treasury_start_block: i32,
    pub treasury_cycle: i32,
    pub deployments: Vec<Bip9Deployment>,
}

impl ConsensusParams {
    pub fn is_lottery_block(&self, height: i32) -> bool {
        height >= self.lottery_start_block
            && self.lottery_cycle > 0
            && (height - self.lottery_start_block) % self.lottery_cycle == 0
    }

    pub fn is_treasury_block(&self, height: i32) -> bool {
        height >= self.treasury_start_block
            && self.treasury_cycle > 0
            && (height - self.treasury_start_block) % self.treasury_cycle == 0
    }

    pub fn deployment(&self, name: &str) -> Option<&Bip9Deployment> {
        self.deployments
            .iter()
            .find(|deployment| deployment.name == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HexError {
    InvalidLength,
    InvalidHex,
}

impl std::fmt::Display for HexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HexError::InvalidLength => write!(f, "hash hex must be 1..=64 digits"),
            HexError::InvalidHex => write!(f, "hash contains non-hex characters"),
        }
    }
}

impl std::error::Error for HexError {}

/// Parses a display-order (big-endian) hex hash into internal byte order.
/// Short inputs are left-padded with zeros.
pub fn hash256_from_hex(input: &str) -> Result<Hash256, HexError> {
    let mut hex = input.trim();
    if let Some(stripped) = hex.strip_prefix("0x").or_else(|| hex.strip_prefix("0X")) {
        hex = stripped;
    }
    if hex.is_empty() || hex.len() > 64 {
        return Err(HexError::InvalidLength);
    }

    let padded = format!("{hex:0>64}");
    let mut bytes = [0u8; 32];
    for (i, byte_out) in bytes.iter_mut().enumerate() {
        let digits = padded
            .get(i * 2..i * 2 + 2)
            .ok_or(HexError::InvalidHex)?;
        *byte_out = u8::from_str_radix(digits, 16).map_err(|_| HexError::InvalidHex)?;
    }
    bytes.reverse();
    Ok(bytes)
}

pub fn hash256_to_hex(hash: &Hash256) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(64);
    for byte in hash.iter().rev() {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

pub fn consensus_params(network: Network) -> ConsensusParams {
    match network {
        Network::Mainnet => mainnet_consensus_params(),
        Network::Testnet => testnet_consensus_params(),
        Network::Regtest => regtest_consensus_params(),
    }
}

/// `~0 >> shift` as a little-endian hash.
fn limit_shifted(shift: u32) -> Hash256 {
    let mut out = [0xffu8; 32];
    let full = (shift / 8) as usize;
    for byte in out.iter_mut().rev().take(full) {
        *byte = 0;
    }
    let rem = shift % 8;
    if rem != 0 && full < 32 {
        out[31 - full] = 0xff >> rem;
    }
    out
}

fn mainnet_consensus_params() -> ConsensusParams {
    ConsensusParams {
        network: Network::Mainnet,
        hash_genesis_block: Some(
            hash256_from_hex("00000e258596876664989374c7ee36445cf5f4f80889af415cc32478214394ea")
                .expect("mainnet genesis hash"),
        ),
        pow_limit: limit_shifted(20),
        pos_limit: limit_shifted(24),
        pow_target_spacing: 60,
        retarget_difficulty: true,
        coinbase_maturity: 20,
        max_money_out: 2_534_320_700 * COIN,
        premine: 617_222_416 * COIN,
        subsidy_halving_interval: 60 * 24 * 365,
        last_pow_block: 100,
        lottery_start_block: 101,
        lottery_cycle: 60 * 24 * 7,
        treasury_start_block: 101,
        treasury_cycle: 60 * 24 * 7 + 1,
        deployments: vec![
            Bip9Deployment::new(DEPLOYMENT_CHECKLOCKTIMEVERIFY, 0, 2_000_000_000, NO_TIMEOUT, 10_080, 9_576),
            Bip9Deployment::new(DEPLOYMENT_DEPRECATE_MASTERNODES, 1, 2_000_000_000, NO_TIMEOUT, 10_080, 9_576),
        ],
    }
}

fn testnet_consensus_params() -> ConsensusParams {
    ConsensusParams {
        network: Network::Testnet,
        hash_genesis_block: None,
        pow_limit: limit_shifted(20),
        pos_limit: limit_shifted(24),
        pow_target_spacing: 60,
        retarget_difficulty: true,
        coinbase_maturity: 1,
        max_money_out: 2_535_000_000 * COIN,
        premine: 617_222_416 * COIN,
        subsidy_halving_interval: 1000,
        last_pow_block: 100,
        lottery_start_block: 101,
        lottery_cycle: 200,
        treasury_start_block: 102,
        treasury_cycle: 201,
        deployments: vec![
            Bip9Deployment::new(DEPLOYMENT_CHECKLOCKTIMEVERIFY, 0, 1_700_000_000, NO_TIMEOUT, 200, 150),
            Bip9Deployment::new(DEPLOYMENT_DEPRECATE_MASTERNODES, 1, 1_700_000_000, NO_TIMEOUT, 200, 150),
        ],
    }
}

fn regtest_consensus_params() -> ConsensusParams {
    ConsensusParams {
        network: Network::Regtest,
        hash_genesis_block: None,
        pow_limit: limit_shifted(1),
        pos_limit: limit_shifted(1),
        pow_target_spacing: 60,
        retarget_difficulty: false,
        coinbase_maturity: 1,
        max_money_out: 2_535_000_000 * COIN,
        premine: 1_250 * COIN,
        subsidy_halving_interval: 100,
        last_pow_block: 100,
        lottery_start_block: 100,
        lottery_cycle: 10,
        treasury_start_block: 100,
        treasury_cycle: 50,
        deployments: vec![Bip9Deployment::new("testdummy", 28, 0, NO_TIMEOUT, 144, 108)],
    }
}
