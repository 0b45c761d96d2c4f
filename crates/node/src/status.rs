//! JSON chain-state summary printed by `--status`.

use divid_chainstate::metrics::ConnectMetricsSnapshot;
use divid_chainstate::ChainState;
use divid_consensus::hash256_to_hex;
use divid_consensus::money::COIN;
use divid_storage::KeyValueStore;
use primitive_types::U256;
use serde::Serialize;

#[derive(Clone, Debug, Serialize)]
pub struct DeploymentReport {
    pub name: String,
    pub bit: u8,
    pub state: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signalling: Option<SignallingReport>,
}

#[derive(Clone, Debug, Serialize)]
pub struct SignallingReport {
    pub period: u32,
    pub threshold: u32,
    pub elapsed: u32,
    pub count: u32,
    pub possible: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct IndexReport {
    pub txindex: bool,
    pub addressindex: bool,
    pub spentindex: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct MetricsReport {
    pub connect_blocks: u64,
    pub connect_ms: u64,
    pub disconnect_blocks: u64,
    pub disconnect_ms: u64,
    pub script_checks: u64,
    pub script_ms: u64,
    pub undo_bytes: u64,
    pub flushes: u64,
}

impl From<ConnectMetricsSnapshot> for MetricsReport {
    fn from(snapshot: ConnectMetricsSnapshot) -> Self {
        Self {
            connect_blocks: snapshot.connect_blocks,
            connect_ms: snapshot.connect_us / 1000,
            disconnect_blocks: snapshot.disconnect_blocks,
            disconnect_ms: snapshot.disconnect_us / 1000,
            script_checks: snapshot.script_checks,
            script_ms: snapshot.script_us / 1000,
            undo_bytes: snapshot.undo_bytes,
            flushes: snapshot.flushes,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct NodeStatus {
    pub network: &'static str,
    pub height: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub best_block: Option<String>,
    pub chain_work: String,
    pub money_supply: String,
    pub known_blocks: usize,
    pub coins_cache_entries: usize,
    pub next_block_version: String,
    pub indexes: IndexReport,
    pub deployments: Vec<DeploymentReport>,
    pub metrics: MetricsReport,
}

impl NodeStatus {
    pub fn collect<S: KeyValueStore + Clone>(state: &ChainState<S>) -> Self {
        let tip = state.tip();
        let indexing = state.indexing();
        let deployments = state
            .versionbits()
            .deployments()
            .iter()
            .map(|deployment| DeploymentReport {
                name: deployment.name.clone(),
                bit: deployment.bit,
                state: state
                    .deployment_state(&deployment.name)
                    .map_or("unknown", |state| state.as_str()),
                signalling: state
                    .signalling_stats(&deployment.name)
                    .map(|stats| SignallingReport {
                        period: stats.period,
                        threshold: stats.threshold,
                        elapsed: stats.elapsed,
                        count: stats.count,
                        possible: stats.possible,
                    }),
            })
            .collect();
        Self {
            network: state.params().network.as_str(),
            height: state.height(),
            best_block: tip.as_ref().map(|tip| hash256_to_hex(&tip.hash)),
            chain_work: format_work(tip.as_ref().map_or(U256::zero(), |tip| tip.chain_work)),
            money_supply: format_amount(tip.as_ref().map_or(0, |tip| tip.money_supply)),
            known_blocks: state.graph().len(),
            coins_cache_entries: state.coins_cache_size(),
            next_block_version: format!("{:#010x}", state.next_block_version()),
            indexes: IndexReport {
                txindex: indexing.tx_index,
                addressindex: indexing.address_index,
                spentindex: indexing.spent_index,
            },
            deployments,
            metrics: state.metrics().snapshot().into(),
        }
    }

    pub fn to_json(&self) -> Result<String, String> {
        serde_json::to_string_pretty(self).map_err(|err| err.to_string())
    }
}

fn format_work(work: U256) -> String {
    format!("{work:#x}")
}

pub fn format_amount(amount: i64) -> String {
    let sign = if amount < 0 { "-" } else { "" };
    let abs = amount.unsigned_abs();
    let coin = COIN as u64;
    format!("{sign}{}.{:08}", abs / coin, abs % coin)
}
