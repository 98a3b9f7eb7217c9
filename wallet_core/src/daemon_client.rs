//! Blocking JSON-RPC client for a daemon.
//!
//! Every call posts `{jsonrpc, id, method, params}` to `<base>/json_rpc`.
//! Blocks and transactions travel as hex-encoded bincode blobs. The HTTP
//! handle sits behind a reentrant mutex held for one round trip, so all
//! daemon requests from a wallet are serialized.

use parking_lot::ReentrantMutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, trace};
use umbra_types::{BlockHash, KeyImage, Transaction, TxHash};

use crate::config::WalletConfig;
use crate::daemon::{
    BlockEntry, BlockSource, BlocksResponse, ConsensusOracle, FeeEstimate, HashesResponse,
    HistogramEntry, KeyImageStatus, OutputDistribution, OutputInfo, OutputRequest, PoolTx,
};
use crate::error::{DaemonError, WalletError};

const STATUS_OK: &str = "OK";
const STATUS_BUSY: &str = "BUSY";

pub struct DaemonClient {
    http: ReentrantMutex<reqwest::blocking::Client>,
    rpc_url: String,
    next_id: AtomicU64,
}

impl DaemonClient {
    /// Create a client targeting `base_url` (e.g. `http://127.0.0.1:18081`).
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, WalletError> {
        let http = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(10)))
            .build()
            .map_err(|e| WalletError::Config(format!("failed to build HTTP client: {e}")))?;
        let base = base_url.into();
        Ok(Self {
            http: ReentrantMutex::new(http),
            rpc_url: format!("{}/json_rpc", base.trim_end_matches('/')),
            next_id: AtomicU64::new(0),
        })
    }

    pub fn from_config(config: &WalletConfig) -> Result<Self, WalletError> {
        Self::new(
            config.daemon_address.clone(),
            Duration::from_secs(config.daemon_timeout_secs),
        )
    }

    pub fn rpc_url(&self) -> &str {
        &self.rpc_url
    }

    /// Send one JSON-RPC request and decode its `result`.
    fn rpc_call<P: Serialize, R: DeserializeOwned>(
        &self,
        method: &str,
        params: P,
    ) -> Result<R, DaemonError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        trace!(method, id, "daemon request");

        let json: serde_json::Value = {
            let http = self.http.lock();
            let response = http
                .post(&self.rpc_url)
                .json(&body)
                .send()
                .map_err(|e| DaemonError::ConnectionFailed(format!("{method}: {e}")))?;
            if !response.status().is_success() {
                return Err(DaemonError::ConnectionFailed(format!(
                    "{method}: daemon returned HTTP {}",
                    response.status()
                )));
            }
            response
                .json()
                .map_err(|e| DaemonError::Malformed(format!("{method}: invalid JSON: {e}")))?
        };

        if let Some(err) = json.get("error") {
            let message = err
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown error");
            return Err(DaemonError::Malformed(format!("{method}: {message}")));
        }
        let result = json
            .get("result")
            .cloned()
            .ok_or_else(|| DaemonError::Malformed(format!("{method}: missing result")))?;

        match result.get("status").and_then(|s| s.as_str()) {
            None | Some(STATUS_OK) => {}
            Some(STATUS_BUSY) => return Err(DaemonError::Busy),
            Some(other) => {
                let reason = result
                    .get("reason")
                    .and_then(|r| r.as_str())
                    .filter(|r| !r.is_empty())
                    .unwrap_or(other);
                debug!(method, status = other, "daemon refused request");
                return Err(DaemonError::Rejected {
                    reason: reason.to_string(),
                });
            }
        }

        serde_json::from_value(result)
            .map_err(|e| DaemonError::Malformed(format!("{method}: unexpected result: {e}")))
    }
}

// ── Wire types ──────────────────────────────────────────────────────────

#[derive(Serialize)]
struct ChainRequest {
    start_height: u64,
    block_ids: Vec<String>,
}

#[derive(Deserialize)]
struct GetBlocksResult {
    start_height: u64,
    current_height: u64,
    blocks: Vec<String>,
    output_indices: Vec<Vec<Vec<u64>>>,
}

#[derive(Deserialize)]
struct GetHashesResult {
    start_height: u64,
    current_height: u64,
    block_ids: Vec<String>,
}

#[derive(Deserialize)]
struct HeightResult {
    height: u64,
}

#[derive(Serialize)]
struct HistogramRequest<'a> {
    amounts: &'a [u64],
    min_count: u64,
    max_count: u64,
    unlocked: bool,
    recent_cutoff: u64,
}

#[derive(Deserialize)]
struct HistogramResult {
    histogram: Vec<HistogramEntry>,
}

#[derive(Deserialize)]
struct DistributionResult {
    distribution: OutputDistribution,
}

#[derive(Deserialize)]
struct OutsResult {
    outs: Vec<OutputInfo>,
}

#[derive(Deserialize)]
struct SpentResult {
    spent_status: Vec<u8>,
}

#[derive(Deserialize)]
struct PoolHashesResult {
    tx_hashes: Vec<String>,
}

#[derive(Deserialize)]
struct PoolTxWire {
    txid: String,
    blob: String,
    double_spend_seen: bool,
}

#[derive(Deserialize)]
struct PoolTxsResult {
    transactions: Vec<PoolTxWire>,
}

#[derive(Deserialize)]
struct LimitResult {
    limit: u64,
}

#[derive(Deserialize)]
struct WeightsResult {
    weights: Vec<u64>,
}

#[derive(Deserialize)]
struct BacklogResult {
    backlog: Vec<u64>,
}

#[derive(Deserialize)]
struct FeeResult {
    fee: u64,
    quantization_mask: u64,
}

#[derive(Deserialize)]
struct VersionResult {
    version: u8,
}

#[derive(Deserialize)]
struct EarliestResult {
    earliest_height: Option<u64>,
}

#[derive(Deserialize)]
struct Empty {}

// ── Blob helpers ────────────────────────────────────────────────────────

fn history_hex(history: &[BlockHash]) -> Vec<String> {
    history.iter().map(|h| h.to_string()).collect()
}

fn parse_block_hash(s: &str) -> Result<BlockHash, DaemonError> {
    BlockHash::from_hex(s).ok_or_else(|| DaemonError::Malformed(format!("bad block hash {s}")))
}

fn parse_tx_hash(s: &str) -> Result<TxHash, DaemonError> {
    TxHash::from_hex(s).ok_or_else(|| DaemonError::Malformed(format!("bad tx hash {s}")))
}

fn decode_block_entry(s: &str) -> Result<BlockEntry, DaemonError> {
    let bytes = hex::decode(s).map_err(|e| DaemonError::Malformed(format!("block blob: {e}")))?;
    bincode::deserialize(&bytes).map_err(|e| DaemonError::Malformed(format!("block blob: {e}")))
}

fn decode_tx(s: &str) -> Result<Transaction, DaemonError> {
    let bytes = hex::decode(s).map_err(|e| DaemonError::Malformed(format!("tx blob: {e}")))?;
    Transaction::from_blob(&bytes).map_err(|e| DaemonError::Malformed(format!("tx blob: {e}")))
}

fn expect_len(what: &str, got: usize, want: usize) -> Result<(), DaemonError> {
    if got != want {
        return Err(DaemonError::Malformed(format!(
            "{what}: expected {want} entries, got {got}"
        )));
    }
    Ok(())
}

pub(crate) fn parse_spent_status(raw: &[u8]) -> Result<Vec<KeyImageStatus>, DaemonError> {
    raw.iter()
        .map(|s| match s {
            0 => Ok(KeyImageStatus::Unspent),
            1 => Ok(KeyImageStatus::SpentInChain),
            2 => Ok(KeyImageStatus::SpentInPool),
            other => Err(DaemonError::Malformed(format!("unknown spent status {other}"))),
        })
        .collect()
}

/// Check the per-block output index lists line up with the blocks.
pub(crate) fn check_blocks_shape(resp: &BlocksResponse) -> Result<(), DaemonError> {
    expect_len("output_indices", resp.output_indices.len(), resp.blocks.len())?;
    for (entry, indices) in resp.blocks.iter().zip(&resp.output_indices) {
        expect_len("per-block output_indices", indices.len(), entry.txs.len() + 1)?;
        let miner_outs = entry.block.miner_tx.prefix.outputs.len();
        expect_len("miner tx output_indices", indices[0].len(), miner_outs)?;
        for (tx, tx_indices) in entry.txs.iter().zip(&indices[1..]) {
            expect_len("tx output_indices", tx_indices.len(), tx.prefix.outputs.len())?;
        }
    }
    Ok(())
}

// ── Trait implementations ───────────────────────────────────────────────

impl BlockSource for DaemonClient {
    fn get_height(&self) -> Result<u64, DaemonError> {
        let r: HeightResult = self.rpc_call("get_height", serde_json::json!({}))?;
        Ok(r.height)
    }

    fn get_blocks(
        &self,
        start_height: u64,
        short_history: &[BlockHash],
    ) -> Result<BlocksResponse, DaemonError> {
        let r: GetBlocksResult = self.rpc_call(
            "get_blocks",
            ChainRequest {
                start_height,
                block_ids: history_hex(short_history),
            },
        )?;
        let blocks = r
            .blocks
            .iter()
            .map(|b| decode_block_entry(b))
            .collect::<Result<Vec<_>, _>>()?;
        let resp = BlocksResponse {
            start_height: r.start_height,
            current_height: r.current_height,
            blocks,
            output_indices: r.output_indices,
        };
        check_blocks_shape(&resp)?;
        Ok(resp)
    }

    fn get_hashes(
        &self,
        start_height: u64,
        short_history: &[BlockHash],
    ) -> Result<HashesResponse, DaemonError> {
        let r: GetHashesResult = self.rpc_call(
            "get_hashes",
            ChainRequest {
                start_height,
                block_ids: history_hex(short_history),
            },
        )?;
        let hashes = r
            .block_ids
            .iter()
            .map(|h| parse_block_hash(h))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(HashesResponse {
            start_height: r.start_height,
            current_height: r.current_height,
            hashes,
        })
    }

    fn get_output_histogram(
        &self,
        amounts: &[u64],
        min_count: u64,
        max_count: u64,
        unlocked: bool,
        recent_cutoff: u64,
    ) -> Result<Vec<HistogramEntry>, DaemonError> {
        let r: HistogramResult = self.rpc_call(
            "get_output_histogram",
            HistogramRequest {
                amounts,
                min_count,
                max_count,
                unlocked,
                recent_cutoff,
            },
        )?;
        Ok(r.histogram)
    }

    fn get_output_distribution(
        &self,
        amount: u64,
        from_height: u64,
    ) -> Result<OutputDistribution, DaemonError> {
        let r: DistributionResult = self.rpc_call(
            "get_output_distribution",
            serde_json::json!({ "amount": amount, "from_height": from_height, "cumulative": true }),
        )?;
        Ok(r.distribution)
    }

    fn get_outputs(&self, requests: &[OutputRequest]) -> Result<Vec<OutputInfo>, DaemonError> {
        let r: OutsResult =
            self.rpc_call("get_outs", serde_json::json!({ "outputs": requests }))?;
        expect_len("get_outs", r.outs.len(), requests.len())?;
        Ok(r.outs)
    }

    fn is_key_image_spent(&self, key_images: &[KeyImage]) -> Result<Vec<KeyImageStatus>, DaemonError> {
        let hexes: Vec<String> = key_images.iter().map(|k| k.to_string()).collect();
        let r: SpentResult = self.rpc_call(
            "is_key_image_spent",
            serde_json::json!({ "key_images": hexes }),
        )?;
        expect_len("is_key_image_spent", r.spent_status.len(), key_images.len())?;
        parse_spent_status(&r.spent_status)
    }

    fn send_raw_tx(&self, blob: &[u8]) -> Result<(), DaemonError> {
        let _: Empty = self.rpc_call(
            "send_raw_transaction",
            serde_json::json!({ "tx_as_hex": hex::encode(blob) }),
        )?;
        Ok(())
    }

    fn get_transaction_pool_hashes(&self) -> Result<Vec<TxHash>, DaemonError> {
        let r: PoolHashesResult =
            self.rpc_call("get_transaction_pool_hashes", serde_json::json!({}))?;
        r.tx_hashes.iter().map(|h| parse_tx_hash(h)).collect()
    }

    fn get_pool_transactions(&self, txids: &[TxHash]) -> Result<Vec<PoolTx>, DaemonError> {
        let hexes: Vec<String> = txids.iter().map(|t| t.to_string()).collect();
        let r: PoolTxsResult = self.rpc_call(
            "get_transaction_pool",
            serde_json::json!({ "txids": hexes }),
        )?;
        r.transactions
            .iter()
            .map(|w| {
                Ok(PoolTx {
                    txid: parse_tx_hash(&w.txid)?,
                    tx: decode_tx(&w.blob)?,
                    double_spend_seen: w.double_spend_seen,
                })
            })
            .collect()
    }

    fn get_block_weight_limit(&self) -> Result<u64, DaemonError> {
        let r: LimitResult = self.rpc_call("get_block_weight_limit", serde_json::json!({}))?;
        Ok(r.limit)
    }

    fn get_recent_block_weights(&self, count: u64) -> Result<Vec<u64>, DaemonError> {
        let r: WeightsResult = self.rpc_call(
            "get_recent_block_weights",
            serde_json::json!({ "count": count }),
        )?;
        Ok(r.weights)
    }

    fn estimate_backlog(&self, fee_levels: &[u64]) -> Result<Vec<u64>, DaemonError> {
        let r: BacklogResult = self.rpc_call(
            "estimate_backlog",
            serde_json::json!({ "fee_levels": fee_levels }),
        )?;
        expect_len("estimate_backlog", r.backlog.len(), fee_levels.len())?;
        Ok(r.backlog)
    }

    fn get_fee_estimate(&self) -> Result<FeeEstimate, DaemonError> {
        let r: FeeResult = self.rpc_call("get_fee_estimate", serde_json::json!({}))?;
        Ok(FeeEstimate {
            base_fee: r.fee,
            quantization_mask: r.quantization_mask,
        })
    }
}

impl ConsensusOracle for DaemonClient {
    fn get_hardfork_version(&self) -> Result<u8, DaemonError> {
        let r: VersionResult = self.rpc_call("hard_fork_info", serde_json::json!({}))?;
        Ok(r.version)
    }

    fn get_earliest_height(&self, version: u8) -> Result<Option<u64>, DaemonError> {
        let r: EarliestResult = self.rpc_call(
            "hard_fork_info",
            serde_json::json!({ "version": version }),
        )?;
        Ok(r.earliest_height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unreachable_daemon_is_connection_failure() {
        let client = DaemonClient::new("http://127.0.0.1:1", Duration::from_secs(2)).unwrap();
        let err = client.get_height().unwrap_err();
        assert!(matches!(err, DaemonError::ConnectionFailed(_)), "{err:?}");
        assert!(err.is_retryable());
    }

    #[test]
    fn rpc_url_is_normalised() {
        let client = DaemonClient::new("http://localhost:38081/", Duration::from_secs(1)).unwrap();
        assert_eq!(client.rpc_url(), "http://localhost:38081/json_rpc");
    }

    #[test]
    fn spent_status_codes() {
        assert_eq!(
            parse_spent_status(&[0, 1, 2]).unwrap(),
            vec![
                KeyImageStatus::Unspent,
                KeyImageStatus::SpentInChain,
                KeyImageStatus::SpentInPool
            ]
        );
        assert!(matches!(
            parse_spent_status(&[3]).unwrap_err(),
            DaemonError::Malformed(_)
        ));
    }

    #[test]
    fn bad_hashes_are_malformed() {
        assert!(matches!(
            parse_block_hash("zz").unwrap_err(),
            DaemonError::Malformed(_)
        ));
        assert!(matches!(
            decode_tx("00ff").unwrap_err(),
            DaemonError::Malformed(_)
        ));
    }

    #[test]
    fn mismatched_index_lists_are_malformed() {
        let resp = BlocksResponse {
            start_height: 0,
            current_height: 0,
            blocks: Vec::new(),
            output_indices: vec![Vec::new()],
        };
        assert!(matches!(
            check_blocks_shape(&resp).unwrap_err(),
            DaemonError::Malformed(_)
        ));
    }
}
