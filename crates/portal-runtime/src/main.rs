//! # Portal Runtime
//!
//! Replays beacon blocks through the Portal engine.
//!
//! ## Input
//!
//! A JSON array of blocks, each `{"beacon_height": n, "records": [[...]]}`
//! where a record is `[metadata type, shard id, status, payload]`.
//!
//! ## Output
//!
//! One JSON line per block on stdout with the emitted instruction records and
//! the net bridge token movement. Logs go to stderr.
//!
//! ## Environment
//!
//! - `QC_PORTAL_BLOCKS`: path of the blocks file (required)
//! - `QC_PORTAL_PARAMS`: path of a JSON `PortalParams` file (optional)
//! - `QC_LOG_LEVEL` / `RUST_LOG`, `QC_JSON_LOGS`: see `telemetry`

mod telemetry;

use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use qc_15_portal::ports::ProofClaim;
use qc_15_portal::{
    BlockIntervalClock, BlockResult, InMemoryPortalStore, PortalApi, PortalError, PortalParams,
    PortalService, ProofVerifier, TracingLogger,
};

use crate::telemetry::TelemetryConfig;

/// Runtime configuration.
#[derive(Debug, Clone, Default)]
struct RuntimeConfig {
    blocks_path: Option<PathBuf>,
    params_path: Option<PathBuf>,
}

fn load_config() -> RuntimeConfig {
    RuntimeConfig {
        blocks_path: std::env::var("QC_PORTAL_BLOCKS").ok().map(PathBuf::from),
        params_path: std::env::var("QC_PORTAL_PARAMS").ok().map(PathBuf::from),
    }
}

/// One beacon block of input.
#[derive(Debug, Clone, Deserialize)]
struct BlockInput {
    beacon_height: u64,
    #[serde(default)]
    records: Vec<Vec<String>>,
}

/// One beacon block of output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct BlockOutput {
    beacon_height: u64,
    instructions: Vec<Vec<String>>,
    bridge_deltas: BTreeMap<String, (char, u64)>,
}

impl From<BlockResult> for BlockOutput {
    fn from(result: BlockResult) -> Self {
        Self {
            beacon_height: result.beacon_height,
            instructions: result.records(),
            bridge_deltas: result
                .bridge_deltas
                .iter()
                .map(|(token, delta)| (token.clone(), delta.net()))
                .collect(),
        }
    }
}

/// Accepts every proof. Replayed blocks carry proofs already checked by the
/// shards that produced them.
struct TrustedProofVerifier;

impl ProofVerifier for TrustedProofVerifier {
    fn verify(&self, _claim: &ProofClaim) -> Result<bool, PortalError> {
        Ok(true)
    }
}

fn load_params(config: &RuntimeConfig) -> Result<PortalParams> {
    match &config.params_path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading params {}", path.display()))?;
            let params = serde_json::from_str(&raw)
                .with_context(|| format!("parsing params {}", path.display()))?;
            info!("[portal-runtime] Loaded params from {}", path.display());
            Ok(params)
        }
        None => Ok(PortalParams::default()),
    }
}

fn build_service(params: PortalParams) -> Result<PortalService> {
    let chain = Arc::new(BlockIntervalClock::new(params.beacon_block_interval_secs));
    PortalService::with_config(
        params,
        Arc::new(InMemoryPortalStore::new()),
        chain,
        Arc::new(TrustedProofVerifier),
        Arc::new(TracingLogger),
    )
    .context("invalid portal params")
}

/// Run every block in order, stopping at the first fatal error.
async fn replay(service: &PortalService, blocks: Vec<BlockInput>) -> Result<Vec<BlockOutput>> {
    let mut outputs = Vec::with_capacity(blocks.len());
    for block in blocks {
        let result = service
            .process_block(block.beacon_height, &block.records)
            .await
            .with_context(|| format!("beacon block {}", block.beacon_height))?;
        outputs.push(BlockOutput::from(result));
    }
    Ok(outputs)
}

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init(&TelemetryConfig::from_env())?;

    let config = load_config();
    let Some(blocks_path) = config.blocks_path.clone() else {
        warn!("[portal-runtime] QC_PORTAL_BLOCKS is not set, nothing to replay");
        return Ok(());
    };

    let service = build_service(load_params(&config)?)?;

    let raw = tokio::fs::read_to_string(&blocks_path)
        .await
        .with_context(|| format!("reading blocks {}", blocks_path.display()))?;
    let blocks: Vec<BlockInput> = serde_json::from_str(&raw)
        .with_context(|| format!("parsing blocks {}", blocks_path.display()))?;

    info!(
        blocks = blocks.len(),
        "[portal-runtime] Replaying {}",
        blocks_path.display()
    );

    let outputs = replay(&service, blocks).await?;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for output in &outputs {
        serde_json::to_writer(&mut out, output)?;
        writeln!(out)?;
    }

    info!(blocks = outputs.len(), "[portal-runtime] Replay complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use qc_15_portal::domain::ExchangeRateInfo;
    use qc_15_portal::ipc::ExchangeRatesAction;
    use qc_15_portal::{Instruction, InstructionKind, InstructionStatus, PRV_ID};

    fn rates_record(tx_req_id: &str) -> Vec<String> {
        let action = ExchangeRatesAction {
            sender_address: "feeder".to_string(),
            rates: vec![ExchangeRateInfo {
                token_id: PRV_ID.to_string(),
                rate: 1_000_000,
            }],
        };
        Instruction::action(InstructionKind::ExchangeRates, 0, tx_req_id, &action)
            .unwrap()
            .to_record()
    }

    #[tokio::test]
    async fn test_replay_emits_one_output_per_block() {
        let service = build_service(PortalParams::default()).unwrap();
        let blocks = vec![
            BlockInput {
                beacon_height: 1,
                records: vec![rates_record("tx-1")],
            },
            BlockInput {
                beacon_height: 2,
                records: vec![],
            },
        ];

        let outputs = tokio_test::assert_ok!(replay(&service, blocks).await);
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[0].beacon_height, 1);
        assert!(outputs[0].bridge_deltas.is_empty());

        let status = service
            .status(InstructionKind::ExchangeRates, "tx-1")
            .unwrap()
            .unwrap();
        assert_eq!(status.status, InstructionStatus::Accepted);
    }

    #[test]
    fn test_block_input_records_default_to_empty() {
        let block: BlockInput = serde_json::from_str(r#"{"beacon_height": 7}"#).unwrap();
        assert_eq!(block.beacon_height, 7);
        assert!(block.records.is_empty());
    }

    #[test]
    fn test_default_params_build() {
        let service = build_service(load_params(&RuntimeConfig::default()).unwrap()).unwrap();
        assert_eq!(service.params().beacon_block_interval_secs, 40);
    }
}
