//! Portal Service
//!
//! Main service implementing `PortalApi`.

use super::processors::{processor_for, BlockContext};
use super::state::CurrentPortalState;
use super::sweeps::{
    distribute_rewards, expire_waiting_portings, liquidate_by_rates, liquidate_runaway_custodians,
    pick_more_custodians,
};
use crate::adapters::{BlockIntervalClock, TracingLogger};
use crate::config::PortalParams;
use crate::domain::{
    CustodianState, FinalExchangeRates, InstructionKind, InstructionStatus, PortalError,
    StatusRecord,
};
use crate::ipc::{decode_action, BlockResult, Instruction};
use crate::ports::inbound::PortalApi;
use crate::ports::outbound::{
    BlockCommit, ChainRetriever, PortalLogger, PortalSnapshot, PortalStateStore, ProofVerifier,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info};

/// Portal Service
///
/// Processes one beacon block at a time:
/// 1. Load the aggregate from the store
/// 2. Expire portings, liquidate runaway and under-collateralized custodians
/// 3. Run the block's actions in the given order
/// 4. Pick more custodians for timed-out redeems, distribute rewards
/// 5. Fold exchange rate submissions into the final rates
/// 6. Commit everything as one unit
pub struct PortalService {
    params: PortalParams,
    store: Arc<dyn PortalStateStore>,
    chain: Arc<dyn ChainRetriever>,
    verifier: Arc<dyn ProofVerifier>,
    logger: Arc<dyn PortalLogger>,
    block_lock: Mutex<()>,
}

impl PortalService {
    /// Create a service with default params, a fixed-interval beacon clock
    /// and tracing diagnostics.
    pub fn new(store: Arc<dyn PortalStateStore>, verifier: Arc<dyn ProofVerifier>) -> Self {
        let params = PortalParams::default();
        Self {
            chain: Arc::new(BlockIntervalClock::new(params.beacon_block_interval_secs)),
            logger: Arc::new(TracingLogger),
            params,
            store,
            verifier,
            block_lock: Mutex::new(()),
        }
    }

    /// Create a service with custom params and collaborators.
    pub fn with_config(
        params: PortalParams,
        store: Arc<dyn PortalStateStore>,
        chain: Arc<dyn ChainRetriever>,
        verifier: Arc<dyn ProofVerifier>,
        logger: Arc<dyn PortalLogger>,
    ) -> Result<Self, PortalError> {
        params.validate()?;
        Ok(Self {
            params,
            store,
            chain,
            verifier,
            logger,
            block_lock: Mutex::new(()),
        })
    }

    /// Protocol parameters.
    pub fn params(&self) -> &PortalParams {
        &self.params
    }

    /// Dispatch one record. Codec errors mean the record is malformed.
    fn process_record(
        &self,
        ctx: &mut BlockContext<'_>,
        state: &mut CurrentPortalState,
        record: &[String],
    ) -> Result<Vec<Instruction>, PortalError> {
        let Some(inst) = Instruction::from_record(record)? else {
            self.logger
                .warnf(format_args!("[qc-15] short record skipped: {record:?}"));
            return Ok(Vec::new());
        };
        if inst.status != InstructionStatus::Request {
            self.logger.warnf(format_args!(
                "[qc-15] {:?} record with status {} skipped",
                inst.kind,
                inst.status.as_str()
            ));
            return Ok(Vec::new());
        }
        let Some(processor) = processor_for(inst.kind) else {
            self.logger.warnf(format_args!(
                "[qc-15] {:?} is emitted by the engine, record skipped",
                inst.kind
            ));
            return Ok(Vec::new());
        };
        let envelope = decode_action(&inst.content)?;
        let aux = processor.prepare_data_before_processing(self.store.as_ref(), &envelope)?;
        processor.build_new_insts(ctx, state, &envelope, inst.shard_id, &aux)
    }

    /// Compute a block's instructions and writes without persisting them.
    fn execute_block(
        &self,
        beacon_height: u64,
        records: &[Vec<String>],
    ) -> Result<(BlockResult, BlockCommit), PortalError> {
        let mut state = CurrentPortalState::from_snapshot(self.store.load_snapshot()?);
        let mut ctx = BlockContext::new(
            beacon_height,
            &self.params,
            self.chain.as_ref(),
            self.verifier.as_ref(),
            self.logger.as_ref(),
        );

        let mut instructions = Vec::new();
        instructions.extend(expire_waiting_portings(&mut ctx, &mut state)?);
        instructions.extend(liquidate_runaway_custodians(&mut ctx, &mut state)?);
        instructions.extend(liquidate_by_rates(&mut ctx, &mut state)?);

        for (index, record) in records.iter().enumerate() {
            match self.process_record(&mut ctx, &mut state, record) {
                Ok(produced) => instructions.extend(produced),
                Err(PortalError::Codec(reason)) => {
                    self.logger.errorf(format_args!(
                        "[qc-15] malformed record {index} skipped: {reason}"
                    ));
                }
                Err(e) => return Err(e),
            }
        }

        instructions.extend(pick_more_custodians(&mut ctx, &mut state)?);
        instructions.extend(distribute_rewards(&mut ctx, &mut state)?);
        state.apply_exchange_rates_requests();

        let effects = ctx.effects;
        let commit = BlockCommit {
            beacon_height,
            snapshot: state.to_snapshot(),
            used_external_tx_ids: effects.used_external_tx_ids.into_iter().collect(),
            porting_ids: effects.porting_ids.into_iter().collect(),
            redeem_ids: effects.redeem_ids.into_iter().collect(),
            statuses: effects.statuses,
        };
        let result = BlockResult {
            beacon_height,
            instructions,
            bridge_deltas: effects.bridge_deltas,
        };
        Ok((result, commit))
    }

    /// Execute and commit a block. Blocks are processed one at a time.
    fn run_block(
        &self,
        beacon_height: u64,
        records: &[Vec<String>],
    ) -> Result<BlockResult, PortalError> {
        let _guard = self.block_lock.lock();
        debug!(beacon_height, records = records.len(), "[qc-15] Processing block");

        let (result, commit) = self.execute_block(beacon_height, records)?;
        self.store.commit_block(commit)?;

        info!(
            beacon_height,
            instructions = result.instructions.len(),
            "[qc-15] Block processed"
        );
        Ok(result)
    }
}

#[async_trait]
impl PortalApi for PortalService {
    async fn process_block(
        &self,
        beacon_height: u64,
        records: &[Vec<String>],
    ) -> Result<BlockResult, PortalError> {
        self.run_block(beacon_height, records)
    }

    fn custodian(&self, address: &str) -> Result<Option<CustodianState>, PortalError> {
        Ok(self.store.load_snapshot()?.custodians.remove(address))
    }

    fn status(&self, kind: InstructionKind, id: &str) -> Result<Option<StatusRecord>, PortalError> {
        self.store.get_status(kind, id)
    }

    fn final_exchange_rates(&self) -> Result<Option<FinalExchangeRates>, PortalError> {
        Ok(self.store.load_snapshot()?.final_exchange_rates)
    }

    fn snapshot(&self) -> Result<PortalSnapshot, PortalError> {
        self.store.load_snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::InMemoryPortalStore;
    use crate::domain::{ExchangeRateInfo, PORTAL_BNB_ID, PORTAL_BTC_ID, PRV_ID};
    use crate::ipc::{
        CustodianDepositAction, ExchangeRatesAction, PortingRequestAction, RedeemRequestAction,
        RequestPTokenAction,
    };
    use crate::ports::outbound::{LogLevel, MockProofVerifier, RecordingLogger};
    use serde::Serialize;
    use std::collections::BTreeMap;

    const PBTC: &str = PORTAL_BTC_ID;

    struct Node {
        store: Arc<InMemoryPortalStore>,
        logger: Arc<RecordingLogger>,
        service: PortalService,
    }

    fn node() -> Node {
        let store = Arc::new(InMemoryPortalStore::new());
        let logger = Arc::new(RecordingLogger::new());
        let params = PortalParams::default();
        let service = PortalService::with_config(
            params.clone(),
            store.clone(),
            Arc::new(BlockIntervalClock::new(params.beacon_block_interval_secs)),
            Arc::new(MockProofVerifier::default()),
            logger.clone(),
        )
        .unwrap();
        Node {
            store,
            logger,
            service,
        }
    }

    fn record<T: Serialize>(kind: InstructionKind, tx: &str, meta: &T) -> Vec<String> {
        Instruction::action(kind, 1, tx, meta).unwrap().to_record()
    }

    fn deposit(address: &str, amount: u64) -> Vec<String> {
        record(
            InstructionKind::CustodianDeposit,
            &format!("tx-deposit-{address}"),
            &CustodianDepositAction {
                incognito_address: address.into(),
                remote_addresses: BTreeMap::from([
                    (PBTC.to_string(), format!("btc-{address}")),
                    (PORTAL_BNB_ID.to_string(), format!("bnb-{address}")),
                ]),
                collateral_token_id: PRV_ID.into(),
                deposit_amount: amount,
                external_tx_id: String::new(),
                proof: String::new(),
            },
        )
    }

    fn rates(tx: &str, sender: &str, pbtc: u64) -> Vec<String> {
        record(
            InstructionKind::ExchangeRates,
            tx,
            &ExchangeRatesAction {
                sender_address: sender.into(),
                rates: vec![
                    ExchangeRateInfo {
                        token_id: PRV_ID.into(),
                        rate: 1_000_000,
                    },
                    ExchangeRateInfo {
                        token_id: PBTC.into(),
                        rate: pbtc,
                    },
                    ExchangeRateInfo {
                        token_id: PORTAL_BNB_ID.into(),
                        rate: 40_000_000,
                    },
                ],
            },
        )
    }

    fn porting(id: &str, amount: u64) -> Vec<String> {
        record(
            InstructionKind::PortingRequest,
            &format!("tx-{id}"),
            &PortingRequestAction {
                unique_register_id: id.into(),
                incognito_address: "user".into(),
                token_id: PBTC.into(),
                register_amount: amount,
                porting_fee: 100,
            },
        )
    }

    fn request_ptoken(id: &str, amount: u64) -> Vec<String> {
        record(
            InstructionKind::RequestPToken,
            &format!("tx-ptoken-{id}"),
            &RequestPTokenAction {
                unique_porting_id: id.into(),
                token_id: PBTC.into(),
                incognito_address: "user".into(),
                porting_amount: amount,
                porting_proof: "proof".into(),
            },
        )
    }

    fn statuses(result: &BlockResult) -> Vec<(InstructionKind, InstructionStatus)> {
        result
            .instructions
            .iter()
            .map(|inst| (inst.kind, inst.status))
            .collect()
    }

    /// Custodian with 1000 PRV, pBTC at 50 PRV.
    async fn seeded() -> Node {
        let n = node();
        let block = vec![deposit("cus1", 1_000), rates("tx-rates", "feeder", 50_000_000)];
        n.service.process_block(1, &block).await.unwrap();
        n
    }

    #[tokio::test]
    async fn test_porting_locks_collateral() {
        let n = seeded().await;
        let result = n.service.process_block(2, &[porting("p1", 10)]).await.unwrap();
        assert_eq!(
            statuses(&result),
            vec![
                (InstructionKind::PortingRequest, InstructionStatus::Accepted),
                (InstructionKind::Reward, InstructionStatus::Accepted),
                (InstructionKind::TotalCustodianReward, InstructionStatus::Accepted),
            ]
        );

        let custodian = n.service.custodian("cus1").unwrap().unwrap();
        assert_eq!(custodian.locked_of(PBTC, PRV_ID), 750);
        assert_eq!(custodian.free_collateral, 250);
        let status = n
            .service
            .status(InstructionKind::PortingRequest, "p1")
            .unwrap()
            .unwrap();
        assert_eq!(status.status, InstructionStatus::Accepted);
    }

    #[tokio::test]
    async fn test_rates_take_effect_after_the_block() {
        let n = node();
        let block = vec![
            deposit("cus1", 1_000),
            rates("tx-rates", "feeder", 50_000_000),
            porting("p1", 10),
        ];
        let result = n.service.process_block(1, &block).await.unwrap();
        assert_eq!(
            result.of_kind(InstructionKind::PortingRequest).next().unwrap().status,
            InstructionStatus::Rejected
        );
        assert_eq!(
            n.service.final_exchange_rates().unwrap().unwrap().rates[PBTC],
            50_000_000
        );
    }

    #[tokio::test]
    async fn test_median_of_several_feeders() {
        let n = node();
        let block = vec![
            rates("tx-r1", "feeder-1", 10_000_000_000),
            rates("tx-r2", "feeder-2", 9_000_000_000),
            rates("tx-r3", "feeder-3", 12_000_000_000),
        ];
        n.service.process_block(1, &block).await.unwrap();
        let final_rates = n.service.final_exchange_rates().unwrap().unwrap();
        assert_eq!(final_rates.rates[PBTC], 10_000_000_000);
        assert_eq!(final_rates.rates[PORTAL_BNB_ID], 40_000_000);
        assert_eq!(final_rates.rates[PRV_ID], 1_000_000);
    }

    #[tokio::test]
    async fn test_expired_porting_returns_collateral() {
        let n = seeded().await;
        n.service.process_block(2, &[porting("p1", 10)]).await.unwrap();

        // stored at height 3; one day is 2160 blocks of 40s
        let early = n.service.process_block(3 + 2158, &[]).await.unwrap();
        assert!(early.instructions.is_empty());
        let result = n.service.process_block(3 + 2159, &[]).await.unwrap();
        assert_eq!(
            statuses(&result),
            vec![(InstructionKind::ExpiredWaitingPorting, InstructionStatus::Success)]
        );
        let snapshot = n.service.snapshot().unwrap();
        assert!(snapshot.waiting_portings.is_empty());
        assert_eq!(snapshot.custodians["cus1"].free_collateral, 1_000);
    }

    #[tokio::test]
    async fn test_liquidation_below_tp120() {
        let n = seeded().await;
        n.service.process_block(2, &[porting("p1", 10)]).await.unwrap();
        n.service
            .process_block(3, &[request_ptoken("p1", 10), rates("tx-r2", "feeder", 65_000_000)])
            .await
            .unwrap();
        // 750 PRV backs 10 pBTC worth 650: ratio 115
        let result = n.service.process_block(4, &[]).await.unwrap();
        assert_eq!(
            statuses(&result),
            vec![(InstructionKind::LiquidateByRates, InstructionStatus::Accepted)]
        );
        let snapshot = n.service.snapshot().unwrap();
        let pool = &snapshot.liquidation_pool.rates[PBTC];
        assert_eq!(pool.pub_token_amount, 10);
        // seized value is 105% of 10 pBTC, floored to 10 pBTC = 650 PRV
        assert_eq!(pool.collateral_amount, 650);
        assert!(snapshot.ratio_warnings.is_empty());
        let custodian = &snapshot.custodians["cus1"];
        assert_eq!(custodian.holding_of(PBTC), 0);
        assert_eq!(custodian.locked_of(PBTC, PRV_ID), 0);
        assert_eq!(custodian.free_collateral, 250 + 100);
        assert_eq!(custodian.total_collateral, 350);
    }

    #[tokio::test]
    async fn test_bridge_deltas() {
        let n = seeded().await;
        n.service.process_block(2, &[porting("p1", 10)]).await.unwrap();
        let redeem = record(
            InstructionKind::RedeemRequest,
            "tx-redeem",
            &RedeemRequestAction {
                unique_redeem_id: "r1".into(),
                token_id: PBTC.into(),
                redeem_amount: 4,
                redeemer_address: "user".into(),
                remote_address: "btc-user".into(),
                redeemer_external_address: String::new(),
                redeem_fee: 100,
            },
        );
        let result = n
            .service
            .process_block(3, &[request_ptoken("p1", 10), redeem])
            .await
            .unwrap();
        assert_eq!(result.bridge_deltas[PBTC].net(), ('+', 6));
    }

    #[tokio::test]
    async fn test_malformed_records_skipped() {
        let n = seeded().await;
        let block = vec![
            vec!["999".to_string(), "1".into(), "request".into(), "e30=".into()],
            vec!["25".to_string()],
            vec![
                InstructionKind::PortingRequest.type_id().to_string(),
                "1".into(),
                "request".into(),
                "not base64".into(),
            ],
            porting("p1", 10),
        ];
        let result = n.service.process_block(2, &block).await.unwrap();
        assert_eq!(
            statuses(&result),
            vec![
                (InstructionKind::PortingRequest, InstructionStatus::Accepted),
                (InstructionKind::Reward, InstructionStatus::Accepted),
                (InstructionKind::TotalCustodianReward, InstructionStatus::Accepted),
            ]
        );
        assert!(n.logger.contains(LogLevel::Error, "malformed record 0"));
        assert!(n.logger.contains(LogLevel::Warn, "short record"));
    }

    #[tokio::test]
    async fn test_failed_commit_leaves_state_unchanged() {
        let n = seeded().await;
        let before = n.store.dump();
        n.store.set_fail_commits(true);
        tokio_test::assert_err!(n.service.process_block(2, &[porting("p1", 10)]).await);
        assert_eq!(n.store.dump(), before);

        n.store.set_fail_commits(false);
        let result = n.service.process_block(2, &[porting("p1", 10)]).await.unwrap();
        assert_eq!(
            statuses(&result),
            vec![
                (InstructionKind::PortingRequest, InstructionStatus::Accepted),
                (InstructionKind::Reward, InstructionStatus::Accepted),
                (InstructionKind::TotalCustodianReward, InstructionStatus::Accepted),
            ]
        );
    }

    #[tokio::test]
    async fn test_replay_is_deterministic() {
        let blocks = vec![
            vec![deposit("cus1", 1_000), deposit("cus2", 600), rates("tx-r", "f", 50_000_000)],
            vec![porting("p1", 10), porting("p2", 4)],
            vec![request_ptoken("p1", 10)],
        ];
        let a = node();
        let b = node();
        for (height, block) in blocks.iter().enumerate() {
            let height = height as u64 + 1;
            let left = a.service.process_block(height, block).await.unwrap();
            let right = b.service.process_block(height, block).await.unwrap();
            assert_eq!(left, right);
        }
        assert_eq!(a.store.dump(), b.store.dump());
    }

    #[tokio::test]
    async fn test_default_service_processes_deposit() {
        let store = Arc::new(InMemoryPortalStore::new());
        let service = PortalService::new(store.clone(), Arc::new(MockProofVerifier::default()));
        assert_eq!(service.params().beacon_block_interval_secs, 40);

        tokio_test::assert_ok!(service.process_block(1, &[deposit("cus1", 1_000)]).await);
        let custodian = service.custodian("cus1").unwrap().unwrap();
        assert_eq!(custodian.total_collateral, 1_000);
        assert_eq!(custodian.free_collateral, 1_000);
        assert_eq!(store.last_height().unwrap(), Some(1));
    }
}
