//! Core coordinator implementation.

use std::sync::Arc;

use futures::future::join_all;
use rust_decimal::Decimal;
use tracing::{debug, error, info, instrument, warn};

use shardledger_common::{AccountId, LedgerError, PartitionId, Result, TxId};
use shardledger_protocol::{LookupRequest, Reply, Route, WorkerRequest};
use shardledger_rpc::RpcClient;
use shardledger_worker::IdentityRecord;

use crate::config::CoordinatorConfig;
use crate::directory::AccountDirectory;
use crate::metrics::{Metrics, SharedMetrics};
use crate::router::PartitionRouter;

/// Final state of a transfer as decided by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Every participant voted READY and was sent COMMIT.
    Committed { tx_id: TxId },
    /// At least one participant refused or could not be reached.
    Aborted { tx_id: TxId, reason: String },
}

impl TransferOutcome {
    pub fn tx_id(&self) -> &TxId {
        match self {
            TransferOutcome::Committed { tx_id } | TransferOutcome::Aborted { tx_id, .. } => tx_id,
        }
    }

    pub fn is_committed(&self) -> bool {
        matches!(self, TransferOutcome::Committed { .. })
    }
}

#[derive(Debug)]
enum Vote {
    Ready,
    /// Explicit ERROR vote. Nothing was recorded by the participant.
    Refused(String),
    /// No vote. The participant may or may not have prepared.
    Unreachable(String),
}

/// Drives transfers through two-phase commit and forwards queries to the
/// partition owning the account.
pub struct TransferCoordinator {
    config: CoordinatorConfig,
    client: Arc<RpcClient>,
    router: PartitionRouter,
    directory: Arc<dyn AccountDirectory>,
    metrics: SharedMetrics,
}

impl TransferCoordinator {
    /// Create a coordinator over a connected RPC client.
    pub fn new(
        config: CoordinatorConfig,
        client: Arc<RpcClient>,
        directory: Arc<dyn AccountDirectory>,
    ) -> Result<Self> {
        config.validate().map_err(LedgerError::Configuration)?;
        let router = PartitionRouter::new(&config)?;
        Ok(Self {
            config,
            client,
            router,
            directory,
            metrics: Arc::new(Metrics::new()),
        })
    }

    pub fn router(&self) -> &PartitionRouter {
        &self.router
    }

    pub fn metrics(&self) -> &SharedMetrics {
        &self.metrics
    }

    pub fn client(&self) -> &Arc<RpcClient> {
        &self.client
    }

    /// Move `amount` from `from` to `to` under a fresh transaction id.
    pub async fn transfer(
        &self,
        from: AccountId,
        to: AccountId,
        amount: Decimal,
    ) -> Result<TransferOutcome> {
        self.transfer_with_id(TxId::generate(), from, to, amount).await
    }

    /// Two-phase commit of one transfer.
    ///
    /// PREPARE goes to every involved partition concurrently. All READY
    /// means COMMIT to all of them. Anything else means ABORT to every
    /// partition that did not vote ERROR, since a participant that timed
    /// out may still have prepared. COMMIT and ABORT are published without
    /// waiting for an acknowledgement.
    #[instrument(skip_all, fields(tx_id = %tx_id, from = %from, to = %to, amount = %amount))]
    pub async fn transfer_with_id(
        &self,
        tx_id: TxId,
        from: AccountId,
        to: AccountId,
        amount: Decimal,
    ) -> Result<TransferOutcome> {
        self.validate_transfer(from, to, amount)?;
        self.client.ensure_connected().await?;

        self.metrics.transfer_initiated();
        let participants = self.router.participants(from, to);
        let prepare = WorkerRequest::prepare(tx_id.clone(), from, to, amount);

        let votes: Vec<(PartitionId, Vote)> = join_all(
            participants
                .iter()
                .map(|partition| self.collect_vote(&prepare, *partition)),
        )
        .await;

        let refusal = votes
            .iter()
            .find_map(|(_, vote)| match vote {
                Vote::Refused(reason) => Some(reason.clone()),
                _ => None,
            })
            .or_else(|| {
                votes.iter().find_map(|(partition, vote)| match vote {
                    Vote::Unreachable(reason) => {
                        Some(format!("partition {partition} unavailable: {reason}"))
                    }
                    _ => None,
                })
            });

        match refusal {
            None => {
                self.broadcast(&WorkerRequest::Commit { tx_id: tx_id.clone() }, &participants)
                    .await;
                self.metrics.transfer_committed();
                info!(participants = participants.len(), "Transfer committed");
                Ok(TransferOutcome::Committed { tx_id })
            }
            Some(reason) => {
                let undecided: Vec<PartitionId> = votes
                    .iter()
                    .filter(|(_, vote)| !matches!(vote, Vote::Refused(_)))
                    .map(|(partition, _)| *partition)
                    .collect();
                self.broadcast(&WorkerRequest::Abort { tx_id: tx_id.clone() }, &undecided)
                    .await;
                self.metrics.transfer_aborted();
                info!(reason = %reason, aborted = undecided.len(), "Transfer aborted");
                Ok(TransferOutcome::Aborted { tx_id, reason })
            }
        }
    }

    fn validate_transfer(&self, from: AccountId, to: AccountId, amount: Decimal) -> Result<()> {
        if amount <= Decimal::ZERO {
            return Err(LedgerError::VoteRefused("Amount must be positive".to_string()));
        }

        if from == to {
            return Err(LedgerError::VoteRefused(
                "Source and destination accounts must be different".to_string(),
            ));
        }

        Ok(())
    }

    async fn collect_vote(&self, prepare: &WorkerRequest, partition: PartitionId) -> (PartitionId, Vote) {
        let route = self.router.route(partition);
        let vote = match self
            .client
            .call(prepare, &route, self.config.participant_timeout)
            .await
        {
            Ok(reply) if reply.is_ready() => {
                self.metrics.vote_ready();
                Vote::Ready
            }
            Ok(reply) => {
                self.metrics.vote_refused();
                let reason = match reply.error_message() {
                    "" => format!("partition {partition} refused the transfer"),
                    message => message.to_string(),
                };
                debug!(partition = %partition, reason = %reason, "Vote refused");
                Vote::Refused(reason)
            }
            Err(e) => {
                self.metrics.participant_unreachable();
                warn!(partition = %partition, error = %e, "No vote from participant");
                Vote::Unreachable(e.to_string())
            }
        };
        (partition, vote)
    }

    async fn broadcast(&self, decision: &WorkerRequest, partitions: &[PartitionId]) {
        for partition in partitions {
            if let Err(e) = self.client.publish(decision, &self.router.route(*partition)).await {
                error!(
                    partition = %partition,
                    decision = decision.kind(),
                    error = %e,
                    "Failed to deliver decision"
                );
            }
        }
    }

    /// Balance of `account`, answered by its owning partition.
    #[instrument(skip_all, fields(account = %account))]
    pub async fn balance(&self, account: AccountId) -> Result<Reply> {
        self.client.ensure_connected().await?;
        let route = self.router.route(self.router.owner(account));
        self.client
            .call(
                &WorkerRequest::QueryAccount { account },
                &route,
                self.config.participant_timeout,
            )
            .await
    }

    /// Recent journal rows of `account`, newest first, from its owner.
    #[instrument(skip_all, fields(account = %account))]
    pub async fn history(&self, account: AccountId, limit: Option<u32>) -> Result<Reply> {
        self.client.ensure_connected().await?;
        let route = self.router.route(self.router.owner(account));
        self.client
            .call(
                &WorkerRequest::QueryHistory { account, limit },
                &route,
                self.config.participant_timeout,
            )
            .await
    }

    /// Sum of all balances across every active partition.
    pub async fn total_balance(&self) -> Result<Decimal> {
        self.client.ensure_connected().await?;
        let sums = join_all(self.router.partitions().iter().map(|partition| async move {
            let reply = self
                .client
                .call(
                    &WorkerRequest::SumPartition {},
                    &self.router.route(*partition),
                    self.config.participant_timeout,
                )
                .await?;
            reply.field::<Decimal>("sum").ok_or_else(|| {
                LedgerError::Internal(format!(
                    "partition {partition} did not report a sum: {}",
                    reply.error_message()
                ))
            })
        }))
        .await;

        sums.into_iter().sum()
    }

    /// Forward an identity lookup.
    pub async fn validate_identity(&self, dni: Option<String>) -> Result<Reply> {
        self.client.ensure_connected().await?;
        self.client
            .call(
                &LookupRequest::ValidateIdentity { dni },
                &Route::queue(self.config.lookup_queue.clone()),
                self.config.lookup_timeout,
            )
            .await
    }

    /// Check that `dni` holds `account` and that the identity is known.
    #[instrument(skip_all, fields(account = %account))]
    pub async fn login(&self, account: AccountId, dni: &str) -> Result<Reply> {
        match self.directory.holder(account).await? {
            None => Ok(Reply::error("account not found")),
            Some(holder) if holder != dni => {
                Ok(Reply::error("account does not belong to the given dni"))
            }
            Some(_) => {
                let identity = self.validate_identity(Some(dni.to_string())).await?;
                if !identity.is_ok() {
                    return Ok(identity);
                }
                let name = identity
                    .field::<IdentityRecord>("data")
                    .map(|record| record.full_name())
                    .unwrap_or_default();
                Ok(Reply::ok()
                    .with("account", account)
                    .with("nombre", name)
                    .with("dni", dni))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::MemoryAccountDirectory;
    use rust_decimal_macros::dec;
    use shardledger_rpc::{MemoryBroker, RpcConfig};
    use std::time::Duration;

    fn create_test_coordinator(config: CoordinatorConfig) -> TransferCoordinator {
        let client = RpcClient::new(Arc::new(MemoryBroker::new()), RpcConfig::default());
        TransferCoordinator::new(config, Arc::new(client), Arc::new(MemoryAccountDirectory::new()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_coordinator_creation() {
        let coordinator = create_test_coordinator(CoordinatorConfig::default());
        assert_eq!(coordinator.router().partitions().len(), 3);
        assert_eq!(coordinator.metrics().snapshot().transfers_total, 0);
    }

    #[tokio::test]
    async fn test_invalid_transfers_rejected_before_prepare() {
        let coordinator = create_test_coordinator(CoordinatorConfig::default());

        let err = coordinator
            .transfer(AccountId::new(1), AccountId::new(2), dec!(0))
            .await
            .unwrap_err();
        assert!(err.is_vote_refusal());

        let err = coordinator
            .transfer(AccountId::new(1), AccountId::new(1), dec!(10))
            .await
            .unwrap_err();
        assert!(err.is_vote_refusal());
        assert_eq!(coordinator.metrics().snapshot().transfers_total, 0);
    }

    #[tokio::test]
    async fn test_transfer_requires_connection() {
        let broker = MemoryBroker::new();
        broker.set_available(false);
        let rpc = RpcConfig {
            connect_attempts: 1,
            connect_retry_delay: Duration::from_millis(1),
            ..RpcConfig::default()
        };
        let client = RpcClient::new(Arc::new(broker), rpc);
        let coordinator = TransferCoordinator::new(
            CoordinatorConfig::default(),
            Arc::new(client),
            Arc::new(MemoryAccountDirectory::new()),
        )
        .unwrap();

        let err = coordinator
            .transfer(AccountId::new(1), AccountId::new(2), dec!(10))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Connection(_)));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let client = RpcClient::new(Arc::new(MemoryBroker::new()), RpcConfig::default());
        let result = TransferCoordinator::new(
            CoordinatorConfig::with_partitions([]),
            Arc::new(client),
            Arc::new(MemoryAccountDirectory::new()),
        );
        assert!(matches!(result, Err(LedgerError::Configuration(_))));
    }
}
