//! Two-phase commit participant for one partition.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::{debug, error, info, instrument, warn};

use shardledger_common::{AccountId, LedgerError, PartitionId, Result, TxId};
use shardledger_ledger::{LedgerStore, PlannedOp};
use shardledger_protocol::{Envelope, Reply, WorkerRequest};

use crate::config::WorkerConfig;
use crate::pending::PendingTable;
use crate::server::RequestHandler;

/// Rows returned by a history query that names no limit.
pub const DEFAULT_HISTORY_LIMIT: usize = 20;

/// Votes on, applies and discards transaction intents against the
/// accounts this partition owns.
///
/// An account is owned when the store knows it. Intents live only in
/// memory between PREPARE and the COMMIT or ABORT that resolves them.
pub struct PartitionWorker {
    partition: PartitionId,
    store: Arc<dyn LedgerStore>,
    pending: PendingTable,
    pending_warn_after: Duration,
}

impl PartitionWorker {
    pub fn new(config: &WorkerConfig, store: Arc<dyn LedgerStore>) -> Self {
        Self {
            partition: config.partition_id,
            store,
            pending: PendingTable::new(),
            pending_warn_after: config.pending_warn_after,
        }
    }

    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    pub fn pending(&self) -> &PendingTable {
        &self.pending
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    /// Serve one decoded request.
    pub async fn execute(&mut self, request: WorkerRequest) -> Reply {
        match request {
            WorkerRequest::PrepareTransfer {
                tx_id,
                from,
                to,
                amount,
            } => self.prepare(tx_id, from, to, amount).await,
            WorkerRequest::Prepare { tx_id } => self.prepare_without_legs(tx_id),
            WorkerRequest::Commit { tx_id } => self.commit(tx_id).await,
            WorkerRequest::Abort { tx_id } => self.abort(tx_id),
            WorkerRequest::QueryAccount { account } => self.query(account).await,
            WorkerRequest::QueryHistory { account, limit } => {
                self.history(account, limit.map_or(DEFAULT_HISTORY_LIMIT, |l| l as usize))
                    .await
            }
            WorkerRequest::SumPartition {} => self.sum().await,
        }
    }

    /// Phase one. Votes READY and records the intent, or votes ERROR and
    /// records nothing.
    #[instrument(skip(self), fields(partition = %self.partition))]
    pub async fn prepare(
        &mut self,
        tx_id: TxId,
        from: AccountId,
        to: AccountId,
        amount: Decimal,
    ) -> Reply {
        if self.pending.contains(&tx_id) {
            info!(tx_id = %tx_id, "Already prepared, repeating READY");
            return Reply::ready(&tx_id);
        }

        match self.plan(&tx_id, from, to, amount).await {
            Ok(ops) => {
                debug!(tx_id = %tx_id, ops = ops.len(), "Voting READY");
                self.pending.stage(tx_id.clone(), ops);
                Reply::ready(&tx_id)
            }
            Err(e) => {
                info!(tx_id = %tx_id, error = %e, code = e.error_code(), "Voting ERROR");
                Reply::vote_error(&tx_id, e.to_string())
            }
        }
    }

    async fn plan(
        &self,
        tx_id: &TxId,
        from: AccountId,
        to: AccountId,
        amount: Decimal,
    ) -> Result<Vec<PlannedOp>> {
        if amount <= Decimal::ZERO {
            return Err(LedgerError::VoteRefused(format!(
                "amount must be positive, got {amount}"
            )));
        }

        let mut ops = Vec::with_capacity(2);

        if let Some(balance) = self.store.balance(from).await? {
            let available = balance - self.pending.reserved_debits(from, tx_id);
            if available < amount {
                return Err(LedgerError::InsufficientFunds {
                    account: from,
                    required: amount,
                    available,
                });
            }
            ops.push(PlannedOp::debit(from, amount));
        }

        if self.store.contains(to).await? {
            ops.push(PlannedOp::credit(to, amount));
        }

        Ok(ops)
    }

    fn prepare_without_legs(&mut self, tx_id: TxId) -> Reply {
        self.pending.stage(tx_id.clone(), Vec::new());
        Reply::ready(&tx_id)
    }

    /// Phase two, success path. Unknown ids are a no-op.
    #[instrument(skip(self), fields(partition = %self.partition))]
    pub async fn commit(&mut self, tx_id: TxId) -> Reply {
        let Some(intent) = self.pending.get(&tx_id) else {
            debug!(tx_id = %tx_id, "COMMIT for unknown transaction ignored");
            return Reply::ok().with("tx_id", &tx_id).with("applied", false);
        };

        let applied = self.store.apply(&tx_id, &intent.ops).await;
        match applied {
            Ok(entries) => {
                self.pending.remove(&tx_id);
                info!(tx_id = %tx_id, entries = entries.len(), "Transaction committed");
                Reply::ok()
                    .with("tx_id", &tx_id)
                    .with("applied", true)
                    .with("entries", entries.len())
            }
            Err(e) => {
                // The intent stays so a resent COMMIT can apply it.
                error!(tx_id = %tx_id, error = %e, "Failed to apply commit");
                Reply::vote_error(&tx_id, e.to_string())
            }
        }
    }

    /// Phase two, failure path. Unknown ids are a no-op.
    pub fn abort(&mut self, tx_id: TxId) -> Reply {
        let discarded = self.pending.remove(&tx_id).is_some();
        if discarded {
            info!(partition = %self.partition, tx_id = %tx_id, "Transaction aborted");
        } else {
            debug!(partition = %self.partition, tx_id = %tx_id, "ABORT for unknown transaction ignored");
        }
        Reply::ok().with("tx_id", &tx_id).with("discarded", discarded)
    }

    pub async fn query(&self, account: AccountId) -> Reply {
        match self.store.balance(account).await {
            Ok(Some(balance)) => Reply::ok()
                .with("account", account)
                .with("balance", balance),
            Ok(None) => Reply::from(&LedgerError::AccountNotFound(account)),
            Err(e) => Reply::from(&e),
        }
    }

    /// Most recent journal rows of an owned account.
    pub async fn history(&self, account: AccountId, limit: usize) -> Reply {
        match self.store.contains(account).await {
            Ok(true) => {}
            Ok(false) => return Reply::from(&LedgerError::AccountNotFound(account)),
            Err(e) => return Reply::from(&e),
        }
        match self.store.history(account, limit).await {
            Ok(entries) => Reply::ok()
                .with("account", account)
                .with("transacciones", &entries),
            Err(e) => Reply::from(&e),
        }
    }

    pub async fn sum(&self) -> Reply {
        match self.store.total_balance().await {
            Ok(sum) => Reply::ok()
                .with("sum", sum)
                .with("partition", self.partition),
            Err(e) => Reply::from(&e),
        }
    }
}

#[async_trait]
impl RequestHandler for PartitionWorker {
    fn name(&self) -> String {
        format!("partition-{}", self.partition)
    }

    async fn handle(&mut self, body: &[u8]) -> Reply {
        match WorkerRequest::decode(body) {
            Ok(request) => self.execute(request).await,
            Err(e) => {
                warn!(partition = %self.partition, error = %e, "Rejected worker message");
                Reply::from(&e)
            }
        }
    }

    async fn on_tick(&mut self) {
        for (tx_id, age) in self.pending.stale(self.pending_warn_after) {
            warn!(
                partition = %self.partition,
                tx_id = %tx_id,
                age_secs = age.as_secs(),
                "Prepared transaction still undecided"
            );
        }
    }
}
