//! A whole deployment in one process.
//!
//! Starts partition workers, the identity lookup worker, a coordinator and
//! its gateway over one broker. Used by the simulator and the integration
//! tests; every component talks to the others only through the broker.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tracing::info;

use shardledger_common::{AccountId, LedgerError, PartitionId, Result};
use shardledger_ledger::{LedgerStore, MemoryLedgerStore};
use shardledger_rpc::{MemoryBroker, RetryPolicy, RpcClient, RpcConfig};
use shardledger_worker::{
    IdentityRecord, LookupWorker, MemoryIdentityStore, PartitionWorker, ServerConfig,
    WorkerConfig, WorkerHandle, WorkerServer,
};

use crate::config::CoordinatorConfig;
use crate::coordinator::TransferCoordinator;
use crate::directory::MemoryAccountDirectory;
use crate::gateway::{GatewayHandle, GatewayServer};
use crate::router::PartitionRouter;

const STARTUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Describes the deployment to start.
pub struct ClusterBuilder {
    coordinator: CoordinatorConfig,
    worker: WorkerConfig,
    accounts: Vec<(AccountId, Decimal)>,
    holders: Vec<(AccountId, String)>,
    identities: Vec<IdentityRecord>,
    stores: BTreeMap<PartitionId, Arc<dyn LedgerStore>>,
}

impl ClusterBuilder {
    pub fn new(partitions: impl IntoIterator<Item = u32>) -> Self {
        let mut coordinator = CoordinatorConfig::with_partitions(partitions);
        coordinator.rpc.connect_attempts = 1;

        let worker = WorkerConfig {
            connect_attempts: 1,
            reconnect_delay: Duration::from_millis(50),
            ..Default::default()
        };

        Self {
            coordinator,
            worker,
            accounts: Vec::new(),
            holders: Vec::new(),
            identities: Vec::new(),
            stores: BTreeMap::new(),
        }
    }

    /// Open an account on the partition that owns it.
    pub fn account(mut self, id: i64, balance: Decimal) -> Self {
        self.accounts.push((AccountId::new(id), balance));
        self
    }

    /// Open an account held by `dni`.
    pub fn held_account(mut self, id: i64, balance: Decimal, dni: impl Into<String>) -> Self {
        self.holders.push((AccountId::new(id), dni.into()));
        self.account(id, balance)
    }

    pub fn identity(mut self, record: IdentityRecord) -> Self {
        self.identities.push(record);
        self
    }

    /// Back `partition` with `store` instead of an in-memory one. Accounts
    /// declared on the builder are not written to it.
    pub fn store(mut self, partition: u32, store: Arc<dyn LedgerStore>) -> Self {
        self.stores.insert(PartitionId::new(partition), store);
        self
    }

    /// Budget for every coordinator-to-partition call.
    pub fn participant_timeout(mut self, timeout: Duration) -> Self {
        self.coordinator.participant_timeout = timeout;
        self
    }

    pub fn rpc_config(mut self, rpc: RpcConfig) -> Self {
        self.coordinator.rpc = rpc;
        self
    }

    pub fn pending_warn_after(mut self, age: Duration) -> Self {
        self.worker.pending_warn_after = age;
        self
    }

    /// Start every component on `broker` and wait until all are serving.
    pub async fn start(self, broker: MemoryBroker) -> Result<Cluster> {
        let router = PartitionRouter::new(&self.coordinator)?;
        let mut partitions = BTreeMap::new();

        for partition in router.partitions() {
            let (store, memory) = match self.stores.get(partition) {
                Some(store) => (store.clone(), None),
                None => {
                    let memory = MemoryLedgerStore::with_accounts(
                        self.accounts
                            .iter()
                            .filter(|(id, _)| router.owner(*id) == *partition)
                            .copied(),
                    );
                    (Arc::new(memory.clone()) as Arc<dyn LedgerStore>, Some(memory))
                }
            };

            let config = WorkerConfig {
                partition_id: *partition,
                ..self.worker.clone()
            };
            let mut node = PartitionNode {
                config,
                store,
                memory,
                running: None,
                paused: None,
            };
            node.start(&broker, None).await?;
            partitions.insert(*partition, node);
        }

        let identities = MemoryIdentityStore::with_records(self.identities);
        let lookup_config = ServerConfig {
            retry: RetryPolicy::once(),
            reconnect_delay: self.worker.reconnect_delay,
            ..ServerConfig::for_queue(self.coordinator.lookup_queue.clone())
        };
        let lookup = WorkerServer::new(
            Arc::new(broker.clone()),
            lookup_config,
            LookupWorker::new(Arc::new(identities.clone())),
        )
        .spawn();
        lookup.wait_running(STARTUP_TIMEOUT).await?;

        let directory = MemoryAccountDirectory::new();
        for (account, dni) in self.holders {
            directory.register(account, dni);
        }

        let client = RpcClient::new(Arc::new(broker.clone()), self.coordinator.rpc.clone())
            .with_label("coordinator");
        client.connect().await?;
        let gateway_queue = self.coordinator.gateway_queue.clone();
        let coordinator = Arc::new(TransferCoordinator::new(
            self.coordinator,
            Arc::new(client),
            Arc::new(directory.clone()),
        )?);

        let gateway = GatewayServer::new(Arc::new(broker.clone()), coordinator.clone(), gateway_queue)
            .with_retry(RetryPolicy::once(), self.worker.reconnect_delay)
            .spawn();
        gateway.wait_running(STARTUP_TIMEOUT).await?;

        info!(partitions = partitions.len(), "Cluster started");
        Ok(Cluster {
            broker,
            coordinator,
            partitions,
            lookup: Some(lookup),
            gateway: Some(gateway),
            identities,
            directory,
        })
    }
}

struct PartitionNode {
    config: WorkerConfig,
    store: Arc<dyn LedgerStore>,
    memory: Option<MemoryLedgerStore>,
    running: Option<WorkerHandle<PartitionWorker>>,
    /// Worker of a stopped partition, pending table included.
    paused: Option<PartitionWorker>,
}

impl PartitionNode {
    async fn start(&mut self, broker: &MemoryBroker, worker: Option<PartitionWorker>) -> Result<()> {
        let worker = worker.unwrap_or_else(|| PartitionWorker::new(&self.config, self.store.clone()));
        let handle =
            WorkerServer::new(Arc::new(broker.clone()), self.config.server_config(), worker).spawn();
        handle.wait_running(STARTUP_TIMEOUT).await?;
        self.running = Some(handle);
        Ok(())
    }
}

/// A running deployment.
pub struct Cluster {
    broker: MemoryBroker,
    coordinator: Arc<TransferCoordinator>,
    partitions: BTreeMap<PartitionId, PartitionNode>,
    lookup: Option<WorkerHandle<LookupWorker>>,
    gateway: Option<GatewayHandle>,
    identities: MemoryIdentityStore,
    directory: MemoryAccountDirectory,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("partitions", &self.partitions())
            .field("identities", &self.identities.len())
            .field("holders", &self.directory.len())
            .finish_non_exhaustive()
    }
}

impl Cluster {
    pub fn builder(partitions: impl IntoIterator<Item = u32>) -> ClusterBuilder {
        ClusterBuilder::new(partitions)
    }

    pub fn broker(&self) -> &MemoryBroker {
        &self.broker
    }

    pub fn coordinator(&self) -> &Arc<TransferCoordinator> {
        &self.coordinator
    }

    pub fn identities(&self) -> &MemoryIdentityStore {
        &self.identities
    }

    pub fn directory(&self) -> &MemoryAccountDirectory {
        &self.directory
    }

    pub fn partitions(&self) -> Vec<PartitionId> {
        self.partitions.keys().copied().collect()
    }

    /// Store behind `partition`.
    pub fn store(&self, partition: u32) -> Option<Arc<dyn LedgerStore>> {
        self.partitions
            .get(&PartitionId::new(partition))
            .map(|node| node.store.clone())
    }

    /// In-memory store behind `partition`, if it has one.
    pub fn memory_store(&self, partition: u32) -> Option<&MemoryLedgerStore> {
        self.partitions
            .get(&PartitionId::new(partition))
            .and_then(|node| node.memory.as_ref())
    }

    /// Store owning `account`.
    pub fn store_for(&self, account: AccountId) -> Option<Arc<dyn LedgerStore>> {
        let owner = self.coordinator.router().owner(account);
        self.partitions.get(&owner).map(|node| node.store.clone())
    }

    /// Balance read straight from the owning store, bypassing the broker.
    pub async fn balance_of(&self, account: i64) -> Result<Option<Decimal>> {
        let account = AccountId::new(account);
        match self.store_for(account) {
            Some(store) => store.balance(account).await,
            None => Ok(None),
        }
    }

    /// Sum of every store, bypassing the broker.
    pub async fn ledger_total(&self) -> Result<Decimal> {
        let mut total = Decimal::ZERO;
        for node in self.partitions.values() {
            total += node.store.total_balance().await?;
        }
        Ok(total)
    }

    /// A connected client for talking to the gateway or the workers.
    pub async fn client(&self, label: &str) -> Result<RpcClient> {
        let client = RpcClient::new(Arc::new(self.broker.clone()), RpcConfig::default())
            .with_label(label);
        client.connect().await?;
        Ok(client)
    }

    /// Stop a partition's worker. Its queue keeps collecting requests.
    pub async fn stop_partition(&mut self, partition: u32) -> Result<()> {
        let node = self.node_mut(partition)?;
        if let Some(handle) = node.running.take() {
            node.paused = Some(handle.shutdown().await?);
            info!(partition, "Partition stopped");
        }
        Ok(())
    }

    /// Resume a stopped partition with the state it had when stopped.
    pub async fn start_partition(&mut self, partition: u32) -> Result<()> {
        let broker = self.broker.clone();
        let node = self.node_mut(partition)?;
        if node.running.is_none() {
            let worker = node.paused.take();
            node.start(&broker, worker).await?;
            info!(partition, "Partition started");
        }
        Ok(())
    }

    /// Whether the partition's worker has any undecided transaction. Only
    /// known while the partition is stopped.
    pub fn paused_pending(&self, partition: u32) -> Option<usize> {
        self.partitions
            .get(&PartitionId::new(partition))
            .and_then(|node| node.paused.as_ref())
            .map(|worker| worker.pending().len())
    }

    fn node_mut(&mut self, partition: u32) -> Result<&mut PartitionNode> {
        self.partitions
            .get_mut(&PartitionId::new(partition))
            .ok_or_else(|| LedgerError::Configuration(format!("unknown partition {partition}")))
    }

    /// Stop the gateway, the coordinator's session and every worker.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(gateway) = self.gateway.take() {
            gateway.shutdown().await?;
        }
        self.coordinator.client().close().await?;
        if let Some(lookup) = self.lookup.take() {
            lookup.shutdown().await?;
        }
        for node in self.partitions.values_mut() {
            if let Some(handle) = node.running.take() {
                handle.shutdown().await?;
            }
        }
        info!("Cluster stopped");
        Ok(())
    }
}
