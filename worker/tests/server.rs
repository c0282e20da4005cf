//! Workers served over the in-process broker.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::json;

use shardledger_common::{AccountId, LedgerError, PartitionId, TxId};
use shardledger_ledger::{LedgerStore, MemoryLedgerStore};
use shardledger_protocol::{Route, WorkerRequest};
use shardledger_rpc::{Broker, MemoryBroker, Properties, RetryPolicy, RpcClient, RpcConfig};
use shardledger_worker::{
    IdentityRecord, LookupWorker, MemoryIdentityStore, PartitionWorker, ServerConfig,
    WorkerConfig, WorkerServer, WorkerState,
};

fn create_test_worker_config(partition: u32) -> WorkerConfig {
    WorkerConfig {
        connect_attempts: 1,
        connect_retry_delay: Duration::from_millis(1),
        reconnect_delay: Duration::from_millis(20),
        ..WorkerConfig::for_partition(PartitionId::new(partition))
    }
}

fn create_test_client(broker: &MemoryBroker) -> RpcClient {
    let config = RpcConfig {
        request_timeout: Duration::from_secs(2),
        connect_attempts: 1,
        connect_retry_delay: Duration::from_millis(1),
        exclusive_calls: false,
    };
    RpcClient::new(Arc::new(broker.clone()), config).with_label("test-client")
}

fn spawn_partition(
    broker: &MemoryBroker,
    store: &MemoryLedgerStore,
) -> shardledger_worker::WorkerHandle<PartitionWorker> {
    let config = create_test_worker_config(1);
    let worker = PartitionWorker::new(&config, Arc::new(store.clone()));
    WorkerServer::new(Arc::new(broker.clone()), config.server_config(), worker).spawn()
}

#[tokio::test]
async fn test_partition_serves_two_phase_commit() {
    let broker = MemoryBroker::new();
    let store = MemoryLedgerStore::with_accounts([(AccountId::new(1001), dec!(2200.00))]);
    let handle = spawn_partition(&broker, &store);
    handle.wait_running(Duration::from_secs(1)).await.unwrap();

    let client = create_test_client(&broker);
    client.connect().await.unwrap();
    let route = Route::partition(PartitionId::new(1));
    let tx = TxId::from("tx-1");

    let vote = client
        .call_default(
            &WorkerRequest::prepare(tx.clone(), AccountId::new(1001), AccountId::new(8008), dec!(500.00)),
            &route,
        )
        .await
        .unwrap();
    assert!(vote.is_ready());
    assert_eq!(vote.field::<TxId>("tx_id"), Some(tx.clone()));

    let ack = client
        .call_default(&WorkerRequest::Commit { tx_id: tx.clone() }, &route)
        .await
        .unwrap();
    assert_eq!(ack.field::<bool>("applied"), Some(true));

    let query = client
        .call_default(&WorkerRequest::QueryAccount { account: AccountId::new(1001) }, &route)
        .await
        .unwrap();
    assert_eq!(query.field::<Decimal>("balance"), Some(dec!(1700.00)));

    let worker = handle.shutdown().await.unwrap();
    assert!(worker.pending().is_empty());
}

#[tokio::test]
async fn test_fire_and_forget_commit_is_applied() {
    let broker = MemoryBroker::new();
    let store = MemoryLedgerStore::with_accounts([(AccountId::new(1001), dec!(100))]);
    let handle = spawn_partition(&broker, &store);
    handle.wait_running(Duration::from_secs(1)).await.unwrap();

    let client = create_test_client(&broker);
    client.connect().await.unwrap();
    let route = Route::partition(PartitionId::new(1));
    let tx = TxId::from("ff");

    client
        .call_default(
            &WorkerRequest::prepare(tx.clone(), AccountId::new(1001), AccountId::new(2), dec!(40)),
            &route,
        )
        .await
        .unwrap();
    client
        .publish(&WorkerRequest::Commit { tx_id: tx }, &route)
        .await
        .unwrap();

    // Same queue, single consumer: the query is served after the commit.
    let query = client
        .call_default(&WorkerRequest::QueryAccount { account: AccountId::new(1001) }, &route)
        .await
        .unwrap();
    assert_eq!(query.field::<Decimal>("balance"), Some(dec!(60)));
    tokio_test::assert_ok!(handle.shutdown().await);
}

#[tokio::test]
async fn test_malformed_message_gets_error_reply_with_correlation() {
    let broker = MemoryBroker::new();
    let store = MemoryLedgerStore::new();
    let handle = spawn_partition(&broker, &store);
    handle.wait_running(Duration::from_secs(1)).await.unwrap();

    let client = create_test_client(&broker);
    client.connect().await.unwrap();
    let reply = client
        .call_default(&json!({"type": "TRANSFER_EVERYTHING"}), &Route::partition(PartitionId::new(1)))
        .await
        .unwrap();
    assert!(reply.is_error());

    let reply = client
        .call_default(&json!({"no_type": true}), &Route::partition(PartitionId::new(1)))
        .await
        .unwrap();
    assert!(reply.is_error());
    tokio_test::assert_ok!(handle.shutdown().await);
}

#[tokio::test]
async fn test_message_without_reply_address_is_consumed() {
    let broker = MemoryBroker::new();
    let store = MemoryLedgerStore::new();
    let handle = spawn_partition(&broker, &store);
    handle.wait_running(Duration::from_secs(1)).await.unwrap();

    let channel = broker.open_channel().await.unwrap();
    channel
        .publish(
            "worker_exchange",
            "worker_queue_1",
            Properties::default(),
            b"garbage".to_vec(),
        )
        .await
        .unwrap();

    // The loop keeps serving afterwards.
    let client = create_test_client(&broker);
    client.connect().await.unwrap();
    let reply = client
        .call_default(&WorkerRequest::SumPartition {}, &Route::partition(PartitionId::new(1)))
        .await
        .unwrap();
    assert_eq!(reply.field::<Decimal>("sum"), Some(Decimal::ZERO));
    tokio_test::assert_ok!(handle.shutdown().await);
}

#[tokio::test]
async fn test_startup_fails_when_broker_unreachable() {
    let broker = MemoryBroker::new();
    broker.set_available(false);
    let store = MemoryLedgerStore::new();

    let handle = spawn_partition(&broker, &store);
    let err = handle.wait_running(Duration::from_secs(1)).await.unwrap_err();
    assert!(matches!(err, LedgerError::Connection(_)));
    assert_eq!(handle.state(), WorkerState::Stopped);

    let result = handle.shutdown().await;
    assert!(matches!(result, Err(LedgerError::Connection(_))));
}

#[tokio::test]
async fn test_worker_reconnects_after_session_loss() {
    let broker = MemoryBroker::new();
    let store = MemoryLedgerStore::with_accounts([(AccountId::new(1001), dec!(10))]);
    let handle = spawn_partition(&broker, &store);
    handle.wait_running(Duration::from_secs(1)).await.unwrap();

    let mut states = handle.state_watch();
    broker.sever_connections();
    tokio::time::sleep(Duration::from_millis(100)).await;
    tokio::time::timeout(
        Duration::from_secs(1),
        states.wait_for(|s| *s == WorkerState::Running),
    )
    .await
    .unwrap()
    .unwrap();

    let client = create_test_client(&broker);
    client.connect().await.unwrap();
    let reply = client
        .call_default(&WorkerRequest::QueryAccount { account: AccountId::new(1001) }, &Route::partition(PartitionId::new(1)))
        .await
        .unwrap();
    assert_eq!(reply.field::<Decimal>("balance"), Some(dec!(10)));
    tokio_test::assert_ok!(handle.shutdown().await);
}

#[tokio::test]
async fn test_lookup_worker_over_broker() {
    let broker = MemoryBroker::new();
    let registry = MemoryIdentityStore::with_records([IdentityRecord::new(
        "70123456", "Jorge", "Huaman", "Rojas",
    )]);
    let server_config = ServerConfig {
        retry: RetryPolicy::once(),
        ..ServerConfig::for_queue("reniec_queue")
    };
    let handle = WorkerServer::new(
        Arc::new(broker.clone()),
        server_config,
        LookupWorker::new(Arc::new(registry)),
    )
    .spawn();
    handle.wait_running(Duration::from_secs(1)).await.unwrap();

    let client = create_test_client(&broker);
    client.connect().await.unwrap();
    let reply = client
        .call_default(&json!({"type": "VALIDAR_DNI", "dni": "70123456"}), &Route::lookup())
        .await
        .unwrap();
    assert!(reply.is_ok());
    let record: IdentityRecord = reply.field("data").unwrap();
    assert_eq!(record.nombres, "Jorge");

    let reply = client
        .call_default(&json!({"type": "VALIDAR_DNI", "dni": "1"}), &Route::lookup())
        .await
        .unwrap();
    assert_eq!(reply.error_message(), "dni not found");
    tokio_test::assert_ok!(handle.shutdown().await);
}

#[tokio::test]
async fn test_store_sees_only_committed_state() {
    let broker = MemoryBroker::new();
    let store = MemoryLedgerStore::with_accounts([(AccountId::new(1001), dec!(300))]);
    let handle = spawn_partition(&broker, &store);
    handle.wait_running(Duration::from_secs(1)).await.unwrap();

    let client = create_test_client(&broker);
    client.connect().await.unwrap();
    let route = Route::partition(PartitionId::new(1));
    client
        .call_default(
            &WorkerRequest::prepare(TxId::from("p"), AccountId::new(1001), AccountId::new(2), dec!(300)),
            &route,
        )
        .await
        .unwrap();
    assert_eq!(store.balance(AccountId::new(1001)).await.unwrap(), Some(dec!(300)));

    client
        .call_default(&WorkerRequest::Abort { tx_id: TxId::from("p") }, &route)
        .await
        .unwrap();
    let worker = handle.shutdown().await.unwrap();
    assert!(worker.pending().is_empty());
    assert_eq!(store.journal_len(), 0);
}
