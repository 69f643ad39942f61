//! The engine handle: one ledger connection, one bus, one configuration.
//!
//! A `Manager` is built once by the binary and passed around explicitly.
//! [`Manager::start`] spawns the watcher, the reconciler and the transfer
//! responder; everything else on it is a thin query over the ledger.

use crate::chain::{Address, LocalSigner, SignerError, TxHash};
use crate::config::EngineConfig;
use crate::events::{EventBus, TransferRequester};
use crate::executor::{OutboundExecutor, TokenExecutor};
use crate::ledger::{LedgerClient, LedgerError, Receipt, RpcLedgerClient, TransferFilter};
use crate::processors::{
    ChainWatcher, ReconcileError, Reconciler, ReconcilerDeps, TransferResponder, check_message,
};
use crate::provisioning::Provisioner;
use crate::store::RecordStore;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};
use vpspay_sdk::objects::TokenAmount;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("invalid executor key: {0}")]
    Signer(#[from] SignerError),

    #[error("reconciler failed to start: {0}")]
    Reconcile(#[from] ReconcileError),
}

pub struct Manager {
    ledger: Arc<dyn LedgerClient>,
    executor: Arc<dyn OutboundExecutor>,
    bus: EventBus,
    config: EngineConfig,
}

/// Handles of the tasks spawned by [`Manager::start`].
pub struct EngineTasks {
    pub watcher: JoinHandle<()>,
    pub reconciler: JoinHandle<()>,
    pub responder: JoinHandle<()>,
}

impl EngineTasks {
    /// Wait for every task to finish (after the shutdown signal).
    pub async fn join(self) {
        for (name, handle) in [
            ("chain watcher", self.watcher),
            ("reconciler", self.reconciler),
            ("transfer responder", self.responder),
        ] {
            if let Err(e) = handle.await {
                error!(task = name, error = %e, "Engine task panicked");
            }
        }
    }
}

impl Manager {
    /// Dial the ledger and load the executor key.
    pub async fn connect(config: EngineConfig) -> Result<Self, ManagerError> {
        let ledger = RpcLedgerClient::dial(
            config.ledger.http_url.clone(),
            config.ledger.ws_url.clone(),
            config.ledger.contract_address,
        )
        .await?;
        let ledger: Arc<dyn LedgerClient> = Arc::new(ledger);

        let signer = LocalSigner::from_hex(&config.executor.private_key)?;
        let executor = TokenExecutor::new(
            ledger.clone(),
            signer,
            config.ledger.contract_address,
            config.executor.gas_limit,
        );
        info!(
            contract = %config.ledger.contract_address,
            executor = %executor.address(),
            "Ledger connected"
        );
        Ok(Self::new(ledger, Arc::new(executor), config))
    }

    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        executor: Arc<dyn OutboundExecutor>,
        config: EngineConfig,
    ) -> Self {
        Self {
            ledger,
            executor,
            bus: EventBus::new(),
            config,
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Request/response access to the executor through the bus.
    pub fn requester(&self) -> TransferRequester {
        TransferRequester::new(self.bus.clone(), self.config.request_timeout)
    }

    /// Spawn the engine tasks.
    ///
    /// The reconciler subscribes and restores its state before the watcher
    /// starts publishing, so no early transfer goes unseen. The watcher
    /// resumes one confirmation depth below the saved cursor, so only the
    /// unconfirmed tail is scanned again.
    pub async fn start(
        &self,
        store: Arc<dyn RecordStore>,
        provisioner: Arc<dyn Provisioner>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Result<EngineTasks, ManagerError> {
        let deps = ReconcilerDeps {
            store,
            ledger: self.ledger.clone(),
            provisioner,
            executor: self.executor.clone(),
            bus: self.bus.clone(),
        };
        let reconciler = Reconciler::bootstrap(
            deps,
            self.config.reconciler.clone(),
            shutdown_rx.clone(),
        )
        .await?;
        let responder =
            TransferResponder::new(self.executor.clone(), self.bus.clone(), shutdown_rx.clone());
        let mut watcher = ChainWatcher::new(
            self.ledger.clone(),
            self.bus.clone(),
            TransferFilter {
                contract: self.config.ledger.contract_address,
                recipients: Vec::new(),
            },
            self.config.watcher.clone(),
            shutdown_rx,
        );
        if let Some(cursor) = reconciler.watch_cursor() {
            let resume = cursor.saturating_sub(self.config.reconciler.confirmations);
            info!(cursor, resume, "Resuming transfer backfill");
            watcher = watcher.resume_from(resume);
        }

        let tasks = EngineTasks {
            reconciler: tokio::spawn(reconciler.run()),
            responder: tokio::spawn(responder.run()),
            watcher: tokio::spawn(watcher.run()),
        };
        info!("Engine started");
        Ok(tasks)
    }

    pub async fn balance_of(&self, address: Address) -> Result<TokenAmount, LedgerError> {
        self.ledger.balance_of(address).await
    }

    pub async fn chain_height(&self) -> Result<i64, LedgerError> {
        self.ledger.block_height().await
    }

    /// Look up `tx` and feed its transfers back to the reconciler.
    pub async fn check_message(&self, tx: &TxHash) -> Result<Receipt, LedgerError> {
        check_message(self.ledger.as_ref(), &self.bus, tx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        ExecutorConfig, LedgerConfig, ProvisionerConfig, ReconcilerConfig, WatcherConfig,
    };
    use crate::entities::{NewOrder, OrderState, Record, RecordRef};
    use crate::events::{RecordCommand, TransferEvent};
    use crate::executor::ExecutorError;
    use crate::ledger::testing::{ScriptedLedger, SubscribeStep};
    use crate::provisioning::{
        InstanceAttributes, InstanceSpec, ProvisionError, ProvisionedInstance,
    };
    use crate::store::MemoryRecordStore;
    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use uuid::Uuid;

    const CONTRACT: Address = Address::new([0xcc; 20]);

    struct InstantProvisioner;

    #[async_trait]
    impl Provisioner for InstantProvisioner {
        async fn create_instance(
            &self,
            order_id: Uuid,
            _spec: &InstanceSpec,
        ) -> Result<ProvisionedInstance, ProvisionError> {
            Ok(ProvisionedInstance {
                instance_id: format!("i-{}", order_id.simple()),
                trade_price: Decimal::new(1000, 2),
            })
        }

        async fn start_instance(&self, _instance_id: &str) -> Result<(), ProvisionError> {
            Ok(())
        }

        async fn describe_instance(
            &self,
            instance_id: &str,
        ) -> Result<InstanceAttributes, ProvisionError> {
            Ok(InstanceAttributes {
                instance_id: instance_id.to_string(),
                status: "Running".into(),
                public_ip_address: None,
            })
        }
    }

    struct EchoExecutor;

    #[async_trait]
    impl OutboundExecutor for EchoExecutor {
        async fn mint(&self, _to: Address, _amount: TokenAmount) -> Result<TxHash, ExecutorError> {
            Ok(TxHash::new("0xminted"))
        }

        async fn transfer(&self, _to: Address, _amount: TokenAmount) -> Result<TxHash, ExecutorError> {
            Ok(TxHash::new("0xsent"))
        }
    }

    fn config() -> EngineConfig {
        EngineConfig {
            ledger: LedgerConfig {
                http_url: "http://127.0.0.1:8545".parse().unwrap(),
                ws_url: "ws://127.0.0.1:8546".parse().unwrap(),
                contract_address: CONTRACT,
            },
            watcher: WatcherConfig::default(),
            reconciler: ReconcilerConfig::default(),
            executor: ExecutorConfig {
                private_key: String::new(),
                gas_limit: 100_000,
            },
            provisioner: ProvisionerConfig {
                base_url: "http://127.0.0.1:9000/".parse().unwrap(),
                request_timeout: Duration::from_secs(5),
            },
            request_timeout: Duration::from_secs(5),
        }
    }

    fn manager(ledger: Arc<ScriptedLedger>) -> Manager {
        Manager::new(ledger, Arc::new(EchoExecutor), config())
    }

    #[tokio::test]
    async fn test_queries_go_to_the_ledger() {
        let ledger = Arc::new(ScriptedLedger::new());
        ledger.height.store(321, Ordering::SeqCst);
        let owner = Address::new([0x01; 20]);
        ledger
            .balances
            .lock()
            .unwrap()
            .insert(owner, TokenAmount::from(77u64));
        let manager = manager(ledger);

        assert_eq!(manager.chain_height().await.unwrap(), 321);
        assert_eq!(manager.balance_of(owner).await.unwrap(), TokenAmount::from(77u64));
        assert!(matches!(
            manager.check_message(&TxHash::new("0xmissing")).await,
            Err(LedgerError::NotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_engine_settles_an_order_paid_on_chain() {
        let ledger = Arc::new(ScriptedLedger::new());
        ledger.height.store(100, Ordering::SeqCst);
        ledger.script([SubscribeStep::Open(Vec::new())]);
        let manager = manager(ledger.clone());
        let store = Arc::new(MemoryRecordStore::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let tasks = manager
            .start(store.clone(), Arc::new(InstantProvisioner), shutdown_rx)
            .await
            .unwrap();

        let order_id = Uuid::new_v4();
        let pay_to = Address::new([0xaa; 20]);
        manager.bus().publish(RecordCommand::CreateOrder(NewOrder {
            order_id,
            user_id: "user-1".into(),
            to_addr: pay_to,
            value: TokenAmount::from(250u64),
            spec: InstanceSpec::default(),
        }));
        manager
            .bus()
            .publish(RecordCommand::AwaitPayment { order_id });

        let order_state = |store: &MemoryRecordStore| match store.get(RecordRef::Order(order_id)) {
            Some(Record::Order(o)) => Some(o.state),
            _ => None,
        };
        for _ in 0..200 {
            if order_state(&store) == Some(OrderState::WaitingPayment)
                && ledger.live_streams() == 1
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        ledger
            .push(Ok(TransferEvent {
                id: TxHash::new("0xpaid"),
                from: Address::new([0x11; 20]),
                to: pay_to,
                value: TokenAmount::from(250u64),
                observed_height: 101,
                removed: false,
            }))
            .await;
        for _ in 0..200 {
            if order_state(&store) == Some(OrderState::Done) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(order_state(&store), Some(OrderState::Done));

        shutdown_tx.send(true).unwrap();
        tasks.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_backfills_from_saved_cursor() {
        let ledger = Arc::new(ScriptedLedger::new());
        ledger.height.store(500, Ordering::SeqCst);
        ledger.script([SubscribeStep::Open(Vec::new())]);
        let manager = manager(ledger.clone());
        let store = Arc::new(MemoryRecordStore::new());
        store.save_watch_cursor(400).await.unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let tasks = manager
            .start(store, Arc::new(InstantProvisioner), shutdown_rx)
            .await
            .unwrap();
        for _ in 0..200 {
            if ledger.live_streams() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let calls = ledger.range_calls.lock().unwrap().clone();
        assert_eq!(calls.first(), Some(&(340, 500)));

        shutdown_tx.send(true).unwrap();
        tasks.join().await;
    }

    #[tokio::test]
    async fn test_requester_reaches_the_executor() {
        let ledger = Arc::new(ScriptedLedger::new());
        ledger.script([SubscribeStep::Open(Vec::new())]);
        let manager = manager(ledger);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tasks = manager
            .start(
                Arc::new(MemoryRecordStore::new()),
                Arc::new(InstantProvisioner),
                shutdown_rx,
            )
            .await
            .unwrap();

        let tx = manager
            .requester()
            .mint(Address::new([0x42; 20]), TokenAmount::from(5u64))
            .await
            .unwrap();
        assert_eq!(tx, TxHash::new("0xminted"));

        shutdown_tx.send(true).unwrap();
        tasks.join().await;
    }
}
