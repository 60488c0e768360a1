//! Engine facade: composition root wiring config, model, routing, coordinator, and
//! partition workers, with channel-based response delivery.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;

use kst_common::config::EngineConfig;
use kst_common::error::{KstError, KstResult};
use kst_common::ids::{PartitionId, TxnId};
use kst_model::artifact::load_model;
use kst_model::graph::PathModel;
use kst_storage::store::{InMemoryPartitionStore, PartitionStore};

use crate::coordinator::{CoordinatorMessage, spawn_coordinator};
use crate::routing::{HashPartitionRouter, plan_transaction};
use crate::runtime::{PartitionMessage, PartitionRuntime};
use crate::txn::{TxnRequest, TxnResponse};

/// Handle returned by [`Engine::submit`]: the assigned id plus the response channel.
///
/// Exactly one response arrives per submitted transaction.
#[derive(Debug)]
pub struct TxnTicket {
    /// Engine-assigned monotonic transaction id.
    pub txn_id: TxnId,
    /// Receiver for the single response.
    pub response: Receiver<TxnResponse>,
}

/// The partitioned execution engine core.
pub struct Engine {
    config: EngineConfig,
    router: HashPartitionRouter,
    runtime: Option<PartitionRuntime>,
    coordinator: Option<Sender<CoordinatorMessage>>,
    coordinator_worker: Option<thread::JoinHandle<()>>,
    next_txn_id: AtomicU64,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("runtime", &self.runtime)
            .finish()
    }
}

impl Engine {
    /// Boots the engine with in-memory partition stores.
    ///
    /// The transaction-path model artifact is loaded once from the configured path
    /// when the model is enabled; it is shared read-only across partitions afterwards.
    ///
    /// # Errors
    ///
    /// Returns an error when the model artifact cannot be loaded or a partition
    /// scheduler cannot be built.
    pub fn new(config: EngineConfig) -> KstResult<Self> {
        let model = match (&config.speculation.model_path, config.speculation.use_model) {
            (Some(path), true) => Some(load_model(path)?),
            _ => None,
        };
        Self::with_model(config, model)
    }

    /// Boots the engine with in-memory partition stores and an already-built model.
    ///
    /// # Errors
    ///
    /// Returns an error when a partition scheduler cannot be built.
    pub fn with_model(config: EngineConfig, model: Option<PathModel>) -> KstResult<Self> {
        Self::with_store_factory(config, model, InMemoryPartitionStore::new)
    }

    /// Boots the engine with custom partition stores.
    ///
    /// # Errors
    ///
    /// Returns an error when a partition scheduler cannot be built.
    pub fn with_store_factory<S, F>(
        config: EngineConfig,
        model: Option<PathModel>,
        store_factory: F,
    ) -> KstResult<Self>
    where
        S: PartitionStore + 'static,
        F: FnMut(PartitionId) -> S,
    {
        let model = model.map(Arc::new);
        let (coordinator_sender, coordinator_receiver) = mpsc::channel::<CoordinatorMessage>();
        let runtime = PartitionRuntime::new(
            &config,
            model,
            coordinator_sender.clone(),
            store_factory,
        )?;
        let coordinator_worker =
            spawn_coordinator(coordinator_receiver, runtime.sender_handles());
        let router = HashPartitionRouter::new(config.partition_count);

        Ok(Self {
            config,
            router,
            runtime: Some(runtime),
            coordinator: Some(coordinator_sender),
            coordinator_worker: Some(coordinator_worker),
            next_txn_id: AtomicU64::new(1),
        })
    }

    /// Returns the engine configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Returns the partition router, so callers can compute key placement.
    #[must_use]
    pub fn router(&self) -> &HashPartitionRouter {
        &self.router
    }

    /// Submits one transaction and returns its ticket.
    ///
    /// Single-partition transactions go straight to their partition's queue;
    /// multi-partition transactions go through the coordinator. The returned channel
    /// receives exactly one response; its `speculative` flag reports whether the
    /// result was produced while the ledger entry was still unresolved.
    ///
    /// # Errors
    ///
    /// Returns an error when routing fails or the engine is shutting down.
    pub fn submit(&self, request: TxnRequest) -> KstResult<TxnTicket> {
        let txn_id = self.next_txn_id.fetch_add(1, Ordering::Relaxed);
        let plan = plan_transaction(&self.router, txn_id, request)?;
        let (reply, response) = mpsc::channel::<TxnResponse>();

        let Some(runtime) = self.runtime.as_ref() else {
            return Err(KstError::InvalidState("engine runtime is shut down"));
        };
        if plan.is_single_partition() {
            let partition = plan.base_partition();
            // A single-partition plan routes every operation to its home partition,
            // which is exactly the "purely local" proof the local bypass needs.
            runtime.submit(
                partition,
                PartitionMessage::Single {
                    txn_id,
                    procedure: plan.procedure,
                    params: plan.params,
                    ops: plan
                        .hops
                        .into_iter()
                        .flat_map(|hop| hop.per_partition)
                        .flat_map(|(_, ops)| ops)
                        .collect(),
                    purely_local: true,
                    reply,
                },
            )?;
        } else {
            let Some(coordinator) = self.coordinator.as_ref() else {
                return Err(KstError::InvalidState("engine coordinator is shut down"));
            };
            coordinator
                .send(CoordinatorMessage::Begin { plan, reply })
                .map_err(|_| KstError::InvalidState("coordinator queue is closed"))?;
        }
        Ok(TxnTicket { txn_id, response })
    }

    /// Aborts one in-flight distributed transaction (upstream cancellation/timeout).
    ///
    /// # Errors
    ///
    /// Returns an error when the engine is shutting down.
    pub fn cancel(&self, txn_id: TxnId, reason: impl Into<String>) -> KstResult<()> {
        let Some(coordinator) = self.coordinator.as_ref() else {
            return Err(KstError::InvalidState("engine coordinator is shut down"));
        };
        coordinator
            .send(CoordinatorMessage::Cancel {
                txn_id,
                reason: reason.into(),
            })
            .map_err(|_| KstError::InvalidState("coordinator queue is closed"))
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        // The coordinator exits first (it holds partition-queue handles); only then
        // can the partition workers observe queue closure and join.
        if let Some(coordinator) = self.coordinator.take() {
            let _ = coordinator.send(CoordinatorMessage::Shutdown);
        }
        drop(self.runtime.take());
        if let Some(handle) = self.coordinator_worker.take() {
            let _ = handle.join();
        }
    }
}
