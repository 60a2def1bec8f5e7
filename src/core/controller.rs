//! Reconciliation of stored API entities against a gateway driver.
//!
//! Entity changes arrive through a [`Watcher`] and are sharded by
//! `(organization, name)` onto single-consumer worker queues, so changes to
//! one entity are applied in the order they were announced while different
//! entities proceed in parallel. A resync ticker re-announces entities stuck
//! in a transitional status as a backstop for missed or failed events.
use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use chrono::{TimeDelta, Utc};
use eyre::{Result, WrapErr, eyre};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};

use crate::{
    core::api::{Api, ApiEntity, Status},
    metrics,
    ports::{
        entity_store::{EntityFilter, EntityStore},
        gateway::Gateway,
    },
    tracing_setup,
};

#[derive(Debug, Clone, Copy)]
pub struct ControllerOptions {
    pub resync_period: Duration,
    pub workers: usize,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            resync_period: Duration::from_secs(60),
            workers: 1,
        }
    }
}

/// Announces entity changes to the controller.
#[derive(Debug, Clone)]
pub struct Watcher {
    tx: mpsc::UnboundedSender<ApiEntity>,
}

impl Watcher {
    /// A watcher detached from any controller, with the receiving end of its events.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ApiEntity>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn on_action(&self, entity: ApiEntity) {
        let key = entity.key();
        if self.tx.send(entity).is_err() {
            warn!(entity = %key, "controller is not running, dropping event");
        }
    }
}

/// Converges the gateway driver towards one entity's declared state and
/// records the outcome in the store.
pub struct ApiEntityHandler {
    store: Arc<dyn EntityStore>,
    gateway: Arc<dyn Gateway>,
    resync_period: Duration,
}

impl ApiEntityHandler {
    pub fn new(
        store: Arc<dyn EntityStore>,
        gateway: Arc<dyn Gateway>,
        resync_period: Duration,
    ) -> Self {
        Self {
            store,
            gateway,
            resync_period,
        }
    }

    /// Route an entity to the handler for its status.
    pub async fn process(&self, entity: ApiEntity) -> Result<()> {
        if entity.delete {
            return self.delete(entity).await;
        }
        match entity.status {
            Status::Initialized | Status::Creating => self.add(entity).await,
            Status::Updating | Status::Ready => self.update(entity).await,
            Status::Deleting => self.delete(entity).await,
            Status::Error => self.error(entity).await,
            Status::Deleted => {
                debug!(entity = %entity.key(), "entity already deleted, nothing to do");
                Ok(())
            }
        }
    }

    pub async fn add(&self, mut entity: ApiEntity) -> Result<()> {
        let span = tracing_setup::create_reconcile_span("add", &entity.api);
        async {
            let outcome = self
                .gateway
                .add_api(&entity.api)
                .await
                .wrap_err("gateway error when adding api");
            self.finish("add", &mut entity, outcome).await
        }
        .instrument(span)
        .await
    }

    /// Idempotent upsert: falls back to an add when the driver has no such API.
    pub async fn update(&self, mut entity: ApiEntity) -> Result<()> {
        let span = tracing_setup::create_reconcile_span("update", &entity.api);
        async {
            let outcome = match self.gateway.update_api(&entity.api.name, &entity.api).await {
                Err(e) if e.is_not_found() => {
                    debug!(api = %entity.api.name, "api missing from gateway, adding it");
                    self.gateway
                        .add_api(&entity.api)
                        .await
                        .wrap_err("gateway error when adding api")
                }
                other => other.wrap_err("gateway error when updating api"),
            };
            self.finish("update", &mut entity, outcome).await
        }
        .instrument(span)
        .await
    }

    pub async fn delete(&self, entity: ApiEntity) -> Result<()> {
        let span = tracing_setup::create_reconcile_span("delete", &entity.api);
        let outcome = async {
            match self.gateway.delete_api(&entity.api).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {
                    debug!(api = %entity.api.name, "api already absent from gateway");
                }
                Err(e) => return Err(e).wrap_err("gateway error when deleting api"),
            }

            match self
                .store
                .delete(&entity.organization_id, &entity.name)
                .await
            {
                Err(e) if !e.is_not_found() => {
                    Err(e).wrap_err("store error when deleting api entity")
                }
                _ => {
                    info!(entity = %entity.key(), "api deleted");
                    Ok(())
                }
            }
        }
        .instrument(span)
        .await;

        if let Err(e) = &outcome {
            error!(entity = %entity.key(), error = %format!("{e:#}"), "failed to delete api");
        }
        metrics::record_reconcile("delete", outcome.is_ok());
        outcome
    }

    /// Entities in `ERROR` are reported, not repaired.
    pub async fn error(&self, entity: ApiEntity) -> Result<()> {
        warn!(
            entity = %entity.key(),
            reason = ?entity.reason,
            "api entity is in error state"
        );
        metrics::record_reconcile("error", true);
        Ok(())
    }

    /// Entities stuck in a transitional status for longer than one resync period.
    pub async fn sync(&self) -> Result<Vec<ApiEntity>> {
        let period = TimeDelta::from_std(self.resync_period).unwrap_or_else(|_| TimeDelta::zero());
        let filter = EntityFilter::new()
            .status_in([Status::Creating, Status::Updating, Status::Deleting])
            .modified_before(Utc::now() - period);
        self.store
            .list_global(&filter)
            .await
            .wrap_err("store error when listing apis for resync")
    }

    /// Record a driver outcome: `READY` with the driver's identity, or `ERROR`.
    async fn finish(
        &self,
        operation: &'static str,
        entity: &mut ApiEntity,
        outcome: Result<Api>,
    ) -> Result<()> {
        let reason = match &outcome {
            Ok(applied) => {
                if !applied.id.is_empty() {
                    entity.api.id.clone_from(&applied.id);
                }
                if applied.created_at != 0 {
                    entity.api.created_at = applied.created_at;
                }
                entity.status = Status::Ready;
                entity.reason.clear();
                info!(entity = %entity.key(), operation, "api ready");
                None
            }
            Err(e) => {
                let reason = format!("{e:#}");
                error!(entity = %entity.key(), operation, error = %reason, "reconciliation failed");
                Some(reason)
            }
        };

        self.store.update_with_error(entity, reason).await;
        metrics::record_reconcile(operation, outcome.is_ok());
        outcome.map(|_| ())
    }
}

/// Runs an [`ApiEntityHandler`] over a stream of entity events.
pub struct Controller {
    handler: Arc<ApiEntityHandler>,
    options: ControllerOptions,
    tx: mpsc::UnboundedSender<ApiEntity>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<ApiEntity>>>,
    token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Controller {
    pub fn new(
        options: ControllerOptions,
        store: Arc<dyn EntityStore>,
        gateway: Arc<dyn Gateway>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            handler: Arc::new(ApiEntityHandler::new(
                store,
                gateway,
                options.resync_period,
            )),
            options: ControllerOptions {
                workers: options.workers.max(1),
                ..options
            },
            tx,
            rx: Mutex::new(Some(rx)),
            token: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Stop when `token` is cancelled, in addition to [`Controller::shutdown`].
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    pub fn watcher(&self) -> Watcher {
        Watcher {
            tx: self.tx.clone(),
        }
    }

    pub fn handler(&self) -> Arc<ApiEntityHandler> {
        self.handler.clone()
    }

    /// Run one sync pass to completion, then start the workers and the resync
    /// ticker. A zero resync period disables the ticker.
    pub async fn start(&self) -> Result<()> {
        let rx = self
            .rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| eyre!("controller already started"))?;

        for entity in self.handler.sync().await? {
            let key = entity.key();
            if let Err(e) = self.handler.process(entity).await {
                warn!(entity = %key, error = %format!("{e:#}"), "initial sync failed");
            }
        }

        let mut tasks = Vec::with_capacity(self.options.workers + 2);
        let mut shards = Vec::with_capacity(self.options.workers);
        for worker in 0..self.options.workers {
            let (shard_tx, shard_rx) = mpsc::unbounded_channel();
            shards.push(shard_tx);
            tasks.push(tokio::spawn(run_worker(
                worker,
                self.handler.clone(),
                shard_rx,
                self.token.clone(),
            )));
        }
        tasks.push(tokio::spawn(route_events(rx, shards, self.token.clone())));
        if self.options.resync_period.is_zero() {
            warn!("resync period is zero, periodic resync disabled");
        } else {
            tasks.push(tokio::spawn(run_resync(
                self.handler.clone(),
                self.watcher(),
                self.options.resync_period,
                self.token.clone(),
            )));
        }

        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(tasks);
        info!(
            workers = self.options.workers,
            resync_period = ?self.options.resync_period,
            "controller started"
        );
        Ok(())
    }

    /// Cancel all controller tasks and wait for them to stop.
    pub async fn shutdown(&self) {
        self.token.cancel();
        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "controller task ended abnormally");
            }
        }
        info!("controller stopped");
    }
}

fn shard_for(entity: &ApiEntity, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    (&entity.organization_id, &entity.name).hash(&mut hasher);
    (hasher.finish() % shards as u64) as usize
}

async fn route_events(
    mut rx: mpsc::UnboundedReceiver<ApiEntity>,
    shards: Vec<mpsc::UnboundedSender<ApiEntity>>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            next = rx.recv() => {
                let Some(entity) = next else { break };
                let shard = shard_for(&entity, shards.len());
                if shards[shard].send(entity).is_err() {
                    warn!(shard, "worker queue closed");
                }
            }
        }
    }
}

async fn run_worker(
    worker: usize,
    handler: Arc<ApiEntityHandler>,
    mut rx: mpsc::UnboundedReceiver<ApiEntity>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            next = rx.recv() => {
                let Some(entity) = next else { break };
                let key = entity.key();
                debug!(worker, entity = %key, status = %entity.status, "processing entity");
                if let Err(e) = handler.process(entity).await {
                    debug!(worker, entity = %key, error = %format!("{e:#}"), "entity not reconciled");
                }
            }
        }
    }
}

async fn run_resync(
    handler: Arc<ApiEntityHandler>,
    watcher: Watcher,
    period: Duration,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately and start() has just synced.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => match handler.sync().await {
                Ok(entities) => {
                    if !entities.is_empty() {
                        debug!(count = entities.len(), "resync found pending entities");
                    }
                    for entity in entities {
                        watcher.on_action(entity);
                    }
                }
                Err(e) => error!(error = %format!("{e:#}"), "resync failed"),
            },
        }
    }
}
