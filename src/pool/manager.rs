//! Target → pool mapping with idle-pool eviction.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::addr::Target;
use crate::context::Context;
use crate::dial::Connect;
use crate::error::{TransportError, TransportResult};
use crate::pool::{Lease, PoolHandle, PoolOptions};

/// Bound on each liveness query during a sweep.
const LIVENESS_QUERY_TIMEOUT: Duration = Duration::from_secs(1);

/// Bound on one pool's shutdown, idle-triggered or final.
const POOL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// A pool can close between lookup and acquire; retry on a fresh pool this often.
const MAX_ACQUIRE_ATTEMPTS: usize = 3;

#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Pools with no acquire request for this long are shut down.
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(10),
        }
    }
}

enum ManagerCommand {
    GetPool {
        target: Target,
        reply: oneshot::Sender<PoolHandle>,
    },
    Targets {
        reply: oneshot::Sender<Vec<Target>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to the pool manager task. Cheap to clone.
#[derive(Clone)]
pub struct PoolManager {
    tx: mpsc::UnboundedSender<ManagerCommand>,
}

impl PoolManager {
    /// Start the manager. It shuts every pool down when `shutdown` fires.
    pub fn spawn(
        connector: Arc<dyn Connect>,
        pool_options: PoolOptions,
        options: ManagerOptions,
        shutdown: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let actor = ManagerActor {
            connector,
            pool_options,
            options,
            pools: HashMap::new(),
            sweeping: false,
        };
        tokio::spawn(actor.run(rx, shutdown));
        Self { tx }
    }

    /// The pool for `target`, created on first use.
    pub async fn pool(&self, ctx: &Context, target: &Target) -> TransportResult<PoolHandle> {
        let closed = || TransportError::PoolClosed {
            target: target.to_string(),
        };
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ManagerCommand::GetPool {
                target: target.clone(),
                reply,
            })
            .map_err(|_| closed())?;
        ctx.run(rx).await?.map_err(|_| closed())
    }

    /// Check out a connection for `target`.
    pub async fn acquire(&self, ctx: &Context, target: &Target) -> TransportResult<Lease> {
        let mut attempt = 1;
        loop {
            let pool = self.pool(ctx, target).await?;
            match pool.acquire(ctx).await {
                Err(TransportError::PoolClosed { .. }) if attempt < MAX_ACQUIRE_ATTEMPTS => {
                    tracing::debug!(target = %target, attempt, "Pool closed during acquire, retrying");
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    /// Targets that currently have a pool.
    pub async fn targets(&self) -> Vec<Target> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(ManagerCommand::Targets { reply }).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Shut down every pool and stop the manager.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(ManagerCommand::Shutdown { reply }).is_ok() {
            let _ = rx.await;
        }
    }
}

struct ManagerActor {
    connector: Arc<dyn Connect>,
    pool_options: PoolOptions,
    options: ManagerOptions,
    pools: HashMap<Target, PoolHandle>,
    sweeping: bool,
}

impl ManagerActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<ManagerCommand>, shutdown: CancellationToken) {
        let mut sweep = time::interval_at(
            Instant::now() + self.options.sweep_interval,
            self.options.sweep_interval,
        );
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let (swept_tx, mut swept_rx) = mpsc::unbounded_channel::<Vec<Target>>();

        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(ManagerCommand::GetPool { target, reply }) => {
                        let pool = self.get_or_create(target);
                        let _ = reply.send(pool);
                    }
                    Some(ManagerCommand::Targets { reply }) => {
                        let _ = reply.send(self.pools.keys().cloned().collect());
                    }
                    Some(ManagerCommand::Shutdown { reply }) => {
                        rx.close();
                        self.shutdown_all().await;
                        let _ = reply.send(());
                        break;
                    }
                    None => {
                        self.shutdown_all().await;
                        break;
                    }
                },
                _ = sweep.tick() => self.start_sweep(&swept_tx),
                Some(evicted) = swept_rx.recv() => self.finish_sweep(evicted),
                _ = shutdown.cancelled() => {
                    rx.close();
                    self.shutdown_all().await;
                    break;
                }
            }
        }

        // Late shutdown requests still get their confirmation.
        while let Ok(cmd) = rx.try_recv() {
            if let ManagerCommand::Shutdown { reply } = cmd {
                let _ = reply.send(());
            }
        }
    }

    fn get_or_create(&mut self, target: Target) -> PoolHandle {
        if let Some(pool) = self.pools.get(&target) {
            if !pool.is_closed() {
                return pool.clone();
            }
        }
        tracing::debug!(target = %target, "Creating connection pool");
        let pool = PoolHandle::spawn(target.clone(), self.connector.clone(), self.pool_options.clone());
        self.pools.insert(target, pool.clone());
        pool
    }

    /// Check every pool from a separate task; a pool stuck in a dial must not
    /// hold up `GetPool` for other targets.
    fn start_sweep(&mut self, swept: &mpsc::UnboundedSender<Vec<Target>>) {
        if self.sweeping || self.pools.is_empty() {
            return;
        }
        self.sweeping = true;

        let idle_timeout = self.options.idle_timeout;
        let pools: Vec<(Target, PoolHandle)> = self
            .pools
            .iter()
            .map(|(target, pool)| (target.clone(), pool.clone()))
            .collect();
        let swept = swept.clone();

        tokio::spawn(async move {
            let checks = pools
                .into_iter()
                .map(|(target, pool)| sweep_one(target, pool, idle_timeout));
            let evicted: Vec<Target> = join_all(checks).await.into_iter().flatten().collect();
            let _ = swept.send(evicted);
        });
    }

    fn finish_sweep(&mut self, evicted: Vec<Target>) {
        self.sweeping = false;
        for target in evicted {
            // A replacement pool may already sit under this key.
            if self.pools.get(&target).is_some_and(PoolHandle::is_closed) {
                self.pools.remove(&target);
                tracing::info!(target = %target, "Evicted idle connection pool");
            }
        }
    }

    async fn shutdown_all(&mut self) {
        let pools: Vec<PoolHandle> = self.pools.drain().map(|(_, pool)| pool).collect();
        join_all(pools.iter().map(|pool| async move {
            if time::timeout(POOL_SHUTDOWN_TIMEOUT, pool.shutdown()).await.is_err() {
                tracing::warn!(target = %pool.target(), "Pool did not shut down in time");
            }
        }))
        .await;
        tracing::info!(pools = pools.len(), "Pool manager shut down");
    }
}

/// `Some(target)` when the pool is gone after this check.
async fn sweep_one(target: Target, pool: PoolHandle, idle_timeout: Duration) -> Option<Target> {
    let last = match time::timeout(LIVENESS_QUERY_TIMEOUT, pool.last_request()).await {
        Ok(Some(last)) => last,
        Ok(None) => return Some(target),
        Err(_) => {
            tracing::warn!(target = %target, "Pool liveness query timed out");
            return None;
        }
    };
    if last.elapsed() < idle_timeout {
        return None;
    }

    // The pool re-checks inside its own task, so an acquire that raced this
    // sweep keeps it alive.
    match time::timeout(POOL_SHUTDOWN_TIMEOUT, pool.shutdown_if_idle(idle_timeout)).await {
        Ok(true) => Some(target),
        Ok(false) => None,
        Err(_) => {
            tracing::warn!(target = %target, "Idle pool shutdown timed out");
            None
        }
    }
}
