//! Per-target connection pool actor.
//!
//! One task owns the idle set for a [`Target`]. Acquire, release and
//! housekeeping all arrive as messages on a single queue and are handled in
//! order, so the idle set needs no lock.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::addr::Target;
use crate::context::Context;
use crate::dial::Connect;
use crate::error::{TransportError, TransportResult};
use crate::net::Connection;
use crate::pool::Lease;

/// Idle-connection timing for one pool.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Idle connections older than this are never handed out.
    pub idle_timeout: Duration,
    /// How often the oldest idle connection is checked for staleness.
    pub gc_interval: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(30),
            gc_interval: Duration::from_secs(1),
        }
    }
}

/// Point-in-time view of a pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub idle: usize,
    pub dials: u64,
    pub reuses: u64,
    pub since_last_request: Duration,
}

type AcquireReply = TransportResult<(Connection, bool)>;

pub(crate) enum PoolCommand {
    Acquire {
        ctx: Context,
        reply: oneshot::Sender<AcquireReply>,
    },
    Release {
        conn: Connection,
    },
    Stats {
        reply: oneshot::Sender<PoolStats>,
    },
    LastRequest {
        reply: oneshot::Sender<Instant>,
    },
    ShutdownIfIdle {
        threshold: Duration,
        reply: oneshot::Sender<bool>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a running pool. Cheap to clone; every [`Lease`] holds one.
#[derive(Clone)]
pub struct PoolHandle {
    target: Arc<Target>,
    tx: mpsc::UnboundedSender<PoolCommand>,
}

impl PoolHandle {
    /// Start the pool task for `target`.
    pub fn spawn(target: Target, connector: Arc<dyn Connect>, options: PoolOptions) -> Self {
        let target = Arc::new(target);
        let (tx, rx) = mpsc::unbounded_channel();
        let actor = PoolActor {
            target: target.clone(),
            connector,
            options,
            idle: VecDeque::new(),
            last_request: Instant::now(),
            dials: 0,
            reuses: 0,
        };
        tokio::spawn(actor.run(rx));
        Self { target, tx }
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Whether the pool has stopped accepting messages.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Check out an idle connection, or dial a new one.
    ///
    /// Dials run inside the pool task, so concurrent callers for a cold target
    /// wait behind a single dial.
    pub async fn acquire(&self, ctx: &Context) -> TransportResult<Lease> {
        ctx.check()?;
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(PoolCommand::Acquire {
                ctx: ctx.clone(),
                reply,
            })
            .map_err(|_| self.closed())?;

        let (conn, reused) = ctx.run(rx).await?.map_err(|_| self.closed())??;
        Ok(Lease::new(conn, self.clone(), reused))
    }

    /// Return a connection to the idle set. Never blocks.
    ///
    /// Hands the connection back when the pool is shutting down; the caller
    /// must close it.
    pub(crate) fn release(&self, conn: Connection) -> Result<(), Connection> {
        match self.tx.send(PoolCommand::Release { conn }) {
            Err(mpsc::error::SendError(PoolCommand::Release { conn })) => Err(conn),
            _ => Ok(()),
        }
    }

    pub async fn stats(&self) -> TransportResult<PoolStats> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(PoolCommand::Stats { reply })
            .map_err(|_| self.closed())?;
        rx.await.map_err(|_| self.closed())
    }

    /// When the pool last received an acquire request.
    pub async fn last_request(&self) -> Option<Instant> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(PoolCommand::LastRequest { reply }).ok()?;
        rx.await.ok()
    }

    /// Shut down if no acquire arrived within `threshold`.
    ///
    /// Returns `true` when the pool is gone, whether it stopped now or earlier.
    pub async fn shutdown_if_idle(&self, threshold: Duration) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(PoolCommand::ShutdownIfIdle { threshold, reply })
            .is_err()
        {
            return true;
        }
        rx.await.unwrap_or(true)
    }

    /// Close every idle connection and stop the pool.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(PoolCommand::Shutdown { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    fn closed(&self) -> TransportError {
        TransportError::PoolClosed {
            target: self.target.to_string(),
        }
    }
}

impl std::fmt::Debug for PoolHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolHandle")
            .field("target", &self.target.to_string())
            .field("closed", &self.is_closed())
            .finish()
    }
}

struct IdleConnection {
    conn: Connection,
    returned_at: Instant,
}

struct PoolActor {
    target: Arc<Target>,
    connector: Arc<dyn Connect>,
    options: PoolOptions,
    /// Oldest at the front, youngest at the back.
    idle: VecDeque<IdleConnection>,
    last_request: Instant,
    dials: u64,
    reuses: u64,
}

impl PoolActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<PoolCommand>) {
        let mut gc = time::interval_at(
            Instant::now() + self.options.gc_interval,
            self.options.gc_interval,
        );
        gc.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(target = %self.target, "Connection pool started");

        loop {
            tokio::select! {
                cmd = rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    match cmd {
                        PoolCommand::Acquire { ctx, reply } => self.acquire(ctx, reply).await,
                        PoolCommand::Release { conn } => self.release(conn),
                        PoolCommand::Stats { reply } => {
                            let _ = reply.send(self.stats());
                        }
                        PoolCommand::LastRequest { reply } => {
                            let _ = reply.send(self.last_request);
                        }
                        PoolCommand::ShutdownIfIdle { threshold, reply } => {
                            if self.last_request.elapsed() >= threshold {
                                self.shutdown(&mut rx).await;
                                let _ = reply.send(true);
                                return;
                            }
                            let _ = reply.send(false);
                        }
                        PoolCommand::Shutdown { reply } => {
                            self.shutdown(&mut rx).await;
                            let _ = reply.send(());
                            return;
                        }
                    }
                }
                _ = gc.tick() => self.evict_oldest_if_stale(),
            }
        }

        // Every handle is gone; nothing can check out again.
        self.shutdown(&mut rx).await;
    }

    async fn acquire(&mut self, ctx: Context, reply: oneshot::Sender<AcquireReply>) {
        self.last_request = Instant::now();
        if reply.is_closed() {
            return;
        }

        if let Some(conn) = self.take_idle() {
            self.reuses += 1;
            tracing::debug!(target = %self.target, connection_id = %conn.id(), "Reusing idle connection");
            if let Err(Ok((conn, _))) = reply.send(Ok((conn, true))) {
                self.insert_idle(conn);
            }
            return;
        }

        let started = Instant::now();
        let result = self.connector.connect(&ctx, &self.target).await;
        match result {
            Ok(conn) => {
                self.dials += 1;
                tracing::debug!(
                    target = %self.target,
                    connection_id = %conn.id(),
                    elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                    "Dialed new connection"
                );
                // A caller that gave up still leaves a usable connection behind.
                if let Err(Ok((conn, _))) = reply.send(Ok((conn, false))) {
                    self.insert_idle(conn);
                }
            }
            Err(e) => {
                tracing::warn!(target = %self.target, error = %e, "Dial failed");
                let _ = reply.send(Err(e));
            }
        }
    }

    /// Youngest idle connection that is still fresh.
    ///
    /// The back is the youngest, so a stale back means the whole set is stale.
    fn take_idle(&mut self) -> Option<Connection> {
        let idle = self.idle.pop_back()?;
        if idle.returned_at.elapsed() <= self.options.idle_timeout {
            return Some(idle.conn);
        }

        let stale = self.idle.len() + 1;
        tracing::debug!(target = %self.target, stale, "Dropping stale idle connections");
        idle.conn.close_in_background();
        for idle in self.idle.drain(..) {
            idle.conn.close_in_background();
        }
        None
    }

    fn release(&mut self, conn: Connection) {
        tracing::debug!(target = %self.target, connection_id = %conn.id(), "Connection released");
        self.insert_idle(conn);
    }

    fn insert_idle(&mut self, conn: Connection) {
        self.idle.push_back(IdleConnection {
            conn,
            returned_at: Instant::now(),
        });
    }

    /// One eviction per tick at most.
    fn evict_oldest_if_stale(&mut self) {
        let stale = matches!(
            self.idle.front(),
            Some(oldest) if oldest.returned_at.elapsed() > self.options.idle_timeout
        );
        if !stale {
            return;
        }
        if let Some(oldest) = self.idle.pop_front() {
            tracing::debug!(
                target = %self.target,
                connection_id = %oldest.conn.id(),
                idle_ms = u64::try_from(oldest.returned_at.elapsed().as_millis()).unwrap_or(u64::MAX),
                "Evicting stale idle connection"
            );
            oldest.conn.close_in_background();
        }
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            idle: self.idle.len(),
            dials: self.dials,
            reuses: self.reuses,
            since_last_request: self.last_request.elapsed(),
        }
    }

    async fn shutdown(&mut self, rx: &mut mpsc::UnboundedReceiver<PoolCommand>) {
        // From here on, sends fail and releasing callers close their own connections.
        rx.close();

        let mut closing: Vec<Connection> = self.idle.drain(..).map(|idle| idle.conn).collect();
        let mut waiting = Vec::new();
        while let Ok(cmd) = rx.try_recv() {
            match cmd {
                PoolCommand::Acquire { reply, .. } => {
                    let _ = reply.send(Err(TransportError::PoolClosed {
                        target: self.target.to_string(),
                    }));
                }
                PoolCommand::Release { conn } => closing.push(conn),
                PoolCommand::Stats { reply } => {
                    let _ = reply.send(self.stats());
                }
                PoolCommand::LastRequest { reply } => {
                    let _ = reply.send(self.last_request);
                }
                PoolCommand::ShutdownIfIdle { reply, .. } => {
                    let _ = reply.send(true);
                }
                PoolCommand::Shutdown { reply } => waiting.push(reply),
            }
        }

        let closed = closing.len();
        join_all(closing.into_iter().map(Connection::close)).await;
        for reply in waiting {
            let _ = reply.send(());
        }
        tracing::info!(target = %self.target, closed, dials = self.dials, reuses = self.reuses, "Connection pool shut down");
    }
}
