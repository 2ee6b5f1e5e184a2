//! Connection pooling subsystem.
//!
//! # Data Flow
//! ```text
//! PoolManager::acquire(target)
//!     → manager.rs actor (target → PoolHandle, created on first use)
//!     → actor.rs pool task (youngest fresh idle connection, or dial via Connect)
//!     → lease.rs (checked-out handle)
//!     → release → back to the pool task's idle set
//!       discard / close / drop → connection closed
//! ```
//!
//! # Design Decisions
//! - One task per pool and one for the manager; state is never shared, only messaged
//! - Dials run inside the pool task: at most one dial in flight per target
//! - Release never blocks; a pool that is shutting down hands the connection back
//! - GC evicts at most one stale connection per tick
//! - The manager confirms idleness inside the pool task before removing it

pub mod actor;
pub mod lease;
pub mod manager;

pub use actor::{PoolHandle, PoolOptions, PoolStats};
pub use lease::Lease;
pub use manager::{ManagerOptions, PoolManager};

#[cfg(test)]
pub(crate) mod testing {
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use crate::addr::Target;
    use crate::context::Context;
    use crate::dial::Connect;
    use crate::error::{TransportError, TransportResult};
    use crate::net::Connection;
    use crate::pool::{Lease, PoolHandle, PoolOptions};

    /// Dials in-memory connections whose peer writes `payload` then waits for close.
    pub(crate) struct ScriptedConnector {
        payload: Vec<u8>,
        fragment: usize,
        eof: bool,
        fail: bool,
        dials: AtomicUsize,
        pub(crate) closed: Arc<AtomicUsize>,
    }

    impl ScriptedConnector {
        pub(crate) fn new(payload: &[u8]) -> Arc<Self> {
            Self::build(payload, usize::MAX, false, false)
        }

        /// Peer writes `payload` in pieces of at most `fragment` bytes.
        pub(crate) fn fragmented(payload: &[u8], fragment: usize) -> Arc<Self> {
            Self::build(payload, fragment, false, false)
        }

        /// Peer writes `payload` in `fragment`-sized pieces, then ends its side.
        pub(crate) fn eof_after(payload: &[u8], fragment: usize) -> Arc<Self> {
            Self::build(payload, fragment, true, false)
        }

        pub(crate) fn failing() -> Arc<Self> {
            Self::build(b"", 1, false, true)
        }

        fn build(payload: &[u8], fragment: usize, eof: bool, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                payload: payload.to_vec(),
                fragment: fragment.max(1),
                eof,
                fail,
                dials: AtomicUsize::new(0),
                closed: Arc::new(AtomicUsize::new(0)),
            })
        }

        pub(crate) fn dials(&self) -> usize {
            self.dials.load(Ordering::SeqCst)
        }

        /// Wait until at least `n` connections were closed by the client side.
        pub(crate) async fn wait_closed(&self, n: usize) {
            tokio::time::timeout(Duration::from_secs(2), async {
                while self.closed.load(Ordering::SeqCst) < n {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .unwrap_or_else(|_| {
                panic!(
                    "expected {n} closed connection(s), saw {}",
                    self.closed.load(Ordering::SeqCst)
                )
            });
        }
    }

    /// A pool over `connector` plus one fresh lease from it.
    pub(crate) async fn scripted_lease(connector: &Arc<ScriptedConnector>) -> (PoolHandle, Lease) {
        let pool = PoolHandle::spawn(
            Target::plain("origin.test:80".parse().unwrap()),
            connector.clone(),
            PoolOptions::default(),
        );
        let lease = pool.acquire(&Context::background()).await.unwrap();
        (pool, lease)
    }

    #[async_trait]
    impl Connect for ScriptedConnector {
        async fn connect(&self, ctx: &Context, target: &Target) -> TransportResult<Connection> {
            ctx.check()?;
            if self.fail {
                return Err(TransportError::Dial {
                    addr: target.destination.to_string(),
                    attempts: 1,
                    source: io::Error::from(io::ErrorKind::ConnectionRefused),
                });
            }
            self.dials.fetch_add(1, Ordering::SeqCst);

            let (client, mut server) = tokio::io::duplex(64 * 1024);
            let payload = self.payload.clone();
            let fragment = self.fragment;
            let eof = self.eof;
            let closed = self.closed.clone();
            tokio::spawn(async move {
                for piece in payload.chunks(fragment) {
                    if server.write_all(piece).await.is_err() {
                        break;
                    }
                    tokio::task::yield_now().await;
                }
                if eof {
                    let _ = server.shutdown().await;
                }
                let mut sink = Vec::new();
                let _ = server.read_to_end(&mut sink).await;
                closed.fetch_add(1, Ordering::SeqCst);
            });
            Ok(Connection::new(target.destination.clone(), client))
        }
    }
}
