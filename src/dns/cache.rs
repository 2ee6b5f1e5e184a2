//! TTL cache in front of a resolver.
//!
//! A single background task owns the entry table. Lookups are messages; misses
//! spawn one resolve per hostname and every concurrent lookup for that name
//! waits on the same result.

use std::collections::HashMap;
use std::io;
use std::net::IpAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use rand::seq::SliceRandom;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

use crate::context::Context;
use crate::dns::resolver::Resolve;
use crate::error::TransportError;

/// Cache timing.
#[derive(Debug, Clone)]
pub struct DnsOptions {
    /// How long a resolved entry stays valid.
    pub ttl: Duration,
    /// How often expired entries are purged.
    pub refresh_interval: Duration,
}

impl Default for DnsOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            refresh_interval: Duration::from_secs(60),
        }
    }
}

type LookupReply = Result<Arc<[IpAddr]>, (io::ErrorKind, String)>;

enum DnsCommand {
    Lookup {
        host: String,
        reply: oneshot::Sender<LookupReply>,
    },
    Len {
        reply: oneshot::Sender<usize>,
    },
}

struct Entry {
    addrs: Arc<[IpAddr]>,
    inserted: Instant,
}

/// Handle to the DNS cache task. Cheap to clone.
#[derive(Clone)]
pub struct DnsCache {
    tx: mpsc::UnboundedSender<DnsCommand>,
}

impl DnsCache {
    /// Start the cache task. It stops when `shutdown` fires or every handle is dropped.
    pub fn spawn(
        resolver: Arc<dyn Resolve>,
        options: DnsOptions,
        shutdown: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let actor = DnsActor {
            resolver,
            options,
            entries: HashMap::new(),
            waiters: HashMap::new(),
            resolving: JoinSet::new(),
        };
        tokio::spawn(actor.run(rx, shutdown));
        Self { tx }
    }

    /// Resolve `host` to a freshly shuffled list of addresses.
    ///
    /// IP literals are returned as-is without touching the resolver.
    pub async fn lookup(&self, ctx: &Context, host: &str) -> Result<Vec<IpAddr>, TransportError> {
        let literal = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = literal.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }

        let host = host.trim_end_matches('.').to_ascii_lowercase();
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(DnsCommand::Lookup {
                host: host.clone(),
                reply,
            })
            .map_err(|_| dns_closed(&host))?;

        let addrs = match ctx.run(rx).await? {
            Ok(Ok(addrs)) => addrs,
            Ok(Err((kind, message))) => {
                return Err(TransportError::Dns {
                    host,
                    source: io::Error::new(kind, message),
                })
            }
            Err(_) => return Err(dns_closed(&host)),
        };

        let mut shuffled = addrs.to_vec();
        shuffled.shuffle(&mut rand::thread_rng());
        Ok(shuffled)
    }

    /// Number of cached hostnames, expired or not.
    pub async fn len(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(DnsCommand::Len { reply }).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

fn dns_closed(host: &str) -> TransportError {
    TransportError::Dns {
        host: host.to_string(),
        source: io::Error::new(io::ErrorKind::BrokenPipe, "DNS cache is shut down"),
    }
}

struct DnsActor {
    resolver: Arc<dyn Resolve>,
    options: DnsOptions,
    entries: HashMap<String, Entry>,
    waiters: HashMap<String, Vec<oneshot::Sender<LookupReply>>>,
    resolving: JoinSet<(String, io::Result<Vec<IpAddr>>)>,
}

impl DnsActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<DnsCommand>, shutdown: CancellationToken) {
        tracing::debug!(
            ttl_secs = self.options.ttl.as_secs(),
            refresh_secs = self.options.refresh_interval.as_secs(),
            "DNS cache starting"
        );

        let mut ticker = time::interval(self.options.refresh_interval);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                Some(joined) = self.resolving.join_next() => match joined {
                    Ok((host, result)) => self.complete(host, result),
                    Err(e) => tracing::error!(error = %e, "DNS resolve task failed"),
                },
                _ = ticker.tick() => self.purge_expired(),
                _ = shutdown.cancelled() => {
                    tracing::debug!("DNS cache received shutdown signal, exiting loop");
                    break;
                }
            }
        }

        self.resolving.abort_all();
    }

    fn handle(&mut self, command: DnsCommand) {
        match command {
            DnsCommand::Lookup { host, reply } => {
                if let Some(entry) = self.entries.get(&host) {
                    if entry.inserted.elapsed() < self.options.ttl {
                        tracing::trace!(host = %host, "DNS cache hit");
                        let _ = reply.send(Ok(entry.addrs.clone()));
                        return;
                    }
                }

                let waiters = self.waiters.entry(host.clone()).or_default();
                waiters.push(reply);
                if waiters.len() == 1 {
                    tracing::trace!(host = %host, "DNS cache miss, resolving");
                    let resolver = self.resolver.clone();
                    self.resolving.spawn(async move {
                        // A panicking resolver must still answer the waiters.
                        let result = AssertUnwindSafe(resolver.resolve(&host))
                            .catch_unwind()
                            .await
                            .unwrap_or_else(|_| {
                                Err(io::Error::new(io::ErrorKind::Other, "resolver panicked"))
                            });
                        (host, result)
                    });
                }
            }
            DnsCommand::Len { reply } => {
                let _ = reply.send(self.entries.len());
            }
        }
    }

    fn complete(&mut self, host: String, result: io::Result<Vec<IpAddr>>) {
        let reply: LookupReply = match result {
            Ok(addrs) => {
                let addrs: Arc<[IpAddr]> = addrs.into();
                if addrs.is_empty() {
                    self.entries.remove(&host);
                } else {
                    tracing::debug!(host = %host, count = addrs.len(), "DNS entry cached");
                    self.entries.insert(
                        host.clone(),
                        Entry {
                            addrs: addrs.clone(),
                            inserted: Instant::now(),
                        },
                    );
                }
                Ok(addrs)
            }
            Err(e) => {
                tracing::warn!(host = %host, error = %e, "DNS resolution failed");
                Err((e.kind(), e.to_string()))
            }
        };

        for waiter in self.waiters.remove(&host).unwrap_or_default() {
            let _ = waiter.send(reply.clone());
        }
    }

    fn purge_expired(&mut self) {
        let ttl = self.options.ttl;
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.inserted.elapsed() < ttl);
        let purged = before - self.entries.len();
        if purged > 0 {
            tracing::debug!(purged, remaining = self.entries.len(), "Purged expired DNS entries");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingResolver {
        calls: AtomicUsize,
        ips: Vec<IpAddr>,
        fail_after: Option<usize>,
        delay: Duration,
    }

    impl CountingResolver {
        fn new(ips: &[&str]) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                ips: ips.iter().map(|ip| ip.parse().unwrap()).collect(),
                fail_after: None,
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl Resolve for CountingResolver {
        async fn resolve(&self, _host: &str) -> io::Result<Vec<IpAddr>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if matches!(self.fail_after, Some(limit) if n >= limit) {
                return Err(io::Error::new(io::ErrorKind::Other, "resolver down"));
            }
            Ok(self.ips.clone())
        }
    }

    fn cache_with(resolver: Arc<CountingResolver>, ttl: Duration) -> DnsCache {
        DnsCache::spawn(
            resolver,
            DnsOptions {
                ttl,
                refresh_interval: Duration::from_secs(60),
            },
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn ip_literal_bypasses_resolver() {
        let resolver = Arc::new(CountingResolver::new(&["10.0.0.1"]));
        let cache = cache_with(resolver.clone(), Duration::from_secs(60));
        let ctx = Context::background();

        let ips = cache.lookup(&ctx, "192.0.2.7").await.unwrap();
        assert_eq!(ips, vec!["192.0.2.7".parse::<IpAddr>().unwrap()]);
        let ips = cache.lookup(&ctx, "[::1]").await.unwrap();
        assert_eq!(ips, vec!["::1".parse::<IpAddr>().unwrap()]);
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn hits_are_cached_and_shuffled() {
        let resolver = Arc::new(CountingResolver::new(&[
            "10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.4", "10.0.0.5",
        ]));
        let cache = cache_with(resolver.clone(), Duration::from_secs(60));
        let ctx = Context::background();

        let first = cache.lookup(&ctx, "multi.test").await.unwrap();
        let expected: HashSet<IpAddr> = first.iter().copied().collect();
        let mut orderings = HashSet::new();
        orderings.insert(first);
        for _ in 0..50 {
            let ips = cache.lookup(&ctx, "multi.test").await.unwrap();
            assert_eq!(ips.iter().copied().collect::<HashSet<_>>(), expected);
            orderings.insert(ips);
        }

        assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);
        assert!(orderings.len() > 1, "shuffle never changed the order");
    }

    #[tokio::test]
    async fn expired_entry_is_re_resolved() {
        let resolver = Arc::new(CountingResolver::new(&["10.0.0.1"]));
        let cache = cache_with(resolver.clone(), Duration::from_millis(30));
        let ctx = Context::background();

        cache.lookup(&ctx, "short.test").await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        cache.lookup(&ctx, "short.test").await.unwrap();
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failure_after_expiry_is_not_masked_by_stale_entry() {
        let mut resolver = CountingResolver::new(&["10.0.0.1"]);
        resolver.fail_after = Some(1);
        let resolver = Arc::new(resolver);
        let cache = cache_with(resolver.clone(), Duration::from_millis(30));
        let ctx = Context::background();

        cache.lookup(&ctx, "flaky.test").await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        let err = cache.lookup(&ctx, "flaky.test").await.unwrap_err();
        assert!(matches!(err, TransportError::Dns { .. }));
    }

    #[tokio::test]
    async fn concurrent_misses_share_one_resolve() {
        let mut resolver = CountingResolver::new(&["10.0.0.1", "10.0.0.2"]);
        resolver.delay = Duration::from_millis(30);
        let resolver = Arc::new(resolver);
        let cache = cache_with(resolver.clone(), Duration::from_secs(60));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                cache.lookup(&Context::background(), "busy.test").await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap().len(), 2);
        }
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn refresh_tick_purges_expired_entries() {
        let resolver = Arc::new(CountingResolver::new(&["10.0.0.1"]));
        let cache = DnsCache::spawn(
            resolver,
            DnsOptions {
                ttl: Duration::from_millis(20),
                refresh_interval: Duration::from_millis(10),
            },
            CancellationToken::new(),
        );
        cache.lookup(&Context::background(), "gone.test").await.unwrap();
        assert_eq!(cache.len().await, 1);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn shutdown_fails_lookups() {
        let resolver = Arc::new(CountingResolver::new(&["10.0.0.1"]));
        let token = CancellationToken::new();
        let cache = DnsCache::spawn(resolver, DnsOptions::default(), token.clone());
        token.cancel();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let err = cache
            .lookup(&Context::background(), "late.test")
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Dns { .. }));
    }

    struct PanicOnceResolver {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Resolve for PanicOnceResolver {
        async fn resolve(&self, _host: &str) -> io::Result<Vec<IpAddr>> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("resolver blew up");
            }
            Ok(vec!["10.0.0.9".parse().unwrap()])
        }
    }

    #[tokio::test]
    async fn panicking_resolver_does_not_strand_host() {
        let resolver = Arc::new(PanicOnceResolver {
            calls: AtomicUsize::new(0),
        });
        let cache = DnsCache::spawn(resolver.clone(), DnsOptions::default(), CancellationToken::new());
        let ctx = Context::background().with_timeout(Duration::from_secs(2));

        let err = cache.lookup(&ctx, "flaky.test").await.unwrap_err();
        assert!(matches!(err, TransportError::Dns { .. }), "unexpected error: {err}");

        let ips = cache.lookup(&ctx, "flaky.test").await.unwrap();
        assert_eq!(ips, vec!["10.0.0.9".parse::<IpAddr>().unwrap()]);
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 2);
    }
}
