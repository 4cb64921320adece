//! Cached downstream clients.
//!
//! A [`DownstreamClient`] is the built interceptor pipeline for one
//! (scheme, host, port, pipeline fingerprint) combination. Building one is
//! comparatively expensive (transport pool, breaker lookup), so clients are
//! kept in a [`ClientCache`] keyed by their [`ClientSignature`] and handed out
//! through [`ClientLease`] guards that put them back when the request is done.
use std::{
    fmt,
    future::Future,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use hyper::{Request, Response};
use scc::{HashMap, hash_map::Entry};
use serde::Serialize;
use tokio::time::Instant;

use crate::{
    config::ClientCacheConfig,
    core::{cookies::CookieJar, error::DispatchResult},
    metrics::{increment_client_cache_lookup, set_client_cache_entries},
    ports::{
        http_client::{Body, HttpClient, HttpClientResult},
        interceptor::{Interceptor, Next},
    },
};

/// Identity of a cached client.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientSignature {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    /// Hash of everything that shapes the pipeline
    pub fingerprint: u64,
}

impl fmt::Display for ClientSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}://{}:{}#{:016x}",
            self.scheme, self.host, self.port, self.fingerprint
        )
    }
}

/// An interceptor pipeline bound to a transport.
pub struct DownstreamClient {
    signature: ClientSignature,
    interceptors: Vec<Arc<dyn Interceptor>>,
    transport: Arc<dyn HttpClient>,
    cookies: Option<Arc<CookieJar>>,
    last_used: Mutex<Instant>,
}

impl DownstreamClient {
    pub fn new(
        signature: ClientSignature,
        interceptors: Vec<Arc<dyn Interceptor>>,
        transport: Arc<dyn HttpClient>,
    ) -> Self {
        Self {
            signature,
            interceptors,
            transport,
            cookies: None,
            last_used: Mutex::new(Instant::now()),
        }
    }

    /// Attach the cookie jar the transport was wrapped with.
    pub fn with_cookies(mut self, jar: Arc<CookieJar>) -> Self {
        self.cookies = Some(jar);
        self
    }

    pub fn signature(&self) -> &ClientSignature {
        &self.signature
    }

    /// Interceptor names, outermost first.
    pub fn interceptor_names(&self) -> Vec<&str> {
        self.interceptors.iter().map(|i| i.name()).collect()
    }

    pub fn cookies(&self) -> Option<&CookieJar> {
        self.cookies.as_deref()
    }

    /// Run a request through the pipeline.
    pub async fn send(&self, req: Request<Body>) -> HttpClientResult<Response<Body>> {
        Next::new(&self.interceptors, self.transport.as_ref())
            .run(req)
            .await
    }

    fn touch(&self) {
        *self.last_used.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_used
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }
}

impl fmt::Debug for DownstreamClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownstreamClient")
            .field("signature", &self.signature)
            .field("interceptors", &self.interceptor_names())
            .field("cookies", &self.cookies.is_some())
            .finish()
    }
}

/// Counters exposed by [`ClientCache::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub saves: u64,
}

/// Signature -> client map with at most one client per signature.
pub struct ClientCache {
    clients: HashMap<ClientSignature, Arc<DownstreamClient>>,
    idle_timeout: Option<Duration>,
    closed: AtomicBool,
    hits: AtomicU64,
    misses: AtomicU64,
    saves: AtomicU64,
}

impl Default for ClientCache {
    fn default() -> Self {
        Self::new(&ClientCacheConfig::default())
    }
}

impl ClientCache {
    pub fn new(config: &ClientCacheConfig) -> Self {
        Self {
            clients: HashMap::new(),
            idle_timeout: config.idle_timeout(),
            closed: AtomicBool::new(false),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            saves: AtomicU64::new(0),
        }
    }

    /// Get the client for `signature`, building it with `build` on a miss.
    ///
    /// Concurrent misses may each build a client, but only the first one is
    /// stored; the others receive the stored client and drop their own.
    pub async fn acquire<F, Fut>(
        self: &Arc<Self>,
        signature: ClientSignature,
        build: F,
    ) -> DispatchResult<ClientLease>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = DispatchResult<DownstreamClient>>,
    {
        if let Some(client) = self
            .clients
            .read_async(&signature, |_, client| client.clone())
            .await
        {
            self.hits.fetch_add(1, Ordering::Relaxed);
            increment_client_cache_lookup(true);
            return Ok(ClientLease::new(self.clone(), client));
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        increment_client_cache_lookup(false);
        let built = Arc::new(build().await?);
        tracing::debug!(signature = %signature, "Built downstream client");

        let client = if self.closed.load(Ordering::Acquire) {
            built
        } else {
            match self.clients.entry_async(signature).await {
                Entry::Occupied(occupied) => occupied.get().clone(),
                Entry::Vacant(vacant) => {
                    vacant.insert_entry(built.clone());
                    built
                }
            }
        };
        set_client_cache_entries(self.clients.len());
        Ok(ClientLease::new(self.clone(), client))
    }

    /// Return a client after use. Re-inserts it if it was evicted meanwhile;
    /// discarded once the cache is shut down.
    pub fn save(&self, client: Arc<DownstreamClient>) {
        self.saves.fetch_add(1, Ordering::Relaxed);
        if self.closed.load(Ordering::Acquire) {
            tracing::trace!(signature = %client.signature(), "Cache shut down, client discarded");
            return;
        }
        client.touch();
        let signature = client.signature().clone();
        if let Err((signature, _)) = self.clients.insert_sync(signature, client) {
            tracing::trace!(
                signature = %signature,
                "Signature already cached, kept the stored client"
            );
        }
    }

    pub async fn evict(&self, signature: &ClientSignature) -> bool {
        let removed = self.clients.remove_async(signature).await.is_some();
        if removed {
            tracing::debug!(signature = %signature, "Evicted downstream client");
            set_client_cache_entries(self.clients.len());
        }
        removed
    }

    /// Drop clients unused for longer than the configured idle timeout.
    /// Returns how many were removed.
    pub async fn evict_idle(&self) -> usize {
        let Some(idle_timeout) = self.idle_timeout else {
            return 0;
        };
        let before = self.clients.len();
        self.clients
            .retain_async(|_, client| client.idle_for() < idle_timeout)
            .await;
        let removed = before.saturating_sub(self.clients.len());
        if removed > 0 {
            tracing::debug!(removed, "Evicted idle downstream clients");
            set_client_cache_entries(self.clients.len());
        }
        removed
    }

    /// Drop every client; later saves are discarded.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        self.clients.retain_async(|_, _| false).await;
        set_client_cache_entries(0);
        tracing::info!("Client cache shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.clients.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            saves: self.saves.load(Ordering::Relaxed),
        }
    }
}

/// A client checked out of the cache; saved back exactly once on drop.
pub struct ClientLease {
    cache: Arc<ClientCache>,
    client: Arc<DownstreamClient>,
}

impl ClientLease {
    fn new(cache: Arc<ClientCache>, client: Arc<DownstreamClient>) -> Self {
        Self { cache, client }
    }

    pub fn client(&self) -> &Arc<DownstreamClient> {
        &self.client
    }
}

impl std::ops::Deref for ClientLease {
    type Target = DownstreamClient;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}

impl Drop for ClientLease {
    fn drop(&mut self) {
        self.cache.save(self.client.clone());
    }
}
