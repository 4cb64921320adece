//! Composition root of the dispatch engine.
//!
//! [`DispatchEngine::builder`] collects the extension points (discovery
//! kinds, balancer kinds, interceptors, error rules, transport) and wires the
//! resolver, balancer house, client cache, pipeline builder and dispatcher
//! together. Built-in discovery and balancer kinds are always present; a
//! custom registration under a built-in name replaces it.
use std::{sync::Arc, time::Duration};

use eyre::{Result, WrapErr};
use hyper::Response;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::{
    adapters::{HttpClientAdapter, TracingInterceptor, register_builtin_discovery},
    config::{
        ClientCacheConfig, GatewayConfig, HttpHandlerOptions, RouteDescriptor,
        ServiceProviderConfig,
    },
    core::{
        circuit_breaker::CircuitBreakerRegistry,
        client_cache::ClientCache,
        dispatcher::{Dispatcher, RequestContext},
        error::{DispatchResult, ErrorKind},
        error_translator::ErrorTranslator,
        load_balancer::{BalancerRegistry, LoadBalancer, LoadBalancerHouse},
        pipeline::{InterceptorRegistry, PipelineBuilder, TransportFactory},
        service::ServiceInstance,
        service_discovery::{DiscoveryRegistry, ServiceEntryResolver},
    },
    ports::{
        http_client::{Body, HttpClient, HttpClientError},
        interceptor::Interceptor,
        service_discovery::ServiceDiscoveryProvider,
    },
};

/// Timeout of the registry client shared by the Consul providers.
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// The dispatch engine: one per gateway process.
pub struct DispatchEngine {
    dispatcher: Dispatcher,
}

impl DispatchEngine {
    pub fn builder() -> DispatchEngineBuilder {
        DispatchEngineBuilder::new()
    }

    /// Send a request already matched to `route` to one of its instances.
    pub async fn dispatch(
        &self,
        route: &RouteDescriptor,
        ctx: RequestContext,
    ) -> DispatchResult<Response<Body>> {
        self.dispatcher.dispatch(route, ctx).await
    }

    /// Instances currently resolved for `route`.
    pub async fn resolve(&self, route: &RouteDescriptor) -> DispatchResult<Vec<ServiceInstance>> {
        self.dispatcher
            .house()
            .resolve(self.dispatcher.service_provider(), route)
            .await
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn house(&self) -> &LoadBalancerHouse {
        self.dispatcher.house()
    }

    pub fn client_cache(&self) -> &Arc<ClientCache> {
        self.dispatcher.client_cache()
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        self.dispatcher.pipeline().breakers()
    }

    /// Periodically drop clients idle for longer than the cache's idle
    /// timeout, until `shutdown` fires.
    pub fn spawn_idle_eviction(
        &self,
        every: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let cache = self.client_cache().clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::debug!("Client cache eviction task stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        let evicted = cache.evict_idle().await;
                        if evicted > 0 {
                            tracing::info!(evicted, "Evicted idle downstream clients");
                        }
                    }
                }
            }
        })
    }

    /// Drop every cached client. Dispatches still in flight finish normally.
    pub async fn shutdown(&self) {
        self.client_cache().shutdown().await;
    }
}

/// Builder for [`DispatchEngine`]
pub struct DispatchEngineBuilder {
    discovery: DiscoveryRegistry,
    discovery_client: Option<reqwest::Client>,
    balancers: BalancerRegistry,
    interceptors: InterceptorRegistry,
    translator: ErrorTranslator,
    service_provider: ServiceProviderConfig,
    client_cache: ClientCacheConfig,
    transport: Option<TransportFactory>,
}

impl DispatchEngineBuilder {
    fn new() -> Self {
        Self {
            discovery: DiscoveryRegistry::new(),
            discovery_client: None,
            balancers: BalancerRegistry::with_builtins(),
            interceptors: InterceptorRegistry::new(),
            translator: ErrorTranslator::new(),
            service_provider: ServiceProviderConfig::default(),
            client_cache: ClientCacheConfig::default(),
            transport: None,
        }
    }

    /// Take the service provider and client cache settings of a loaded config.
    pub fn config(self, config: &GatewayConfig) -> Self {
        self.service_provider(config.service_provider.clone())
            .client_cache_config(config.client_cache.clone())
    }

    pub fn register_discovery<F>(mut self, kind: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&ServiceProviderConfig, &RouteDescriptor) -> Arc<dyn ServiceDiscoveryProvider>
            + Send
            + Sync
            + 'static,
    {
        self.discovery.register(kind, factory);
        self
    }

    pub fn register_balancer<F>(mut self, kind: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&RouteDescriptor, &[ServiceInstance]) -> Arc<dyn LoadBalancer>
            + Send
            + Sync
            + 'static,
    {
        self.balancers.register(kind, factory);
        self
    }

    /// Interceptor applied to every route, after the ones added before it.
    pub fn global_interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.add_global(interceptor);
        self
    }

    /// Interceptor routes can list by `name`.
    pub fn route_interceptor(
        mut self,
        name: impl Into<String>,
        interceptor: Arc<dyn Interceptor>,
    ) -> Self {
        self.interceptors.register(name, interceptor);
        self
    }

    /// Translation rule checked before the built-in ones.
    pub fn translate<F>(mut self, predicate: F, kind: ErrorKind) -> Self
    where
        F: Fn(&HttpClientError) -> bool + Send + Sync + 'static,
    {
        self.translator.register(predicate, kind);
        self
    }

    pub fn service_provider(mut self, config: ServiceProviderConfig) -> Self {
        self.service_provider = config;
        self
    }

    pub fn client_cache_config(mut self, config: ClientCacheConfig) -> Self {
        self.client_cache = config;
        self
    }

    /// Send every downstream call through `client` instead of building a
    /// pooled transport per cached client.
    pub fn http_client(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.transport = Some(Arc::new(move |_: &HttpHandlerOptions| client.clone()));
        self
    }

    pub fn transport_factory(mut self, factory: TransportFactory) -> Self {
        self.transport = Some(factory);
        self
    }

    /// HTTP client used to talk to the discovery registry.
    pub fn discovery_client(mut self, client: reqwest::Client) -> Self {
        self.discovery_client = Some(client);
        self
    }

    pub fn build(self) -> Result<DispatchEngine> {
        let discovery_client = match self.discovery_client {
            Some(client) => client,
            None => reqwest::Client::builder()
                .timeout(DISCOVERY_TIMEOUT)
                .build()
                .wrap_err("Failed to create service discovery client")?,
        };
        let mut discovery = DiscoveryRegistry::new();
        register_builtin_discovery(&mut discovery, discovery_client);
        discovery.merge(self.discovery);

        let transport = match self.transport {
            Some(factory) => factory,
            None => default_transport_factory()?,
        };

        tracing::info!(
            discovery_kinds = ?discovery.kinds(),
            balancers = ?self.balancers,
            interceptors = ?self.interceptors,
            service_provider = %self.service_provider.kind,
            "Building dispatch engine"
        );

        let resolver = ServiceEntryResolver::new(Arc::new(discovery));
        let house = LoadBalancerHouse::new(resolver, Arc::new(self.balancers));
        let cache = Arc::new(ClientCache::new(&self.client_cache));
        let pipeline = PipelineBuilder::new(
            Arc::new(self.interceptors),
            Arc::new(CircuitBreakerRegistry::new()),
            transport,
        )
        .with_tracing(Arc::new(TracingInterceptor::new()));

        Ok(DispatchEngine {
            dispatcher: Dispatcher::new(
                self.service_provider,
                house,
                cache,
                pipeline,
                self.translator,
            ),
        })
    }
}

impl Default for DispatchEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A pooled hyper transport per client, sized by the route's handler options.
/// Falls back to a shared default transport if one cannot be built.
fn default_transport_factory() -> Result<TransportFactory> {
    let fallback: Arc<dyn HttpClient> =
        Arc::new(HttpClientAdapter::new().wrap_err("Failed to create HTTP client adapter")?);
    Ok(Arc::new(move |options: &HttpHandlerOptions| {
        match HttpClientAdapter::with_options(options) {
            Ok(adapter) => Arc::new(adapter) as Arc<dyn HttpClient>,
            Err(e) => {
                tracing::warn!("Falling back to the shared HTTP client: {:?}", e);
                fallback.clone()
            }
        }
    }))
}
