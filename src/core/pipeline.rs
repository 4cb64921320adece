//! Interceptor pipeline construction.
//!
//! Order, outermost first:
//! 1. the tracing interceptor, when the route asks for tracing
//! 2. global interceptors, in registration order
//! 3. the route's interceptors, in declared order
//! 4. the QoS interceptor (circuit breaker + timeout), when QoS is active
//!
//! The cookie jar, when enabled, wraps the transport itself.
use std::{
    collections::HashMap,
    fmt,
    hash::{DefaultHasher, Hash, Hasher},
    sync::Arc,
};

use crate::{
    config::{HttpHandlerOptions, RouteDescriptor},
    core::{
        circuit_breaker::{CircuitBreakerRegistry, QosInterceptor},
        client_cache::{ClientSignature, DownstreamClient},
        cookies::{CookieJar, CookieTransport},
        error::{DispatchError, DispatchResult},
        service::ServiceHostAndPort,
    },
    ports::{http_client::HttpClient, interceptor::Interceptor},
};

/// Builds the transport a new client sends through.
pub type TransportFactory = Arc<dyn Fn(&HttpHandlerOptions) -> Arc<dyn HttpClient> + Send + Sync>;

/// Global interceptors plus the named ones routes can reference.
#[derive(Clone, Default)]
pub struct InterceptorRegistry {
    global: Vec<Arc<dyn Interceptor>>,
    named: HashMap<String, Arc<dyn Interceptor>>,
}

impl InterceptorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interceptor applied to every route.
    pub fn add_global(&mut self, interceptor: Arc<dyn Interceptor>) {
        self.global.push(interceptor);
    }

    /// Interceptor routes can opt into by name.
    pub fn register(&mut self, name: impl Into<String>, interceptor: Arc<dyn Interceptor>) {
        self.named.insert(name.into(), interceptor);
    }

    pub fn global(&self) -> &[Arc<dyn Interceptor>] {
        &self.global
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Interceptor>> {
        self.named.get(name)
    }
}

impl fmt::Debug for InterceptorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut named: Vec<&String> = self.named.keys().collect();
        named.sort_unstable();
        f.debug_struct("InterceptorRegistry")
            .field(
                "global",
                &self.global.iter().map(|i| i.name()).collect::<Vec<_>>(),
            )
            .field("named", &named)
            .finish()
    }
}

pub struct PipelineBuilder {
    interceptors: Arc<InterceptorRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
    transport: TransportFactory,
    tracing: Option<Arc<dyn Interceptor>>,
}

impl PipelineBuilder {
    pub fn new(
        interceptors: Arc<InterceptorRegistry>,
        breakers: Arc<CircuitBreakerRegistry>,
        transport: TransportFactory,
    ) -> Self {
        Self {
            interceptors,
            breakers,
            transport,
            tracing: None,
        }
    }

    /// Interceptor placed outermost on routes with `use_tracing`.
    pub fn with_tracing(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.tracing = Some(interceptor);
        self
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Signature of the client serving `route` on `instance`.
    ///
    /// Two routes share a client only when they would build the same
    /// pipeline. QoS state is per route, so a QoS-enabled route never shares.
    pub fn signature(
        &self,
        route: &RouteDescriptor,
        instance: &ServiceHostAndPort,
    ) -> ClientSignature {
        let mut hasher = DefaultHasher::new();
        for interceptor in self.interceptors.global() {
            interceptor.name().hash(&mut hasher);
        }
        route.interceptors.hash(&mut hasher);
        if route.qos.use_qos() {
            route.key.hash(&mut hasher);
            route.qos.hash(&mut hasher);
        }
        route.http_handler.hash(&mut hasher);

        ClientSignature {
            scheme: scheme_for(route, instance).to_string(),
            host: instance.host.clone(),
            port: instance.port,
            fingerprint: hasher.finish(),
        }
    }

    /// Assemble a client for `route`.
    pub async fn build(
        &self,
        route: &RouteDescriptor,
        signature: ClientSignature,
    ) -> DispatchResult<DownstreamClient> {
        let mut chain: Vec<Arc<dyn Interceptor>> = Vec::new();

        if route.http_handler.use_tracing {
            if let Some(tracing) = &self.tracing {
                chain.push(tracing.clone());
            }
        }
        chain.extend(self.interceptors.global().iter().cloned());
        for name in &route.interceptors {
            let interceptor = self.interceptors.get(name).ok_or_else(|| {
                tracing::warn!(
                    route = %route.key,
                    interceptor = %name,
                    "Route references unknown interceptor"
                );
                DispatchError::InterceptorNotFound(name.clone())
            })?;
            chain.push(interceptor.clone());
        }
        if route.qos.use_qos() {
            let qos = QosInterceptor::for_route(&route.key, &route.qos, &self.breakers).await;
            chain.push(Arc::new(qos));
        }

        let transport = (self.transport)(&route.http_handler);
        let client = if route.http_handler.use_cookie_container {
            let jar = Arc::new(CookieJar::new());
            DownstreamClient::new(
                signature,
                chain,
                Arc::new(CookieTransport::new(transport, jar.clone())),
            )
            .with_cookies(jar)
        } else {
            DownstreamClient::new(signature, chain, transport)
        };

        tracing::debug!(
            route = %route.key,
            signature = %client.signature(),
            interceptors = ?client.interceptor_names(),
            "Built interceptor pipeline"
        );
        Ok(client)
    }
}

/// Instance scheme when the registry advertised one, else the route's.
pub fn scheme_for<'a>(route: &'a RouteDescriptor, instance: &'a ServiceHostAndPort) -> &'a str {
    instance
        .scheme
        .as_deref()
        .filter(|scheme| !scheme.is_empty())
        .unwrap_or(&route.downstream_scheme)
}
