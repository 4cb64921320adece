//! Configuration data structures for relaygate.
//!
//! These types map directly to YAML / TOML / JSON configuration files and are
//! also what the surrounding gateway hands to the dispatch engine per request.
//! They are serde‑friendly and include defaults so that minimal configs remain
//! concise. Builders are part of the public API for embedding.
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Balancer kind used when a route does not declare one.
pub const NO_LOAD_BALANCER: &str = "NoLoadBalancer";

fn default_scheme() -> String {
    "http".to_string()
}

fn default_registry_host() -> String {
    "localhost".to_string()
}

fn default_registry_port() -> u16 {
    8500
}

fn default_polling_interval_ms() -> u64 {
    1000
}

fn default_pooled_connection_lifetime_secs() -> u64 {
    120
}

/// A statically configured downstream address.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Hash)]
pub struct DownstreamHostAndPort {
    pub host: String,
    pub port: u16,
}

impl DownstreamHostAndPort {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

/// Load balancer selection for a route.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
#[serde(default)]
pub struct LoadBalancerOptions {
    /// Strategy kind, e.g. `RoundRobin`. Empty means [`NO_LOAD_BALANCER`].
    pub kind: String,
    /// Session cookie name used by `CookieStickySessions`
    pub key: String,
    /// Sticky session lifetime in milliseconds
    pub expiry_ms: u64,
}

impl LoadBalancerOptions {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            ..Self::default()
        }
    }

    /// Sticky session options with the given cookie name and lifetime.
    pub fn sticky(key: impl Into<String>, expiry: Duration) -> Self {
        Self {
            kind: "CookieStickySessions".to_string(),
            key: key.into(),
            expiry_ms: expiry.as_millis() as u64,
        }
    }

    /// The configured kind, falling back to [`NO_LOAD_BALANCER`].
    pub fn effective_kind(&self) -> &str {
        if self.kind.is_empty() {
            NO_LOAD_BALANCER
        } else {
            &self.kind
        }
    }

    pub fn expiry(&self) -> Duration {
        Duration::from_millis(self.expiry_ms)
    }
}

/// Quality of service (circuit breaker + per-call timeout) options.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Hash, Default)]
#[serde(default)]
pub struct QosOptions {
    /// Consecutive failures that open the circuit. Zero disables breaking.
    pub exceptions_allowed_before_breaking: u32,
    /// How long the circuit stays open, in milliseconds
    pub duration_of_break_ms: u64,
    /// Per-call timeout in milliseconds. Zero disables the timeout.
    pub timeout_ms: u64,
}

impl QosOptions {
    pub fn new(threshold: u32, break_duration: Duration, timeout: Duration) -> Self {
        Self {
            exceptions_allowed_before_breaking: threshold,
            duration_of_break_ms: break_duration.as_millis() as u64,
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    /// Whether a QoS interceptor should be placed in the pipeline at all.
    pub fn use_qos(&self) -> bool {
        self.exceptions_allowed_before_breaking > 0 || self.timeout_ms > 0
    }

    pub fn use_circuit_breaker(&self) -> bool {
        self.exceptions_allowed_before_breaking > 0
    }

    pub fn break_duration(&self) -> Duration {
        Duration::from_millis(self.duration_of_break_ms)
    }

    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }
}

/// Transport client options for a route.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Hash)]
#[serde(default)]
pub struct HttpHandlerOptions {
    /// Persist cookies returned by the downstream on the cached client
    pub use_cookie_container: bool,
    /// Wrap every downstream call in a `backend_request` span
    pub use_tracing: bool,
    /// Upper bound of concurrent connections to the downstream host; also
    /// caps the idle pool
    pub max_connections_per_server: Option<usize>,
    /// Idle lifetime of a pooled connection in seconds
    pub pooled_connection_lifetime_secs: u64,
}

impl Default for HttpHandlerOptions {
    fn default() -> Self {
        Self {
            use_cookie_container: false,
            use_tracing: false,
            max_connections_per_server: None,
            pooled_connection_lifetime_secs: default_pooled_connection_lifetime_secs(),
        }
    }
}

/// Resolved configuration for one logical proxy route.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct RouteDescriptor {
    /// Route identity; balancer and circuit breaker state are kept per key
    pub key: String,
    #[serde(default)]
    pub service_name: String,
    #[serde(default)]
    pub use_service_discovery: bool,
    #[serde(default = "default_scheme")]
    pub downstream_scheme: String,
    #[serde(default)]
    pub downstream_addresses: Vec<DownstreamHostAndPort>,
    #[serde(default)]
    pub load_balancer: LoadBalancerOptions,
    #[serde(default)]
    pub qos: QosOptions,
    #[serde(default)]
    pub http_handler: HttpHandlerOptions,
    /// Names of registered interceptors, applied in this order
    #[serde(default)]
    pub interceptors: Vec<String>,
}

impl RouteDescriptor {
    /// Create a new route descriptor builder
    pub fn builder(key: impl Into<String>) -> RouteDescriptorBuilder {
        RouteDescriptorBuilder::new(key)
    }
}

/// Builder for [`RouteDescriptor`]
pub struct RouteDescriptorBuilder {
    key: String,
    service_name: String,
    use_service_discovery: bool,
    downstream_scheme: String,
    downstream_addresses: Vec<DownstreamHostAndPort>,
    load_balancer: LoadBalancerOptions,
    qos: QosOptions,
    http_handler: HttpHandlerOptions,
    interceptors: Vec<String>,
}

impl RouteDescriptorBuilder {
    fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            service_name: String::new(),
            use_service_discovery: false,
            downstream_scheme: default_scheme(),
            downstream_addresses: Vec::new(),
            load_balancer: LoadBalancerOptions::default(),
            qos: QosOptions::default(),
            http_handler: HttpHandlerOptions::default(),
            interceptors: Vec::new(),
        }
    }

    pub fn service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = name.into();
        self
    }

    pub fn use_service_discovery(mut self, enabled: bool) -> Self {
        self.use_service_discovery = enabled;
        self
    }

    pub fn downstream_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.downstream_scheme = scheme.into();
        self
    }

    /// Append a static downstream address
    pub fn downstream(mut self, host: impl Into<String>, port: u16) -> Self {
        self.downstream_addresses
            .push(DownstreamHostAndPort::new(host, port));
        self
    }

    pub fn load_balancer(mut self, options: LoadBalancerOptions) -> Self {
        self.load_balancer = options;
        self
    }

    pub fn qos(mut self, options: QosOptions) -> Self {
        self.qos = options;
        self
    }

    pub fn http_handler(mut self, options: HttpHandlerOptions) -> Self {
        self.http_handler = options;
        self
    }

    /// Append a named interceptor to the route's pipeline
    pub fn interceptor(mut self, name: impl Into<String>) -> Self {
        self.interceptors.push(name.into());
        self
    }

    /// Build the final RouteDescriptor
    pub fn build(self) -> Result<RouteDescriptor, String> {
        if self.key.is_empty() {
            return Err("route key is required".to_string());
        }
        if self.downstream_scheme.is_empty() {
            return Err("downstream_scheme must not be empty".to_string());
        }

        Ok(RouteDescriptor {
            key: self.key,
            service_name: self.service_name,
            use_service_discovery: self.use_service_discovery,
            downstream_scheme: self.downstream_scheme,
            downstream_addresses: self.downstream_addresses,
            load_balancer: self.load_balancer,
            qos: self.qos,
            http_handler: self.http_handler,
            interceptors: self.interceptors,
        })
    }
}

/// Service discovery backend shared by a group of routes.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ServiceProviderConfig {
    /// Registered discovery kind, e.g. `Consul`. Matched case-sensitively.
    pub kind: String,
    pub scheme: String,
    pub host: String,
    pub port: u16,
    /// ACL token sent to the registry, if any
    pub token: Option<String>,
    pub polling_interval_ms: u64,
}

impl Default for ServiceProviderConfig {
    fn default() -> Self {
        Self {
            kind: String::new(),
            scheme: default_scheme(),
            host: default_registry_host(),
            port: default_registry_port(),
            token: None,
            polling_interval_ms: default_polling_interval_ms(),
        }
    }
}

impl ServiceProviderConfig {
    pub fn new(kind: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            kind: kind.into(),
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms)
    }

    /// Base URL of the registry, e.g. `http://localhost:8500`
    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.host, self.port)
    }
}

/// Client cache tuning.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
#[serde(default)]
pub struct ClientCacheConfig {
    /// Entries unused for longer than this are dropped by `evict_idle`
    pub idle_timeout_secs: Option<u64>,
}

impl ClientCacheConfig {
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }
}

/// Top-level file layout consumed by the loader and the CLI.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct GatewayConfig {
    #[serde(default)]
    pub service_provider: ServiceProviderConfig,
    #[serde(default)]
    pub client_cache: ClientCacheConfig,
    #[serde(default)]
    pub routes: Vec<RouteDescriptor>,
}

impl GatewayConfig {
    /// Look up a route by its key.
    pub fn route(&self, key: &str) -> Option<&RouteDescriptor> {
        self.routes.iter().find(|route| route.key == key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_builder_defaults() {
        let route = RouteDescriptor::builder("orders")
            .downstream("localhost", 8081)
            .build()
            .unwrap();

        assert_eq!(route.downstream_scheme, "http");
        assert_eq!(route.load_balancer.effective_kind(), NO_LOAD_BALANCER);
        assert!(!route.qos.use_qos());
        assert_eq!(
            route.downstream_addresses,
            vec![DownstreamHostAndPort::new("localhost", 8081)]
        );
    }

    #[test]
    fn test_route_builder_requires_key() {
        assert!(RouteDescriptor::builder("").build().is_err());
    }

    #[test]
    fn test_qos_flags() {
        let timeout_only = QosOptions {
            timeout_ms: 500,
            ..QosOptions::default()
        };
        assert!(timeout_only.use_qos());
        assert!(!timeout_only.use_circuit_breaker());
        assert_eq!(timeout_only.timeout(), Some(Duration::from_millis(500)));

        let breaker = QosOptions::new(3, Duration::from_secs(1), Duration::ZERO);
        assert!(breaker.use_circuit_breaker());
        assert_eq!(breaker.timeout(), None);
    }

    #[test]
    fn test_route_deserialize_minimal() {
        let route: RouteDescriptor = serde_json::from_str(
            r#"{"key":"users","downstream_addresses":[{"host":"a","port":80}]}"#,
        )
        .unwrap();
        assert_eq!(route.downstream_scheme, "http");
        assert!(route.interceptors.is_empty());
        assert_eq!(route.http_handler.pooled_connection_lifetime_secs, 120);
    }
}
