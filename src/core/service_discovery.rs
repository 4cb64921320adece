//! Service entry resolution.
//!
//! Turns a route plus the route group's [`ServiceProviderConfig`] into a
//! concrete, ordered list of instances. Providers are looked up by kind in an
//! explicit [`DiscoveryRegistry`] populated at startup; there is no implicit
//! fallback when a kind is unknown.
use std::{collections::HashMap, fmt, sync::Arc};

use async_trait::async_trait;

use crate::{
    config::{RouteDescriptor, ServiceProviderConfig},
    core::{
        error::{DispatchError, DispatchResult},
        service::{ServiceHostAndPort, ServiceInstance},
    },
    ports::service_discovery::{DiscoveryResult, ServiceDiscoveryProvider},
};

/// Builds a discovery provider for a route.
pub type DiscoveryFactory = Arc<
    dyn Fn(&ServiceProviderConfig, &RouteDescriptor) -> Arc<dyn ServiceDiscoveryProvider>
        + Send
        + Sync,
>;

/// Provider used when a route has discovery disabled: its static addresses,
/// in declared order, without any I/O.
pub struct ConfigurationServiceProvider {
    services: Vec<ServiceInstance>,
}

impl ConfigurationServiceProvider {
    pub fn from_route(route: &RouteDescriptor) -> Self {
        let services = route
            .downstream_addresses
            .iter()
            .map(|address| {
                ServiceInstance::new(route.service_name.clone(), ServiceHostAndPort::from(address))
            })
            .collect();
        Self { services }
    }
}

#[async_trait]
impl ServiceDiscoveryProvider for ConfigurationServiceProvider {
    async fn get(&self) -> DiscoveryResult<Vec<ServiceInstance>> {
        Ok(self.services.clone())
    }
}

/// Kind -> factory map for discovery providers. Lookup is an exact,
/// case-sensitive match; registering an existing kind replaces it.
#[derive(Clone, Default)]
pub struct DiscoveryRegistry {
    factories: HashMap<String, DiscoveryFactory>,
}

impl DiscoveryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, kind: impl Into<String>, factory: F)
    where
        F: Fn(&ServiceProviderConfig, &RouteDescriptor) -> Arc<dyn ServiceDiscoveryProvider>
            + Send
            + Sync
            + 'static,
    {
        let kind = kind.into();
        if self
            .factories
            .insert(kind.clone(), Arc::new(factory))
            .is_some()
        {
            tracing::debug!(kind = %kind, "Replaced service discovery factory");
        }
    }

    /// Take over every factory of `other`, replacing kinds registered here.
    pub fn merge(&mut self, other: DiscoveryRegistry) {
        for (kind, factory) in other.factories {
            if self.factories.insert(kind.clone(), factory).is_some() {
                tracing::debug!(kind = %kind, "Replaced service discovery factory");
            }
        }
    }

    pub fn get(&self, kind: &str) -> Option<&DiscoveryFactory> {
        self.factories.get(kind)
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }
}

impl fmt::Debug for DiscoveryRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiscoveryRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

/// Resolves routes to service instances through the registry.
#[derive(Clone, Debug)]
pub struct ServiceEntryResolver {
    registry: Arc<DiscoveryRegistry>,
}

impl ServiceEntryResolver {
    pub fn new(registry: Arc<DiscoveryRegistry>) -> Self {
        Self { registry }
    }

    /// Select the provider for a route without querying it.
    pub fn provider(
        &self,
        config: &ServiceProviderConfig,
        route: &RouteDescriptor,
    ) -> DispatchResult<Arc<dyn ServiceDiscoveryProvider>> {
        if !route.use_service_discovery {
            return Ok(Arc::new(ConfigurationServiceProvider::from_route(route)));
        }

        match self.registry.get(&config.kind) {
            Some(factory) => {
                tracing::debug!(
                    route = %route.key,
                    service = %route.service_name,
                    kind = %config.kind,
                    "Creating service discovery provider"
                );
                Ok(factory(config, route))
            }
            None => {
                tracing::warn!(
                    route = %route.key,
                    kind = %config.kind,
                    known = ?self.registry.kinds(),
                    "No service discovery provider registered for kind"
                );
                Err(DispatchError::DiscoveryProviderNotFound(config.kind.clone()))
            }
        }
    }

    /// Select the provider for a route and query it.
    pub async fn resolve(
        &self,
        config: &ServiceProviderConfig,
        route: &RouteDescriptor,
    ) -> DispatchResult<Vec<ServiceInstance>> {
        let provider = self.provider(config, route)?;
        Self::fetch(provider.as_ref(), route).await
    }

    /// Query an already selected provider, translating backend failures.
    pub async fn fetch(
        provider: &dyn ServiceDiscoveryProvider,
        route: &RouteDescriptor,
    ) -> DispatchResult<Vec<ServiceInstance>> {
        provider.get().await.map_err(|e| {
            tracing::warn!(
                route = %route.key,
                service = %route.service_name,
                "Service discovery failed: {}",
                e
            );
            DispatchError::DiscoveryBackendError(format!("{}: {e}", route.service_name))
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::{core::error::ErrorKind, ports::service_discovery::DiscoveryError};

    struct FixedProvider(Vec<ServiceInstance>);

    #[async_trait]
    impl ServiceDiscoveryProvider for FixedProvider {
        async fn get(&self) -> DiscoveryResult<Vec<ServiceInstance>> {
            Ok(self.0.clone())
        }
    }

    struct BrokenProvider;

    #[async_trait]
    impl ServiceDiscoveryProvider for BrokenProvider {
        async fn get(&self) -> DiscoveryResult<Vec<ServiceInstance>> {
            Err(DiscoveryError::Malformed("not json".to_string()))
        }
    }

    fn discovery_route() -> RouteDescriptor {
        RouteDescriptor::builder("products")
            .service_name("product")
            .use_service_discovery(true)
            .build()
            .unwrap()
    }

    fn counting_factory(
        counter: Arc<AtomicUsize>,
        host: &'static str,
    ) -> impl Fn(&ServiceProviderConfig, &RouteDescriptor) -> Arc<dyn ServiceDiscoveryProvider>
    + Send
    + Sync
    + 'static {
        move |_, route| {
            counter.fetch_add(1, Ordering::SeqCst);
            Arc::new(FixedProvider(vec![ServiceInstance::new(
                route.service_name.clone(),
                ServiceHostAndPort::new(host, 80),
            )]))
        }
    }

    #[tokio::test]
    async fn test_static_addresses_in_declared_order() {
        let route = RouteDescriptor::builder("static")
            .downstream("asdf.com", 80)
            .downstream("abc.com", 80)
            .build()
            .unwrap();
        let resolver = ServiceEntryResolver::new(Arc::new(DiscoveryRegistry::new()));

        let services = resolver
            .resolve(&ServiceProviderConfig::default(), &route)
            .await
            .unwrap();

        let hosts: Vec<_> = services
            .iter()
            .map(|s| s.host_and_port.host.as_str())
            .collect();
        assert_eq!(hosts, vec!["asdf.com", "abc.com"]);
        assert!(services.iter().all(|s| s.host_and_port.port == 80));
    }

    #[tokio::test]
    async fn test_no_discovery_and_no_addresses_is_empty() {
        let route = RouteDescriptor::builder("empty").build().unwrap();
        let resolver = ServiceEntryResolver::new(Arc::new(DiscoveryRegistry::new()));

        let services = resolver
            .resolve(&ServiceProviderConfig::default(), &route)
            .await
            .unwrap();
        assert!(services.is_empty());
    }

    #[tokio::test]
    async fn test_unregistered_kind_is_not_found() {
        let mut registry = DiscoveryRegistry::new();
        registry.register("Fake", counting_factory(Arc::new(AtomicUsize::new(0)), "fake"));
        let resolver = ServiceEntryResolver::new(Arc::new(registry));
        let config = ServiceProviderConfig::new("Wookie", "localhost", 8500);

        let err = resolver
            .resolve(&config, &discovery_route())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DiscoveryProviderNotFound);
    }

    #[tokio::test]
    async fn test_kind_lookup_is_case_sensitive() {
        let mut registry = DiscoveryRegistry::new();
        registry.register("Fake", counting_factory(Arc::new(AtomicUsize::new(0)), "fake"));
        let resolver = ServiceEntryResolver::new(Arc::new(registry));
        let config = ServiceProviderConfig::new("fake", "localhost", 8500);

        let err = resolver
            .provider(&config, &discovery_route())
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::DiscoveryProviderNotFound);
    }

    #[tokio::test]
    async fn test_registered_kind_invokes_only_that_factory() {
        let fake_calls = Arc::new(AtomicUsize::new(0));
        let other_calls = Arc::new(AtomicUsize::new(0));
        let mut registry = DiscoveryRegistry::new();
        registry.register("Fake", counting_factory(fake_calls.clone(), "fake"));
        registry.register("Other", counting_factory(other_calls.clone(), "other"));
        let resolver = ServiceEntryResolver::new(Arc::new(registry));
        let config = ServiceProviderConfig::new("Fake", "localhost", 8500);

        let services = resolver
            .resolve(&config, &discovery_route())
            .await
            .unwrap();

        assert_eq!(services.len(), 1);
        assert_eq!(services[0].host_and_port.host, "fake");
        assert_eq!(services[0].name, "product");
        assert_eq!(fake_calls.load(Ordering::SeqCst), 1);
        assert_eq!(other_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_backend_failure_is_translated() {
        let mut registry = DiscoveryRegistry::new();
        registry.register("Broken", |_: &ServiceProviderConfig, _: &RouteDescriptor| {
            Arc::new(BrokenProvider) as Arc<dyn ServiceDiscoveryProvider>
        });
        let resolver = ServiceEntryResolver::new(Arc::new(registry));
        let config = ServiceProviderConfig::new("Broken", "localhost", 8500);

        let err = resolver
            .resolve(&config, &discovery_route())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DiscoveryBackendError);
    }

    #[test]
    fn test_register_replaces_existing_kind() {
        let mut registry = DiscoveryRegistry::new();
        registry.register("Consul", counting_factory(Arc::new(AtomicUsize::new(0)), "a"));
        registry.register("Consul", counting_factory(Arc::new(AtomicUsize::new(0)), "b"));
        assert_eq!(registry.kinds(), vec!["Consul"]);
    }

    #[tokio::test]
    async fn test_merge_overrides_existing_kinds() {
        let builtin_calls = Arc::new(AtomicUsize::new(0));
        let custom_calls = Arc::new(AtomicUsize::new(0));
        let mut registry = DiscoveryRegistry::new();
        registry.register("Consul", counting_factory(builtin_calls.clone(), "builtin"));
        registry.register("ServiceFabric", counting_factory(builtin_calls.clone(), "fabric"));
        let mut custom = DiscoveryRegistry::new();
        custom.register("Consul", counting_factory(custom_calls.clone(), "custom"));

        registry.merge(custom);
        assert_eq!(registry.kinds(), vec!["Consul", "ServiceFabric"]);

        let resolver = ServiceEntryResolver::new(Arc::new(registry));
        let config = ServiceProviderConfig::new("Consul", "localhost", 8500);
        let services = resolver
            .resolve(&config, &discovery_route())
            .await
            .unwrap();
        assert_eq!(services[0].host_and_port.host, "custom");
        assert_eq!(builtin_calls.load(Ordering::SeqCst), 0);
        assert_eq!(custom_calls.load(Ordering::SeqCst), 1);
    }
}
