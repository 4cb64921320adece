use std::sync::Arc;

use hyper::HeaderMap;
use scc::{HashMap, hash_map::Entry};

use super::{BalancerRegistry, LeaseContext, LeaseGuard, LoadBalancer};
use crate::{
    config::{DownstreamHostAndPort, LoadBalancerOptions, RouteDescriptor, ServiceProviderConfig},
    core::{
        error::DispatchResult,
        service::ServiceInstance,
        service_discovery::ServiceEntryResolver,
    },
    ports::service_discovery::ServiceDiscoveryProvider,
};

/// The route fields a discovery provider is built from.
#[derive(Clone, PartialEq, Eq)]
struct ProviderKey {
    config: ServiceProviderConfig,
    service_name: String,
    use_service_discovery: bool,
    downstream_addresses: Vec<DownstreamHostAndPort>,
}

impl ProviderKey {
    fn new(config: &ServiceProviderConfig, route: &RouteDescriptor) -> Self {
        Self {
            config: config.clone(),
            service_name: route.service_name.clone(),
            use_service_discovery: route.use_service_discovery,
            downstream_addresses: route.downstream_addresses.clone(),
        }
    }
}

struct ProviderEntry {
    key: ProviderKey,
    provider: Arc<dyn ServiceDiscoveryProvider>,
}

struct BalancerEntry {
    options: LoadBalancerOptions,
    balancer: Arc<dyn LoadBalancer>,
}

/// Holds one discovery provider and one load balancer per route key.
///
/// Both are created on first use and kept for the life of the house. A
/// balancer is rebuilt only when the route's balancer options change; a
/// provider only when its discovery inputs change. Creation happens while the
/// map entry for the route is held, so concurrent first requests share a
/// single instance.
pub struct LoadBalancerHouse {
    resolver: ServiceEntryResolver,
    registry: Arc<BalancerRegistry>,
    providers: HashMap<String, ProviderEntry>,
    balancers: HashMap<String, BalancerEntry>,
}

impl LoadBalancerHouse {
    pub fn new(resolver: ServiceEntryResolver, registry: Arc<BalancerRegistry>) -> Self {
        Self {
            resolver,
            registry,
            providers: HashMap::new(),
            balancers: HashMap::new(),
        }
    }

    /// Resolve the route's instances and lease one of them.
    pub async fn lease(
        &self,
        config: &ServiceProviderConfig,
        route: &RouteDescriptor,
        headers: &HeaderMap,
    ) -> DispatchResult<LeaseGuard> {
        let instances = self.resolve(config, route).await?;
        let balancer = self.balancer(route, &instances).await?;
        let lease = balancer
            .lease(&instances, &LeaseContext::new(route, headers))
            .await?;
        tracing::debug!(
            route = %route.key,
            balancer = balancer.name(),
            instance = %lease.host_and_port(),
            "Leased downstream instance"
        );
        Ok(LeaseGuard::new(balancer, lease))
    }

    /// Query the route's cached provider.
    pub async fn resolve(
        &self,
        config: &ServiceProviderConfig,
        route: &RouteDescriptor,
    ) -> DispatchResult<Vec<ServiceInstance>> {
        let provider = self.provider(config, route).await?;
        ServiceEntryResolver::fetch(provider.as_ref(), route).await
    }

    /// The route's provider, created or replaced as needed.
    pub async fn provider(
        &self,
        config: &ServiceProviderConfig,
        route: &RouteDescriptor,
    ) -> DispatchResult<Arc<dyn ServiceDiscoveryProvider>> {
        let key = ProviderKey::new(config, route);
        match self.providers.entry_async(route.key.clone()).await {
            Entry::Occupied(mut occupied) => {
                if occupied.get().key == key {
                    return Ok(occupied.get().provider.clone());
                }
                let provider = self.resolver.provider(config, route)?;
                tracing::info!(
                    route = %route.key,
                    "Discovery settings changed, provider recreated"
                );
                *occupied.get_mut() = ProviderEntry {
                    key,
                    provider: provider.clone(),
                };
                Ok(provider)
            }
            Entry::Vacant(vacant) => {
                let provider = self.resolver.provider(config, route)?;
                vacant.insert_entry(ProviderEntry {
                    key,
                    provider: provider.clone(),
                });
                Ok(provider)
            }
        }
    }

    /// The route's balancer, created or replaced as needed.
    pub async fn balancer(
        &self,
        route: &RouteDescriptor,
        instances: &[ServiceInstance],
    ) -> DispatchResult<Arc<dyn LoadBalancer>> {
        match self.balancers.entry_async(route.key.clone()).await {
            Entry::Occupied(mut occupied) => {
                if occupied.get().options == route.load_balancer {
                    return Ok(occupied.get().balancer.clone());
                }
                let balancer = self.registry.create(route, instances)?;
                tracing::info!(
                    route = %route.key,
                    balancer = balancer.name(),
                    "Load balancer options changed, balancer recreated"
                );
                *occupied.get_mut() = BalancerEntry {
                    options: route.load_balancer.clone(),
                    balancer: balancer.clone(),
                };
                Ok(balancer)
            }
            Entry::Vacant(vacant) => {
                let balancer = self.registry.create(route, instances)?;
                vacant.insert_entry(BalancerEntry {
                    options: route.load_balancer.clone(),
                    balancer: balancer.clone(),
                });
                Ok(balancer)
            }
        }
    }

    /// Number of routes with a live balancer.
    pub fn balancer_count(&self) -> usize {
        self.balancers.len()
    }
}
