use async_trait::async_trait;

use crate::{
    config::{RouteDescriptor, ServiceProviderConfig},
    core::service::{ServiceHostAndPort, ServiceInstance},
    ports::service_discovery::{DiscoveryResult, ServiceDiscoveryProvider},
};

/// Service Fabric routes through its reverse proxy / naming gateway, so the
/// only "instance" is the configured gateway address. The instance is named
/// after the route's service; the request path is forwarded unchanged.
#[derive(Debug, Clone)]
pub struct ServiceFabricProvider {
    instance: ServiceInstance,
}

impl ServiceFabricProvider {
    pub fn new(config: &ServiceProviderConfig, service_name: impl Into<String>) -> Self {
        Self {
            instance: ServiceInstance::new(
                service_name,
                ServiceHostAndPort::new(config.host.clone(), config.port),
            ),
        }
    }

    pub fn from_route(config: &ServiceProviderConfig, route: &RouteDescriptor) -> Self {
        Self::new(config, route.service_name.clone())
    }
}

#[async_trait]
impl ServiceDiscoveryProvider for ServiceFabricProvider {
    async fn get(&self) -> DiscoveryResult<Vec<ServiceInstance>> {
        Ok(vec![self.instance.clone()])
    }
}
