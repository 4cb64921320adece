pub mod consul;
pub mod http_client;
pub mod interceptors;
pub mod service_fabric;

use std::sync::Arc;

/// Re-export commonly used types from adapters
pub use consul::{ConsulProvider, PollingConsulProvider};
pub use http_client::HttpClientAdapter;
pub use interceptors::TracingInterceptor;
pub use service_fabric::ServiceFabricProvider;

use crate::{
    core::service_discovery::DiscoveryRegistry,
    ports::service_discovery::ServiceDiscoveryProvider,
};

pub const CONSUL: &str = "Consul";
pub const POLL_CONSUL: &str = "PollConsul";
pub const SERVICE_FABRIC: &str = "ServiceFabric";

/// Register the built-in discovery kinds. All Consul providers share `client`.
pub fn register_builtin_discovery(registry: &mut DiscoveryRegistry, client: reqwest::Client) {
    let consul_client = client.clone();
    registry.register(CONSUL, move |config, route| {
        Arc::new(ConsulProvider::from_route(consul_client.clone(), config, route))
            as Arc<dyn ServiceDiscoveryProvider>
    });
    registry.register(POLL_CONSUL, move |config, route| {
        let consul = ConsulProvider::from_route(client.clone(), config, route);
        Arc::new(PollingConsulProvider::new(consul, config.polling_interval()))
            as Arc<dyn ServiceDiscoveryProvider>
    });
    registry.register(SERVICE_FABRIC, |config, route| {
        Arc::new(ServiceFabricProvider::from_route(config, route))
            as Arc<dyn ServiceDiscoveryProvider>
    });
}
