//! Consul-backed service discovery.
//!
//! [`ConsulProvider`] asks the Consul health API on every call;
//! [`PollingConsulProvider`] keeps a snapshot refreshed by a background task
//! and serves reads from it.
use std::{sync::Arc, time::Duration};

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tokio::{task::JoinHandle, time::MissedTickBehavior};

use crate::{
    config::{RouteDescriptor, ServiceProviderConfig},
    core::service::{ServiceHostAndPort, ServiceInstance},
    ports::service_discovery::{DiscoveryError, DiscoveryResult, ServiceDiscoveryProvider},
};

const TOKEN_HEADER: &str = "X-Consul-Token";
const VERSION_TAG_PREFIX: &str = "version-";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct HealthEntry {
    pub node: Node,
    pub service: AgentService,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct Node {
    #[serde(default)]
    pub address: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct AgentService {
    #[serde(rename = "ID", default)]
    pub id: String,
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
}

/// Turn health entries into instances, skipping entries that cannot be
/// addressed.
pub(crate) fn to_instances(service_name: &str, entries: Vec<HealthEntry>) -> Vec<ServiceInstance> {
    entries
        .into_iter()
        .filter_map(|entry| {
            let address = if entry.service.address.is_empty() {
                entry.node.address
            } else {
                entry.service.address
            };
            if address.is_empty()
                || address.contains("://")
                || address.contains('/')
                || entry.service.port == 0
            {
                tracing::warn!(
                    service = %service_name,
                    id = %entry.service.id,
                    address = %address,
                    port = entry.service.port,
                    "Skipping Consul entry: address must be a bare host with a non-zero port"
                );
                return None;
            }

            let tags = entry.service.tags.unwrap_or_default();
            let version = tags
                .iter()
                .find_map(|tag| tag.strip_prefix(VERSION_TAG_PREFIX))
                .unwrap_or_default()
                .to_string();
            let name = if entry.service.service.is_empty() {
                service_name.to_string()
            } else {
                entry.service.service
            };
            let host_and_port = ServiceHostAndPort::new(address, entry.service.port);
            let mut instance = ServiceInstance::new(name, host_and_port)
                .with_tags(tags)
                .with_version(version);
            if !entry.service.id.is_empty() {
                instance = instance.with_id(entry.service.id);
            }
            Some(instance)
        })
        .collect()
}

/// Queries Consul for the passing instances of one service.
#[derive(Clone)]
pub struct ConsulProvider {
    client: Client,
    url: String,
    token: Option<String>,
    service_name: String,
}

impl ConsulProvider {
    pub fn new(
        client: Client,
        config: &ServiceProviderConfig,
        service_name: impl Into<String>,
    ) -> Self {
        let service_name = service_name.into();
        Self {
            client,
            url: format!("{}/v1/health/service/{service_name}?passing=true", config.base_url()),
            token: config.token.clone().filter(|token| !token.is_empty()),
            service_name,
        }
    }

    pub fn from_route(
        client: Client,
        config: &ServiceProviderConfig,
        route: &RouteDescriptor,
    ) -> Self {
        Self::new(client, config, route.service_name.clone())
    }

    async fn fetch(&self) -> DiscoveryResult<Vec<ServiceInstance>> {
        let mut request = self.client.get(&self.url);
        if let Some(token) = &self.token {
            request = request.header(TOKEN_HEADER, token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| DiscoveryError::Request(format!("GET {}: {e}", self.url)))?;
        let status = response.status();
        if !status.is_success() {
            return Err(DiscoveryError::Status {
                url: self.url.clone(),
                status: status.as_u16(),
            });
        }
        let entries: Vec<HealthEntry> = response
            .json()
            .await
            .map_err(|e| DiscoveryError::Malformed(e.to_string()))?;

        let instances = to_instances(&self.service_name, entries);
        tracing::debug!(
            service = %self.service_name,
            instances = instances.len(),
            "Fetched instances from Consul"
        );
        Ok(instances)
    }
}

#[async_trait]
impl ServiceDiscoveryProvider for ConsulProvider {
    async fn get(&self) -> DiscoveryResult<Vec<ServiceInstance>> {
        self.fetch().await
    }
}

/// Consul provider serving a periodically refreshed snapshot.
///
/// The first `get` before any poll has landed queries Consul directly. Poll
/// failures keep the previous snapshot. The polling task stops when the
/// provider is dropped.
pub struct PollingConsulProvider {
    consul: ConsulProvider,
    snapshot: Arc<ArcSwapOption<Vec<ServiceInstance>>>,
    task: JoinHandle<()>,
}

impl PollingConsulProvider {
    pub fn new(consul: ConsulProvider, interval: Duration) -> Self {
        let snapshot = Arc::new(ArcSwapOption::const_empty());
        let task = tokio::spawn(Self::poll(
            consul.clone(),
            snapshot.clone(),
            interval.max(Duration::from_millis(1)),
        ));
        Self {
            consul,
            snapshot,
            task,
        }
    }

    async fn poll(
        consul: ConsulProvider,
        snapshot: Arc<ArcSwapOption<Vec<ServiceInstance>>>,
        interval: Duration,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            match consul.fetch().await {
                Ok(instances) => snapshot.store(Some(Arc::new(instances))),
                Err(e) => tracing::warn!(
                    service = %consul.service_name,
                    "Consul poll failed, keeping previous instances: {}",
                    e
                ),
            }
        }
    }
}

impl Drop for PollingConsulProvider {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[async_trait]
impl ServiceDiscoveryProvider for PollingConsulProvider {
    async fn get(&self) -> DiscoveryResult<Vec<ServiceInstance>> {
        if let Some(instances) = self.snapshot.load_full() {
            return Ok(instances.as_ref().clone());
        }
        let instances = self.consul.fetch().await?;
        self.snapshot.store(Some(Arc::new(instances.clone())));
        Ok(instances)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(json: &str) -> Vec<HealthEntry> {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_parse_health_entries() {
        let parsed = to_instances(
            "product",
            entries(
                r#"[
                {"Node": {"Node": "n1", "Address": "10.0.0.1"},
                 "Service": {"ID": "product-1", "Service": "product",
                             "Address": "10.1.0.1", "Port": 8080,
                             "Tags": ["version-v2", "blue"]}},
                {"Node": {"Node": "n2", "Address": "10.0.0.2"},
                 "Service": {"ID": "product-2", "Service": "product", "Address": "", "Port": 8081,
                             "Tags": null}}
            ]"#,
            ),
        );

        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].id, "product-1");
        assert_eq!(parsed[0].host_and_port, ServiceHostAndPort::new("10.1.0.1", 8080));
        assert_eq!(parsed[0].version, "v2");
        assert!(parsed[0].tags.contains("blue"));
        // falls back to the node address
        assert_eq!(parsed[1].host_and_port, ServiceHostAndPort::new("10.0.0.2", 8081));
        assert!(parsed[1].tags.is_empty());
    }

    #[test]
    fn test_unaddressable_entries_are_skipped() {
        let parsed = to_instances(
            "product",
            entries(
                r#"[
                {"Node": {"Address": "10.0.0.1"},
                 "Service": {"ID": "a", "Address": "http://10.1.0.1", "Port": 80}},
                {"Node": {"Address": "10.0.0.1"},
                 "Service": {"ID": "b", "Address": "10.1.0.1/api", "Port": 80}},
                {"Node": {"Address": "10.0.0.1"},
                 "Service": {"ID": "c", "Address": "10.1.0.1", "Port": 0}},
                {"Node": {"Address": "10.0.0.1"},
                 "Service": {"ID": "d", "Address": "10.1.0.9", "Port": 81}}
            ]"#,
            ),
        );

        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].id, "d");
        assert_eq!(parsed[0].name, "product");
    }

    #[test]
    fn test_url_and_token() {
        let mut config = ServiceProviderConfig::new("Consul", "consul.local", 8500);
        config.token = Some(String::new());
        let provider = ConsulProvider::new(Client::new(), &config, "orders");

        assert_eq!(
            provider.url,
            "http://consul.local:8500/v1/health/service/orders?passing=true"
        );
        assert!(provider.token.is_none());
    }
}
