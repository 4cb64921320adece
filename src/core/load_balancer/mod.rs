//! Load balancing strategies and their registry.
//!
//! A balancer picks one instance out of the list resolved for the current
//! request and hands back a [`Lease`]. The lease must be released once the
//! downstream call is over, whatever its outcome; [`LeaseGuard`] does that on
//! drop so early returns and cancellation are covered too.
use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use hyper::{HeaderMap, header::COOKIE};

use crate::{
    config::RouteDescriptor,
    core::{
        error::{DispatchError, DispatchResult},
        service::{ServiceHostAndPort, ServiceInstance},
    },
};

pub mod house;
pub mod least_connection;
pub mod no_balancer;
pub mod random;
pub mod round_robin;
pub mod sticky_session;

pub use house::LoadBalancerHouse;
pub use least_connection::LeastConnection;
pub use no_balancer::NoLoadBalancer;
pub use random::RandomBalancer;
pub use round_robin::RoundRobin;
pub use sticky_session::CookieStickySessions;

pub const ROUND_ROBIN: &str = "RoundRobin";
pub const LEAST_CONNECTION: &str = "LeastConnection";
pub const COOKIE_STICKY_SESSIONS: &str = "CookieStickySessions";
pub const RANDOM: &str = "Random";

/// Per-request inputs available to a balancer.
#[derive(Clone, Copy)]
pub struct LeaseContext<'a> {
    pub route: &'a RouteDescriptor,
    pub headers: &'a HeaderMap,
}

impl<'a> LeaseContext<'a> {
    pub fn new(route: &'a RouteDescriptor, headers: &'a HeaderMap) -> Self {
        Self { route, headers }
    }

    /// Value of the named request cookie, if present.
    pub fn cookie(&self, name: &str) -> Option<&'a str> {
        self.headers
            .get_all(COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value)
    }

    pub(crate) fn no_instance(&self) -> DispatchError {
        DispatchError::NoInstanceAvailable(self.route.key.clone())
    }
}

/// One selected instance for one request.
#[derive(Debug)]
pub struct Lease {
    host_and_port: ServiceHostAndPort,
    active: Option<Arc<AtomicUsize>>,
}

impl Lease {
    pub fn new(host_and_port: ServiceHostAndPort) -> Self {
        Self {
            host_and_port,
            active: None,
        }
    }

    /// A lease backed by an in-flight counter that `release` decrements.
    pub fn counted(host_and_port: ServiceHostAndPort, active: Arc<AtomicUsize>) -> Self {
        Self {
            host_and_port,
            active: Some(active),
        }
    }

    pub fn host_and_port(&self) -> &ServiceHostAndPort {
        &self.host_and_port
    }

    pub(crate) fn release_counter(&self) {
        if let Some(active) = &self.active {
            let _ = active.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        }
    }
}

/// Trait defining the interface for load balancing strategies
#[async_trait]
pub trait LoadBalancer: Send + Sync + 'static {
    /// Select an instance for the current request
    async fn lease(
        &self,
        instances: &[ServiceInstance],
        ctx: &LeaseContext<'_>,
    ) -> DispatchResult<Lease>;

    /// Give a lease back once the downstream call has finished
    fn release(&self, lease: &Lease) {
        lease.release_counter();
    }

    fn name(&self) -> &str;
}

/// Builds a balancer for a route from the instances resolved when the route
/// is first seen.
pub type BalancerFactory =
    Arc<dyn Fn(&RouteDescriptor, &[ServiceInstance]) -> Arc<dyn LoadBalancer> + Send + Sync>;

/// Kind -> factory map for load balancers.
#[derive(Clone, Default)]
pub struct BalancerRegistry {
    factories: HashMap<String, BalancerFactory>,
}

impl BalancerRegistry {
    /// An empty registry; see [`BalancerRegistry::with_builtins`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with every built-in strategy.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(crate::config::NO_LOAD_BALANCER, |_, _| {
            Arc::new(NoLoadBalancer::new()) as Arc<dyn LoadBalancer>
        });
        registry.register(ROUND_ROBIN, |_, _| {
            Arc::new(RoundRobin::new()) as Arc<dyn LoadBalancer>
        });
        registry.register(LEAST_CONNECTION, |_, _| {
            Arc::new(LeastConnection::new()) as Arc<dyn LoadBalancer>
        });
        registry.register(COOKIE_STICKY_SESSIONS, |route, _| {
            Arc::new(CookieStickySessions::new(
                route.load_balancer.key.clone(),
                route.load_balancer.expiry(),
            )) as Arc<dyn LoadBalancer>
        });
        registry.register(RANDOM, |_, _| {
            Arc::new(RandomBalancer::new()) as Arc<dyn LoadBalancer>
        });
        registry
    }

    pub fn register<F>(&mut self, kind: impl Into<String>, factory: F)
    where
        F: Fn(&RouteDescriptor, &[ServiceInstance]) -> Arc<dyn LoadBalancer>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(kind.into(), Arc::new(factory));
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    /// Create the balancer declared by the route.
    pub fn create(
        &self,
        route: &RouteDescriptor,
        instances: &[ServiceInstance],
    ) -> DispatchResult<Arc<dyn LoadBalancer>> {
        let kind = route.load_balancer.effective_kind();
        let factory = self
            .factories
            .get(kind)
            .ok_or_else(|| DispatchError::LoadBalancerNotFound(kind.to_string()))?;
        let balancer = factory(route, instances);
        tracing::debug!(
            route = %route.key,
            kind = %kind,
            balancer = balancer.name(),
            "Created load balancer"
        );
        Ok(balancer)
    }
}

impl fmt::Debug for BalancerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<&String> = self.factories.keys().collect();
        kinds.sort_unstable();
        f.debug_struct("BalancerRegistry")
            .field("kinds", &kinds)
            .finish()
    }
}

/// Scoped lease: releases itself back to its balancer when dropped.
pub struct LeaseGuard {
    balancer: Arc<dyn LoadBalancer>,
    lease: Lease,
}

impl LeaseGuard {
    pub fn new(balancer: Arc<dyn LoadBalancer>, lease: Lease) -> Self {
        Self { balancer, lease }
    }

    pub fn host_and_port(&self) -> &ServiceHostAndPort {
        self.lease.host_and_port()
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.balancer.release(&self.lease);
        tracing::trace!(instance = %self.lease.host_and_port(), "Released load balancer lease");
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn instances(hosts: &[&str]) -> Vec<ServiceInstance> {
        hosts
            .iter()
            .map(|host| ServiceInstance::new("svc", ServiceHostAndPort::new(*host, 80)))
            .collect()
    }

    pub fn route(kind: &str) -> RouteDescriptor {
        RouteDescriptor::builder("svc-route")
            .service_name("svc")
            .load_balancer(crate::config::LoadBalancerOptions::new(kind))
            .build()
            .unwrap()
    }
}
