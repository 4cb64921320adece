use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;
use scc::HashMap;

use super::{Lease, LeaseContext, LoadBalancer};
use crate::core::{
    error::DispatchResult,
    service::{ServiceHostAndPort, ServiceInstance},
};

/// Picks the instance with the fewest in-flight leases; ties go to the
/// instance listed first.
///
/// Counters live in a concurrent map keyed by address. The chosen counter is
/// bumped with a compare-and-swap against the value the scan observed, and the
/// scan is retried if another lease got there first, so concurrent callers
/// never both claim the same minimum.
pub struct LeastConnection {
    leases: HashMap<ServiceHostAndPort, Arc<AtomicUsize>>,
}

impl Default for LeastConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl LeastConnection {
    pub fn new() -> Self {
        Self {
            leases: HashMap::new(),
        }
    }

    async fn counter(&self, host_and_port: &ServiceHostAndPort) -> Arc<AtomicUsize> {
        self.leases
            .entry_async(host_and_port.clone())
            .await
            .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
            .get()
            .clone()
    }

    /// Current number of unreleased leases for an address.
    pub async fn active_leases(&self, host_and_port: &ServiceHostAndPort) -> usize {
        self.leases
            .read_async(host_and_port, |_, active| active.load(Ordering::Acquire))
            .await
            .unwrap_or(0)
    }

    /// Drop counters of instances that are no longer resolved. Outstanding
    /// leases keep their own handle to the counter, so releases still land.
    async fn forget_missing(&self, instances: &[ServiceInstance]) {
        if self.leases.len() <= instances.len() {
            return;
        }
        self.leases
            .retain_async(|host_and_port, _| {
                instances
                    .iter()
                    .any(|instance| &instance.host_and_port == host_and_port)
            })
            .await;
    }
}

#[async_trait]
impl LoadBalancer for LeastConnection {
    async fn lease(
        &self,
        instances: &[ServiceInstance],
        ctx: &LeaseContext<'_>,
    ) -> DispatchResult<Lease> {
        if instances.is_empty() {
            return Err(ctx.no_instance());
        }
        self.forget_missing(instances).await;

        loop {
            let mut best: Option<(&ServiceInstance, Arc<AtomicUsize>, usize)> = None;
            for instance in instances {
                let counter = self.counter(&instance.host_and_port).await;
                let active = counter.load(Ordering::Acquire);
                if best.as_ref().is_none_or(|(_, _, min)| active < *min) {
                    best = Some((instance, counter, active));
                }
            }

            let Some((instance, counter, observed)) = best else {
                return Err(ctx.no_instance());
            };
            if counter
                .compare_exchange(observed, observed + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                tracing::trace!(
                    instance = %instance.host_and_port,
                    active = observed + 1,
                    "Least connection lease"
                );
                return Ok(Lease::counted(instance.host_and_port.clone(), counter));
            }
        }
    }

    fn name(&self) -> &str {
        "least_connection"
    }
}
