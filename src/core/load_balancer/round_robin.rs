use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use super::{Lease, LeaseContext, LoadBalancer};
use crate::core::{error::DispatchResult, service::ServiceInstance};

/// Round-robin load balancing strategy
///
/// The cursor advances on every lease, including failed ones, and is reduced
/// modulo the instance count of the current call so list changes are tolerated.
#[derive(Debug, Default)]
pub struct RoundRobin {
    cursor: AtomicUsize,
}

impl RoundRobin {
    /// Create a new round-robin strategy
    pub fn new() -> Self {
        Self {
            cursor: AtomicUsize::new(0),
        }
    }

    /// Advance the cursor and pick from `instances`.
    pub(crate) fn pick<'a>(&self, instances: &'a [ServiceInstance]) -> Option<&'a ServiceInstance> {
        let count = self.cursor.fetch_add(1, Ordering::SeqCst);
        if instances.is_empty() {
            return None;
        }
        instances.get(count % instances.len())
    }
}

#[async_trait]
impl LoadBalancer for RoundRobin {
    async fn lease(
        &self,
        instances: &[ServiceInstance],
        ctx: &LeaseContext<'_>,
    ) -> DispatchResult<Lease> {
        self.pick(instances)
            .map(|instance| Lease::new(instance.host_and_port.clone()))
            .ok_or_else(|| ctx.no_instance())
    }

    fn name(&self) -> &str {
        "round_robin"
    }
}
