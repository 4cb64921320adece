use async_trait::async_trait;
use rand::Rng;

use super::{Lease, LeaseContext, LoadBalancer};
use crate::core::{error::DispatchResult, service::ServiceInstance};

/// Random selection load balancing strategy
#[derive(Debug, Default)]
pub struct RandomBalancer;

impl RandomBalancer {
    /// Create a new random selection strategy
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl LoadBalancer for RandomBalancer {
    async fn lease(
        &self,
        instances: &[ServiceInstance],
        ctx: &LeaseContext<'_>,
    ) -> DispatchResult<Lease> {
        if instances.is_empty() {
            return Err(ctx.no_instance());
        }
        let index = rand::rng().random_range(0..instances.len());
        Ok(Lease::new(instances[index].host_and_port.clone()))
    }

    fn name(&self) -> &str {
        "random"
    }
}
