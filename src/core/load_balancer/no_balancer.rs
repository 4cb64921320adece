use async_trait::async_trait;

use super::{Lease, LeaseContext, LoadBalancer};
use crate::core::{
    error::{DispatchError, DispatchResult},
    service::ServiceInstance,
};

/// Pass-through strategy for routes with exactly one downstream.
#[derive(Debug, Default)]
pub struct NoLoadBalancer;

impl NoLoadBalancer {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl LoadBalancer for NoLoadBalancer {
    async fn lease(
        &self,
        instances: &[ServiceInstance],
        ctx: &LeaseContext<'_>,
    ) -> DispatchResult<Lease> {
        match instances {
            [] => Err(ctx.no_instance()),
            [only] => Ok(Lease::new(only.host_and_port.clone())),
            many => Err(DispatchError::LoadBalancerMisconfigured(format!(
                "route '{}' has no load balancer but resolved {} instances",
                ctx.route.key,
                many.len()
            ))),
        }
    }

    fn name(&self) -> &str {
        "no_load_balancer"
    }
}
