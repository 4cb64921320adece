use std::sync::Arc;

use async_trait::async_trait;
use hyper::{Request, Response};

use crate::ports::http_client::{Body, HttpClient, HttpClientResult};

/// A composable unit wrapping the outgoing call (logging, auth headers,
/// circuit breaking, ...).
///
/// Implementations either call [`Next::run`] to continue down the chain or
/// return early without touching the wire.
#[async_trait]
pub trait Interceptor: Send + Sync + 'static {
    /// Stable name; part of the cached client signature
    fn name(&self) -> &str;

    async fn intercept(
        &self,
        req: Request<Body>,
        next: Next<'_>,
    ) -> HttpClientResult<Response<Body>>;
}

/// The remainder of an interceptor chain, ending at the transport.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    chain: &'a [Arc<dyn Interceptor>],
    transport: &'a dyn HttpClient,
}

impl<'a> Next<'a> {
    pub fn new(chain: &'a [Arc<dyn Interceptor>], transport: &'a dyn HttpClient) -> Self {
        Self { chain, transport }
    }

    /// Hand the request to the next interceptor, or to the transport once the
    /// chain is exhausted.
    pub async fn run(self, req: Request<Body>) -> HttpClientResult<Response<Body>> {
        match self.chain.split_first() {
            Some((head, rest)) => {
                head.intercept(
                    req,
                    Next {
                        chain: rest,
                        transport: self.transport,
                    },
                )
                .await
            }
            None => self.transport.send_request(req).await,
        }
    }
}
