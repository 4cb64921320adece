use std::{future::Future, sync::Arc};

use hyper::{Request, Response, Uri};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, field};

use crate::{
    config::{RouteDescriptor, ServiceProviderConfig},
    core::{
        client_cache::{ClientCache, DownstreamClient},
        error::DispatchResult,
        error_translator::ErrorTranslator,
        load_balancer::LoadBalancerHouse,
        pipeline::{PipelineBuilder, scheme_for},
        service::ServiceHostAndPort,
    },
    metrics::{DispatchTimer, increment_dispatch_total},
    ports::http_client::{Body, HttpClientError},
    tracing_setup::create_dispatch_span,
};

/// An inbound request already matched to a route, plus its cancellation.
#[derive(Debug)]
pub struct RequestContext {
    pub request: Request<Body>,
    pub cancellation: CancellationToken,
}

impl RequestContext {
    pub fn new(request: Request<Body>) -> Self {
        Self {
            request,
            cancellation: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(request: Request<Body>, cancellation: CancellationToken) -> Self {
        Self {
            request,
            cancellation,
        }
    }
}

/// Runs one request from route to downstream response.
///
/// The load balancer lease and the client lease are both scoped guards, so
/// the lease is released and the client saved back on every exit path,
/// including when the dispatch future itself is dropped.
pub struct Dispatcher {
    service_provider: ServiceProviderConfig,
    house: LoadBalancerHouse,
    cache: Arc<ClientCache>,
    pipeline: PipelineBuilder,
    translator: ErrorTranslator,
}

impl Dispatcher {
    pub fn new(
        service_provider: ServiceProviderConfig,
        house: LoadBalancerHouse,
        cache: Arc<ClientCache>,
        pipeline: PipelineBuilder,
        translator: ErrorTranslator,
    ) -> Self {
        Self {
            service_provider,
            house,
            cache,
            pipeline,
            translator,
        }
    }

    pub fn service_provider(&self) -> &ServiceProviderConfig {
        &self.service_provider
    }

    pub fn house(&self) -> &LoadBalancerHouse {
        &self.house
    }

    pub fn client_cache(&self) -> &Arc<ClientCache> {
        &self.cache
    }

    pub fn pipeline(&self) -> &PipelineBuilder {
        &self.pipeline
    }

    /// Send through a client, racing the caller's cancellation. A token that
    /// has already fired wins without the request being sent.
    pub async fn send(
        &self,
        client: &DownstreamClient,
        request: Request<Body>,
        cancellation: &CancellationToken,
    ) -> DispatchResult<Response<Body>> {
        let result = tokio::select! {
            biased;
            _ = cancellation.cancelled() => Err(HttpClientError::Canceled),
            result = client.send(request) => result,
        };
        result.map_err(|e| self.translator.translate(e))
    }

    /// Run one dispatch step unless the caller cancels first.
    async fn cancellable<T>(
        &self,
        cancellation: &CancellationToken,
        step: impl Future<Output = DispatchResult<T>>,
    ) -> DispatchResult<T> {
        tokio::select! {
            biased;
            _ = cancellation.cancelled() => {
                Err(self.translator.translate(HttpClientError::Canceled))
            }
            result = step => result,
        }
    }

    pub async fn dispatch(
        &self,
        route: &RouteDescriptor,
        ctx: RequestContext,
    ) -> DispatchResult<Response<Body>> {
        let span = create_dispatch_span(&route.key, &route.service_name);
        let _timer = DispatchTimer::new(&route.key);

        let result = self.dispatch_inner(route, ctx).instrument(span).await;
        let outcome = match &result {
            Ok(_) => "ok".to_string(),
            Err(e) => e.kind().to_string(),
        };
        increment_dispatch_total(&route.key, &outcome);
        result
    }

    async fn dispatch_inner(
        &self,
        route: &RouteDescriptor,
        ctx: RequestContext,
    ) -> DispatchResult<Response<Body>> {
        let RequestContext {
            request,
            cancellation,
        } = ctx;
        let (mut parts, body) = request.into_parts();

        // Discovery and the balancer lease may block on registry I/O.
        let lease = self
            .cancellable(
                &cancellation,
                self.house.lease(&self.service_provider, route, &parts.headers),
            )
            .await?;
        let instance = lease.host_and_port().clone();
        tracing::Span::current().record("instance", field::display(&instance));

        parts.uri = downstream_uri(&parts.uri, route, &instance)
            .map_err(|e| self.translator.translate(e))?;
        let request = Request::from_parts(parts, body);

        let signature = self.pipeline.signature(route, &instance);
        let client = self
            .cancellable(
                &cancellation,
                self.cache.acquire(signature.clone(), || self.pipeline.build(route, signature)),
            )
            .await?;

        let result = self.send(&client, request, &cancellation).await;
        match &result {
            Ok(response) => {
                tracing::debug!(status = response.status().as_u16(), "Downstream responded")
            }
            Err(e) => tracing::warn!(kind = %e.kind(), "Dispatch failed: {}", e),
        }
        result
    }
}

/// Address of `uri` on the chosen instance, keeping path and query.
pub fn downstream_uri(
    uri: &Uri,
    route: &RouteDescriptor,
    instance: &ServiceHostAndPort,
) -> Result<Uri, HttpClientError> {
    let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let downstream = format!(
        "{}://{}:{}{}",
        scheme_for(route, instance),
        instance.host,
        instance.port,
        path_and_query
    );
    downstream.parse::<Uri>().map_err(|e| {
        HttpClientError::InvalidRequest(format!("invalid downstream uri '{downstream}': {e}"))
    })
}
