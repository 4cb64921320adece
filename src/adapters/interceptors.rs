use std::time::Instant;

use async_trait::async_trait;
use hyper::{
    Request, Response,
    header::{HeaderName, HeaderValue},
};
use tracing::Instrument;

use crate::{
    ports::{
        http_client::{Body, HttpClientResult},
        interceptor::{Interceptor, Next},
    },
    tracing_setup::create_backend_span,
};

pub const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

/// Wraps each downstream call in a `backend_request` span and makes sure it
/// carries an `x-request-id`.
#[derive(Debug, Default, Clone)]
pub struct TracingInterceptor;

impl TracingInterceptor {
    pub const NAME: &'static str = "tracing";

    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Interceptor for TracingInterceptor {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn intercept(
        &self,
        mut req: Request<Body>,
        next: Next<'_>,
    ) -> HttpClientResult<Response<Body>> {
        let request_id = match req.headers().get(&REQUEST_ID_HEADER) {
            Some(existing) => existing.to_str().unwrap_or_default().to_string(),
            None => {
                let generated = uuid::Uuid::new_v4().to_string();
                if let Ok(value) = HeaderValue::from_str(&generated) {
                    req.headers_mut().insert(REQUEST_ID_HEADER, value);
                }
                generated
            }
        };

        let span = create_backend_span(
            &req.uri().to_string(),
            req.method().as_str(),
            req.uri().path(),
            &request_id,
        );
        let start = Instant::now();
        let result = next.run(req).instrument(span.clone()).await;

        span.record("duration_ms", start.elapsed().as_millis() as u64);
        match &result {
            Ok(response) => {
                span.record("http.status_code", response.status().as_u16());
            }
            Err(e) => {
                tracing::warn!(parent: &span, "Downstream call failed: {}", e);
            }
        }
        result
    }
}
