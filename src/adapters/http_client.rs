use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use eyre::Result;
use http_body_util::BodyExt;
use hyper::{Request, Response, Version, header, header::HeaderValue};
use hyper_rustls::HttpsConnector;
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::{TokioExecutor, TokioTimer},
};
use rustls_native_certs::load_native_certs;
use tokio::sync::Semaphore;

use crate::{
    config::HttpHandlerOptions,
    ports::http_client::{HttpClient, HttpClientError, HttpClientResult},
};

/// HTTP client adapter using Hyper with Rustls (HTTP/1.1 + HTTP/2).
///
/// Responsibilities:
/// * Applies the route's connection pool settings
/// * Caps concurrent connections at `max_connections_per_server`; a call
///   holds its slot until the response body is dropped
/// * Sets the `Host` header for the chosen instance
/// * Forces request version to HTTP/1.1 while allowing ALPN to negotiate h2
/// * Converts between Hyper body and Axum body types
///
/// Timeouts, retries and circuit breaking live in the interceptor pipeline.
pub struct HttpClientAdapter {
    client: Client<HttpsConnector<HttpConnector>, AxumBody>,
    connection_slots: Option<Arc<Semaphore>>,
}

impl HttpClientAdapter {
    /// Create a client with default pool settings.
    pub fn new() -> Result<Self> {
        Self::with_options(&HttpHandlerOptions::default())
    }

    /// Create a client pooled according to a route's handler options.
    pub fn with_options(options: &HttpHandlerOptions) -> Result<Self> {
        // Install default crypto provider for rustls if not already set
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let mut http_connector = HttpConnector::new();
        http_connector.enforce_http(false); // Allow HTTPS URLs

        let mut root_cert_store = rustls::RootCertStore::empty();
        let native_certs = load_native_certs();

        if !native_certs.certs.is_empty() {
            for cert in native_certs.certs {
                if root_cert_store.add(cert).is_err() {
                    tracing::warn!("Failed to add native certificate to rustls RootCertStore");
                }
            }
            tracing::debug!("Loaded {} native root certificates.", root_cert_store.len());
        }

        if !native_certs.errors.is_empty() {
            tracing::warn!(
                "Some native certificates failed to load: {:?}",
                native_certs.errors
            );
        }

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_cert_store)
            .with_no_client_auth();

        let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http_connector);

        let mut builder = Client::builder(TokioExecutor::new());
        builder
            .pool_timer(TokioTimer::new())
            .pool_idle_timeout(Duration::from_secs(options.pooled_connection_lifetime_secs));
        let max_connections = options.max_connections_per_server.filter(|max| *max > 0);
        if let Some(max) = max_connections {
            builder.pool_max_idle_per_host(max);
        }
        let client = builder.build::<_, AxumBody>(https_connector);

        tracing::debug!(
            pooled_connection_lifetime_secs = options.pooled_connection_lifetime_secs,
            max_connections_per_server = ?options.max_connections_per_server,
            "Created downstream HTTP client"
        );
        Ok(Self {
            client,
            connection_slots: max_connections.map(|max| Arc::new(Semaphore::new(max))),
        })
    }

    fn set_host_header(req: &mut Request<AxumBody>) -> HttpClientResult<()> {
        let Some(host) = req.uri().host() else {
            tracing::error!("Outgoing URI has no host: {}", req.uri());
            return Err(HttpClientError::InvalidRequest(
                "Outgoing URI has no host".to_string(),
            ));
        };
        let value = match req.uri().port_u16() {
            Some(port) => HeaderValue::from_str(&format!("{host}:{port}")),
            None => HeaderValue::from_str(host),
        }
        .map_err(|e| HttpClientError::InvalidRequest(format!("Invalid host header: {e}")))?;
        req.headers_mut().insert(header::HOST, value);
        Ok(())
    }
}

#[async_trait]
impl HttpClient for HttpClientAdapter {
    async fn send_request(
        &self,
        mut req: Request<AxumBody>,
    ) -> HttpClientResult<Response<AxumBody>> {
        Self::set_host_header(&mut req)?;

        let (mut parts, body) = req.into_parts();
        parts.version = Version::HTTP_11;
        tracing::debug!("Sending request: {} {}", parts.method, parts.uri);

        let method = parts.method.clone();
        let uri = parts.uri.clone();

        let slot = match &self.connection_slots {
            Some(slots) => Some(
                slots
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(HttpClientError::other)?,
            ),
            None => None,
        };

        match self.client.request(Request::from_parts(parts, body)).await {
            Ok(response) => {
                let (mut parts, hyper_body) = response.into_parts();
                // the body is re-framed by whoever serves it next
                parts.headers.remove(header::TRANSFER_ENCODING);
                let body = match slot {
                    // the slot is freed with the body
                    Some(slot) => AxumBody::new(hyper_body.map_frame(move |frame| {
                        let _held = &slot;
                        frame
                    })),
                    None => AxumBody::new(hyper_body),
                };
                Ok(Response::from_parts(parts, body))
            }
            Err(e) if e.is_connect() => {
                tracing::debug!("Connection to {} failed: {}", uri, e);
                Err(HttpClientError::ConnectionError(format!(
                    "Request to {method} {uri} failed: {e}"
                )))
            }
            Err(e) => {
                tracing::debug!("Request {} {} failed: {}", method, uri, e);
                Err(HttpClientError::other(e))
            }
        }
    }
}
