//! relaygate - the downstream dispatch engine of an API gateway.
//!
//! Given a request that the gateway has already matched to a route, relaygate
//! resolves the route's downstream instances, picks one through a load
//! balancer, obtains a cached client wrapped in an ordered interceptor
//! pipeline (circuit breaker included), sends the call under cancellation and
//! timeout, and maps transport failures onto a typed error taxonomy.
//!
//! # Features
//! - Static addresses or registry-backed discovery (Consul, polling Consul,
//!   Service Fabric), extensible by kind
//! - Load balancing: no balancer, round robin, least connection, random and
//!   cookie sticky sessions, plus custom strategies
//! - Per-signature client cache with scoped leases and idle eviction
//! - Interceptor pipeline: tracing, global, per route, then QoS innermost
//! - Per-route circuit breaker and per-call timeout
//! - Cookie replay for routes that keep a cookie container
//! - Metrics via the `metrics` facade and structured tracing via `tracing`
//!
//! # Quick Example
//! ```no_run
//! use hyper::Request;
//! use relaygate::{DispatchEngine, RequestContext, config::RouteDescriptor, ports::Body};
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let engine = DispatchEngine::builder().build()?;
//! let route = RouteDescriptor::builder("orders")
//!     .downstream("localhost", 8081)
//!     .build()
//!     .map_err(|e| eyre::eyre!(e))?;
//!
//! let request = Request::builder().uri("/orders/42").body(Body::empty())?;
//! let response = engine.dispatch(&route, RequestContext::new(request)).await?;
//! println!("{}", response.status());
//! # Ok(()) }
//! ```
//!
//! # Architecture
//! The crate separates **ports** (traits) from **adapters** (implementations)
//! while keeping the dispatch logic inside `core`. [`engine`] wires them
//! together.
//!
//! # Error Handling
//! Engine operations return [`DispatchResult`]; [`DispatchError::kind`] is
//! what a status-code mapper needs. Application plumbing (config loading,
//! tracing setup, the CLI) uses `eyre::Result` with `WrapErr` context.
//!
//! # Concurrency & Data Structures
//! Per-route and per-signature state lives in `scc::HashMap`s with atomic
//! get-or-create, so concurrent first requests share one balancer, one
//! breaker and one cached client.
pub mod config;
pub mod engine;
pub mod metrics;
pub mod ports;
pub mod tracing_setup;

pub mod adapters;
pub mod core;

pub use crate::{
    adapters::HttpClientAdapter,
    core::{DispatchError, DispatchResult, ErrorKind, RequestContext},
    engine::{DispatchEngine, DispatchEngineBuilder},
    ports::http_client::HttpClient,
};
