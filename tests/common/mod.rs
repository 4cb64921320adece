//! Downstream and registry mocks shared by the integration tests.
#![allow(dead_code)]

use std::{net::SocketAddr, time::Duration};

use axum::{Router, body::to_bytes, http::HeaderMap, routing::get};
use hyper::{Request, Response};
use relaygate::{RequestContext, ports::Body};
use tokio::net::TcpListener;

/// Serve `router` on an ephemeral local port.
pub async fn spawn_server(router: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

/// A downstream answering every path with its own name, plus:
/// * `/slow` answering after five seconds
/// * `/login` setting a `session` cookie
/// * `/echo-cookie` echoing the request's `Cookie` header
/// * `/echo-request-id` echoing `x-request-id`
pub async fn spawn_downstream(name: &'static str) -> SocketAddr {
    let router = Router::new()
        .route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "slow"
            }),
        )
        .route(
            "/login",
            get(|| async {
                Response::builder()
                    .header("set-cookie", "session=abc123; Path=/; HttpOnly")
                    .body(Body::from("logged in"))
                    .unwrap()
            }),
        )
        .route(
            "/echo-cookie",
            get(|headers: HeaderMap| async move { header_text(&headers, "cookie") }),
        )
        .route(
            "/echo-request-id",
            get(|headers: HeaderMap| async move { header_text(&headers, "x-request-id") }),
        )
        .fallback(move || async move { name });
    spawn_server(router).await
}

/// An address nothing listens on.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

fn header_text(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

pub fn get_request(path: &str) -> RequestContext {
    RequestContext::new(Request::builder().uri(path).body(Body::empty()).unwrap())
}

pub async fn body_text(response: Response<Body>) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}
