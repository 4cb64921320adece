// Registry-backed discovery against a mock Consul agent
mod common;

#[cfg(test)]
mod test {
    use std::{
        net::SocketAddr,
        sync::{
            Arc, Mutex,
            atomic::{AtomicBool, AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use axum::{
        Json, Router,
        extract::{Path, State},
        http::{HeaderMap, StatusCode},
        response::{IntoResponse, Response},
        routing::get,
    };
    use relaygate::{
        DispatchEngine, ErrorKind,
        config::{LoadBalancerOptions, RouteDescriptor, ServiceProviderConfig},
    };
    use serde_json::{Value, json};

    use crate::common::{body_text, get_request, spawn_downstream, spawn_server};

    #[derive(Clone, Default)]
    struct Registry {
        entries: Arc<Mutex<Vec<SocketAddr>>>,
        hits: Arc<AtomicUsize>,
        failing: Arc<AtomicBool>,
    }

    fn entry(id: &str, addr: SocketAddr) -> Value {
        json!({
            "Node": {"Node": "node-1", "Address": "127.0.0.1"},
            "Service": {
                "ID": id,
                "Service": "product",
                "Address": addr.ip().to_string(),
                "Port": addr.port(),
                "Tags": ["version-v1"]
            }
        })
    }

    async fn health(
        State(registry): State<Registry>,
        Path(service): Path<String>,
        headers: HeaderMap,
    ) -> Response {
        registry.hits.fetch_add(1, Ordering::SeqCst);
        if registry.failing.load(Ordering::SeqCst) {
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
        if headers.get("x-consul-token").and_then(|v| v.to_str().ok()) != Some("secret") {
            return StatusCode::FORBIDDEN.into_response();
        }
        if service != "product" {
            return Json(json!([])).into_response();
        }
        let entries: Vec<Value> = registry
            .entries
            .lock()
            .unwrap()
            .iter()
            .enumerate()
            .map(|(i, addr)| entry(&format!("product-{i}"), *addr))
            .collect();
        Json(Value::Array(entries)).into_response()
    }

    async fn spawn_consul(registry: Registry) -> SocketAddr {
        spawn_server(
            Router::new()
                .route("/v1/health/service/{service}", get(health))
                .with_state(registry),
        )
        .await
    }

    fn provider(kind: &str, consul: SocketAddr) -> ServiceProviderConfig {
        let mut config = ServiceProviderConfig::new(kind, consul.ip().to_string(), consul.port());
        config.token = Some("secret".to_string());
        config.polling_interval_ms = 50;
        config
    }

    fn discovered_route(service: &str) -> RouteDescriptor {
        RouteDescriptor::builder("products")
            .service_name(service)
            .use_service_discovery(true)
            .load_balancer(LoadBalancerOptions::new("RoundRobin"))
            .build()
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_consul_instances_are_dispatched_to() {
        let a = spawn_downstream("alpha").await;
        let b = spawn_downstream("beta").await;
        let registry = Registry::default();
        registry.entries.lock().unwrap().extend([a, b]);
        let consul = spawn_consul(registry.clone()).await;

        let engine = DispatchEngine::builder()
            .service_provider(provider("Consul", consul))
            .build()
            .unwrap();
        let route = discovered_route("product");

        let instances = engine.resolve(&route).await.unwrap();
        assert_eq!(instances.len(), 2);
        assert_eq!(instances[0].id, "product-0");
        assert_eq!(instances[0].version, "v1");
        assert_eq!(instances[1].host_and_port.port, b.port());

        let mut names = Vec::new();
        for _ in 0..2 {
            let response = engine.dispatch(&route, get_request("/")).await.unwrap();
            names.push(body_text(response).await);
        }
        names.sort();
        assert_eq!(names, vec!["alpha", "beta"]);
        // one registry query per resolution
        assert_eq!(registry.hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_consul_failures_are_backend_errors() {
        let registry = Registry::default();
        let consul = spawn_consul(registry.clone()).await;
        let engine = DispatchEngine::builder()
            .service_provider(provider("Consul", consul))
            .build()
            .unwrap();

        // no instances registered for the service
        let err = engine
            .dispatch(&discovered_route("ghost"), get_request("/"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoInstanceAvailable);

        registry.failing.store(true, Ordering::SeqCst);
        let err = engine
            .dispatch(&discovered_route("product"), get_request("/"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DiscoveryBackendError);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_missing_token_is_rejected() {
        let registry = Registry::default();
        let consul = spawn_consul(registry).await;
        let engine = DispatchEngine::builder()
            .service_provider(ServiceProviderConfig::new(
                "Consul",
                consul.ip().to_string(),
                consul.port(),
            ))
            .build()
            .unwrap();

        let err = engine.resolve(&discovered_route("product")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DiscoveryBackendError);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_poll_consul_serves_refreshed_snapshot() {
        let a = spawn_downstream("alpha").await;
        let b = spawn_downstream("beta").await;
        let registry = Registry::default();
        registry.entries.lock().unwrap().push(a);
        let consul = spawn_consul(registry.clone()).await;

        let engine = DispatchEngine::builder()
            .service_provider(provider("PollConsul", consul))
            .build()
            .unwrap();
        let route = discovered_route("product");

        let instances = engine.resolve(&route).await.unwrap();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].host_and_port.port, a.port());

        registry.entries.lock().unwrap().push(b);
        tokio::time::sleep(Duration::from_millis(300)).await;

        let instances = engine.resolve(&route).await.unwrap();
        assert_eq!(instances.len(), 2);
        assert!(registry.hits.load(Ordering::SeqCst) >= 2);

        // a failing registry keeps the last snapshot
        registry.failing.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(engine.resolve(&route).await.unwrap().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_service_fabric_points_at_naming_service() {
        let fabric = spawn_downstream("fabric").await;
        let engine = DispatchEngine::builder()
            .service_provider(ServiceProviderConfig::new(
                "ServiceFabric",
                fabric.ip().to_string(),
                fabric.port(),
            ))
            .build()
            .unwrap();
        let route = RouteDescriptor::builder("fabric")
            .service_name("OcelotServiceApplication/OcelotApplicationService")
            .use_service_discovery(true)
            .build()
            .unwrap();

        let response = engine.dispatch(&route, get_request("/api/values")).await.unwrap();
        assert_eq!(body_text(response).await, "fabric");

        // the path reaches the gateway as sent, without a service prefix
        let response = engine.dispatch(&route, get_request("/login")).await.unwrap();
        assert_eq!(body_text(response).await, "logged in");
    }
}
