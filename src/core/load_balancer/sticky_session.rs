use std::{sync::Mutex, time::Duration};

use async_trait::async_trait;
use scc::{HashMap, hash_map::Entry};
use tokio::time::Instant;

use super::{Lease, LeaseContext, LoadBalancer, RoundRobin};
use crate::core::{
    error::DispatchResult,
    service::{ServiceHostAndPort, ServiceInstance},
};

#[derive(Debug, Clone)]
struct StickySession {
    host_and_port: ServiceHostAndPort,
    expires_at: Instant,
}

/// Pins a client session (identified by a request cookie) to one instance.
///
/// The session table is keyed by cookie value. The expiry check, the
/// fallback round-robin pick and the TTL refresh all happen while holding the
/// map entry for that key, so two concurrent requests of the same session
/// always land on the same instance. Requests without the cookie are balanced
/// round-robin and leave no session behind.
///
/// Sessions whose cookie never comes back are swept on a later lease, at
/// most once per TTL (and never more often than [`MIN_SWEEP_INTERVAL`]).
pub struct CookieStickySessions {
    key: String,
    ttl: Duration,
    round_robin: RoundRobin,
    sessions: HashMap<String, StickySession>,
    next_sweep: Mutex<Instant>,
}

pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

impl CookieStickySessions {
    pub fn new(key: impl Into<String>, ttl: Duration) -> Self {
        Self {
            key: key.into(),
            ttl,
            round_robin: RoundRobin::new(),
            sessions: HashMap::new(),
            next_sweep: Mutex::new(Instant::now() + ttl.max(MIN_SWEEP_INTERVAL)),
        }
    }

    /// Number of sessions currently tracked (live or not yet purged).
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Drop every expired session.
    pub async fn purge_expired(&self) {
        let now = Instant::now();
        self.sessions
            .retain_async(|_, session| session.expires_at > now)
            .await;
    }

    fn sweep_due(&self, now: Instant) -> bool {
        let Ok(mut next_sweep) = self.next_sweep.lock() else {
            return false;
        };
        if now < *next_sweep {
            return false;
        }
        *next_sweep = now + self.ttl.max(MIN_SWEEP_INTERVAL);
        true
    }

    fn pick(
        &self,
        instances: &[ServiceInstance],
        ctx: &LeaseContext<'_>,
    ) -> DispatchResult<ServiceHostAndPort> {
        self.round_robin
            .pick(instances)
            .map(|instance| instance.host_and_port.clone())
            .ok_or_else(|| ctx.no_instance())
    }
}

#[async_trait]
impl LoadBalancer for CookieStickySessions {
    async fn lease(
        &self,
        instances: &[ServiceInstance],
        ctx: &LeaseContext<'_>,
    ) -> DispatchResult<Lease> {
        if instances.is_empty() {
            return Err(ctx.no_instance());
        }

        // never while holding a session entry
        if self.sweep_due(Instant::now()) {
            let before = self.sessions.len();
            self.purge_expired().await;
            tracing::trace!(
                removed = before.saturating_sub(self.sessions.len()),
                "Swept expired sticky sessions"
            );
        }

        let Some(session_id) = ctx.cookie(&self.key) else {
            return self.pick(instances, ctx).map(Lease::new);
        };

        let now = Instant::now();
        let expires_at = now + self.ttl;
        let host_and_port = match self.sessions.entry_async(session_id.to_string()).await {
            Entry::Occupied(mut occupied) => {
                let session = occupied.get_mut();
                let still_resolved = instances
                    .iter()
                    .any(|instance| instance.host_and_port == session.host_and_port);
                if session.expires_at <= now || !still_resolved {
                    tracing::debug!(
                        session = %session_id,
                        previous = %session.host_and_port,
                        "Sticky session expired or instance gone, re-balancing"
                    );
                    session.host_and_port = self.pick(instances, ctx)?;
                }
                session.expires_at = expires_at;
                session.host_and_port.clone()
            }
            Entry::Vacant(vacant) => {
                let host_and_port = self.pick(instances, ctx)?;
                vacant.insert_entry(StickySession {
                    host_and_port: host_and_port.clone(),
                    expires_at,
                });
                host_and_port
            }
        };

        Ok(Lease::new(host_and_port))
    }

    fn name(&self) -> &str {
        "cookie_sticky_sessions"
    }
}

#[cfg(test)]
mod tests {
    use hyper::{
        HeaderMap,
        header::{COOKIE, HeaderValue},
    };

    use super::*;
    use crate::core::load_balancer::{COOKIE_STICKY_SESSIONS, test_support::*};

    fn session_headers(value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_static(value));
        headers
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_session_same_instance_until_expiry() {
        let balancer = CookieStickySessions::new("sessionid", Duration::from_secs(10));
        let targets = instances(&["a", "b", "c"]);
        let route = route(COOKIE_STICKY_SESSIONS);
        let headers = session_headers("sessionid=s1");
        let ctx = LeaseContext::new(&route, &headers);

        let first = balancer.lease(&targets, &ctx).await.unwrap();
        let second = balancer.lease(&targets, &ctx).await.unwrap();
        assert_eq!(first.host_and_port(), second.host_and_port());
        assert_eq!(first.host_and_port().host, "a");

        tokio::time::advance(Duration::from_secs(11)).await;

        // expired: re-balanced through round-robin, which moved on to "b"
        let third = balancer.lease(&targets, &ctx).await.unwrap();
        assert_eq!(third.host_and_port().host, "b");
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_refreshes_ttl() {
        let balancer = CookieStickySessions::new("sessionid", Duration::from_secs(10));
        let targets = instances(&["a", "b"]);
        let route = route(COOKIE_STICKY_SESSIONS);
        let headers = session_headers("sessionid=s1");
        let ctx = LeaseContext::new(&route, &headers);

        let first = balancer.lease(&targets, &ctx).await.unwrap();
        for _ in 0..3 {
            tokio::time::advance(Duration::from_secs(6)).await;
            let again = balancer.lease(&targets, &ctx).await.unwrap();
            assert_eq!(again.host_and_port(), first.host_and_port());
        }
    }

    #[tokio::test]
    async fn test_distinct_sessions_are_balanced() {
        let balancer = CookieStickySessions::new("sessionid", Duration::from_secs(60));
        let targets = instances(&["a", "b"]);
        let route = route(COOKIE_STICKY_SESSIONS);

        let s1 = session_headers("sessionid=s1");
        let s2 = session_headers("sessionid=s2");
        let one = balancer
            .lease(&targets, &LeaseContext::new(&route, &s1))
            .await
            .unwrap();
        let two = balancer
            .lease(&targets, &LeaseContext::new(&route, &s2))
            .await
            .unwrap();

        assert_ne!(one.host_and_port(), two.host_and_port());
        assert_eq!(balancer.session_count(), 2);
    }

    #[tokio::test]
    async fn test_missing_cookie_records_nothing() {
        let balancer = CookieStickySessions::new("sessionid", Duration::from_secs(60));
        let targets = instances(&["a", "b"]);
        let route = route(COOKIE_STICKY_SESSIONS);
        let headers = HeaderMap::new();
        let ctx = LeaseContext::new(&route, &headers);

        let first = balancer.lease(&targets, &ctx).await.unwrap();
        let second = balancer.lease(&targets, &ctx).await.unwrap();
        assert_ne!(first.host_and_port(), second.host_and_port());
        assert_eq!(balancer.session_count(), 0);
    }

    #[tokio::test]
    async fn test_vanished_instance_is_replaced() {
        let balancer = CookieStickySessions::new("sessionid", Duration::from_secs(60));
        let route = route(COOKIE_STICKY_SESSIONS);
        let headers = session_headers("sessionid=s1");
        let ctx = LeaseContext::new(&route, &headers);

        let first = balancer
            .lease(&instances(&["a", "b"]), &ctx)
            .await
            .unwrap();
        assert_eq!(first.host_and_port().host, "a");

        let moved = balancer
            .lease(&instances(&["b", "c"]), &ctx)
            .await
            .unwrap();
        assert_ne!(moved.host_and_port().host, "a");
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let balancer = CookieStickySessions::new("sessionid", Duration::from_secs(1));
        let targets = instances(&["a"]);
        let route = route(COOKIE_STICKY_SESSIONS);
        let headers = session_headers("sessionid=s1");

        balancer
            .lease(&targets, &LeaseContext::new(&route, &headers))
            .await
            .unwrap();
        assert_eq!(balancer.session_count(), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        balancer.purge_expired().await;
        assert_eq!(balancer.session_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_sessions_are_swept_by_later_leases() {
        let balancer = CookieStickySessions::new("sessionid", Duration::from_secs(5));
        let targets = instances(&["a", "b"]);
        let route = route(COOKIE_STICKY_SESSIONS);

        for value in ["sessionid=s1", "sessionid=s2", "sessionid=s3"] {
            let headers = session_headers(value);
            balancer
                .lease(&targets, &LeaseContext::new(&route, &headers))
                .await
                .unwrap();
        }
        assert_eq!(balancer.session_count(), 3);

        // s1..s3 never come back; an unrelated request triggers the sweep
        tokio::time::advance(Duration::from_secs(6)).await;
        let headers = session_headers("sessionid=s4");
        balancer
            .lease(&targets, &LeaseContext::new(&route, &headers))
            .await
            .unwrap();
        assert_eq!(balancer.session_count(), 1);

        // cookieless traffic sweeps too
        tokio::time::advance(Duration::from_secs(6)).await;
        let no_cookie = HeaderMap::new();
        balancer
            .lease(&targets, &LeaseContext::new(&route, &no_cookie))
            .await
            .unwrap();
        assert_eq!(balancer.session_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_first_requests_agree() {
        let balancer = std::sync::Arc::new(CookieStickySessions::new(
            "sessionid",
            Duration::from_secs(60),
        ));
        let targets = std::sync::Arc::new(instances(&["a", "b", "c"]));
        let route = std::sync::Arc::new(route(COOKIE_STICKY_SESSIONS));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let balancer = balancer.clone();
            let targets = targets.clone();
            let route = route.clone();
            handles.push(tokio::spawn(async move {
                let headers = session_headers("sessionid=shared");
                let ctx = LeaseContext::new(&route, &headers);
                balancer
                    .lease(&targets, &ctx)
                    .await
                    .unwrap()
                    .host_and_port()
                    .clone()
            }));
        }

        let mut picked = Vec::new();
        for handle in handles {
            picked.push(handle.await.unwrap());
        }
        assert!(picked.windows(2).all(|pair| pair[0] == pair[1]));
    }
}
