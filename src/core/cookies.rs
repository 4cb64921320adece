//! Per-client cookie session state.
//!
//! Cookies set by a downstream are remembered on the cached client that
//! received them and replayed on later requests through that same client.
//! Only `name=value` pairs are kept; domain and path attributes are ignored
//! since a cached client only ever talks to one host.
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use hyper::{
    HeaderMap, Request, Response,
    header::{COOKIE, HeaderValue, SET_COOKIE},
};

use crate::ports::http_client::{Body, HttpClient, HttpClientResult};

#[derive(Debug, Default)]
pub struct CookieJar {
    cookies: Mutex<BTreeMap<String, String>>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember every `Set-Cookie` of a response. A cookie with `Max-Age=0`
    /// or an empty value is removed.
    pub fn store_from(&self, headers: &HeaderMap) {
        let mut cookies = self.lock();
        for value in headers.get_all(SET_COOKIE) {
            let Ok(value) = value.to_str() else {
                continue;
            };
            let mut parts = value.split(';');
            let Some((name, cookie_value)) = parts.next().and_then(|pair| pair.split_once('='))
            else {
                continue;
            };
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            let cookie_value = cookie_value.trim();
            let expired = parts.any(|attr| {
                attr.trim()
                    .split_once('=')
                    .is_some_and(|(key, val)| {
                        key.eq_ignore_ascii_case("max-age") && val.trim() == "0"
                    })
            });
            if expired || cookie_value.is_empty() {
                cookies.remove(name);
            } else {
                cookies.insert(name.to_string(), cookie_value.to_string());
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<String> {
        self.lock().get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// `Cookie` header value carrying every stored cookie.
    pub fn header_value(&self) -> Option<HeaderValue> {
        let cookies = self.lock();
        if cookies.is_empty() {
            return None;
        }
        let joined = cookies
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("; ");
        HeaderValue::from_str(&joined).ok()
    }

    /// Add the stored cookies to a request, after any it already carries.
    pub fn apply(&self, headers: &mut HeaderMap) {
        let Some(stored) = self.header_value() else {
            return;
        };
        let merged = match headers.get(COOKIE).and_then(|v| v.to_str().ok()) {
            Some(existing) if !existing.is_empty() => {
                let stored_text = stored.to_str().unwrap_or_default();
                HeaderValue::from_str(&format!("{existing}; {stored_text}")).unwrap_or(stored)
            }
            _ => stored,
        };
        headers.insert(COOKIE, merged);
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, String>> {
        self.cookies.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Transport wrapper replaying and recording cookies.
pub struct CookieTransport {
    inner: Arc<dyn HttpClient>,
    jar: Arc<CookieJar>,
}

impl CookieTransport {
    pub fn new(inner: Arc<dyn HttpClient>, jar: Arc<CookieJar>) -> Self {
        Self { inner, jar }
    }
}

#[async_trait]
impl HttpClient for CookieTransport {
    async fn send_request(&self, mut req: Request<Body>) -> HttpClientResult<Response<Body>> {
        self.jar.apply(req.headers_mut());
        let response = self.inner.send_request(req).await?;
        self.jar.store_from(response.headers());
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set_cookies(values: &[&'static str]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for value in values {
            headers.append(SET_COOKIE, HeaderValue::from_static(value));
        }
        headers
    }

    #[test]
    fn test_store_and_replay() {
        let jar = CookieJar::new();
        jar.store_from(&set_cookies(&[
            "session=abc; Path=/; HttpOnly",
            "theme=dark",
        ]));

        assert_eq!(jar.get("session").as_deref(), Some("abc"));
        assert_eq!(
            jar.header_value().unwrap(),
            HeaderValue::from_static("session=abc; theme=dark")
        );
    }

    #[test]
    fn test_overwrite_and_expire() {
        let jar = CookieJar::new();
        jar.store_from(&set_cookies(&["session=abc", "theme=dark"]));
        jar.store_from(&set_cookies(&["session=def", "theme=; Max-Age=0"]));

        assert_eq!(jar.get("session").as_deref(), Some("def"));
        assert_eq!(jar.get("theme"), None);
        assert_eq!(jar.len(), 1);
    }

    #[test]
    fn test_apply_merges_with_request_cookies() {
        let jar = CookieJar::new();
        jar.store_from(&set_cookies(&["session=abc"]));

        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_static("client=1"));
        jar.apply(&mut headers);
        assert_eq!(headers.get(COOKIE).unwrap(), "client=1; session=abc");

        let mut empty = HeaderMap::new();
        CookieJar::new().apply(&mut empty);
        assert!(empty.get(COOKIE).is_none());
    }

    #[test]
    fn test_malformed_set_cookie_is_ignored() {
        let jar = CookieJar::new();
        jar.store_from(&set_cookies(&["no-equals-sign", "=orphan"]));
        assert!(jar.is_empty());
    }
}
