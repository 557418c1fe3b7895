//! HTTP request conversion for rendering.
//!
//! This module converts inbound axum requests into the
//! [`RequestContext`] handed to the runtime worker.

use axum::http::Request;
use axum::http::header::HOST;
use url::Url;
use uuid::Uuid;

use ssr_bridge_core::{HeaderMultiMap, RequestContext};

/// Header carrying the original scheme behind a proxy.
const FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Header carrying a caller-supplied request id.
pub const REQUEST_ID: &str = "x-request-id";

/// Build a [`RequestContext`] from an axum request.
///
/// The display URL is absolute: the scheme comes from `x-forwarded-proto`
/// (default `http`), the authority from `Host`, then path and query.
/// Header values that are not visible ASCII are skipped. The request body is
/// not forwarded.
pub fn request_context<B>(req: &Request<B>) -> RequestContext {
    let headers: HeaderMultiMap = req
        .headers()
        .iter()
        .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str(), v.to_string())))
        .collect();

    let id = req
        .headers()
        .get(REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map_or_else(|| Uuid::new_v4().to_string(), ToString::to_string);

    RequestContext::new(req.method().as_str(), display_url(req))
        .with_id(id)
        .with_headers(headers)
}

/// Absolute URL of the request as the client saw it.
pub fn display_url<B>(req: &Request<B>) -> String {
    let scheme = req
        .headers()
        .get(FORWARDED_PROTO)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or("http");

    let host = req
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| req.uri().authority().map(|a| a.as_str()))
        .unwrap_or("localhost");

    let path = req
        .uri()
        .path_and_query()
        .map_or("/", |pq| pq.as_str());

    let raw = format!("{scheme}://{host}{path}");
    match Url::parse(&raw) {
        Ok(url) => url.to_string(),
        Err(_) => raw,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{Method, Request as HttpRequest};

    #[test]
    fn test_request_context() {
        let http_req = HttpRequest::builder()
            .method(Method::POST)
            .uri("/products/42?tab=reviews")
            .header("Host", "shop.example")
            .header("Accept", "text/html")
            .header("Cookie", "a=1")
            .header("Cookie", "b=2")
            .body(())
            .unwrap();

        let req = request_context(&http_req);

        assert_eq!(req.method, "POST");
        assert_eq!(req.url, "http://shop.example/products/42?tab=reviews");
        assert_eq!(req.headers.len(), 3);
        assert_eq!(
            req.headers.get_all("cookie"),
            &["a=1".to_string(), "b=2".to_string()]
        );
        assert!(!req.id.is_empty());
        assert!(!req.cancellation.is_cancelled());
    }

    #[test]
    fn test_forwarded_proto() {
        let http_req = HttpRequest::builder()
            .uri("/")
            .header("Host", "example.test:8443")
            .header("X-Forwarded-Proto", "https, http")
            .body(())
            .unwrap();

        assert_eq!(display_url(&http_req), "https://example.test:8443/");
    }

    #[test]
    fn test_missing_host() {
        let http_req = HttpRequest::builder().uri("/about").body(()).unwrap();
        assert_eq!(display_url(&http_req), "http://localhost/about");
    }

    #[test]
    fn test_request_id_header() {
        let http_req = HttpRequest::builder()
            .uri("/")
            .header("X-Request-Id", "abc-123")
            .body(())
            .unwrap();

        assert_eq!(request_context(&http_req).id, "abc-123");
    }
}
