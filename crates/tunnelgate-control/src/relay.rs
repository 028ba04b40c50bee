//! Peer-side execution of tunneled requests
//!
//! The peer rebuilds the caller's request, points it at the target named by
//! the `X-Tunnelgate-Target` marker and performs it with its own HTTP client.
//! Every outcome becomes a response: failures are synthesized into 5xx
//! replies so the caller is never left waiting.

use std::time::Duration;

use bytes::Bytes;
use http::header::{HeaderMap, CONTENT_LENGTH, HOST};
use http::{Method, Request, Response, StatusCode, Uri};
use tracing::{debug, error, warn};
use tunnelgate_proto::TARGET_HEADER;
use url::Url;

use crate::http_wire::{decode_request, error_response, forbids_body, is_hop_by_hop};

/// Join two URL paths with exactly one slash between them
pub fn join_path(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", base, &path[1..]),
        (false, false) => format!("{}/{}", base, path),
        _ => format!("{}{}", base, path),
    }
}

/// Target query first, then the request's, `&`-joined when both are present
pub fn merge_query(target: &str, request: &str) -> String {
    if target.is_empty() || request.is_empty() {
        format!("{}{}", target, request)
    } else {
        format!("{}&{}", target, request)
    }
}

/// Point `uri` at `target`: scheme and authority from the target, base path
/// prefixed, queries merged
pub fn rewrite(target: &Url, uri: &Uri) -> Url {
    let mut url = target.clone();
    url.set_path(&join_path(target.path(), uri.path()));

    let query = merge_query(target.query().unwrap_or(""), uri.query().unwrap_or(""));
    url.set_query(if query.is_empty() { None } else { Some(&query) });
    url.set_fragment(None);
    url
}

fn error_chain(err: &dyn std::error::Error) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let cause_text = cause.to_string();
        if !text.contains(&cause_text) {
            text.push_str(": ");
            text.push_str(&cause_text);
        }
        source = cause.source();
    }
    text
}

fn target_of(request: &Request<Bytes>) -> Result<Url, String> {
    let marker = request
        .headers()
        .get(TARGET_HEADER)
        .ok_or_else(|| "tunneled request carries no target".to_string())?;
    let marker = marker
        .to_str()
        .map_err(|_| "tunnel target is not valid text".to_string())?;

    let url = Url::parse(marker).map_err(|e| format!("invalid tunnel target {:?}: {}", marker, e))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(format!("unsupported tunnel target scheme '{}'", other)),
    }
}

/// Executes decoded requests against their upstream targets
#[derive(Debug, Clone)]
pub struct RelayExecutor {
    client: reqwest::Client,
}

impl RelayExecutor {
    /// Client that gives up after `timeout`, never follows redirects and
    /// connects to targets directly
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()?;
        Ok(Self { client })
    }

    /// Run one tunneled request given as HTTP/1.1 wire text.
    ///
    /// Always yields a response: 502 when the request itself is unusable,
    /// 500 with the failure text when the upstream cannot be reached.
    pub async fn execute(&self, raw_request: &[u8]) -> Response<Bytes> {
        let request = match decode_request(raw_request) {
            Ok(request) => request,
            Err(e) => {
                warn!("Malformed tunneled request: {}", e);
                return error_response(
                    StatusCode::BAD_GATEWAY,
                    &format!("malformed tunneled request: {}", e),
                );
            }
        };

        let target = match target_of(&request) {
            Ok(target) => target,
            Err(reason) => {
                warn!(uri = %request.uri(), "{}", reason);
                return error_response(StatusCode::BAD_GATEWAY, &reason);
            }
        };

        let url = rewrite(&target, request.uri());
        let method = request.method().clone();
        debug!(method = %method, target = %url, "Executing tunneled request");

        match self.send(request, url.clone()).await {
            Ok(response) => {
                debug!(
                    method = %method,
                    target = %url,
                    status = response.status().as_u16(),
                    "Upstream responded"
                );
                response
            }
            Err(e) => {
                let reason = error_chain(&e);
                error!(method = %method, target = %url, "Upstream request failed: {}", reason);
                error_response(StatusCode::INTERNAL_SERVER_ERROR, &reason)
            }
        }
    }

    async fn send(&self, request: Request<Bytes>, url: Url) -> Result<Response<Bytes>, reqwest::Error> {
        let (parts, body) = request.into_parts();

        let mut headers = HeaderMap::with_capacity(parts.headers.len());
        for (name, value) in &parts.headers {
            if is_hop_by_hop(name) || name == HOST || name == CONTENT_LENGTH || name == TARGET_HEADER {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }

        let upstream = self
            .client
            .request(parts.method.clone(), url)
            .headers(headers)
            .body(body)
            .send()
            .await?;

        let status = upstream.status();
        // Without a body the declared length is the only size information
        let bodiless = parts.method == Method::HEAD || forbids_body(status);
        let mut response_headers = HeaderMap::with_capacity(upstream.headers().len());
        for (name, value) in upstream.headers() {
            if is_hop_by_hop(name) || (name == CONTENT_LENGTH && !bodiless) {
                continue;
            }
            response_headers.append(name.clone(), value.clone());
        }
        let body = upstream.bytes().await?;

        let mut response = Response::new(body);
        *response.status_mut() = status;
        *response.headers_mut() = response_headers;
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_wire::{encode_request, StatusText};
    use http::Method;

    #[test]
    fn test_join_path() {
        assert_eq!(join_path("/base", "/foo"), "/base/foo");
        assert_eq!(join_path("/base/", "/foo"), "/base/foo");
        assert_eq!(join_path("/base", "foo"), "/base/foo");
        assert_eq!(join_path("/base/", "foo"), "/base/foo");
        assert_eq!(join_path("", "/foo"), "/foo");
        assert_eq!(join_path("/", "/"), "/");
    }

    #[test]
    fn test_merge_query() {
        assert_eq!(merge_query("a=1", "b=2"), "a=1&b=2");
        assert_eq!(merge_query("", "b=2"), "b=2");
        assert_eq!(merge_query("a=1", ""), "a=1");
        assert_eq!(merge_query("", ""), "");
    }

    #[test]
    fn test_rewrite() {
        let target = Url::parse("http://upstream:9000/base?k=v").unwrap();
        let uri: Uri = "/foo/bar?x=1".parse().unwrap();
        assert_eq!(
            rewrite(&target, &uri).as_str(),
            "http://upstream:9000/base/foo/bar?k=v&x=1"
        );

        let target = Url::parse("https://upstream").unwrap();
        let uri: Uri = "/foo".parse().unwrap();
        assert_eq!(rewrite(&target, &uri).as_str(), "https://upstream/foo");
    }

    #[test]
    fn test_target_of() {
        let request = Request::builder()
            .uri("/x")
            .header(TARGET_HEADER, "http://upstream/base")
            .body(Bytes::new())
            .unwrap();
        assert_eq!(target_of(&request).unwrap().as_str(), "http://upstream/base");

        let missing = Request::builder().uri("/x").body(Bytes::new()).unwrap();
        assert!(target_of(&missing).is_err());

        let bad_scheme = Request::builder()
            .uri("/x")
            .header(TARGET_HEADER, "ftp://upstream")
            .body(Bytes::new())
            .unwrap();
        assert!(target_of(&bad_scheme).is_err());
    }

    #[tokio::test]
    async fn test_missing_marker_synthesizes_bad_gateway() {
        let executor = RelayExecutor::new(Duration::from_secs(1)).unwrap();
        let request = Request::builder()
            .method(Method::GET)
            .uri("/foo")
            .body(Bytes::new())
            .unwrap();

        let response = executor.execute(&encode_request(&request)).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_malformed_request_synthesizes_bad_gateway() {
        let executor = RelayExecutor::new(Duration::from_secs(1)).unwrap();
        let response = executor.execute(b"\x00garbage").await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_unreachable_upstream_synthesizes_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let executor = RelayExecutor::new(Duration::from_secs(2)).unwrap();
        let request = Request::builder()
            .uri("/foo")
            .header(TARGET_HEADER, format!("http://{}", addr))
            .body(Bytes::new())
            .unwrap();

        let response = executor.execute(&encode_request(&request)).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!response.body().is_empty());
        assert!(response.extensions().get::<StatusText>().is_some());
    }
}
