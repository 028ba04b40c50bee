//! HTTP/1.1 wire text for requests and responses crossing the tunnel
//!
//! A relayed request or response travels as one complete HTTP/1.1 message:
//! start line, headers, blank line, whole body. Bodies are never chunked;
//! `Content-Length` always states the real body length.

use bytes::{BufMut, Bytes, BytesMut};
use http::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, HOST};
use http::{Method, Request, Response, StatusCode, Uri, Version};
use thiserror::Error;

/// Maximum number of headers to parse
pub const MAX_HEADERS: usize = 100;

/// HTTP wire errors
#[derive(Debug, Error)]
pub enum HttpWireError {
    #[error("Incomplete HTTP message")]
    Incomplete,

    #[error("HTTP parse error: {0}")]
    Parse(#[from] httparse::Error),

    #[error("Invalid HTTP message: {0}")]
    Invalid(String),

    #[error("Body truncated: {expected} bytes declared, {available} available")]
    Truncated { expected: usize, available: usize },
}

/// Reason phrase that differs from the canonical text of its status code.
///
/// Stored in response extensions so a synthesized failure can carry its
/// cause in the status line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusText(pub String);

/// Connection-scoped headers that never cross a proxy hop
pub fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-connection"
            | "transfer-encoding"
            | "upgrade"
            | "te"
            | "trailer"
    )
}

fn put_headers(buf: &mut BytesMut, headers: &HeaderMap) {
    for (name, value) in headers {
        if name == CONTENT_LENGTH || name.as_str() == "transfer-encoding" {
            continue;
        }
        buf.put_slice(name.as_str().as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(value.as_bytes());
        buf.put_slice(b"\r\n");
    }
}

fn put_content_length(buf: &mut BytesMut, len: usize) {
    buf.put_slice(b"content-length: ");
    buf.put_slice(len.to_string().as_bytes());
    buf.put_slice(b"\r\n");
}

/// Serialize a request, headers and body included
pub fn encode_request(request: &Request<Bytes>) -> Bytes {
    let body = request.body();
    let target = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let mut buf = BytesMut::with_capacity(256 + body.len());
    buf.put_slice(request.method().as_str().as_bytes());
    buf.put_u8(b' ');
    buf.put_slice(target.as_bytes());
    buf.put_slice(b" HTTP/1.1\r\n");

    if !request.headers().contains_key(HOST) {
        if let Some(authority) = request.uri().authority() {
            buf.put_slice(b"host: ");
            buf.put_slice(authority.as_str().as_bytes());
            buf.put_slice(b"\r\n");
        }
    }

    put_headers(&mut buf, request.headers());
    if !body.is_empty() || request.headers().contains_key(CONTENT_LENGTH) {
        put_content_length(&mut buf, body.len());
    }
    buf.put_slice(b"\r\n");
    buf.put_slice(body);

    buf.freeze()
}

/// Serialize a response. A [`StatusText`] extension overrides the reason phrase.
pub fn encode_response(response: &Response<Bytes>) -> Bytes {
    let body = response.body();
    let status = response.status();
    let reason = response
        .extensions()
        .get::<StatusText>()
        .map(|text| text.0.as_str())
        .or_else(|| status.canonical_reason())
        .unwrap_or("");

    let mut buf = BytesMut::with_capacity(256 + body.len());
    buf.put_slice(b"HTTP/1.1 ");
    buf.put_slice(status.as_str().as_bytes());
    buf.put_u8(b' ');
    buf.put_slice(reason.as_bytes());
    buf.put_slice(b"\r\n");

    put_headers(&mut buf, response.headers());
    // A bodiless reply (HEAD, 304) keeps the length the upstream declared
    match response.headers().get(CONTENT_LENGTH) {
        Some(declared) if body.is_empty() => {
            buf.put_slice(b"content-length: ");
            buf.put_slice(declared.as_bytes());
            buf.put_slice(b"\r\n");
        }
        _ => put_content_length(&mut buf, body.len()),
    }
    buf.put_slice(b"\r\n");
    buf.put_slice(body);

    buf.freeze()
}

fn collect_headers(parsed: &[httparse::Header<'_>]) -> Result<HeaderMap, HttpWireError> {
    let mut headers = HeaderMap::with_capacity(parsed.len());
    for header in parsed {
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|e| HttpWireError::Invalid(format!("header name {:?}: {}", header.name, e)))?;
        let value = HeaderValue::from_bytes(header.value)
            .map_err(|e| HttpWireError::Invalid(format!("header {}: {}", name, e)))?;
        headers.append(name, value);
    }
    Ok(headers)
}

fn content_length(headers: &HeaderMap) -> Result<Option<usize>, HttpWireError> {
    headers
        .get(CONTENT_LENGTH)
        .map(|value| {
            value
                .to_str()
                .ok()
                .and_then(|v| v.trim().parse::<usize>().ok())
                .ok_or_else(|| HttpWireError::Invalid("bad content-length".to_string()))
        })
        .transpose()
}

/// Body following the header block. Without `Content-Length` the body is
/// everything that remains, since one message fills one payload.
fn take_body(rest: &[u8], headers: &HeaderMap) -> Result<Bytes, HttpWireError> {
    match content_length(headers)? {
        Some(len) if len > rest.len() => Err(HttpWireError::Truncated {
            expected: len,
            available: rest.len(),
        }),
        Some(len) => Ok(Bytes::copy_from_slice(&rest[..len])),
        None => Ok(Bytes::copy_from_slice(rest)),
    }
}

/// Parse a request produced by [`encode_request`]
pub fn decode_request(raw: &[u8]) -> Result<Request<Bytes>, HttpWireError> {
    let mut header_buf = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut header_buf);

    let header_len = match parsed.parse(raw)? {
        httparse::Status::Complete(len) => len,
        httparse::Status::Partial => return Err(HttpWireError::Incomplete),
    };

    let method = parsed.method.ok_or(HttpWireError::Incomplete)?;
    let method = Method::from_bytes(method.as_bytes())
        .map_err(|e| HttpWireError::Invalid(format!("method {:?}: {}", method, e)))?;
    let path = parsed.path.ok_or(HttpWireError::Incomplete)?;
    let uri: Uri = path
        .parse()
        .map_err(|e| HttpWireError::Invalid(format!("request target {:?}: {}", path, e)))?;

    let mut headers = collect_headers(parsed.headers)?;
    let body = take_body(&raw[header_len..], &headers)?;
    headers.remove(CONTENT_LENGTH);
    headers.remove("transfer-encoding");

    let mut request = Request::new(body);
    *request.method_mut() = method;
    *request.uri_mut() = uri;
    *request.version_mut() = Version::HTTP_11;
    *request.headers_mut() = headers;
    Ok(request)
}

/// Statuses whose responses never carry a body
pub fn forbids_body(status: StatusCode) -> bool {
    status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
}

/// Parse a response produced by [`encode_response`].
///
/// `method` is that of the request being answered: a reply to `HEAD`
/// never carries a body.
pub fn decode_response(raw: &[u8], method: &Method) -> Result<Response<Bytes>, HttpWireError> {
    let mut header_buf = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Response::new(&mut header_buf);

    let header_len = match parsed.parse(raw)? {
        httparse::Status::Complete(len) => len,
        httparse::Status::Partial => return Err(HttpWireError::Incomplete),
    };

    let code = parsed.code.ok_or(HttpWireError::Incomplete)?;
    let status = StatusCode::from_u16(code)
        .map_err(|e| HttpWireError::Invalid(format!("status {}: {}", code, e)))?;
    let reason = parsed.reason.unwrap_or("");

    let mut headers = collect_headers(parsed.headers)?;
    let body = if method == Method::HEAD || forbids_body(status) {
        // Content-Length describes the entity the caller did not ask for
        Bytes::new()
    } else {
        let body = take_body(&raw[header_len..], &headers)?;
        headers.remove(CONTENT_LENGTH);
        body
    };
    headers.remove("transfer-encoding");

    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    if !reason.is_empty() && Some(reason) != status.canonical_reason() {
        response
            .extensions_mut()
            .insert(StatusText(reason.to_string()));
    }
    Ok(response)
}

/// Plain-text response used when a real one cannot be obtained.
/// `reason` becomes both the reason phrase and the body.
pub fn error_response(status: StatusCode, reason: &str) -> Response<Bytes> {
    let reason: String = reason
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect();

    let mut response = Response::new(Bytes::from(reason.clone()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response.extensions_mut().insert(StatusText(reason));
    response
}
