//! Axum middleware that records every inbound request before it is handled.

use std::borrow::Cow;
use std::collections::HashMap;

use axum::{
    extract::{Request, State},
    http::{header::HOST, HeaderMap, HeaderValue, Uri},
    middleware::Next,
    response::Response,
};

use crate::audit::entry::{HeaderAllowList, RequestDescriptor};
use crate::audit::recorder::AuditRecorder;

const FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Record the request, then hand it to the next service whatever happened.
pub async fn capture_request(
    State(recorder): State<AuditRecorder>,
    request: Request,
    next: Next,
) -> Response {
    let descriptor = descriptor_from_parts(
        request.method().as_str(),
        request.uri(),
        request.headers(),
        recorder.allow_list(),
    );
    recorder.record(&descriptor).await;

    next.run(request).await
}

/// Build a descriptor from request parts, keeping only allow-listed headers.
///
/// Values are decoded as UTF-8 when valid and byte-for-byte as Latin-1
/// otherwise, so an unusual header never costs the request its entry.
pub fn descriptor_from_parts(
    method: &str,
    uri: &Uri,
    headers: &HeaderMap,
    allow_list: &HeaderAllowList,
) -> RequestDescriptor {
    let mut collected: HashMap<String, String> = HashMap::new();

    for (name, value) in headers {
        if !allow_list.allows(name.as_str()) {
            continue;
        }
        let value = header_text(value);

        collected
            .entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert_with(|| value.into_owned());
    }

    RequestDescriptor {
        method: method.to_string(),
        url: full_url(uri, headers),
        headers: collected,
    }
}

fn header_text(value: &HeaderValue) -> Cow<'_, str> {
    match std::str::from_utf8(value.as_bytes()) {
        Ok(text) => Cow::Borrowed(text),
        Err(_) => Cow::Owned(value.as_bytes().iter().map(|&b| char::from(b)).collect()),
    }
}

/// Absolute URL when the request line or Host header allows one.
///
/// Without an absolute request URI the scheme comes from the first
/// `X-Forwarded-Proto` value set by a fronting proxy, else `http`. The
/// header is taken as given; deployments not behind a trusted proxy should
/// strip it.
fn full_url(uri: &Uri, headers: &HeaderMap) -> String {
    if uri.scheme().is_some() && uri.authority().is_some() {
        return uri.to_string();
    }

    let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    match headers.get(HOST).map(header_text) {
        Some(host) => format!("{}://{}{}", forwarded_scheme(headers), host, path),
        None => path.to_string(),
    }
}

fn forwarded_scheme(headers: &HeaderMap) -> &str {
    headers
        .get(FORWARDED_PROTO)
        .and_then(|h| h.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|scheme| matches!(scheme.to_ascii_lowercase().as_str(), "http" | "https"))
        .unwrap_or("http")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_from_host_header() {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, HeaderValue::from_static("example.org:3000"));
        let uri: Uri = "/api/v1/questions?lang=en".parse().unwrap();

        let descriptor = descriptor_from_parts("POST", &uri, &headers, &HeaderAllowList::default());
        assert_eq!(descriptor.url, "http://example.org:3000/api/v1/questions?lang=en");
        assert_eq!(descriptor.method, "POST");
    }

    #[test]
    fn test_absolute_uri_kept() {
        let uri: Uri = "https://example.org/report".parse().unwrap();
        let descriptor = descriptor_from_parts("GET", &uri, &HeaderMap::new(), &HeaderAllowList::default());
        assert_eq!(descriptor.url, "https://example.org/report");
    }

    #[test]
    fn test_forwarded_proto_sets_scheme() {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, HeaderValue::from_static("audit.example.org"));
        headers.insert(FORWARDED_PROTO, HeaderValue::from_static("https, http"));
        let uri: Uri = "/audit/verify".parse().unwrap();

        let descriptor = descriptor_from_parts("GET", &uri, &headers, &HeaderAllowList::default());
        assert_eq!(descriptor.url, "https://audit.example.org/audit/verify");

        headers.insert(FORWARDED_PROTO, HeaderValue::from_static("gopher"));
        let descriptor = descriptor_from_parts("GET", &uri, &headers, &HeaderAllowList::default());
        assert_eq!(descriptor.url, "http://audit.example.org/audit/verify");
    }

    #[test]
    fn test_repeated_headers_joined() {
        let mut headers = HeaderMap::new();
        headers.append("referer", HeaderValue::from_static("a"));
        headers.append("referer", HeaderValue::from_static("b"));
        let uri: Uri = "/".parse().unwrap();

        let descriptor = descriptor_from_parts("GET", &uri, &headers, &HeaderAllowList::default());
        assert_eq!(descriptor.headers["referer"], "a, b");
    }

    #[test]
    fn test_utf8_header_value_kept() {
        let mut headers = HeaderMap::new();
        headers.insert("user-agent", HeaderValue::from_bytes("Müller-Browser/1.0".as_bytes()).unwrap());
        let uri: Uri = "/".parse().unwrap();

        let descriptor = descriptor_from_parts("GET", &uri, &headers, &HeaderAllowList::default());
        assert_eq!(descriptor.headers["user-agent"], "Müller-Browser/1.0");
    }

    #[test]
    fn test_non_utf8_header_value_decoded_as_latin1() {
        let mut headers = HeaderMap::new();
        headers.insert("user-agent", HeaderValue::from_bytes(b"agent\xff").unwrap());
        let uri: Uri = "/".parse().unwrap();

        let descriptor = descriptor_from_parts("GET", &uri, &headers, &HeaderAllowList::default());
        assert_eq!(descriptor.headers["user-agent"], "agent\u{ff}");
    }

    #[test]
    fn test_other_headers_skipped() {
        let mut headers = HeaderMap::new();
        headers.insert("x-binary", HeaderValue::from_bytes(b"\xfe\xff").unwrap());
        headers.insert("authorization", HeaderValue::from_static("Bearer secret"));
        headers.insert("user-agent", HeaderValue::from_static("ok"));
        let uri: Uri = "/".parse().unwrap();

        let descriptor = descriptor_from_parts("GET", &uri, &headers, &HeaderAllowList::default());
        assert_eq!(descriptor.headers.len(), 1);
        assert_eq!(descriptor.headers["user-agent"], "ok");
    }
}
