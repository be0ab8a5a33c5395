//! Conversion between origin responses and the responses the proxy gives its own clients.

use crate::upstream::UpstreamError;
use bytes::Bytes;
use encoding_rs::Encoding;
use hyper::header::{self, HeaderMap, HeaderValue};
use hyper::{Body, Response, StatusCode};
use mime::Mime;

/// used when the origin does not say what it is sending
pub const FALLBACK_CONTENT_TYPE: &str = "application/x-unknown";

// connection-specific headers that must not be passed through a proxy
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn remove_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

/// Headers to send to the origin for a request that the client sent to the proxy.
///
/// `Host` is dropped so that the HTTP client derives it from the target URL, including after
/// following a redirect to another host.  `Accept-Encoding` is left for the HTTP client to
/// negotiate, since bodies are always passed on to the client decoded.
pub fn outbound_headers(incoming: &HeaderMap) -> HeaderMap {
    let mut headers = incoming.clone();
    remove_hop_by_hop(&mut headers);
    headers.remove(header::ACCEPT_ENCODING);
    headers.remove(header::HOST);
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers
}

/// Build the response for the client from the origin's status, headers and (possibly modified)
/// body.
pub fn proxied_response(status: StatusCode, mut headers: HeaderMap, body: Body) -> Response<Body> {
    remove_hop_by_hop(&mut headers);
    // the body has already been decoded, and may have been changed in length
    headers.remove(header::CONTENT_ENCODING);
    headers.remove(header::CONTENT_LENGTH);
    if !headers.contains_key(header::CONTENT_TYPE) {
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(FALLBACK_CONTENT_TYPE));
    }
    let mut resp = Response::new(body);
    *resp.status_mut() = status;
    *resp.headers_mut() = headers;
    resp
}

/// Encode rewritten playlist text in the encoding the origin used.
///
/// encoding_rs can't output some encodings, UTF-16 among them, and substitutes UTF-8; in that
/// case the charset of the `Content-Type` header is changed to match.
pub fn encode_text(headers: &mut HeaderMap, encoding: &'static Encoding, text: &str) -> Bytes {
    let (bytes, used, _) = encoding.encode(text);
    if used != encoding {
        set_charset(headers, used);
    }
    Bytes::from(bytes.into_owned())
}

fn set_charset(headers: &mut HeaderMap, encoding: &'static Encoding) {
    let mime = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<Mime>().ok());
    if let Some(mime) = mime {
        let value = format!("{}; charset={}", mime.essence_str(), encoding.name().to_ascii_lowercase());
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(header::CONTENT_TYPE, value);
        }
    }
}

/// A plain-text response generated by the proxy itself
pub fn error_response(status: StatusCode, message: Option<String>) -> Response<Body> {
    let msg = message.unwrap_or_else(|| status.canonical_reason().unwrap_or("Error").to_string());
    let mut resp = Response::new(Body::from(msg));
    *resp.status_mut() = status;
    resp.headers_mut().insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    resp
}

pub fn upstream_error_response(e: &UpstreamError) -> Response<Body> {
    let data = e.partial_data()
        .map(|d| String::from_utf8_lossy(d).into_owned())
        .unwrap_or_else(|| "none".to_string());
    let msg = format!("Error: {}\nData: {}", e, data);
    error_response(StatusCode::INTERNAL_SERVER_ERROR, Some(msg))
}
