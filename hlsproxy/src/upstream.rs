//! Wrapper around the subset of the `reqwest` API used to talk to the origin server.  Each
//! request is tagged with an id for log correlation and request latency is reported to a
//! [`Metric`].  Response bodies are either buffered, up to a size limit, or streamed.

use crate::fetch::FetchError;
use crate::metric::Metric;
use bytes::Bytes;
use encoding_rs::{Encoding, UTF_8};
use futures::prelude::*;
use log::{debug, warn};
use mime::Mime;
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::{Method, StatusCode, Url};
use std::fmt;
use std::sync::Arc;
use std::time;

/// Default limit on the size of a buffered response body
pub const DEFAULT_RESPONSE_LIMIT_BYTES: usize = 20 * 1024 * 1024;

/// Create the `reqwest` client used for all requests to the origin.
pub fn create_client(timeout: time::Duration) -> Result<reqwest::Client, reqwest::Error> {
    let mut headers = HeaderMap::new();
    let agent = format!("hlsproxy {}.{}.{}{}",
                        env!("CARGO_PKG_VERSION_MAJOR"),
                        env!("CARGO_PKG_VERSION_MINOR"),
                        env!("CARGO_PKG_VERSION_PATCH"),
                        option_env!("CARGO_PKG_VERSION_PRE").unwrap_or(""));
    if let Ok(agent) = HeaderValue::from_str(&agent) {
        headers.append(header::USER_AGENT, agent);
    }
    reqwest::ClientBuilder::new()
        .timeout(timeout)
        .gzip(true)
        .default_headers(headers)
        .build()
}

#[derive(Clone)]
pub struct Client {
    client: reqwest::Client,
    response_limit_bytes: usize,
    latency: Arc<dyn Metric>,
}

impl Client {
    pub fn new(client: reqwest::Client, response_limit_bytes: usize, latency: Arc<dyn Metric>) -> Client {
        Client {
            client,
            response_limit_bytes,
            latency,
        }
    }

    pub fn request(&self, method: Method, url: Url) -> RequestBuilder {
        RequestBuilder::new(self.clone(), method, url)
    }

    pub fn get(&self, url: Url) -> RequestBuilder {
        self.request(Method::GET, url)
    }

    /// `GET` the given playlist directly from the origin, bypassing any local caches.
    pub async fn fetch_playlist(&self, url: Url) -> Result<Bytes, FetchError> {
        let mut req = self.get(url);
        req.header(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        let resp = req.send().await?;
        if !resp.status().is_success() {
            return Err(FetchError::Status(resp.status()));
        }
        Ok(resp.into_body())
    }
}

pub struct RequestBuilder {
    id: uuid::Uuid,
    client: Client,
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: Option<Bytes>,
}

impl RequestBuilder {
    fn new(client: Client, method: Method, url: Url) -> RequestBuilder {
        RequestBuilder {
            id: uuid::Uuid::new_v4(),
            client,
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn header(&mut self, key: header::HeaderName, value: HeaderValue) {
        self.headers.insert(key, value);
    }

    pub fn headers(&mut self, headers: HeaderMap) {
        self.headers.extend(headers);
    }

    pub fn body(&mut self, body: Bytes) {
        self.body = Some(body);
    }

    /// Send the request and buffer the whole response body, failing if it exceeds the client's
    /// size limit.  Latency is measured to the end of the body.
    pub async fn send(self) -> Result<Response, UpstreamError> {
        let (started, resp) = self.start().await?;
        let RequestBuilder { id, client, url, .. } = self;
        let status = resp.status();
        let headers = resp.headers().clone();
        let limit = client.response_limit_bytes;
        let mut buffer = match resp.content_length() {
            Some(len) if len as usize <= limit => Vec::with_capacity(len as usize),
            _ => vec![],
        };
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk
                .map_err(|e| UpstreamError::from_reqwest(e, Bytes::from(std::mem::take(&mut buffer))))
                .map_err(|e| log_failure(id, &url, e))?;
            if buffer.len() + chunk.len() > limit {
                let e = UpstreamError::ResponseSizeExceedsLimit(limit, Bytes::from(buffer));
                return Err(log_failure(id, &url, e));
            }
            buffer.extend_from_slice(&chunk);
        }
        log_success(&client, id, status, started, &url);
        Ok(Response {
            status,
            headers,
            body: Bytes::from(buffer),
        })
    }

    /// Send the request, returning as soon as the response headers arrive.  The body is passed
    /// on as it is received, without any size limit.  Latency is measured to the headers.
    pub async fn send_streaming(self) -> Result<StreamingResponse, UpstreamError> {
        let (started, resp) = self.start().await?;
        log_success(&self.client, self.id, resp.status(), started, &self.url);
        Ok(StreamingResponse { resp })
    }

    async fn start(&self) -> Result<(time::Instant, reqwest::Response), UpstreamError> {
        let started = time::Instant::now();
        let mut builder = self.client.client
            .request(self.method.clone(), self.url.clone())
            .headers(self.headers.clone());
        if let Some(body) = &self.body {
            builder = builder.body(body.clone());
        }
        builder = add_request_id(self.id, builder);
        let resp = builder.send()
            .await
            .map_err(|e| UpstreamError::from_reqwest(e, Bytes::new()))
            .map_err(|e| log_failure(self.id, &self.url, e))?;
        Ok((started, resp))
    }
}

/// tag the request being sent with our per-request uuid, for potential log correlation
fn add_request_id(id: uuid::Uuid, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
    builder.header("X-Request-Id", id.simple().to_string())
}

fn log_success(client: &Client, id: uuid::Uuid, status: StatusCode, started: time::Instant, url: &Url) {
    let total_time = started.elapsed();
    client.latency.put(total_time.as_millis() as u64);
    debug!("{} {} {:>8}ms {}", id.simple(), status.as_str(), total_time.as_millis(), url);
}

fn log_failure(id: uuid::Uuid, url: &Url, e: UpstreamError) -> UpstreamError {
    warn!("{} request failed {}: {}", id.simple(), url, e);
    e
}

/// A fully buffered response from the origin.
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}
impl Response {
    pub fn status(&self) -> StatusCode {
        self.status
    }
    pub fn body(&self) -> &Bytes {
        &self.body
    }
    pub fn into_body(self) -> Bytes {
        self.body
    }

    /// The encoding of the body text: from a byte order mark if there is one, otherwise from the
    /// charset in the `Content-Type` header, otherwise UTF-8.
    pub fn encoding(&self) -> &'static Encoding {
        self.encoding_and_bom_len().0
    }

    fn encoding_and_bom_len(&self) -> (&'static Encoding, usize) {
        if let Some(bom) = Encoding::for_bom(&self.body) {
            return bom;
        }
        // mostly copied from reqwest
        let encoding = self.headers
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<Mime>().ok())
            .as_ref()
            .and_then(|mime| mime.get_param("charset").map(|charset| charset.as_str()))
            .and_then(|label| Encoding::for_label(label.as_bytes()))
            .unwrap_or(UTF_8);
        (encoding, 0)
    }

    /// Decode the body as text, in the encoding given by [`encoding()`](Response::encoding).
    /// Returns `None` if the body is not validly encoded.
    pub fn text(&self) -> Option<String> {
        let (encoding, bom_len) = self.encoding_and_bom_len();
        encoding
            .decode_without_bom_handling_and_without_replacement(&self.body[bom_len..])
            .map(|text| text.into_owned())
    }

    /// Split into parts, consuming the response
    pub fn into_parts(self) -> (StatusCode, HeaderMap, Bytes) {
        (self.status, self.headers, self.body)
    }
}

/// A response from the origin whose body has not yet been read.
pub struct StreamingResponse {
    resp: reqwest::Response,
}
impl StreamingResponse {
    /// Split into status, headers and a stream of body chunks, consuming the response
    pub fn into_parts(self) -> (StatusCode, HeaderMap, impl Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static) {
        let status = self.resp.status();
        let headers = self.resp.headers().clone();
        (status, headers, self.resp.bytes_stream())
    }
}

#[derive(Debug)]
pub enum UpstreamError {
    Timeout(reqwest::Error),
    Connect(reqwest::Error),
    Redirect(reqwest::Error),
    /// the response body could not be read to completion; carries whatever had been received
    Body(reqwest::Error, Bytes),
    Decode(reqwest::Error, Bytes),
    /// the reqwests crate reported an error with the request, but we aren't given specific detail
    Request(reqwest::Error),
    ResponseSizeExceedsLimit(usize, Bytes),
}
impl UpstreamError {
    fn from_reqwest(e: reqwest::Error, partial: Bytes) -> Self {
        if e.is_timeout() {
            UpstreamError::Timeout(e)
        } else if e.is_connect() {
            UpstreamError::Connect(e)
        } else if e.is_redirect() {
            UpstreamError::Redirect(e)
        } else if e.is_decode() {
            UpstreamError::Decode(e, partial)
        } else if e.is_body() {
            UpstreamError::Body(e, partial)
        } else {
            UpstreamError::Request(e)
        }
    }

    /// any part of the response body received before the failure
    pub fn partial_data(&self) -> Option<&Bytes> {
        match self {
            UpstreamError::Body(_, data)
            | UpstreamError::Decode(_, data)
            | UpstreamError::ResponseSizeExceedsLimit(_, data) => Some(data).filter(|d| !d.is_empty()),
            _ => None,
        }
    }
}
impl fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamError::Timeout(e) => write!(f, "timeout performing HTTP request: {}", e),
            UpstreamError::Connect(e) => write!(f, "could not connect to origin: {}", e),
            UpstreamError::Redirect(e) => write!(f, "redirect failed: {}", e),
            UpstreamError::Body(e, _) => write!(f, "error reading response body: {}", e),
            UpstreamError::Decode(e, _) => write!(f, "error decoding response body: {}", e),
            UpstreamError::Request(e) => write!(f, "request failed: {}", e),
            UpstreamError::ResponseSizeExceedsLimit(limit, _) => {
                write!(f, "response body exceeds the limit of {} bytes", limit)
            },
        }
    }
}
impl std::error::Error for UpstreamError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            UpstreamError::Timeout(e)
            | UpstreamError::Connect(e)
            | UpstreamError::Redirect(e)
            | UpstreamError::Body(e, _)
            | UpstreamError::Decode(e, _)
            | UpstreamError::Request(e) => Some(e),
            UpstreamError::ResponseSizeExceedsLimit(..) => None,
        }
    }
}
