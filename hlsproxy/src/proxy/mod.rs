//! The local HTTP server that sits between a player and the origin.
//!
//! Requests are forwarded to the origin with their scheme, host and port swapped for the
//! origin's.  The first playlist to come back is parsed and kept as the _canonical_ playlist,
//! after which segment requests may be redirected to another rendition by the active
//! [`SegmentPolicy`].

use crate::fetch::{FetchError, PlaylistFetcher};
use crate::hls::{Playlist, PlaylistParser};
use crate::metric::{Metric, NullMetric};
use crate::policy::{FixedQualityPolicy, Quality, SegmentPolicy};
use crate::upstream;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::prelude::*;
use hyper::http::request::Parts;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use log::{debug, info};
use std::convert::Infallible;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::{fmt, io, time};
use tokio::sync::watch;
use url::Url;

mod response;
mod rewrite;
mod route;

pub use response::FALLBACK_CONTENT_TYPE;
pub use rewrite::UrlRewriter;
pub use route::Route;

/// Settings supplied by whoever starts the proxy.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// address for the proxy to listen on; port `0` picks a free port
    pub listen: SocketAddr,
    /// the playlist the player would otherwise have loaded directly
    pub remote_playlist_url: Url,
    /// base URL by which players reach the proxy, if not the listen address.  Only the scheme,
    /// host and port are used, since the proxy serves origin paths unchanged; a URL with any
    /// other path than `/` is rejected.
    pub public_url: Option<Url>,
    pub initial_quality: Option<Quality>,
    pub upstream_timeout: time::Duration,
    pub response_limit_bytes: usize,
}
impl ProxyConfig {
    pub fn new(listen: SocketAddr, remote_playlist_url: Url) -> ProxyConfig {
        ProxyConfig {
            listen,
            remote_playlist_url,
            public_url: None,
            initial_quality: None,
            upstream_timeout: time::Duration::from_secs(30),
            response_limit_bytes: upstream::DEFAULT_RESPONSE_LIMIT_BYTES,
        }
    }
}

#[derive(Debug)]
pub enum ProxyError {
    Bind(io::Error),
    Serve(hyper::Error),
    Client(reqwest::Error),
    /// the URL given does not have a host we can forward to
    InvalidUrl(Url),
    /// the public URL has a path, which the proxy can't serve under
    PublicUrlPath(Url),
}
impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::Bind(e) => write!(f, "could not listen: {}", e),
            ProxyError::Serve(e) => write!(f, "server failed: {}", e),
            ProxyError::Client(e) => write!(f, "could not create HTTP client: {}", e),
            ProxyError::InvalidUrl(url) => write!(f, "can't proxy to {}: URL has no host", url),
            ProxyError::PublicUrlPath(url) => {
                write!(f, "public URL {} must not have a path, origin paths are served from the root", url)
            },
        }
    }
}
impl std::error::Error for ProxyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProxyError::Bind(e) => Some(e),
            ProxyError::Serve(e) => Some(e),
            ProxyError::Client(e) => Some(e),
            ProxyError::InvalidUrl(_) | ProxyError::PublicUrlPath(_) => None,
        }
    }
}
impl From<io::Error> for ProxyError {
    fn from(e: io::Error) -> Self {
        ProxyError::Bind(e)
    }
}

/// Told when the canonical playlist becomes available.
///
/// Called once per proxy, from a task of its own rather than from the request that loaded the
/// playlist.  A typical observer installs a policy with [`StreamProxy::set_policy()`].
pub trait ManifestObserver: Send + Sync {
    fn manifest_available(&self, proxy: &StreamProxy, playlist: Arc<Playlist>);
}

struct Canonical {
    playlist: Arc<Playlist>,
    latched: bool,
}

pub struct StreamProxy {
    remote_playlist_url: Url,
    rewriter: UrlRewriter,
    client: upstream::Client,
    canonical: RwLock<Canonical>,
    policy: Mutex<Option<Arc<dyn SegmentPolicy>>>,
    manifest_tx: watch::Sender<Option<Arc<Playlist>>>,
}

impl StreamProxy {
    /// `local_url` is the base URL by which clients reach this proxy.
    pub fn new(config: &ProxyConfig, local_url: &Url, latency: Arc<dyn Metric>) -> Result<StreamProxy, ProxyError> {
        if local_url.path() != "/" {
            return Err(ProxyError::PublicUrlPath(local_url.clone()));
        }
        let rewriter = UrlRewriter::new(local_url, &config.remote_playlist_url)
            .ok_or_else(|| ProxyError::InvalidUrl(config.remote_playlist_url.clone()))?;
        let client = upstream::create_client(config.upstream_timeout).map_err(ProxyError::Client)?;
        let client = upstream::Client::new(client, config.response_limit_bytes, latency);
        // placeholder, until the real playlist has been loaded
        let placeholder = Playlist::Media(crate::hls::MediaPlaylist::new(config.remote_playlist_url.clone()));
        let policy = config.initial_quality
            .map(|q| Arc::new(FixedQualityPolicy::new(q)) as Arc<dyn SegmentPolicy>);
        let (manifest_tx, _) = watch::channel(None);
        Ok(StreamProxy {
            remote_playlist_url: config.remote_playlist_url.clone(),
            rewriter,
            client,
            canonical: RwLock::new(Canonical {
                playlist: Arc::new(placeholder),
                latched: false,
            }),
            policy: Mutex::new(policy),
            manifest_tx,
        })
    }

    pub fn remote_playlist_url(&self) -> &Url {
        &self.remote_playlist_url
    }

    pub fn local_server_url(&self) -> &Url {
        self.rewriter.local_base()
    }

    /// The URL a player should load in order to play the remote playlist through this proxy.
    pub fn local_playlist_url(&self) -> Option<Url> {
        self.rewriter.to_local(&self.remote_playlist_url)
    }

    /// The canonical playlist, or a segment-less placeholder if none has been loaded yet.
    pub fn playlist(&self) -> Arc<Playlist> {
        self.canonical.read().unwrap_or_else(PoisonError::into_inner).playlist.clone()
    }

    pub fn has_playlist(&self) -> bool {
        self.canonical.read().unwrap_or_else(PoisonError::into_inner).latched
    }

    pub fn policy(&self) -> Option<Arc<dyn SegmentPolicy>> {
        self.policy.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Replace the active policy.  Takes effect from the next segment request.
    pub fn set_policy(&self, policy: Option<Arc<dyn SegmentPolicy>>) {
        let action = if policy.is_some() { "replaced" } else { "cleared" };
        *self.policy.lock().unwrap_or_else(PoisonError::into_inner) = policy;
        info!("segment policy {}", action);
    }

    /// A receiver that sees the canonical playlist once it has been loaded.
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<Playlist>>> {
        self.manifest_tx.subscribe()
    }

    /// Store the playlist as canonical, unless another has been stored already.  Returns `true`
    /// if this call stored it.
    fn latch(&self, playlist: Playlist) -> bool {
        let playlist = Arc::new(playlist);
        {
            let mut canonical = self.canonical.write().unwrap_or_else(PoisonError::into_inner);
            if canonical.latched {
                return false;
            }
            canonical.playlist = playlist.clone();
            canonical.latched = true;
        }
        info!("loaded {:?} playlist {}", playlist.kind(), playlist.url());
        self.manifest_tx.send_replace(Some(playlist));
        true
    }

    async fn handle(self: Arc<Self>, req: Request<Body>) -> Result<Response<Body>, Infallible> {
        let route = Route::classify(req.method(), req.uri().path());
        let (parts, body) = req.into_parts();
        let path_and_query = parts.uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        let target = match self.rewriter.remote_for_request(path_and_query) {
            Some(url) => url,
            // only when the path can't be joined onto a URL at all, e.g. `//[x/` is taken as a
            // malformed IPv6 host
            None => {
                let msg = format!("can't forward {} to {}", parts.uri, self.rewriter.remote_base());
                return Ok(response::error_response(StatusCode::BAD_REQUEST, Some(msg)));
            },
        };
        let body = match hyper::body::to_bytes(body).await {
            Ok(body) => body,
            Err(e) => {
                let msg = format!("error reading request body: {}", e);
                return Ok(response::error_response(StatusCode::BAD_REQUEST, Some(msg)));
            },
        };
        debug!("{} {} -> {:?} {}", parts.method, parts.uri, route, target);
        let resp = match route {
            Route::Manifest => self.manifest_response(&parts, target, body).await,
            Route::Segment => self.segment_response(&parts, target, body).await,
            Route::Default => self.default_response(&parts, target, body).await,
        };
        Ok(resp)
    }

    fn outbound(&self, parts: &Parts, target: Url, body: Bytes) -> upstream::RequestBuilder {
        let mut req = self.client.request(parts.method.clone(), target);
        req.headers(response::outbound_headers(&parts.headers));
        if !body.is_empty() {
            req.body(body);
        }
        req
    }

    /// forward without buffering, so the body reaches the client unchanged whatever its size
    async fn default_response(&self, parts: &Parts, target: Url, body: Bytes) -> Response<Body> {
        match self.outbound(parts, target, body).send_streaming().await {
            Ok(resp) => {
                let (status, headers, body) = resp.into_parts();
                response::proxied_response(status, headers, Body::wrap_stream(body))
            },
            Err(e) => response::upstream_error_response(&e),
        }
    }

    async fn manifest_response(&self, parts: &Parts, target: Url, body: Bytes) -> Response<Body> {
        let resp = match self.outbound(parts, target.clone(), body).send().await {
            Ok(resp) => resp,
            Err(e) => return response::upstream_error_response(&e),
        };
        if !self.has_playlist() && resp.status().is_success() {
            let mut parser = PlaylistParser::new(self);
            match parser.parse(&target, resp.body()).await {
                Ok(playlist) => {
                    self.latch(playlist);
                },
                Err(e) => debug!("{} not cached: {}", target, e),
            }
        }
        let encoding = resp.encoding();
        let text = resp.text();
        let (status, mut headers, body) = resp.into_parts();
        let body = match text {
            Some(text) => response::encode_text(&mut headers, encoding, &self.rewriter.rewrite_body(&text)),
            None => body,
        };
        response::proxied_response(status, headers, Body::from(body))
    }

    async fn segment_response(&self, parts: &Parts, target: Url, body: Bytes) -> Response<Body> {
        let playlist = self.playlist();
        let target = match (playlist.segment_by_url(&target), self.policy()) {
            (Some(segment), Some(policy)) => {
                let replacement = policy.replacement(&playlist, segment);
                if replacement.url() != segment.url() {
                    debug!("segment {} replaced by {}", segment.url(), replacement.url());
                }
                replacement.url().clone()
            },
            _ => target,
        };
        self.default_response(parts, target, body).await
    }
}

impl PlaylistFetcher for StreamProxy {
    fn fetch_playlist<'a>(&'a self, url: &'a Url) -> BoxFuture<'a, Result<Bytes, FetchError>> {
        self.client.fetch_playlist(url.clone()).boxed()
    }
}

/// A bound, not yet running, proxy server.
pub struct ProxyServer {
    proxy: Arc<StreamProxy>,
    listener: std::net::TcpListener,
    observer: Option<Arc<dyn ManifestObserver>>,
}

impl ProxyServer {
    pub fn bind(config: ProxyConfig) -> Result<ProxyServer, ProxyError> {
        ProxyServer::bind_with_metric(config, Arc::new(NullMetric))
    }

    /// As [`bind()`](ProxyServer::bind), reporting the latency of each origin request, in
    /// milliseconds, to the given metric.
    pub fn bind_with_metric(config: ProxyConfig, latency: Arc<dyn Metric>) -> Result<ProxyServer, ProxyError> {
        let listener = std::net::TcpListener::bind(config.listen)?;
        listener.set_nonblocking(true)?;
        let local_url = match &config.public_url {
            Some(url) => url.clone(),
            None => listen_url(listener.local_addr()?),
        };
        let proxy = StreamProxy::new(&config, &local_url, latency)?;
        info!("proxying {} at {}", proxy.remote_playlist_url(), proxy.local_server_url());
        Ok(ProxyServer {
            proxy: Arc::new(proxy),
            listener,
            observer: None,
        })
    }

    pub fn with_observer(mut self, observer: Arc<dyn ManifestObserver>) -> ProxyServer {
        self.observer = Some(observer);
        self
    }

    pub fn proxy(&self) -> Arc<StreamProxy> {
        self.proxy.clone()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve requests until `shutdown` completes.
    pub async fn run<S>(self, shutdown: S) -> Result<(), ProxyError>
        where
            S: Future<Output = ()>
    {
        let ProxyServer { proxy, listener, observer } = self;
        if let Some(observer) = observer {
            spawn_notifier(&proxy, observer);
        }
        let make_svc = make_service_fn(move |_conn| {
            let proxy = proxy.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| proxy.clone().handle(req)))
            }
        });
        Server::from_tcp(listener)
            .map_err(ProxyError::Serve)?
            .serve(make_svc)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(ProxyError::Serve)
    }
}

fn listen_url(addr: SocketAddr) -> Url {
    let ip = if addr.ip().is_unspecified() {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    } else {
        addr.ip()
    };
    let addr = SocketAddr::new(ip, addr.port());
    // SocketAddr's Display brackets IPv6 addresses, so this always parses
    Url::parse(&format!("http://{}/", addr)).unwrap_or_else(|_| unreachable!())
}

/// deliver canonical-playlist notifications to the observer from a task of its own
fn spawn_notifier(proxy: &Arc<StreamProxy>, observer: Arc<dyn ManifestObserver>) {
    let mut rx = proxy.subscribe();
    // weak, so that this task doesn't keep the proxy (and so the channel) alive
    let proxy: Weak<StreamProxy> = Arc::downgrade(proxy);
    tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let playlist = rx.borrow().clone();
            match (playlist, proxy.upgrade()) {
                (Some(playlist), Some(proxy)) => observer.manifest_available(&proxy, playlist),
                (_, None) => break,
                _ => (),
            }
        }
    });
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn listen_url_for_unspecified() {
        let url = listen_url("0.0.0.0:8080".parse().unwrap());
        assert_eq!(url.as_str(), "http://127.0.0.1:8080/");
        let url = listen_url("[::1]:9000".parse().unwrap());
        assert_eq!(url.as_str(), "http://[::1]:9000/");
    }

    #[test]
    fn invalid_remote() {
        let config = ProxyConfig::new(
            "127.0.0.1:0".parse().unwrap(),
            Url::parse("file:///tmp/main.m3u8").unwrap(),
        );
        let local = Url::parse("http://127.0.0.1:8080/").unwrap();
        assert!(matches!(StreamProxy::new(&config, &local, Arc::new(NullMetric)), Err(ProxyError::InvalidUrl(_))));
    }

    #[test]
    fn public_url_with_path() {
        let mut config = ProxyConfig::new(
            "127.0.0.1:0".parse().unwrap(),
            Url::parse("https://cdn.example.com/content/main.m3u8").unwrap(),
        );
        config.public_url = Some(Url::parse("http://tv.local:8080/proxy/").unwrap());
        assert!(matches!(ProxyServer::bind(config.clone()), Err(ProxyError::PublicUrlPath(_))));

        config.public_url = Some(Url::parse("http://tv.local:8080").unwrap());
        let server = ProxyServer::bind(config).unwrap();
        assert_eq!(
            server.proxy().local_playlist_url().unwrap().as_str(),
            "http://tv.local:8080/content/main.m3u8",
        );
    }

    #[test]
    fn placeholder_and_policy() {
        let mut config = ProxyConfig::new(
            "127.0.0.1:0".parse().unwrap(),
            Url::parse("https://cdn.example.com/content/main.m3u8").unwrap(),
        );
        config.initial_quality = Some(Quality::Max);
        let local = Url::parse("http://127.0.0.1:8080/").unwrap();
        let proxy = StreamProxy::new(&config, &local, Arc::new(NullMetric)).unwrap();
        assert!(!proxy.has_playlist());
        assert_eq!(proxy.playlist().url(), proxy.remote_playlist_url());
        assert_eq!(proxy.local_playlist_url().unwrap().as_str(), "http://127.0.0.1:8080/content/main.m3u8");
        assert!(proxy.policy().is_some());
        proxy.set_policy(None);
        assert!(proxy.policy().is_none());
    }

    #[test]
    fn latch_is_one_way() {
        let config = ProxyConfig::new(
            "127.0.0.1:0".parse().unwrap(),
            Url::parse("https://cdn.example.com/main.m3u8").unwrap(),
        );
        let local = Url::parse("http://127.0.0.1:8080/").unwrap();
        let proxy = StreamProxy::new(&config, &local, Arc::new(NullMetric)).unwrap();
        let rx = proxy.subscribe();
        let first = Playlist::Media(crate::hls::MediaPlaylist::new(Url::parse("https://cdn.example.com/first.m3u8").unwrap()));
        let second = Playlist::Media(crate::hls::MediaPlaylist::new(Url::parse("https://cdn.example.com/second.m3u8").unwrap()));
        assert!(proxy.latch(first));
        assert!(!proxy.latch(second));
        assert_eq!(proxy.playlist().url().path(), "/first.m3u8");
        assert_eq!(rx.borrow().as_ref().unwrap().url().path(), "/first.m3u8");
    }
}
