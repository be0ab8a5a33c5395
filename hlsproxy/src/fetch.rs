//! Retrieval of the media playlists referenced from a master playlist.

use crate::upstream::{self, UpstreamError};
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::prelude::*;
use reqwest::StatusCode;
use std::fmt;
use url::Url;

/// Supplies the body of a playlist, given its URL.
///
/// The [`PlaylistParser`](crate::hls::PlaylistParser) calls this for each variant stream it
/// finds in a master playlist.
pub trait PlaylistFetcher: Send + Sync {
    fn fetch_playlist<'a>(&'a self, url: &'a Url) -> BoxFuture<'a, Result<Bytes, FetchError>>;
}

#[derive(Debug)]
pub enum FetchError {
    Upstream(UpstreamError),
    Status(StatusCode),
    NotFound,
}
impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::Upstream(e) => write!(f, "{}", e),
            FetchError::Status(s) => write!(f, "HTTP status {}", s),
            FetchError::NotFound => f.write_str("playlist not available"),
        }
    }
}
impl std::error::Error for FetchError {}
impl From<UpstreamError> for FetchError {
    fn from(e: UpstreamError) -> Self {
        FetchError::Upstream(e)
    }
}

/// Fetches playlists with plain `GET` requests.
#[derive(Clone)]
pub struct HttpFetcher {
    client: upstream::Client,
}
impl HttpFetcher {
    pub fn new(client: upstream::Client) -> HttpFetcher {
        HttpFetcher { client }
    }
}
impl PlaylistFetcher for HttpFetcher {
    fn fetch_playlist<'a>(&'a self, url: &'a Url) -> BoxFuture<'a, Result<Bytes, FetchError>> {
        self.client.fetch_playlist(url.clone()).boxed()
    }
}
