//! Line-oriented parser for HLS playlists.
//!
//! Only the handful of tags needed to locate segments and renditions are interpreted; anything
//! else is ignored.  The parser is deliberately lenient: a tag that can't be understood is
//! skipped rather than failing the whole playlist.

use super::{MasterPlaylist, MediaPlaylist, Playlist, Resolution, Segment};
use crate::fetch::PlaylistFetcher;
use futures::future::BoxFuture;
use futures::prelude::*;
use log::{debug, warn};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use url::Url;

/// Limit on master-playlist nesting, after which further variant references are ignored
pub const MAX_NESTING_DEPTH: usize = 4;

const TAG_HEAD: &str = "#EXTM3U";
const TAG_MAP: &str = "#EXT-X-MAP";
const TAG_INF: &str = "#EXTINF";
const TAG_MEDIA_SEQ: &str = "#EXT-X-MEDIA-SEQUENCE";
const TAG_STREAM_INF: &str = "#EXT-X-STREAM-INF";
const TAG_I_FRAME_STREAM_INF: &str = "#EXT-X-I-FRAME-STREAM-INF";

#[derive(Debug, PartialEq)]
pub enum ParseError {
    /// the data does not start with `#EXTM3U`
    NotAPlaylist,
}
impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::NotAPlaylist => write!(f, "content does not start with {}", TAG_HEAD),
        }
    }
}
impl std::error::Error for ParseError {}

/// Attributes following the colon of a tag, e.g. `BANDWIDTH=1280000,RESOLUTION=640x360`.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct Attributes {
    named: HashMap<String, String>,
    anonymous: Vec<String>,
}
impl Attributes {
    pub(crate) fn parse(s: &str) -> Attributes {
        let mut attrs = Attributes::default();
        if s.is_empty() {
            return attrs;
        }
        for item in split_attribute_list(s) {
            match item.find('=') {
                Some(pos) => {
                    let name = item[..pos].trim();
                    let value = item[pos + 1..].trim().trim_matches('"');
                    attrs.named.insert(name.to_string(), value.to_string());
                },
                None => attrs.anonymous.push(item.trim().to_string()),
            }
        }
        attrs
    }

    pub(crate) fn named(&self, name: &str) -> Option<&str> {
        self.named.get(name).map(String::as_str)
    }

    pub(crate) fn first_anonymous(&self) -> Option<&str> {
        self.anonymous.first().map(String::as_str)
    }
}

/// split on commas, except where they appear within a double-quoted value
fn split_attribute_list(s: &str) -> Vec<&str> {
    let mut items = vec![];
    let mut in_quotes = false;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                items.push(&s[start..i]);
                start = i + 1;
            },
            _ => (),
        }
    }
    items.push(&s[start..]);
    items
}

/// Builds a [`Playlist`] from the text of an HLS playlist.
///
/// Variant streams listed in a master playlist are retrieved with the given
/// [`PlaylistFetcher`] and parsed in turn, each by a fresh parser.  A parser may be reused, but
/// each call to [`parse()`](PlaylistParser::parse) starts from a clean state.
pub struct PlaylistParser<'f, F: PlaylistFetcher + ?Sized> {
    fetcher: &'f F,
    // manifests enclosing the one being parsed, outermost first
    ancestors: Vec<Url>,
    url: Option<Url>,
    dir: Option<Url>,
    sequence: u64,
    segments: BTreeMap<u64, Segment>,
    renditions: BTreeMap<Url, MediaPlaylist>,
}

impl<'f, F: PlaylistFetcher + ?Sized> PlaylistParser<'f, F> {
    pub fn new(fetcher: &'f F) -> PlaylistParser<'f, F> {
        PlaylistParser::with_ancestors(fetcher, vec![])
    }

    fn with_ancestors(fetcher: &'f F, ancestors: Vec<Url>) -> PlaylistParser<'f, F> {
        PlaylistParser {
            fetcher,
            ancestors,
            url: None,
            dir: None,
            sequence: 0,
            segments: BTreeMap::new(),
            renditions: BTreeMap::new(),
        }
    }

    /// Parse the playlist `data` that was retrieved from `url`.
    ///
    /// Relative URIs within the playlist are resolved against `url`.
    pub fn parse<'a>(&'a mut self, url: &'a Url, data: &'a [u8]) -> BoxFuture<'a, Result<Playlist, ParseError>> {
        async move {
            self.cleanup();
            self.url = Some(url.clone());
            self.dir = url.join(".").ok();

            let text = String::from_utf8_lossy(data);
            let text = text.strip_prefix('\u{feff}').unwrap_or(&text);
            if !text.starts_with(TAG_HEAD) {
                return Err(ParseError::NotAPlaylist);
            }

            let lines: Vec<&str> = text.lines().map(str::trim).collect();
            for (idx, line) in lines.iter().enumerate() {
                if !line.starts_with('#') {
                    continue;
                }
                let mut itr = line.splitn(2, ':');
                let tag = itr.next().unwrap_or("");
                let attrs = itr.next().map(Attributes::parse).unwrap_or_default();
                let contents = lines[idx + 1..]
                    .iter()
                    .find(|l| !l.is_empty() && !l.starts_with('#'))
                    .copied();
                self.handle_tag(tag, contents, &attrs).await;
            }

            if self.renditions.is_empty() {
                let segments = std::mem::take(&mut self.segments);
                Ok(Playlist::Media(MediaPlaylist::with_segments(url.clone(), segments.into_values())))
            } else {
                let renditions = std::mem::take(&mut self.renditions);
                Ok(Playlist::Master(MasterPlaylist::new(url.clone(), renditions)))
            }
        }.boxed()
    }

    async fn handle_tag(&mut self, tag: &str, contents: Option<&str>, attrs: &Attributes) {
        match tag {
            TAG_MAP => {
                match attrs.named("URI").and_then(|uri| self.absolute_url(uri)) {
                    Some(url) => {
                        self.segments.insert(0, Segment::new(url, 0, 0.0));
                    },
                    None => debug!("ignoring {} without usable URI", TAG_MAP),
                }
            },
            TAG_INF => {
                let url = contents.and_then(|c| self.absolute_url(c));
                let duration = attrs.first_anonymous().and_then(|d| d.parse::<f32>().ok());
                match (url, duration) {
                    (Some(url), Some(duration)) => {
                        let sequence = self.sequence;
                        self.segments.insert(sequence, Segment::new(url, sequence, duration));
                        self.sequence += 1;
                    },
                    _ => debug!("ignoring malformed {} (duration {:?}, uri {:?})", TAG_INF, attrs.first_anonymous(), contents),
                }
            },
            TAG_MEDIA_SEQ => {
                match attrs.first_anonymous().and_then(|s| s.parse().ok()) {
                    Some(seq) => self.sequence = seq,
                    None => debug!("ignoring malformed {} {:?}", TAG_MEDIA_SEQ, attrs.first_anonymous()),
                }
            },
            TAG_STREAM_INF => {
                match contents.and_then(|c| self.absolute_url(c)) {
                    Some(url) => self.parse_rendition(url, attrs).await,
                    None => debug!("ignoring {} without usable URI", TAG_STREAM_INF),
                }
            },
            TAG_I_FRAME_STREAM_INF => {
                match attrs.named("URI").and_then(|uri| self.absolute_url(uri)) {
                    Some(url) => self.parse_rendition(url, attrs).await,
                    None => debug!("ignoring {} without usable URI", TAG_I_FRAME_STREAM_INF),
                }
            },
            _ => (),
        }
    }

    fn absolute_url(&self, uri: &str) -> Option<Url> {
        if uri.starts_with("http://") || uri.starts_with("https://") {
            Url::parse(uri).ok()
        } else {
            self.dir.as_ref().and_then(|dir| dir.join(uri).ok())
        }
    }

    /// fetch and parse the media playlist referenced by a variant stream tag
    async fn parse_rendition(&mut self, url: Url, attrs: &Attributes) {
        if self.renditions.contains_key(&url) {
            return;
        }
        if self.url.as_ref() == Some(&url) || self.ancestors.contains(&url) || self.ancestors.len() >= MAX_NESTING_DEPTH {
            warn!("not following variant stream {}: cyclic or too deeply nested", url);
            return;
        }
        let data = match self.fetcher.fetch_playlist(&url).await {
            Ok(data) => data,
            Err(e) => {
                warn!("failed to fetch variant stream {}: {}", url, e);
                return;
            },
        };
        let mut ancestors = self.ancestors.clone();
        ancestors.extend(self.url.clone());
        let mut parser = PlaylistParser::with_ancestors(self.fetcher, ancestors);
        match parser.parse(&url, &data).await {
            Ok(Playlist::Media(mut media)) => {
                let resolution = attrs.named("RESOLUTION").and_then(|r| r.parse::<Resolution>().ok());
                media.set_resolution(resolution);
                self.renditions.insert(url, media);
            },
            Ok(Playlist::Master(_)) => {
                warn!("ignoring variant stream {}: it is a master playlist", url);
            },
            Err(e) => warn!("failed to parse variant stream {}: {}", url, e),
        }
    }

    fn cleanup(&mut self) {
        self.url = None;
        self.dir = None;
        self.sequence = 0;
        self.segments.clear();
        self.renditions.clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fetch::FetchError;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct MapFetcher {
        playlists: HashMap<Url, &'static str>,
        calls: AtomicUsize,
    }
    impl MapFetcher {
        fn with(mut self, url: &str, body: &'static str) -> Self {
            self.playlists.insert(Url::parse(url).unwrap(), body);
            self
        }
    }
    impl PlaylistFetcher for MapFetcher {
        fn fetch_playlist<'a>(&'a self, url: &'a Url) -> BoxFuture<'a, Result<Bytes, FetchError>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let res = self.playlists
                .get(url)
                .map(|body| Bytes::from_static(body.as_bytes()))
                .ok_or(FetchError::NotFound);
            future::ready(res).boxed()
        }
    }

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    async fn parse(fetcher: &MapFetcher, base: &str, data: &str) -> Result<Playlist, ParseError> {
        PlaylistParser::new(fetcher).parse(&url(base), data.as_bytes()).await
    }

    const MEDIA: &str = "#EXTM3U
#EXT-X-VERSION:3
#EXT-X-TARGETDURATION:4
#EXTINF:4.0,
seg0.ts
#EXTINF:4.0,
seg1.ts
#EXTINF:3.5,
seg2.ts
#EXT-X-ENDLIST
";

    #[test]
    fn attributes() {
        let attrs = Attributes::parse(r#"BANDWIDTH=1280000,RESOLUTION=640x360,CODECS="avc1.4d401e,mp4a.40.2""#);
        assert_eq!(attrs.named("BANDWIDTH"), Some("1280000"));
        assert_eq!(attrs.named("RESOLUTION"), Some("640x360"));
        assert_eq!(attrs.named("CODECS"), Some("avc1.4d401e,mp4a.40.2"));
        assert_eq!(attrs.first_anonymous(), None);

        let attrs = Attributes::parse("10.010,Title text");
        assert_eq!(attrs.first_anonymous(), Some("10.010"));
        assert_eq!(attrs.anonymous, vec!["10.010", "Title text"]);

        // value split at the first '='
        let attrs = Attributes::parse(r#"URI="init.mp4?a=b""#);
        assert_eq!(attrs.named("URI"), Some("init.mp4?a=b"));

        assert_eq!(Attributes::parse(""), Attributes::default());
    }

    #[tokio::test]
    async fn media_playlist() {
        let fetcher = MapFetcher::default();
        let playlist = parse(&fetcher, "http://example.com/video/index.m3u8", MEDIA).await.unwrap();
        let media = match playlist {
            Playlist::Media(m) => m,
            _ => panic!("expected media playlist"),
        };
        assert_eq!(media.len(), 3);
        let seqs: Vec<_> = media.segments().map(|s| s.sequence()).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        let seg = media.segment_by_sequence(1).unwrap();
        assert_eq!(seg.url().as_str(), "http://example.com/video/seg1.ts");
        assert_eq!(media.segment_by_url(seg.url()).unwrap().sequence(), 1);
        assert!((media.segment_by_sequence(2).unwrap().duration() - 3.5).abs() < 1e-6);
        assert_eq!(media.resolution(), None);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn media_sequence_sets_base() {
        let data = "#EXTM3U
#EXTINF:4,
a.ts
#EXT-X-MEDIA-SEQUENCE:100
#EXTINF:4,
b.ts
#EXTINF:4,
c.ts
";
        let playlist = parse(&MapFetcher::default(), "http://example.com/live.m3u8", data).await.unwrap();
        let seqs: Vec<_> = match &playlist {
            Playlist::Media(m) => m.segments().map(|s| (s.sequence(), s.url().path().to_string())).collect(),
            _ => panic!("expected media playlist"),
        };
        assert_eq!(seqs, vec![(0, "/a.ts".to_string()), (100, "/b.ts".to_string()), (101, "/c.ts".to_string())]);
    }

    #[tokio::test]
    async fn init_segment_and_absolute_uris() {
        let data = r#"#EXTM3U
#EXT-X-MEDIA-SEQUENCE:5
#EXT-X-MAP:URI="init.mp4"
#EXTINF:2.0,
https://cdn.example.net/v/5.m4s
"#;
        let playlist = parse(&MapFetcher::default(), "http://example.com/v/index.m3u8", data).await.unwrap();
        let init = playlist.segment_by_url(&url("http://example.com/v/init.mp4")).unwrap();
        assert_eq!(init.sequence(), 0);
        assert_eq!(init.duration(), 0.0);
        assert_eq!(playlist.segment_by_url(&url("https://cdn.example.net/v/5.m4s")).unwrap().sequence(), 5);
    }

    #[tokio::test]
    async fn malformed_tags_skipped() {
        let data = "#EXTM3U
#EXT-X-MEDIA-SEQUENCE:abc
#EXTINF:notanumber,
bad.ts
#EXTINF:4,
good.ts
#EXT-X-MAP:BYTERANGE=100
#EXT-X-UNKNOWN-TAG:WHATEVER=1
";
        let playlist = parse(&MapFetcher::default(), "http://example.com/index.m3u8", data).await.unwrap();
        match playlist {
            Playlist::Media(m) => {
                assert_eq!(m.len(), 1);
                assert_eq!(m.segment_by_sequence(0).unwrap().url().path(), "/good.ts");
            },
            _ => panic!("expected media playlist"),
        }
    }

    #[tokio::test]
    async fn missing_header() {
        let res = parse(&MapFetcher::default(), "http://example.com/index.m3u8", "#EXTINF:4,\nseg.ts\n").await;
        assert_eq!(res.err(), Some(ParseError::NotAPlaylist));
        let res = parse(&MapFetcher::default(), "http://example.com/index.m3u8", "<html></html>").await;
        assert_eq!(res.err(), Some(ParseError::NotAPlaylist));
        // byte order mark is tolerated
        let res = parse(&MapFetcher::default(), "http://example.com/index.m3u8", "\u{feff}#EXTM3U\n").await;
        assert!(res.is_ok());
    }

    #[tokio::test]
    async fn master_playlist() {
        let fetcher = MapFetcher::default()
            .with("http://example.com/hls/hi/index.m3u8", MEDIA)
            .with("http://example.com/hls/lo/index.m3u8", MEDIA)
            .with("http://example.com/hls/iframes.m3u8", MEDIA);
        let data = r#"#EXTM3U
#EXT-X-STREAM-INF:BANDWIDTH=5000000,RESOLUTION=1920x1080,CODECS="avc1.640028,mp4a.40.2"
hi/index.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=800000,RESOLUTION=640x360
lo/index.m3u8
#EXT-X-I-FRAME-STREAM-INF:BANDWIDTH=100000,URI="iframes.m3u8"
"#;
        let playlist = parse(&fetcher, "http://example.com/hls/main.m3u8", data).await.unwrap();
        let master = playlist.as_master().expect("master playlist");
        assert_eq!(master.len(), 3);
        let hi = master.rendition(&url("http://example.com/hls/hi/index.m3u8")).unwrap();
        assert_eq!(hi.resolution(), Some(Resolution::new(1920, 1080)));
        assert_eq!(hi.len(), 3);
        assert_eq!(hi.segment_by_sequence(0).unwrap().url().as_str(), "http://example.com/hls/hi/seg0.ts");
        let lo = master.rendition(&url("http://example.com/hls/lo/index.m3u8")).unwrap();
        assert_eq!(lo.resolution(), Some(Resolution::new(640, 360)));
        let iframes = master.rendition(&url("http://example.com/hls/iframes.m3u8")).unwrap();
        assert_eq!(iframes.resolution(), None);
        assert!(playlist.segment_by_url(&url("http://example.com/hls/lo/seg2.ts")).is_some());
    }

    #[tokio::test]
    async fn duplicate_variants_fetched_once() {
        let fetcher = MapFetcher::default()
            .with("http://example.com/a.m3u8", MEDIA);
        let data = "#EXTM3U
#EXT-X-STREAM-INF:BANDWIDTH=1000
a.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=1000
http://example.com/a.m3u8
";
        let playlist = parse(&fetcher, "http://example.com/main.m3u8", data).await.unwrap();
        assert_eq!(playlist.as_master().unwrap().len(), 1);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unavailable_variant_skipped() {
        let fetcher = MapFetcher::default()
            .with("http://example.com/a.m3u8", MEDIA)
            .with("http://example.com/junk.m3u8", "not a playlist");
        let data = "#EXTM3U
#EXT-X-STREAM-INF:BANDWIDTH=1000
a.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=2000
missing.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=3000
junk.m3u8
";
        let playlist = parse(&fetcher, "http://example.com/main.m3u8", data).await.unwrap();
        assert_eq!(playlist.as_master().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn all_variants_unavailable() {
        let data = "#EXTM3U
#EXT-X-STREAM-INF:BANDWIDTH=1000
a.m3u8
";
        let playlist = parse(&MapFetcher::default(), "http://example.com/main.m3u8", data).await.unwrap();
        // with no renditions recorded, the result is an empty media playlist
        match playlist {
            Playlist::Media(m) => assert!(m.is_empty()),
            _ => panic!("expected media playlist"),
        }
    }

    #[tokio::test]
    async fn cyclic_references_terminate() {
        let fetcher = MapFetcher::default()
            .with("http://example.com/a.m3u8", "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=1\nb.m3u8\n")
            .with("http://example.com/b.m3u8", "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=1\na.m3u8\n");
        let data = "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=1\na.m3u8\n";
        let playlist = parse(&fetcher, "http://example.com/a.m3u8", data).await.unwrap();
        // a.m3u8 refers to itself, so nothing is fetched
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
        assert_eq!(playlist.kind(), crate::hls::PlaylistKind::Media);

        let playlist = parse(&fetcher, "http://example.com/main.m3u8", data).await.unwrap();
        // main -> a -> b -> a, where the last is skipped as an ancestor.  b comes out as an empty
        // media playlist, which makes a a master playlist and so not a usable rendition of main
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
        assert!(playlist.as_master().is_none());
    }

    #[tokio::test]
    async fn parser_reuse_starts_clean() {
        let fetcher = MapFetcher::default();
        let mut parser = PlaylistParser::new(&fetcher);
        let first = parser.parse(&url("http://example.com/a/index.m3u8"), MEDIA.as_bytes()).await.unwrap();
        let second = parser.parse(&url("http://example.com/b/index.m3u8"), b"#EXTM3U\n#EXTINF:1,\nx.ts\n").await.unwrap();
        assert!(first.segment_by_url(&url("http://example.com/a/seg2.ts")).is_some());
        match second {
            Playlist::Media(m) => {
                assert_eq!(m.len(), 1);
                assert_eq!(m.segment_by_sequence(0).unwrap().url().as_str(), "http://example.com/b/x.ts");
            },
            _ => panic!("expected media playlist"),
        }
    }
}
