//! In-memory model of the HLS playlists seen by the proxy.
//!
//! A [`Playlist`] is either a [`MasterPlaylist`], listing the renditions of a stream, or a
//! [`MediaPlaylist`], listing the segments of a single rendition.  Values are built by the
//! [`parser`] and are not modified afterwards.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use url::Url;

pub mod parser;

pub use parser::{ParseError, PlaylistParser};

/// Video dimensions of a rendition, as declared by the `RESOLUTION` attribute of a variant
/// stream.
///
/// Resolutions are ordered by `width + height`.  Two resolutions with the same sum but different
/// components are not ordered relative to each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}
impl Resolution {
    /// placeholder for a rendition whose dimensions are not known
    pub const ZERO: Resolution = Resolution { width: 0, height: 0 };

    pub fn new(width: u32, height: u32) -> Resolution {
        Resolution { width, height }
    }

    /// the quantity resolutions are ordered by
    pub fn sum(&self) -> u64 {
        u64::from(self.width) + u64::from(self.height)
    }
}
impl PartialOrd for Resolution {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self == other {
            return Some(Ordering::Equal);
        }
        match self.sum().cmp(&other.sum()) {
            Ordering::Equal => None,
            ord => Some(ord),
        }
    }
}
impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

#[derive(Debug, PartialEq)]
pub struct ResolutionParseError;
impl fmt::Display for ResolutionParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("resolution should have the form WIDTHxHEIGHT")
    }
}
impl std::error::Error for ResolutionParseError {}

impl FromStr for Resolution {
    type Err = ResolutionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut itr = s.splitn(2, 'x');
        let width = itr.next().ok_or(ResolutionParseError)?;
        let height = itr.next().ok_or(ResolutionParseError)?;
        Ok(Resolution {
            width: width.trim().parse().map_err(|_| ResolutionParseError)?,
            height: height.trim().parse().map_err(|_| ResolutionParseError)?,
        })
    }
}

/// A single media segment.  Segments are identified by their URL; the sequence number only has
/// meaning within the media playlist that lists the segment.
#[derive(Debug, Clone)]
pub struct Segment {
    url: Url,
    sequence: u64,
    duration: f32,
}
impl Segment {
    pub fn new(url: Url, sequence: u64, duration: f32) -> Segment {
        Segment {
            url,
            sequence,
            duration,
        }
    }
    pub fn url(&self) -> &Url {
        &self.url
    }
    /// the _media sequence number_ of this segment
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
    /// duration in seconds, from the `#EXTINF` tag
    pub fn duration(&self) -> f32 {
        self.duration
    }
}
impl PartialEq for Segment {
    fn eq(&self, other: &Self) -> bool {
        self.url == other.url
    }
}
impl Eq for Segment {}
impl Hash for Segment {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.url.hash(state)
    }
}

/// One rendition of the content.
#[derive(Debug, Clone)]
pub struct MediaPlaylist {
    url: Url,
    resolution: Option<Resolution>,
    by_sequence: BTreeMap<u64, Segment>,
    // value is the sequence number of the segment, i.e. a key into by_sequence
    by_url: HashMap<Url, u64>,
}
impl MediaPlaylist {
    pub fn new(url: Url) -> MediaPlaylist {
        MediaPlaylist {
            url,
            resolution: None,
            by_sequence: BTreeMap::new(),
            by_url: HashMap::new(),
        }
    }

    pub(crate) fn with_segments(url: Url, segments: impl IntoIterator<Item = Segment>) -> MediaPlaylist {
        let mut playlist = MediaPlaylist::new(url);
        for seg in segments {
            playlist.add_segment(seg);
        }
        playlist
    }

    fn add_segment(&mut self, segment: Segment) {
        if let Some(old) = self.by_sequence.remove(&segment.sequence) {
            self.by_url.remove(&old.url);
        }
        if let Some(old_seq) = self.by_url.insert(segment.url.clone(), segment.sequence) {
            self.by_sequence.remove(&old_seq);
        }
        self.by_sequence.insert(segment.sequence, segment);
    }

    pub(crate) fn set_resolution(&mut self, resolution: Option<Resolution>) {
        self.resolution = resolution;
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
    pub fn resolution(&self) -> Option<Resolution> {
        self.resolution
    }
    pub fn segment_by_url(&self, url: &Url) -> Option<&Segment> {
        self.by_url
            .get(url)
            .and_then(|seq| self.by_sequence.get(seq))
    }
    pub fn segment_by_sequence(&self, sequence: u64) -> Option<&Segment> {
        self.by_sequence.get(&sequence)
    }
    /// segments in order of ascending sequence number
    pub fn segments(&self) -> impl Iterator<Item = &Segment> {
        self.by_sequence.values()
    }
    pub fn len(&self) -> usize {
        self.by_sequence.len()
    }
    pub fn is_empty(&self) -> bool {
        self.by_sequence.is_empty()
    }
    /// sum of the durations of all segments, in seconds
    pub fn total_duration(&self) -> f64 {
        self.segments().map(|s| f64::from(s.duration)).sum()
    }
}

/// A playlist that lists renditions rather than segments.
#[derive(Debug, Clone)]
pub struct MasterPlaylist {
    url: Url,
    renditions: BTreeMap<Url, MediaPlaylist>,
}
impl MasterPlaylist {
    pub fn new(url: Url, renditions: BTreeMap<Url, MediaPlaylist>) -> MasterPlaylist {
        MasterPlaylist { url, renditions }
    }
    pub fn url(&self) -> &Url {
        &self.url
    }
    pub fn rendition(&self, url: &Url) -> Option<&MediaPlaylist> {
        self.renditions.get(url)
    }
    /// renditions, in order of their URLs
    pub fn renditions(&self) -> impl Iterator<Item = &MediaPlaylist> {
        self.renditions.values()
    }
    pub fn len(&self) -> usize {
        self.renditions.len()
    }
    pub fn is_empty(&self) -> bool {
        self.renditions.is_empty()
    }
    /// search every rendition for a segment with the given URL
    pub fn segment_by_url(&self, url: &Url) -> Option<&Segment> {
        self.renditions().find_map(|r| r.segment_by_url(url))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaylistKind {
    Master,
    Media,
}

#[derive(Debug, Clone)]
pub enum Playlist {
    Master(MasterPlaylist),
    Media(MediaPlaylist),
}
impl Playlist {
    pub fn url(&self) -> &Url {
        match self {
            Playlist::Master(m) => m.url(),
            Playlist::Media(m) => m.url(),
        }
    }
    pub fn kind(&self) -> PlaylistKind {
        match self {
            Playlist::Master(_) => PlaylistKind::Master,
            Playlist::Media(_) => PlaylistKind::Media,
        }
    }
    pub fn segment_by_url(&self, url: &Url) -> Option<&Segment> {
        match self {
            Playlist::Master(m) => m.segment_by_url(url),
            Playlist::Media(m) => m.segment_by_url(url),
        }
    }
    pub fn as_master(&self) -> Option<&MasterPlaylist> {
        match self {
            Playlist::Master(m) => Some(m),
            Playlist::Media(_) => None,
        }
    }
}
