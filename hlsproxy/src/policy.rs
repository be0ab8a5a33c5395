//! Policies deciding which rendition's copy of a segment the proxy actually serves.

use crate::hls::{MasterPlaylist, MediaPlaylist, Playlist, Resolution, Segment};
use std::fmt;
use std::str::FromStr;

/// Chooses a replacement for each segment requested through the proxy.
///
/// Called for every segment request, so implementations should be quick.  Returning the
/// requested segment unchanged means no substitution.
pub trait SegmentPolicy: Send + Sync {
    fn replacement(&self, playlist: &Playlist, segment: &Segment) -> Segment;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Quality {
    Min,
    Mid,
    Max,
    Resolution(Resolution),
}
impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Quality::Min => f.write_str("min"),
            Quality::Mid => f.write_str("mid"),
            Quality::Max => f.write_str("max"),
            Quality::Resolution(r) => write!(f, "{}", r),
        }
    }
}

#[derive(Debug, PartialEq)]
pub struct QualityParseError(String);
impl fmt::Display for QualityParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown quality {:?}, expected one of min, mid, max or WIDTHxHEIGHT", self.0)
    }
}
impl std::error::Error for QualityParseError {}

impl FromStr for Quality {
    type Err = QualityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "min" => Ok(Quality::Min),
            "mid" | "middle" => Ok(Quality::Mid),
            "max" => Ok(Quality::Max),
            other => other
                .parse()
                .map(Quality::Resolution)
                .map_err(|_| QualityParseError(s.to_string())),
        }
    }
}

/// Always serves segments from the same rendition, chosen by [`Quality`].
#[derive(Debug, Clone)]
pub struct FixedQualityPolicy {
    quality: Quality,
}
impl FixedQualityPolicy {
    pub fn new(quality: Quality) -> FixedQualityPolicy {
        FixedQualityPolicy { quality }
    }

    /// the rendition this policy would serve segments from
    pub fn select<'p>(&self, master: &'p MasterPlaylist) -> Option<&'p MediaPlaylist> {
        // renditions lacking a resolution never beat those that have one
        let resolved: Vec<_> = master.renditions().filter(|r| r.resolution().is_some()).collect();
        let candidates = if resolved.is_empty() {
            master.renditions().collect()
        } else {
            resolved
        };
        let sum = |r: &&MediaPlaylist| r.resolution().map(|r| r.sum()).unwrap_or(0);
        match self.quality {
            Quality::Min => candidates.into_iter().min_by_key(sum),
            Quality::Max => candidates.into_iter().max_by_key(sum),
            Quality::Mid => {
                let mut sorted = candidates;
                sorted.sort_by_key(sum);
                if sorted.is_empty() {
                    return None;
                }
                // ceil(count / 2), which is one past the end for a single rendition
                let idx = (sorted.len() + 1) / 2;
                sorted.get(idx.min(sorted.len() - 1)).copied()
            },
            Quality::Resolution(res) => master.renditions().find(|r| r.resolution() == Some(res)),
        }
    }
}

impl SegmentPolicy for FixedQualityPolicy {
    fn replacement(&self, playlist: &Playlist, segment: &Segment) -> Segment {
        let master = match playlist {
            Playlist::Master(m) => m,
            Playlist::Media(_) => return segment.clone(),
        };
        self.select(master)
            .and_then(|rendition| rendition.segment_by_sequence(segment.sequence()))
            .unwrap_or(segment)
            .clone()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::BTreeMap;
    use url::Url;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn rendition(name: &str, resolution: Option<Resolution>, segments: u64) -> MediaPlaylist {
        let mut pl = MediaPlaylist::with_segments(
            url(&format!("http://example.com/{}/index.m3u8", name)),
            (0..segments).map(|i| Segment::new(url(&format!("http://example.com/{}/{}.ts", name, i)), i, 4.0)),
        );
        pl.set_resolution(resolution);
        pl
    }

    fn master(renditions: Vec<MediaPlaylist>) -> Playlist {
        let map: BTreeMap<_, _> = renditions.into_iter().map(|r| (r.url().clone(), r)).collect();
        Playlist::Master(MasterPlaylist::new(url("http://example.com/main.m3u8"), map))
    }

    fn requested(playlist: &Playlist, u: &str) -> Segment {
        playlist.segment_by_url(&url(u)).unwrap().clone()
    }

    fn three() -> Playlist {
        master(vec![
            rendition("a", Some(Resolution::new(1280, 720)), 3),
            rendition("b", Some(Resolution::new(640, 360)), 3),
            rendition("c", Some(Resolution::new(1920, 1080)), 3),
        ])
    }

    #[test]
    fn parse_quality() {
        assert_eq!("min".parse(), Ok(Quality::Min));
        assert_eq!("MAX".parse(), Ok(Quality::Max));
        assert_eq!("middle".parse(), Ok(Quality::Mid));
        assert_eq!("1280x720".parse(), Ok(Quality::Resolution(Resolution::new(1280, 720))));
        assert!("best".parse::<Quality>().is_err());
        assert_eq!(Quality::Resolution(Resolution::new(640, 360)).to_string(), "640x360");
    }

    #[test]
    fn max_selects_largest_sum() {
        let playlist = master(vec![
            rendition("hd", Some(Resolution::new(1280, 720)), 3),
            rendition("fhd", Some(Resolution::new(1920, 1080)), 3),
        ]);
        let policy = FixedQualityPolicy::new(Quality::Max);
        let seg = requested(&playlist, "http://example.com/hd/2.ts");
        let replacement = policy.replacement(&playlist, &seg);
        assert_eq!(replacement.url().as_str(), "http://example.com/fhd/2.ts");
        assert_eq!(replacement.sequence(), 2);
    }

    #[test]
    fn min_selects_smallest_sum() {
        let playlist = three();
        let policy = FixedQualityPolicy::new(Quality::Min);
        let seg = requested(&playlist, "http://example.com/c/1.ts");
        assert_eq!(policy.replacement(&playlist, &seg).url().as_str(), "http://example.com/b/1.ts");
    }

    #[test]
    fn unresolved_renditions_never_win() {
        let playlist = master(vec![
            rendition("a", None, 2),
            rendition("b", Some(Resolution::new(640, 360)), 2),
            rendition("c", Some(Resolution::new(1920, 1080)), 2),
            rendition("d", None, 2),
        ]);
        let seg = requested(&playlist, "http://example.com/a/0.ts");
        let min = FixedQualityPolicy::new(Quality::Min).replacement(&playlist, &seg);
        let max = FixedQualityPolicy::new(Quality::Max).replacement(&playlist, &seg);
        assert_eq!(min.url().as_str(), "http://example.com/b/0.ts");
        assert_eq!(max.url().as_str(), "http://example.com/c/0.ts");
    }

    #[test]
    fn mid_of_three_is_index_two() {
        // ceil(3 / 2) = 2, which in ascending order is the highest quality
        let playlist = three();
        let policy = FixedQualityPolicy::new(Quality::Mid);
        let selected = policy.select(playlist.as_master().unwrap()).unwrap();
        assert_eq!(selected.resolution(), Some(Resolution::new(1920, 1080)));
    }

    #[test]
    fn mid_of_two_is_upper() {
        let playlist = master(vec![
            rendition("lo", Some(Resolution::new(640, 360)), 1),
            rendition("hi", Some(Resolution::new(1280, 720)), 1),
        ]);
        let selected = FixedQualityPolicy::new(Quality::Mid).select(playlist.as_master().unwrap()).unwrap();
        assert_eq!(selected.resolution(), Some(Resolution::new(1280, 720)));
    }

    #[test]
    fn mid_of_one_is_clamped() {
        let playlist = master(vec![rendition("only", Some(Resolution::new(640, 360)), 2)]);
        let policy = FixedQualityPolicy::new(Quality::Mid);
        let seg = requested(&playlist, "http://example.com/only/1.ts");
        assert_eq!(policy.replacement(&playlist, &seg), seg);
    }

    #[test]
    fn exact_resolution() {
        let playlist = three();
        let seg = requested(&playlist, "http://example.com/b/2.ts");
        let policy = FixedQualityPolicy::new(Quality::Resolution(Resolution::new(1280, 720)));
        assert_eq!(policy.replacement(&playlist, &seg).url().as_str(), "http://example.com/a/2.ts");
    }

    #[test]
    fn no_matching_resolution_keeps_original() {
        let playlist = three();
        let seg = requested(&playlist, "http://example.com/b/2.ts");
        // same sum as 1280x720, but not equal
        let policy = FixedQualityPolicy::new(Quality::Resolution(Resolution::new(720, 1280)));
        let replacement = policy.replacement(&playlist, &seg);
        assert_eq!(replacement, seg);
        assert_eq!(replacement.sequence(), 2);
    }

    #[test]
    fn missing_sequence_keeps_original() {
        let playlist = master(vec![
            rendition("short", Some(Resolution::new(640, 360)), 1),
            rendition("long", Some(Resolution::new(1920, 1080)), 3),
        ]);
        let seg = requested(&playlist, "http://example.com/long/2.ts");
        let replacement = FixedQualityPolicy::new(Quality::Min).replacement(&playlist, &seg);
        assert_eq!(replacement.url().as_str(), "http://example.com/long/2.ts");
    }

    #[test]
    fn media_playlist_is_noop() {
        let playlist = Playlist::Media(rendition("only", Some(Resolution::new(640, 360)), 2));
        let seg = requested(&playlist, "http://example.com/only/0.ts");
        assert_eq!(FixedQualityPolicy::new(Quality::Max).replacement(&playlist, &seg), seg);
    }
}
