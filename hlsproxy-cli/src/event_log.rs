use hlsproxy::hls::{MediaPlaylist, Playlist, PlaylistKind};
use hlsproxy::proxy::{ManifestObserver, StreamProxy};
use log::{info, warn};
use serde_derive::Serialize;
use std::sync::Arc;

#[derive(Serialize, Debug)]
pub struct ManifestSummary {
    url: String,
    kind: &'static str,
    renditions: Vec<RenditionSummary>,
}

#[derive(Serialize, Debug)]
pub struct RenditionSummary {
    url: String,
    resolution: Option<String>,
    segments: usize,
    duration_secs: f64,
}

impl ManifestSummary {
    pub fn of(playlist: &Playlist) -> ManifestSummary {
        let renditions = match playlist {
            Playlist::Master(master) => master.renditions().map(RenditionSummary::of).collect(),
            Playlist::Media(media) => vec![RenditionSummary::of(media)],
        };
        ManifestSummary {
            url: playlist.url().to_string(),
            kind: match playlist.kind() {
                PlaylistKind::Master => "master",
                PlaylistKind::Media => "media",
            },
            renditions,
        }
    }
}

impl RenditionSummary {
    fn of(media: &MediaPlaylist) -> RenditionSummary {
        RenditionSummary {
            url: media.url().to_string(),
            resolution: media.resolution().map(|r| r.to_string()),
            segments: media.len(),
            duration_secs: media.total_duration(),
        }
    }
}

/// Logs a JSON summary of the canonical playlist once the proxy has loaded it.
pub struct LoggingObserver;
impl ManifestObserver for LoggingObserver {
    fn manifest_available(&self, proxy: &StreamProxy, playlist: Arc<Playlist>) {
        match serde_json::to_string(&ManifestSummary::of(&playlist)) {
            Ok(json) => info!("manifest_available {}", json),
            Err(e) => warn!("couldn't summarise {}: {}", playlist.url(), e),
        }
        if proxy.policy().is_some() && playlist.as_master().is_none() {
            info!("{} has a single rendition, so segments will not be substituted", playlist.url());
        }
    }
}
