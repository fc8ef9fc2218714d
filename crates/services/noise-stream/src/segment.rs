//! Segment store: on-disk layout of each channel's rolling HLS window
//!
//! Every channel owns `<root>/<channel id>/`, written only by its encoder.
//! The encoder publishes files by renaming them into place, so anything
//! visible under its final name is complete and readers need no locking.
//! A segment may disappear between a playlist fetch and the segment fetch;
//! that shows up here as a plain "not found".

use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::error::{Error, Result};

/// Playlist file name inside a channel directory
pub const PLAYLIST_NAME: &str = "stream.m3u8";

/// Segment file name template handed to the encoder
pub const SEGMENT_TEMPLATE: &str = "segment%03d.ts";

const PLAYLIST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";
const SEGMENT_CONTENT_TYPE: &str = "video/mp2t";

/// Root of all channel directories
#[derive(Debug, Clone)]
pub struct SegmentStore {
    root: PathBuf,
}

impl SegmentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory view for one channel
    pub fn channel(&self, channel_id: &str) -> ChannelDir {
        ChannelDir {
            dir: self.root.join(channel_id),
        }
    }

    pub async fn ensure_root(&self) -> io::Result<()> {
        tokio::fs::create_dir_all(&self.root).await
    }

    /// Whether the HTTP surface can read from the store at all
    pub async fn is_readable(&self) -> bool {
        match tokio::fs::metadata(&self.root).await {
            Ok(meta) => meta.is_dir(),
            Err(_) => false,
        }
    }
}

/// One channel's output directory
#[derive(Debug, Clone)]
pub struct ChannelDir {
    dir: PathBuf,
}

impl ChannelDir {
    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn playlist_path(&self) -> PathBuf {
        self.dir.join(PLAYLIST_NAME)
    }

    pub fn segment_template(&self) -> PathBuf {
        self.dir.join(SEGMENT_TEMPLATE)
    }

    /// Create the directory if it does not exist yet
    pub async fn prepare(&self) -> io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await
    }

    /// Last-modified time of the playlist, `None` if it has not been written
    pub async fn playlist_modified(&self) -> Option<SystemTime> {
        let meta = tokio::fs::metadata(self.playlist_path()).await.ok()?;
        meta.modified().ok()
    }

    /// Time since the playlist was last written, measured against `now`
    ///
    /// A modification time in the future (clock skew) counts as fresh.
    pub async fn staleness(&self, now: SystemTime) -> Option<Duration> {
        let modified = self.playlist_modified().await?;
        Some(now.duration_since(modified).unwrap_or(Duration::ZERO))
    }

    /// Segment names currently referenced by the playlist, oldest first
    pub async fn window(&self) -> Vec<String> {
        match tokio::fs::read_to_string(self.playlist_path()).await {
            Ok(content) => playlist_entries(&content),
            Err(_) => Vec::new(),
        }
    }

    /// Map a client-supplied file name onto a servable path
    pub fn resolve(&self, file_name: &str) -> Result<HlsFile> {
        let kind = HlsFileKind::from_file_name(file_name)?;
        Ok(HlsFile {
            path: self.dir.join(file_name),
            kind,
        })
    }
}

/// Kind of file served from a channel directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HlsFileKind {
    Playlist,
    Segment,
}

impl HlsFileKind {
    /// Validate a bare file name and classify it by extension
    pub fn from_file_name(name: &str) -> Result<Self> {
        if name.is_empty()
            || name.contains("..")
            || name.contains('/')
            || name.contains('\\')
            || name.starts_with('.')
        {
            return Err(Error::InvalidFileName(name.to_string()));
        }

        if name.ends_with(".m3u8") {
            Ok(HlsFileKind::Playlist)
        } else if name.ends_with(".ts") {
            Ok(HlsFileKind::Segment)
        } else {
            Err(Error::InvalidFileName(name.to_string()))
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            HlsFileKind::Playlist => PLAYLIST_CONTENT_TYPE,
            HlsFileKind::Segment => SEGMENT_CONTENT_TYPE,
        }
    }

    /// Playlists change every segment and must never be cached
    pub fn cache_control(&self) -> Option<&'static str> {
        match self {
            HlsFileKind::Playlist => Some("no-cache, no-store, must-revalidate"),
            HlsFileKind::Segment => None,
        }
    }
}

/// A resolved, validated file inside a channel directory
#[derive(Debug, Clone)]
pub struct HlsFile {
    pub path: PathBuf,
    pub kind: HlsFileKind,
}

fn playlist_entries(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAYLIST: &str = "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:2\n#EXT-X-MEDIA-SEQUENCE:7\n#EXTINF:2.000000,\nsegment007.ts\n#EXTINF:2.000000,\nsegment008.ts\n";

    #[test]
    fn test_file_kind_classification() {
        assert_eq!(
            HlsFileKind::from_file_name("stream.m3u8").unwrap(),
            HlsFileKind::Playlist
        );
        assert_eq!(
            HlsFileKind::from_file_name("segment001.ts").unwrap(),
            HlsFileKind::Segment
        );
        assert_eq!(
            HlsFileKind::Playlist.content_type(),
            "application/vnd.apple.mpegurl"
        );
        assert_eq!(HlsFileKind::Segment.content_type(), "video/mp2t");
    }

    #[test]
    fn test_rejects_unsafe_names() {
        for name in [
            "",
            "../stream.m3u8",
            "a/b.ts",
            "a\\b.ts",
            ".hidden.ts",
            "notes.txt",
            "stream.m3u8.tmp",
        ] {
            assert!(
                HlsFileKind::from_file_name(name).is_err(),
                "{name:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_playlist_entries_skip_tags() {
        assert_eq!(
            playlist_entries(PLAYLIST),
            vec!["segment007.ts".to_string(), "segment008.ts".to_string()]
        );
    }

    #[test]
    fn test_channel_layout() {
        let store = SegmentStore::new("/srv/hls");
        let dir = store.channel("noise_white");
        assert_eq!(dir.path(), Path::new("/srv/hls/noise_white"));
        assert_eq!(
            dir.playlist_path(),
            PathBuf::from("/srv/hls/noise_white/stream.m3u8")
        );
        assert_eq!(
            dir.segment_template(),
            PathBuf::from("/srv/hls/noise_white/segment%03d.ts")
        );
    }

    #[tokio::test]
    async fn test_staleness_tracks_playlist_mtime() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SegmentStore::new(tmp.path());
        let dir = store.channel("noise_pink");
        dir.prepare().await.unwrap();

        assert!(dir.playlist_modified().await.is_none());
        assert!(dir.staleness(SystemTime::now()).await.is_none());

        tokio::fs::write(dir.playlist_path(), PLAYLIST).await.unwrap();
        let modified = dir.playlist_modified().await.unwrap();

        let later = modified + Duration::from_secs(9);
        assert_eq!(dir.staleness(later).await, Some(Duration::from_secs(9)));

        let earlier = modified - Duration::from_secs(5);
        assert_eq!(dir.staleness(earlier).await, Some(Duration::ZERO));

        assert_eq!(dir.window().await.len(), 2);
    }

    #[tokio::test]
    async fn test_store_readability() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SegmentStore::new(tmp.path().join("hls"));
        assert!(!store.is_readable().await);
        store.ensure_root().await.unwrap();
        assert!(store.is_readable().await);
    }
}
