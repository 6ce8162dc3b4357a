use std::path::Path;

use lofty::error::LoftyError;
use lofty::prelude::{ItemKey, TaggedFileExt};

/// The tag triple the catalog keys on. Fields a file does not carry stay
/// `None`; the storage engine decides what to do with incomplete files.
#[derive(Debug, Default, Clone)]
pub struct TagInfo {
    pub artist: Option<String>,
    pub album: Option<String>,
    pub title: Option<String>,
}

#[derive(Debug)]
pub enum MetadataError {
    Io(std::io::Error),
    Lofty(LoftyError),
}

impl std::fmt::Display for MetadataError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetadataError::Io(err) => write!(f, "io error: {}", err),
            MetadataError::Lofty(err) => write!(f, "tag error: {}", err),
        }
    }
}

impl std::error::Error for MetadataError {}

impl From<std::io::Error> for MetadataError {
    fn from(err: std::io::Error) -> Self {
        MetadataError::Io(err)
    }
}

impl From<LoftyError> for MetadataError {
    fn from(err: LoftyError) -> Self {
        MetadataError::Lofty(err)
    }
}

/// Boundary for audio-tag extraction. The storage engine only ever sees this
/// trait, so tests can substitute a reader that never touches real audio.
pub trait TagReader: Send + Sync {
    fn read_tags(&self, path: &Path) -> Result<TagInfo, MetadataError>;
}

/// Production reader backed by lofty.
#[derive(Debug, Default)]
pub struct LoftyReader;

impl TagReader for LoftyReader {
    fn read_tags(&self, path: &Path) -> Result<TagInfo, MetadataError> {
        let tagged_file = lofty::read_from_path(path)?;

        let mut info = TagInfo::default();
        if let Some(tag) = tagged_file.primary_tag().or_else(|| tagged_file.first_tag()) {
            info.title = tag
                .get_string(&ItemKey::TrackTitle)
                .map(|v| v.to_string())
                .filter(|v| !v.trim().is_empty());
            info.album = tag
                .get_string(&ItemKey::AlbumTitle)
                .map(|v| v.to_string())
                .filter(|v| !v.trim().is_empty());
            let album_artist = tag.get_string(&ItemKey::AlbumArtist).map(|v| v.to_string());
            let track_artist = tag.get_string(&ItemKey::TrackArtist).map(|v| v.to_string());
            info.artist = track_artist
                .or(album_artist)
                .filter(|v| !v.trim().is_empty());
        }

        Ok(info)
    }
}
