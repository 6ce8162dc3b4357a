use std::cmp::Ordering;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Audio formats the catalog accepts. Anything else staged for promotion is
/// deleted during the next update cycle.
pub const SUPPORTED_EXTENSIONS: &[&str] = &[
    "mp3", "mp4", "m4p", "m4a", "flac", "ogg", "oga", "wma", "wav", "ra", "ram",
];

pub fn is_supported_extension(ext: &str) -> bool {
    let ext = ext.trim_start_matches('.');
    SUPPORTED_EXTENSIONS
        .iter()
        .any(|candidate| candidate.eq_ignore_ascii_case(ext))
}

/// One catalogued file. The identity is derived from the tag triple at
/// construction and never changes afterwards; two tracks with equal `id`
/// are the same catalog entry regardless of where their files live.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Track {
    artist: String,
    album: String,
    title: String,
    path: PathBuf,
    id: String,
}

impl Track {
    pub fn new(artist: String, album: String, title: String, path: PathBuf) -> Self {
        let id = track_id(&artist, &album, &title);
        Self {
            artist,
            album,
            title,
            path,
            id,
        }
    }

    pub fn artist(&self) -> &str {
        &self.artist
    }

    pub fn album(&self) -> &str {
        &self.album
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl PartialEq for Track {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Track {}

impl PartialOrd for Track {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Track {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id.cmp(&other.id)
    }
}

/// Sort/lookup key for the index: the lowercase concatenation of artist,
/// album and title, in that order. The order is significant; it decides the
/// in-order position of every node in the tree.
pub fn track_id(artist: &str, album: &str, title: &str) -> String {
    let mut id = String::with_capacity(artist.len() + album.len() + title.len());
    id.push_str(artist);
    id.push_str(album);
    id.push_str(title);
    id.to_lowercase()
}

/// Folder-name form of a tag component: lowercased, spaces as underscores.
/// Tags arrive inside uploaded files, so path separators are replaced and
/// dot-only or empty components are substituted; a tag can never name a
/// location outside its own level of the database tree.
pub fn normalize_component(value: &str) -> String {
    let normalized: String = value
        .chars()
        .map(|c| match c {
            ' ' | '/' | '\\' => '_',
            c => c,
        })
        .collect();
    let normalized = normalized.to_lowercase();
    if normalized.is_empty() || normalized.chars().all(|c| c == '.') {
        return "_".to_string();
    }
    normalized
}

/// Canonical location of a track below the database root.
pub fn canonical_relpath(artist: &str, album: &str, title: &str, ext: &str) -> PathBuf {
    let mut file_name = normalize_component(title);
    if !ext.is_empty() {
        file_name.push('.');
        file_name.push_str(&ext.trim_start_matches('.').to_lowercase());
    }
    PathBuf::from(normalize_component(artist))
        .join(normalize_component(album))
        .join(file_name)
}

/// Lowercase extension of a file name, without the dot. Empty when the name
/// has no dot.
pub fn file_extension(name: &str) -> String {
    match name.rfind('.') {
        Some(idx) => name[idx + 1..].to_lowercase(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn track_id_is_deterministic_and_order_sensitive() {
        let first = track_id("Muse", "Absolution", "Hysteria");
        let second = track_id("Muse", "Absolution", "Hysteria");
        assert_eq!(first, second);
        assert_ne!(first, track_id("Hysteria", "Absolution", "Muse"));
    }

    #[test]
    fn track_id_ignores_letter_case() {
        assert_eq!(
            track_id("MUSE", "Absolution", "hysteria"),
            track_id("muse", "absolution", "Hysteria")
        );
    }

    #[test]
    fn tracks_with_equal_id_are_equal() {
        let a = Track::new(
            "Muse".into(),
            "Absolution".into(),
            "Hysteria".into(),
            PathBuf::from("/srv/a.mp3"),
        );
        let b = Track::new(
            "muse".into(),
            "absolution".into(),
            "hysteria".into(),
            PathBuf::from("/srv/b.mp3"),
        );
        assert_eq!(a, b);
    }

    #[test]
    fn canonical_relpath_normalizes_components() {
        let rel = canonical_relpath("Aphex Twin", "Selected Ambient Works", "Xtal", ".MP3");
        assert_eq!(
            rel,
            PathBuf::from("aphex_twin/selected_ambient_works/xtal.mp3")
        );
    }

    #[test]
    fn tag_components_cannot_climb_out_of_the_database_tree() {
        assert_eq!(normalize_component("../../Outside"), ".._.._outside");
        assert_eq!(normalize_component(".."), "_");
        assert_eq!(normalize_component("."), "_");
        assert_eq!(normalize_component(""), "_");
        assert_eq!(normalize_component("a\\b/c"), "a_b_c");

        let rel = canonical_relpath("../../Outside", "Album", "Song", "mp3");
        assert_eq!(rel.components().count(), 3);
        assert_eq!(rel, PathBuf::from(".._.._outside/album/song.mp3"));
    }

    #[test]
    fn extension_allowlist_is_case_insensitive() {
        assert!(is_supported_extension("mp3"));
        assert!(is_supported_extension(".FLAC"));
        assert!(!is_supported_extension("txt"));
        assert!(!is_supported_extension(""));
    }

    #[test]
    fn file_extension_handles_missing_dot() {
        assert_eq!(file_extension("song.Mp3"), "mp3");
        assert_eq!(file_extension("song"), "");
        assert_eq!(file_extension("a.b.flac"), "flac");
    }
}
