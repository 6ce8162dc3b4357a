use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use common::{canonical_relpath, file_extension, is_supported_extension, track_id, Track};
use metadata::{TagInfo, TagReader};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

pub mod index;

use index::TrackIndex;

/// Owns the staging folder and the canonical database folder.
///
/// The `database` tree is exclusively program-managed and is never edited by
/// hand. Files to be catalogued land in `download` (uploads from clients, or
/// files dropped there manually) and stay only until the next update cycle
/// promotes or rejects them. A rejected file is deleted outright rather than
/// quarantined; that keeps the staging area clean at the cost of losing bad
/// uploads.
pub struct Storage {
    database: PathBuf,
    download: PathBuf,
    reader: Arc<dyn TagReader>,
    index: Mutex<TrackIndex>,
}

#[derive(Debug)]
pub enum StorageError {
    /// The server folder does not exist, so the backing drive is likely not
    /// mounted. Creating it here would silently catalog into the wrong disk.
    RootMissing(PathBuf),
    CreateFolder(PathBuf, std::io::Error),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::RootMissing(path) => {
                write!(f, "server folder {} does not exist", path.display())
            }
            StorageError::CreateFolder(path, err) => {
                write!(f, "error creating {}: {}", path.display(), err)
            }
        }
    }
}

impl std::error::Error for StorageError {}

impl Storage {
    /// Opens the storage roots under `root`, creating the database and
    /// download folders if absent, then performs the cold load: a balanced
    /// index build from the database tree followed by a full update sweep
    /// to promote anything left in staging from a previous run.
    pub fn open(root: &Path, reader: Arc<dyn TagReader>) -> Result<Self, StorageError> {
        if !root.exists() {
            return Err(StorageError::RootMissing(root.to_path_buf()));
        }

        let database = root.join("database");
        let download = root.join("download");
        for folder in [&database, &download] {
            fs::create_dir_all(folder)
                .map_err(|err| StorageError::CreateFolder(folder.clone(), err))?;
        }
        debug!("storage folders ready under {}", root.display());

        let storage = Self {
            database,
            download,
            reader,
            index: Mutex::new(TrackIndex::new()),
        };

        {
            let mut tracks = storage.read_database_tracks();
            tracks.sort();
            let count = tracks.len();
            *storage.index.lock() = TrackIndex::from_sorted(tracks);
            info!("cold load complete: {} tracks catalogued", count);
        }
        storage.update();

        Ok(storage)
    }

    pub fn download_path(&self) -> &Path {
        &self.download
    }

    pub fn database_path(&self) -> &Path {
        &self.database
    }

    /// Promotes staged files into the database and brings the index up to
    /// date. The lock is held across both phases, so readers never observe
    /// a database/index mismatch and concurrent updates cannot interleave
    /// their move/insert sequences.
    pub fn update(&self) {
        let mut index = self.index.lock();
        self.update_database();
        self.update_tree(&mut index);
    }

    /// Ordered snapshot of the whole catalog, ascending by id.
    pub fn library(&self) -> Vec<Track> {
        let index = self.index.lock();
        index.in_order().into_iter().cloned().collect()
    }

    pub fn find(&self, artist: &str, album: &str, title: &str) -> Option<Track> {
        let id = track_id(artist, album, title);
        let index = self.index.lock();
        index.find(&id).cloned()
    }

    pub fn track_count(&self) -> usize {
        self.index.lock().len()
    }

    /// Validates and moves every regular file currently in staging. Files
    /// that fail validation are deleted and the remaining files still get
    /// their chance; a bad upload no longer blocks good ones staged in the
    /// same cycle. Afterwards the leftover (now empty) staging directories
    /// are purged, unless an unexpected file survived the pass.
    fn update_database(&self) {
        debug!("updating database from {}", self.download.display());

        for staged in list_files(&self.download) {
            let name = staged
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let ext = file_extension(&name);

            if !is_supported_extension(&ext) {
                warn!(
                    "{} is not a supported audio file, deleting",
                    staged.display()
                );
                remove_staged(&staged);
                continue;
            }

            let tags = match self.reader.read_tags(&staged) {
                Ok(tags) => tags,
                Err(err) => {
                    warn!("could not read tags from {}: {}", staged.display(), err);
                    TagInfo::default()
                }
            };
            let (Some(artist), Some(album), Some(title)) = (tags.artist, tags.album, tags.title)
            else {
                warn!(
                    "{} is missing artist, album or title tags, deleting",
                    staged.display()
                );
                remove_staged(&staged);
                continue;
            };

            let target = self
                .database
                .join(canonical_relpath(&artist, &album, &title, &ext));
            if let Some(parent) = target.parent() {
                if let Err(err) = fs::create_dir_all(parent) {
                    error!("error creating {}: {}", parent.display(), err);
                    continue;
                }
            }
            // Overwrite on collision, same as the rest of the catalog: equal
            // tags mean the same entry. A failed move leaves the file where
            // it is for the next cycle.
            match fs::rename(&staged, &target) {
                Ok(()) => debug!("promoted {} -> {}", staged.display(), target.display()),
                Err(err) => error!("error moving {}: {}", staged.display(), err),
            }
        }

        let leftovers = list_files(&self.download);
        if !leftovers.is_empty() {
            for file in &leftovers {
                error!("{} remained after the staging sweep", file.display());
            }
            error!("staging cleanup cancelled, leftover files present");
            return;
        }

        if let Ok(entries) = fs::read_dir(&self.download) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    if let Err(err) = fs::remove_dir_all(&path) {
                        error!("error removing {}: {}", path.display(), err);
                    }
                }
            }
        }
    }

    /// Adds database files the index does not know about yet. New arrivals
    /// are sorted by id before the batch insert.
    fn update_tree(&self, index: &mut TrackIndex) {
        let known: HashSet<PathBuf> = index
            .in_order()
            .iter()
            .map(|track| track.path().to_path_buf())
            .collect();

        let mut fresh: Vec<Track> = Vec::new();
        for path in list_files(&self.database) {
            if known.contains(&path) {
                continue;
            }
            match self.build_track(&path) {
                Some(track) => fresh.push(track),
                None => warn!(
                    "{} is in the database but its tags are unreadable, skipping",
                    path.display()
                ),
            }
        }
        if fresh.is_empty() {
            return;
        }

        fresh.sort();
        info!("indexing {} new tracks", fresh.len());
        index.insert_sorted(fresh);
    }

    fn read_database_tracks(&self) -> Vec<Track> {
        let mut tracks = Vec::new();
        for path in list_files(&self.database) {
            if let Some(track) = self.build_track(&path) {
                tracks.push(track);
            }
        }
        tracks
    }

    fn build_track(&self, path: &Path) -> Option<Track> {
        let tags = self.reader.read_tags(path).ok()?;
        let (Some(artist), Some(album), Some(title)) = (tags.artist, tags.album, tags.title)
        else {
            return None;
        };
        Some(Track::new(artist, album, title, path.to_path_buf()))
    }
}

/// Every regular file below `root`, recursively; directories are excluded.
/// Sorted so update cycles visit files in a stable order.
fn list_files(root: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) if entry.file_type().is_file() => Some(entry.into_path()),
            Ok(_) => None,
            Err(err) => {
                warn!("error walking {}: {}", root.display(), err);
                None
            }
        })
        .collect();
    files.sort();
    files
}

fn remove_staged(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        error!("error deleting {}: {}", path.display(), err);
    }
}

#[cfg(test)]
mod tests {
    use metadata::MetadataError;
    use tempfile::TempDir;

    use super::*;

    /// Reads tags from the file's own text: artist, album and title on the
    /// first three lines. Promotion renames files, so the tags must travel
    /// with the content, just as real tags do.
    struct LineReader;

    impl TagReader for LineReader {
        fn read_tags(&self, path: &Path) -> Result<TagInfo, MetadataError> {
            let text = fs::read_to_string(path).unwrap_or_default();
            let mut lines = text.lines();
            Ok(TagInfo {
                artist: field(lines.next()),
                album: field(lines.next()),
                title: field(lines.next()),
            })
        }
    }

    fn field(line: Option<&str>) -> Option<String> {
        line.map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    }

    fn open(root: &TempDir) -> Storage {
        Storage::open(root.path(), Arc::new(LineReader)).unwrap()
    }

    fn tagged(artist: &str, album: &str, title: &str) -> String {
        format!("{}\n{}\n{}\n", artist, album, title)
    }

    fn stage(storage: &Storage, name: &str, content: &str) -> PathBuf {
        let path = storage.download_path().join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn open_requires_an_existing_root() {
        let root = TempDir::new().unwrap();
        let missing = root.path().join("absent");
        let result = Storage::open(&missing, Arc::new(LineReader));
        assert!(matches!(result, Err(StorageError::RootMissing(_))));
    }

    #[test]
    fn promotion_moves_the_file_to_its_canonical_path() {
        let root = TempDir::new().unwrap();
        let storage = open(&root);

        let staged = stage(
            &storage,
            "up.mp3",
            &tagged("Aphex Twin", "Drukqs", "Avril 14th"),
        );
        storage.update();

        assert!(!staged.exists());
        let target = storage
            .database_path()
            .join("aphex_twin/drukqs/avril_14th.mp3");
        assert!(target.exists());
        let track = storage.find("Aphex Twin", "Drukqs", "Avril 14th").unwrap();
        assert_eq!(track.path(), target);
        assert_eq!(storage.track_count(), 1);
    }

    #[test]
    fn repeat_update_with_nothing_staged_is_idempotent() {
        let root = TempDir::new().unwrap();
        let storage = open(&root);
        stage(&storage, "up.mp3", &tagged("Muse", "Absolution", "Hysteria"));

        storage.update();
        let first = storage.library();
        storage.update();
        assert_eq!(storage.library(), first);
        assert_eq!(storage.track_count(), 1);
    }

    #[test]
    fn unsupported_extension_is_deleted_without_blocking_others() {
        let root = TempDir::new().unwrap();
        let storage = open(&root);

        let bad = stage(&storage, "notes.txt", "just some notes");
        stage(&storage, "good.flac", &tagged("Nirvana", "In Utero", "Dumb"));
        storage.update();

        assert!(!bad.exists());
        assert_eq!(storage.track_count(), 1);
        assert!(storage.find("Nirvana", "In Utero", "Dumb").is_some());
    }

    #[test]
    fn missing_tag_fields_reject_the_file() {
        let root = TempDir::new().unwrap();
        let storage = open(&root);

        let staged = stage(&storage, "untagged.mp3", "\n\nOnly A Title\n");
        storage.update();

        assert!(!staged.exists());
        assert_eq!(storage.track_count(), 0);
        assert!(list_files(storage.database_path()).is_empty());
    }

    #[test]
    fn empty_staging_directories_are_purged() {
        let root = TempDir::new().unwrap();
        let storage = open(&root);

        stage(
            &storage,
            "batch/disc1/deep.mp3",
            &tagged("Boards of Canada", "Geogaddi", "Gyroscope"),
        );
        storage.update();

        assert!(!storage.download_path().join("batch").exists());
        assert_eq!(storage.track_count(), 1);
    }

    #[test]
    fn leftover_files_cancel_staging_cleanup() {
        let root = TempDir::new().unwrap();
        let storage = open(&root);

        // A plain file squatting on the canonical artist folder makes the
        // promotion's create_dir_all fail, so the staged file stays put.
        fs::write(storage.database_path().join("muse"), b"in the way").unwrap();
        let staged = stage(
            &storage,
            "batch/song.mp3",
            &tagged("Muse", "Absolution", "Hysteria"),
        );
        storage.update();

        assert!(staged.exists());
        assert!(storage.download_path().join("batch").exists());
        assert_eq!(storage.track_count(), 0);
    }

    #[test]
    fn traversal_tags_stay_inside_the_database_root() {
        let root = TempDir::new().unwrap();
        let storage = open(&root);

        stage(
            &storage,
            "evil.mp3",
            &tagged("../../outside", "album", "song"),
        );
        storage.update();

        assert!(!root.path().join("outside").exists());
        assert!(storage
            .database_path()
            .join(".._.._outside/album/song.mp3")
            .exists());
        assert_eq!(storage.track_count(), 1);
        let track = storage.find("../../outside", "album", "song").unwrap();
        assert!(track.path().starts_with(storage.database_path()));
    }

    #[test]
    fn cold_load_indexes_an_existing_database() {
        let root = TempDir::new().unwrap();
        let db = root.path().join("database");
        fs::create_dir_all(db.join("loose")).unwrap();
        for (name, content) in [
            ("xtal.mp3", tagged("Aphex Twin", "SAW 85-92", "Xtal")),
            ("dumb.mp3", tagged("Nirvana", "In Utero", "Dumb")),
            ("hysteria.mp3", tagged("Muse", "Absolution", "Hysteria")),
        ] {
            fs::write(db.join("loose").join(name), content).unwrap();
        }

        let storage = open(&root);
        assert_eq!(storage.track_count(), 3);
        let ids: Vec<String> = storage
            .library()
            .iter()
            .map(|t| t.id().to_string())
            .collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }

    #[test]
    fn duplicate_identity_keeps_a_single_entry() {
        let root = TempDir::new().unwrap();
        let storage = open(&root);

        stage(&storage, "one.mp3", &tagged("Muse", "Absolution", "Hysteria"));
        storage.update();
        stage(&storage, "two.mp3", &tagged("muse", "absolution", "hysteria"));
        storage.update();

        assert_eq!(storage.track_count(), 1);
    }
}
