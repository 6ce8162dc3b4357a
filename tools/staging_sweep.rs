use std::env;
use std::path::Path;
use std::sync::Arc;

use library::Storage;
use metadata::LoftyReader;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let root = env::args()
        .nth(1)
        .or_else(|| env::var("LYREBIRD_ROOT").ok())
        .ok_or("LYREBIRD_ROOT not set and no path argument")?;

    // open() runs a full update cycle, promoting anything staged.
    let storage = Storage::open(Path::new(&root), Arc::new(LoftyReader))?;

    println!("Catalogued: {} tracks", storage.track_count());
    for track in storage.library() {
        println!("{} / {} / {}", track.artist(), track.album(), track.title());
    }

    Ok(())
}
