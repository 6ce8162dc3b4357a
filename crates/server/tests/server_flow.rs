//! End-to-end exercises of the wire protocol against a real server on
//! loopback listeners with ephemeral ports.

use std::fs;
use std::net::TcpStream;
use std::path::Path;
use std::sync::Arc;

use client::Client;
use library::Storage;
use metadata::{MetadataError, TagInfo, TagReader};
use protocol::{Command, FramedChannel};
use server::config::ServerConfig;
use server::manager::Server;
use server::session::ServerContext;
use tempfile::TempDir;

const MAX_TRANSFER: u64 = 1024 * 1024;

/// Reads tags from the file's own text: artist, album and title on the
/// first three lines. Keeps the tests independent of real audio files.
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

fn start_server(root: &TempDir, aux_attach_timeout_secs: u64) -> Server {
    let config = ServerConfig {
        control_port: 0,
        max_transfer_bytes: MAX_TRANSFER,
        aux_attach_timeout_secs,
        ..ServerConfig::default()
    };
    let storage = Storage::open(root.path(), Arc::new(LineReader)).unwrap();
    Server::start(ServerContext {
        storage: Arc::new(storage),
        config,
    })
    .unwrap()
}

fn connect(server: &Server) -> Client {
    Client::connect("127.0.0.1", server.ports().control, MAX_TRANSFER).unwrap()
}

fn song_bytes(artist: &str, album: &str, title: &str) -> Vec<u8> {
    let mut bytes = format!("{}\n{}\n{}\n", artist, album, title).into_bytes();
    bytes.extend(std::iter::repeat(0x55u8).take(4096).map(|b| b ^ 0x2a));
    bytes
}

#[test]
fn upload_catalog_and_retrieve_round_trip() {
    let root = TempDir::new().unwrap();
    let mut server = start_server(&root, 10);
    let mut client = connect(&server);

    client.test().unwrap();
    assert!(client.library().unwrap().is_empty());

    let upload_dir = TempDir::new().unwrap();
    let song = upload_dir.path().join("hysteria.mp3");
    let bytes = song_bytes("Muse", "Absolution", "Hysteria");
    fs::write(&song, &bytes).unwrap();

    let sent = client.add(&song).unwrap();
    assert_eq!(sent, bytes.len() as u64);

    let listing = client.library().unwrap();
    assert_eq!(listing.len(), 1);
    assert_eq!(listing[0].artist, "Muse");
    assert!(listing[0].path.ends_with("muse/absolution/hysteria.mp3"));

    let dest = TempDir::new().unwrap();
    let saved = client
        .retrieve("Muse", "Absolution", "Hysteria", dest.path())
        .unwrap()
        .unwrap();
    assert_eq!(fs::read(&saved).unwrap(), bytes);

    assert!(client
        .retrieve("Muse", "Absolution", "Unintended", dest.path())
        .unwrap()
        .is_none());

    client.disconnect().unwrap();
    server.shutdown();
}

#[test]
fn streaming_sends_the_raw_payload() {
    let root = TempDir::new().unwrap();
    let mut server = start_server(&root, 10);
    let mut client = connect(&server);

    let upload_dir = TempDir::new().unwrap();
    let song = upload_dir.path().join("dumb.flac");
    let bytes = song_bytes("Nirvana", "In Utero", "Dumb");
    fs::write(&song, &bytes).unwrap();
    client.add(&song).unwrap();

    let streamed = client.stream("Nirvana", "In Utero", "Dumb").unwrap().unwrap();
    assert_eq!(streamed, bytes);

    assert!(client.stream("Nirvana", "In Utero", "Moist").unwrap().is_none());

    client.disconnect().unwrap();
    server.shutdown();
}

#[test]
fn rejected_upload_never_reaches_the_catalog() {
    let root = TempDir::new().unwrap();
    let mut server = start_server(&root, 10);
    let mut client = connect(&server);

    let upload_dir = TempDir::new().unwrap();
    let untagged = upload_dir.path().join("untagged.mp3");
    fs::write(&untagged, b"\n\n\nnoise").unwrap();
    client.add(&untagged).unwrap();

    assert!(client.library().unwrap().is_empty());

    client.disconnect().unwrap();
    server.shutdown();
}

#[test]
fn unknown_commands_leave_the_session_usable() {
    let root = TempDir::new().unwrap();
    let mut server = start_server(&root, 10);

    let stream = TcpStream::connect(("127.0.0.1", server.ports().control)).unwrap();
    let mut control = FramedChannel::new(stream, MAX_TRANSFER).unwrap();
    assert_eq!(control.read_command().unwrap(), Command::Ack);

    control.write_i32(99).unwrap();
    control.write_command(Command::Test).unwrap();
    assert_eq!(control.read_command().unwrap(), Command::Ack);

    control.write_command(Command::Library).unwrap();
    assert_eq!(control.read_i32().unwrap(), 0);

    control.write_command(Command::Disconnect).unwrap();
    server.shutdown();
}

#[test]
fn retrieve_without_an_attached_channel_times_out_with_a_miss() {
    let root = TempDir::new().unwrap();
    let db = root.path().join("database");
    fs::create_dir_all(&db).unwrap();
    fs::write(
        db.join("xtal.mp3"),
        song_bytes("Aphex Twin", "SAW 85-92", "Xtal"),
    )
    .unwrap();

    let mut server = start_server(&root, 1);

    let stream = TcpStream::connect(("127.0.0.1", server.ports().control)).unwrap();
    let mut control = FramedChannel::new(stream, MAX_TRANSFER).unwrap();
    assert_eq!(control.read_command().unwrap(), Command::Ack);

    control.write_command(Command::DatabaseRetrieve).unwrap();
    control.write_string("Aphex Twin").unwrap();
    control.write_string("SAW 85-92").unwrap();
    control.write_string("Xtal").unwrap();

    // The track exists, but no retrieve channel ever attaches.
    assert_eq!(control.read_i32().unwrap(), 0);

    control.write_command(Command::Disconnect).unwrap();
    server.shutdown();
}

#[test]
fn cold_loaded_tracks_are_served_after_restart() {
    let root = TempDir::new().unwrap();

    {
        let mut server = start_server(&root, 10);
        let mut client = connect(&server);
        let upload_dir = TempDir::new().unwrap();
        let song = upload_dir.path().join("gyroscope.ogg");
        fs::write(&song, song_bytes("Boards of Canada", "Geogaddi", "Gyroscope")).unwrap();
        client.add(&song).unwrap();
        assert_eq!(client.library().unwrap().len(), 1);
        client.disconnect().unwrap();
        server.shutdown();
    }

    let mut server = start_server(&root, 10);
    let mut client = connect(&server);
    let listing = client.library().unwrap();
    assert_eq!(listing.len(), 1);
    assert_eq!(listing[0].title, "Gyroscope");
    client.disconnect().unwrap();
    server.shutdown();
}
