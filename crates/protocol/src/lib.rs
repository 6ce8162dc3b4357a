use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use common::{file_extension, Track};
use tracing::debug;

/// Transfer buffer size. Not part of the wire contract; only the declared
/// length is.
const CHUNK_SIZE: usize = 8 * 1024;

/// Control-channel message kinds, sent as 4-byte big-endian codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    Disconnect = 0,
    Ack = 1,
    Test = 2,
    Library = 3,
    DatabaseRetrieve = 4,
    DatabaseAdd = 5,
    DatabaseStream = 6,
}

impl Command {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Command::Disconnect),
            1 => Some(Command::Ack),
            2 => Some(Command::Test),
            3 => Some(Command::Library),
            4 => Some(Command::DatabaseRetrieve),
            5 => Some(Command::DatabaseAdd),
            6 => Some(Command::DatabaseStream),
            _ => None,
        }
    }
}

/// Catalog entry as it crosses the wire: four strings per track, in index
/// order. No object graphs, no versioned serialization.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrackEntry {
    pub artist: String,
    pub album: String,
    pub title: String,
    pub path: String,
}

#[derive(Debug)]
pub enum ProtocolError {
    Io(io::Error),
    UnknownCommand(i32),
    /// Declared payload length above the configured maximum. Raised before
    /// any payload byte is read; the caller tears the connection down.
    Oversized {
        declared: u64,
        max: u64,
    },
    BadString(std::string::FromUtf8Error),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::Io(err) => write!(f, "io error: {}", err),
            ProtocolError::UnknownCommand(code) => write!(f, "unknown command code {}", code),
            ProtocolError::Oversized { declared, max } => {
                write!(f, "declared length {} exceeds maximum {}", declared, max)
            }
            ProtocolError::BadString(err) => write!(f, "invalid utf-8 string: {}", err),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<io::Error> for ProtocolError {
    fn from(err: io::Error) -> Self {
        ProtocolError::Io(err)
    }
}

impl From<std::string::FromUtf8Error> for ProtocolError {
    fn from(err: std::string::FromUtf8Error) -> Self {
        ProtocolError::BadString(err)
    }
}

/// One bidirectional byte stream with the framing primitives: big-endian
/// integers, command codes, length-prefixed strings and length-prefixed file
/// payloads. Reads and writes within one channel are strictly ordered; the
/// writer flushes around every payload so the peer never blocks on buffered
/// bytes.
pub struct FramedChannel {
    peer: SocketAddr,
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
    max_transfer: u64,
}

impl FramedChannel {
    pub fn new(stream: TcpStream, max_transfer: u64) -> io::Result<Self> {
        let peer = stream.peer_addr()?;
        let reader = BufReader::new(stream.try_clone()?);
        let writer = BufWriter::new(stream);
        Ok(Self {
            peer,
            reader,
            writer,
            max_transfer,
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.writer.get_ref().set_read_timeout(timeout)
    }

    /// Closes both directions of the underlying socket. Blocked reads on the
    /// other half return immediately.
    pub fn close(&self) {
        let _ = self.writer.get_ref().shutdown(Shutdown::Both);
    }

    pub fn read_i32(&mut self) -> Result<i32, ProtocolError> {
        let mut buf = [0u8; 4];
        self.reader.read_exact(&mut buf)?;
        Ok(i32::from_be_bytes(buf))
    }

    pub fn write_i32(&mut self, value: i32) -> Result<(), ProtocolError> {
        self.writer.write_all(&value.to_be_bytes())?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn read_command(&mut self) -> Result<Command, ProtocolError> {
        let code = self.read_i32()?;
        Command::from_code(code).ok_or(ProtocolError::UnknownCommand(code))
    }

    pub fn write_command(&mut self, command: Command) -> Result<(), ProtocolError> {
        self.write_i32(command.code())
    }

    fn read_u64(&mut self) -> Result<u64, ProtocolError> {
        let mut buf = [0u8; 8];
        self.reader.read_exact(&mut buf)?;
        Ok(u64::from_be_bytes(buf))
    }

    fn write_u64(&mut self, value: u64) -> Result<(), ProtocolError> {
        self.writer.write_all(&value.to_be_bytes())?;
        Ok(())
    }

    /// Strings travel as a u16 big-endian byte length plus UTF-8 bytes.
    pub fn read_string(&mut self) -> Result<String, ProtocolError> {
        let mut len_buf = [0u8; 2];
        self.reader.read_exact(&mut len_buf)?;
        let len = u16::from_be_bytes(len_buf) as usize;
        let mut buf = vec![0u8; len];
        self.reader.read_exact(&mut buf)?;
        Ok(String::from_utf8(buf)?)
    }

    pub fn write_string(&mut self, value: &str) -> Result<(), ProtocolError> {
        let bytes = value.as_bytes();
        if bytes.len() > u16::MAX as usize {
            return Err(ProtocolError::Oversized {
                declared: bytes.len() as u64,
                max: u16::MAX as u64,
            });
        }
        self.writer
            .write_all(&(bytes.len() as u16).to_be_bytes())?;
        self.writer.write_all(bytes)?;
        self.writer.flush()?;
        Ok(())
    }

    /// Receives one framed file into `dest_dir`. The destination name is the
    /// caller's when identity is known, otherwise a timestamp. Reads stop at
    /// exactly the declared length even if more bytes are already buffered,
    /// so the next message on the channel stays intact.
    pub fn read_file(
        &mut self,
        dest_dir: &Path,
        name: Option<&str>,
    ) -> Result<PathBuf, ProtocolError> {
        let ext = self.read_string()?;
        let declared = self.read_u64()?;
        if declared > self.max_transfer {
            return Err(ProtocolError::Oversized {
                declared,
                max: self.max_transfer,
            });
        }

        let file_name = match name {
            Some(name) => name.to_string(),
            None => format!("{}{}", timestamp_name(), ext),
        };
        let dest = dest_dir.join(file_name);
        let mut out = BufWriter::new(File::create(&dest)?);

        let mut remaining = declared;
        let mut buf = [0u8; CHUNK_SIZE];
        while remaining > 0 {
            let want = remaining.min(CHUNK_SIZE as u64) as usize;
            let got = self.reader.read(&mut buf[..want])?;
            if got == 0 {
                return Err(ProtocolError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream ended mid-transfer",
                )));
            }
            out.write_all(&buf[..got])?;
            remaining -= got as u64;
        }
        out.flush()?;
        debug!("received {} bytes into {}", declared, dest.display());
        Ok(dest)
    }

    /// Sends one file with the transfer framing: extension string, 8-byte
    /// big-endian length, then the payload in bounded chunks.
    pub fn write_file(&mut self, path: &Path) -> Result<u64, ProtocolError> {
        let len = path.metadata()?.len();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let ext = file_extension(&name);
        let ext = if ext.is_empty() {
            String::new()
        } else {
            format!(".{}", ext)
        };

        self.write_string(&ext)?;
        self.write_u64(len)?;
        self.writer.flush()?;

        let sent = self.copy_chunks(path, Some(len))?;
        self.writer.flush()?;
        debug!("sent {} bytes from {}", sent, path.display());
        Ok(sent)
    }

    /// Raw unframed copy of a file, for continuous playback rather than a
    /// discrete download. The peer reads until the channel closes.
    pub fn stream_file(&mut self, path: &Path) -> Result<u64, ProtocolError> {
        let sent = self.copy_chunks(path, None)?;
        self.writer.flush()?;
        Ok(sent)
    }

    /// Drains the channel until the peer closes it, collecting the raw
    /// bytes. Counterpart of [`FramedChannel::stream_file`].
    pub fn read_raw_to_end(&mut self, out: &mut Vec<u8>) -> Result<u64, ProtocolError> {
        let got = self.reader.read_to_end(out)?;
        Ok(got as u64)
    }

    fn copy_chunks(&mut self, path: &Path, limit: Option<u64>) -> Result<u64, ProtocolError> {
        let mut file = BufReader::new(File::open(path)?);
        let mut buf = [0u8; CHUNK_SIZE];
        let mut sent: u64 = 0;
        loop {
            // Each read is clamped to the budget left, so a file that grows
            // mid-transfer can never push bytes past the declared length.
            let want = match limit {
                Some(limit) if sent >= limit => break,
                Some(limit) => (limit - sent).min(CHUNK_SIZE as u64) as usize,
                None => CHUNK_SIZE,
            };
            let got = file.read(&mut buf[..want])?;
            if got == 0 {
                break;
            }
            self.writer.write_all(&buf[..got])?;
            sent += got as u64;
        }
        Ok(sent)
    }

    /// Writes the whole catalog: a count, then four strings per track.
    pub fn write_library(&mut self, tracks: &[Track]) -> Result<(), ProtocolError> {
        self.write_i32(tracks.len() as i32)?;
        for track in tracks {
            self.write_string(track.artist())?;
            self.write_string(track.album())?;
            self.write_string(track.title())?;
            self.write_string(&track.path().to_string_lossy())?;
        }
        self.writer.flush()?;
        Ok(())
    }

    pub fn read_library(&mut self) -> Result<Vec<TrackEntry>, ProtocolError> {
        let count = self.read_i32()?;
        let mut entries = Vec::with_capacity(count.max(0) as usize);
        for _ in 0..count {
            entries.push(TrackEntry {
                artist: self.read_string()?,
                album: self.read_string()?,
                title: self.read_string()?,
                path: self.read_string()?,
            });
        }
        Ok(entries)
    }
}

fn timestamp_name() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("upload-{}", nanos)
}
