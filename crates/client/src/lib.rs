//! Blocking client for the media server. One control connection carries
//! commands; add, retrieve and stream connections are opened on demand
//! against the three ports that follow the control port.

use std::io;
use std::net::TcpStream;
use std::path::{Path, PathBuf};

use protocol::{Command, FramedChannel, ProtocolError, TrackEntry};
use tracing::debug;

const ADD_PORT_OFFSET: u16 = 1;
const RETRIEVE_PORT_OFFSET: u16 = 2;
const STREAM_PORT_OFFSET: u16 = 3;

#[derive(Debug)]
pub enum ClientError {
    Protocol(ProtocolError),
    /// The server answered the handshake with something other than ACK.
    Handshake(Command),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Protocol(err) => write!(f, "protocol error: {}", err),
            ClientError::Handshake(command) => {
                write!(f, "expected ACK from the server, got {:?}", command)
            }
        }
    }
}

impl std::error::Error for ClientError {}

impl From<ProtocolError> for ClientError {
    fn from(err: ProtocolError) -> Self {
        ClientError::Protocol(err)
    }
}

impl From<io::Error> for ClientError {
    fn from(err: io::Error) -> Self {
        ClientError::Protocol(ProtocolError::Io(err))
    }
}

pub struct Client {
    host: String,
    control_port: u16,
    max_transfer: u64,
    control: FramedChannel,
    add: Option<FramedChannel>,
    retrieve: Option<FramedChannel>,
}

impl Client {
    /// Connects the control channel and completes the ACK handshake. The
    /// auxiliary channels are connected lazily by the operations that
    /// need them.
    pub fn connect(host: &str, control_port: u16, max_transfer: u64) -> Result<Self, ClientError> {
        let control = open_channel(host, control_port, max_transfer)?;
        debug!("control channel open to {}:{}", host, control_port);
        Ok(Self {
            host: host.to_string(),
            control_port,
            max_transfer,
            control,
            add: None,
            retrieve: None,
        })
    }

    /// Round-trips a TEST command.
    pub fn test(&mut self) -> Result<(), ClientError> {
        self.control.write_command(Command::Test)?;
        expect_ack(&mut self.control)
    }

    /// Fetches the full catalog listing.
    pub fn library(&mut self) -> Result<Vec<TrackEntry>, ClientError> {
        self.control.write_command(Command::Library)?;
        Ok(self.control.read_library()?)
    }

    /// Uploads a file for cataloguing. The add channel is attached before
    /// the command is sent, so the server never waits for it.
    pub fn add(&mut self, path: &Path) -> Result<u64, ClientError> {
        self.ensure_add()?;
        self.control.write_command(Command::DatabaseAdd)?;
        let Some(channel) = self.add.as_mut() else {
            return Err(not_connected("add"));
        };
        Ok(channel.write_file(path)?)
    }

    /// Downloads a track into `dest_dir`; the saved name carries the
    /// track's extension. Returns `None` when the server does not know
    /// the track.
    pub fn retrieve(
        &mut self,
        artist: &str,
        album: &str,
        title: &str,
        dest_dir: &Path,
    ) -> Result<Option<PathBuf>, ClientError> {
        self.ensure_retrieve()?;
        self.control.write_command(Command::DatabaseRetrieve)?;
        self.write_identity(artist, album, title)?;
        if self.control.read_i32()? == 0 {
            return Ok(None);
        }
        let Some(channel) = self.retrieve.as_mut() else {
            return Err(not_connected("retrieve"));
        };
        Ok(Some(channel.read_file(dest_dir, None)?))
    }

    /// Streams a track's raw bytes. The stream connection is one-shot:
    /// the server closes it when the payload ends, so a fresh one is
    /// opened per call. Returns `None` when the track is unknown.
    pub fn stream(
        &mut self,
        artist: &str,
        album: &str,
        title: &str,
    ) -> Result<Option<Vec<u8>>, ClientError> {
        let mut channel = open_channel(
            &self.host,
            self.control_port.saturating_add(STREAM_PORT_OFFSET),
            self.max_transfer,
        )?;
        self.control.write_command(Command::DatabaseStream)?;
        self.write_identity(artist, album, title)?;
        if self.control.read_i32()? == 0 {
            channel.close();
            return Ok(None);
        }
        let mut bytes = Vec::new();
        channel.read_raw_to_end(&mut bytes)?;
        Ok(Some(bytes))
    }

    /// Tells the server to end the session and closes every channel.
    pub fn disconnect(mut self) -> Result<(), ClientError> {
        self.control.write_command(Command::Disconnect)?;
        self.control.close();
        if let Some(channel) = self.add.take() {
            channel.close();
        }
        if let Some(channel) = self.retrieve.take() {
            channel.close();
        }
        Ok(())
    }

    fn write_identity(&mut self, artist: &str, album: &str, title: &str) -> Result<(), ClientError> {
        self.control.write_string(artist)?;
        self.control.write_string(album)?;
        self.control.write_string(title)?;
        Ok(())
    }

    fn ensure_add(&mut self) -> Result<(), ClientError> {
        if self.add.is_none() {
            let port = self.control_port.saturating_add(ADD_PORT_OFFSET);
            self.add = Some(open_channel(&self.host, port, self.max_transfer)?);
            debug!("add channel open to {}:{}", self.host, port);
        }
        Ok(())
    }

    fn ensure_retrieve(&mut self) -> Result<(), ClientError> {
        if self.retrieve.is_none() {
            let port = self.control_port.saturating_add(RETRIEVE_PORT_OFFSET);
            self.retrieve = Some(open_channel(&self.host, port, self.max_transfer)?);
            debug!("retrieve channel open to {}:{}", self.host, port);
        }
        Ok(())
    }
}

fn not_connected(label: &str) -> ClientError {
    ClientError::Protocol(ProtocolError::Io(io::Error::new(
        io::ErrorKind::NotConnected,
        format!("{} channel is not connected", label),
    )))
}

/// Connects a socket and waits for the server's ACK greeting.
fn open_channel(host: &str, port: u16, max_transfer: u64) -> Result<FramedChannel, ClientError> {
    let stream = TcpStream::connect((host, port))?;
    let mut channel = FramedChannel::new(stream, max_transfer)?;
    expect_ack(&mut channel)?;
    Ok(channel)
}

fn expect_ack(channel: &mut FramedChannel) -> Result<(), ClientError> {
    match channel.read_command()? {
        Command::Ack => Ok(()),
        other => Err(ClientError::Handshake(other)),
    }
}
