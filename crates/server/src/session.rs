use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use library::Storage;
use parking_lot::{Condvar, Mutex, MutexGuard};
use protocol::{Command, FramedChannel, ProtocolError};
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;

/// Shared state handed to every session and accept loop.
pub struct ServerContext {
    pub storage: Arc<Storage>,
    pub config: ServerConfig,
}

/// Sessions keyed by client address. Auxiliary connections carry no
/// identifier of their own, so the source address is what ties them back
/// to the control connection that asked for them.
pub type SessionRegistry = Arc<Mutex<HashMap<IpAddr, Arc<Session>>>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuxKind {
    Add,
    Retrieve,
    Stream,
}

impl AuxKind {
    pub fn label(self) -> &'static str {
        match self {
            AuxKind::Add => "add",
            AuxKind::Retrieve => "retrieve",
            AuxKind::Stream => "stream",
        }
    }
}

/// Parking spot for one auxiliary channel. The accept loop attaches the
/// connection here and the dispatch thread blocks until it arrives.
struct AuxSlot {
    channel: Mutex<Option<FramedChannel>>,
    attached: Condvar,
}

impl AuxSlot {
    fn new() -> Self {
        Self {
            channel: Mutex::new(None),
            attached: Condvar::new(),
        }
    }

    fn attach(&self, kind: AuxKind, channel: FramedChannel) {
        let mut slot = self.channel.lock();
        if slot.is_some() {
            warn!(
                "replacing an already attached {} channel from {}",
                kind.label(),
                channel.peer()
            );
        }
        *slot = Some(channel);
        self.attached.notify_all();
    }

    /// Blocks until a channel is attached, up to `timeout`. The guard is
    /// returned so the caller can use the channel in place and leave it
    /// parked for the next command.
    fn wait(&self, timeout: Duration) -> Option<MutexGuard<'_, Option<FramedChannel>>> {
        let mut slot = self.channel.lock();
        if slot.is_none() {
            self.attached
                .wait_while_for(&mut slot, |channel| channel.is_none(), timeout);
        }
        if slot.is_some() {
            Some(slot)
        } else {
            None
        }
    }
}

/// One connected client: the control channel plus up to three auxiliary
/// channels, all from the same address. Commands are dispatched by a
/// dedicated thread reading the control channel.
pub struct Session {
    peer: IpAddr,
    control: Mutex<FramedChannel>,
    add: AuxSlot,
    retrieve: AuxSlot,
    stream: AuxSlot,
    /// Socket clones used to unblock threads parked in reads when the
    /// session is torn down from outside.
    closers: Mutex<Vec<TcpStream>>,
    open: AtomicBool,
}

impl Session {
    /// Wraps an accepted control connection. Nothing is sent yet; the
    /// caller registers the session first and then calls [`Session::start`],
    /// so auxiliary connections racing the ACK still find their session.
    pub fn new(stream: TcpStream, config: &ServerConfig) -> io::Result<Arc<Session>> {
        let peer = stream.peer_addr()?.ip();
        let closer = stream.try_clone()?;
        let channel = FramedChannel::new(stream, config.max_transfer_bytes)?;
        apply_read_timeout(&channel, config)?;

        Ok(Arc::new(Session {
            peer,
            control: Mutex::new(channel),
            add: AuxSlot::new(),
            retrieve: AuxSlot::new(),
            stream: AuxSlot::new(),
            closers: Mutex::new(vec![closer]),
            open: AtomicBool::new(true),
        }))
    }

    /// Starts the dispatch thread, which opens with the ACK greeting.
    pub fn start(
        self: &Arc<Self>,
        ctx: Arc<ServerContext>,
        registry: SessionRegistry,
    ) -> io::Result<()> {
        let runner = Arc::clone(self);
        thread::Builder::new()
            .name(format!("session-{}", self.peer))
            .spawn(move || runner.run(ctx, registry))?;
        Ok(())
    }

    pub fn peer(&self) -> IpAddr {
        self.peer
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Accepts an auxiliary connection for this session and acknowledges
    /// it, then parks it in the matching slot.
    pub fn attach(
        &self,
        kind: AuxKind,
        stream: TcpStream,
        config: &ServerConfig,
    ) -> Result<(), ProtocolError> {
        let closer = stream.try_clone()?;
        let mut channel = FramedChannel::new(stream, config.max_transfer_bytes)?;
        apply_read_timeout(&channel, config)?;
        channel.write_command(Command::Ack)?;
        self.closers.lock().push(closer);
        info!("{} channel attached for {}", kind.label(), self.peer);
        self.slot(kind).attach(kind, channel);
        Ok(())
    }

    /// Shuts down every socket the session owns. Threads blocked in reads
    /// on those sockets wake with an error and unwind normally.
    pub fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            for closer in self.closers.lock().iter() {
                let _ = closer.shutdown(Shutdown::Both);
            }
            debug!("session sockets shut down for {}", self.peer);
        }
    }

    fn slot(&self, kind: AuxKind) -> &AuxSlot {
        match kind {
            AuxKind::Add => &self.add,
            AuxKind::Retrieve => &self.retrieve,
            AuxKind::Stream => &self.stream,
        }
    }

    fn aux_timeout(&self, ctx: &ServerContext) -> Duration {
        Duration::from_secs(ctx.config.aux_attach_timeout_secs)
    }

    fn run(self: Arc<Self>, ctx: Arc<ServerContext>, registry: SessionRegistry) {
        info!("session open for {}", self.peer);
        if let Err(err) = self.control.lock().write_command(Command::Ack) {
            error!("could not acknowledge {}: {}", self.peer, err);
            self.finish(&registry);
            return;
        }

        loop {
            let command = self.control.lock().read_command();
            let result = match command {
                Ok(Command::Disconnect) => {
                    info!("{} requested disconnect", self.peer);
                    break;
                }
                Ok(Command::Test) => self.control.lock().write_command(Command::Ack),
                Ok(Command::Library) => self.handle_library(&ctx),
                Ok(Command::DatabaseAdd) => self.handle_add(&ctx),
                Ok(Command::DatabaseRetrieve) => self.handle_retrieve(&ctx),
                Ok(Command::DatabaseStream) => self.handle_stream(&ctx),
                Ok(Command::Ack) => {
                    debug!("{} sent a stray ACK, ignoring", self.peer);
                    Ok(())
                }
                Err(ProtocolError::UnknownCommand(code)) => {
                    warn!("{} sent unknown command {}, ignoring", self.peer, code);
                    Ok(())
                }
                Err(err) => {
                    if self.is_open() {
                        error!("control channel error for {}: {}", self.peer, err);
                    }
                    break;
                }
            };
            if let Err(err) = result {
                if self.is_open() {
                    error!("session error for {}: {}", self.peer, err);
                }
                break;
            }
        }

        self.finish(&registry);
        info!("session closed for {}", self.peer);
    }

    fn finish(&self, registry: &SessionRegistry) {
        self.close();
        let mut sessions = registry.lock();
        // Only remove our own entry; a newer session from the same
        // address may have replaced this one already.
        if sessions
            .get(&self.peer)
            .is_some_and(|current| std::ptr::eq(current.as_ref(), self))
        {
            sessions.remove(&self.peer);
        }
    }

    fn handle_library(&self, ctx: &ServerContext) -> Result<(), ProtocolError> {
        let tracks = ctx.storage.library();
        debug!("sending {} catalog entries to {}", tracks.len(), self.peer);
        self.control.lock().write_library(&tracks)
    }

    /// Receives one staged upload over the add channel, then runs an
    /// update cycle so the file is promoted (or rejected) immediately.
    fn handle_add(&self, ctx: &ServerContext) -> Result<(), ProtocolError> {
        let mut guard = match self.add.wait(self.aux_timeout(ctx)) {
            Some(guard) => guard,
            None => {
                warn!(
                    "{} sent DATABASE_ADD but no add channel attached in time",
                    self.peer
                );
                return Ok(());
            }
        };
        let Some(channel) = guard.as_mut() else {
            return Ok(());
        };

        match channel.read_file(ctx.storage.download_path(), None) {
            Ok(staged) => {
                info!("received {} from {}", staged.display(), self.peer);
                drop(guard);
                ctx.storage.update();
                Ok(())
            }
            Err(ProtocolError::Oversized { declared, max }) => {
                // The payload was never read, so the channel would be
                // mid-frame from here on. Drop the whole session.
                error!(
                    "{} declared a {} byte upload (limit {}), closing session",
                    self.peer, declared, max
                );
                Err(ProtocolError::Oversized { declared, max })
            }
            Err(err) => Err(err),
        }
    }

    /// Looks the requested track up, reports the hit or miss on the
    /// control channel, then sends the file framed over the retrieve
    /// channel.
    fn handle_retrieve(&self, ctx: &ServerContext) -> Result<(), ProtocolError> {
        let (artist, album, title) = self.read_identity()?;
        let Some(track) = ctx.storage.find(&artist, &album, &title) else {
            info!(
                "{} requested unknown track {} / {} / {}",
                self.peer, artist, album, title
            );
            return self.control.lock().write_i32(0);
        };

        let mut guard = match self.retrieve.wait(self.aux_timeout(ctx)) {
            Some(guard) => guard,
            None => {
                warn!(
                    "{} requested a track but no retrieve channel attached in time",
                    self.peer
                );
                return self.control.lock().write_i32(0);
            }
        };
        let Some(channel) = guard.as_mut() else {
            return self.control.lock().write_i32(0);
        };

        self.control.lock().write_i32(1)?;
        let sent = channel.write_file(track.path())?;
        info!(
            "sent {} ({} bytes) to {}",
            track.path().display(),
            sent,
            self.peer
        );
        Ok(())
    }

    /// Like retrieve, but the payload goes out unframed and the stream
    /// channel is consumed; the client reads until the socket closes.
    fn handle_stream(&self, ctx: &ServerContext) -> Result<(), ProtocolError> {
        let (artist, album, title) = self.read_identity()?;
        let Some(track) = ctx.storage.find(&artist, &album, &title) else {
            info!(
                "{} asked to stream unknown track {} / {} / {}",
                self.peer, artist, album, title
            );
            return self.control.lock().write_i32(0);
        };

        let channel = match self.stream.wait(self.aux_timeout(ctx)) {
            Some(mut guard) => guard.take(),
            None => None,
        };
        let Some(mut channel) = channel else {
            warn!(
                "{} asked to stream but no stream channel attached in time",
                self.peer
            );
            return self.control.lock().write_i32(0);
        };

        self.control.lock().write_i32(1)?;
        match channel.stream_file(track.path()) {
            Ok(sent) => info!(
                "streamed {} ({} bytes) to {}",
                track.path().display(),
                sent,
                self.peer
            ),
            Err(err) => error!("stream to {} failed: {}", self.peer, err),
        }
        channel.close();
        Ok(())
    }

    fn read_identity(&self) -> Result<(String, String, String), ProtocolError> {
        let mut control = self.control.lock();
        Ok((
            control.read_string()?,
            control.read_string()?,
            control.read_string()?,
        ))
    }
}

fn apply_read_timeout(channel: &FramedChannel, config: &ServerConfig) -> io::Result<()> {
    if config.read_timeout_secs > 0 {
        channel.set_read_timeout(Some(Duration::from_secs(config.read_timeout_secs)))?;
    }
    Ok(())
}
