use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::{
    ADD_PORT_OFFSET, RETRIEVE_PORT_OFFSET, STREAM_PORT_OFFSET,
};
use crate::session::{AuxKind, ServerContext, Session, SessionRegistry};

/// The four listener ports, in the fixed control/add/retrieve/stream
/// layout clients expect.
#[derive(Clone, Copy, Debug)]
pub struct Ports {
    pub control: u16,
    pub add: u16,
    pub retrieve: u16,
    pub stream: u16,
}

/// Accepts control connections and routes auxiliary connections to the
/// session already registered for the same address.
pub struct Server {
    ctx: Arc<ServerContext>,
    registry: SessionRegistry,
    open: Arc<AtomicBool>,
    ports: Ports,
    handles: Vec<JoinHandle<()>>,
}

impl Server {
    /// Binds all four listeners and starts their accept threads. With a
    /// control port of zero an ephemeral base port is picked and the aux
    /// listeners follow it at the usual offsets.
    pub fn start(ctx: ServerContext) -> io::Result<Server> {
        let (listeners, ports) = bind_listeners(ctx.config.control_port)?;
        let ctx = Arc::new(ctx);
        let registry: SessionRegistry = Arc::new(Mutex::new(HashMap::new()));
        let open = Arc::new(AtomicBool::new(true));

        let mut server = Server {
            ctx,
            registry,
            open,
            ports,
            handles: Vec::with_capacity(4),
        };

        let [control, add, retrieve, stream] = listeners;
        server.spawn_control_loop(control)?;
        server.spawn_aux_loop(AuxKind::Add, add)?;
        server.spawn_aux_loop(AuxKind::Retrieve, retrieve)?;
        server.spawn_aux_loop(AuxKind::Stream, stream)?;

        info!(
            "listening on ports {} (control), {} (add), {} (retrieve), {} (stream)",
            ports.control, ports.add, ports.retrieve, ports.stream
        );
        Ok(server)
    }

    pub fn ports(&self) -> Ports {
        self.ports
    }

    /// Blocks until the accept threads exit, which only happens after a
    /// shutdown from another thread.
    pub fn wait(&mut self) {
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }

    /// Stops accepting, disconnects every session and joins the accept
    /// threads. Listeners have no unblockable close, so a loopback
    /// connection to each port nudges its accept loop awake.
    pub fn shutdown(&mut self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        for port in [
            self.ports.control,
            self.ports.add,
            self.ports.retrieve,
            self.ports.stream,
        ] {
            let _ = TcpStream::connect((Ipv4Addr::LOCALHOST, port));
        }
        self.wait();

        let sessions: Vec<Arc<Session>> = self.registry.lock().values().cloned().collect();
        for session in &sessions {
            session.close();
        }
        self.registry.lock().clear();
        info!("server closed and disconnected from all clients");
    }

    fn spawn_control_loop(&mut self, listener: TcpListener) -> io::Result<()> {
        let ctx = Arc::clone(&self.ctx);
        let registry = Arc::clone(&self.registry);
        let open = Arc::clone(&self.open);
        let handle = thread::Builder::new()
            .name("accept-control".to_string())
            .spawn(move || loop {
                let stream = match listener.accept() {
                    Ok((stream, _)) => stream,
                    Err(err) => {
                        if !open.load(Ordering::SeqCst) {
                            break;
                        }
                        error!("control accept failed: {}", err);
                        continue;
                    }
                };
                if !open.load(Ordering::SeqCst) {
                    break;
                }
                register_session(stream, &ctx, &registry);
            })?;
        self.handles.push(handle);
        Ok(())
    }

    fn spawn_aux_loop(&mut self, kind: AuxKind, listener: TcpListener) -> io::Result<()> {
        let ctx = Arc::clone(&self.ctx);
        let registry = Arc::clone(&self.registry);
        let open = Arc::clone(&self.open);
        let handle = thread::Builder::new()
            .name(format!("accept-{}", kind.label()))
            .spawn(move || loop {
                let (stream, addr) = match listener.accept() {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        if !open.load(Ordering::SeqCst) {
                            break;
                        }
                        error!("{} accept failed: {}", kind.label(), err);
                        continue;
                    }
                };
                if !open.load(Ordering::SeqCst) {
                    break;
                }
                let session = registry.lock().get(&addr.ip()).cloned();
                match session {
                    Some(session) => {
                        if let Err(err) = session.attach(kind, stream, &ctx.config) {
                            error!(
                                "could not attach {} channel for {}: {}",
                                kind.label(),
                                addr.ip(),
                                err
                            );
                        }
                    }
                    None => {
                        warn!(
                            "{} connection from {} with no control session, dropping",
                            kind.label(),
                            addr.ip()
                        );
                    }
                }
            })?;
        self.handles.push(handle);
        Ok(())
    }
}

fn register_session(stream: TcpStream, ctx: &Arc<ServerContext>, registry: &SessionRegistry) {
    let peer = match stream.peer_addr() {
        Ok(addr) => addr.ip(),
        Err(err) => {
            warn!("accepted control connection with no peer address: {}", err);
            return;
        }
    };
    let session = match Session::new(stream, &ctx.config) {
        Ok(session) => session,
        Err(err) => {
            error!("could not start a session for {}: {}", peer, err);
            return;
        }
    };
    let previous = registry.lock().insert(peer, Arc::clone(&session));
    if let Some(previous) = previous {
        // One session per address; a reconnect supersedes the old
        // session, whose sockets are shut down here.
        warn!("{} reconnected, closing its previous session", peer);
        previous.close();
    }
    if let Err(err) = session.start(Arc::clone(ctx), Arc::clone(registry)) {
        error!("could not start a session for {}: {}", peer, err);
        session.close();
        registry.lock().remove(&peer);
    }
}

/// Binds control and the three aux listeners. A zero base port means the
/// OS picks the control port, after which the three consecutive ports
/// must also be free; a clash retries with a fresh ephemeral base.
fn bind_listeners(base: u16) -> io::Result<([TcpListener; 4], Ports)> {
    let mut last_err = io::Error::new(io::ErrorKind::AddrInUse, "no usable port range");
    for attempt in 0..16 {
        let control = TcpListener::bind((Ipv4Addr::UNSPECIFIED, base))?;
        let control_port = control.local_addr()?.port();
        let ports = Ports {
            control: control_port,
            add: control_port.saturating_add(ADD_PORT_OFFSET),
            retrieve: control_port.saturating_add(RETRIEVE_PORT_OFFSET),
            stream: control_port.saturating_add(STREAM_PORT_OFFSET),
        };
        let aux = [ports.add, ports.retrieve, ports.stream]
            .map(|port| TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)));
        match aux {
            [Ok(add), Ok(retrieve), Ok(stream)] => {
                return Ok(([control, add, retrieve, stream], ports));
            }
            [a, b, c] => {
                for result in [a, b, c] {
                    if let Err(err) = result {
                        last_err = err;
                        break;
                    }
                }
                if base != 0 {
                    // A fixed base has exactly one candidate range.
                    return Err(last_err);
                }
                debug!("ephemeral port range clash, retry {}", attempt + 1);
            }
        }
    }
    Err(last_err)
}
