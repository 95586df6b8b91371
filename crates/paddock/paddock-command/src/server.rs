//! Blocking command server: one serve thread plus a thread per peer connection.
//!
//! ```text
//!  peer ──▶ [conn thread] ──read frame──▶ ┐
//!  peer ──▶ [conn thread] ──read frame──▶ ├─ mpsc ─▶ [serve loop] ─dispatch─▶ reply to that peer
//!          [acceptor thread] (spawns conns)┘
//! ```
//!
//! Connection threads only read. The serve loop handles one request at a time
//! and writes its reply before taking the next, so each peer sees strict
//! request/reply semantics and the handler table needs no locking.

use crate::config::{DEFAULT_RECV_TIMEOUT, ServerConfig};
use crate::dispatcher::{Control, Dispatcher};
use crate::error::CommandError;
use crate::heartbeat::{HeartbeatState, spawn_monitor};
use crate::registry::CommandRegistry;
use paddock_wire::{WireError, format_endpoint, read_frame_until, write_frame};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Sleep between non-blocking accept attempts.
const ACCEPT_POLL: Duration = Duration::from_millis(20);

/// Requests queued between connection threads and the serve loop.
const QUEUE_DEPTH: usize = 64;

/// Bound on writing one reply to a peer.
pub(crate) const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Why a serve loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeExit {
    /// `__shutdown__` was handled.
    Shutdown,
    /// `__terminate__` was handled.
    Terminated,
    /// `stop()` was called.
    Stopped,
}

impl From<Control> for Option<ServeExit> {
    fn from(control: Control) -> Self {
        match control {
            Control::Continue => None,
            Control::Shutdown => Some(ServeExit::Shutdown),
            Control::Terminate => Some(ServeExit::Terminated),
        }
    }
}

/// Cross-thread stop switch for a serve loop.
#[derive(Debug, Clone, Default)]
pub struct ServerStopper(pub(crate) Arc<AtomicBool>);

impl ServerStopper {
    /// Idempotent; the loop exits at its next receive timeout.
    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// One received request and the stream to answer on.
struct Job {
    body: Vec<u8>,
    reply_to: Arc<TcpStream>,
    peer: SocketAddr,
}

pub struct CommandServer {
    listener: TcpListener,
    addr: SocketAddr,
    recv_timeout: Duration,
    dispatcher: Dispatcher,
    stop: ServerStopper,
}

impl CommandServer {
    /// Binds the listening socket. The handler table is frozen from here on.
    ///
    /// # Errors
    /// [`CommandError::Bind`] if the address is invalid or in use.
    pub fn bind(cfg: ServerConfig, registry: CommandRegistry) -> Result<Self, CommandError> {
        let (listener, addr) = bind_listener(&cfg)?;
        Ok(Self {
            listener,
            addr,
            recv_timeout: effective_recv_timeout(&cfg),
            dispatcher: Dispatcher::new(cfg.name, registry, Arc::new(HeartbeatState::new(cfg.heartbeat))),
            stop: ServerStopper::default(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// `tcp://127.0.0.1:<port>`
    pub fn endpoint(&self) -> String {
        format_endpoint(self.addr)
    }

    pub fn stopper(&self) -> ServerStopper {
        self.stop.clone()
    }

    pub fn heartbeat(&self) -> Arc<HeartbeatState> {
        Arc::clone(self.dispatcher.heartbeat())
    }

    /// Serves until a shutdown/terminate command or `stop()`.
    pub fn serve(self) -> Result<ServeExit, CommandError> {
        let Self {
            listener,
            addr,
            recv_timeout,
            dispatcher,
            stop,
        } = self;
        let name = dispatcher.name().to_owned();

        let (tx, rx) = mpsc::sync_channel::<Job>(QUEUE_DEPTH);
        listener.set_nonblocking(true)?;
        let acceptor = spawn_acceptor(listener, tx, stop.clone(), recv_timeout, name.clone())?;

        let monitor = match dispatcher.registry().missed_heartbeat_handler() {
            Some(callback) => Some(spawn_monitor(
                Arc::clone(dispatcher.heartbeat()),
                Arc::clone(callback),
                Arc::clone(&stop.0),
                name.clone(),
            )?),
            None => None,
        };

        info!(name = %name, %addr, "command server serving");
        let exit = serve_loop(&dispatcher, &rx, &stop, recv_timeout);

        stop.stop();
        if acceptor.join().is_err() {
            warn!(name = %name, "acceptor thread panicked");
        }
        if let Some(monitor) = monitor {
            if monitor.join().is_err() {
                warn!(name = %name, "heartbeat monitor panicked");
            }
        }
        info!(name = %name, ?exit, "command server stopped");
        Ok(exit)
    }

    /// Runs [`serve`](Self::serve) on a dedicated thread.
    pub fn spawn(self) -> io::Result<ServerHandle> {
        let addr = self.addr;
        let stop = self.stopper();
        let thread = std::thread::Builder::new()
            .name(format!("command-server-{}", self.dispatcher.name()))
            .spawn(move || self.serve())?;
        Ok(ServerHandle {
            addr,
            stop,
            thread: Some(thread),
        })
    }
}

/// Binds the configured address; shared with the async server.
pub(crate) fn bind_listener(cfg: &ServerConfig) -> Result<(TcpListener, SocketAddr), CommandError> {
    let bind_addr = cfg.bind_addr();
    let listener = TcpListener::bind(&bind_addr).map_err(|source| CommandError::Bind {
        addr: bind_addr.clone(),
        source,
    })?;
    let addr = listener.local_addr()?;
    info!(name = %cfg.name, endpoint = %format_endpoint(addr), "command server bound");
    Ok((listener, addr))
}

pub(crate) fn effective_recv_timeout(cfg: &ServerConfig) -> Duration {
    if cfg.recv_timeout.is_zero() {
        DEFAULT_RECV_TIMEOUT
    } else {
        cfg.recv_timeout
    }
}

fn serve_loop(
    dispatcher: &Dispatcher,
    rx: &Receiver<Job>,
    stop: &ServerStopper,
    recv_timeout: Duration,
) -> ServeExit {
    loop {
        if stop.is_stopped() {
            return ServeExit::Stopped;
        }
        let job = match rx.recv_timeout(recv_timeout) {
            Ok(job) => job,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return ServeExit::Stopped,
        };

        let reply = dispatcher.dispatch_raw(&job.body);
        if let Err(e) = write_frame(&mut &*job.reply_to, &reply.encode()) {
            // A peer that cannot take a reply within WRITE_TIMEOUT is cut off;
            // its queued requests then fail fast instead of each waiting again.
            warn!(peer = %job.peer, error = %e, "failed to send reply, dropping connection");
            let _ = job.reply_to.shutdown(std::net::Shutdown::Both);
        }
        if let Some(exit) = Option::<ServeExit>::from(reply.control) {
            return exit;
        }
    }
}

fn spawn_acceptor(
    listener: TcpListener,
    tx: SyncSender<Job>,
    stop: ServerStopper,
    recv_timeout: Duration,
    name: String,
) -> io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name(format!("command-accept-{name}"))
        .spawn(move || {
            while !stop.is_stopped() {
                match listener.accept() {
                    Ok((stream, peer)) => {
                        debug!(name = %name, %peer, "peer connected");
                        if let Err(e) = spawn_connection(stream, peer, tx.clone(), stop.clone(), recv_timeout) {
                            warn!(name = %name, %peer, error = %e, "failed to start connection thread");
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => std::thread::sleep(ACCEPT_POLL),
                    Err(e) => {
                        warn!(name = %name, error = %e, "accept failed");
                        std::thread::sleep(ACCEPT_POLL);
                    }
                }
            }
        })
}

fn spawn_connection(
    stream: TcpStream,
    peer: SocketAddr,
    tx: SyncSender<Job>,
    stop: ServerStopper,
    recv_timeout: Duration,
) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(recv_timeout))?;
    stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
    let mut reader = stream.try_clone()?;
    let reply_to = Arc::new(stream);

    std::thread::Builder::new()
        .name(format!("command-conn-{peer}"))
        .spawn(move || {
            loop {
                let body = match read_frame_until(&mut reader, || stop.is_stopped()) {
                    Ok(body) => body,
                    Err(WireError::Closed) => {
                        debug!(%peer, "peer disconnected");
                        return;
                    }
                    Err(e) if e.is_timeout() => return,
                    Err(e) => {
                        warn!(%peer, error = %e, "dropping connection");
                        return;
                    }
                };
                let job = Job {
                    body,
                    reply_to: Arc::clone(&reply_to),
                    peer,
                };
                if tx.send(job).is_err() {
                    return;
                }
            }
        })?;
    Ok(())
}

/// Owner of a server running on its own thread.
pub struct ServerHandle {
    pub(crate) addr: SocketAddr,
    pub(crate) stop: ServerStopper,
    pub(crate) thread: Option<JoinHandle<Result<ServeExit, CommandError>>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn endpoint(&self) -> String {
        format_endpoint(self.addr)
    }

    pub fn stop(&self) {
        self.stop.stop();
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(|t| t.is_finished())
    }

    /// Waits for the serve loop to end on its own (shutdown/terminate).
    pub fn join(mut self) -> Result<ServeExit, CommandError> {
        self.wait()
    }

    /// Stops the loop and waits for it.
    pub fn close(mut self) -> Result<ServeExit, CommandError> {
        self.stop.stop();
        self.wait()
    }

    fn wait(&mut self) -> Result<ServeExit, CommandError> {
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| CommandError::Io(io::Error::other("server thread panicked")))?,
            None => Ok(ServeExit::Stopped),
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.stop.stop();
            let _ = self.wait();
        }
    }
}
