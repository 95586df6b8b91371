//! Tokio flavour of the command server.
//!
//! Same wire behaviour as [`CommandServer`](crate::CommandServer); the serve
//! loop suspends at its receive and the heartbeat monitor is a task instead of
//! a thread. Handlers are still plain synchronous closures run inline.

use crate::config::ServerConfig;
use crate::dispatcher::Dispatcher;
use crate::error::CommandError;
use crate::heartbeat::{HeartbeatState, run_monitor};
use crate::registry::CommandRegistry;
use crate::server::{
    ServeExit, ServerHandle, ServerStopper, WRITE_TIMEOUT, bind_listener, effective_recv_timeout,
};
use paddock_wire::{WireError, format_endpoint, read_frame_async, write_frame_async};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Backoff after a failed accept.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(20);

/// Requests queued between connection tasks and the serve loop.
const QUEUE_DEPTH: usize = 64;

/// Write side of a connection; `None` once a reply write has failed.
type ReplyTo = Arc<Mutex<Option<OwnedWriteHalf>>>;

struct Job {
    body: Vec<u8>,
    reply_to: ReplyTo,
    peer: SocketAddr,
}

pub struct AsyncCommandServer {
    listener: TcpListener,
    addr: SocketAddr,
    recv_timeout: Duration,
    dispatcher: Dispatcher,
    stop: ServerStopper,
}

impl AsyncCommandServer {
    /// Binds the listening socket. Must be awaited inside a Tokio runtime.
    pub async fn bind(cfg: ServerConfig, registry: CommandRegistry) -> Result<Self, CommandError> {
        let (listener, addr) = bind_listener(&cfg)?;
        listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(listener)?;
        Ok(Self::from_parts(listener, addr, cfg, registry, ServerStopper::default()))
    }

    fn from_parts(
        listener: TcpListener,
        addr: SocketAddr,
        cfg: ServerConfig,
        registry: CommandRegistry,
        stop: ServerStopper,
    ) -> Self {
        Self {
            listener,
            addr,
            recv_timeout: effective_recv_timeout(&cfg),
            dispatcher: Dispatcher::new(cfg.name, registry, Arc::new(HeartbeatState::new(cfg.heartbeat))),
            stop,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

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
    pub async fn serve(self) -> Result<ServeExit, CommandError> {
        let Self {
            listener,
            addr,
            recv_timeout,
            dispatcher,
            stop,
        } = self;
        let name = dispatcher.name().to_owned();

        let (tx, mut rx) = mpsc::channel::<Job>(QUEUE_DEPTH);
        let acceptor = tokio::spawn(accept_loop(listener, tx, name.clone()));
        let monitor = dispatcher.registry().missed_heartbeat_handler().map(|callback| {
            tokio::spawn(run_monitor(
                Arc::clone(dispatcher.heartbeat()),
                Arc::clone(callback),
                Arc::clone(&stop.0),
                name.clone(),
            ))
        });

        info!(name = %name, %addr, "async command server serving");
        let exit = loop {
            if stop.is_stopped() {
                break ServeExit::Stopped;
            }
            let job = match tokio::time::timeout(recv_timeout, rx.recv()).await {
                Ok(Some(job)) => job,
                Ok(None) => break ServeExit::Stopped,
                Err(_) => continue,
            };

            let reply = dispatcher.dispatch_raw(&job.body);
            send_reply(&job, &reply.encode()).await;
            if let Some(exit) = Option::<ServeExit>::from(reply.control) {
                break exit;
            }
        };

        stop.stop();
        // Dropping the acceptor's JoinSet aborts every connection task.
        acceptor.abort();
        let _ = acceptor.await;
        if let Some(monitor) = monitor {
            monitor.abort();
            let _ = monitor.await;
        }
        info!(name = %name, ?exit, "async command server stopped");
        Ok(exit)
    }

    /// Binds now, then serves on a dedicated thread with its own
    /// current-thread runtime. For hosts that have no runtime of their own.
    pub fn spawn(cfg: ServerConfig, registry: CommandRegistry) -> Result<ServerHandle, CommandError> {
        let (listener, addr) = bind_listener(&cfg)?;
        listener.set_nonblocking(true)?;
        let stop = ServerStopper::default();
        let server_stop = stop.clone();
        let thread = std::thread::Builder::new()
            .name(format!("command-server-{}", cfg.name))
            .spawn(move || -> Result<ServeExit, CommandError> {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()?;
                rt.block_on(async move {
                    let listener = TcpListener::from_std(listener)?;
                    Self::from_parts(listener, addr, cfg, registry, server_stop)
                        .serve()
                        .await
                })
            })?;
        Ok(ServerHandle {
            addr,
            stop,
            thread: Some(thread),
        })
    }
}

/// Writes one reply within [`WRITE_TIMEOUT`]. A peer that cannot take it is
/// dropped so the serve loop never waits on a socket that is not draining.
async fn send_reply(job: &Job, reply: &[u8]) {
    let mut slot = job.reply_to.lock().await;
    let Some(w) = slot.as_mut() else {
        debug!(peer = %job.peer, "connection already dropped, discarding reply");
        return;
    };
    match tokio::time::timeout(WRITE_TIMEOUT, write_frame_async(w, reply)).await {
        Ok(Ok(())) => return,
        Ok(Err(e)) => warn!(peer = %job.peer, error = %e, "failed to send reply, dropping connection"),
        Err(_) => warn!(peer = %job.peer, timeout = ?WRITE_TIMEOUT, "reply write timed out, dropping connection"),
    }
    *slot = None;
}

async fn accept_loop(listener: TcpListener, tx: mpsc::Sender<Job>, name: String) {
    let mut conns = JoinSet::new();
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(name = %name, %peer, "peer connected");
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(%peer, error = %e, "set_nodelay failed");
                }
                conns.spawn(connection(stream, peer, tx.clone()));
            }
            Err(e) => {
                warn!(name = %name, error = %e, "accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
        while conns.try_join_next().is_some() {}
    }
}

async fn connection(stream: TcpStream, peer: SocketAddr, tx: mpsc::Sender<Job>) {
    let (mut rd, wr) = stream.into_split();
    let reply_to: ReplyTo = Arc::new(Mutex::new(Some(wr)));
    loop {
        if reply_to.lock().await.is_none() {
            return;
        }
        let body = match read_frame_async(&mut rd).await {
            Ok(body) => body,
            Err(WireError::Closed) => {
                debug!(%peer, "peer disconnected");
                return;
            }
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
        if tx.send(job).await.is_err() {
            return;
        }
    }
}
