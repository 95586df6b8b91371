//! The forwarding proxy.
//!
//! ```text
//!  publishers ──▶ xsub ─┐                    ┌─ xpub ──▶ subscribers
//!                       ├─▶ [proxy task] ─▶──┤
//!  publishers ◀── subs ─┘   (one owner of    └─ subs ◀── subscribers
//!                            all routing state)
//! ```
//!
//! Every connection task funnels its events into one channel; the proxy task
//! owns the routing tables and is the only thing that touches them. The whole
//! thing runs on a current-thread runtime on the broker's own OS thread, so a
//! broker never shares anything with other brokers or the host's runtime.

use crate::error::BrokerError;
use crate::frame::{BrokerFrame, topic_matches};
use paddock_wire::{WireError, format_endpoint, read_frame_async, write_frame_async};
use std::collections::HashMap;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::thread::JoinHandle;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub host: String,
    /// Publisher-facing port; 0 lets the OS pick.
    pub xsub_port: u16,
    /// Subscriber-facing port; 0 lets the OS pick.
    pub xpub_port: u16,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            xsub_port: 0,
            xpub_port: 0,
        }
    }
}

impl BrokerConfig {
    pub fn with_ports(mut self, xsub_port: u16, xpub_port: u16) -> Self {
        self.xsub_port = xsub_port;
        self.xpub_port = xpub_port;
        self
    }
}

type ConnId = u64;
type Outbox = mpsc::Sender<Vec<u8>>;

/// Frames queued per connection before further frames are dropped.
pub const SEND_HWM: usize = 1000;

enum Event {
    PublisherJoined(ConnId, Outbox),
    SubscriberJoined(ConnId, Outbox),
    Left(ConnId),
    Publish { topic: String, body: Vec<u8> },
    Subscribe(ConnId, String),
    Unsubscribe(ConnId, String),
}

#[derive(Clone, Copy)]
enum Role {
    Publisher,
    Subscriber,
}

impl Role {
    fn name(self) -> &'static str {
        match self {
            Role::Publisher => "xsub",
            Role::Subscriber => "xpub",
        }
    }
}

struct Running {
    shutdown: watch::Sender<bool>,
    thread: JoinHandle<()>,
    xsub: SocketAddr,
    xpub: SocketAddr,
}

/// XSUB/XPUB style forwarder between many publishers and many subscribers.
///
/// `start()` binds both endpoints and launches the proxy thread; calling it
/// again while running does nothing. `close()` (or drop) tears down only this
/// broker's sockets and thread.
pub struct Broker {
    cfg: BrokerConfig,
    running: Option<Running>,
}

impl Broker {
    pub fn new(cfg: BrokerConfig) -> Self {
        Self { cfg, running: None }
    }

    /// # Errors
    /// [`BrokerError::Bind`] if either endpoint cannot be bound.
    pub fn start(&mut self) -> Result<(), BrokerError> {
        if self.running.is_some() {
            return Ok(());
        }
        let (xsub_listener, xsub) = bind(Role::Publisher, &self.cfg.host, self.cfg.xsub_port)?;
        let (xpub_listener, xpub) = bind(Role::Subscriber, &self.cfg.host, self.cfg.xpub_port)?;
        let (shutdown, shutdown_rx) = watch::channel(false);

        let thread = std::thread::Builder::new()
            .name("paddock-broker".into())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!(error = %e, "broker runtime failed to start");
                        return;
                    }
                };
                rt.block_on(async move {
                    if let Err(e) = proxy(xsub_listener, xpub_listener, shutdown_rx).await {
                        error!(error = %e, "broker proxy stopped");
                    }
                });
            })
            .map_err(BrokerError::Spawn)?;

        info!(
            xsub = %format_endpoint(xsub),
            xpub = %format_endpoint(xpub),
            "broker started"
        );
        self.running = Some(Running {
            shutdown,
            thread,
            xsub,
            xpub,
        });
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|r| !r.thread.is_finished())
    }

    /// Where publishers connect. `None` before `start()`.
    pub fn xsub_endpoint(&self) -> Option<String> {
        self.running.as_ref().map(|r| format_endpoint(r.xsub))
    }

    /// Where subscribers connect. `None` before `start()`.
    pub fn xpub_endpoint(&self) -> Option<String> {
        self.running.as_ref().map(|r| format_endpoint(r.xpub))
    }

    /// Idempotent.
    pub fn close(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        let _ = running.shutdown.send(true);
        if running.thread.join().is_err() {
            warn!("broker thread panicked");
        }
        info!("broker closed");
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.close();
    }
}

fn bind(role: Role, host: &str, port: u16) -> Result<(StdTcpListener, SocketAddr), BrokerError> {
    let addr = format!("{host}:{port}");
    let bind_err = |source| BrokerError::Bind {
        role: role.name(),
        addr: addr.clone(),
        source,
    };
    let listener = StdTcpListener::bind(&addr).map_err(bind_err)?;
    listener.set_nonblocking(true).map_err(bind_err)?;
    let local = listener.local_addr()?;
    Ok((listener, local))
}

async fn proxy(
    xsub: StdTcpListener,
    xpub: StdTcpListener,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), BrokerError> {
    let xsub = TcpListener::from_std(xsub)?;
    let xpub = TcpListener::from_std(xpub)?;
    let (events_tx, mut events) = mpsc::unbounded_channel::<Event>();
    let mut routes = Routes::default();
    let mut next_id: ConnId = 0;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = xsub.accept() => match accepted {
                Ok((stream, peer)) => {
                    next_id += 1;
                    debug!(%peer, id = next_id, "publisher connected");
                    tokio::spawn(connection(Role::Publisher, next_id, stream, events_tx.clone()));
                }
                Err(e) => warn!(error = %e, "xsub accept failed"),
            },
            accepted = xpub.accept() => match accepted {
                Ok((stream, peer)) => {
                    next_id += 1;
                    debug!(%peer, id = next_id, "subscriber connected");
                    tokio::spawn(connection(Role::Subscriber, next_id, stream, events_tx.clone()));
                }
                Err(e) => warn!(error = %e, "xpub accept failed"),
            },
            Some(event) = events.recv() => routes.apply(event),
        }
    }
    Ok(())
}

/// Routing state owned by the proxy task.
#[derive(Default)]
struct Routes {
    publishers: HashMap<ConnId, Outbox>,
    subscribers: HashMap<ConnId, Subscription>,
}

struct Subscription {
    outbox: Outbox,
    /// One entry per subscribe; duplicates are kept so unsubscribes pair up.
    prefixes: Vec<String>,
}

impl Routes {
    fn apply(&mut self, event: Event) {
        match event {
            Event::PublisherJoined(id, outbox) => {
                // Late publishers learn about existing subscriptions.
                for sub in self.subscribers.values() {
                    for prefix in &sub.prefixes {
                        enqueue(id, &outbox, BrokerFrame::Subscribe(prefix.clone()).encode());
                    }
                }
                self.publishers.insert(id, outbox);
            }
            Event::SubscriberJoined(id, outbox) => {
                self.subscribers.insert(
                    id,
                    Subscription {
                        outbox,
                        prefixes: Vec::new(),
                    },
                );
            }
            Event::Left(id) => {
                self.publishers.remove(&id);
                if let Some(sub) = self.subscribers.remove(&id) {
                    for prefix in sub.prefixes {
                        self.announce(BrokerFrame::Unsubscribe(prefix));
                    }
                }
            }
            Event::Publish { topic, body } => {
                for (&id, sub) in &self.subscribers {
                    if sub.prefixes.iter().any(|p| topic_matches(p, &topic)) {
                        enqueue(id, &sub.outbox, body.clone());
                    }
                }
            }
            Event::Subscribe(id, prefix) => {
                if let Some(sub) = self.subscribers.get_mut(&id) {
                    sub.prefixes.push(prefix.clone());
                    self.announce(BrokerFrame::Subscribe(prefix));
                }
            }
            Event::Unsubscribe(id, prefix) => {
                if let Some(sub) = self.subscribers.get_mut(&id) {
                    if let Some(pos) = sub.prefixes.iter().position(|p| *p == prefix) {
                        sub.prefixes.swap_remove(pos);
                        self.announce(BrokerFrame::Unsubscribe(prefix));
                    }
                }
            }
        }
    }

    fn announce(&self, frame: BrokerFrame) {
        let body = frame.encode();
        for (&id, outbox) in &self.publishers {
            enqueue(id, outbox, body.clone());
        }
    }
}

/// Best-effort hand-off to a connection's writer. A peer that is not keeping
/// up loses frames once [`SEND_HWM`] are queued for it.
fn enqueue(id: ConnId, outbox: &Outbox, body: Vec<u8>) {
    match outbox.try_send(body) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => debug!(id, hwm = SEND_HWM, "outbox full, dropping frame"),
        Err(TrySendError::Closed(_)) => {}
    }
}

async fn connection(role: Role, id: ConnId, stream: TcpStream, events: mpsc::UnboundedSender<Event>) {
    let _ = stream.set_nodelay(true);
    let (rd, wr) = stream.into_split();
    let (outbox, inbox) = mpsc::channel(SEND_HWM);
    let joined = match role {
        Role::Publisher => Event::PublisherJoined(id, outbox),
        Role::Subscriber => Event::SubscriberJoined(id, outbox),
    };
    if events.send(joined).is_err() {
        return;
    }

    let writer = tokio::spawn(drain_outbox(wr, inbox));
    if let Err(e) = read_inbound(role, id, rd, &events).await {
        debug!(id, role = role.name(), error = %e, "connection closed");
    }
    writer.abort();
    let _ = events.send(Event::Left(id));
}

async fn drain_outbox<W: AsyncWrite + Unpin>(mut wr: W, mut inbox: mpsc::Receiver<Vec<u8>>) {
    while let Some(body) = inbox.recv().await {
        if let Err(e) = write_frame_async(&mut wr, &body).await {
            debug!(error = %e, "dropping outbound frames");
            return;
        }
    }
}

async fn read_inbound<R: AsyncRead + Unpin>(
    role: Role,
    id: ConnId,
    mut rd: R,
    events: &mpsc::UnboundedSender<Event>,
) -> Result<(), BrokerError> {
    loop {
        let body = match read_frame_async(&mut rd).await {
            Ok(body) => body,
            Err(WireError::Closed) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let frame = match BrokerFrame::decode(&body) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(id, role = role.name(), error = %e, "ignoring malformed frame");
                continue;
            }
        };
        let event = match (role, frame) {
            (Role::Publisher, BrokerFrame::Message { topic, .. }) => Event::Publish { topic, body },
            (Role::Subscriber, BrokerFrame::Subscribe(prefix)) => Event::Subscribe(id, prefix),
            (Role::Subscriber, BrokerFrame::Unsubscribe(prefix)) => Event::Unsubscribe(id, prefix),
            (role, frame) => {
                debug!(id, role = role.name(), ?frame, "frame not valid for this endpoint");
                continue;
            }
        };
        if events.send(event).is_err() {
            return Ok(());
        }
    }
}
