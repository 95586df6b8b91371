//! Request/reply command channel between a host and its overlay processes.
//!
//! Each child runs a [`CommandServer`] (or [`AsyncCommandServer`]) on
//! `127.0.0.1:<port>`; the host drives it with a [`PeerClient`]. Every request
//! gets exactly one reply. Four built-ins are always answered by the server
//! itself: `__ping__`, `__heartbeat__`, `__shutdown__`, `__terminate__`.
//!
//! ```ignore
//! let mut registry = CommandRegistry::new();
//! registry.register("lock_widgets", |_| Ok(json!({"status": "success"})))?;
//! registry.on_missed_heartbeat(|missed| warn!(missed, "host went quiet"));
//!
//! let server = CommandServer::bind(ServerConfig::new("hud").with_port(5601), registry)?;
//! let handle = server.spawn()?;
//!
//! let mut host = PeerClient::for_port(5601, Duration::from_secs(1));
//! assert!(host.is_alive());
//! host.shutdown_child(Args::new());
//! handle.join()?;
//! ```

pub mod async_server;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod heartbeat;
pub mod protocol;
pub mod registry;
pub mod server;

pub use async_server::AsyncCommandServer;
pub use client::{AsyncPeerClient, DEFAULT_REQUEST_TIMEOUT, PeerClient};
pub use config::{HeartbeatConfig, ServerConfig};
pub use dispatcher::{Control, Dispatcher, Reply};
pub use error::CommandError;
pub use heartbeat::{HeartbeatState, MonitorStep};
pub use protocol::{Args, Builtin, Request};
pub use registry::CommandRegistry;
pub use server::{CommandServer, ServeExit, ServerHandle, ServerStopper};
