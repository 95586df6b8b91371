//! Request side of the command channel, used by a host to drive its children.
//!
//! `request` never fails: timeouts, refused connections and garbled replies
//! come back as `{"error": "<message>"}` so a supervisor can log and move on.
//! After any failed exchange the socket is discarded and the next request
//! reconnects, since a reply may still be in flight on the old one.

use crate::error::CommandError;
use crate::protocol::{self, Args, Request};
use paddock_wire::{
    FrameBuffer, WireError, format_endpoint, parse_endpoint, read_frame_async, write_frame,
    write_frame_async,
};
use serde_json::Value;
use std::net::{SocketAddr, TcpStream};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(1);

/// Socket timeouts of zero mean "block forever" to the OS; never hand it one.
const MIN_TIMEOUT: Duration = Duration::from_millis(1);

fn localhost(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

fn classify(e: WireError, timeout: Duration) -> CommandError {
    if e.is_timeout() {
        CommandError::Timeout(timeout)
    } else {
        CommandError::Wire(e)
    }
}

fn decode_reply(raw: &[u8]) -> Result<Value, CommandError> {
    serde_json::from_slice(raw).map_err(CommandError::MalformedReply)
}

fn fold(endpoint: &str, cmd: &str, result: Result<Value, CommandError>) -> Value {
    result.unwrap_or_else(|e| {
        let message = format!("{:#}", anyhow::Error::from(e));
        warn!(endpoint, cmd, error = %message, "command request failed");
        protocol::client_error(&message)
    })
}

fn is_pong(reply: &Value) -> bool {
    reply.get("reply").and_then(Value::as_str) == Some(protocol::PONG)
}

/// Blocking peer client.
#[derive(Debug)]
pub struct PeerClient {
    addr: SocketAddr,
    endpoint: String,
    timeout: Duration,
    stream: Option<TcpStream>,
}

impl PeerClient {
    /// Does not connect; the first request does.
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, CommandError> {
        Ok(Self::with_addr(parse_endpoint(endpoint)?, timeout))
    }

    /// A child's server on `127.0.0.1:<port>`.
    pub fn for_port(port: u16, timeout: Duration) -> Self {
        Self::with_addr(localhost(port), timeout)
    }

    fn with_addr(addr: SocketAddr, timeout: Duration) -> Self {
        Self {
            addr,
            endpoint: format_endpoint(addr),
            timeout: timeout.max(MIN_TIMEOUT),
            stream: None,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Sends one command and waits for its reply, folding failures into
    /// `{"error": ...}`.
    pub fn request(&mut self, cmd: &str, args: Args) -> Value {
        let result = self.try_request(cmd, args);
        fold(&self.endpoint, cmd, result)
    }

    /// Like [`request`](Self::request) but keeps the failure typed.
    pub fn try_request(&mut self, cmd: &str, args: Args) -> Result<Value, CommandError> {
        let body = Request::new(cmd, args).encode();
        let result = self.exchange(&body);
        if result.is_err() {
            self.stream = None;
        }
        result
    }

    fn exchange(&mut self, body: &[u8]) -> Result<Value, CommandError> {
        let timeout = self.timeout;
        let stream = self.connect()?;
        let deadline = Instant::now() + timeout;
        write_frame(stream, body).map_err(|e| classify(e, timeout))?;

        // Socket timeouts bound each read, not the exchange, so shrink them
        // towards one deadline.
        let mut inbound = FrameBuffer::new();
        let raw = loop {
            if let Some(raw) = inbound.next_frame()? {
                break raw;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(CommandError::Timeout(timeout));
            }
            stream.set_read_timeout(Some(remaining.max(MIN_TIMEOUT)))?;
            inbound.fill_from(stream).map_err(|e| classify(e, timeout))?;
        };
        decode_reply(&raw)
    }

    fn connect(&mut self) -> Result<&mut TcpStream, CommandError> {
        let stream = match self.stream.take() {
            Some(stream) => stream,
            None => {
                let stream = TcpStream::connect_timeout(&self.addr, self.timeout).map_err(|e| {
                    if paddock_wire::is_timeout(&e) {
                        CommandError::Timeout(self.timeout)
                    } else {
                        CommandError::Io(e)
                    }
                })?;
                stream.set_nodelay(true)?;
                stream.set_read_timeout(Some(self.timeout))?;
                stream.set_write_timeout(Some(self.timeout))?;
                debug!(endpoint = %self.endpoint, "connected to command server");
                stream
            }
        };
        Ok(self.stream.insert(stream))
    }

    pub fn ping(&mut self) -> Value {
        self.request(protocol::PING, Args::new())
    }

    /// True if the peer answered `__ping__` with `__pong__`.
    pub fn is_alive(&mut self) -> bool {
        is_pong(&self.ping())
    }

    pub fn heartbeat(&mut self) -> Value {
        self.request(protocol::HEARTBEAT, Args::new())
    }

    /// Asks the child to run its shutdown callback with `args` and stop.
    pub fn shutdown_child(&mut self, args: Args) -> Value {
        self.request(protocol::SHUTDOWN, args)
    }

    pub fn terminate_child(&mut self) -> Value {
        self.request(protocol::TERMINATE, Args::new())
    }
}

/// Tokio peer client with the same surface as [`PeerClient`].
#[derive(Debug)]
pub struct AsyncPeerClient {
    addr: SocketAddr,
    endpoint: String,
    timeout: Duration,
    stream: Option<tokio::net::TcpStream>,
}

impl AsyncPeerClient {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, CommandError> {
        Ok(Self::with_addr(parse_endpoint(endpoint)?, timeout))
    }

    pub fn for_port(port: u16, timeout: Duration) -> Self {
        Self::with_addr(localhost(port), timeout)
    }

    fn with_addr(addr: SocketAddr, timeout: Duration) -> Self {
        Self {
            addr,
            endpoint: format_endpoint(addr),
            timeout: timeout.max(MIN_TIMEOUT),
            stream: None,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn request(&mut self, cmd: &str, args: Args) -> Value {
        let result = self.try_request(cmd, args).await;
        fold(&self.endpoint, cmd, result)
    }

    pub async fn try_request(&mut self, cmd: &str, args: Args) -> Result<Value, CommandError> {
        let body = Request::new(cmd, args).encode();
        let result = self.exchange(&body).await;
        if result.is_err() {
            self.stream = None;
        }
        result
    }

    async fn exchange(&mut self, body: &[u8]) -> Result<Value, CommandError> {
        let timeout = self.timeout;
        let stream = self.connect().await?;
        let raw = tokio::time::timeout(timeout, round_trip(stream, body))
            .await
            .map_err(|_| CommandError::Timeout(timeout))??;
        decode_reply(&raw)
    }

    async fn connect(&mut self) -> Result<&mut tokio::net::TcpStream, CommandError> {
        let stream = match self.stream.take() {
            Some(stream) => stream,
            None => {
                let stream = tokio::time::timeout(self.timeout, tokio::net::TcpStream::connect(self.addr))
                    .await
                    .map_err(|_| CommandError::Timeout(self.timeout))??;
                stream.set_nodelay(true)?;
                debug!(endpoint = %self.endpoint, "connected to command server");
                stream
            }
        };
        Ok(self.stream.insert(stream))
    }

    pub async fn ping(&mut self) -> Value {
        self.request(protocol::PING, Args::new()).await
    }

    pub async fn is_alive(&mut self) -> bool {
        is_pong(&self.ping().await)
    }

    pub async fn heartbeat(&mut self) -> Value {
        self.request(protocol::HEARTBEAT, Args::new()).await
    }

    pub async fn shutdown_child(&mut self, args: Args) -> Value {
        self.request(protocol::SHUTDOWN, args).await
    }

    pub async fn terminate_child(&mut self) -> Value {
        self.request(protocol::TERMINATE, Args::new()).await
    }
}

async fn round_trip(stream: &mut tokio::net::TcpStream, body: &[u8]) -> Result<Vec<u8>, WireError> {
    write_frame_async(stream, body).await?;
    read_frame_async(stream).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpListener;

    #[test]
    fn refused_connection_becomes_error_value() {
        // Bind then drop to get a port with nothing listening.
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let mut client = PeerClient::for_port(port, Duration::from_millis(200));
        let reply = client.ping();
        assert!(reply.get("error").and_then(Value::as_str).is_some());
        assert!(!client.is_connected());
    }

    #[test]
    fn silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut client = PeerClient::for_port(port, Duration::from_millis(100));

        let reply = client.request("lock_widgets", Args::new());
        let message = reply["error"].as_str().unwrap();
        assert!(message.contains("timed out"), "{message}");
        assert!(!client.is_connected());
        drop(listener);
    }

    #[test]
    fn trickled_reply_is_bounded_by_request_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let _ = paddock_wire::read_frame(&mut conn);
            let reply = br#"{"reply":"__pong__","source":"slowpoke"}"#;
            let _ = conn.write_all(&(reply.len() as u32).to_be_bytes());
            for byte in reply {
                if conn.write_all(&[*byte]).is_err() {
                    return;
                }
                std::thread::sleep(Duration::from_millis(50));
            }
        });

        let mut client = PeerClient::for_port(port, Duration::from_millis(200));
        let started = Instant::now();
        let reply = client.ping();
        assert!(reply["error"].as_str().unwrap().contains("timed out"));
        assert!(started.elapsed() < Duration::from_millis(800), "{:?}", started.elapsed());
        assert!(!client.is_connected());
        drop(client);
        server.join().unwrap();
    }

    #[test]
    fn endpoints_are_normalised() {
        let client = PeerClient::new("127.0.0.1:5600", DEFAULT_REQUEST_TIMEOUT).unwrap();
        assert_eq!(client.endpoint(), "tcp://127.0.0.1:5600");
        assert!(PeerClient::new("tcp://", DEFAULT_REQUEST_TIMEOUT).is_err());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn async_silent_server_times_out() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut client = AsyncPeerClient::for_port(port, Duration::from_millis(100));
        let reply = client.heartbeat().await;
        assert!(reply["error"].as_str().unwrap().contains("timed out"));
    }
}
