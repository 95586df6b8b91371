//! Blocking endpoint clients for a [`Broker`](crate::Broker).

use crate::error::BrokerError;
use crate::frame::BrokerFrame;
use paddock_wire::{FrameBuffer, format_endpoint, parse_endpoint, write_frame};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::net::TcpStream;
use std::time::{Duration, Instant};
use tracing::debug;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Socket timeouts of zero mean "block forever" to the OS.
const MIN_WAIT: Duration = Duration::from_millis(1);

/// A message delivered to a subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, BrokerError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// A subscription change seen by a publisher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionEvent {
    Subscribed(String),
    Unsubscribed(String),
}

/// One connected socket plus its partial-frame buffer.
#[derive(Debug)]
struct Link {
    stream: TcpStream,
    inbound: FrameBuffer,
    endpoint: String,
}

impl Link {
    fn connect(endpoint: &str) -> Result<Self, BrokerError> {
        let addr = parse_endpoint(endpoint)?;
        let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
        stream.set_nodelay(true)?;
        stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
        debug!(endpoint = %format_endpoint(addr), "connected to broker");
        Ok(Self {
            stream,
            inbound: FrameBuffer::new(),
            endpoint: format_endpoint(addr),
        })
    }

    fn send(&mut self, frame: &BrokerFrame) -> Result<(), BrokerError> {
        write_frame(&mut self.stream, &frame.encode())?;
        Ok(())
    }

    /// Next frame within `timeout`; `None` if nothing complete arrived.
    fn recv(&mut self, timeout: Duration) -> Result<Option<BrokerFrame>, BrokerError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(body) = self.inbound.next_frame()? {
                return BrokerFrame::decode(&body).map(Some);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            self.stream.set_read_timeout(Some(remaining.max(MIN_WAIT)))?;
            self.inbound.fill_from(&mut self.stream)?;
        }
    }
}

/// Connects to the broker's xsub endpoint and publishes.
#[derive(Debug)]
pub struct Publisher {
    link: Link,
}

impl Publisher {
    pub fn connect(xsub_endpoint: &str) -> Result<Self, BrokerError> {
        Ok(Self {
            link: Link::connect(xsub_endpoint)?,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.link.endpoint
    }

    pub fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), BrokerError> {
        self.link.send(&BrokerFrame::message(topic, payload)?)
    }

    pub fn publish_json<T: Serialize + ?Sized>(&mut self, topic: &str, value: &T) -> Result<(), BrokerError> {
        let payload = serde_json::to_vec(value)?;
        self.publish(topic, &payload)
    }

    /// Waits up to `timeout` for a subscription announcement.
    pub fn recv_subscription(&mut self, timeout: Duration) -> Result<Option<SubscriptionEvent>, BrokerError> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.link.recv(remaining)? {
                Some(BrokerFrame::Subscribe(prefix)) => return Ok(Some(SubscriptionEvent::Subscribed(prefix))),
                Some(BrokerFrame::Unsubscribe(prefix)) => {
                    return Ok(Some(SubscriptionEvent::Unsubscribed(prefix)));
                }
                Some(BrokerFrame::Message { .. }) => continue,
                None => return Ok(None),
            }
        }
    }
}

/// Connects to the broker's xpub endpoint and receives matching messages.
#[derive(Debug)]
pub struct Subscriber {
    link: Link,
}

impl Subscriber {
    pub fn connect(xpub_endpoint: &str) -> Result<Self, BrokerError> {
        Ok(Self {
            link: Link::connect(xpub_endpoint)?,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.link.endpoint
    }

    /// `""` subscribes to everything.
    pub fn subscribe(&mut self, prefix: &str) -> Result<(), BrokerError> {
        self.link.send(&BrokerFrame::Subscribe(prefix.to_owned()))
    }

    pub fn unsubscribe(&mut self, prefix: &str) -> Result<(), BrokerError> {
        self.link.send(&BrokerFrame::Unsubscribe(prefix.to_owned()))
    }

    /// Waits up to `timeout` for the next message.
    pub fn recv(&mut self, timeout: Duration) -> Result<Option<Message>, BrokerError> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.link.recv(remaining)? {
                Some(BrokerFrame::Message { topic, payload }) => return Ok(Some(Message { topic, payload })),
                Some(_) => continue,
                None => return Ok(None),
            }
        }
    }
}
