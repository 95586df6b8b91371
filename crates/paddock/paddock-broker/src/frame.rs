//! Broker wire messages.
//!
//! Every message travels in a length-prefixed frame (see `paddock_wire`); the
//! first body byte says what it is:
//!
//! ```text
//! 0x00 prefix...                         unsubscribe
//! 0x01 prefix...                         subscribe
//! 0x02 topic_len(u16 BE) topic payload...  message
//! ```
//!
//! Subscriptions flow subscriber → broker → publishers; messages flow the
//! other way and are delivered to subscribers holding a matching prefix.

use crate::error::BrokerError;

const KIND_UNSUBSCRIBE: u8 = 0x00;
const KIND_SUBSCRIBE: u8 = 0x01;
const KIND_MESSAGE: u8 = 0x02;

pub const MAX_TOPIC_LEN: usize = u16::MAX as usize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerFrame {
    Subscribe(String),
    Unsubscribe(String),
    Message { topic: String, payload: Vec<u8> },
}

impl BrokerFrame {
    pub fn message(topic: &str, payload: &[u8]) -> Result<Self, BrokerError> {
        if topic.len() > MAX_TOPIC_LEN {
            return Err(BrokerError::TopicTooLong {
                len: topic.len(),
                max: MAX_TOPIC_LEN,
            });
        }
        Ok(BrokerFrame::Message {
            topic: topic.to_owned(),
            payload: payload.to_vec(),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            BrokerFrame::Subscribe(prefix) => tagged(KIND_SUBSCRIBE, prefix.as_bytes()),
            BrokerFrame::Unsubscribe(prefix) => tagged(KIND_UNSUBSCRIBE, prefix.as_bytes()),
            BrokerFrame::Message { topic, payload } => {
                let mut out = Vec::with_capacity(3 + topic.len() + payload.len());
                out.push(KIND_MESSAGE);
                // `message()` bounds the length; truncation cannot happen for
                // frames built through it.
                out.extend_from_slice(&(topic.len() as u16).to_be_bytes());
                out.extend_from_slice(topic.as_bytes());
                out.extend_from_slice(payload);
                out
            }
        }
    }

    pub fn decode(body: &[u8]) -> Result<Self, BrokerError> {
        let (&kind, rest) = body
            .split_first()
            .ok_or(BrokerError::MalformedFrame("empty frame"))?;
        match kind {
            KIND_SUBSCRIBE => Ok(BrokerFrame::Subscribe(utf8(rest)?)),
            KIND_UNSUBSCRIBE => Ok(BrokerFrame::Unsubscribe(utf8(rest)?)),
            KIND_MESSAGE => {
                let (len, rest) = rest
                    .split_first_chunk::<2>()
                    .ok_or(BrokerFrame::truncated())?;
                let len = u16::from_be_bytes(*len) as usize;
                if rest.len() < len {
                    return Err(BrokerFrame::truncated());
                }
                let (topic, payload) = rest.split_at(len);
                Ok(BrokerFrame::Message {
                    topic: utf8(topic)?,
                    payload: payload.to_vec(),
                })
            }
            _ => Err(BrokerError::MalformedFrame("unknown frame kind")),
        }
    }

    fn truncated() -> BrokerError {
        BrokerError::MalformedFrame("truncated message header")
    }
}

fn tagged(kind: u8, rest: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + rest.len());
    out.push(kind);
    out.extend_from_slice(rest);
    out
}

fn utf8(bytes: &[u8]) -> Result<String, BrokerError> {
    String::from_utf8(bytes.to_vec()).map_err(|_| BrokerError::MalformedFrame("topic is not UTF-8"))
}

/// Empty prefix matches every topic.
pub fn topic_matches(prefix: &str, topic: &str) -> bool {
    topic.starts_with(prefix)
}
