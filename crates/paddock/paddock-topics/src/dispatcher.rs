use crate::error::TopicError;
use crate::topic::Topic;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use tracing::{debug, warn};

/// Callback invoked with the payload of one topic.
pub type TopicHandler = Box<dyn FnMut(&Value) -> anyhow::Result<()> + Send>;

/// Per-frame dispatch counts.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    /// Handlers that ran to completion.
    pub delivered: usize,
    /// Handlers that returned an error or panicked.
    pub failed: usize,
    /// Topics present in the frame with no handler.
    pub unhandled: usize,
}

/// Routes the topics of a decoded frame to their registered handlers.
#[derive(Default)]
pub struct TopicDispatcher {
    handlers: HashMap<String, TopicHandler>,
}

impl TopicDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `topic`.
    ///
    /// # Errors
    /// [`TopicError::DuplicateTopic`] if the topic already has a handler.
    pub fn on<F>(&mut self, topic: &str, handler: F) -> Result<(), TopicError>
    where
        F: FnMut(&Value) -> anyhow::Result<()> + Send + 'static,
    {
        if self.handlers.contains_key(topic) {
            return Err(TopicError::DuplicateTopic(topic.to_owned()));
        }
        self.handlers.insert(topic.to_owned(), Box::new(handler));
        Ok(())
    }

    /// Registers a handler that receives the payload decoded as `T`.
    ///
    /// A payload that does not match `T` counts as a handler failure.
    pub fn on_typed<T, F>(&mut self, mut handler: F) -> Result<(), TopicError>
    where
        T: Topic,
        F: FnMut(T) -> anyhow::Result<()> + Send + 'static,
    {
        self.on(T::NAME, move |value| {
            let payload = T::deserialize(value)?;
            handler(payload)
        })
    }

    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    /// Decodes a raw frame and dispatches each topic that has a handler.
    ///
    /// Malformed JSON and non-object frames are logged and ignored. A failing
    /// handler never prevents the other topics of the same frame from running.
    pub fn on_payload(&mut self, raw: &[u8]) -> DispatchReport {
        let mut report = DispatchReport::default();
        let frame = match serde_json::from_slice::<Value>(raw) {
            Ok(Value::Object(frame)) => frame,
            Ok(other) => {
                warn!(kind = json_kind(&other), "ignoring frame that is not a JSON object");
                return report;
            }
            Err(e) => {
                warn!(error = %e, len = raw.len(), "ignoring malformed frame");
                return report;
            }
        };

        for (topic, payload) in &frame {
            let Some(handler) = self.handlers.get_mut(topic) else {
                report.unhandled += 1;
                continue;
            };
            match catch_unwind(AssertUnwindSafe(|| handler(payload))) {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(e)) => {
                    report.failed += 1;
                    warn!(topic = %topic, error = %e, "topic handler failed");
                }
                Err(panic) => {
                    report.failed += 1;
                    warn!(topic = %topic, panic = panic_message(&panic), "topic handler panicked");
                }
            }
        }
        debug!(?report, "dispatched frame");
        report
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

pub(crate) fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "handler panicked"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Gear {
        gear: i8,
    }

    impl Topic for Gear {
        const NAME: &'static str = "gear";
    }

    fn recorder() -> (Arc<Mutex<Vec<Value>>>, impl FnMut(&Value) -> anyhow::Result<()> + Send) {
        let seen: Arc<Mutex<Vec<Value>>> = Arc::default();
        let sink = Arc::clone(&seen);
        (seen, move |v: &Value| {
            sink.lock().unwrap().push(v.clone());
            Ok(())
        })
    }

    #[test]
    fn duplicate_topic_is_rejected() {
        let mut d = TopicDispatcher::new();
        d.on("speed", |_| Ok(())).unwrap();
        assert!(matches!(
            d.on("speed", |_| Ok(())),
            Err(TopicError::DuplicateTopic(t)) if t == "speed"
        ));
    }

    #[test]
    fn failing_handlers_are_isolated() {
        let mut d = TopicDispatcher::new();
        let (seen, record) = recorder();
        d.on("a_err", |_| anyhow::bail!("boom")).unwrap();
        d.on("b_panic", |_| panic!("kaboom")).unwrap();
        d.on("c_ok", record).unwrap();

        let report = d.on_payload(br#"{"a_err": 1, "b_panic": 2, "c_ok": 3, "other": 4}"#);
        assert_eq!(
            report,
            DispatchReport {
                delivered: 1,
                failed: 2,
                unhandled: 1
            }
        );
        assert_eq!(*seen.lock().unwrap(), vec![serde_json::json!(3)]);
    }

    #[test]
    fn malformed_and_non_object_frames_are_ignored() {
        let mut d = TopicDispatcher::new();
        let (seen, record) = recorder();
        d.on("x", record).unwrap();

        assert_eq!(d.on_payload(b"{not json"), DispatchReport::default());
        assert_eq!(d.on_payload(b"[1, 2, 3]"), DispatchReport::default());
        assert_eq!(d.on_payload(&[0xff, 0xfe]), DispatchReport::default());
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn typed_handler_validates_shape() {
        let mut d = TopicDispatcher::new();
        let gears: Arc<Mutex<Vec<Gear>>> = Arc::default();
        let sink = Arc::clone(&gears);
        d.on_typed::<Gear, _>(move |g| {
            sink.lock().unwrap().push(g);
            Ok(())
        })
        .unwrap();

        assert_eq!(d.on_payload(br#"{"gear": {"gear": 3}}"#).delivered, 1);
        assert_eq!(d.on_payload(br#"{"gear": {"gear": "third"}}"#).failed, 1);
        assert_eq!(*gears.lock().unwrap(), vec![Gear { gear: 3 }]);
    }

    #[test]
    fn panic_messages_fall_back_for_odd_payloads() {
        let text: Box<dyn std::any::Any + Send> = Box::new("brake bias");
        let owned: Box<dyn std::any::Any + Send> = Box::new(String::from("tyre temps"));
        let odd: Box<dyn std::any::Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(&text), "brake bias");
        assert_eq!(panic_message(&owned), "tyre temps");
        assert_eq!(panic_message(&odd), "handler panicked");
    }
}
