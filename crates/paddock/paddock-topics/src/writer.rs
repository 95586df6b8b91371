use crate::error::TopicError;
use crate::topic::Topic;
use paddock_shm::{FrameWriter, ShmConfig, WriteStatus};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

/// What happened to the frame staged during one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickStatus {
    Published { seq: u64, topics: usize },
    /// Nothing was staged; no frame is sent.
    Empty,
    /// A staged payload failed to serialize, so the whole tick was discarded.
    Dropped,
    /// The underlying writer is closed.
    Closed,
}

/// Batches named JSON payloads into one frame per tick.
///
/// ```ignore
/// writer.add("telemetry", &telemetry);
/// writer.add("track", &track);
/// writer.write()?; // one frame: {"telemetry": {...}, "track": {...}}
/// ```
pub struct TopicWriter {
    transport: FrameWriter,
    staged: Map<String, Value>,
    /// First topic whose payload failed to serialize this tick.
    failed: Option<String>,
}

impl TopicWriter {
    pub fn new(transport: FrameWriter) -> Self {
        Self {
            transport,
            staged: Map::new(),
            failed: None,
        }
    }

    pub fn create(cfg: &ShmConfig) -> Result<Self, TopicError> {
        Ok(Self::new(FrameWriter::create(cfg)?))
    }

    /// Stages `payload` under `topic`, replacing anything staged for it this tick.
    pub fn add<T: Serialize + ?Sized>(&mut self, topic: &str, payload: &T) {
        match serde_json::to_value(payload) {
            Ok(value) => {
                self.staged.insert(topic.to_owned(), value);
            }
            Err(e) => {
                warn!(topic, error = %e, "payload is not JSON-serializable");
                self.failed.get_or_insert_with(|| topic.to_owned());
            }
        }
    }

    pub fn add_typed<T: Topic>(&mut self, payload: &T) {
        self.add(T::NAME, payload);
    }

    /// Serializes the staged topics as one UTF-8 JSON object and publishes it.
    ///
    /// Staged state is cleared whatever the outcome.
    ///
    /// # Errors
    /// Only transport configuration errors (an oversized frame).
    pub fn write(&mut self) -> Result<TickStatus, TopicError> {
        let staged = std::mem::take(&mut self.staged);
        if let Some(topic) = self.failed.take() {
            warn!(topic = %topic, dropped = staged.len(), "dropping tick after serialization failure");
            return Ok(TickStatus::Dropped);
        }
        if staged.is_empty() {
            return Ok(TickStatus::Empty);
        }

        let topics = staged.len();
        let bytes = match serde_json::to_vec(&staged) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "failed to encode frame, dropping tick");
                return Ok(TickStatus::Dropped);
            }
        };
        match self.transport.write(&bytes)? {
            WriteStatus::Published { seq } => {
                debug!(seq, topics, bytes = bytes.len(), "published topic frame");
                Ok(TickStatus::Published { seq, topics })
            }
            WriteStatus::Closed => Ok(TickStatus::Closed),
        }
    }

    /// Topics staged for the current tick.
    pub fn staged_topics(&self) -> impl Iterator<Item = &str> {
        self.staged.keys().map(String::as_str)
    }

    pub fn close(&mut self) {
        self.staged.clear();
        self.failed = None;
        self.transport.close();
    }

    pub fn transport(&self) -> &FrameWriter {
        &self.transport
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::ser::Error as _;
    use serde::{Serialize, Serializer};

    struct Unserializable;

    impl Serialize for Unserializable {
        fn serialize<S: Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
            Err(S::Error::custom("not today"))
        }
    }

    fn writer(dir: &tempfile::TempDir) -> TopicWriter {
        let cfg = ShmConfig::new(dir.path().join("topics").to_str().unwrap()).with_max_msg_size(256);
        TopicWriter::create(&cfg).unwrap()
    }

    #[test]
    fn empty_tick_is_not_sent() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = writer(&dir);
        assert_eq!(w.write().unwrap(), TickStatus::Empty);
        assert_eq!(w.transport().seq(), 0);
    }

    #[test]
    fn later_add_overwrites_topic() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = writer(&dir);
        w.add("speed", &100);
        w.add("speed", &120);
        w.add("gear", &4);
        let mut topics: Vec<_> = w.staged_topics().collect();
        topics.sort_unstable();
        assert_eq!(topics, ["gear", "speed"]);
        assert_eq!(
            w.write().unwrap(),
            TickStatus::Published { seq: 1, topics: 2 }
        );
        assert_eq!(w.staged_topics().count(), 0);
    }

    #[test]
    fn bad_payload_drops_whole_tick() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = writer(&dir);
        w.add("fine", &1);
        w.add("broken", &Unserializable);
        assert_eq!(w.write().unwrap(), TickStatus::Dropped);
        assert_eq!(w.transport().seq(), 0);

        // The next tick is unaffected.
        w.add("fine", &2);
        assert!(matches!(w.write().unwrap(), TickStatus::Published { .. }));
    }

    #[test]
    fn oversized_frame_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = writer(&dir);
        w.add("blob", &"x".repeat(1024));
        assert!(matches!(
            w.write(),
            Err(TopicError::Transport(paddock_shm::ShmError::PayloadTooLarge { .. }))
        ));
    }

    #[test]
    fn closed_writer_reports_closed() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = writer(&dir);
        w.close();
        w.add("late", &true);
        assert_eq!(w.write().unwrap(), TickStatus::Closed);
    }
}
