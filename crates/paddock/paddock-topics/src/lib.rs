//! Named JSON topics multiplexed over a shared-memory frame region.
//!
//! A producer stages any number of topic payloads per tick with
//! [`TopicWriter::add`] and publishes them as one frame; consumers register
//! per-topic handlers on a [`TopicDispatcher`] and feed it raw frames, usually
//! through a [`TopicReader`] loop.

mod dispatcher;
mod error;
mod reader;
mod topic;
mod writer;

pub use dispatcher::{DispatchReport, TopicDispatcher, TopicHandler};
pub use error::TopicError;
pub use reader::TopicReader;
pub use topic::Topic;
pub use writer::{TickStatus, TopicWriter};
