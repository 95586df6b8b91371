use crate::dispatcher::TopicDispatcher;
use paddock_shm::{FrameReader, ReaderHandle, ShmConfig, StopFlag};
use std::io;

/// A frame reader loop feeding a [`TopicDispatcher`].
///
/// Register handlers with [`dispatcher_mut`](Self::dispatcher_mut), then run
/// the loop on the current thread, a dedicated thread, or as a task.
pub struct TopicReader {
    frames: FrameReader,
    dispatcher: TopicDispatcher,
}

impl TopicReader {
    pub fn new(cfg: ShmConfig) -> Self {
        Self {
            frames: FrameReader::new(cfg),
            dispatcher: TopicDispatcher::new(),
        }
    }

    pub fn dispatcher_mut(&mut self) -> &mut TopicDispatcher {
        &mut self.dispatcher
    }

    pub fn stop_flag(&self) -> StopFlag {
        self.frames.stop_flag()
    }

    pub fn run(&mut self) {
        let dispatcher = &mut self.dispatcher;
        self.frames.run(|raw| {
            dispatcher.on_payload(raw);
        });
    }

    pub async fn run_async(&mut self) {
        let dispatcher = &mut self.dispatcher;
        self.frames
            .run_async(|raw| {
                dispatcher.on_payload(raw);
            })
            .await;
    }

    pub fn spawn(self) -> io::Result<ReaderHandle> {
        let Self {
            frames,
            mut dispatcher,
        } = self;
        frames.spawn(move |raw| {
            dispatcher.on_payload(raw);
        })
    }
}
