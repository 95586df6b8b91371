#[derive(Debug, thiserror::Error)]
pub enum TopicError {
    #[error(transparent)]
    Transport(#[from] paddock_shm::ShmError),

    #[error("a handler is already registered for topic '{0}'")]
    DuplicateTopic(String),
}
