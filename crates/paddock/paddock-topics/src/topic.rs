use serde::Serialize;
use serde::de::DeserializeOwned;

/// A payload shape bound to a fixed topic name.
///
/// Application payloads implement this so producers and consumers agree on
/// both the name and the shape; the JSON value is validated against `Self`
/// at the dispatch boundary.
pub trait Topic: Serialize + DeserializeOwned {
    const NAME: &'static str;
}
