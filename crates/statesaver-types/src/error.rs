//! Error types for record construction and payload parsing.

/// A [`NewEvent`](crate::NewEvent) was built without a mandatory field.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    /// The event type was empty.
    #[error("event record is missing its type")]
    MissingType,

    /// The raw payload was empty.
    #[error("event record is missing its raw payload")]
    MissingPayload,
}

/// A raw payload could not be turned into an [`EventPayload`](crate::EventPayload).
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    /// The payload is not valid JSON or does not match the event shape.
    #[error("malformed event payload: {0}")]
    Malformed(#[from] serde_json::Error),

    /// A field required to index the event is present but empty.
    #[error("event payload field `{0}` is empty")]
    MissingField(&'static str),

    /// The payload was accepted but the record built from it was not.
    #[error("invalid event record: {0}")]
    Record(#[from] RecordError),
}
