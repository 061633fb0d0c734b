use std::error::Error;
use std::fmt::Debug;

/// Format indicator for serialization and deserialization.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum FormatIndicator {
    /// Unspecified Bytes
    #[default]
    UnspecifiedBytes = 0,
    /// UTF-8 Encoded Character Data (as JSON)
    Utf8EncodedCharacterData = 1,
}

/// Error returned when an MQTT payload format indicator value doesn't map to a known [`FormatIndicator`].
#[derive(Debug, thiserror::Error)]
#[error("invalid payload format indicator value: {0:?}")]
pub struct InvalidFormatIndicatorError(Option<u8>);

impl TryFrom<Option<u8>> for FormatIndicator {
    type Error = InvalidFormatIndicatorError;

    fn try_from(value: Option<u8>) -> Result<Self, Self::Error> {
        match value {
            None | Some(0) => Ok(FormatIndicator::UnspecifiedBytes),
            Some(1) => Ok(FormatIndicator::Utf8EncodedCharacterData),
            other => Err(InvalidFormatIndicatorError(other)),
        }
    }
}

/// A payload that has been serialized for transmission, paired with the content type and
/// format indicator that describe it on the wire.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SerializedPayload {
    /// The serialized payload bytes.
    pub payload: Vec<u8>,
    /// The content type of the serialized payload, e.g. `application/json`.
    pub content_type: String,
    /// The format indicator to publish alongside the payload.
    pub format_indicator: FormatIndicator,
}

/// Errors that can occur when deserializing a received payload.
#[derive(Debug, thiserror::Error)]
pub enum DeserializationError<E: Debug> {
    /// The payload bytes could not be deserialized into the target type.
    #[error("payload could not be deserialized: {0:?}")]
    InvalidPayload(E),
    /// The content type of the received payload is not supported by the target type.
    #[error("unsupported content type: {0}")]
    UnsupportedContentType(String),
}

/// Trait for serializing and deserializing payloads.
/// # Examples
/// ```
/// use mqtt_protocol::common::payload_serialize::{
///     DeserializationError, FormatIndicator, PayloadSerialize, SerializedPayload,
/// };
/// #[derive(Clone, Debug)]
/// pub struct CarLocationResponse {
///   latitude: f64,
///   longitude: f64,
/// }
/// impl PayloadSerialize for CarLocationResponse {
///   type Error = String;
///   fn serialize(&self) -> Result<SerializedPayload, String> {
///     let response = format!("{{\"latitude\": {}, \"longitude\": {}}}", self.latitude, self.longitude);
///     Ok(SerializedPayload {
///         payload: response.into_bytes(),
///         content_type: "application/json".to_string(),
///         format_indicator: FormatIndicator::Utf8EncodedCharacterData,
///     })
///   }
///   fn deserialize(
///       payload: &[u8],
///       _content_type: Option<&String>,
///       _format_indicator: &FormatIndicator,
///   ) -> Result<Self, DeserializationError<String>> {
///     // mock deserialization here for brevity
///     let _payload = String::from_utf8(payload.to_vec()).map_err(|e| DeserializationError::InvalidPayload(e.to_string()))?;
///     Ok(CarLocationResponse {latitude: 12.0, longitude: 35.0})
///   }
/// }
/// ```
///
pub trait PayloadSerialize: Clone {
    /// The type returned in the event of a serialization/deserialization error
    type Error: Debug + Into<Box<dyn Error + Sync + Send + 'static>>;

    /// Serializes the payload from the generic type into a [`SerializedPayload`] ready to publish.
    ///
    /// # Errors
    /// Returns a [`PayloadSerialize::Error`] if the serialization fails.
    fn serialize(&self) -> Result<SerializedPayload, Self::Error>;

    /// Deserializes a received payload, given the content type and format indicator it was published with.
    ///
    /// # Errors
    /// Returns a [`DeserializationError`] if the content type is unsupported or the payload bytes
    /// could not be deserialized.
    fn deserialize(
        payload: &[u8],
        content_type: Option<&String>,
        format_indicator: &FormatIndicator,
    ) -> Result<Self, DeserializationError<Self::Error>>;
}

#[cfg(test)]
use mockall::mock;
#[cfg(test)]
mock! {
    pub Payload{}
    impl Clone for Payload {
        fn clone(&self) -> Self;
    }
    impl PayloadSerialize for Payload {
        type Error = String;
        fn serialize(&self) -> Result<SerializedPayload, String>;
        fn deserialize(payload: &[u8], content_type: Option<&String>, format_indicator: &FormatIndicator) -> Result<Self, DeserializationError<String>>;
    }
}

/// Held by tests that mock [`MockPayload::deserialize`] to serialize access to the global mock
/// context across concurrently-running tests.
#[cfg(test)]
pub static DESERIALIZE_MTX: std::sync::Mutex<()> = std::sync::Mutex::new(());
