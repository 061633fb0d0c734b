use std::{
    fmt::{self, Display, Formatter},
    str::FromStr,
};

/// A reserved prefix for all user properties known to `mqtt_protocol` and `mqtt_transport`; custom properties from user code should not start with this prefix.
pub const RESERVED_PREFIX: &str = "__";

/// A user property key reserved for broker-side partition routing; invokers attach it to every
/// request and executors strip it on receipt rather than surfacing it as custom user data.
pub const PARTITION_KEY: &str = "__partition";

/// Enum representing the system properties.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum UserProperty {
    /// A [`HybridLogicalClock`](super::hybrid_logical_clock::HybridLogicalClock) timestamp associated with the request or response.
    Timestamp,
    /// User Property indicating an HTTP status code.
    Status,
    /// User Property indicating a human-readable status message; used when Status != 200 (OK).
    StatusMessage,
    /// User property indicating if a non-200 see <cref="Status"/> is an application-level error.
    IsApplicationError,
    /// User Property indicating the source ID of a request, response, or message.
    SourceId,
    /// The name of an MQTT property in a request header that is missing or has an invalid value.
    InvalidPropertyName,
    /// The value of an MQTT property in a request header that is invalid.
    InvalidPropertyValue,
    /// User property that indicates the protocol version of an RPC/telemetry request.
    ProtocolVersion,
    /// User property indicating which major versions the command executor supports. The value of
    /// this property is a space-separated list of integers like "1 2 3".
    SupportedMajorVersions,
    /// User property indicating what protocol version the request had.
    /// This property is only used when a command executor rejects a command invocation because the
    /// requested protocol version either wasn't supported or was malformed.
    RequestProtocolVersion,
}

impl Display for UserProperty {
    /// Get the string representation of the user property.
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            UserProperty::Timestamp => write!(f, "__ts"),
            UserProperty::Status => write!(f, "__stat"),
            UserProperty::StatusMessage => write!(f, "__stMsg"),
            UserProperty::IsApplicationError => write!(f, "__apErr"),
            UserProperty::SourceId => write!(f, "__srcId"),
            UserProperty::InvalidPropertyName => write!(f, "__invalidPropertyName"),
            UserProperty::InvalidPropertyValue => write!(f, "__invalidPropertyValue"),
            UserProperty::ProtocolVersion => write!(f, "__protVer"),
            UserProperty::SupportedMajorVersions => write!(f, "__supProtMajVer"),
            UserProperty::RequestProtocolVersion => write!(f, "__requestProtVer"),
        }
    }
}

impl FromStr for UserProperty {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "__ts" => Ok(UserProperty::Timestamp),
            "__stat" => Ok(UserProperty::Status),
            "__stMsg" => Ok(UserProperty::StatusMessage),
            "__apErr" => Ok(UserProperty::IsApplicationError),
            "__srcId" => Ok(UserProperty::SourceId),
            "__invalidPropertyName" => Ok(UserProperty::InvalidPropertyName),
            "__invalidPropertyValue" => Ok(UserProperty::InvalidPropertyValue),
            "__protVer" => Ok(UserProperty::ProtocolVersion),
            "__supProtMajVer" => Ok(UserProperty::SupportedMajorVersions),
            "__requestProtVer" => Ok(UserProperty::RequestProtocolVersion),
            _ => Err(()),
        }
    }
}

/// Validates a vector of custom user properties provided to the protocol crate.
///
/// # Errors
/// Returns a `String` describing the error if any of `property_list`'s keys or values are invalid utf-8
pub fn validate_user_properties(property_list: &[(String, String)]) -> Result<(), String> {
    for (key, value) in property_list {
        if super::is_invalid_utf8(key) || super::is_invalid_utf8(value) {
            return Err(format!(
                "Invalid user data key '{key}' or value '{value}' isn't valid utf-8"
            ));
        }
    }
    Ok(())
}

/// Validates a vector of custom user properties provided by a command invoker.
///
/// # Errors
/// Returns a `String` describing the error if any of `property_list`'s keys or values are invalid
/// utf-8, or if a key uses the [`RESERVED_PREFIX`] or is the reserved [`PARTITION_KEY`].
pub fn validate_invoker_user_properties(property_list: &[(String, String)]) -> Result<(), String> {
    validate_user_properties(property_list)?;
    for (key, _) in property_list {
        if key == PARTITION_KEY || key.starts_with(RESERVED_PREFIX) {
            return Err(format!("Invalid user data key '{key}' uses a reserved prefix or name"));
        }
    }
    Ok(())
}
