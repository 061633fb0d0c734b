use std::error::Error;
use std::fmt;
use std::time::Duration;

/// Represents the kind of error that occurs in an MQTT request/response and telemetry protocol
#[derive(Debug, PartialEq)]
pub enum ProtocolErrorKind {
    /// A required MQTT header property is missing on a received message
    HeaderMissing,
    /// An MQTT header property has an invalid value on a received message
    HeaderInvalid,
    /// MQTT payload cannot be serialized or deserialized
    PayloadInvalid,
    /// An operation was aborted due to timeout
    Timeout,
    /// An operation was cancelled
    Cancellation,
    /// A struct or enum field, configuration file, or environment variable has an invalid value
    ConfigurationInvalid,
    /// A function was called with an invalid argument value
    ArgumentInvalid,
    /// The current program state is invalid vis-a-vis the function that was called
    StateInvalid,
    /// The client or service observed a condition that was thought to be impossible
    InternalLogicError,
    /// The client or service received an unexpected error from a dependent component
    UnknownError,
    /// The command processor identified an error in the request
    InvocationError,
    /// The command processor encountered an error while executing the command
    ExecutionError,
    /// The MQTT communication encountered an error and failed. The exception message should be inspected for additional information
    MqttError,
    /// The remote party does not support any protocol version this endpoint is willing to speak
    NotSupportedVersion,
    /// The session client lost its MQTT session and cannot recover it
    SessionLost,
}

/// Represents the possible types of the value of a property
#[derive(Debug, PartialEq)]
pub enum Value {
    /// A 32-bit integer value
    Integer(i32),
    /// A 64-bit floating point value
    Float(f64),
    /// A String value
    String(String),
    /// A bool value
    Boolean(bool),
}

/// Represents an error that occurred in the MQTT request/response and telemetry protocol
#[derive(Debug)]
pub struct ProtocolError {
    /// The error message
    pub message: Option<String>,
    /// The specific kind of error that occurred
    pub kind: ProtocolErrorKind,
    /// True if the error occurred in user-supplied code rather than the SDK or its dependent components
    pub in_application: bool,
    /// True if the error was identified immediately after the API was called, prior to any attempted network communication
    pub is_shallow: bool,
    /// True if the error was detected by a remote component
    pub is_remote: bool,
    /// Error from a dependent component that caused this error
    pub nested_error: Option<Box<dyn Error>>,
    /// An HTTP status code received from a remote service that caused the error being reported
    pub http_status_code: Option<u16>,
    /// The name of a MQTT header that is missing or has an invalid value
    pub header_name: Option<String>,
    /// The value of a MQTT header that is invalid
    pub header_value: Option<String>,
    /// The name of a timeout condition that elapsed
    pub timeout_name: Option<String>,
    /// The duration of a timeout condition that elapsed
    pub timeout_value: Option<Duration>,
    /// The name of a function argument or a field in a struct or enum, configuration file, or environment variable that is missing or has an invalid value
    pub property_name: Option<String>,
    /// The value of a function argument or a field in a struct or enum, configuration file, or environment variable that is invalid
    pub property_value: Option<Value>,
    /// The name of a command relevant to the error being reported
    pub command_name: Option<String>,
    /// The `major.minor` protocol version reported by a remote party, if known
    pub protocol_version: Option<String>,
    /// The list of protocol major versions a remote party reported as supported, if known
    pub supported_protocol_major_versions: Option<Vec<u16>>,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(message) = &self.message {
            write!(f, "{message}")
        } else {
            match self.kind {
                ProtocolErrorKind::HeaderMissing => write!(
                    f,
                    "The MQTT header '{}' is missing",
                    self.header_name.as_deref().unwrap_or("Not Specified")
                ),
                ProtocolErrorKind::HeaderInvalid => write!(
                    f,
                    "The MQTT header '{}' has an invalid value: '{}'",
                    self.header_name.as_deref().unwrap_or("Not Specified"),
                    self.header_value.as_deref().unwrap_or("Not Specified")
                ),
                ProtocolErrorKind::PayloadInvalid => write!(
                    f,
                    "Serialization or deserialization of the MQTT payload failed"
                ),
                ProtocolErrorKind::Timeout => write!(
                    f,
                    "The timeout '{}' elapsed after {} ms",
                    self.timeout_name.as_deref().unwrap_or("Not Specified"),
                    self.timeout_value.map_or_else(
                        || "Not Specified".to_string(),
                        |d| d.as_millis().to_string()
                    )
                ),
                ProtocolErrorKind::Cancellation => write!(f, "The operation was cancelled"),
                ProtocolErrorKind::ConfigurationInvalid => {
                    if let Some(property_value) = &self.property_value {
                        write!(
                            f,
                            "The property '{}' has an invalid value: {:?}",
                            self.property_name.as_deref().unwrap_or("Not Specified"),
                            property_value
                        )
                    } else {
                        write!(
                            f,
                            "The property '{}' has an invalid value: 'Not Specified'",
                            self.property_name.as_deref().unwrap_or("Not Specified")
                        )
                    }
                }
                ProtocolErrorKind::ArgumentInvalid => {
                    if let Some(property_value) = &self.property_value {
                        write!(
                            f,
                            "The argument '{}' has an invalid value: {:?}",
                            self.property_name.as_deref().unwrap_or("Not Specified"),
                            property_value
                        )
                    } else {
                        write!(
                            f,
                            "The argument '{}' has an invalid value: 'Not Specified'",
                            self.property_name.as_deref().unwrap_or("Not Specified")
                        )
                    }
                }
                ProtocolErrorKind::StateInvalid => write!(
                    f,
                    "Invalid state in property '{}'",
                    self.property_name.as_deref().unwrap_or("Not Specified")
                ),
                ProtocolErrorKind::InternalLogicError => write!(
                    f,
                    "Internal logic error in property '{}'",
                    self.property_name.as_deref().unwrap_or("Not Specified")
                ),
                ProtocolErrorKind::UnknownError => write!(f, "An unknown error occurred"),
                ProtocolErrorKind::InvocationError => write!(
                    f,
                    "The command processor identified an error in the request"
                ),
                ProtocolErrorKind::ExecutionError => write!(
                    f,
                    "The command processor encountered an error while executing the command"
                ),
                ProtocolErrorKind::MqttError => {
                    write!(f, "An MQTT communication error occurred")
                }
                ProtocolErrorKind::NotSupportedVersion => write!(
                    f,
                    "The remote party does not support protocol version '{}'",
                    self.property_value
                        .as_ref()
                        .map_or_else(|| "Not Specified".to_string(), |v| format!("{v:?}"))
                ),
                ProtocolErrorKind::SessionLost => {
                    write!(f, "The MQTT session was lost and could not be recovered")
                }
            }
        }
    }
}

impl Error for ProtocolError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.nested_error.as_ref().map(std::convert::AsRef::as_ref)
    }
}

impl ProtocolError {
    /// Creates a new [`ProtocolError`] for a missing MQTT header
    #[must_use]
    pub fn new_header_missing_error(
        header_name: &str,
        is_remote: bool,
        http_status_code: Option<u16>,
        message: Option<String>,
        command_name: Option<String>,
    ) -> ProtocolError {
        let mut e = ProtocolError {
            message,
            kind: ProtocolErrorKind::HeaderMissing,
            in_application: false,
            is_shallow: false,
            is_remote,
            nested_error: None,
            http_status_code,
            header_name: Some(header_name.to_string()),
            header_value: None,
            timeout_name: None,
            timeout_value: None,
            property_name: None,
            property_value: None,
            command_name,
            protocol_version: None,
            supported_protocol_major_versions: None,
        };
        e.ensure_error_message();
        e
    }

    /// Creates a new [`ProtocolError`] for an invalid MQTT header value
    #[must_use]
    pub fn new_header_invalid_error(
        header_name: &str,
        header_value: &str,
        is_remote: bool,
        http_status_code: Option<u16>,
        message: Option<String>,
        command_name: Option<String>,
    ) -> ProtocolError {
        let mut e = ProtocolError {
            message,
            kind: ProtocolErrorKind::HeaderInvalid,
            in_application: false,
            is_shallow: false,
            is_remote,
            nested_error: None,
            http_status_code,
            header_name: Some(header_name.to_string()),
            header_value: Some(header_value.to_string()),
            timeout_name: None,
            timeout_value: None,
            property_name: None,
            property_value: None,
            command_name,
            protocol_version: None,
            supported_protocol_major_versions: None,
        };
        e.ensure_error_message();
        e
    }

    /// Creates a new [`ProtocolError`] for an invalid MQTT payload
    #[must_use]
    pub fn new_payload_invalid_error(
        is_shallow: bool,
        is_remote: bool,
        nested_error: Option<Box<dyn Error>>,
        http_status_code: Option<u16>,
        message: Option<String>,
        command_name: Option<String>,
    ) -> ProtocolError {
        let mut e = ProtocolError {
            message,
            kind: ProtocolErrorKind::PayloadInvalid,
            in_application: false,
            is_shallow,
            is_remote,
            nested_error,
            http_status_code,
            header_name: None,
            header_value: None,
            timeout_name: None,
            timeout_value: None,
            property_name: None,
            property_value: None,
            command_name,
            protocol_version: None,
            supported_protocol_major_versions: None,
        };
        e.ensure_error_message();
        e
    }

    /// Creates a new [`ProtocolError`] for a timeout
    #[must_use]
    pub fn new_timeout_error(
        is_remote: bool,
        nested_error: Option<Box<dyn Error>>,
        http_status_code: Option<u16>,
        timeout_name: &str,
        timeout_value: Duration,
        message: Option<String>,
        command_name: Option<String>,
    ) -> ProtocolError {
        let mut e = ProtocolError {
            message,
            kind: ProtocolErrorKind::Timeout,
            in_application: false,
            is_shallow: false,
            is_remote,
            nested_error,
            http_status_code,
            header_name: None,
            header_value: None,
            timeout_name: Some(timeout_name.to_string()),
            timeout_value: Some(timeout_value),
            property_name: None,
            property_value: None,
            command_name,
            protocol_version: None,
            supported_protocol_major_versions: None,
        };
        e.ensure_error_message();
        e
    }

    /// Creates a new [`ProtocolError`] for a cancellation error
    #[must_use]
    pub fn new_cancellation_error(
        is_remote: bool,
        nested_error: Option<Box<dyn Error>>,
        http_status_code: Option<u16>,
        message: Option<String>,
        command_name: Option<String>,
    ) -> ProtocolError {
        let mut e = ProtocolError {
            message,
            kind: ProtocolErrorKind::Cancellation,
            in_application: false,
            is_shallow: false,
            is_remote,
            nested_error,
            http_status_code,
            header_name: None,
            header_value: None,
            timeout_name: None,
            timeout_value: None,
            property_name: None,
            property_value: None,
            command_name,
            protocol_version: None,
            supported_protocol_major_versions: None,
        };
        e.ensure_error_message();
        e
    }

    /// Creates a new [`ProtocolError`] for an invalid configuration error
    #[must_use]
    pub fn new_configuration_invalid_error(
        nested_error: Option<Box<dyn Error>>,
        property_name: &str,
        property_value: Value,
        message: Option<String>,
        command_name: Option<String>,
    ) -> ProtocolError {
        let mut e = ProtocolError {
            message,
            kind: ProtocolErrorKind::ConfigurationInvalid,
            in_application: false,
            is_shallow: true,
            is_remote: false,
            nested_error,
            http_status_code: None,
            header_name: None,
            header_value: None,
            timeout_name: None,
            timeout_value: None,
            property_name: Some(property_name.to_string()),
            property_value: Some(property_value),
            command_name,
            protocol_version: None,
            supported_protocol_major_versions: None,
        };
        e.ensure_error_message();
        e
    }

    /// Creates a new [`ProtocolError`] for an invalid argument error
    #[must_use]
    pub fn new_argument_invalid_error(
        property_name: &str,
        property_value: Value,
        message: Option<String>,
        command_name: Option<String>,
    ) -> ProtocolError {
        let mut e = ProtocolError {
            message,
            kind: ProtocolErrorKind::ArgumentInvalid,
            in_application: false,
            is_shallow: true,
            is_remote: false,
            nested_error: None,
            http_status_code: None,
            header_name: None,
            header_value: None,
            timeout_name: None,
            timeout_value: None,
            property_name: Some(property_name.to_string()),
            property_value: Some(property_value),
            command_name,
            protocol_version: None,
            supported_protocol_major_versions: None,
        };
        e.ensure_error_message();
        e
    }

    /// Creates a new [`ProtocolError`] for an invalid state error
    #[must_use]
    pub fn new_state_invalid_error(
        property_name: &str,
        property_value: Option<Value>,
        message: Option<String>,
        command_name: Option<String>,
    ) -> ProtocolError {
        let mut e = ProtocolError {
            message,
            kind: ProtocolErrorKind::StateInvalid,
            in_application: false,
            is_shallow: true,
            is_remote: false,
            nested_error: None,
            http_status_code: None,
            header_name: None,
            header_value: None,
            timeout_name: None,
            timeout_value: None,
            property_name: Some(property_name.to_string()),
            property_value,
            command_name,
            protocol_version: None,
            supported_protocol_major_versions: None,
        };
        e.ensure_error_message();
        e
    }

    /// Creates a new [`ProtocolError`] for an internal logic error
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new_internal_logic_error(
        is_shallow: bool,
        is_remote: bool,
        nested_error: Option<Box<dyn Error>>,
        http_status_code: Option<u16>,
        property_name: &str,
        property_value: Option<Value>,
        message: Option<String>,
        command_name: Option<String>,
    ) -> ProtocolError {
        let mut e = ProtocolError {
            message,
            kind: ProtocolErrorKind::InternalLogicError,
            in_application: false,
            is_shallow,
            is_remote,
            nested_error,
            http_status_code,
            header_name: None,
            header_value: None,
            timeout_name: None,
            timeout_value: None,
            property_name: Some(property_name.to_string()),
            property_value,
            command_name,
            protocol_version: None,
            supported_protocol_major_versions: None,
        };
        e.ensure_error_message();
        e
    }

    /// Creates a new [`ProtocolError`] for an unknown error
    #[must_use]
    pub fn new_unknown_error(
        is_remote: bool,
        is_shallow: bool,
        nested_error: Option<Box<dyn Error>>,
        http_status_code: Option<u16>,
        message: Option<String>,
        command_name: Option<String>,
    ) -> ProtocolError {
        let mut e = ProtocolError {
            message,
            kind: ProtocolErrorKind::UnknownError,
            in_application: false,
            is_shallow,
            is_remote,
            nested_error,
            http_status_code,
            header_name: None,
            header_value: None,
            timeout_name: None,
            timeout_value: None,
            property_name: None,
            property_value: None,
            command_name,
            protocol_version: None,
            supported_protocol_major_versions: None,
        };
        e.ensure_error_message();
        e
    }

    /// Creates a new [`ProtocolError`] for an invocation exception
    #[must_use]
    pub fn new_invocation_exception_error(
        http_status_code: u16,
        property_name: Option<&str>,
        property_value: Option<Value>,
        message: Option<String>,
        command_name: Option<String>,
    ) -> ProtocolError {
        let mut e = ProtocolError {
            message,
            kind: ProtocolErrorKind::InvocationError,
            in_application: true,
            is_shallow: false,
            is_remote: true,
            nested_error: None,
            http_status_code: Some(http_status_code),
            header_name: None,
            header_value: None,
            timeout_name: None,
            timeout_value: None,
            property_name: property_name.map(std::string::ToString::to_string),
            property_value,
            command_name,
            protocol_version: None,
            supported_protocol_major_versions: None,
        };
        e.ensure_error_message();
        e
    }

    /// Creates a new [`ProtocolError`] for an execution exception error
    #[must_use]
    pub fn new_execution_exception_error(
        http_status_code: u16,
        property_name: Option<&str>,
        property_value: Option<Value>,
        message: Option<String>,
        command_name: Option<String>,
    ) -> ProtocolError {
        let mut e = ProtocolError {
            message,
            kind: ProtocolErrorKind::ExecutionError,
            in_application: true,
            is_shallow: false,
            is_remote: true,
            nested_error: None,
            http_status_code: Some(http_status_code),
            header_name: None,
            header_value: None,
            timeout_name: None,
            timeout_value: None,
            property_name: property_name.map(std::string::ToString::to_string),
            property_value,
            command_name,
            protocol_version: None,
            supported_protocol_major_versions: None,
        };
        e.ensure_error_message();
        e
    }

    /// Creates a new [`ProtocolError`] for an MQTT communication error
    #[must_use]
    pub fn new_mqtt_error(
        message: Option<String>,
        nested_error: Box<dyn Error>,
        command_name: Option<String>,
    ) -> ProtocolError {
        let mut e = ProtocolError {
            message,
            kind: ProtocolErrorKind::MqttError,
            in_application: false,
            is_shallow: false,
            is_remote: false,
            nested_error: Some(nested_error),
            http_status_code: None,
            header_name: None,
            header_value: None,
            timeout_name: None,
            timeout_value: None,
            property_name: None,
            property_value: None,
            command_name,
            protocol_version: None,
            supported_protocol_major_versions: None,
        };
        e.ensure_error_message();
        e
    }

    /// Creates a new [`ProtocolError`] for an unsupported protocol version
    #[must_use]
    pub fn new_unsupported_version_error(
        message: Option<String>,
        requested_protocol_version: String,
        supported_major_versions: Vec<u16>,
        command_name: Option<String>,
        is_remote: bool,
        is_shallow: bool,
    ) -> ProtocolError {
        let mut e = ProtocolError {
            message,
            kind: ProtocolErrorKind::NotSupportedVersion,
            in_application: false,
            is_shallow,
            is_remote,
            nested_error: None,
            http_status_code: Some(505),
            header_name: Some("__supProtMajVer".to_string()),
            header_value: Some(
                supported_major_versions
                    .iter()
                    .map(std::string::ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(" "),
            ),
            timeout_name: None,
            timeout_value: None,
            property_name: Some("__requestProtVer".to_string()),
            property_value: Some(Value::String(requested_protocol_version)),
            command_name,
            protocol_version: None,
            supported_protocol_major_versions: None,
        };
        e.ensure_error_message();
        e
    }

    /// Creates a new [`ProtocolError`] for a lost MQTT session
    #[must_use]
    pub fn new_session_lost_error(command_name: Option<String>) -> ProtocolError {
        let mut e = ProtocolError {
            message: None,
            kind: ProtocolErrorKind::SessionLost,
            in_application: false,
            is_shallow: false,
            is_remote: false,
            nested_error: None,
            http_status_code: None,
            header_name: None,
            header_value: None,
            timeout_name: None,
            timeout_value: None,
            property_name: None,
            property_value: None,
            command_name,
            protocol_version: None,
            supported_protocol_major_versions: None,
        };
        e.ensure_error_message();
        e
    }

    /// Creates a new [`ProtocolError`] for a configuration-invalid error caused by a
    /// [`TopicPatternError`](crate::common::topic_processor::TopicPatternError)
    #[must_use]
    pub fn config_invalid_from_topic_pattern_error(
        err: crate::common::topic_processor::TopicPatternError,
        property_name: &str,
    ) -> ProtocolError {
        let message = err.to_string();
        ProtocolError::new_configuration_invalid_error(
            Some(Box::new(err)),
            property_name,
            Value::String(message.clone()),
            Some(message),
            None,
        )
    }

    /// Sets the error's message to a default value if a custom message is not already set
    pub fn ensure_error_message(&mut self) {
        if self.message.is_none() {
            self.message = Some(self.to_string());
        }
    }
}
