//! Common utilities for use with the protocol.

/// Implementation of hybrid logical clock.
pub mod hybrid_logical_clock;

/// This module contains a trait that payload structs should implement to be serializable.
pub mod payload_serialize;

/// This module contains the error type for the MQTT request/response and telemetry protocol.
pub mod protocol_error;

/// This module contains the `major.minor` protocol version type shared by all envoys.
pub mod protocol_version;

/// This module contains the topic processor functions for the MQTT request/response and telemetry protocol
pub mod topic_processor;

/// This module contains string values for MQTT request/response and telemetry protocol defined user properties.
pub mod user_properties;

/// Used to validate that a string is well-formed UTF-8 per the [MQTT 5 spec](https://docs.oasis-open.org/mqtt/mqtt/v5.0/os/mqtt-v5.0-os.html#_UTF-8_Encoded_String)
#[must_use]
pub fn is_invalid_utf8(s: &str) -> bool {
    s.chars()
        .any(|c| ('\u{0000}'..='\u{001F}').contains(&c) || ('\u{007F}'..='\u{009F}').contains(&c))
}
