//! Envoys for Telemetry operations.

use crate::ProtocolVersion;

/// This module contains the telemetry sender implementation.
pub mod telemetry_sender;

/// This module contains the telemetry receiver implementation.
pub mod telemetry_receiver;

/// This module contains the cloud events enum and structs for the MQTT request/response and telemetry protocol.
pub mod cloud_event;

/// Protocol version used by all telemetry envoys in this module
pub(crate) const TELEMETRY_PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion { major: 1, minor: 0 };
/// Assumed version if no version is provided.
pub(crate) const DEFAULT_TELEMETRY_PROTOCOL_VERSION: ProtocolVersion =
    ProtocolVersion { major: 1, minor: 0 };
