//! Utilities for using the MQTT request/response and telemetry protocol over MQTT.

#![warn(missing_docs)]
#![allow(clippy::result_large_err)]

pub mod application;
pub mod common;
pub mod rpc_command;
pub mod telemetry;

pub use common::protocol_version::{
    parse_supported_protocol_major_versions, supported_protocol_major_versions_to_string,
    ProtocolVersion,
};

#[macro_use]
extern crate derive_builder;
