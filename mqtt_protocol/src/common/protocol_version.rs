//! Parsing and comparison of the `major.minor` protocol version carried in the `__protVer`/`__requestProtVer` user properties.

use std::fmt;

/// A `major.minor` protocol version.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ProtocolVersion {
    /// Major version. A mismatch here is not supported.
    pub major: u16,
    /// Minor version. Newer minor versions are expected to be backwards compatible.
    pub minor: u16,
}

impl ProtocolVersion {
    /// Parse a `"<major>.<minor>"` string into a [`ProtocolVersion`].
    ///
    /// Returns `None` if the string is not of the form `<u16>.<u16>`.
    #[must_use]
    pub fn parse_protocol_version(s: &str) -> Option<Self> {
        let (major, minor) = s.split_once('.')?;
        Some(Self {
            major: major.parse().ok()?,
            minor: minor.parse().ok()?,
        })
    }

    /// Returns true if `self.major` is one of the `supported_major_versions`.
    #[must_use]
    pub fn is_supported(&self, supported_major_versions: &[u16]) -> bool {
        supported_major_versions.contains(&self.major)
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Parse a space-separated list of supported major versions (as sent in `__supProtMajVer`).
///
/// Entries that do not parse as `u16` are skipped rather than rejecting the whole list, since
/// this value is only used for diagnostics on an already-failed version negotiation.
#[must_use]
pub fn parse_supported_protocol_major_versions(s: &str) -> Vec<u16> {
    s.split_whitespace()
        .filter_map(|v| v.parse().ok())
        .collect()
}

/// Render a list of major versions back into the space-separated wire format.
#[must_use]
pub fn supported_protocol_major_versions_to_string(versions: &[u16]) -> String {
    versions
        .iter()
        .map(std::string::ToString::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_version() {
        assert_eq!(
            ProtocolVersion::parse_protocol_version("1.0"),
            Some(ProtocolVersion { major: 1, minor: 0 })
        );
    }

    #[test]
    fn rejects_malformed_version() {
        assert_eq!(ProtocolVersion::parse_protocol_version("1"), None);
        assert_eq!(ProtocolVersion::parse_protocol_version("a.b"), None);
    }

    #[test]
    fn is_supported_checks_major_only() {
        let v = ProtocolVersion { major: 1, minor: 3 };
        assert!(v.is_supported(&[1, 2]));
        assert!(!v.is_supported(&[2, 3]));
    }

    #[test]
    fn parses_supported_major_versions_list() {
        assert_eq!(
            parse_supported_protocol_major_versions("1 2 garbage 3"),
            vec![1, 2, 3]
        );
    }

    #[test]
    fn display_round_trips_parse() {
        let v = ProtocolVersion { major: 2, minor: 5 };
        assert_eq!(
            ProtocolVersion::parse_protocol_version(&v.to_string()),
            Some(v)
        );
    }
}
