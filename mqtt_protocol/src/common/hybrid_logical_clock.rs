use std::{
    fmt::{self, Display},
    str::FromStr,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use thiserror::Error;
use uuid::Uuid;

use super::protocol_error::ProtocolError;

/// Recommended default value for max clock drift if not specified.
pub const DEFAULT_MAX_CLOCK_DRIFT: Duration = Duration::from_secs(60);

/// Hybrid Logical Clock (HLC) generating unique timestamps
#[derive(Clone, Debug, PartialEq)]
pub struct HybridLogicalClock {
    /// Current timestamp.
    pub timestamp: SystemTime,
    /// Counter is used to coordinate ordering of events within a distributed system where each
    /// device may have slightly different system clock times.
    pub counter: u64,
    /// Unique identifier for this node.
    pub node_id: String,
}

impl Default for HybridLogicalClock {
    fn default() -> Self {
        Self::new()
    }
}

impl HybridLogicalClock {
    /// Creates a new [`HybridLogicalClock`] with the current timestamp, a counter of 0,
    /// and a unique identifier
    #[must_use]
    pub fn new() -> Self {
        Self {
            timestamp: now_ms_precision(),
            counter: 0,
            node_id: Uuid::new_v4().to_string(),
        }
    }

    /// Updates the [`HybridLogicalClock`] based on another [`HybridLogicalClock`].
    /// Self will be set to the latest timestamp between itself, other, and the current time, and
    /// its counter will also be updated accordingly.
    ///
    /// Note: Update performed against another [`HybridLogicalClock`] with the same [`node_id`](HybridLogicalClock::node_id)
    /// is a no-op, and will not result in an error.
    ///
    /// # Errors
    /// [`HLCError`] of kind [`OverflowWarning`](HLCErrorKind::OverflowWarning) if
    /// the [`HybridLogicalClock`]'s counter would be set to a value that would overflow beyond [`u64::MAX`]
    ///
    /// [`HLCError`] of kind [`ClockDrift`](HLCErrorKind::ClockDrift) if the latest [`HybridLogicalClock`]
    /// (of `Self` or `other`)'s timestamp is too far in the future (determined by `max_clock_drift`)
    /// compared to [`SystemTime::now()`]
    pub fn update(
        &mut self,
        other: &HybridLogicalClock,
        max_clock_drift: Duration,
    ) -> Result<(), HLCError> {
        let now = now_ms_precision();
        // Don't update from the same node.
        if self.node_id == other.node_id {
            return Ok(());
        }

        // if now is the latest timestamp in the future, set the time to that and reset the counter
        if now > self.timestamp && now > other.timestamp {
            self.timestamp = now;
            self.counter = 0;
        }
        // if the timestamps are equal, take the max of the counters and increment by 1
        else if other.timestamp == self.timestamp {
            if self.counter >= other.counter {
                self.validate(now, max_clock_drift)?;
                self.counter += 1;
            } else {
                // timestamp matches, so validating other implicitly validates self.timestamp
                other.validate(now, max_clock_drift)?;
                self.counter = other.counter + 1;
            }
        }
        // if this timestamp is the latest, increase the counter by 1
        else if self.timestamp > other.timestamp {
            self.validate(now, max_clock_drift)?;
            self.counter += 1;
        }
        // if the other timestamp is the latest, set the time to that use the other counter + 1
        else if other.timestamp > self.timestamp {
            other.validate(now, max_clock_drift)?;
            self.timestamp = other.timestamp;
            self.counter = other.counter + 1;
        }
        // all cases are covered at this point, so there is no need for a final else
        Ok(())
    }

    /// Updates the [`HybridLogicalClock`] based on the current time
    ///
    /// # Errors
    /// [`HLCError`] of kind [`OverflowWarning`](HLCErrorKind::OverflowWarning) if
    /// the [`HybridLogicalClock`]'s counter would be set to a value that would overflow beyond [`u64::MAX`]
    ///
    /// [`HLCError`] of kind [`ClockDrift`](HLCErrorKind::ClockDrift) if the [`HybridLogicalClock`]
    /// timestamp is too far in the future (determined by `max_clock_drift`) compared to [`SystemTime::now()`]
    /// compared to [`SystemTime::now()`]
    pub fn update_now(&mut self, max_clock_drift: Duration) -> Result<(), HLCError> {
        let now = now_ms_precision();

        // if now later than self, set the time to that and reset the counter
        if now > self.timestamp {
            self.timestamp = now;
            self.counter = 0;
        } else {
            self.validate(now, max_clock_drift)?;
            self.counter += 1;
        }
        Ok(())
    }

    /// Validates that the HLC is not too far in the future compared to the current time,
    /// and that the counter will not overflow if it is increased.
    ///
    /// # Errors
    /// [`HLCError`] of kind [`OverflowWarning`](HLCErrorKind::OverflowWarning) if
    /// the [`HybridLogicalClock`]'s counter would be set to a value that would overflow beyond [`u64::MAX`]
    ///
    /// [`HLCError`] of kind [`ClockDrift`](HLCErrorKind::ClockDrift) if the [`HybridLogicalClock`]
    /// timestamp is too far in the future (determined by `max_clock_drift`) compared to [`SystemTime::now()`]
    fn validate(&self, now: SystemTime, max_clock_drift: Duration) -> Result<(), HLCError> {
        if self.counter == u64::MAX {
            return Err(HLCErrorKind::OverflowWarning)?;
        }
        if let Ok(diff) = self.timestamp.duration_since(now) {
            if diff > max_clock_drift {
                return Err(HLCErrorKind::ClockDrift)?;
            }
        } // else negative time difference is ok, we only care if the HLC is too far in the future

        Ok(())
    }
}

impl Display for HybridLogicalClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ms_since_epoch = self
            .timestamp
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis();
        write!(
            f,
            "{:0>15}:{:0>5}:{}",
            ms_since_epoch, self.counter, self.node_id
        )
    }
}

impl FromStr for HybridLogicalClock {
    type Err = ParseHLCError;

    fn from_str(s: &str) -> Result<Self, ParseHLCError> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 3 {
            return Err(ParseHLCError {
                message: "Incorrect format".to_string(),
                input: s.to_string(),
            });
        }

        // Validate first part (timestamp)
        let ms_since_epoch = match parts[0].parse::<u64>() {
            Ok(ms) => ms,
            Err(e) => {
                return Err(ParseHLCError {
                    message: format!(
                        "Malformed HLC. Could not parse first segment as an integer: {e}"
                    ),
                    input: s.to_string(),
                })
            }
        };
        let Some(timestamp) = UNIX_EPOCH.checked_add(Duration::from_millis(ms_since_epoch)) else {
            return Err(ParseHLCError {
                message: "Malformed HLC. Timestamp is out of range.".to_string(),
                input: s.to_string(),
            });
        };

        // Validate second part (counter)
        let counter = match parts[1].parse::<u64>() {
            Ok(val) => val,
            Err(e) => {
                return Err(ParseHLCError {
                    message: format!(
                        "Malformed HLC. Could not parse second segment as an integer: {e}"
                    ),
                    input: s.to_string(),
                });
            }
        };

        // The node_id is just the third section as a string

        Ok(Self {
            timestamp,
            counter,
            node_id: parts[2].to_string(),
        })
    }
}

/// All HLCs are rounded to the nearest millisecond to avoid issues with
/// string comparison, so now should also be rounded to the nearest millisecond.
fn now_ms_precision() -> SystemTime {
    #[cfg(not(test))]
    let now = SystemTime::now();

    // allow setting an offset for testing
    #[cfg(test)]
    let now = {
        let mut offset_now = SystemTime::now();
        let offset = TIME_OFFSET.with(std::cell::Cell::get);
        let positive = TIME_OFFSET_POS.with(std::cell::Cell::get);
        if positive {
            offset_now = offset_now.checked_add(offset).unwrap();
        } else {
            offset_now = offset_now.checked_sub(offset).unwrap();
        }
        offset_now
    };

    if let Ok(dur_since_epoch) = now.duration_since(UNIX_EPOCH) {
        let sec_since_epoch = dur_since_epoch.as_secs();
        let ms_since_epoch = dur_since_epoch.subsec_millis();
        if let Some(now) =
            UNIX_EPOCH.checked_add(Duration::new(sec_since_epoch, ms_since_epoch * 1_000_000))
        {
            return now;
        }
    }
    // If any errors occur while rounding to the nearest millisecond, just return the current time
    log::warn!(
        "Error rounding SystemTime::now() to the nearest millisecond. Returning unrounded time."
    );
    now
}

/// Represents errors that occur in the use of an HLC
#[derive(Debug, Error)]
#[error("{0}")]
pub struct HLCError(#[from] HLCErrorKind);

impl HLCError {
    /// Returns the corresponding [`HLCErrorKind`] for this error
    #[must_use]
    pub fn kind(&self) -> &HLCErrorKind {
        &self.0
    }
}

/// A list specifying categories of HLC error
#[derive(Debug, Error)]
pub enum HLCErrorKind {
    /// The counter would be incremented to a value that would overflow beyond [`u64::MAX`]
    #[error("counter cannot be incremented")]
    OverflowWarning,
    /// The HLC's timestamp is too far in the future compared to the current time
    #[error("exceeds max clock drift")]
    ClockDrift,
}

impl From<HLCError> for ProtocolError {
    fn from(err: HLCError) -> Self {
        match err.kind() {
            HLCErrorKind::OverflowWarning => ProtocolError::new_internal_logic_error(
                false,
                false,
                None,
                None,
                "hlc_counter",
                None,
                Some(err.to_string()),
                None,
            ),
            HLCErrorKind::ClockDrift => {
                ProtocolError::new_state_invalid_error("hlc_timestamp", None, Some(err.to_string()), None)
            }
        }
    }
}

/// Represents errors that occur when parsing an HLC from a string
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ParseHLCError {
    /// The error message
    message: String,
    /// The input string that failed to parse
    // NOTE: This is only needed for ProtocolError compatibility
    pub(crate) input: String,
}

// Functions to allow manipulation of the system time for testing purposes
#[cfg(test)]
use std::cell::Cell;

#[cfg(test)]
thread_local! {
    static TIME_OFFSET: Cell<Duration> = const { Cell::new(Duration::from_secs(0)) };
    static TIME_OFFSET_POS: Cell<bool> = const { Cell::new(false) };
}

#[cfg(test)]
fn set_time_offset(offset: Duration, positive: bool) {
    TIME_OFFSET.with(|time_offset| time_offset.set(offset));
    TIME_OFFSET_POS.with(|time_offset_pos| time_offset_pos.set(positive));
}
