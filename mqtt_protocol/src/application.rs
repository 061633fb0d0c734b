//! Application-wide utilities for use with the protocol crate.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::common::hybrid_logical_clock::{HLCError, HybridLogicalClock};

const DEFAULT_MAX_CLOCK_DRIFT: u64 = 60;

/// Struct containing the application-level [`HybridLogicalClock`], shared across every envoy
/// created from the same [`ApplicationContext`].
pub struct ApplicationHybridLogicalClock {
    hlc: Mutex<HybridLogicalClock>,
    max_clock_drift: Duration,
}

impl ApplicationHybridLogicalClock {
    /// Creates a new [`ApplicationHybridLogicalClock`] with the provided maximum clock drift, in seconds.
    #[must_use]
    pub fn new(max_clock_drift: u64) -> Self {
        Self {
            hlc: Mutex::new(HybridLogicalClock::new()),
            max_clock_drift: Duration::from_secs(max_clock_drift),
        }
    }

    /// Reads the current value of the [`ApplicationHybridLogicalClock`].
    #[must_use]
    pub fn read(&self) -> HybridLogicalClock {
        self.hlc.lock().unwrap().clone()
    }

    /// Updates the [`ApplicationHybridLogicalClock`] against another [`HybridLogicalClock`], as
    /// happens when a timestamp is received from a remote party.
    ///
    /// # Errors
    /// [`HLCError`] if the update would overflow the counter or the resulting timestamp would
    /// exceed the configured maximum clock drift.
    pub(crate) fn update(&self, other: &HybridLogicalClock) -> Result<(), HLCError> {
        self.hlc.lock().unwrap().update(other, self.max_clock_drift)
    }

    /// Updates the [`ApplicationHybridLogicalClock`] against the current time and returns the
    /// resulting timestamp serialized for use in the `__ts` user property.
    ///
    /// # Errors
    /// A [`ProtocolError`](crate::common::protocol_error::ProtocolError) if the update would
    /// overflow the counter or the resulting timestamp would exceed the configured maximum clock drift.
    pub(crate) fn update_now(&self) -> Result<String, crate::common::protocol_error::ProtocolError> {
        let mut hlc = self.hlc.lock().unwrap();
        hlc.update_now(self.max_clock_drift)?;
        Ok(hlc.to_string())
    }
}

/// Struct containing the application context for the protocol crate.
///
/// <div class="warning"> There must be a max of one per session and there should only be one per application (which may contain multiple sessions). </div>
#[derive(Builder, Clone)]
#[builder(build_fn(name = "build_inner", private))]
pub struct ApplicationContext {
    /// The [`ApplicationHybridLogicalClock`] used by the application.
    #[builder(setter(custom), default = "self.default_application_hlc()")]
    pub application_hlc: Arc<ApplicationHybridLogicalClock>,
}

impl ApplicationContextBuilder {
    /// Sets the maximum clock drift, in seconds, allowed for the application's
    /// [`ApplicationHybridLogicalClock`].
    pub fn max_clock_drift(&mut self, max_clock_drift: u64) -> &mut Self {
        self.application_hlc = Some(Arc::new(ApplicationHybridLogicalClock::new(max_clock_drift)));
        self
    }

    fn default_application_hlc(&self) -> Arc<ApplicationHybridLogicalClock> {
        Arc::new(ApplicationHybridLogicalClock::new(DEFAULT_MAX_CLOCK_DRIFT))
    }

    /// Builds a new [`ApplicationContext`].
    ///
    /// # Errors
    /// Currently infallible; returns [`ApplicationContextBuilderError`] for forward compatibility
    /// with `derive_builder`'s generated API.
    pub fn build(&self) -> Result<ApplicationContext, ApplicationContextBuilderError> {
        self.build_inner()
    }
}
