use std::{
    fmt::{self, Display, Formatter},
    str::FromStr,
};

pub(crate) const DEFAULT_CLOUD_EVENT_SPEC_VERSION: &str = "1.0";
pub(crate) const DEFAULT_CLOUD_EVENT_EVENT_TYPE: &str = "ms.aio.telemetry";

/// Attribute names from the [CloudEvents 1.0 spec](https://github.com/cloudevents/spec/blob/v1.0/cloudevents/spec.md#context-attributes)
/// that telemetry senders/receivers attach as MQTT user properties alongside a telemetry payload.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum CloudEventFields {
    /// Unique together with [`Source`](CloudEventFields::Source); identifies one occurrence of the event.
    Id,
    /// The context (producer, process, or source type) an event occurred in.
    Source,
    /// Version of the CloudEvents spec the event conforms to; this crate only emits/accepts `"1.0"`.
    SpecVersion,
    /// Producer-defined event classification, often used for routing or policy decisions.
    EventType,
    /// Further qualifies the event within its source, when the source alone is ambiguous.
    Subject,
    /// When the event occurred, or the closest approximation the producer could make.
    Time,
    /// Content type of the telemetry payload carried alongside this event.
    DataContentType,
    /// URI of the schema the telemetry payload conforms to.
    DataSchema,
}

/// All attributes the spec version `"1.0"` requires to be non-empty when present.
const REQUIRED_NONEMPTY_1_0: [CloudEventFields; 8] = [
    CloudEventFields::Id,
    CloudEventFields::Source,
    CloudEventFields::SpecVersion,
    CloudEventFields::EventType,
    CloudEventFields::DataSchema,
    CloudEventFields::Subject,
    CloudEventFields::Time,
    CloudEventFields::DataContentType,
];

impl CloudEventFields {
    pub fn validate(&self, value: &str, spec_version: &str) -> Result<(), String> {
        if spec_version != "1.0" {
            return Err(format!("Invalid spec version: {spec_version}"));
        }
        if REQUIRED_NONEMPTY_1_0.contains(self) && value.is_empty() {
            return Err(format!("{self} cannot be empty"));
        }
        Ok(())
    }
}

impl Display for CloudEventFields {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            CloudEventFields::SpecVersion => write!(f, "specversion"),
            CloudEventFields::EventType => write!(f, "type"),
            CloudEventFields::Source => write!(f, "source"),
            CloudEventFields::Id => write!(f, "id"),
            CloudEventFields::Subject => write!(f, "subject"),
            CloudEventFields::Time => write!(f, "time"),
            CloudEventFields::DataContentType => write!(f, "datacontenttype"),
            CloudEventFields::DataSchema => write!(f, "dataschema"),
        }
    }
}

impl FromStr for CloudEventFields {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "id" => Ok(CloudEventFields::Id),
            "source" => Ok(CloudEventFields::Source),
            "specversion" => Ok(CloudEventFields::SpecVersion),
            "type" => Ok(CloudEventFields::EventType),
            "subject" => Ok(CloudEventFields::Subject),
            "dataschema" => Ok(CloudEventFields::DataSchema),
            "datacontenttype" => Ok(CloudEventFields::DataContentType),
            "time" => Ok(CloudEventFields::Time),
            _ => Err(()),
        }
    }
}
