//! A message is an immutable record of something that happened, written to
//! exactly one stream. Messages are created by writes, never mutated, and
//! destroyed only when their namespace is dropped.

use std::borrow::Cow;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::stream_name::StreamName;

/// The metadata key that links a message back to its originating stream,
/// enabling category-correlation filtering.
pub const CORRELATION_STREAM_NAME_KEY: &str = "correlationStreamName";

/// A committed message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message<'a> {
    /// Unique within the namespace. Generated at write time unless the
    /// caller supplies one.
    pub id: Uuid,
    /// Stream the message belongs to.
    pub stream_name: StreamName<'a>,
    /// Message type, application-defined.
    #[serde(rename = "type")]
    pub msg_type: Cow<'a, str>,
    /// Gapless 0-based sequence within the stream.
    pub position: i64,
    /// Strictly increasing within the namespace, across all streams. May
    /// have gaps.
    pub global_position: i64,
    /// Message payload. May be an empty object, never absent.
    pub data: Cow<'a, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Cow<'a, Value>>,
    /// Time the message was committed, UTC.
    #[serde(with = "rfc3339_nanos")]
    pub time: DateTime<Utc>,
}

impl<'a> Message<'a> {
    /// The stream named by the `correlationStreamName` metadata key, if any.
    pub fn correlation_stream_name(&self) -> Option<StreamName<'_>> {
        let correlation = self
            .metadata
            .as_deref()?
            .get(CORRELATION_STREAM_NAME_KEY)?
            .as_str()?;
        StreamName::new(correlation).ok()
    }

    pub fn into_owned(self) -> Message<'static> {
        Message {
            id: self.id,
            stream_name: self.stream_name.into_owned(),
            msg_type: Cow::Owned(self.msg_type.into_owned()),
            position: self.position,
            global_position: self.global_position,
            data: Cow::Owned(self.data.into_owned()),
            metadata: self.metadata.map(|m| Cow::Owned(m.into_owned())),
            time: self.time,
        }
    }
}

/// RFC3339 with nanosecond precision, the store's canonical time encoding.
mod rfc3339_nanos {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{de, ser};

    pub fn serialize<S>(dt: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: ser::Serializer,
    {
        serializer.serialize_str(&dt.to_rfc3339_opts(SecondsFormat::Nanos, true))
    }

    pub fn deserialize<'de, D>(d: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: de::Deserializer<'de>,
    {
        struct Rfc3339Visitor;

        impl<'de> de::Visitor<'de> for Rfc3339Visitor {
            type Value = DateTime<Utc>;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("an RFC3339 timestamp")
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                DateTime::parse_from_rfc3339(value)
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(de::Error::custom)
            }
        }

        d.deserialize_str(Rfc3339Visitor)
    }
}
