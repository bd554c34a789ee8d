use std::fmt::{Display, Formatter};
use std::str::FromStr;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::StorageError;

const FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

/// UTC timestamp with millisecond precision, printed as `2000-01-01T01:00:00.000Z`.
/// The default value (Unix epoch) is treated as "unset".
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UtcTime(DateTime<Utc>);

impl UtcTime {
    pub fn new(t: DateTime<Utc>) -> Self { Self(t.trunc_subsecs(3)) }

    pub fn now() -> Self { Self::new(Utc::now()) }

    pub fn is_zero(&self) -> bool { self.0.timestamp_millis() == 0 }

    pub fn as_datetime(&self) -> DateTime<Utc> { self.0 }

    pub fn timestamp_nanos(&self) -> i64 { self.0.timestamp_millis().saturating_mul(1_000_000) }

    /// Filesystem-safe form, `:` is not allowed on every platform.
    pub fn dir_name(&self) -> String { self.to_string().replace(':', "-") }
}

impl Default for UtcTime {
    fn default() -> Self { Self(DateTime::<Utc>::default()) }
}

impl From<DateTime<Utc>> for UtcTime {
    fn from(t: DateTime<Utc>) -> Self { Self::new(t) }
}

impl Display for UtcTime {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result { write!(f, "{}", self.0.format(FORMAT)) }
}

impl FromStr for UtcTime {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DateTime::parse_from_rfc3339(s)
            .map(|t| UtcTime::new(t.with_timezone(&Utc)))
            .map_err(|e| StorageError::InvalidTimestamps(format!("cannot parse \"{}\": {}", s, e)))
    }
}

impl Serialize for UtcTime {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> { serializer.collect_str(self) }
}

impl<'de> Deserialize<'de> for UtcTime {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
