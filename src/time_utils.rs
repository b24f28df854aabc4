use std::fmt;
use std::str::FromStr;

use serde::de::{self, Deserialize, Deserializer, Visitor};
use serde::{Serialize, Serializer};
use time::format_description::well_known::Rfc3339;
use time::{OffsetDateTime, UtcOffset};

/// A UTC instant with microsecond precision.
///
/// Always formatted with the fixed width [`TIME_FORMAT`], so the text stored
/// in the database sorts in time order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Time(OffsetDateTime);

pub(crate) const TIME_FORMAT : &[time::format_description::FormatItem<
    'static,
>] = time::macros::format_description!(
    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z"
);

impl Time {
    pub fn now() -> Self {
        OffsetDateTime::now_utc().into()
    }

    /// Parses any RFC 3339 timestamp, whatever its offset.
    pub fn parse(s : &str) -> Result<Self, time::error::Parse> {
        Ok(OffsetDateTime::parse(s.trim(), &Rfc3339)?.into())
    }

    pub fn format(&self) -> String {
        // every component of TIME_FORMAT exists on a UTC datetime
        self.0.format(&TIME_FORMAT).unwrap_or_default()
    }
}

impl From<OffsetDateTime> for Time {
    fn from(t : OffsetDateTime) -> Self {
        let t = t.to_offset(UtcOffset::UTC);
        let micros = t.nanosecond() / 1_000 * 1_000;

        Time(t.replace_nanosecond(micros).unwrap_or(t))
    }
}

impl FromStr for Time {
    type Err = time::error::Parse;

    fn from_str(s : &str) -> Result<Self, Self::Err> {
        Time::parse(s)
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f : &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.format())
    }
}

impl std::ops::Deref for Time {
    type Target = OffsetDateTime;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Serialize for Time {
    fn serialize<S>(
        &self,
        serializer : S,
    ) -> std::result::Result<S::Ok, S::Error>
    where
        S : Serializer,
    {
        self.format().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Time {
    fn deserialize<D>(deserializer : D) -> std::result::Result<Self, D::Error>
    where
        D : Deserializer<'de>,
    {
        struct TimeVisitor;

        impl<'de> Visitor<'de> for TimeVisitor {
            type Value = Time;

            fn expecting(&self, f : &mut fmt::Formatter) -> fmt::Result {
                f.write_str("an RFC 3339 timestamp")
            }

            fn visit_str<E : de::Error>(self, v : &str) -> Result<Time, E> {
                Time::parse(v).map_err(E::custom)
            }
        }

        deserializer.deserialize_str(TimeVisitor)
    }
}
