use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use snafu::Snafu;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::OffsetDateTime;

/// UTC instant with microsecond precision.
///
/// Serialized everywhere as RFC-3339 with a timezone offset. Ordering follows
/// the instant, independent of the offset the string form carried.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Timestamp(OffsetDateTime);

#[derive(Debug, Snafu)]
#[snafu(display("invalid timestamp `{input}`"))]
pub struct TimestampParseError {
    input: String,
    source: time::error::Parse,
}

impl Timestamp {
    pub const UNIX_EPOCH: Timestamp = Timestamp(OffsetDateTime::UNIX_EPOCH);

    pub fn now() -> Self {
        // Truncate to microseconds so a value survives the string round-trip
        // unchanged.
        let now = OffsetDateTime::now_utc();
        let nanos = now.nanosecond();
        Self(now - Duration::from_nanos(u64::from(nanos % 1_000)))
    }

    pub fn from_unix_micros(micros: i64) -> Self {
        Self(
            OffsetDateTime::from_unix_timestamp_nanos(i128::from(micros) * 1_000)
                .unwrap_or(OffsetDateTime::UNIX_EPOCH),
        )
    }

    pub fn unix_micros(&self) -> i64 {
        i64::try_from(self.0.unix_timestamp_nanos() / 1_000).unwrap_or(i64::MAX)
    }

    /// Fixed-width UTC form (`YYYY-MM-DDTHH:MM:SS.ffffffZ`).
    ///
    /// Lexicographic order equals chronological order, which the SQL planner
    /// relies on for `BETWEEN` and `ORDER BY` over TEXT columns. Plain
    /// RFC-3339 does not have this property (fraction digits vary).
    pub fn to_sortable(&self) -> String {
        self.0
            .to_offset(time::UtcOffset::UTC)
            .format(format_description!(
                "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z"
            ))
            .expect("formatting into a String cannot fail")
    }

    /// Day bucket (`YYYY-MM-DD`, UTC) used by the `created_date` index column.
    pub fn date_bucket(&self) -> String {
        self.0
            .to_offset(time::UtcOffset::UTC)
            .date()
            .format(format_description!("[year]-[month]-[day]"))
            .expect("formatting a date into a String cannot fail")
    }

    pub fn checked_add(&self, d: Duration) -> Option<Self> {
        self.0.checked_add(d.try_into().ok()?).map(Self)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self
            .0
            .format(&Rfc3339)
            .expect("RFC-3339 formatting cannot fail for in-range values");
        f.write_str(&s)
    }
}

impl FromStr for Timestamp {
    type Err = TimestampParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parsed = OffsetDateTime::parse(s, &Rfc3339).map_err(|source| TimestampParseError {
            input: s.to_owned(),
            source,
        })?;
        Ok(Self(parsed.to_offset(time::UtcOffset::UTC)))
    }
}

impl serde::Serialize for Timestamp {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for Timestamp {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = <String as serde::Deserialize>::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_normalizes_offset_to_utc() {
        let a: Timestamp = "2024-06-01T12:00:00+02:00".parse().unwrap();
        let b: Timestamp = "2024-06-01T10:00:00Z".parse().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "2024-06-01T10:00:00Z");
    }

    #[test]
    fn string_round_trip() {
        let now = Timestamp::now();
        let back: Timestamp = now.to_string().parse().unwrap();
        assert_eq!(now, back);
    }

    #[test]
    fn date_bucket_is_utc_day() {
        let ts: Timestamp = "2024-01-31T23:30:00-05:00".parse().unwrap();
        assert_eq!(ts.date_bucket(), "2024-02-01");
    }

    #[test]
    fn sortable_form_is_fixed_width_and_ordered() {
        let early: Timestamp = "2024-06-01T10:00:00Z".parse().unwrap();
        let late: Timestamp = "2024-06-01T10:00:00.5Z".parse().unwrap();
        assert_eq!(early.to_sortable(), "2024-06-01T10:00:00.000000Z");
        assert_eq!(late.to_sortable(), "2024-06-01T10:00:00.500000Z");
        // RFC-3339 strings would compare the wrong way here.
        assert!(early.to_sortable() < late.to_sortable());
        let back: Timestamp = early.to_sortable().parse().unwrap();
        assert_eq!(back, early);
    }

    #[test]
    fn micros_round_trip() {
        let ts = Timestamp::from_unix_micros(1_717_243_200_123_456);
        assert_eq!(ts.unix_micros(), 1_717_243_200_123_456);
    }
}
