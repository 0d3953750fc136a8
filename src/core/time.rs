use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};

/// Attempt timestamps are stored as UTC `TIMESTAMP` columns.
pub fn primitive_now_utc() -> PrimitiveDateTime {
    to_primitive_utc(OffsetDateTime::now_utc())
}

pub fn to_primitive_utc(value: OffsetDateTime) -> PrimitiveDateTime {
    let utc = value.to_offset(UtcOffset::UTC);
    PrimitiveDateTime::new(utc.date(), utc.time())
}

/// Converts a legacy unix-seconds column into a timestamp. Out-of-range values clamp to
/// the representable bounds instead of failing, since they only come from stored settings.
pub fn from_unix_seconds(seconds: i64) -> PrimitiveDateTime {
    let value = OffsetDateTime::from_unix_timestamp(seconds).unwrap_or(if seconds < 0 {
        OffsetDateTime::UNIX_EPOCH
    } else {
        OffsetDateTime::new_utc(time::Date::MAX, time::Time::MIDNIGHT)
    });
    to_primitive_utc(value)
}

pub fn to_unix_seconds(value: PrimitiveDateTime) -> i64 {
    value.assume_utc().unix_timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn unix_seconds_round_trip_keeps_utc() {
        let value = datetime!(2025-01-02 10:20:30);
        assert_eq!(from_unix_seconds(to_unix_seconds(value)), value);
    }

    #[test]
    fn to_primitive_drops_offset_after_normalising() {
        let shifted = datetime!(2025-01-02 13:20:30 +03:00);
        assert_eq!(to_primitive_utc(shifted), datetime!(2025-01-02 10:20:30));
    }

    #[test]
    fn negative_unix_seconds_clamp_to_epoch() {
        assert_eq!(from_unix_seconds(i64::MIN), datetime!(1970-01-01 00:00:00));
    }
}
