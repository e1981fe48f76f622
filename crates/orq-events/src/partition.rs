//! Partition-key derivation and validation.
//!
//! Partition keys are the UTC day of the event timestamp, `YYYYMMDD`. Every
//! query first narrows to the key set of its time range so Postgres can
//! prune untouched day partitions, and every key is validated before it is
//! ever composed into a partition-table name.

use chrono::{DateTime, Duration, Utc};

use crate::EventStoreError;

/// `YYYYMMDD` of the UTC day containing `ts`.
pub fn partition_key_for(ts: DateTime<Utc>) -> String {
    ts.format("%Y%m%d").to_string()
}

/// Keys for every UTC day touched by `[from, to]`, inclusive. Rejects
/// inverted ranges and ranges wider than ~20 years (a runaway range would
/// enumerate an absurd key list instead of pruning anything).
pub fn partition_keys_in_range(
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<Vec<String>, EventStoreError> {
    if from > to {
        return Err(EventStoreError::InvalidRange { from, to });
    }

    let mut day = from.date_naive();
    let last = to.date_naive();
    if (last - day).num_days() > 7_400 {
        return Err(EventStoreError::InvalidRange { from, to });
    }

    let mut keys = Vec::new();
    while day <= last {
        keys.push(day.format("%Y%m%d").to_string());
        day += Duration::days(1);
    }
    Ok(keys)
}

/// A partition key is safe for SQL composition only if it is exactly eight
/// ASCII digits. Anything else is refused before string formatting.
pub fn validate_partition_key(key: &str) -> Result<(), EventStoreError> {
    if key.len() == 8 && key.bytes().all(|b| b.is_ascii_digit()) {
        Ok(())
    } else {
        Err(EventStoreError::InvalidPartitionKey(key.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn key_is_utc_day() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 15, 23, 59, 59).unwrap();
        assert_eq!(partition_key_for(ts), "20240115");
    }

    #[test]
    fn range_enumerates_inclusive_days() {
        let from = Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap();
        let to = Utc.with_ymd_and_hms(2024, 1, 17, 0, 0, 1).unwrap();
        let keys = partition_keys_in_range(from, to).unwrap();
        assert_eq!(keys, vec!["20240115", "20240116", "20240117"]);
    }

    #[test]
    fn single_day_range_is_one_key() {
        let from = Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap();
        let to = Utc.with_ymd_and_hms(2024, 1, 15, 23, 59, 0).unwrap();
        assert_eq!(partition_keys_in_range(from, to).unwrap(), vec!["20240115"]);
    }

    #[test]
    fn inverted_range_is_rejected() {
        let from = Utc.with_ymd_and_hms(2024, 1, 16, 0, 0, 0).unwrap();
        let to = Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap();
        assert!(matches!(
            partition_keys_in_range(from, to),
            Err(EventStoreError::InvalidRange { .. })
        ));
    }

    #[test]
    fn partition_key_whitelist() {
        assert!(validate_partition_key("20240115").is_ok());
        assert!(validate_partition_key("2024011").is_err());
        assert!(validate_partition_key("202401156").is_err());
        assert!(validate_partition_key("2024011x").is_err());
        assert!(validate_partition_key("20240115; drop table events").is_err());
    }
}
