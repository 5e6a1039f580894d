//! Date-based routing of records to workbooks
//!
//! Layout: `<root>/<YYYY-MM>/<YYYY-MM-DD>/<sheet>.csv`. The mapping depends only
//! on the record's date, so a restart routes a record to the same place.

use chrono::{Datelike, NaiveDate};
use std::path::{Path, PathBuf};

use crate::config::DateRange;
use crate::error::PartitionError;
use crate::store::TabularTarget;
use crate::types::Record;

/// Calendar period and day a record belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartitionKey {
    day: NaiveDate,
}

impl PartitionKey {
    /// Key of `day`
    pub fn new(day: NaiveDate) -> Self {
        Self { day }
    }

    /// The day
    pub fn day(&self) -> NaiveDate {
        self.day
    }

    /// Year-month period, `YYYY-MM`
    pub fn period(&self) -> String {
        format!("{:04}-{:02}", self.day.year(), self.day.month())
    }
}

/// Routes records of one phase to their workbook sheet
#[derive(Clone, Debug)]
pub struct RecordPartitioner {
    root: PathBuf,
    sheet: String,
    date_field: String,
    range: Option<DateRange>,
}

impl RecordPartitioner {
    /// Partition by `date_field` into `<root>/.../<sheet>.csv`
    pub fn new(
        root: impl Into<PathBuf>,
        sheet: impl Into<String>,
        date_field: impl Into<String>,
    ) -> Self {
        Self {
            root: root.into(),
            sheet: sheet.into(),
            date_field: date_field.into(),
            range: None,
        }
    }

    /// Drop records whose date lies outside `[start, end)`
    pub fn with_range(mut self, range: DateRange) -> Self {
        self.range = Some(range);
        self
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Derive the partition key of `record`
    pub fn key(&self, record: &Record) -> Result<PartitionKey, PartitionError> {
        let raw = record
            .get(&self.date_field)
            .ok_or_else(|| PartitionError::MissingField {
                field: self.date_field.clone(),
            })?;
        let day = parse_day(raw).ok_or_else(|| PartitionError::Unparsable {
            field: self.date_field.clone(),
            value: raw.to_string(),
        })?;
        match &self.range {
            Some(range) if !range.contains(day) => Err(PartitionError::OutOfRange {
                date: day,
                start: range.start(),
                end: range.end(),
            }),
            _ => Ok(PartitionKey::new(day)),
        }
    }

    /// Physical target of a key
    pub fn target(&self, key: PartitionKey) -> TabularTarget {
        TabularTarget::new(workbook_path(&self.root, key.day()), self.sheet.clone())
    }

    /// Key and target of `record`
    pub fn route(&self, record: &Record) -> Result<(PartitionKey, TabularTarget), PartitionError> {
        let key = self.key(record)?;
        Ok((key, self.target(key)))
    }
}

/// Parse the leading `YYYY-MM-DD` of a date or date-time string
pub fn parse_day(raw: &str) -> Option<NaiveDate> {
    let token = raw.split_whitespace().next()?;
    let token = token.split('T').next().unwrap_or(token);
    NaiveDate::parse_from_str(token, "%Y-%m-%d").ok()
}

/// Workbook directory of `day` under `root`
pub fn workbook_path(root: &Path, day: NaiveDate) -> PathBuf {
    let key = PartitionKey::new(day);
    root.join(key.period())
        .join(day.format("%Y-%m-%d").to_string())
}

/// Workbooks under `root` whose day lies in `range`, oldest first
///
/// Month directories outside the range are not descended into. A missing root
/// yields an empty list.
pub fn workbooks_in_range(
    root: &Path,
    range: DateRange,
) -> std::io::Result<Vec<(NaiveDate, PathBuf)>> {
    let first_period = PartitionKey::new(range.start()).period();
    let last_period = PartitionKey::new(range.end()).period();

    let months = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut found = Vec::new();
    for month in months {
        let month = month?;
        let name = month.file_name().to_string_lossy().into_owned();
        if !month.file_type()?.is_dir() || name < first_period || name > last_period {
            continue;
        }
        for day_dir in std::fs::read_dir(month.path())? {
            let day_dir = day_dir?;
            if !day_dir.file_type()?.is_dir() {
                continue;
            }
            let day_name = day_dir.file_name().to_string_lossy().into_owned();
            match NaiveDate::parse_from_str(&day_name, "%Y-%m-%d") {
                Ok(day) if range.contains(day) => found.push((day, day_dir.path())),
                Ok(_) => {}
                Err(_) => tracing::debug!(dir = %day_dir.path().display(), "ignoring non-date directory"),
            }
        }
    }
    found.sort();
    Ok(found)
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn listing_partitioner() -> RecordPartitioner {
        RecordPartitioner::new("downloads", "Contracts", "publish_date")
            .with_range(DateRange::new(day(2023, 11, 1), day(2023, 11, 6)).unwrap())
    }

    #[test]
    fn same_date_same_target_regardless_of_order() {
        let partitioner = listing_partitioner();
        let a = Record::new().with("publish_date", "2023-11-03 09:15:00");
        let b = Record::new().with("publish_date", "2023-11-03 23:59:59");
        let other = Record::new().with("publish_date", "2023-11-04 00:00:00");

        let (_, t_b) = partitioner.route(&b).unwrap();
        let (_, t_other) = partitioner.route(&other).unwrap();
        let (key_a, t_a) = partitioner.route(&a).unwrap();

        assert_eq!(t_a, t_b);
        assert_ne!(t_a, t_other);
        assert_eq!(key_a.period(), "2023-11");
        assert_eq!(
            t_a.sheet_path(),
            PathBuf::from("downloads/2023-11/2023-11-03/Contracts.csv")
        );
    }

    #[test]
    fn end_date_is_excluded_and_day_before_included() {
        let partitioner = listing_partitioner();
        let on_end = Record::new().with("publish_date", "2023-11-06 00:00:00");
        let before_end = Record::new().with("publish_date", "2023-11-05 18:00:00");

        assert!(matches!(
            partitioner.key(&on_end),
            Err(PartitionError::OutOfRange { .. })
        ));
        assert_eq!(partitioner.key(&before_end).unwrap().day(), day(2023, 11, 5));
    }

    #[test]
    fn unparsable_and_missing_dates_are_errors_not_default_buckets() {
        let partitioner = listing_partitioner();
        let garbled = Record::new().with("publish_date", "11/03/2023");
        let missing = Record::new().with("sign_date", "2023-11-03");

        assert!(matches!(
            partitioner.key(&garbled),
            Err(PartitionError::Unparsable { .. })
        ));
        assert!(matches!(
            partitioner.key(&missing),
            Err(PartitionError::MissingField { .. })
        ));
    }

    #[test]
    fn parse_day_accepts_dates_and_datetimes() {
        assert_eq!(parse_day("2025-03-10"), Some(day(2025, 3, 10)));
        assert_eq!(parse_day(" 2025-03-10 08:00 "), Some(day(2025, 3, 10)));
        assert_eq!(parse_day("2025-03-10T08:00:00"), Some(day(2025, 3, 10)));
        assert_eq!(parse_day(""), None);
        assert_eq!(parse_day("2025-02-30"), None);
    }

    #[test]
    fn scanning_respects_the_half_open_range() {
        let dir = tempfile::tempdir().unwrap();
        for d in ["2023-10-31", "2023-11-01", "2023-11-05", "2023-11-06"] {
            let date = NaiveDate::parse_from_str(d, "%Y-%m-%d").unwrap();
            std::fs::create_dir_all(workbook_path(dir.path(), date)).unwrap();
        }
        std::fs::create_dir_all(dir.path().join("2023-11").join("notes")).unwrap();

        let range = DateRange::new(day(2023, 11, 1), day(2023, 11, 6)).unwrap();
        let days: Vec<_> = workbooks_in_range(dir.path(), range)
            .unwrap()
            .into_iter()
            .map(|(d, _)| d)
            .collect();
        assert_eq!(days, vec![day(2023, 11, 1), day(2023, 11, 5)]);
    }

    #[test]
    fn scanning_a_missing_root_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let range = DateRange::new(day(2023, 11, 1), day(2023, 11, 6)).unwrap();
        assert!(workbooks_in_range(&dir.path().join("nope"), range)
            .unwrap()
            .is_empty());
    }
}
