use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::model::ProblemRecord;
use crate::{ViewerError, MAX_MONTH, MAX_QUESTION, MAX_YEAR, MIN_MONTH, MIN_QUESTION, MIN_YEAR};

const FIELDS: [&str; 3] = ["year", "month", "question"];

#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize)]
pub enum RejectReason {
    #[error("missing {field}")]
    MissingField { field: &'static str },

    #[error("{field} '{value}' is not a number")]
    NotNumeric { field: &'static str, value: String },

    #[error("{field} {value} outside {min}-{max}")]
    OutOfRange {
        field: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowRejection {
    pub index: usize,
    pub reason: RejectReason,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub accepted: usize,
    pub header_skipped: bool,
    pub rejected: Vec<RowRejection>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct YearRange {
    pub earliest: String,
    pub latest: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatalogStatistics {
    pub total_problems: usize,
    pub total_years: usize,
    /// Distinct `(year, month)` pairs.
    pub total_months: usize,
    pub year_range: Option<YearRange>,
}

type Index = BTreeMap<u16, BTreeMap<u8, BTreeSet<u16>>>;

#[derive(Debug, Default)]
pub struct ProblemCatalog {
    records: Vec<ProblemRecord>,
    index: Index,
    loaded: bool,
}

enum RowOutcome {
    Accepted(ProblemRecord),
    Header,
    Rejected(RejectReason),
}

impl ProblemCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates `rows` and, if at least one survives, replaces the record
    /// set wholesale. On failure the previous contents stay in place.
    pub fn load<R, S>(&mut self, rows: &[R]) -> Result<LoadReport, ViewerError>
    where
        R: AsRef<[S]>,
        S: AsRef<str>,
    {
        let mut report = LoadReport::default();
        let mut records = Vec::with_capacity(rows.len());

        for (index, row) in rows.iter().enumerate() {
            match classify_row(index, row.as_ref()) {
                RowOutcome::Accepted(record) => records.push(record),
                RowOutcome::Header => {
                    debug!("skipping header row");
                    report.header_skipped = true;
                }
                RowOutcome::Rejected(reason) => {
                    warn!(row = index, %reason, "rejected dataset row");
                    report.rejected.push(RowRejection { index, reason });
                }
            }
        }

        if records.is_empty() {
            return Err(ViewerError::EmptyDataset {
                rejected: report.rejected.len(),
            });
        }

        let mut index = Index::new();
        for record in &records {
            index
                .entry(record.year)
                .or_default()
                .entry(record.month)
                .or_default()
                .insert(record.question);
        }

        report.accepted = records.len();
        self.records = records;
        self.index = index;
        self.loaded = true;

        info!(
            accepted = report.accepted,
            rejected = report.rejected.len(),
            years = self.index.len(),
            "problem catalog loaded"
        );
        Ok(report)
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn records(&self) -> &[ProblemRecord] {
        &self.records
    }

    /// Distinct years, newest first.
    pub fn years(&self) -> Vec<String> {
        self.index.keys().rev().map(ToString::to_string).collect()
    }

    /// Distinct months of `year`, ascending.
    pub fn months_for(&self, year: &str) -> Vec<String> {
        parse_key::<u16>(year)
            .and_then(|y| self.index.get(&y))
            .map(|months| months.keys().map(ToString::to_string).collect())
            .unwrap_or_default()
    }

    /// Distinct question numbers of `(year, month)`, ascending.
    pub fn questions_for(&self, year: &str, month: &str) -> Vec<String> {
        self.questions(year, month)
            .map(|qs| qs.iter().map(ToString::to_string).collect())
            .unwrap_or_default()
    }

    pub fn exists(&self, year: &str, month: &str, question: &str) -> bool {
        match (self.questions(year, month), parse_key::<u16>(question)) {
            (Some(qs), Some(q)) => qs.contains(&q),
            _ => false,
        }
    }

    pub fn statistics(&self) -> CatalogStatistics {
        let year_range = match (self.index.keys().next(), self.index.keys().next_back()) {
            (Some(earliest), Some(latest)) => Some(YearRange {
                earliest: earliest.to_string(),
                latest: latest.to_string(),
            }),
            _ => None,
        };

        CatalogStatistics {
            total_problems: self.records.len(),
            total_years: self.index.len(),
            total_months: self.index.values().map(BTreeMap::len).sum(),
            year_range,
        }
    }

    fn questions(&self, year: &str, month: &str) -> Option<&BTreeSet<u16>> {
        let y = parse_key::<u16>(year)?;
        let m = parse_key::<u8>(month)?;
        self.index.get(&y)?.get(&m)
    }
}

fn parse_key<T: std::str::FromStr>(raw: &str) -> Option<T> {
    raw.trim().parse().ok()
}

fn looks_like_header<S: AsRef<str>>(row: &[S]) -> bool {
    let mut labels = row
        .iter()
        .take(FIELDS.len())
        .map(|c| c.as_ref().trim())
        .filter(|c| !c.is_empty())
        .peekable();
    labels.peek().is_some() && labels.all(|c| c.parse::<i64>().is_err())
}

fn classify_row<S: AsRef<str>>(index: usize, row: &[S]) -> RowOutcome {
    if index == 0 && looks_like_header(row) {
        return RowOutcome::Header;
    }

    let mut cells = [""; 3];
    for (slot, field) in FIELDS.iter().enumerate() {
        match row.get(slot).map(|c| c.as_ref().trim()) {
            Some(cell) if !cell.is_empty() => cells[slot] = cell,
            _ => return RowOutcome::Rejected(RejectReason::MissingField { field }),
        }
    }

    let parsed: Vec<Option<i64>> = cells.iter().map(|c| c.parse::<i64>().ok()).collect();

    let mut values = [0i64; 3];
    for (slot, value) in parsed.into_iter().enumerate() {
        match value {
            Some(v) => values[slot] = v,
            None => {
                return RowOutcome::Rejected(RejectReason::NotNumeric {
                    field: FIELDS[slot],
                    value: cells[slot].to_string(),
                })
            }
        }
    }

    let bounds = [
        (i64::from(MIN_YEAR), i64::from(MAX_YEAR)),
        (i64::from(MIN_MONTH), i64::from(MAX_MONTH)),
        (i64::from(MIN_QUESTION), i64::from(MAX_QUESTION)),
    ];
    for (slot, (min, max)) in bounds.iter().enumerate() {
        if !(*min..=*max).contains(&values[slot]) {
            return RowOutcome::Rejected(RejectReason::OutOfRange {
                field: FIELDS[slot],
                value: values[slot],
                min: *min,
                max: *max,
            });
        }
    }

    // Bounds above guarantee these conversions succeed.
    match (
        u16::try_from(values[0]),
        u8::try_from(values[1]),
        u16::try_from(values[2]),
    ) {
        (Ok(year), Ok(month), Ok(question)) => RowOutcome::Accepted(ProblemRecord {
            year,
            month,
            question,
        }),
        _ => RowOutcome::Rejected(RejectReason::OutOfRange {
            field: FIELDS[0],
            value: values[0],
            min: bounds[0].0,
            max: bounds[0].1,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn rows(raw: &[&[&str]]) -> Vec<Vec<String>> {
        raw.iter()
            .map(|r| r.iter().map(|c| (*c).to_string()).collect())
            .collect()
    }

    #[test]
    fn cascading_queries_follow_loaded_rows() {
        let mut catalog = ProblemCatalog::new();
        catalog
            .load(&rows(&[&["2022", "6", "1"], &["2022", "6", "2"], &["2022", "11", "1"]]))
            .unwrap();

        assert_eq!(catalog.years(), vec!["2022"]);
        assert_eq!(catalog.months_for("2022"), vec!["6", "11"]);
        assert_eq!(catalog.questions_for("2022", "6"), vec!["1", "2"]);
        assert!(catalog.exists("2022", "11", "1"));
        assert!(!catalog.exists("2022", "11", "2"));
    }

    #[test]
    fn years_sort_numerically_descending() {
        let mut catalog = ProblemCatalog::new();
        catalog
            .load(&rows(&[
                &["2009", "1", "1"],
                &["2100", "1", "1"],
                &["2010", "1", "1"],
                &["2009", "2", "1"],
            ]))
            .unwrap();
        assert_eq!(catalog.years(), vec!["2100", "2010", "2009"]);
        assert_eq!(catalog.months_for("2009"), vec!["1", "2"]);
    }

    #[test]
    fn header_row_is_skipped_silently() {
        let mut catalog = ProblemCatalog::new();
        let report = catalog
            .load(&rows(&[&["year", "month", "question"], &["2021", "4", "9"]]))
            .unwrap();
        assert!(report.header_skipped);
        assert!(report.rejected.is_empty());
        assert_eq!(report.accepted, 1);
    }

    #[test]
    fn short_header_row_is_still_a_header() {
        let mut catalog = ProblemCatalog::new();
        let report = catalog
            .load(&rows(&[&["year", "month"], &["2021", "4", "9"]]))
            .unwrap();
        assert!(report.header_skipped);
        assert!(report.rejected.is_empty());

        let report = catalog
            .load(&rows(&[&["2021", "4"], &["2021", "4", "9"]]))
            .unwrap();
        assert!(!report.header_skipped);
        assert!(matches!(
            report.rejected[0].reason,
            RejectReason::MissingField { field: "question" }
        ));
    }

    #[test]
    fn non_numeric_row_after_first_is_rejected() {
        let mut catalog = ProblemCatalog::new();
        let report = catalog
            .load(&rows(&[&["2021", "4", "9"], &["year", "month", "question"]]))
            .unwrap();
        assert!(!report.header_skipped);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].index, 1);
    }

    #[test]
    fn invalid_rows_are_reported_with_reasons() {
        let mut catalog = ProblemCatalog::new();
        let report = catalog
            .load(&rows(&[
                &["2022", "6", "1"],
                &["2022", "6"],
                &["2022", "", "3"],
                &["2022", "x", "3"],
                &["1999", "6", "3"],
                &["2022", "13", "3"],
                &["2022", "6", "1000"],
                &["2022", "6", "1"],
            ]))
            .unwrap();

        assert_eq!(report.accepted, 2);
        assert_eq!(catalog.statistics().total_problems, 2);
        let reasons: Vec<_> = report.rejected.iter().map(|r| r.reason.clone()).collect();
        assert_eq!(reasons[0], RejectReason::MissingField { field: "question" });
        assert_eq!(reasons[1], RejectReason::MissingField { field: "month" });
        assert_eq!(
            reasons[2],
            RejectReason::NotNumeric {
                field: "month",
                value: "x".into()
            }
        );
        assert!(matches!(reasons[3], RejectReason::OutOfRange { field: "year", value: 1999, .. }));
        assert!(matches!(reasons[4], RejectReason::OutOfRange { field: "month", .. }));
        assert!(matches!(reasons[5], RejectReason::OutOfRange { field: "question", .. }));
        // duplicates survive in the record set but not in option lists
        assert_eq!(catalog.questions_for("2022", "6"), vec!["1"]);
    }

    #[test]
    fn empty_dataset_fails_and_keeps_previous_records() {
        let mut catalog = ProblemCatalog::new();
        catalog.load(&rows(&[&["2020", "1", "1"]])).unwrap();

        let err = catalog
            .load(&rows(&[&["year", "month", "question"], &["bad", "row", "x"]]))
            .unwrap_err();
        assert_eq!(err, ViewerError::EmptyDataset { rejected: 1 });
        assert_eq!(err.kind(), crate::ErrorKind::NotFound);
        assert!(catalog.exists("2020", "1", "1"));
    }

    #[test]
    fn queries_before_load_are_empty() {
        let catalog = ProblemCatalog::new();
        assert!(!catalog.is_loaded());
        assert!(catalog.years().is_empty());
        assert!(catalog.months_for("2022").is_empty());
        assert!(catalog.questions_for("2022", "1").is_empty());
        assert!(!catalog.exists("2022", "1", "1"));
        let stats = catalog.statistics();
        assert_eq!(stats.total_problems, 0);
        assert_eq!(stats.year_range, None);
    }

    #[test]
    fn statistics_count_distinct_years_and_months() {
        let mut catalog = ProblemCatalog::new();
        catalog
            .load(&rows(&[
                &["2020", "1", "1"],
                &["2020", "1", "2"],
                &["2020", "5", "1"],
                &["2023", "1", "1"],
            ]))
            .unwrap();
        let stats = catalog.statistics();
        assert_eq!(stats.total_problems, 4);
        assert_eq!(stats.total_years, 2);
        assert_eq!(stats.total_months, 3);
        assert_eq!(
            stats.year_range,
            Some(YearRange {
                earliest: "2020".into(),
                latest: "2023".into()
            })
        );
    }

    proptest! {
        #[test]
        fn loaded_triples_are_reachable_through_every_query(
            triples in proptest::collection::vec((2000u16..=2100, 1u8..=12, 1u16..=999), 1..40)
        ) {
            let raw: Vec<Vec<String>> = triples
                .iter()
                .map(|(y, m, q)| vec![y.to_string(), m.to_string(), q.to_string()])
                .collect();
            let mut catalog = ProblemCatalog::new();
            let report = catalog.load(&raw).unwrap();
            prop_assert_eq!(report.accepted, triples.len());

            for (y, m, q) in &triples {
                let (y, m, q) = (y.to_string(), m.to_string(), q.to_string());
                prop_assert!(catalog.exists(&y, &m, &q));
                prop_assert!(catalog.years().contains(&y));
                prop_assert!(catalog.months_for(&y).contains(&m));
                prop_assert!(catalog.questions_for(&y, &m).contains(&q));
            }

            let years: Vec<u16> = catalog.years().iter().map(|y| y.parse().unwrap()).collect();
            prop_assert!(years.windows(2).all(|w| w[0] > w[1]));
            for y in catalog.years() {
                let months: Vec<u8> = catalog.months_for(&y).iter().map(|m| m.parse().unwrap()).collect();
                prop_assert!(months.windows(2).all(|w| w[0] < w[1]));
                for m in catalog.months_for(&y) {
                    let qs: Vec<u16> = catalog.questions_for(&y, &m).iter().map(|q| q.parse().unwrap()).collect();
                    prop_assert!(qs.windows(2).all(|w| w[0] < w[1]));
                }
            }
        }
    }
}
