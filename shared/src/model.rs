use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{ViewerError, MAX_MONTH, MAX_QUESTION, MAX_YEAR, MIN_MONTH, MIN_QUESTION, MIN_YEAR};

/// One validated catalog row. Duplicates are allowed.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProblemRecord {
    pub year: u16,
    pub month: u8,
    pub question: u16,
}

impl ProblemRecord {
    pub fn new(year: u16, month: u8, question: u16) -> Result<Self, ViewerError> {
        if !(MIN_YEAR..=MAX_YEAR).contains(&year) {
            return Err(ViewerError::validation(format!(
                "year {year} outside {MIN_YEAR}-{MAX_YEAR}"
            )));
        }
        if !(MIN_MONTH..=MAX_MONTH).contains(&month) {
            return Err(ViewerError::validation(format!(
                "month {month} outside {MIN_MONTH}-{MAX_MONTH}"
            )));
        }
        if !(MIN_QUESTION..=MAX_QUESTION).contains(&question) {
            return Err(ViewerError::validation(format!(
                "question {question} outside {MIN_QUESTION}-{MAX_QUESTION}"
            )));
        }
        Ok(Self {
            year,
            month,
            question,
        })
    }
}

/// A fully selected problem, `(year, month, question)` as normalized strings.
///
/// Resource names are `<year><MM><QQ>` with month and question zero-padded
/// to two digits, so `(2022, 6, 1)` resolves to `20220601.png` and
/// `20220601.pdf`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProblemIdentity {
    year: String,
    month: String,
    question: String,
}

impl ProblemIdentity {
    pub fn new(year: &str, month: &str, question: &str) -> Result<Self, ViewerError> {
        let record = ProblemRecord::new(
            parse_field(year, "year")?,
            parse_field(month, "month")?,
            parse_field(question, "question")?,
        )?;
        Ok(Self::from(record))
    }

    pub fn year(&self) -> &str {
        &self.year
    }

    pub fn month(&self) -> &str {
        &self.month
    }

    pub fn question(&self) -> &str {
        &self.question
    }

    /// `<year><MM><QQ>`
    pub fn stem(&self) -> String {
        format!("{}{:0>2}{:0>2}", self.year, self.month, self.question)
    }

    pub fn image_path(&self, base: &str) -> String {
        join_path(base, &format!("{}.png", self.stem()))
    }

    pub fn solution_path(&self, base: &str) -> String {
        join_path(base, &format!("{}.pdf", self.stem()))
    }
}

impl From<ProblemRecord> for ProblemIdentity {
    fn from(record: ProblemRecord) -> Self {
        Self {
            year: record.year.to_string(),
            month: record.month.to_string(),
            question: record.question.to_string(),
        }
    }
}

impl fmt::Display for ProblemIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.year, self.month, self.question)
    }
}

fn parse_field<T: std::str::FromStr>(raw: &str, field: &'static str) -> Result<T, ViewerError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ViewerError::validation(format!("{field} is missing")));
    }
    trimmed
        .parse()
        .map_err(|_| ViewerError::validation(format!("{field} '{trimmed}' is not a number")))
}

fn join_path(base: &str, file: &str) -> String {
    let base = base.trim_end_matches('/');
    if base.is_empty() {
        file.to_string()
    } else {
        format!("{base}/{file}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_resolves_padded_paths() {
        let id = ProblemIdentity::new("2022", "6", "1").unwrap();
        assert_eq!(id.stem(), "20220601");
        assert_eq!(id.image_path("images"), "images/20220601.png");
        assert_eq!(id.solution_path("https://cdn.example/solutions/"), "https://cdn.example/solutions/20220601.pdf");
        assert_eq!(id.image_path(""), "20220601.png");
    }

    #[test]
    fn identity_normalizes_fields() {
        let id = ProblemIdentity::new(" 2021 ", "03", "007").unwrap();
        assert_eq!(id.year(), "2021");
        assert_eq!(id.month(), "3");
        assert_eq!(id.question(), "7");
        assert_eq!(id, ProblemIdentity::new("2021", "3", "7").unwrap());
    }

    #[test]
    fn three_digit_questions_are_not_truncated() {
        let id = ProblemIdentity::new("2020", "12", "123").unwrap();
        assert_eq!(id.stem(), "202012123");
    }

    #[test]
    fn identity_rejects_bad_input() {
        assert!(ProblemIdentity::new("", "1", "1").is_err());
        assert!(ProblemIdentity::new("abcd", "1", "1").is_err());
        assert!(ProblemIdentity::new("1999", "1", "1").is_err());
        assert!(ProblemIdentity::new("2022", "13", "1").is_err());
        assert!(ProblemIdentity::new("2022", "1", "0").is_err());
        assert!(ProblemIdentity::new("2022", "1", "1000").is_err());
    }
}
