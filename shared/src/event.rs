use serde::Serialize;
use std::fmt;
use std::sync::Arc;

use crate::model::ProblemIdentity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Property {
    SelectedYear,
    SelectedMonth,
    SelectedQuestion,
    IsLoading,
    IsSolutionVisible,
    CurrentProblem,
    ErrorMessage,
    IsPdfLoading,
    PdfError,
}

impl Property {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SelectedYear => "selectedYear",
            Self::SelectedMonth => "selectedMonth",
            Self::SelectedQuestion => "selectedQuestion",
            Self::IsLoading => "isLoading",
            Self::IsSolutionVisible => "isSolutionVisible",
            Self::CurrentProblem => "currentProblem",
            Self::ErrorMessage => "errorMessage",
            Self::IsPdfLoading => "isPdfLoading",
            Self::PdfError => "pdfError",
        }
    }
}

impl fmt::Display for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One property change, carrying both the old and the new value.
#[derive(Debug, Clone)]
pub enum StateChange {
    SelectedYear {
        old: Option<String>,
        new: Option<String>,
    },
    SelectedMonth {
        old: Option<String>,
        new: Option<String>,
    },
    SelectedQuestion {
        old: Option<String>,
        new: Option<String>,
    },
    IsLoading {
        old: bool,
        new: bool,
    },
    IsSolutionVisible {
        old: bool,
        new: bool,
    },
    CurrentProblem {
        old: Option<Arc<ProblemIdentity>>,
        new: Option<Arc<ProblemIdentity>>,
    },
    ErrorMessage {
        old: Option<String>,
        new: Option<String>,
    },
    IsPdfLoading {
        old: bool,
        new: bool,
    },
    PdfError {
        old: Option<String>,
        new: Option<String>,
    },
}

impl StateChange {
    pub fn property(&self) -> Property {
        match self {
            Self::SelectedYear { .. } => Property::SelectedYear,
            Self::SelectedMonth { .. } => Property::SelectedMonth,
            Self::SelectedQuestion { .. } => Property::SelectedQuestion,
            Self::IsLoading { .. } => Property::IsLoading,
            Self::IsSolutionVisible { .. } => Property::IsSolutionVisible,
            Self::CurrentProblem { .. } => Property::CurrentProblem,
            Self::ErrorMessage { .. } => Property::ErrorMessage,
            Self::IsPdfLoading { .. } => Property::IsPdfLoading,
            Self::PdfError { .. } => Property::PdfError,
        }
    }
}

impl fmt::Display for StateChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn opt<T: fmt::Display>(v: Option<&T>) -> String {
            v.map_or_else(|| "null".to_string(), ToString::to_string)
        }

        match self {
            Self::SelectedYear { old, new }
            | Self::SelectedMonth { old, new }
            | Self::SelectedQuestion { old, new }
            | Self::ErrorMessage { old, new }
            | Self::PdfError { old, new } => write!(
                f,
                "{}: {} -> {}",
                self.property(),
                opt(old.as_ref()),
                opt(new.as_ref())
            ),
            Self::IsLoading { old, new }
            | Self::IsSolutionVisible { old, new }
            | Self::IsPdfLoading { old, new } => {
                write!(f, "{}: {old} -> {new}", self.property())
            }
            Self::CurrentProblem { old, new } => write!(
                f,
                "{}: {} -> {}",
                self.property(),
                opt(old.as_deref()),
                opt(new.as_deref())
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_property_and_values() {
        let change = StateChange::SelectedYear {
            old: None,
            new: Some("2022".into()),
        };
        assert_eq!(change.to_string(), "selectedYear: null -> 2022");

        let change = StateChange::IsPdfLoading {
            old: false,
            new: true,
        };
        assert_eq!(change.property(), Property::IsPdfLoading);
        assert_eq!(change.to_string(), "isPdfLoading: false -> true");
    }
}
