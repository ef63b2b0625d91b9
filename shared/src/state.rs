use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::event::StateChange;
use crate::model::ProblemIdentity;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("observer failed: {0}")]
pub struct ObserverError(pub String);

pub trait SelectionObserver {
    fn on_change(
        &self,
        change: &StateChange,
        snapshot: &SelectionSnapshot,
    ) -> Result<(), ObserverError>;
}

impl<F> SelectionObserver for F
where
    F: Fn(&StateChange, &SelectionSnapshot) -> Result<(), ObserverError>,
{
    fn on_change(
        &self,
        change: &StateChange,
        snapshot: &SelectionSnapshot,
    ) -> Result<(), ObserverError> {
        self(change, snapshot)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionSnapshot {
    pub selected_year: Option<String>,
    pub selected_month: Option<String>,
    pub selected_question: Option<String>,
    pub is_loading: bool,
    pub is_solution_visible: bool,
    pub current_problem: Option<ProblemIdentity>,
    pub error_message: Option<String>,
    pub is_pdf_loading: bool,
    pub pdf_error: Option<String>,
}

#[derive(Default)]
pub struct SelectionState {
    selected_year: Option<String>,
    selected_month: Option<String>,
    selected_question: Option<String>,
    is_loading: bool,
    is_solution_visible: bool,
    current_problem: Option<Arc<ProblemIdentity>>,
    error_message: Option<String>,
    is_pdf_loading: bool,
    pdf_error: Option<String>,
    observers: Vec<(SubscriptionId, Box<dyn SelectionObserver>)>,
    next_subscription: u64,
}

impl std::fmt::Debug for SelectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelectionState")
            .field("state", &self.snapshot())
            .field("observers", &self.observers.len())
            .finish()
    }
}

impl SelectionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, observer: impl SelectionObserver + 'static) -> SubscriptionId {
        self.next_subscription += 1;
        let id = SubscriptionId(self.next_subscription);
        self.observers.push((id, Box::new(observer)));
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(sid, _)| *sid != id);
        self.observers.len() != before
    }

    pub fn selected_year(&self) -> Option<&str> {
        self.selected_year.as_deref()
    }

    pub fn selected_month(&self) -> Option<&str> {
        self.selected_month.as_deref()
    }

    pub fn selected_question(&self) -> Option<&str> {
        self.selected_question.as_deref()
    }

    pub fn is_loading(&self) -> bool {
        self.is_loading
    }

    pub fn is_solution_visible(&self) -> bool {
        self.is_solution_visible
    }

    pub fn current_problem(&self) -> Option<&Arc<ProblemIdentity>> {
        self.current_problem.as_ref()
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn is_pdf_loading(&self) -> bool {
        self.is_pdf_loading
    }

    pub fn pdf_error(&self) -> Option<&str> {
        self.pdf_error.as_deref()
    }

    /// Read-only copy for display and debug panels.
    pub fn snapshot(&self) -> SelectionSnapshot {
        SelectionSnapshot {
            selected_year: self.selected_year.clone(),
            selected_month: self.selected_month.clone(),
            selected_question: self.selected_question.clone(),
            is_loading: self.is_loading,
            is_solution_visible: self.is_solution_visible,
            current_problem: self.current_problem.as_deref().cloned(),
            error_message: self.error_message.clone(),
            is_pdf_loading: self.is_pdf_loading,
            pdf_error: self.pdf_error.clone(),
        }
    }

    pub fn set_year(&mut self, year: Option<&str>) {
        let mut changes = Vec::new();
        self.apply_year(year, &mut changes);
        self.dispatch(changes);
    }

    pub fn set_month(&mut self, month: Option<&str>) {
        let mut changes = Vec::new();
        self.apply_month(month, &mut changes);
        self.dispatch(changes);
    }

    pub fn set_question(&mut self, question: Option<&str>) {
        let mut changes = Vec::new();
        self.apply_question(question, &mut changes);
        self.dispatch(changes);
    }

    pub fn set_loading(&mut self, loading: bool) {
        let mut changes = Vec::new();
        self.apply_loading(loading, &mut changes);
        self.dispatch(changes);
    }

    /// Compared by pointer: a freshly built identity always counts as a
    /// change even when it equals the current one.
    pub fn set_current_problem(&mut self, problem: Option<Arc<ProblemIdentity>>) {
        let mut changes = Vec::new();
        self.apply_current_problem(problem, &mut changes);
        self.dispatch(changes);
    }

    pub fn set_solution_visible(&mut self, visible: bool) {
        let mut changes = Vec::new();
        self.apply_solution_visible(visible, &mut changes);
        self.dispatch(changes);
    }

    pub fn set_error_message(&mut self, message: Option<&str>) {
        let mut changes = Vec::new();
        self.apply_error_message(message, &mut changes);
        self.dispatch(changes);
    }

    pub fn set_pdf_loading(&mut self, loading: bool) {
        let mut changes = Vec::new();
        self.apply_pdf_loading(loading, &mut changes);
        self.dispatch(changes);
    }

    pub fn set_pdf_error(&mut self, message: Option<&str>) {
        let mut changes = Vec::new();
        self.apply_pdf_error(message, &mut changes);
        self.dispatch(changes);
    }

    /// Returns every field to its initial value through the same cascade
    /// rules as the individual setters, delivered as one batch.
    pub fn reset(&mut self) {
        let mut changes = Vec::new();
        self.apply_year(None, &mut changes);
        self.apply_month(None, &mut changes);
        self.apply_question(None, &mut changes);
        self.apply_current_problem(None, &mut changes);
        self.apply_solution_visible(false, &mut changes);
        self.apply_loading(false, &mut changes);
        self.apply_error_message(None, &mut changes);
        self.apply_pdf_loading(false, &mut changes);
        self.apply_pdf_error(None, &mut changes);
        self.dispatch(changes);
    }

    fn apply_year(&mut self, year: Option<&str>, changes: &mut Vec<StateChange>) {
        if self.selected_year.as_deref() == year {
            return;
        }
        let new = year.map(str::to_string);
        let old = std::mem::replace(&mut self.selected_year, new.clone());
        changes.push(StateChange::SelectedYear { old, new });
        self.apply_month(None, changes);
        self.clear_below_month(changes);
    }

    fn apply_month(&mut self, month: Option<&str>, changes: &mut Vec<StateChange>) {
        if self.selected_month.as_deref() == month {
            return;
        }
        let new = month.map(str::to_string);
        let old = std::mem::replace(&mut self.selected_month, new.clone());
        changes.push(StateChange::SelectedMonth { old, new });
        self.clear_below_month(changes);
    }

    fn clear_below_month(&mut self, changes: &mut Vec<StateChange>) {
        self.apply_question(None, changes);
        self.clear_below_question(changes);
    }

    fn apply_question(&mut self, question: Option<&str>, changes: &mut Vec<StateChange>) {
        if self.selected_question.as_deref() == question {
            return;
        }
        let new = question.map(str::to_string);
        let old = std::mem::replace(&mut self.selected_question, new.clone());
        changes.push(StateChange::SelectedQuestion { old, new });
        self.clear_below_question(changes);
    }

    fn clear_below_question(&mut self, changes: &mut Vec<StateChange>) {
        self.apply_current_problem(None, changes);
        self.apply_solution_visible(false, changes);
    }

    fn apply_loading(&mut self, loading: bool, changes: &mut Vec<StateChange>) {
        if self.is_loading == loading {
            return;
        }
        self.is_loading = loading;
        changes.push(StateChange::IsLoading {
            old: !loading,
            new: loading,
        });
        if loading {
            self.apply_error_message(None, changes);
        }
    }

    fn apply_current_problem(
        &mut self,
        problem: Option<Arc<ProblemIdentity>>,
        changes: &mut Vec<StateChange>,
    ) {
        let unchanged = match (&self.current_problem, &problem) {
            (None, None) => true,
            (Some(current), Some(next)) => Arc::ptr_eq(current, next),
            _ => false,
        };
        if unchanged {
            return;
        }
        let old = std::mem::replace(&mut self.current_problem, problem.clone());
        changes.push(StateChange::CurrentProblem { old, new: problem });
    }

    fn apply_solution_visible(&mut self, visible: bool, changes: &mut Vec<StateChange>) {
        if self.is_solution_visible == visible {
            return;
        }
        self.is_solution_visible = visible;
        changes.push(StateChange::IsSolutionVisible {
            old: !visible,
            new: visible,
        });
        if !visible {
            self.apply_pdf_error(None, changes);
        }
    }

    fn apply_error_message(&mut self, message: Option<&str>, changes: &mut Vec<StateChange>) {
        if self.error_message.as_deref() == message {
            return;
        }
        let new = message.map(str::to_string);
        let old = std::mem::replace(&mut self.error_message, new.clone());
        changes.push(StateChange::ErrorMessage { old, new });
    }

    fn apply_pdf_loading(&mut self, loading: bool, changes: &mut Vec<StateChange>) {
        if self.is_pdf_loading == loading {
            return;
        }
        self.is_pdf_loading = loading;
        changes.push(StateChange::IsPdfLoading {
            old: !loading,
            new: loading,
        });
        if loading {
            self.apply_pdf_error(None, changes);
        }
    }

    fn apply_pdf_error(&mut self, message: Option<&str>, changes: &mut Vec<StateChange>) {
        if self.pdf_error.as_deref() == message {
            return;
        }
        let new = message.map(str::to_string);
        let old = std::mem::replace(&mut self.pdf_error, new.clone());
        changes.push(StateChange::PdfError { old, new });
    }

    fn dispatch(&self, changes: Vec<StateChange>) {
        if changes.is_empty() {
            return;
        }
        let snapshot = self.snapshot();
        for change in &changes {
            debug!(%change, "selection state changed");
            for (id, observer) in &self.observers {
                match catch_unwind(AssertUnwindSafe(|| observer.on_change(change, &snapshot))) {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!(subscription = id.0, property = %change.property(), error = %e, "observer failed");
                    }
                    Err(_) => {
                        error!(subscription = id.0, property = %change.property(), "observer panicked");
                    }
                }
            }
        }
    }
}
