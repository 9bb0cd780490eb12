//! Edit sessions over persisted series. Nothing in here knows about the
//! terminal; the reviewer UI only feeds it key presses and renders
//! [`ReviewView`] snapshots.

use std::cmp::Ordering;

use serde::Serialize;
use tracing::{info, warn};

use crate::domain::{ClassificationResult, IncludedImage, Series, file_name_of, order_key};
use crate::error::CurateError;
use crate::store::{CurationStore, SeriesFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Clean,
    Dirty,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DisplayImage {
    pub file_name: String,
    pub included: bool,
    /// Position in the series; `None` for excluded images.
    pub order: Option<u32>,
}

/// Included images by `order`, then excluded images by their numeric suffix.
pub fn display_order(result: &ClassificationResult) -> Vec<DisplayImage> {
    let mut images = result
        .included_in_order()
        .into_iter()
        .map(|image| DisplayImage {
            file_name: image.path.clone(),
            included: true,
            order: Some(image.order),
        })
        .collect::<Vec<_>>();

    let mut excluded = result.excluded.iter().collect::<Vec<_>>();
    excluded.sort_by_key(|name| order_key(name));
    images.extend(excluded.into_iter().map(|name| DisplayImage {
        file_name: name.clone(),
        included: false,
        order: None,
    }));
    images
}

fn compact_orders(included: &mut Vec<IncludedImage>) {
    included.sort_by_key(|image| image.order);
    for (index, image) in included.iter_mut().enumerate() {
        image.order = index as u32 + 1;
    }
}

/// Working copy of one series. The stored record stays untouched until save.
#[derive(Debug, Clone)]
pub struct EditSession {
    series: Series,
    working: ClassificationResult,
    state: SessionState,
}

impl EditSession {
    /// Members the classifier never mentioned start out excluded, so every
    /// candidate image can be toggled in.
    pub fn new(series: Series) -> Self {
        let mut working = series.classification.clone();
        for path in &series.members {
            let file_name = file_name_of(path);
            if !working.is_included(file_name) && !working.excluded.iter().any(|name| name == file_name) {
                working.excluded.push(file_name.to_string());
            }
        }
        Self {
            series,
            working,
            state: SessionState::Clean,
        }
    }

    pub fn series(&self) -> &Series {
        &self.series
    }

    pub fn working(&self) -> &ClassificationResult {
        &self.working
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_dirty(&self) -> bool {
        self.state == SessionState::Dirty
    }

    pub fn display_images(&self) -> Vec<DisplayImage> {
        display_order(&self.working)
    }

    /// Moves the image at `index` between the included and excluded lists.
    pub fn toggle(&mut self, index: usize) -> bool {
        let Some(image) = self.display_images().into_iter().nth(index) else {
            return false;
        };

        if image.included {
            self.working.included.retain(|entry| entry.path != image.file_name);
            compact_orders(&mut self.working.included);
            self.working.excluded.push(image.file_name);
        } else {
            self.working.excluded.retain(|name| *name != image.file_name);
            let order = self
                .working
                .included
                .iter()
                .map(|entry| entry.order)
                .max()
                .unwrap_or(0)
                + 1;
            self.working.included.push(IncludedImage {
                path: image.file_name,
                order,
            });
        }
        self.state = SessionState::Dirty;
        true
    }

    /// Swaps the orders of two included images. Anything else leaves the
    /// session as it was.
    pub fn reorder(&mut self, from: usize, to: usize) -> bool {
        if from == to {
            return false;
        }
        let images = self.display_images();
        let (Some(first), Some(second)) = (images.get(from), images.get(to)) else {
            return false;
        };
        let (Some(first_order), Some(second_order)) = (first.order, second.order) else {
            return false;
        };

        for entry in &mut self.working.included {
            if entry.path == first.file_name {
                entry.order = second_order;
            } else if entry.path == second.file_name {
                entry.order = first_order;
            }
        }
        self.state = SessionState::Dirty;
        true
    }

    /// Stored result with the reviewer's edits applied.
    pub fn merged_result(&self) -> ClassificationResult {
        let mut merged = self.series.classification.clone();
        merged.included = self.working.included.clone();
        compact_orders(&mut merged.included);
        merged.excluded = self.working.excluded.clone();
        merged.confidence = self.working.confidence;
        merged.reason = self.working.reason.clone();
        merged.is_series = merged.included.len() >= 2;
        merged
    }

    fn mark_saved(&mut self, merged: ClassificationResult) {
        self.series.member_count = merged.member_count();
        self.series.is_series = merged.is_series;
        self.series.classification = merged.clone();
        self.working = merged;
        self.state = SessionState::Clean;
    }
}

/// Explicit answer to a destructive prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Granted,
    Denied,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted { series_id: i64 },
    Cancelled,
    NoSeriesRemaining,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SaveFailure {
    pub series_id: i64,
    pub base_name: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SaveReport {
    pub saved: Vec<i64>,
    pub failed: Vec<SaveFailure>,
}

impl SaveReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Snapshot of what the reviewer should show.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReviewView {
    pub position: usize,
    pub total: usize,
    pub series_id: i64,
    pub base_name: String,
    pub caption: String,
    pub reason: String,
    pub confidence: f64,
    pub included: usize,
    pub images: Vec<DisplayImage>,
    pub cursor: usize,
    pub dirty: bool,
    pub unsaved_series: usize,
}

pub struct Reviewer<S: CurationStore> {
    store: S,
    sessions: Vec<EditSession>,
    current: usize,
    cursor: usize,
}

impl<S: CurationStore> Reviewer<S> {
    pub fn load(store: S, filter: &SeriesFilter) -> Result<Self, CurateError> {
        let sessions = store
            .load_series(filter)?
            .into_iter()
            .map(EditSession::new)
            .collect::<Vec<_>>();
        info!("loaded {} series for review", sessions.len());
        Ok(Self {
            store,
            sessions,
            current: 0,
            cursor: 0,
        })
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn position(&self) -> usize {
        self.current
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn current(&self) -> Option<&EditSession> {
        self.sessions.get(self.current)
    }

    pub fn sessions(&self) -> &[EditSession] {
        &self.sessions
    }

    fn image_count(&self) -> usize {
        self.current()
            .map(|session| session.working.included.len() + session.working.excluded.len())
            .unwrap_or(0)
    }

    fn clamp_cursor(&mut self) {
        self.cursor = self.cursor.min(self.image_count().saturating_sub(1));
    }

    pub fn next_series(&mut self) -> bool {
        if self.current + 1 >= self.sessions.len() {
            return false;
        }
        self.current += 1;
        self.cursor = 0;
        true
    }

    pub fn previous_series(&mut self) -> bool {
        if self.current == 0 {
            return false;
        }
        self.current -= 1;
        self.cursor = 0;
        true
    }

    pub fn next_image(&mut self) -> bool {
        if self.cursor + 1 >= self.image_count() {
            return false;
        }
        self.cursor += 1;
        true
    }

    pub fn previous_image(&mut self) -> bool {
        if self.cursor == 0 {
            return false;
        }
        self.cursor -= 1;
        true
    }

    pub fn toggle(&mut self, index: usize) -> bool {
        self.sessions
            .get_mut(self.current)
            .is_some_and(|session| session.toggle(index))
    }

    pub fn toggle_at_cursor(&mut self) -> bool {
        self.toggle(self.cursor)
    }

    /// Swaps two included images; the cursor follows the moved image.
    pub fn reorder(&mut self, from: usize, to: usize) -> bool {
        let moved = self
            .sessions
            .get_mut(self.current)
            .is_some_and(|session| session.reorder(from, to));
        if moved {
            self.cursor = to;
        }
        moved
    }

    pub fn move_cursor_up(&mut self) -> bool {
        match self.cursor.checked_sub(1) {
            Some(target) => self.reorder(self.cursor, target),
            None => false,
        }
    }

    pub fn move_cursor_down(&mut self) -> bool {
        self.reorder(self.cursor, self.cursor + 1)
    }

    /// Deletes a series from the store right away and drops its session.
    pub fn delete(
        &mut self,
        series_id: i64,
        confirmation: Confirmation,
    ) -> Result<DeleteOutcome, CurateError> {
        if confirmation == Confirmation::Denied {
            return Ok(DeleteOutcome::Cancelled);
        }
        let index = self
            .sessions
            .iter()
            .position(|session| session.series.id == series_id)
            .ok_or(CurateError::SeriesNotFound(series_id))?;

        self.store.delete_series(series_id)?;
        self.sessions.remove(index);
        info!("deleted series {series_id} during review");

        if self.sessions.is_empty() {
            self.current = 0;
            self.cursor = 0;
            return Ok(DeleteOutcome::NoSeriesRemaining);
        }
        match index.cmp(&self.current) {
            Ordering::Less => self.current -= 1,
            Ordering::Equal => {
                self.current = self.current.min(self.sessions.len() - 1);
                self.cursor = 0;
            }
            Ordering::Greater => {}
        }
        Ok(DeleteOutcome::Deleted { series_id })
    }

    pub fn delete_current(&mut self, confirmation: Confirmation) -> Result<DeleteOutcome, CurateError> {
        let Some(series_id) = self.current().map(|session| session.series.id) else {
            return Ok(DeleteOutcome::NoSeriesRemaining);
        };
        self.delete(series_id, confirmation)
    }

    /// Writes every dirty session. Each series is saved on its own; a failure
    /// leaves that session dirty and does not undo the others.
    pub fn save(&mut self) -> SaveReport {
        let mut report = SaveReport::default();
        for session in self.sessions.iter_mut().filter(|session| session.is_dirty()) {
            let merged = session.merged_result();
            let series_id = session.series.id;
            match self.store.update_series_classification(series_id, &merged) {
                Ok(()) => {
                    session.mark_saved(merged);
                    report.saved.push(series_id);
                }
                Err(err) => {
                    warn!("saving series {series_id} failed: {err}");
                    report.failed.push(SaveFailure {
                        series_id,
                        base_name: session.series.base_name.clone(),
                        message: err.to_string(),
                    });
                }
            }
        }
        if !report.saved.is_empty() {
            info!("saved {} series", report.saved.len());
        }
        report
    }

    /// Reloads the current series from the store, dropping its edits.
    pub fn reset(&mut self) -> Result<(), CurateError> {
        let Some(series_id) = self.current().map(|session| session.series.id) else {
            return Ok(());
        };
        let series = self.store.load_series_by_id(series_id)?;
        self.sessions[self.current] = EditSession::new(series);
        self.clamp_cursor();
        Ok(())
    }

    pub fn has_unsaved_changes(&self) -> bool {
        self.sessions.iter().any(EditSession::is_dirty)
    }

    pub fn unsaved_count(&self) -> usize {
        self.sessions.iter().filter(|session| session.is_dirty()).count()
    }

    pub fn view(&self) -> Option<ReviewView> {
        let session = self.current()?;
        Some(ReviewView {
            position: self.current + 1,
            total: self.sessions.len(),
            series_id: session.series.id,
            base_name: session.series.base_name.clone(),
            caption: session.working.caption.clone(),
            reason: session.working.reason.clone(),
            confidence: session.working.confidence,
            included: session.working.included.len(),
            images: session.display_images(),
            cursor: self.cursor,
            dirty: session.is_dirty(),
            unsaved_series: self.unsaved_count(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(included: &[(&str, u32)], excluded: &[&str]) -> ClassificationResult {
        let mut result = ClassificationResult::rejected("test");
        result.is_series = true;
        result.included = included
            .iter()
            .map(|(path, order)| IncludedImage {
                path: path.to_string(),
                order: *order,
            })
            .collect();
        result.excluded = excluded.iter().map(|name| name.to_string()).collect();
        result
    }

    #[test]
    fn display_puts_included_first_then_excluded_by_suffix() {
        let images = display_order(&result(&[("a_03.jpg", 2), ("a_05.jpg", 1)], &["a_10.jpg", "a_02.jpg"]));
        let names = images.iter().map(|image| image.file_name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, ["a_05.jpg", "a_03.jpg", "a_02.jpg", "a_10.jpg"]);
        assert_eq!(images[1].order, Some(2));
        assert_eq!(images[2].order, None);
    }

    #[test]
    fn compacting_renumbers_from_one() {
        let mut included = result(&[("b", 7), ("a", 3)], &[]).included;
        compact_orders(&mut included);
        assert_eq!(included[0], IncludedImage { path: "a".into(), order: 1 });
        assert_eq!(included[1], IncludedImage { path: "b".into(), order: 2 });
    }
}
