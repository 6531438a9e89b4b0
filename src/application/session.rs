//! Per-session builder context.
//!
//! The current app, current page and component selection belong to one
//! editing session rather than to the workspace, so several sessions can work
//! on the same store side by side.

use crate::domain::{AppId, ComponentId, DomainError, DomainResult, PageId};

/// Selection status of the component under the cursor.
///
/// Transitions: `Unselected -> Selected -> Editing -> Unselected`, plus
/// `Selected -> Unselected` and switching between selected components.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Selection {
    #[default]
    Unselected,
    Selected(ComponentId),
    /// Property-panel mutations are only allowed in this state.
    Editing(ComponentId),
}

/// The explicit context passed into store operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub current_app: AppId,
    pub current_page: PageId,
    selection: Selection,
}

impl Session {
    pub fn new(current_app: AppId, current_page: PageId) -> Self {
        Self {
            current_app,
            current_page,
            selection: Selection::Unselected,
        }
    }

    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    /// The component currently open in the property panel.
    pub fn editing(&self) -> Option<&ComponentId> {
        match &self.selection {
            Selection::Editing(id) => Some(id),
            _ => None,
        }
    }

    pub fn selected(&self) -> Option<&ComponentId> {
        match &self.selection {
            Selection::Selected(id) | Selection::Editing(id) => Some(id),
            Selection::Unselected => None,
        }
    }

    /// Moves to `Selected`. Not allowed while another component is being edited.
    pub(crate) fn select(&mut self, id: ComponentId) -> DomainResult<()> {
        if let Selection::Editing(current) = &self.selection {
            if current != &id {
                return Err(DomainError::validation(format!(
                    "finish editing component '{current}' before selecting another"
                )));
            }
        }
        self.selection = Selection::Selected(id);
        Ok(())
    }

    /// `Selected -> Editing`.
    pub fn begin_edit(&mut self) -> DomainResult<()> {
        match &self.selection {
            Selection::Selected(id) => {
                self.selection = Selection::Editing(id.clone());
                Ok(())
            }
            Selection::Editing(_) => Ok(()),
            Selection::Unselected => Err(DomainError::validation("no component selected")),
        }
    }

    /// Returns to `Unselected` from any state.
    pub fn clear_selection(&mut self) {
        self.selection = Selection::Unselected;
    }

    /// Drops the selection if it points at one of `removed`.
    pub(crate) fn forget_components(&mut self, removed: &[ComponentId]) {
        if self.selected().is_some_and(|id| removed.contains(id)) {
            self.clear_selection();
        }
    }
}
