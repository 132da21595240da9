// Tracks which chat session new messages go to

use std::sync::{Mutex, PoisonError};

/// Process-wide pointer to the active session.
///
/// Lives only in memory: a fresh process starts with no current session.
/// Ids are stored as handed in; callers validate them against the store first.
#[derive(Debug, Default)]
pub struct CurrentSession {
    session_id: Mutex<Option<i64>>,
}

impl CurrentSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<i64> {
        *self.session_id.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set(&self, id: i64) {
        *self.session_id.lock().unwrap_or_else(PoisonError::into_inner) = Some(id);
    }

    pub fn clear(&self) {
        *self.session_id.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Clears the pointer only if it still refers to `id`.
    pub fn clear_if(&self, id: i64) -> bool {
        let mut current = self.session_id.lock().unwrap_or_else(PoisonError::into_inner);
        if *current == Some(id) {
            *current = None;
            true
        } else {
            false
        }
    }

    /// Points at `id` only if the pointer still holds `expected`.
    pub fn set_if(&self, expected: Option<i64>, id: i64) -> bool {
        let mut current = self.session_id.lock().unwrap_or_else(PoisonError::into_inner);
        if *current == expected {
            *current = Some(id);
            true
        } else {
            false
        }
    }
}
