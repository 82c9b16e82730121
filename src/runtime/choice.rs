//! Choices
//!
//! A materialized, user-facing choice. Each choice captures the thread it
//! was generated on so that choosing it can resume exactly that flow of
//! execution, even when other threads have since moved on.

use crate::runtime::path::Path;
use crate::state::call_stack::Thread;

#[derive(Debug, Clone)]
pub struct Choice {
    /// Display text, trimmed of spaces and tabs.
    pub text: String,
    /// Index within the currently offered (visible) choices.
    pub index: usize,
    /// Path of the choice point that generated this choice.
    pub source_path: String,
    /// Where the story continues when this choice is taken.
    pub target_path: Path,
    pub thread_at_generation: Option<Thread>,
    pub original_thread_index: i32,
    pub is_invisible_default: bool,
    pub tags: Vec<String>,
}

impl Choice {
    pub fn path_string_on_choice(&self) -> String {
        self.target_path.components_string()
    }
}
