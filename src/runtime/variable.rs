//! Variable References & Assignments
//!
//! The two instruction forms that read and write variables. A reference is
//! either a plain named read or a read-count lookup on a container path; an
//! assignment targets a global or a temporary, as a fresh declaration or a
//! reassignment.

use std::fmt;

use crate::runtime::path::Path;

#[derive(Debug, Clone, PartialEq)]
pub struct VariableReference {
    /// Plain variable read; `None` when this is a read-count reference.
    pub name: Option<String>,
    /// Container whose visit count to push; `None` for a plain read.
    pub path_for_count: Option<Path>,
}

impl VariableReference {
    pub fn named(name: impl Into<String>) -> VariableReference {
        VariableReference { name: Some(name.into()), path_for_count: None }
    }

    pub fn for_count(path: Path) -> VariableReference {
        VariableReference { name: None, path_for_count: Some(path) }
    }
}

impl fmt::Display for VariableReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "var({})", name),
            None => write!(
                f,
                "read_count({})",
                self.path_for_count
                    .as_ref()
                    .map(|p| p.components_string())
                    .unwrap_or_default()
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VariableAssignment {
    pub variable_name: String,
    pub is_new_declaration: bool,
    pub is_global: bool,
}

impl VariableAssignment {
    pub fn new(variable_name: impl Into<String>, is_new_declaration: bool, is_global: bool) -> VariableAssignment {
        VariableAssignment {
            variable_name: variable_name.into(),
            is_new_declaration,
            is_global,
        }
    }
}

impl fmt::Display for VariableAssignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VarAssign to {}", self.variable_name)
    }
}
