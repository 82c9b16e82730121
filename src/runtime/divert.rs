//! Diverts
//!
//! A divert is an unconditional jump to a target path. It may push a stack
//! frame (function or tunnel call), target a variable holding a divert
//! target, or call out to a host-bound external function.

use std::fmt;

use crate::runtime::path::Path;

/// Frame types pushed onto the call stack. Discriminants are the wire form
/// used in save-state callstack elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushPopType {
    Tunnel = 0,
    Function = 1,
    FunctionEvaluationFromGame = 2,
}

impl PushPopType {
    pub fn from_wire(value: i64) -> Option<PushPopType> {
        match value {
            0 => Some(PushPopType::Tunnel),
            1 => Some(PushPopType::Function),
            2 => Some(PushPopType::FunctionEvaluationFromGame),
            _ => None,
        }
    }
}

/// A jump instruction in the content tree.
#[derive(Debug, Clone, PartialEq)]
pub struct Divert {
    /// Fixed target, absolute or relative to the divert's own location.
    pub target_path: Option<Path>,
    /// When set, the target is read from this variable at runtime.
    pub variable_divert_name: Option<String>,
    pub pushes_to_stack: bool,
    pub stack_push_type: PushPopType,
    pub is_external: bool,
    pub external_args: i32,
    pub is_conditional: bool,
}

impl Divert {
    pub fn new() -> Divert {
        Divert {
            target_path: None,
            variable_divert_name: None,
            pushes_to_stack: false,
            stack_push_type: PushPopType::Tunnel,
            is_external: false,
            external_args: 0,
            is_conditional: false,
        }
    }

    pub fn has_variable_target(&self) -> bool {
        self.variable_divert_name.is_some()
    }

    pub fn target_path_string(&self) -> Option<String> {
        self.target_path.as_ref().map(|p| p.components_string())
    }
}

impl Default for Divert {
    fn default() -> Divert {
        Divert::new()
    }
}

impl fmt::Display for Divert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = &self.variable_divert_name {
            return write!(f, "Divert(variable: {})", name);
        }
        let Some(target) = &self.target_path else {
            return write!(f, "Divert(null)");
        };
        write!(f, "Divert")?;
        if self.is_conditional {
            write!(f, "?")?;
        }
        if self.pushes_to_stack {
            match self.stack_push_type {
                PushPopType::Function => write!(f, " function")?,
                _ => write!(f, " tunnel")?,
            }
        }
        write!(f, " -> {}", target.components_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_pop_wire_values() {
        assert_eq!(PushPopType::from_wire(0), Some(PushPopType::Tunnel));
        assert_eq!(PushPopType::from_wire(1), Some(PushPopType::Function));
        assert_eq!(PushPopType::from_wire(2), Some(PushPopType::FunctionEvaluationFromGame));
        assert_eq!(PushPopType::from_wire(3), None);
        assert_eq!(PushPopType::Function as i64, 1);
    }

    #[test]
    fn test_display() {
        let mut divert = Divert::new();
        divert.target_path = Some(Path::from_components_string("knot.stitch"));
        divert.pushes_to_stack = true;
        divert.stack_push_type = PushPopType::Function;
        assert_eq!(divert.to_string(), "Divert function -> knot.stitch");
    }
}
