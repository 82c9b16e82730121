//! Runtime Objects
//!
//! The single sum type the step loop dispatches on. Every node of the
//! content tree, every entry of the output stream, and every entry of the
//! evaluation stack is one of these variants.

use std::fmt;

use crate::runtime::choice_point::ChoicePoint;
use crate::runtime::container::ContainerId;
use crate::runtime::control_command::CommandType;
use crate::runtime::divert::Divert;
use crate::runtime::native_function::NativeFunction;
use crate::runtime::value::{StringValue, Value};
use crate::runtime::variable::{VariableAssignment, VariableReference};

#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeObject {
    Container(ContainerId),
    Value(Value),
    Glue,
    Tag(String),
    Void,
    ChoicePoint(ChoicePoint),
    Divert(Divert),
    Command(CommandType),
    NativeCall(NativeFunction),
    VariableReference(VariableReference),
    VariableAssignment(VariableAssignment),
}

impl RuntimeObject {
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            RuntimeObject::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_value(self) -> Option<Value> {
        match self {
            RuntimeObject::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_string_value(&self) -> Option<&StringValue> {
        match self {
            RuntimeObject::Value(Value::String(s)) => Some(s),
            _ => None,
        }
    }

    pub fn as_command(&self) -> Option<CommandType> {
        match self {
            RuntimeObject::Command(c) => Some(*c),
            _ => None,
        }
    }

    pub fn is_command(&self, command: CommandType) -> bool {
        self.as_command() == Some(command)
    }

    pub fn is_void(&self) -> bool {
        matches!(self, RuntimeObject::Void)
    }
}

impl fmt::Display for RuntimeObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeObject::Container(id) => write!(f, "Container#{}", id.index()),
            RuntimeObject::Value(v) => write!(f, "{}", v),
            RuntimeObject::Glue => write!(f, "Glue"),
            RuntimeObject::Tag(text) => write!(f, "# {}", text),
            RuntimeObject::Void => write!(f, "Void"),
            RuntimeObject::ChoicePoint(cp) => {
                write!(f, "Choice: -> {}", cp.path_on_choice.components_string())
            }
            RuntimeObject::Divert(d) => write!(f, "{}", d),
            RuntimeObject::Command(c) => write!(f, "{}", c),
            RuntimeObject::NativeCall(func) => write!(f, "Native \"{}\"", func.name()),
            RuntimeObject::VariableReference(r) => write!(f, "{}", r),
            RuntimeObject::VariableAssignment(a) => write!(f, "{}", a),
        }
    }
}
