//! Runtime Values
//!
//! The typed payloads that flow through the evaluation stack, the output
//! stream, and the variables state. Coercion between types follows a fixed
//! ordinal ladder; invalid casts are runtime faults.

use std::fmt;

use crate::runtime::ink_list::InkList;
use crate::runtime::path::Path;
use crate::story::errors::RuntimeFault;

/// Value type ordinals. Declaration order is the coercion ladder: when an
/// operation mixes types, operands are cast up to the highest ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ValueType {
    Bool,
    Int,
    Float,
    List,
    String,
    DivertTarget,
    VariablePointer,
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueType::Bool => "Bool",
            ValueType::Int => "Int",
            ValueType::Float => "Float",
            ValueType::List => "List",
            ValueType::String => "String",
            ValueType::DivertTarget => "DivertTarget",
            ValueType::VariablePointer => "VariablePointer",
        };
        write!(f, "{}", name)
    }
}

/// A text fragment in the output stream. Newline-ness and whitespace-ness
/// are checked constantly by the glue trimming rules, so they are computed
/// once on construction.
#[derive(Debug, Clone, PartialEq)]
pub struct StringValue {
    pub text: String,
    pub is_newline: bool,
    pub is_inline_whitespace: bool,
}

impl StringValue {
    pub fn new(text: impl Into<String>) -> StringValue {
        let text = text.into();
        let is_newline = text == "\n";
        let is_inline_whitespace = text.chars().all(|c| c == ' ' || c == '\t');
        StringValue { text, is_newline, is_inline_whitespace }
    }

    pub fn is_non_whitespace(&self) -> bool {
        !self.is_newline && !self.is_inline_whitespace
    }
}

/// A typed runtime value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i32),
    Float(f64),
    String(StringValue),
    List(InkList),
    DivertTarget(Path),
    VariablePointer { name: String, context_index: i32 },
}

impl Value {
    pub fn string(text: impl Into<String>) -> Value {
        Value::String(StringValue::new(text))
    }

    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Bool(_) => ValueType::Bool,
            Value::Int(_) => ValueType::Int,
            Value::Float(_) => ValueType::Float,
            Value::String(_) => ValueType::String,
            Value::List(_) => ValueType::List,
            Value::DivertTarget(_) => ValueType::DivertTarget,
            Value::VariablePointer { .. } => ValueType::VariablePointer,
        }
    }

    pub fn is_truthy(&self) -> Result<bool, RuntimeFault> {
        match self {
            Value::Bool(b) => Ok(*b),
            Value::Int(i) => Ok(*i != 0),
            Value::Float(f) => Ok(*f != 0.0),
            Value::String(s) => Ok(!s.text.is_empty()),
            Value::List(list) => Ok(!list.is_empty()),
            Value::DivertTarget(_) => Err(RuntimeFault::new(
                "Shouldn't be checking the truthiness of a divert target",
            )),
            Value::VariablePointer { .. } => Err(RuntimeFault::new(
                "Shouldn't be checking the truthiness of a variable pointer",
            )),
        }
    }

    /// Cast to another value type. Same-type casts are identity; anything
    /// not covered by the coercion table is a `BadCast` fault.
    pub fn cast(&self, target: ValueType) -> Result<Value, RuntimeFault> {
        if target == self.value_type() {
            return Ok(self.clone());
        }
        match (self, target) {
            (Value::Bool(b), ValueType::Int) => Ok(Value::Int(if *b { 1 } else { 0 })),
            (Value::Bool(b), ValueType::Float) => Ok(Value::Float(if *b { 1.0 } else { 0.0 })),
            (Value::Bool(b), ValueType::String) => {
                Ok(Value::string(if *b { "true" } else { "false" }))
            }

            (Value::Int(i), ValueType::Bool) => Ok(Value::Bool(*i != 0)),
            (Value::Int(i), ValueType::Float) => Ok(Value::Float(*i as f64)),
            (Value::Int(i), ValueType::String) => Ok(Value::string(i.to_string())),

            (Value::Float(f), ValueType::Bool) => Ok(Value::Bool(*f != 0.0)),
            (Value::Float(f), ValueType::Int) => Ok(Value::Int(*f as i32)),
            (Value::Float(f), ValueType::String) => Ok(Value::string(float_to_display(*f))),

            (Value::String(s), ValueType::Int) => match s.text.trim().parse::<i32>() {
                Ok(i) => Ok(Value::Int(i)),
                Err(_) => Err(self.bad_cast(target)),
            },
            (Value::String(s), ValueType::Float) => match s.text.trim().parse::<f64>() {
                Ok(f) => Ok(Value::Float(f)),
                Err(_) => Err(self.bad_cast(target)),
            },

            (Value::List(list), ValueType::Int) => {
                Ok(Value::Int(list.max_item().map(|(_, v)| v).unwrap_or(0)))
            }
            (Value::List(list), ValueType::Float) => {
                Ok(Value::Float(list.max_item().map(|(_, v)| v).unwrap_or(0) as f64))
            }
            (Value::List(list), ValueType::String) => Ok(Value::string(
                list.max_item()
                    .map(|(item, _)| item.to_string())
                    .unwrap_or_default(),
            )),

            _ => Err(self.bad_cast(target)),
        }
    }

    fn bad_cast(&self, target: ValueType) -> RuntimeFault {
        RuntimeFault::new(format!(
            "Can't cast {} from {} to {}",
            self,
            self.value_type(),
            target
        ))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{}", if *b { "true" } else { "false" }),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", float_to_display(*x)),
            Value::String(s) => write!(f, "{}", s.text),
            Value::List(list) => write!(f, "{}", list),
            Value::DivertTarget(path) => write!(f, "DivertTargetValue({})", path),
            Value::VariablePointer { name, .. } => write!(f, "VariablePointerValue({})", name),
        }
    }
}

/// Text form of a float: integral values print without a fraction, others
/// as the shortest decimal that round-trips the IEEE-754 double.
pub fn float_to_display(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 9.0e15 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_value_flags() {
        assert!(StringValue::new("\n").is_newline);
        assert!(StringValue::new("  \t").is_inline_whitespace);
        assert!(StringValue::new("words").is_non_whitespace());
        // The empty string counts as inline whitespace, not a newline.
        let empty = StringValue::new("");
        assert!(empty.is_inline_whitespace && !empty.is_newline);
    }

    #[test]
    fn test_coercion_ladder_order() {
        assert!(ValueType::Bool < ValueType::Int);
        assert!(ValueType::Int < ValueType::Float);
        assert!(ValueType::Float < ValueType::List);
        assert!(ValueType::List < ValueType::String);
        assert!(ValueType::String < ValueType::DivertTarget);
        assert!(ValueType::DivertTarget < ValueType::VariablePointer);
    }

    #[test]
    fn test_numeric_casts() {
        assert_eq!(Value::Bool(true).cast(ValueType::Int).unwrap(), Value::Int(1));
        assert_eq!(Value::Int(3).cast(ValueType::Float).unwrap(), Value::Float(3.0));
        assert_eq!(Value::Float(2.7).cast(ValueType::Int).unwrap(), Value::Int(2));
        assert_eq!(
            Value::string("42").cast(ValueType::Int).unwrap(),
            Value::Int(42)
        );
    }

    #[test]
    fn test_bad_casts_fail() {
        assert!(Value::string("not a number").cast(ValueType::Int).is_err());
        let target = Value::DivertTarget(Path::from_components_string("knot"));
        assert!(target.cast(ValueType::Int).is_err());
        assert!(target.cast(ValueType::DivertTarget).is_ok());
    }

    #[test]
    fn test_truthiness() {
        assert!(Value::Int(2).is_truthy().unwrap());
        assert!(!Value::Float(0.0).is_truthy().unwrap());
        assert!(Value::string("x").is_truthy().unwrap());
        assert!(!Value::string("").is_truthy().unwrap());
        assert!(Value::DivertTarget(Path::default()).is_truthy().is_err());
    }

    #[test]
    fn test_float_display() {
        assert_eq!(float_to_display(2.0), "2");
        assert_eq!(float_to_display(7.0 / 3.0), "2.3333333333333335");
        assert_eq!(float_to_display(-1.5), "-1.5");
    }
}
