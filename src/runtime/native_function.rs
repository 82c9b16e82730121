//! Native Function Calls
//!
//! The fixed set of built-in operators. Operands come off the evaluation
//! stack, coerce to a single type (the highest ordinal present, never lower
//! than Int), and dispatch to the per-type implementation. Anything the
//! table doesn't cover is a runtime fault, as is any Void operand.

use std::collections::HashMap;

use lazy_static::lazy_static;

use crate::runtime::ink_list::InkList;
use crate::runtime::list_definition::ListDefinitionsOrigin;
use crate::runtime::object::RuntimeObject;
use crate::runtime::value::{Value, ValueType};
use crate::story::errors::RuntimeFault;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeFunction {
    Add,
    Subtract,
    Divide,
    Multiply,
    Mod,
    Negate,
    Equal,
    Greater,
    Less,
    GreaterOrEquals,
    LessOrEquals,
    NotEquals,
    Not,
    And,
    Or,
    Min,
    Max,
    Pow,
    Floor,
    Ceiling,
    Int,
    Float,
    Has,
    Hasnt,
    Intersect,
    ListMin,
    ListMax,
    ListAll,
    ListCount,
    ListValue,
    ListInvert,
}

const ALL_FUNCTIONS: [(NativeFunction, &str); 31] = [
    (NativeFunction::Add, "+"),
    (NativeFunction::Subtract, "-"),
    (NativeFunction::Divide, "/"),
    (NativeFunction::Multiply, "*"),
    (NativeFunction::Mod, "%"),
    (NativeFunction::Negate, "_"),
    (NativeFunction::Equal, "=="),
    (NativeFunction::Greater, ">"),
    (NativeFunction::Less, "<"),
    (NativeFunction::GreaterOrEquals, ">="),
    (NativeFunction::LessOrEquals, "<="),
    (NativeFunction::NotEquals, "!="),
    (NativeFunction::Not, "!"),
    (NativeFunction::And, "&&"),
    (NativeFunction::Or, "||"),
    (NativeFunction::Min, "MIN"),
    (NativeFunction::Max, "MAX"),
    (NativeFunction::Pow, "POW"),
    (NativeFunction::Floor, "FLOOR"),
    (NativeFunction::Ceiling, "CEILING"),
    (NativeFunction::Int, "INT"),
    (NativeFunction::Float, "FLOAT"),
    (NativeFunction::Has, "?"),
    (NativeFunction::Hasnt, "!?"),
    (NativeFunction::Intersect, "^"),
    (NativeFunction::ListMin, "LIST_MIN"),
    (NativeFunction::ListMax, "LIST_MAX"),
    (NativeFunction::ListAll, "LIST_ALL"),
    (NativeFunction::ListCount, "LIST_COUNT"),
    (NativeFunction::ListValue, "LIST_VALUE"),
    (NativeFunction::ListInvert, "LIST_INVERT"),
];

lazy_static! {
    static ref FUNCTIONS_BY_NAME: HashMap<&'static str, NativeFunction> =
        ALL_FUNCTIONS.iter().map(|(f, n)| (*n, *f)).collect();
}

impl NativeFunction {
    pub fn name(&self) -> &'static str {
        ALL_FUNCTIONS
            .iter()
            .find(|(f, _)| f == self)
            .map(|(_, n)| *n)
            .unwrap_or("?")
    }

    pub fn from_name(name: &str) -> Option<NativeFunction> {
        FUNCTIONS_BY_NAME.get(name).copied()
    }

    pub fn number_of_parameters(&self) -> usize {
        match self {
            NativeFunction::Negate
            | NativeFunction::Not
            | NativeFunction::Floor
            | NativeFunction::Ceiling
            | NativeFunction::Int
            | NativeFunction::Float
            | NativeFunction::ListMin
            | NativeFunction::ListMax
            | NativeFunction::ListAll
            | NativeFunction::ListCount
            | NativeFunction::ListValue
            | NativeFunction::ListInvert => 1,
            _ => 2,
        }
    }

    /// Apply the operator to parameters popped off the evaluation stack
    /// (in stack order, i.e. already reversed back to argument order).
    pub fn call(
        &self,
        params: Vec<RuntimeObject>,
        defs: &ListDefinitionsOrigin,
    ) -> Result<RuntimeObject, RuntimeFault> {
        if params.len() != self.number_of_parameters() {
            return Err(RuntimeFault::new("Unexpected number of parameters"));
        }

        let mut values = Vec::with_capacity(params.len());
        for param in params {
            match param {
                RuntimeObject::Void => {
                    return Err(RuntimeFault::new(format!(
                        "Attempting to perform {} on a void value. Did you forget to \"return\" a value from a function you called here?",
                        self.name()
                    )))
                }
                RuntimeObject::Value(v) => values.push(v),
                other => {
                    return Err(RuntimeFault::new(format!(
                        "Attempting to perform {} on a non-value: {}",
                        self.name(),
                        other
                    )))
                }
            }
        }

        let has_list = values.iter().any(|v| matches!(v, Value::List(_)));
        if values.len() == 2 && has_list {
            return self.call_binary_list_operation(values, defs).map(RuntimeObject::Value);
        }

        let mut coerced = coerce_to_single_type(values, defs)?;
        let result = match (coerced.pop(), coerced.pop()) {
            (Some(b), Some(a)) => self.call_binary(a, b)?,
            (Some(a), None) => self.call_unary(a, defs)?,
            _ => return Err(RuntimeFault::new("Unexpected number of parameters")),
        };
        Ok(RuntimeObject::Value(result))
    }

    fn cannot_perform(&self, value_type: ValueType) -> RuntimeFault {
        RuntimeFault::new(format!(
            "Cannot perform operation {} on {}",
            self.name(),
            value_type
        ))
    }

    fn call_binary(&self, a: Value, b: Value) -> Result<Value, RuntimeFault> {
        match (a, b) {
            (Value::Int(x), Value::Int(y)) => self.binary_int(x, y),
            (Value::Float(x), Value::Float(y)) => self.binary_float(x, y),
            (Value::String(x), Value::String(y)) => self.binary_string(&x.text, &y.text),
            (Value::List(x), Value::List(y)) => self.binary_list(&x, &y),
            (Value::DivertTarget(x), Value::DivertTarget(y)) => match self {
                NativeFunction::Equal => Ok(Value::Bool(x == y)),
                NativeFunction::NotEquals => Ok(Value::Bool(x != y)),
                _ => Err(self.cannot_perform(ValueType::DivertTarget)),
            },
            (a, _) => Err(self.cannot_perform(a.value_type())),
        }
    }

    fn binary_int(&self, x: i32, y: i32) -> Result<Value, RuntimeFault> {
        let value = match self {
            NativeFunction::Add => Value::Int(x.wrapping_add(y)),
            NativeFunction::Subtract => Value::Int(x.wrapping_sub(y)),
            NativeFunction::Multiply => Value::Int(x.wrapping_mul(y)),
            // Integer division and modulus truncate toward zero, so the
            // remainder follows the sign of the dividend.
            NativeFunction::Divide => {
                if y == 0 {
                    return Err(RuntimeFault::new("Divide by zero"));
                }
                Value::Int(x.wrapping_div(y))
            }
            NativeFunction::Mod => {
                if y == 0 {
                    return Err(RuntimeFault::new("Divide by zero"));
                }
                Value::Int(x.wrapping_rem(y))
            }
            NativeFunction::Pow => Value::Int((x as f64).powf(y as f64) as i32),
            NativeFunction::Min => Value::Int(x.min(y)),
            NativeFunction::Max => Value::Int(x.max(y)),
            NativeFunction::Equal => Value::Bool(x == y),
            NativeFunction::NotEquals => Value::Bool(x != y),
            NativeFunction::Greater => Value::Bool(x > y),
            NativeFunction::Less => Value::Bool(x < y),
            NativeFunction::GreaterOrEquals => Value::Bool(x >= y),
            NativeFunction::LessOrEquals => Value::Bool(x <= y),
            NativeFunction::And => Value::Bool(x != 0 && y != 0),
            NativeFunction::Or => Value::Bool(x != 0 || y != 0),
            _ => return Err(self.cannot_perform(ValueType::Int)),
        };
        Ok(value)
    }

    fn binary_float(&self, x: f64, y: f64) -> Result<Value, RuntimeFault> {
        let value = match self {
            NativeFunction::Add => Value::Float(x + y),
            NativeFunction::Subtract => Value::Float(x - y),
            NativeFunction::Multiply => Value::Float(x * y),
            NativeFunction::Divide => Value::Float(x / y),
            NativeFunction::Mod => Value::Float(x % y),
            NativeFunction::Pow => Value::Float(x.powf(y)),
            NativeFunction::Min => Value::Float(x.min(y)),
            NativeFunction::Max => Value::Float(x.max(y)),
            NativeFunction::Equal => Value::Bool(x == y),
            NativeFunction::NotEquals => Value::Bool(x != y),
            NativeFunction::Greater => Value::Bool(x > y),
            NativeFunction::Less => Value::Bool(x < y),
            NativeFunction::GreaterOrEquals => Value::Bool(x >= y),
            NativeFunction::LessOrEquals => Value::Bool(x <= y),
            NativeFunction::And => Value::Bool(x != 0.0 && y != 0.0),
            NativeFunction::Or => Value::Bool(x != 0.0 || y != 0.0),
            _ => return Err(self.cannot_perform(ValueType::Float)),
        };
        Ok(value)
    }

    fn binary_string(&self, x: &str, y: &str) -> Result<Value, RuntimeFault> {
        let value = match self {
            NativeFunction::Add => Value::string(format!("{}{}", x, y)),
            NativeFunction::Equal => Value::Bool(x == y),
            NativeFunction::NotEquals => Value::Bool(x != y),
            NativeFunction::Has => Value::Bool(x.contains(y)),
            NativeFunction::Hasnt => Value::Bool(!x.contains(y)),
            _ => return Err(self.cannot_perform(ValueType::String)),
        };
        Ok(value)
    }

    fn binary_list(&self, x: &InkList, y: &InkList) -> Result<Value, RuntimeFault> {
        let value = match self {
            NativeFunction::Add => Value::List(x.union(y)),
            NativeFunction::Subtract => Value::List(x.without(y)),
            NativeFunction::Intersect => Value::List(x.intersect(y)),
            NativeFunction::Has => Value::Bool(x.contains_list(y)),
            NativeFunction::Hasnt => Value::Bool(!x.contains_list(y)),
            NativeFunction::Equal => Value::Bool(x.list_equals(y)),
            NativeFunction::NotEquals => Value::Bool(!x.list_equals(y)),
            NativeFunction::Greater => Value::Bool(x.greater_than(y)),
            NativeFunction::Less => Value::Bool(x.less_than(y)),
            NativeFunction::GreaterOrEquals => Value::Bool(x.greater_than_or_equals(y)),
            NativeFunction::LessOrEquals => Value::Bool(x.less_than_or_equals(y)),
            NativeFunction::And => Value::Bool(!x.is_empty() && !y.is_empty()),
            NativeFunction::Or => Value::Bool(!x.is_empty() || !y.is_empty()),
            _ => return Err(self.cannot_perform(ValueType::List)),
        };
        Ok(value)
    }

    fn call_unary(&self, value: Value, defs: &ListDefinitionsOrigin) -> Result<Value, RuntimeFault> {
        match value {
            Value::Int(x) => {
                let value = match self {
                    NativeFunction::Negate => Value::Int(x.wrapping_neg()),
                    // Logical not keeps the numeric type, like the original.
                    NativeFunction::Not => Value::Int(if x == 0 { 1 } else { 0 }),
                    NativeFunction::Floor | NativeFunction::Ceiling | NativeFunction::Int => {
                        Value::Int(x)
                    }
                    NativeFunction::Float => Value::Float(x as f64),
                    _ => return Err(self.cannot_perform(ValueType::Int)),
                };
                Ok(value)
            }
            Value::Float(x) => {
                let value = match self {
                    NativeFunction::Negate => Value::Float(-x),
                    NativeFunction::Not => Value::Float(if x == 0.0 { 1.0 } else { 0.0 }),
                    NativeFunction::Floor => Value::Float(x.floor()),
                    NativeFunction::Ceiling => Value::Float(x.ceil()),
                    NativeFunction::Int => Value::Int(x.floor() as i32),
                    NativeFunction::Float => Value::Float(x),
                    _ => return Err(self.cannot_perform(ValueType::Float)),
                };
                Ok(value)
            }
            Value::List(list) => {
                let value = match self {
                    NativeFunction::Not => Value::Int(if list.is_empty() { 1 } else { 0 }),
                    NativeFunction::ListInvert => Value::List(list.inverse(defs)),
                    NativeFunction::ListAll => Value::List(list.all(defs)),
                    NativeFunction::ListMin => Value::List(list.min_as_list()),
                    NativeFunction::ListMax => Value::List(list.max_as_list()),
                    NativeFunction::ListCount => Value::Int(list.len() as i32),
                    NativeFunction::ListValue => {
                        Value::Int(list.max_item().map(|(_, v)| v).unwrap_or(0))
                    }
                    _ => return Err(self.cannot_perform(ValueType::List)),
                };
                Ok(value)
            }
            other => Err(self.cannot_perform(other.value_type())),
        }
    }

    /// Binary operations where at least one operand is a list.
    fn call_binary_list_operation(
        &self,
        values: Vec<Value>,
        defs: &ListDefinitionsOrigin,
    ) -> Result<Value, RuntimeFault> {
        let (a, b) = (values[0].clone(), values[1].clone());

        // list +/- int shifts item values within their origins.
        if matches!(self, NativeFunction::Add | NativeFunction::Subtract) {
            if let (Value::List(list), Value::Int(amount)) = (&a, &b) {
                return self.list_increment(list, *amount, defs);
            }
        }

        // Logical ops on a list mixed with a non-list work on truthiness.
        if matches!(self, NativeFunction::And | NativeFunction::Or) {
            let both_lists =
                matches!(a, Value::List(_)) && matches!(b, Value::List(_));
            if !both_lists {
                let x = a.is_truthy()?;
                let y = b.is_truthy()?;
                return Ok(Value::Bool(match self {
                    NativeFunction::And => x && y,
                    _ => x || y,
                }));
            }
        }

        if let (Value::List(x), Value::List(y)) = (&a, &b) {
            return self.binary_list(x, y);
        }

        // `list ? name` accepts a string item name on the right.
        if matches!(self, NativeFunction::Has | NativeFunction::Hasnt) {
            if let (Value::List(list), Value::String(s)) = (&a, &b) {
                let contained = list.contains_item_named(&s.text);
                return Ok(Value::Bool(match self {
                    NativeFunction::Has => contained,
                    _ => !contained,
                }));
            }
        }

        // Remaining mixes (e.g. list > int) coerce the scalar into the list
        // domain and retry as a pure list operation.
        let coerced = coerce_to_single_type(vec![a, b], defs)?;
        if let [Value::List(x), Value::List(y)] = &coerced[..] {
            return self.binary_list(x, y);
        }
        Err(RuntimeFault::new(format!(
            "Can not call use {} operation on {} and {}",
            self.name(),
            coerced[0].value_type(),
            coerced[1].value_type()
        )))
    }

    fn list_increment(
        &self,
        list: &InkList,
        amount: i32,
        defs: &ListDefinitionsOrigin,
    ) -> Result<Value, RuntimeFault> {
        let mut result = InkList::new();
        for (item, value) in list.iter() {
            let target = match self {
                NativeFunction::Add => value.wrapping_add(amount),
                _ => value.wrapping_sub(amount),
            };
            let origin = item.origin_name.as_deref().and_then(|name| defs.definition(name));
            if let Some(origin) = origin {
                if let Some(shifted) = origin.item_with_value(target) {
                    result.insert(shifted, target);
                }
            }
        }
        Ok(Value::List(result))
    }
}

/// Cast all operands up to the highest type present, starting no lower than
/// Int (bools always widen). Ints mixed with lists are looked up in the
/// list's dominant origin.
fn coerce_to_single_type(
    values: Vec<Value>,
    defs: &ListDefinitionsOrigin,
) -> Result<Vec<Value>, RuntimeFault> {
    let mut target = ValueType::Int;
    let mut special_case_list: Option<InkList> = None;
    for value in &values {
        if value.value_type() > target {
            target = value.value_type();
        }
        if let Value::List(list) = value {
            special_case_list = Some(list.clone());
        }
    }

    if target != ValueType::List {
        return values.into_iter().map(|v| v.cast(target)).collect();
    }

    let mut out = Vec::with_capacity(values.len());
    for value in values {
        match value {
            Value::List(_) => out.push(value),
            Value::Int(i) => {
                let origin = special_case_list
                    .as_ref()
                    .and_then(|list| list.max_item())
                    .and_then(|(item, _)| item.origin_name.clone())
                    .and_then(|name| defs.definition(&name).cloned())
                    .ok_or_else(|| {
                        RuntimeFault::new(format!(
                            "Could not find List item with the value {} in the list's origin",
                            i
                        ))
                    })?;
                match origin.item_with_value(i) {
                    Some(item) => out.push(Value::List(InkList::from_single_item(item, i))),
                    None => {
                        return Err(RuntimeFault::new(format!(
                            "Could not find List item with the value {} in {}",
                            i,
                            origin.name()
                        )))
                    }
                }
            }
            other => {
                return Err(RuntimeFault::new(format!(
                    "Cannot mix Lists and {} values in this operation",
                    other.value_type()
                )))
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::ink_list::InkListItem;
    use crate::runtime::list_definition::ListDefinition;

    fn call(func: NativeFunction, params: Vec<Value>) -> Value {
        let defs = ListDefinitionsOrigin::default();
        func.call(params.into_iter().map(RuntimeObject::Value).collect(), &defs)
            .unwrap()
            .into_value()
            .unwrap()
    }

    #[test]
    fn test_int_arithmetic_truncates_toward_zero() {
        assert_eq!(call(NativeFunction::Divide, vec![Value::Int(7), Value::Int(3)]), Value::Int(2));
        assert_eq!(call(NativeFunction::Divide, vec![Value::Int(-7), Value::Int(3)]), Value::Int(-2));
        assert_eq!(call(NativeFunction::Mod, vec![Value::Int(7), Value::Int(4)]), Value::Int(3));
        assert_eq!(call(NativeFunction::Mod, vec![Value::Int(-7), Value::Int(4)]), Value::Int(-3));
    }

    #[test]
    fn test_int_pow_stays_int() {
        assert_eq!(call(NativeFunction::Pow, vec![Value::Int(2), Value::Int(10)]), Value::Int(1024));
    }

    #[test]
    fn test_mixed_types_coerce_to_float() {
        assert_eq!(
            call(NativeFunction::Add, vec![Value::Int(1), Value::Float(0.5)]),
            Value::Float(1.5)
        );
    }

    #[test]
    fn test_bools_widen_to_int() {
        assert_eq!(
            call(NativeFunction::Add, vec![Value::Bool(true), Value::Bool(true)]),
            Value::Int(2)
        );
    }

    #[test]
    fn test_string_concat_and_contains() {
        assert_eq!(
            call(NativeFunction::Add, vec![Value::string("ab"), Value::string("cd")]),
            Value::string("abcd")
        );
        assert_eq!(
            call(NativeFunction::Has, vec![Value::string("hello"), Value::string("ell")]),
            Value::Bool(true)
        );
    }

    #[test]
    fn test_void_operand_is_fault() {
        let defs = ListDefinitionsOrigin::default();
        let err = NativeFunction::Add
            .call(vec![RuntimeObject::Void, RuntimeObject::Value(Value::Int(1))], &defs)
            .unwrap_err();
        assert!(err.message.contains("void value"));
    }

    #[test]
    fn test_list_increment_drops_unmatched_items() {
        let defs = ListDefinitionsOrigin::new(vec![ListDefinition::new(
            "nums",
            vec![("one".to_string(), 1), ("two".to_string(), 2), ("three".to_string(), 3)],
        )]);
        let mut list = InkList::new();
        list.insert(InkListItem::new(Some("nums".to_string()), Some("two".to_string())), 2);
        list.insert(InkListItem::new(Some("nums".to_string()), Some("three".to_string())), 3);

        let result = NativeFunction::Add
            .call(
                vec![
                    RuntimeObject::Value(Value::List(list)),
                    RuntimeObject::Value(Value::Int(1)),
                ],
                &defs,
            )
            .unwrap()
            .into_value()
            .unwrap();
        match result {
            Value::List(shifted) => {
                // two -> three survives; three -> four has no origin match.
                assert_eq!(shifted.len(), 1);
                assert!(shifted.contains_item_named("three"));
            }
            other => panic!("expected list, got {:?}", other),
        }
    }

    #[test]
    fn test_unary_not_keeps_numeric_type() {
        assert_eq!(call(NativeFunction::Not, vec![Value::Int(0)]), Value::Int(1));
        assert_eq!(call(NativeFunction::Not, vec![Value::Int(7)]), Value::Int(0));
        assert_eq!(call(NativeFunction::Not, vec![Value::Float(0.0)]), Value::Float(1.0));
    }

    #[test]
    fn test_divert_target_equality() {
        use crate::runtime::path::Path;
        let a = Value::DivertTarget(Path::from_components_string("knot.stitch"));
        let b = Value::DivertTarget(Path::from_components_string("knot.stitch"));
        assert_eq!(call(NativeFunction::Equal, vec![a, b]), Value::Bool(true));
    }
}
