//! Story JSON Writer
//!
//! Encodes runtime objects back into the tagged JSON form. Defaults are
//! omitted (zero flags, unnamed containers, a `null` terminator when a
//! container has nothing extra to say), and integral floats are written as
//! plain integers, matching the reference writers byte for byte.

use serde_json::{json, Map, Value as JsonValue};

use crate::runtime::choice::Choice;
use crate::runtime::container::{ContainerId, ContentTree};
use crate::runtime::ink_list::InkList;
use crate::runtime::list_definition::ListDefinitionsOrigin;
use crate::runtime::object::RuntimeObject;
use crate::runtime::value::Value;
use crate::story::INK_VERSION_CURRENT;

/// Floats with an integral value serialize as ints; non-finite values clamp
/// to the single-precision extremes the wire format allows.
pub fn json_float(value: f64) -> JsonValue {
    if value.is_nan() {
        return json!(0);
    }
    if value == f64::INFINITY {
        return json!(3.4e38);
    }
    if value == f64::NEG_INFINITY {
        return json!(-3.4e38);
    }
    if value.fract() == 0.0 && value.abs() < 9.0e15 {
        json!(value as i64)
    } else {
        json!(value)
    }
}

pub fn write_runtime_object(tree: &ContentTree, obj: &RuntimeObject) -> JsonValue {
    match obj {
        RuntimeObject::Container(id) => write_runtime_container(tree, *id, false),

        RuntimeObject::Value(Value::Bool(b)) => json!(b),
        RuntimeObject::Value(Value::Int(i)) => json!(i),
        RuntimeObject::Value(Value::Float(f)) => json_float(*f),
        RuntimeObject::Value(Value::String(s)) => {
            if s.is_newline {
                json!("\n")
            } else {
                json!(format!("^{}", s.text))
            }
        }
        RuntimeObject::Value(Value::List(list)) => write_ink_list(list),
        RuntimeObject::Value(Value::DivertTarget(path)) => {
            json!({ "^->": path.components_string() })
        }
        RuntimeObject::Value(Value::VariablePointer { name, context_index }) => {
            json!({ "^var": name, "ci": context_index })
        }

        RuntimeObject::Glue => json!("<>"),
        RuntimeObject::Command(command) => json!(command.wire_name()),
        RuntimeObject::NativeCall(func) => {
            let name = func.name();
            json!(if name == "^" { "L^" } else { name })
        }

        RuntimeObject::VariableReference(var_ref) => match &var_ref.path_for_count {
            Some(path) => json!({ "CNT?": path.components_string() }),
            None => json!({ "VAR?": var_ref.name.as_deref().unwrap_or_default() }),
        },
        RuntimeObject::VariableAssignment(var_ass) => {
            let key = if var_ass.is_global { "VAR=" } else { "temp=" };
            let mut obj = Map::new();
            obj.insert(key.to_string(), json!(var_ass.variable_name));
            if !var_ass.is_new_declaration {
                obj.insert("re".to_string(), json!(true));
            }
            JsonValue::Object(obj)
        }

        RuntimeObject::Tag(text) => json!({ "#": text }),
        RuntimeObject::ChoicePoint(point) => json!({
            "*": point.path_on_choice.components_string(),
            "flg": point.flags(),
        }),
        RuntimeObject::Void => json!("void"),

        RuntimeObject::Divert(divert) => {
            let key = if divert.is_external {
                "x()"
            } else if divert.pushes_to_stack {
                match divert.stack_push_type {
                    crate::runtime::divert::PushPopType::Function => "f()",
                    _ => "->t->",
                }
            } else {
                "->"
            };
            let target = match &divert.variable_divert_name {
                Some(name) => name.clone(),
                None => divert.target_path_string().unwrap_or_default(),
            };
            let mut obj = Map::new();
            obj.insert(key.to_string(), json!(target));
            if divert.has_variable_target() {
                obj.insert("var".to_string(), json!(true));
            }
            if divert.is_conditional {
                obj.insert("c".to_string(), json!(true));
            }
            if divert.external_args > 0 {
                obj.insert("exArgs".to_string(), json!(divert.external_args));
            }
            JsonValue::Object(obj)
        }
    }
}

pub fn write_objects(tree: &ContentTree, objects: &[RuntimeObject]) -> JsonValue {
    JsonValue::Array(objects.iter().map(|o| write_runtime_object(tree, o)).collect())
}

pub fn write_runtime_container(tree: &ContentTree, id: ContainerId, without_name: bool) -> JsonValue {
    let node = tree.node(id);
    let mut items: Vec<JsonValue> = node
        .content
        .iter()
        .map(|obj| write_runtime_object(tree, obj))
        .collect();

    let named_only: Vec<(&String, ContainerId)> = node
        .named_children
        .iter()
        .filter(|(_, child)| tree.node(**child).index_in_parent.is_none())
        .map(|(name, child)| (name, *child))
        .collect();
    let count_flags = node.count_flags();
    let has_name_property = node.name.is_some() && !without_name;

    if named_only.is_empty() && count_flags == 0 && !has_name_property {
        items.push(JsonValue::Null);
    } else {
        let mut terminator = Map::new();
        for (name, child) in named_only {
            terminator.insert(name.clone(), write_runtime_container(tree, child, true));
        }
        if count_flags > 0 {
            terminator.insert("#f".to_string(), json!(count_flags));
        }
        if has_name_property {
            terminator.insert("#n".to_string(), json!(node.name.as_deref().unwrap_or_default()));
        }
        items.push(JsonValue::Object(terminator));
    }

    JsonValue::Array(items)
}

pub fn write_ink_list(list: &InkList) -> JsonValue {
    let mut entries = Map::new();
    for (item, value) in list.iter() {
        entries.insert(item.full_name(), json!(value));
    }
    let mut obj = Map::new();
    obj.insert("list".to_string(), JsonValue::Object(entries));
    if list.is_empty() {
        let origins = list.origin_names();
        if !origins.is_empty() {
            obj.insert("origins".to_string(), json!(origins));
        }
    }
    JsonValue::Object(obj)
}

pub fn write_choice(choice: &Choice) -> JsonValue {
    let mut obj = Map::new();
    obj.insert("text".to_string(), json!(choice.text));
    obj.insert("index".to_string(), json!(choice.index));
    obj.insert("originalChoicePath".to_string(), json!(choice.source_path));
    obj.insert("originalThreadIndex".to_string(), json!(choice.original_thread_index));
    obj.insert("targetPath".to_string(), json!(choice.path_string_on_choice()));
    obj.insert("isInvisibleDefault".to_string(), json!(choice.is_invisible_default));
    if !choice.tags.is_empty() {
        obj.insert("tags".to_string(), json!(choice.tags));
    }
    JsonValue::Object(obj)
}

pub fn write_int_dictionary(map: &std::collections::HashMap<String, i32>) -> JsonValue {
    let mut obj = Map::new();
    for (key, value) in map {
        obj.insert(key.clone(), json!(value));
    }
    JsonValue::Object(obj)
}

/// The full story document: version, root container, list definitions.
pub fn write_story_document(tree: &ContentTree, defs: &ListDefinitionsOrigin) -> JsonValue {
    let mut list_defs = Map::new();
    for def in defs.lists() {
        let mut items = Map::new();
        for (name, value) in def.entries() {
            items.insert(name.to_string(), json!(value));
        }
        list_defs.insert(def.name().to_string(), JsonValue::Object(items));
    }

    json!({
        "inkVersion": INK_VERSION_CURRENT,
        "root": write_runtime_container(tree, tree.root(), false),
        "listDefs": JsonValue::Object(list_defs),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::json::reader::load_story_document;

    #[test]
    fn test_story_round_trip_is_structurally_equal() {
        let json = r##"{"inkVersion":21,"root":[["^Hi","\n","<>","ev",3,3.5,"/ev","out",{"->":".^.^"},{"*":".^.c","flg":18}],{"knot":[["^k"],{"#f":3,"#n":"knot"}],"#f":1}],"listDefs":{"colours":{"red":1,"blue":2}}}"##;
        let doc = load_story_document(json).unwrap();
        let emitted = write_story_document(&doc.tree, &doc.list_definitions);

        let original: JsonValue = serde_json::from_str(json).unwrap();
        assert_eq!(emitted, original);
    }

    #[test]
    fn test_integral_float_written_as_int() {
        assert_eq!(json_float(2.0), json!(2));
        assert_eq!(json_float(2.5), json!(2.5));
        assert_eq!(json_float(f64::NAN), json!(0));
    }

    #[test]
    fn test_tagged_values_round_trip() {
        use crate::json::reader::token_to_runtime_object;
        use crate::runtime::container::ContentTree;

        let tokens = [
            r#"{"^->":"a.b.2"}"#,
            r#"{"^var":"x","ci":2}"#,
            r#"{"VAR=":"x"}"#,
            r#"{"VAR=":"x","re":true}"#,
            r#"{"temp=":"t"}"#,
            r#"{"VAR?":"x"}"#,
            r#"{"CNT?":"knot"}"#,
            r##"{"#":"a tag"}"##,
            r#"{"list":{"colours.red":1}}"#,
            "\"void\"",
            "\"<>\"",
            "\"seq\"",
        ];
        let mut tree = ContentTree::new();
        for token_text in tokens {
            let token: JsonValue = serde_json::from_str(token_text).unwrap();
            let obj = token_to_runtime_object(&token, &mut tree).unwrap();
            let written = write_runtime_object(&tree, &obj);
            let reparsed = token_to_runtime_object(&written, &mut tree).unwrap();
            assert_eq!(obj, reparsed, "token {} did not round-trip", token_text);
        }
    }

    #[test]
    fn test_empty_list_writes_origins() {
        let mut list = InkList::new();
        list.set_initial_origin_name("colours");
        assert_eq!(
            write_ink_list(&list),
            json!({"list": {}, "origins": ["colours"]})
        );
    }
}
