//! Story JSON Reader
//!
//! Decodes the tagged JSON form of a compiled story into runtime objects.
//! `serde_json` keeps the int/float distinction of the source text (`3` vs
//! `3.0`), so no pre-tokenization is needed; the legacy `"1.5f"` string
//! spelling of floats is still accepted.

use serde_json::Value as JsonValue;

use crate::runtime::choice::Choice;
use crate::runtime::choice_point::ChoicePoint;
use crate::runtime::container::{ContainerId, ContentTree};
use crate::runtime::control_command::CommandType;
use crate::runtime::divert::{Divert, PushPopType};
use crate::runtime::ink_list::{InkList, InkListItem};
use crate::runtime::list_definition::{ListDefinition, ListDefinitionsOrigin};
use crate::runtime::native_function::NativeFunction;
use crate::runtime::object::RuntimeObject;
use crate::runtime::path::Path;
use crate::runtime::value::Value;
use crate::runtime::variable::{VariableAssignment, VariableReference};
use crate::story::errors::StoryError;
use crate::story::{INK_VERSION_CURRENT, INK_VERSION_MINIMUM_COMPATIBLE};

/// A parsed story document: the sealed content tree plus list definitions.
pub struct StoryDocument {
    pub tree: ContentTree,
    pub list_definitions: ListDefinitionsOrigin,
    pub ink_version: i64,
}

/// Parse story text (tolerating a UTF-8 BOM) into a JSON value.
pub fn parse_json_text(text: &str) -> Result<JsonValue, StoryError> {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    serde_json::from_str(text).map_err(|e| StoryError::BadJson(e.to_string()))
}

pub fn load_story_document(text: &str) -> Result<StoryDocument, StoryError> {
    let root_object = parse_json_text(text)?;

    let version = root_object
        .get("inkVersion")
        .and_then(|v| v.as_i64())
        .ok_or(StoryError::MissingVersion)?;
    if version > INK_VERSION_CURRENT {
        return Err(StoryError::VersionTooNew);
    }
    if version < INK_VERSION_MINIMUM_COMPATIBLE {
        return Err(StoryError::VersionTooOld);
    }

    let root_token = root_object.get("root").ok_or(StoryError::MissingRoot)?;

    let list_definitions = match root_object.get("listDefs") {
        Some(defs) => token_to_list_definitions(defs)?,
        None => ListDefinitionsOrigin::default(),
    };

    let mut tree = ContentTree::new();
    match token_to_runtime_object(root_token, &mut tree)? {
        RuntimeObject::Container(id) if id == tree.root() => {}
        _ => return Err(StoryError::MissingRoot),
    }
    tree.seal();

    Ok(StoryDocument { tree, list_definitions, ink_version: version })
}

pub fn token_to_list_definitions(token: &JsonValue) -> Result<ListDefinitionsOrigin, StoryError> {
    let obj = token
        .as_object()
        .ok_or_else(|| StoryError::BadJson("listDefs is not an object".to_string()))?;
    let mut definitions = Vec::new();
    for (name, items_token) in obj {
        let items_obj = items_token
            .as_object()
            .ok_or_else(|| StoryError::BadJson(format!("list definition '{}' is not an object", name)))?;
        let mut items = Vec::new();
        for (item_name, value) in items_obj {
            let value = value.as_i64().ok_or_else(|| {
                StoryError::BadJson(format!("list item '{}.{}' is not an integer", name, item_name))
            })?;
            items.push((item_name.clone(), value as i32));
        }
        definitions.push(ListDefinition::new(name, items));
    }
    Ok(ListDefinitionsOrigin::new(definitions))
}

/// Decode one token. Array tokens allocate containers into `tree`.
pub fn token_to_runtime_object(
    token: &JsonValue,
    tree: &mut ContentTree,
) -> Result<RuntimeObject, StoryError> {
    match token {
        JsonValue::Bool(b) => Ok(RuntimeObject::Value(Value::Bool(*b))),
        JsonValue::Number(n) => number_to_value(n).map(RuntimeObject::Value),
        JsonValue::String(s) => string_token_to_object(s),
        JsonValue::Object(fields) => object_token_to_object(fields),
        JsonValue::Array(items) => Ok(RuntimeObject::Container(array_to_container(items, tree)?)),
        JsonValue::Null => Err(StoryError::BadJson(
            "Failed to convert token to runtime object: null".to_string(),
        )),
    }
}

/// Decode a save-state token, where containers cannot appear.
pub fn state_token_to_object(token: &JsonValue) -> Result<RuntimeObject, StoryError> {
    match token {
        JsonValue::Array(_) => Err(StoryError::BadJson(
            "Unexpected container in save state".to_string(),
        )),
        _ => {
            // No container can be created, so the scratch tree stays empty.
            let mut scratch = ContentTree::new();
            token_to_runtime_object(token, &mut scratch)
        }
    }
}

pub fn state_array_to_objects(token: &JsonValue) -> Result<Vec<RuntimeObject>, StoryError> {
    let items = token
        .as_array()
        .ok_or_else(|| StoryError::BadJson("expected an array of runtime objects".to_string()))?;
    items.iter().map(state_token_to_object).collect()
}

fn number_to_value(n: &serde_json::Number) -> Result<Value, StoryError> {
    // A literal with a decimal point or exponent parses as f64; everything
    // else is integral.
    if n.is_f64() {
        Ok(Value::Float(n.as_f64().unwrap_or(0.0)))
    } else {
        match n.as_i64() {
            Some(i) => Ok(Value::Int(i as i32)),
            None => Err(StoryError::BadJson(format!("unrepresentable number: {}", n))),
        }
    }
}

fn string_token_to_object(s: &str) -> Result<RuntimeObject, StoryError> {
    // Legacy float spelling from writers that tagged "3.0" as "3.0f".
    if let Some(body) = s.strip_suffix('f') {
        if body.contains('.') && body.chars().all(|c| c.is_ascii_digit() || c == '.') {
            if let Ok(f) = body.parse::<f64>() {
                return Ok(RuntimeObject::Value(Value::Float(f)));
            }
        }
    }

    if let Some(text) = s.strip_prefix('^') {
        return Ok(RuntimeObject::Value(Value::string(text)));
    }
    if s == "\n" {
        return Ok(RuntimeObject::Value(Value::string("\n")));
    }
    if s == "<>" {
        return Ok(RuntimeObject::Glue);
    }
    if let Some(command) = CommandType::from_wire_name(s) {
        return Ok(RuntimeObject::Command(command));
    }

    // "L^" is the wire spelling of the intersect operator, freeing "^" for
    // string literals.
    let native_name = if s == "L^" { "^" } else { s };
    if let Some(func) = NativeFunction::from_name(native_name) {
        return Ok(RuntimeObject::NativeCall(func));
    }

    if s == "void" {
        return Ok(RuntimeObject::Void);
    }

    Err(StoryError::BadJson(format!(
        "Failed to convert token to runtime object: \"{}\"",
        s
    )))
}

fn object_token_to_object(
    obj: &serde_json::Map<String, JsonValue>,
) -> Result<RuntimeObject, StoryError> {
    if let Some(target) = obj.get("^->") {
        let path = Path::from_components_string(target.as_str().unwrap_or_default());
        return Ok(RuntimeObject::Value(Value::DivertTarget(path)));
    }

    if let Some(name) = obj.get("^var") {
        let context_index = obj.get("ci").and_then(|v| v.as_i64()).unwrap_or(-1) as i32;
        return Ok(RuntimeObject::Value(Value::VariablePointer {
            name: name.as_str().unwrap_or_default().to_string(),
            context_index,
        }));
    }

    let divert_key = [
        ("->", false, None),
        ("f()", true, Some(PushPopType::Function)),
        ("->t->", true, Some(PushPopType::Tunnel)),
        ("x()", false, None),
    ]
    .into_iter()
    .find(|(key, _, _)| obj.contains_key(*key));
    if let Some((key, pushes, push_type)) = divert_key {
        let mut divert = Divert::new();
        divert.pushes_to_stack = pushes;
        if let Some(push_type) = push_type {
            divert.stack_push_type = push_type;
        }
        divert.is_external = key == "x()";
        let target = obj.get(key).and_then(|v| v.as_str()).unwrap_or_default();
        if obj.get("var").and_then(|v| v.as_bool()).unwrap_or(false) {
            divert.variable_divert_name = Some(target.to_string());
        } else {
            divert.target_path = Some(Path::from_components_string(target));
        }
        divert.is_conditional = obj.get("c").and_then(|v| v.as_bool()).unwrap_or(false);
        if divert.is_external {
            divert.external_args =
                obj.get("exArgs").and_then(|v| v.as_i64()).unwrap_or(0) as i32;
        }
        return Ok(RuntimeObject::Divert(divert));
    }

    if let Some(target) = obj.get("*") {
        let mut choice_point =
            ChoicePoint::new(Path::from_components_string(target.as_str().unwrap_or_default()));
        if let Some(flags) = obj.get("flg").and_then(|v| v.as_i64()) {
            choice_point.set_flags(flags as i32);
        }
        return Ok(RuntimeObject::ChoicePoint(choice_point));
    }

    if let Some(name) = obj.get("VAR?") {
        return Ok(RuntimeObject::VariableReference(VariableReference::named(
            name.as_str().unwrap_or_default(),
        )));
    }
    if let Some(path) = obj.get("CNT?") {
        return Ok(RuntimeObject::VariableReference(VariableReference::for_count(
            Path::from_components_string(path.as_str().unwrap_or_default()),
        )));
    }

    let assignment_key = [("VAR=", true), ("temp=", false)]
        .into_iter()
        .find(|(key, _)| obj.contains_key(*key));
    if let Some((key, is_global)) = assignment_key {
        let name = obj.get(key).and_then(|v| v.as_str()).unwrap_or_default();
        let is_new_declaration = !obj.get("re").and_then(|v| v.as_bool()).unwrap_or(false);
        return Ok(RuntimeObject::VariableAssignment(VariableAssignment::new(
            name,
            is_new_declaration,
            is_global,
        )));
    }

    if let Some(text) = obj.get("#") {
        return Ok(RuntimeObject::Tag(text.as_str().unwrap_or_default().to_string()));
    }

    if let Some(list_content) = obj.get("list") {
        let mut list = InkList::new();
        if let Some(origins) = obj.get("origins").and_then(|v| v.as_array()) {
            list.set_initial_origin_names(
                origins
                    .iter()
                    .filter_map(|o| o.as_str().map(str::to_string))
                    .collect(),
            );
        }
        if let Some(entries) = list_content.as_object() {
            for (full_name, value) in entries {
                let item = InkListItem::from_full_name(full_name);
                list.insert(item, value.as_i64().unwrap_or(0) as i32);
            }
        }
        return Ok(RuntimeObject::Value(Value::List(list)));
    }

    if obj.contains_key("originalChoicePath") {
        // Saved choices travel through flow loading, not the object stream,
        // but share the same tagged form.
        return Err(StoryError::BadJson(
            "Choice record found where a runtime object was expected".to_string(),
        ));
    }

    Err(StoryError::BadJson(format!(
        "Failed to convert token to runtime object: {}",
        serde_json::to_string(obj).unwrap_or_default()
    )))
}

/// Parse a saved `Choice` record.
pub fn object_to_choice(token: &JsonValue) -> Result<Choice, StoryError> {
    let obj = token
        .as_object()
        .ok_or_else(|| StoryError::BadJson("choice record is not an object".to_string()))?;
    Ok(Choice {
        text: obj.get("text").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
        index: obj.get("index").and_then(|v| v.as_i64()).unwrap_or(0) as usize,
        source_path: obj
            .get("originalChoicePath")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        original_thread_index: obj
            .get("originalThreadIndex")
            .and_then(|v| v.as_i64())
            .unwrap_or(0) as i32,
        target_path: Path::from_components_string(
            obj.get("targetPath").and_then(|v| v.as_str()).unwrap_or_default(),
        ),
        is_invisible_default: obj
            .get("isInvisibleDefault")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
        tags: obj
            .get("tags")
            .and_then(|v| v.as_array())
            .map(|tags| {
                tags.iter()
                    .filter_map(|t| t.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default(),
        thread_at_generation: None,
    })
}

fn array_to_container(
    items: &[JsonValue],
    tree: &mut ContentTree,
) -> Result<ContainerId, StoryError> {
    let id = tree.add_container();

    let content_count = items.len().saturating_sub(1);
    for token in &items[..content_count] {
        let obj = token_to_runtime_object(token, tree)?;
        if let RuntimeObject::Container(child) = &obj {
            // Content children with names are also addressable by name.
            let child = *child;
            if let Some(name) = tree.node(child).name.clone() {
                tree.node_mut(id).named_children.insert(name, child);
            }
        }
        tree.node_mut(id).content.push(obj);
    }

    if let Some(terminator) = items.last() {
        match terminator {
            JsonValue::Null => {}
            JsonValue::Object(fields) => {
                for (key, value) in fields {
                    match key.as_str() {
                        "#f" => {
                            let flags = value.as_i64().unwrap_or(0) as i32;
                            tree.node_mut(id).set_count_flags(flags);
                        }
                        "#n" => {
                            tree.node_mut(id).name =
                                Some(value.as_str().unwrap_or_default().to_string());
                        }
                        _ => {
                            let child_obj = token_to_runtime_object(value, tree)?;
                            let RuntimeObject::Container(child) = child_obj else {
                                return Err(StoryError::BadJson(format!(
                                    "named content '{}' is not a container",
                                    key
                                )));
                            };
                            tree.node_mut(child).name = Some(key.clone());
                            tree.node_mut(id).named_children.insert(key.clone(), child);
                        }
                    }
                }
            }
            other => {
                return Err(StoryError::BadJson(format!(
                    "unexpected container terminator: {}",
                    other
                )))
            }
        }
    }

    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_minimal_story() {
        let json = r#"{"inkVersion":21,"root":[["^Hello world","\n","done"],null],"listDefs":{}}"#;
        let doc = load_story_document(json).unwrap();
        assert_eq!(doc.ink_version, 21);
        let root = doc.tree.root();
        assert_eq!(doc.tree.content_len(root), 1);
    }

    #[test]
    fn test_bom_is_tolerated() {
        let json = "\u{feff}{\"inkVersion\":21,\"root\":[null]}";
        assert!(load_story_document(json).is_ok());
    }

    #[test]
    fn test_version_bounds() {
        let too_new = r#"{"inkVersion":22,"root":[null]}"#;
        assert!(matches!(load_story_document(too_new), Err(StoryError::VersionTooNew)));
        let too_old = r#"{"inkVersion":17,"root":[null]}"#;
        assert!(matches!(load_story_document(too_old), Err(StoryError::VersionTooOld)));
        let missing = r#"{"root":[null]}"#;
        assert!(matches!(load_story_document(missing), Err(StoryError::MissingVersion)));
    }

    #[test]
    fn test_float_intent_is_preserved() {
        let mut tree = ContentTree::new();
        let token: JsonValue = serde_json::from_str("3.0").unwrap();
        let obj = token_to_runtime_object(&token, &mut tree).unwrap();
        assert_eq!(obj, RuntimeObject::Value(Value::Float(3.0)));

        let int_token: JsonValue = serde_json::from_str("3").unwrap();
        let obj = token_to_runtime_object(&int_token, &mut tree).unwrap();
        assert_eq!(obj, RuntimeObject::Value(Value::Int(3)));

        let legacy = JsonValue::String("2.5f".to_string());
        let obj = token_to_runtime_object(&legacy, &mut tree).unwrap();
        assert_eq!(obj, RuntimeObject::Value(Value::Float(2.5)));
    }

    #[test]
    fn test_string_tokens() {
        let mut tree = ContentTree::new();
        let cases: Vec<(&str, RuntimeObject)> = vec![
            ("\"^foo\"", RuntimeObject::Value(Value::string("foo"))),
            ("\"\\n\"", RuntimeObject::Value(Value::string("\n"))),
            ("\"<>\"", RuntimeObject::Glue),
            ("\"ev\"", RuntimeObject::Command(CommandType::EvalStart)),
            ("\"done\"", RuntimeObject::Command(CommandType::Done)),
            ("\"+\"", RuntimeObject::NativeCall(NativeFunction::Add)),
            ("\"L^\"", RuntimeObject::NativeCall(NativeFunction::Intersect)),
            ("\"void\"", RuntimeObject::Void),
        ];
        for (json, expected) in cases {
            let token: JsonValue = serde_json::from_str(json).unwrap();
            assert_eq!(token_to_runtime_object(&token, &mut tree).unwrap(), expected);
        }
    }

    #[test]
    fn test_divert_variants() {
        let mut tree = ContentTree::new();
        let token: JsonValue = serde_json::from_str(r#"{"f()":"knot","c":true}"#).unwrap();
        match token_to_runtime_object(&token, &mut tree).unwrap() {
            RuntimeObject::Divert(d) => {
                assert!(d.pushes_to_stack && d.is_conditional);
                assert_eq!(d.stack_push_type, PushPopType::Function);
                assert_eq!(d.target_path_string().as_deref(), Some("knot"));
            }
            other => panic!("unexpected: {:?}", other),
        }

        let token: JsonValue = serde_json::from_str(r#"{"x()":"ext","exArgs":2}"#).unwrap();
        match token_to_runtime_object(&token, &mut tree).unwrap() {
            RuntimeObject::Divert(d) => {
                assert!(d.is_external);
                assert_eq!(d.external_args, 2);
            }
            other => panic!("unexpected: {:?}", other),
        }

        let token: JsonValue = serde_json::from_str(r#"{"->":"x","var":true}"#).unwrap();
        match token_to_runtime_object(&token, &mut tree).unwrap() {
            RuntimeObject::Divert(d) => {
                assert_eq!(d.variable_divert_name.as_deref(), Some("x"));
                assert!(d.target_path.is_none());
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_named_content_and_flags() {
        let json = r##"{"inkVersion":21,"root":[["^in knot"],{"knot":[["^k"],{"#f":1,"#n":"knot"}]}]}"##;
        // Named child defined in the terminator object, with flags and name.
        let doc = load_story_document(json).unwrap();
        let root = doc.tree.root();
        let knot = doc.tree.node(root).named_children["knot"];
        assert!(doc.tree.node(knot).visits_should_be_counted);
        assert_eq!(doc.tree.node(knot).path_string, "knot");
    }

    #[test]
    fn test_variable_nodes() {
        let mut tree = ContentTree::new();
        let token: JsonValue = serde_json::from_str(r#"{"VAR=":"x","re":true}"#).unwrap();
        match token_to_runtime_object(&token, &mut tree).unwrap() {
            RuntimeObject::VariableAssignment(a) => {
                assert!(a.is_global && !a.is_new_declaration);
            }
            other => panic!("unexpected: {:?}", other),
        }

        let token: JsonValue = serde_json::from_str(r#"{"CNT?":"knot.stitch"}"#).unwrap();
        match token_to_runtime_object(&token, &mut tree).unwrap() {
            RuntimeObject::VariableReference(r) => {
                assert!(r.name.is_none());
                assert_eq!(
                    r.path_for_count.unwrap().components_string(),
                    "knot.stitch"
                );
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
