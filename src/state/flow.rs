//! Flows
//!
//! A flow is one named top-level execution context: a call stack, an output
//! stream, and the choices generated so far. Multiple flows coexist in a
//! story state; one is current at any time.

use serde_json::{json, Map, Value as JsonValue};

use crate::json::{reader, writer};
use crate::runtime::choice::Choice;
use crate::runtime::container::ContentTree;
use crate::runtime::object::RuntimeObject;
use crate::state::call_stack::{CallStack, Thread};
use crate::story::errors::StoryError;

#[derive(Debug, Clone)]
pub struct Flow {
    pub name: String,
    pub call_stack: CallStack,
    pub output_stream: Vec<RuntimeObject>,
    pub current_choices: Vec<Choice>,
}

impl Flow {
    pub fn new(name: &str, tree: &ContentTree) -> Flow {
        Flow {
            name: name.to_string(),
            call_stack: CallStack::new(tree.root()),
            output_stream: Vec::new(),
            current_choices: Vec::new(),
        }
    }

    pub fn write_json(&self, tree: &ContentTree) -> JsonValue {
        let mut obj = Map::new();
        obj.insert("callstack".to_string(), self.call_stack.write_json(tree));
        obj.insert(
            "outputStream".to_string(),
            writer::write_objects(tree, &self.output_stream),
        );

        // Choices whose generation thread is no longer alive must carry
        // their own thread snapshot to survive the round trip.
        let mut choice_threads = Map::new();
        for choice in &self.current_choices {
            if let Some(thread) = &choice.thread_at_generation {
                if self.call_stack.thread_with_index(choice.original_thread_index).is_none() {
                    choice_threads.insert(
                        choice.original_thread_index.to_string(),
                        thread.write_json(tree),
                    );
                }
            }
        }
        if !choice_threads.is_empty() {
            obj.insert("choiceThreads".to_string(), JsonValue::Object(choice_threads));
        }

        obj.insert(
            "currentChoices".to_string(),
            json!(self
                .current_choices
                .iter()
                .map(writer::write_choice)
                .collect::<Vec<_>>()),
        );
        JsonValue::Object(obj)
    }

    pub fn from_json(
        name: &str,
        token: &JsonValue,
        tree: &ContentTree,
        warnings: &mut Vec<String>,
    ) -> Result<Flow, StoryError> {
        let obj = token
            .as_object()
            .ok_or_else(|| StoryError::BadJson(format!("flow '{}' is not an object", name)))?;
        let mut flow = Flow::new(name, tree);

        let callstack = obj
            .get("callstack")
            .ok_or_else(|| StoryError::BadJson(format!("flow '{}' has no callstack", name)))?;
        flow.call_stack.load_json(callstack, tree, warnings)?;

        if let Some(output) = obj.get("outputStream") {
            flow.output_stream = reader::state_array_to_objects(output)?;
        }
        if let Some(choices) = obj.get("currentChoices").and_then(|v| v.as_array()) {
            for choice_token in choices {
                flow.current_choices.push(reader::object_to_choice(choice_token)?);
            }
        }

        let choice_threads = obj.get("choiceThreads");
        flow.load_flow_choice_threads(choice_threads, tree, warnings)?;
        Ok(flow)
    }

    /// Reattach generation threads to loaded choices: from the live thread
    /// when it still exists, else from the serialized `choiceThreads`.
    pub fn load_flow_choice_threads(
        &mut self,
        choice_threads: Option<&JsonValue>,
        tree: &ContentTree,
        warnings: &mut Vec<String>,
    ) -> Result<(), StoryError> {
        for choice in &mut self.current_choices {
            if let Some(thread) = self.call_stack.thread_with_index(choice.original_thread_index) {
                choice.thread_at_generation = Some(thread.clone());
            } else if let Some(saved) = choice_threads
                .and_then(|v| v.as_object())
                .and_then(|threads| threads.get(&choice.original_thread_index.to_string()))
            {
                choice.thread_at_generation = Some(Thread::from_json(saved, tree, warnings)?);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::path::Path;
    use crate::runtime::value::Value;

    fn tree() -> ContentTree {
        let mut tree = ContentTree::new();
        let root = tree.add_container();
        tree.node_mut(root)
            .content
            .push(RuntimeObject::Value(Value::string("x")));
        tree.seal();
        tree
    }

    #[test]
    fn test_flow_round_trip_with_choice_thread() {
        let tree = tree();
        let mut flow = Flow::new("DEFAULT_FLOW", &tree);
        flow.output_stream.push(RuntimeObject::Value(Value::string("line")));
        flow.output_stream.push(RuntimeObject::Value(Value::string("\n")));

        // A choice generated on a forked thread that is no longer alive.
        let forked = flow.call_stack.fork_thread();
        flow.current_choices.push(Choice {
            text: "Option".to_string(),
            index: 0,
            source_path: "0.2".to_string(),
            target_path: Path::from_components_string("0.c"),
            original_thread_index: forked.thread_index,
            thread_at_generation: Some(forked),
            is_invisible_default: false,
            tags: vec!["t".to_string()],
        });

        let json = flow.write_json(&tree);
        assert!(json.get("choiceThreads").is_some());

        let mut warnings = Vec::new();
        let loaded = Flow::from_json("DEFAULT_FLOW", &json, &tree, &mut warnings).unwrap();
        assert!(warnings.is_empty());
        assert_eq!(loaded.output_stream.len(), 2);
        assert_eq!(loaded.current_choices.len(), 1);
        let choice = &loaded.current_choices[0];
        assert_eq!(choice.text, "Option");
        assert_eq!(choice.tags, vec!["t".to_string()]);
        assert!(choice.thread_at_generation.is_some());
    }
}
