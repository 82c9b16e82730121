//! Call Stack
//!
//! A stack of frames (tunnel or function calls) grouped into threads. A
//! thread is a story-level continuation: pushing one clones the current
//! frame stack so choices generated inside it can later be resumed exactly
//! where they forked, independent of what other threads did since.

use std::collections::HashMap;

use serde_json::{json, Map, Value as JsonValue};

use crate::json::{reader, writer};
use crate::runtime::container::{ContainerId, ContentTree};
use crate::runtime::divert::PushPopType;
use crate::runtime::object::RuntimeObject;
use crate::runtime::path::Path;
use crate::runtime::pointer::Pointer;
use crate::state::variables_state::retain_list_origins_for_assignment;
use crate::story::errors::{RuntimeFault, StoryError};

/// One frame of a thread's stack.
#[derive(Debug, Clone)]
pub struct Element {
    pub current_pointer: Pointer,
    pub in_expression_evaluation: bool,
    pub temporary_variables: HashMap<String, RuntimeObject>,
    pub push_pop_type: PushPopType,
    /// Eval-stack height when the frame was pushed, so a game-initiated
    /// function evaluation knows which values are its return candidates.
    pub evaluation_stack_height_when_pushed: usize,
    /// Output-stream length when a function frame was pushed; -1 once the
    /// function has produced real (non-whitespace) output.
    pub function_start_in_output_stream: i32,
}

impl Element {
    pub fn new(push_pop_type: PushPopType, pointer: Pointer, in_expression_evaluation: bool) -> Element {
        Element {
            current_pointer: pointer,
            in_expression_evaluation,
            temporary_variables: HashMap::new(),
            push_pop_type,
            evaluation_stack_height_when_pushed: 0,
            function_start_in_output_stream: 0,
        }
    }
}

/// A cloned frame stack with an identity, plus the pointer the thread was
/// at before its current step.
#[derive(Debug, Clone)]
pub struct Thread {
    pub elements: Vec<Element>,
    pub thread_index: i32,
    pub previous_pointer: Pointer,
}

impl Thread {
    pub fn new() -> Thread {
        Thread { elements: Vec::new(), thread_index: 0, previous_pointer: Pointer::NULL }
    }

    pub fn write_json(&self, tree: &ContentTree) -> JsonValue {
        let mut elements = Vec::new();
        for el in &self.elements {
            let mut obj = Map::new();
            if !el.current_pointer.is_null() {
                if let Some(container) = el.current_pointer.container {
                    obj.insert("cPath".to_string(), json!(tree.node(container).path_string));
                    obj.insert("idx".to_string(), json!(el.current_pointer.index));
                }
            }
            obj.insert("exp".to_string(), json!(el.in_expression_evaluation));
            obj.insert("type".to_string(), json!(el.push_pop_type as i32));
            if !el.temporary_variables.is_empty() {
                let mut temps = Map::new();
                for (name, value) in &el.temporary_variables {
                    temps.insert(name.clone(), writer::write_runtime_object(tree, value));
                }
                obj.insert("temp".to_string(), JsonValue::Object(temps));
            }
            elements.push(JsonValue::Object(obj));
        }

        let mut obj = Map::new();
        obj.insert("callstack".to_string(), JsonValue::Array(elements));
        obj.insert("threadIndex".to_string(), json!(self.thread_index));
        if !self.previous_pointer.is_null() {
            // The saved location is the resolved object's own path, which
            // for a named container differs from the raw (index) pointer
            // path.
            let path = match self.previous_pointer.resolve(tree) {
                Some(RuntimeObject::Container(id)) => tree.node(id).path_string.clone(),
                _ => self
                    .previous_pointer
                    .path(tree)
                    .map(|p| p.components_string())
                    .unwrap_or_default(),
            };
            obj.insert("previousContentObject".to_string(), json!(path));
        }
        JsonValue::Object(obj)
    }

    pub fn from_json(
        token: &JsonValue,
        tree: &ContentTree,
        warnings: &mut Vec<String>,
    ) -> Result<Thread, StoryError> {
        let obj = token
            .as_object()
            .ok_or_else(|| StoryError::BadJson("thread is not an object".to_string()))?;
        let mut thread = Thread::new();
        thread.thread_index = obj.get("threadIndex").and_then(|v| v.as_i64()).unwrap_or(0) as i32;

        if let Some(elements) = obj.get("callstack").and_then(|v| v.as_array()) {
            for el_token in elements {
                let el_obj = el_token
                    .as_object()
                    .ok_or_else(|| StoryError::BadJson("callstack element is not an object".to_string()))?;
                let push_pop_type = el_obj
                    .get("type")
                    .and_then(|v| v.as_i64())
                    .and_then(PushPopType::from_wire)
                    .ok_or_else(|| StoryError::BadJson("bad frame type in callstack".to_string()))?;

                let mut pointer = Pointer::NULL;
                if let Some(container_path) = el_obj.get("cPath").and_then(|v| v.as_str()) {
                    let path = Path::from_components_string(container_path);
                    let result = tree.content_at_path(tree.root(), &path, 0, None);
                    if result.obj.is_none() {
                        return Err(StoryError::BadJson(format!(
                            "When loading state, internal story location couldn't be found: {}. Has the story changed since this save data was created?",
                            container_path
                        )));
                    }
                    pointer.container = result.container();
                    pointer.index = el_obj.get("idx").and_then(|v| v.as_i64()).unwrap_or(0) as i32;
                    if result.approximate {
                        match pointer.container {
                            Some(container) => warnings.push(format!(
                                "When loading state, exact internal story location couldn't be found: '{}', so it was approximated to '{}' to recover. Has the story changed since this save data was created?",
                                container_path,
                                tree.node(container).path_string
                            )),
                            None => warnings.push(format!(
                                "When loading state, exact internal story location couldn't be found: '{}' and it may not be recoverable. Has the story changed since this save data was created?",
                                container_path
                            )),
                        }
                    }
                }

                let in_expression_evaluation =
                    el_obj.get("exp").and_then(|v| v.as_bool()).unwrap_or(false);
                let mut element = Element::new(push_pop_type, pointer, in_expression_evaluation);
                if let Some(temps) = el_obj.get("temp").and_then(|v| v.as_object()) {
                    for (name, value) in temps {
                        element
                            .temporary_variables
                            .insert(name.clone(), reader::state_token_to_object(value)?);
                    }
                }
                thread.elements.push(element);
            }
        }

        if let Some(prev_path) = obj.get("previousContentObject").and_then(|v| v.as_str()) {
            let path = Path::from_components_string(prev_path);
            let (pointer, _) = tree.pointer_at_path(&path);
            thread.previous_pointer = pointer;
        }

        Ok(thread)
    }
}

impl Default for Thread {
    fn default() -> Thread {
        Thread::new()
    }
}

#[derive(Debug, Clone)]
pub struct CallStack {
    threads: Vec<Thread>,
    thread_counter: i32,
    start_of_root: Pointer,
}

impl CallStack {
    pub fn new(root: ContainerId) -> CallStack {
        let mut stack = CallStack {
            threads: Vec::new(),
            thread_counter: 0,
            start_of_root: Pointer::start_of(root),
        };
        stack.reset();
        stack
    }

    pub fn reset(&mut self) {
        let mut thread = Thread::new();
        thread
            .elements
            .push(Element::new(PushPopType::Tunnel, self.start_of_root, false));
        self.threads = vec![thread];
    }

    pub fn depth(&self) -> usize {
        self.elements().len()
    }

    pub fn elements(&self) -> &[Element] {
        &self.current_thread().elements
    }

    pub fn current_element(&self) -> &Element {
        let thread = self.current_thread();
        thread.elements.last().expect("call stack cannot be empty")
    }

    pub fn current_element_mut(&mut self) -> &mut Element {
        self.current_thread_mut()
            .elements
            .last_mut()
            .expect("call stack cannot be empty")
    }

    pub fn current_element_index(&self) -> usize {
        self.elements().len() - 1
    }

    pub fn current_thread(&self) -> &Thread {
        self.threads.last().expect("thread stack cannot be empty")
    }

    pub fn current_thread_mut(&mut self) -> &mut Thread {
        self.threads.last_mut().expect("thread stack cannot be empty")
    }

    /// Replace the whole thread stack with a single thread; only valid when
    /// threads are flat (after a choice has been taken).
    pub fn set_current_thread(&mut self, thread: Thread) {
        debug_assert!(self.threads.len() == 1, "shouldn't set the current thread on a thread stack");
        self.threads = vec![thread];
    }

    pub fn can_pop(&self) -> bool {
        self.depth() > 1
    }

    pub fn can_pop_type(&self, push_pop_type: Option<PushPopType>) -> bool {
        if !self.can_pop() {
            return false;
        }
        match push_pop_type {
            None => true,
            Some(t) => self.current_element().push_pop_type == t,
        }
    }

    pub fn push(
        &mut self,
        push_pop_type: PushPopType,
        external_evaluation_stack_height: usize,
        output_stream_length_with_pushed: usize,
    ) {
        let pointer = self.current_element().current_pointer;
        let mut element = Element::new(push_pop_type, pointer, false);
        element.evaluation_stack_height_when_pushed = external_evaluation_stack_height;
        element.function_start_in_output_stream = output_stream_length_with_pushed as i32;
        self.current_thread_mut().elements.push(element);
    }

    pub fn pop(&mut self, push_pop_type: Option<PushPopType>) -> Result<(), RuntimeFault> {
        if self.can_pop_type(push_pop_type) {
            self.current_thread_mut().elements.pop();
            Ok(())
        } else {
            Err(RuntimeFault::new("Mismatched push/pop in Callstack"))
        }
    }

    pub fn element_is_evaluate_from_game(&self) -> bool {
        self.current_element().push_pop_type == PushPopType::FunctionEvaluationFromGame
    }

    pub fn can_pop_thread(&self) -> bool {
        self.threads.len() > 1 && !self.element_is_evaluate_from_game()
    }

    pub fn push_thread(&mut self) {
        let mut new_thread = self.current_thread().clone();
        self.thread_counter += 1;
        new_thread.thread_index = self.thread_counter;
        self.threads.push(new_thread);
    }

    /// Clone the current thread under a fresh index without pushing it.
    pub fn fork_thread(&mut self) -> Thread {
        let mut forked = self.current_thread().clone();
        self.thread_counter += 1;
        forked.thread_index = self.thread_counter;
        forked
    }

    pub fn pop_thread(&mut self) -> Result<(), RuntimeFault> {
        if self.can_pop_thread() {
            self.threads.pop();
            Ok(())
        } else {
            Err(RuntimeFault::new("Can't pop thread"))
        }
    }

    pub fn thread_with_index(&self, index: i32) -> Option<&Thread> {
        self.threads.iter().find(|t| t.thread_index == index)
    }

    /// Look up a temporary. Context indices are 1-based frame numbers; -1
    /// (or the global context, when a global read fell through) means the
    /// current frame.
    pub fn get_temporary_variable_with_name(
        &self,
        name: &str,
        context_index: i32,
    ) -> Option<RuntimeObject> {
        let context_index = if context_index <= 0 {
            self.current_element_index() + 1
        } else {
            context_index as usize
        };
        self.elements()
            .get(context_index - 1)
            .and_then(|el| el.temporary_variables.get(name))
            .cloned()
    }

    pub fn set_temporary_variable(
        &mut self,
        name: &str,
        value: RuntimeObject,
        declare_new: bool,
        context_index: i32,
    ) -> Result<(), RuntimeFault> {
        let context_index = if context_index <= 0 {
            self.current_element_index() + 1
        } else {
            context_index as usize
        };
        let element = self
            .current_thread_mut()
            .elements
            .get_mut(context_index - 1)
            .ok_or_else(|| RuntimeFault::new("Context index out of range"))?;
        if !declare_new && !element.temporary_variables.contains_key(name) {
            return Err(RuntimeFault::new(format!(
                "Could not find temporary variable to set: {}",
                name
            )));
        }
        let mut value = value;
        if let Some(old_value) = element.temporary_variables.get(name) {
            retain_list_origins_for_assignment(old_value, &mut value);
        }
        element.temporary_variables.insert(name.to_string(), value);
        Ok(())
    }

    /// The context index a variable pointer should capture: the current
    /// frame when the temp exists there, else global (0).
    pub fn context_for_variable_named(&self, name: &str) -> i32 {
        if self.current_element().temporary_variables.contains_key(name) {
            (self.current_element_index() + 1) as i32
        } else {
            0
        }
    }

    pub fn thread_counter(&self) -> i32 {
        self.thread_counter
    }

    pub fn call_stack_trace(&self, tree: &ContentTree) -> String {
        let mut out = String::new();
        for (t, thread) in self.threads.iter().enumerate() {
            let current = if t == self.threads.len() - 1 { "(current) " } else { "" };
            out.push_str(&format!(
                "=== THREAD {}/{} {}===\n",
                t + 1,
                self.threads.len(),
                current
            ));
            for element in &thread.elements {
                match element.push_pop_type {
                    PushPopType::Function => out.push_str("  [FUNCTION] "),
                    _ => out.push_str("  [TUNNEL] "),
                }
                if let Some(container) = element.current_pointer.container {
                    out.push_str(&format!("<SOMEWHERE IN {}>\n", tree.node(container).path_string));
                } else {
                    out.push('\n');
                }
            }
        }
        out
    }

    pub fn write_json(&self, tree: &ContentTree) -> JsonValue {
        json!({
            "threads": self.threads.iter().map(|t| t.write_json(tree)).collect::<Vec<_>>(),
            "threadCounter": self.thread_counter,
        })
    }

    pub fn load_json(
        &mut self,
        token: &JsonValue,
        tree: &ContentTree,
        warnings: &mut Vec<String>,
    ) -> Result<(), StoryError> {
        let obj = token
            .as_object()
            .ok_or_else(|| StoryError::BadJson("callstack is not an object".to_string()))?;
        self.threads.clear();
        if let Some(threads) = obj.get("threads").and_then(|v| v.as_array()) {
            for thread_token in threads {
                self.threads.push(Thread::from_json(thread_token, tree, warnings)?);
            }
        }
        if self.threads.is_empty() {
            return Err(StoryError::BadJson("save state has no threads".to_string()));
        }
        self.thread_counter = obj.get("threadCounter").and_then(|v| v.as_i64()).unwrap_or(0) as i32;
        self.start_of_root = Pointer::start_of(tree.root());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::value::Value;

    fn tree_with_root() -> (ContentTree, ContainerId) {
        let mut tree = ContentTree::new();
        let root = tree.add_container();
        tree.node_mut(root).content.push(RuntimeObject::Value(Value::string("x")));
        tree.seal();
        (tree, root)
    }

    #[test]
    fn test_push_pop_typed() {
        let (_, root) = tree_with_root();
        let mut stack = CallStack::new(root);
        assert!(!stack.can_pop());

        stack.push(PushPopType::Function, 0, 0);
        assert!(stack.can_pop_type(Some(PushPopType::Function)));
        assert!(!stack.can_pop_type(Some(PushPopType::Tunnel)));
        assert!(stack.pop(Some(PushPopType::Tunnel)).is_err());
        assert!(stack.pop(Some(PushPopType::Function)).is_ok());
        assert!(stack.pop(None).is_err());
    }

    #[test]
    fn test_thread_fork_gets_fresh_index() {
        let (_, root) = tree_with_root();
        let mut stack = CallStack::new(root);
        let forked = stack.fork_thread();
        assert_eq!(forked.thread_index, 1);
        stack.push_thread();
        assert_eq!(stack.current_thread().thread_index, 2);
        assert!(stack.can_pop_thread());
        stack.pop_thread().unwrap();
        assert!(!stack.can_pop_thread());
        assert!(stack.pop_thread().is_err());
    }

    #[test]
    fn test_temporaries_by_context() {
        let (_, root) = tree_with_root();
        let mut stack = CallStack::new(root);
        stack
            .set_temporary_variable("x", RuntimeObject::Value(Value::Int(1)), true, -1)
            .unwrap();
        stack.push(PushPopType::Function, 0, 0);
        stack
            .set_temporary_variable("y", RuntimeObject::Value(Value::Int(2)), true, -1)
            .unwrap();

        // Frame 1 holds x, frame 2 holds y.
        assert!(stack.get_temporary_variable_with_name("x", 1).is_some());
        assert!(stack.get_temporary_variable_with_name("x", 2).is_none());
        assert!(stack.get_temporary_variable_with_name("y", -1).is_some());

        assert_eq!(stack.context_for_variable_named("y"), 2);
        assert_eq!(stack.context_for_variable_named("zzz"), 0);

        // Reassignment without declaration must target an existing temp.
        assert!(stack
            .set_temporary_variable("nope", RuntimeObject::Value(Value::Int(3)), false, -1)
            .is_err());
    }

    #[test]
    fn test_json_round_trip() {
        let (tree, root) = tree_with_root();
        let mut stack = CallStack::new(root);
        stack.push(PushPopType::Function, 0, 0);
        stack
            .set_temporary_variable("t", RuntimeObject::Value(Value::Int(9)), true, -1)
            .unwrap();
        stack.push_thread();

        let json = stack.write_json(&tree);
        let mut loaded = CallStack::new(root);
        let mut warnings = Vec::new();
        loaded.load_json(&json, &tree, &mut warnings).unwrap();
        assert!(warnings.is_empty());
        assert_eq!(loaded.threads.len(), 2);
        assert_eq!(loaded.thread_counter(), 1);
        assert_eq!(loaded.depth(), 2);
        assert!(loaded.get_temporary_variable_with_name("t", -1).is_some());
    }
}
