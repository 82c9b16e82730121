//! Story State
//!
//! All the state of a story that changes at runtime and is serialized into
//! save games: the flow set, the evaluation stack, visit and turn counts,
//! the RNG state, error buffers, and the output-stream pipeline that turns
//! raw content into user-visible lines (whitespace splitting, glue
//! trimming, function-boundary trims, text and tag assembly).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{json, Map, Value as JsonValue};

use crate::json::{reader, writer};
use crate::runtime::choice::Choice;
use crate::runtime::container::{ContainerId, ContentTree};
use crate::runtime::control_command::CommandType;
use crate::runtime::divert::PushPopType;
use crate::runtime::object::RuntimeObject;
use crate::runtime::path::Path;
use crate::runtime::pointer::Pointer;
use crate::runtime::prng::Prng;
use crate::runtime::value::{Value, ValueType};
use crate::state::flow::Flow;
use crate::state::state_patch::StatePatch;
use crate::state::variables_state::VariablesState;
use crate::story::errors::{RuntimeFault, StoryError};

use indexmap::IndexMap;

pub const INK_SAVE_STATE_VERSION: i64 = 10;
pub const MIN_COMPATIBLE_LOAD_VERSION: i64 = 8;
pub const DEFAULT_FLOW_NAME: &str = "DEFAULT_FLOW";

#[derive(Debug, Clone)]
pub struct StoryState {
    pub current_flow: Flow,
    /// Flows other than the current one, by name.
    named_flows: IndexMap<String, Flow>,
    pub evaluation_stack: Vec<RuntimeObject>,
    pub diverted_pointer: Pointer,
    visit_counts: Arc<HashMap<String, i32>>,
    turn_indices: Arc<HashMap<String, i32>>,
    pub current_turn_index: i32,
    pub story_seed: i32,
    pub previous_random: i32,
    pub did_safe_exit: bool,
    pub patch: Option<StatePatch>,
    pub variables_state: VariablesState,
    current_errors: Vec<String>,
    current_warnings: Vec<String>,
    cached_text: String,
    cached_tags: Vec<String>,
    text_dirty: bool,
    tags_dirty: bool,
}

impl StoryState {
    pub fn new(tree: &ContentTree) -> StoryState {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(1);
        let story_seed = (Prng::new(millis).next() % 100) as i32;

        let mut state = StoryState {
            current_flow: Flow::new(DEFAULT_FLOW_NAME, tree),
            named_flows: IndexMap::new(),
            evaluation_stack: Vec::new(),
            diverted_pointer: Pointer::NULL,
            visit_counts: Arc::new(HashMap::new()),
            turn_indices: Arc::new(HashMap::new()),
            current_turn_index: -1,
            story_seed,
            previous_random: 0,
            did_safe_exit: false,
            patch: None,
            variables_state: VariablesState::new(),
            current_errors: Vec::new(),
            current_warnings: Vec::new(),
            cached_text: String::new(),
            cached_tags: Vec::new(),
            text_dirty: true,
            tags_dirty: true,
        };
        state.go_to_start(tree);
        state
    }

    // -- pointers and flow ------------------------------------------------

    pub fn go_to_start(&mut self, tree: &ContentTree) {
        self.set_current_pointer(Pointer::start_of(tree.root()));
    }

    pub fn current_pointer(&self) -> Pointer {
        self.current_flow.call_stack.current_element().current_pointer
    }

    pub fn set_current_pointer(&mut self, pointer: Pointer) {
        self.current_flow.call_stack.current_element_mut().current_pointer = pointer;
    }

    pub fn previous_pointer(&self) -> Pointer {
        self.current_flow.call_stack.current_thread().previous_pointer
    }

    pub fn set_previous_pointer(&mut self, pointer: Pointer) {
        self.current_flow.call_stack.current_thread_mut().previous_pointer = pointer;
    }

    pub fn in_expression_evaluation(&self) -> bool {
        self.current_flow.call_stack.current_element().in_expression_evaluation
    }

    pub fn set_in_expression_evaluation(&mut self, value: bool) {
        self.current_flow.call_stack.current_element_mut().in_expression_evaluation = value;
    }

    pub fn can_continue(&self) -> bool {
        !self.current_pointer().is_null() && !self.has_error()
    }

    pub fn has_error(&self) -> bool {
        !self.current_errors.is_empty()
    }

    pub fn has_warning(&self) -> bool {
        !self.current_warnings.is_empty()
    }

    pub fn current_errors(&self) -> &[String] {
        &self.current_errors
    }

    pub fn current_warnings(&self) -> &[String] {
        &self.current_warnings
    }

    pub fn add_error(&mut self, message: String, is_warning: bool) {
        if is_warning {
            self.current_warnings.push(message);
        } else {
            self.current_errors.push(message);
        }
    }

    pub fn reset_errors(&mut self) {
        self.current_errors.clear();
        self.current_warnings.clear();
    }

    pub fn force_end(&mut self) {
        self.current_flow.call_stack.reset();
        self.current_flow.current_choices.clear();
        self.set_current_pointer(Pointer::NULL);
        self.set_previous_pointer(Pointer::NULL);
        self.did_safe_exit = true;
    }

    // -- flows ------------------------------------------------------------

    pub fn current_flow_name(&self) -> &str {
        &self.current_flow.name
    }

    pub fn current_flow_is_default_flow(&self) -> bool {
        self.current_flow.name == DEFAULT_FLOW_NAME
    }

    pub fn alive_flow_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for name in std::iter::once(self.current_flow.name.as_str())
            .chain(self.named_flows.keys().map(|s| s.as_str()))
        {
            if name != DEFAULT_FLOW_NAME {
                names.push(name.to_string());
            }
        }
        names
    }

    pub fn switch_flow_internal(&mut self, flow_name: &str, tree: &ContentTree) {
        if flow_name == self.current_flow.name {
            return;
        }
        let new_flow = match self.named_flows.shift_remove(flow_name) {
            Some(flow) => flow,
            None => Flow::new(flow_name, tree),
        };
        let old_flow = std::mem::replace(&mut self.current_flow, new_flow);
        self.named_flows.insert(old_flow.name.clone(), old_flow);
        self.mark_output_dirty();
    }

    pub fn switch_to_default_flow_internal(&mut self, tree: &ContentTree) {
        if !self.current_flow_is_default_flow() {
            self.switch_flow_internal(DEFAULT_FLOW_NAME, tree);
        }
    }

    pub fn remove_flow_internal(&mut self, flow_name: &str, tree: &ContentTree) -> Result<(), StoryError> {
        if flow_name == DEFAULT_FLOW_NAME {
            return Err(StoryError::InvalidOperation("Cannot destroy default flow".to_string()));
        }
        if self.current_flow.name == flow_name {
            self.switch_to_default_flow_internal(tree);
        }
        self.named_flows.shift_remove(flow_name);
        Ok(())
    }

    // -- visit and turn counts -------------------------------------------

    pub fn visit_count_for_path(&self, container_path: &str) -> i32 {
        if let Some(patch) = &self.patch {
            if let Some(count) = patch.try_get_visit_count(container_path) {
                return count;
            }
        }
        self.visit_counts.get(container_path).copied().unwrap_or(0)
    }

    pub fn increment_visit_count(&mut self, container_path: &str) {
        let count = self.visit_count_for_path(container_path) + 1;
        match &mut self.patch {
            Some(patch) => patch.set_visit_count(container_path, count),
            None => {
                Arc::make_mut(&mut self.visit_counts).insert(container_path.to_string(), count);
            }
        }
    }

    pub fn record_turn_index_visit(&mut self, container_path: &str) {
        let turn_index = self.current_turn_index;
        match &mut self.patch {
            Some(patch) => patch.set_turn_index(container_path, turn_index),
            None => {
                Arc::make_mut(&mut self.turn_indices).insert(container_path.to_string(), turn_index);
            }
        }
    }

    /// Turns since the container was last visited, or -1 if never.
    pub fn turns_since_for_path(&self, container_path: &str) -> i32 {
        if let Some(patch) = &self.patch {
            if let Some(index) = patch.try_get_turn_index(container_path) {
                return self.current_turn_index - index;
            }
        }
        match self.turn_indices.get(container_path) {
            Some(index) => self.current_turn_index - index,
            None => -1,
        }
    }

    // -- output stream ----------------------------------------------------

    pub fn output_stream(&self) -> &[RuntimeObject] {
        &self.current_flow.output_stream
    }

    pub fn mark_output_dirty(&mut self) {
        self.text_dirty = true;
        self.tags_dirty = true;
    }

    pub fn reset_output(&mut self, objs: Option<Vec<RuntimeObject>>) {
        self.current_flow.output_stream.clear();
        if let Some(objs) = objs {
            self.current_flow.output_stream.extend(objs);
        }
        self.mark_output_dirty();
    }

    pub fn push_to_output_stream(&mut self, obj: RuntimeObject) {
        if let RuntimeObject::Value(Value::String(text)) = &obj {
            if let Some(pieces) = split_head_tail_whitespace(&text.text) {
                for piece in pieces {
                    self.push_to_output_stream_individual(RuntimeObject::Value(Value::string(piece)));
                }
                self.mark_output_dirty();
                return;
            }
        }
        self.push_to_output_stream_individual(obj);
        self.mark_output_dirty();
    }

    pub fn pop_from_output_stream(&mut self, count: usize) {
        let len = self.current_flow.output_stream.len();
        self.current_flow.output_stream.truncate(len.saturating_sub(count));
        self.mark_output_dirty();
    }

    fn push_to_output_stream_individual(&mut self, obj: RuntimeObject) {
        let mut include_in_output = true;

        match &obj {
            RuntimeObject::Glue => {
                self.trim_newlines_from_output_stream();
            }
            RuntimeObject::Value(Value::String(text)) => {
                // Whitespace gets trimmed after glue, and around function
                // call boundaries.
                let mut function_trim_index: i32 = -1;
                {
                    let current_element = self.current_flow.call_stack.current_element();
                    if current_element.push_pop_type == PushPopType::Function {
                        function_trim_index = current_element.function_start_in_output_stream;
                    }
                }

                let mut glue_trim_index: i32 = -1;
                for (i, existing) in self.current_flow.output_stream.iter().enumerate().rev() {
                    match existing {
                        RuntimeObject::Glue => {
                            glue_trim_index = i as i32;
                            break;
                        }
                        RuntimeObject::Command(CommandType::BeginString) => {
                            if i as i32 >= function_trim_index {
                                function_trim_index = -1;
                            }
                            break;
                        }
                        _ => {}
                    }
                }

                let trim_index = if glue_trim_index != -1 && function_trim_index != -1 {
                    function_trim_index.min(glue_trim_index)
                } else if glue_trim_index != -1 {
                    glue_trim_index
                } else {
                    function_trim_index
                };

                if trim_index != -1 {
                    if text.is_newline {
                        include_in_output = false;
                    } else if text.is_non_whitespace() {
                        if glue_trim_index > -1 {
                            self.remove_existing_glue();
                        }
                        if function_trim_index > -1 {
                            // Real text arrived: the enclosing function
                            // frames stop trimming their leading output.
                            let elements =
                                &mut self.current_flow.call_stack.current_thread_mut().elements;
                            for element in elements.iter_mut().rev() {
                                if element.push_pop_type == PushPopType::Function {
                                    element.function_start_in_output_stream = -1;
                                } else {
                                    break;
                                }
                            }
                        }
                    }
                } else if text.is_newline
                    && (self.output_stream_ends_in_newline() || !self.output_stream_contains_content())
                {
                    include_in_output = false;
                }
            }
            _ => {}
        }

        if include_in_output {
            self.current_flow.output_stream.push(obj);
            self.mark_output_dirty();
        }
    }

    /// Glue removes trailing newlines (and the whitespace around them) back
    /// to the last real content or command.
    fn trim_newlines_from_output_stream(&mut self) {
        let mut remove_whitespace_from: i32 = -1;
        for (i, obj) in self.current_flow.output_stream.iter().enumerate().rev() {
            match obj {
                RuntimeObject::Command(_) => break,
                RuntimeObject::Value(Value::String(text)) => {
                    if text.is_non_whitespace() {
                        break;
                    }
                    if text.is_newline {
                        remove_whitespace_from = i as i32;
                    }
                }
                _ => {}
            }
        }

        if remove_whitespace_from >= 0 {
            let mut i = remove_whitespace_from as usize;
            while i < self.current_flow.output_stream.len() {
                if matches!(
                    self.current_flow.output_stream[i],
                    RuntimeObject::Value(Value::String(_))
                ) {
                    self.current_flow.output_stream.remove(i);
                } else {
                    i += 1;
                }
            }
        }
        self.mark_output_dirty();
    }

    fn remove_existing_glue(&mut self) {
        let mut i = self.current_flow.output_stream.len();
        while i > 0 {
            i -= 1;
            match &self.current_flow.output_stream[i] {
                RuntimeObject::Glue => {
                    self.current_flow.output_stream.remove(i);
                }
                RuntimeObject::Command(_) => break,
                _ => {}
            }
        }
        self.mark_output_dirty();
    }

    pub fn output_stream_ends_in_newline(&self) -> bool {
        for obj in self.current_flow.output_stream.iter().rev() {
            match obj {
                RuntimeObject::Command(_) => break,
                RuntimeObject::Value(Value::String(text)) => {
                    if text.is_newline {
                        return true;
                    }
                    if text.is_non_whitespace() {
                        break;
                    }
                }
                _ => {}
            }
        }
        false
    }

    pub fn output_stream_contains_content(&self) -> bool {
        self.current_flow
            .output_stream
            .iter()
            .any(|obj| matches!(obj, RuntimeObject::Value(Value::String(_))))
    }

    pub fn in_string_evaluation(&self) -> bool {
        self.current_flow
            .output_stream
            .iter()
            .rev()
            .any(|obj| obj.is_command(CommandType::BeginString))
    }

    /// On function return, whitespace the function produced at its end is
    /// trimmed away so calls glue tightly into surrounding text.
    pub fn trim_whitespace_from_function_end(&mut self) {
        if self.current_flow.call_stack.current_element().push_pop_type != PushPopType::Function {
            return;
        }
        let function_start = self
            .current_flow
            .call_stack
            .current_element()
            .function_start_in_output_stream
            .max(0) as usize;

        let mut i = self.current_flow.output_stream.len();
        while i > function_start {
            i -= 1;
            match &self.current_flow.output_stream[i] {
                RuntimeObject::Value(Value::String(text)) => {
                    if text.is_newline || text.is_inline_whitespace {
                        self.current_flow.output_stream.remove(i);
                        self.mark_output_dirty();
                    } else {
                        break;
                    }
                }
                _ => {}
            }
        }
    }

    pub fn pop_call_stack(&mut self, pop_type: Option<PushPopType>) -> Result<(), RuntimeFault> {
        if self.current_flow.call_stack.current_element().push_pop_type == PushPopType::Function {
            self.trim_whitespace_from_function_end();
        }
        self.current_flow.call_stack.pop(pop_type)
    }

    // -- text and tags ----------------------------------------------------

    pub fn current_text(&mut self) -> String {
        if self.text_dirty {
            let mut sb = String::new();
            let mut in_tag = false;
            for obj in &self.current_flow.output_stream {
                match obj {
                    RuntimeObject::Value(Value::String(text)) if !in_tag => {
                        sb.push_str(&text.text)
                    }
                    RuntimeObject::Command(CommandType::BeginTag) => in_tag = true,
                    RuntimeObject::Command(CommandType::EndTag) => in_tag = false,
                    _ => {}
                }
            }
            self.cached_text = clean_output_whitespace(&sb);
            self.text_dirty = false;
        }
        self.cached_text.clone()
    }

    pub fn current_tags(&mut self) -> Vec<String> {
        if self.tags_dirty {
            let mut tags = Vec::new();
            let mut in_tag = false;
            let mut sb = String::new();
            for obj in &self.current_flow.output_stream {
                match obj {
                    RuntimeObject::Command(CommandType::BeginTag) => {
                        if in_tag && !sb.is_empty() {
                            tags.push(clean_output_whitespace(&sb));
                            sb.clear();
                        }
                        in_tag = true;
                    }
                    RuntimeObject::Command(CommandType::EndTag) => {
                        if !sb.is_empty() {
                            tags.push(clean_output_whitespace(&sb));
                            sb.clear();
                        }
                        in_tag = false;
                    }
                    RuntimeObject::Value(Value::String(text)) if in_tag => {
                        sb.push_str(&text.text);
                    }
                    RuntimeObject::Tag(text) if !in_tag => {
                        if !text.is_empty() {
                            tags.push(text.clone());
                        }
                    }
                    _ => {}
                }
            }
            if !sb.is_empty() {
                tags.push(clean_output_whitespace(&sb));
            }
            self.cached_tags = tags;
            self.tags_dirty = false;
        }
        self.cached_tags.clone()
    }

    // -- evaluation stack -------------------------------------------------

    pub fn push_evaluation_stack(&mut self, obj: RuntimeObject) {
        self.evaluation_stack.push(obj);
    }

    pub fn pop_evaluation_stack(&mut self) -> Option<RuntimeObject> {
        self.evaluation_stack.pop()
    }

    pub fn pop_evaluation_stack_n(&mut self, count: usize) -> Result<Vec<RuntimeObject>, RuntimeFault> {
        if count > self.evaluation_stack.len() {
            return Err(RuntimeFault::new("trying to pop too many objects"));
        }
        Ok(self.evaluation_stack.split_off(self.evaluation_stack.len() - count))
    }

    pub fn peek_evaluation_stack(&self) -> Option<&RuntimeObject> {
        self.evaluation_stack.last()
    }

    // -- choices ----------------------------------------------------------

    /// Choices offered to the player; empty while the story can continue.
    pub fn current_choices(&self) -> &[Choice] {
        if self.can_continue() {
            &[]
        } else {
            &self.current_flow.current_choices
        }
    }

    pub fn generated_choices(&self) -> &[Choice] {
        &self.current_flow.current_choices
    }

    pub fn generated_choices_mut(&mut self) -> &mut Vec<Choice> {
        &mut self.current_flow.current_choices
    }

    pub fn set_chosen_path(
        &mut self,
        new_pointer: Pointer,
        incrementing_turn_index: bool,
    ) {
        self.current_flow.current_choices.clear();
        let mut pointer = new_pointer;
        if !pointer.is_null() && pointer.index == -1 {
            pointer.index = 0;
        }
        self.set_current_pointer(pointer);
        if incrementing_turn_index {
            self.current_turn_index += 1;
        }
    }

    // -- game-initiated function evaluation -------------------------------

    pub fn start_function_evaluation_from_game(
        &mut self,
        func_container: ContainerId,
        args: &[Value],
    ) -> Result<(), StoryError> {
        let height = self.evaluation_stack.len();
        self.current_flow
            .call_stack
            .push(PushPopType::FunctionEvaluationFromGame, height, 0);
        self.current_flow.call_stack.current_element_mut().current_pointer =
            Pointer::start_of(func_container);
        self.pass_arguments_to_evaluation_stack(args)
    }

    pub fn pass_arguments_to_evaluation_stack(&mut self, args: &[Value]) -> Result<(), StoryError> {
        for arg in args {
            match arg.value_type() {
                ValueType::Bool
                | ValueType::Int
                | ValueType::Float
                | ValueType::String
                | ValueType::List => {
                    self.push_evaluation_stack(RuntimeObject::Value(arg.clone()));
                }
                other => {
                    return Err(StoryError::InvalidOperation(format!(
                        "ink arguments when calling EvaluateFunction / ChoosePathStringWithParameters must be number, string, bool or InkList. Argument was {}",
                        other
                    )))
                }
            }
        }
        Ok(())
    }

    pub fn try_exit_function_evaluation_from_game(&mut self) -> bool {
        if self.current_flow.call_stack.element_is_evaluate_from_game() {
            self.set_current_pointer(Pointer::NULL);
            self.did_safe_exit = true;
            return true;
        }
        false
    }

    pub fn complete_function_evaluation_from_game(
        &mut self,
        tree: &ContentTree,
    ) -> Result<Option<Value>, StoryError> {
        if !self.current_flow.call_stack.element_is_evaluate_from_game() {
            return Err(StoryError::InvalidOperation(format!(
                "Expected external function evaluation to be complete. Stack trace: {}",
                self.current_flow.call_stack.call_stack_trace(tree)
            )));
        }

        let original_height = self
            .current_flow
            .call_stack
            .current_element()
            .evaluation_stack_height_when_pushed;
        let mut returned: Option<RuntimeObject> = None;
        while self.evaluation_stack.len() > original_height {
            if let Some(popped) = self.pop_evaluation_stack() {
                if returned.is_none() {
                    returned = Some(popped);
                }
            }
        }

        self.pop_call_stack(Some(PushPopType::FunctionEvaluationFromGame))
            .map_err(|e| StoryError::InvalidOperation(e.message))?;

        match returned {
            Some(RuntimeObject::Value(Value::DivertTarget(path))) => {
                Ok(Some(Value::string(format!("-> {}", path.components_string()))))
            }
            Some(RuntimeObject::Value(value)) => Ok(Some(value)),
            _ => Ok(None),
        }
    }

    // -- snapshots and patching ------------------------------------------

    /// Make a structurally shared copy that writes through a fresh patch.
    /// The copy becomes the live state; `self` is kept as the snapshot (or
    /// handed out for background saving).
    pub fn copy_and_start_patching(&self) -> StoryState {
        StoryState {
            current_flow: self.current_flow.clone(),
            named_flows: self.named_flows.clone(),
            evaluation_stack: self.evaluation_stack.clone(),
            diverted_pointer: self.diverted_pointer,
            visit_counts: Arc::clone(&self.visit_counts),
            turn_indices: Arc::clone(&self.turn_indices),
            current_turn_index: self.current_turn_index,
            story_seed: self.story_seed,
            previous_random: self.previous_random,
            did_safe_exit: self.did_safe_exit,
            patch: Some(StatePatch::new(self.patch.as_ref())),
            variables_state: self.variables_state.clone(),
            current_errors: self.current_errors.clone(),
            current_warnings: self.current_warnings.clone(),
            cached_text: String::new(),
            cached_tags: Vec::new(),
            text_dirty: true,
            tags_dirty: true,
        }
    }

    /// Merge the patch (if any) back into the copy-on-write base maps.
    pub fn apply_any_patch(&mut self) {
        let Some(patch) = self.patch.take() else { return };
        let StatePatch { globals, changed_variables, visit_counts, turn_indices } = patch;

        self.variables_state.apply_patch(StatePatch {
            globals,
            changed_variables,
            ..StatePatch::default()
        });

        let base_visits = Arc::make_mut(&mut self.visit_counts);
        for (path, count) in visit_counts {
            base_visits.insert(path, count);
        }
        let base_turns = Arc::make_mut(&mut self.turn_indices);
        for (path, index) in turn_indices {
            base_turns.insert(path, index);
        }
    }

    // -- serialization ----------------------------------------------------

    pub fn write_json(&self, tree: &ContentTree) -> JsonValue {
        let mut flows = Map::new();
        flows.insert(self.current_flow.name.clone(), self.current_flow.write_json(tree));
        for (name, flow) in &self.named_flows {
            flows.insert(name.clone(), flow.write_json(tree));
        }

        let mut obj = Map::new();
        obj.insert("flows".to_string(), JsonValue::Object(flows));
        obj.insert("currentFlowName".to_string(), json!(self.current_flow.name));
        obj.insert("variablesState".to_string(), self.variables_state.write_json(tree));
        obj.insert(
            "evalStack".to_string(),
            writer::write_objects(tree, &self.evaluation_stack),
        );
        if !self.diverted_pointer.is_null() {
            if let Some(path) = self.diverted_pointer.path(tree) {
                obj.insert("currentDivertTarget".to_string(), json!(path.components_string()));
            }
        }
        obj.insert("visitCounts".to_string(), writer::write_int_dictionary(&self.visit_counts));
        obj.insert("turnIndices".to_string(), writer::write_int_dictionary(&self.turn_indices));
        obj.insert("turnIdx".to_string(), json!(self.current_turn_index));
        obj.insert("storySeed".to_string(), json!(self.story_seed));
        obj.insert("previousRandom".to_string(), json!(self.previous_random));
        obj.insert("inkSaveVersion".to_string(), json!(INK_SAVE_STATE_VERSION));
        obj.insert(
            "inkFormatVersion".to_string(),
            json!(crate::story::INK_VERSION_CURRENT),
        );
        JsonValue::Object(obj)
    }

    pub fn to_json(&self, tree: &ContentTree) -> String {
        self.write_json(tree).to_string()
    }

    /// Load a save state. Returns warnings about approximate locations.
    pub fn load_json(&mut self, text: &str, tree: &ContentTree) -> Result<Vec<String>, StoryError> {
        let token = reader::parse_json_text(text)?;
        let obj = token
            .as_object()
            .ok_or_else(|| StoryError::BadJson("save state is not an object".to_string()))?;

        let save_version = obj
            .get("inkSaveVersion")
            .and_then(|v| v.as_i64())
            .ok_or(StoryError::MissingSaveVersion)?;
        if save_version < MIN_COMPATIBLE_LOAD_VERSION {
            return Err(StoryError::IncompatibleSaveVersion {
                found: save_version,
                minimum: MIN_COMPATIBLE_LOAD_VERSION,
            });
        }

        let mut warnings = Vec::new();

        if let Some(flows_obj) = obj.get("flows").and_then(|v| v.as_object()) {
            self.named_flows.clear();
            let mut loaded: IndexMap<String, Flow> = IndexMap::new();
            for (name, flow_token) in flows_obj {
                loaded.insert(name.clone(), Flow::from_json(name, flow_token, tree, &mut warnings)?);
            }
            let current_name = if loaded.len() == 1 {
                loaded.keys().next().cloned().unwrap_or_default()
            } else {
                obj.get("currentFlowName")
                    .and_then(|v| v.as_str())
                    .unwrap_or(DEFAULT_FLOW_NAME)
                    .to_string()
            };
            let current = loaded
                .shift_remove(&current_name)
                .ok_or_else(|| StoryError::BadJson("currentFlowName not found in flows".to_string()))?;
            self.current_flow = current;
            self.named_flows = loaded;
        } else {
            // Legacy single-flow format with the callstack at top level.
            let mut flow = Flow::new(DEFAULT_FLOW_NAME, tree);
            let callstack = obj
                .get("callstackThreads")
                .ok_or_else(|| StoryError::BadJson("save state has no flows".to_string()))?;
            flow.call_stack.load_json(callstack, tree, &mut warnings)?;
            if let Some(output) = obj.get("outputStream") {
                flow.output_stream = reader::state_array_to_objects(output)?;
            }
            if let Some(choices) = obj.get("currentChoices").and_then(|v| v.as_array()) {
                for choice_token in choices {
                    flow.current_choices.push(reader::object_to_choice(choice_token)?);
                }
            }
            flow.load_flow_choice_threads(obj.get("choiceThreads"), tree, &mut warnings)?;
            self.current_flow = flow;
            self.named_flows.clear();
        }
        self.mark_output_dirty();

        if let Some(vars) = obj.get("variablesState") {
            self.variables_state.load_json(vars)?;
        }
        if let Some(eval_stack) = obj.get("evalStack") {
            self.evaluation_stack = reader::state_array_to_objects(eval_stack)?;
        }

        self.diverted_pointer = Pointer::NULL;
        if let Some(divert_path) = obj.get("currentDivertTarget").and_then(|v| v.as_str()) {
            let path = Path::from_components_string(divert_path);
            let (pointer, result) = tree.pointer_at_path(&path);
            if result.approximate {
                warnings.push(format!(
                    "Failed to find content at path '{}', so it was approximated.",
                    divert_path
                ));
            }
            self.diverted_pointer = pointer;
        }

        self.visit_counts = Arc::new(load_int_dictionary(obj.get("visitCounts"))?);
        self.turn_indices = Arc::new(load_int_dictionary(obj.get("turnIndices"))?);
        self.current_turn_index = obj.get("turnIdx").and_then(|v| v.as_i64()).unwrap_or(0) as i32;
        self.story_seed = obj.get("storySeed").and_then(|v| v.as_i64()).unwrap_or(0) as i32;
        self.previous_random = obj.get("previousRandom").and_then(|v| v.as_i64()).unwrap_or(0) as i32;

        Ok(warnings)
    }
}

fn load_int_dictionary(token: Option<&JsonValue>) -> Result<HashMap<String, i32>, StoryError> {
    let mut map = HashMap::new();
    if let Some(obj) = token.and_then(|v| v.as_object()) {
        for (key, value) in obj {
            let value = value
                .as_i64()
                .ok_or_else(|| StoryError::BadJson(format!("'{}' count is not an integer", key)))?;
            map.insert(key.clone(), value as i32);
        }
    }
    Ok(map)
}

/// Collapse runs of inline whitespace to a single space, dropping leading
/// whitespace at line starts; newlines pass through untouched.
pub fn clean_output_whitespace(text: &str) -> String {
    let mut sb = String::with_capacity(text.len());
    let mut current_whitespace_start: i64 = -1;
    let mut start_of_line: i64 = 0;

    for (i, c) in text.chars().enumerate() {
        let i = i as i64;
        let is_inline_whitespace = c == ' ' || c == '\t';
        if is_inline_whitespace && current_whitespace_start == -1 {
            current_whitespace_start = i;
        }
        if !is_inline_whitespace {
            if c != '\n' && current_whitespace_start > 0 && current_whitespace_start != start_of_line {
                sb.push(' ');
            }
            current_whitespace_start = -1;
        }
        if c == '\n' {
            start_of_line = i + 1;
        }
        if !is_inline_whitespace {
            sb.push(c);
        }
    }
    sb
}

/// Split a string into leading whitespace+newline, body, and trailing
/// newline+whitespace pieces so glue can trim at word boundaries. Returns
/// `None` when no split is needed.
fn split_head_tail_whitespace(text: &str) -> Option<Vec<String>> {
    let chars: Vec<char> = text.chars().collect();

    let mut head_first_newline: i64 = -1;
    let mut head_last_newline: i64 = -1;
    for (i, c) in chars.iter().enumerate() {
        match c {
            '\n' => {
                if head_first_newline == -1 {
                    head_first_newline = i as i64;
                }
                head_last_newline = i as i64;
            }
            ' ' | '\t' => continue,
            _ => break,
        }
    }

    let mut tail_last_newline: i64 = -1;
    let mut tail_first_newline: i64 = -1;
    for (i, c) in chars.iter().enumerate().rev() {
        match c {
            '\n' => {
                if tail_last_newline == -1 {
                    tail_last_newline = i as i64;
                }
                tail_first_newline = i as i64;
            }
            ' ' | '\t' => continue,
            _ => break,
        }
    }

    if head_first_newline == -1 && tail_last_newline == -1 {
        return None;
    }

    let mut pieces = Vec::new();
    let mut inner_start = 0usize;
    let mut inner_end = chars.len();

    if head_first_newline != -1 {
        if head_first_newline > 0 {
            pieces.push(chars[..head_first_newline as usize].iter().collect());
        }
        pieces.push("\n".to_string());
        inner_start = (head_last_newline + 1) as usize;
    }
    if tail_last_newline != -1 {
        inner_end = tail_first_newline as usize;
    }

    if inner_end > inner_start {
        pieces.push(chars[inner_start..inner_end].iter().collect());
    }

    if tail_last_newline != -1 && tail_first_newline > head_last_newline {
        pieces.push("\n".to_string());
        if (tail_last_newline as usize) < chars.len() - 1 {
            pieces.push(chars[(tail_last_newline + 1) as usize..].iter().collect());
        }
    }

    Some(pieces)
}

#[cfg(test)]
mod tests {
    use super::*;
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

    fn state() -> StoryState {
        StoryState::new(&tree())
    }

    #[test]
    fn test_clean_output_whitespace() {
        assert_eq!(clean_output_whitespace("a   b"), "a b");
        assert_eq!(clean_output_whitespace("  a"), "a");
        assert_eq!(clean_output_whitespace("a \n  b\tc"), "a\nb c");
        assert_eq!(clean_output_whitespace("line\n"), "line\n");
    }

    #[test]
    fn test_split_head_tail_whitespace() {
        assert!(split_head_tail_whitespace("plain text").is_none());
        assert_eq!(
            split_head_tail_whitespace("\nhello\n").unwrap(),
            vec!["\n", "hello", "\n"]
        );
        assert_eq!(
            split_head_tail_whitespace("  \nbody\n  ").unwrap(),
            vec!["  ", "\n", "body", "\n", "  "]
        );
    }

    #[test]
    fn test_glue_trims_trailing_newline() {
        let mut state = state();
        state.push_to_output_stream(RuntimeObject::Value(Value::string("Some content")));
        state.push_to_output_stream(RuntimeObject::Value(Value::string("\n")));
        state.push_to_output_stream(RuntimeObject::Glue);
        state.push_to_output_stream(RuntimeObject::Value(Value::string("with glue.")));
        assert_eq!(state.current_text(), "Some content with glue.");
    }

    #[test]
    fn test_duplicate_newlines_are_suppressed() {
        let mut state = state();
        state.push_to_output_stream(RuntimeObject::Value(Value::string("\n")));
        // Leading newline with no content yet is dropped.
        assert_eq!(state.output_stream().len(), 0);
        state.push_to_output_stream(RuntimeObject::Value(Value::string("line")));
        state.push_to_output_stream(RuntimeObject::Value(Value::string("\n")));
        state.push_to_output_stream(RuntimeObject::Value(Value::string("\n")));
        assert_eq!(state.current_text(), "line\n");
    }

    #[test]
    fn test_text_excludes_tag_regions() {
        let mut state = state();
        state.push_to_output_stream(RuntimeObject::Value(Value::string("line ")));
        state.push_to_output_stream(RuntimeObject::Command(CommandType::BeginTag));
        state.push_to_output_stream(RuntimeObject::Value(Value::string("tag text")));
        state.push_to_output_stream(RuntimeObject::Command(CommandType::EndTag));
        state.push_to_output_stream(RuntimeObject::Tag("plain".to_string()));
        assert_eq!(state.current_text(), "line ");
        assert_eq!(state.current_tags(), vec!["tag text".to_string(), "plain".to_string()]);
    }

    #[test]
    fn test_visit_counts_through_patch() {
        let mut state = state();
        state.increment_visit_count("knot");
        state.increment_visit_count("knot");
        assert_eq!(state.visit_count_for_path("knot"), 2);

        // Start patching: writes overlay, base stays.
        let mut live = state.copy_and_start_patching();
        live.increment_visit_count("knot");
        assert_eq!(live.visit_count_for_path("knot"), 3);
        assert_eq!(state.visit_count_for_path("knot"), 2);

        live.apply_any_patch();
        assert_eq!(live.visit_count_for_path("knot"), 3);
    }

    #[test]
    fn test_flow_switching() {
        let tree = tree();
        let mut state = StoryState::new(&tree);
        state.push_to_output_stream(RuntimeObject::Value(Value::string("default flow text")));
        state.switch_flow_internal("side", &tree);
        assert_eq!(state.current_flow_name(), "side");
        assert!(state.output_stream().is_empty());
        assert_eq!(state.alive_flow_names(), vec!["side".to_string()]);

        state.switch_to_default_flow_internal(&tree);
        assert_eq!(state.current_flow_name(), DEFAULT_FLOW_NAME);
        assert_eq!(state.current_text(), "default flow text");

        state.remove_flow_internal("side", &tree).unwrap();
        assert!(state.alive_flow_names().is_empty());
        assert!(state.remove_flow_internal(DEFAULT_FLOW_NAME, &tree).is_err());
    }

    #[test]
    fn test_save_round_trip() {
        let tree = tree();
        let mut state = StoryState::new(&tree);
        state.increment_visit_count("0");
        state.current_turn_index = 3;
        state.story_seed = 42;
        state.previous_random = 7;
        state.push_to_output_stream(RuntimeObject::Value(Value::string("hello")));
        state.push_evaluation_stack(RuntimeObject::Value(Value::Int(5)));

        let saved = state.to_json(&tree);
        let mut loaded = StoryState::new(&tree);
        let warnings = loaded.load_json(&saved, &tree).unwrap();
        assert!(warnings.is_empty());
        assert_eq!(loaded.visit_count_for_path("0"), 1);
        assert_eq!(loaded.current_turn_index, 3);
        assert_eq!(loaded.story_seed, 42);
        assert_eq!(loaded.previous_random, 7);
        assert_eq!(loaded.current_text(), "hello");
        assert_eq!(loaded.evaluation_stack.len(), 1);

        // Serializing twice yields identical bytes.
        assert_eq!(loaded.to_json(&tree), saved);
    }

    #[test]
    fn test_missing_save_version_rejected() {
        let tree = tree();
        let mut state = StoryState::new(&tree);
        assert!(matches!(
            state.load_json("{}", &tree),
            Err(StoryError::MissingSaveVersion)
        ));
        assert!(matches!(
            state.load_json(r#"{"inkSaveVersion":7}"#, &tree),
            Err(StoryError::IncompatibleSaveVersion { .. })
        ));
    }
}
