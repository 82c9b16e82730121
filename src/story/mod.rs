//! Story VM
//!
//! The facade the embedding application drives: load a compiled story,
//! call `cont()` for one line at a time, inspect and take choices, bind
//! external functions, observe variables, and save or restore state.
//!
//! Internally this is the step loop: resolve the object at the current
//! pointer, let flow control handle it, materialize choices, route values
//! to the output stream or the evaluation stack, and advance. A snapshot
//! is taken at each newline so glue that arrives later can still remove
//! it ("newline lookahead").

pub mod errors;
pub mod externals;
pub mod flow_control;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::json::{reader, writer};
use crate::runtime::choice::Choice;
use crate::runtime::choice_point::ChoicePoint;
use crate::runtime::container::{ContainerId, ContentTree};
use crate::runtime::control_command::CommandType;
use crate::runtime::divert::PushPopType;
use crate::runtime::list_definition::ListDefinitionsOrigin;
use crate::runtime::object::RuntimeObject;
use crate::runtime::path::{Component, Path};
use crate::runtime::pointer::Pointer;
use crate::runtime::value::Value;
use crate::state::story_state::StoryState;

use errors::{ErrorType, RuntimeFault, StoryError};
use externals::ExternalFunctionDef;

/// Version of the ink story file format this engine writes.
pub const INK_VERSION_CURRENT: i64 = 21;
/// Oldest story file format this engine can read.
pub const INK_VERSION_MINIMUM_COMPATIBLE: i64 = 18;

type ObserverFn = Box<dyn FnMut(&str, &Value)>;
type ErrorHandlerFn = Box<dyn FnMut(&str, ErrorType)>;

/// Handle returned by `observe_variable`, usable to unregister later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObserverId(u64);

/// Result of `evaluate_function`: the returned ink value (if any) plus the
/// text the function printed while running.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionResult {
    pub returned: Option<Value>,
    pub output: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputStateChange {
    NoChange,
    ExtendedBeyondNewline,
    NewlineRemoved,
}

pub struct Story {
    pub(crate) tree: Arc<ContentTree>,
    pub(crate) list_definitions: ListDefinitionsOrigin,
    pub(crate) state: StoryState,
    pub(crate) externals: HashMap<String, ExternalFunctionDef>,
    variable_observers: HashMap<String, Vec<(ObserverId, ObserverFn)>>,
    next_observer_id: u64,
    pub(crate) has_validated_externals: bool,
    pub(crate) state_snapshot_at_last_newline: Option<StoryState>,
    pub(crate) saw_lookahead_unsafe_function_after_newline: bool,
    recursive_continue_count: usize,
    async_continue_active: bool,
    async_saving: bool,
    /// When an external function is unbound, fall back to a same-named ink
    /// function instead of failing.
    pub allow_external_function_fallbacks: bool,
    on_error: Option<ErrorHandlerFn>,
}

impl Story {
    /// Load a compiled story document and run its global declarations.
    pub fn new(json_text: &str) -> Result<Story, StoryError> {
        let document = reader::load_story_document(json_text)?;
        let tree = Arc::new(document.tree);
        let state = StoryState::new(&tree);
        let mut story = Story {
            tree,
            list_definitions: document.list_definitions,
            state,
            externals: HashMap::new(),
            variable_observers: HashMap::new(),
            next_observer_id: 0,
            has_validated_externals: false,
            state_snapshot_at_last_newline: None,
            saw_lookahead_unsafe_function_after_newline: false,
            recursive_continue_count: 0,
            async_continue_active: false,
            async_saving: false,
            allow_external_function_fallbacks: false,
            on_error: None,
        };
        story.reset_globals()?;
        Ok(story)
    }

    // -- basic accessors --------------------------------------------------

    pub fn can_continue(&self) -> bool {
        self.state.can_continue()
    }

    pub fn state(&self) -> &StoryState {
        &self.state
    }

    pub fn content_tree(&self) -> Arc<ContentTree> {
        Arc::clone(&self.tree)
    }

    pub fn list_definitions(&self) -> &ListDefinitionsOrigin {
        &self.list_definitions
    }

    pub fn current_text(&mut self) -> Result<String, StoryError> {
        self.if_async_we_cant("call currentText since it's a work in progress")?;
        Ok(self.state.current_text())
    }

    pub fn current_tags(&mut self) -> Result<Vec<String>, StoryError> {
        self.if_async_we_cant("call currentTags since it's a work in progress")?;
        Ok(self.state.current_tags())
    }

    pub fn has_error(&self) -> bool {
        self.state.has_error()
    }

    pub fn has_warning(&self) -> bool {
        self.state.has_warning()
    }

    pub fn current_errors(&self) -> &[String] {
        self.state.current_errors()
    }

    pub fn current_warnings(&self) -> &[String] {
        self.state.current_warnings()
    }

    pub fn current_flow_name(&self) -> &str {
        self.state.current_flow_name()
    }

    pub fn current_flow_is_default_flow(&self) -> bool {
        self.state.current_flow_is_default_flow()
    }

    pub fn alive_flow_names(&self) -> Vec<String> {
        self.state.alive_flow_names()
    }

    /// Route errors and warnings to a handler instead of failing `cont()`.
    pub fn set_error_handler(&mut self, handler: impl FnMut(&str, ErrorType) + 'static) {
        self.on_error = Some(Box::new(handler));
    }

    /// Re-emit the loaded story as JSON.
    pub fn to_json(&self) -> String {
        writer::write_story_document(&self.tree, &self.list_definitions).to_string()
    }

    // -- continue ---------------------------------------------------------

    /// Produce the next line of output.
    pub fn cont(&mut self) -> Result<String, StoryError> {
        self.continue_async(0)?;
        self.current_text()
    }

    /// Continue with a wall-clock budget in milliseconds; `0` means no
    /// budget (a plain blocking continue). When the budget runs out
    /// mid-line, `async_continue_complete` is false and a further call
    /// resumes the same line.
    pub fn continue_async(&mut self, millisecs_limit: u64) -> Result<(), StoryError> {
        if !self.has_validated_externals {
            self.validate_external_bindings()?;
        }
        let limit = if millisecs_limit > 0 { Some(millisecs_limit) } else { None };
        self.continue_internal(limit)
    }

    pub fn async_continue_complete(&self) -> bool {
        !self.async_continue_active
    }

    pub fn continue_maximally(&mut self) -> Result<String, StoryError> {
        self.if_async_we_cant("ContinueMaximally")?;
        let mut sb = String::new();
        while self.can_continue() {
            sb.push_str(&self.cont()?);
        }
        Ok(sb)
    }

    pub(crate) fn continue_internal(&mut self, millisecs_limit: Option<u64>) -> Result<(), StoryError> {
        let is_async_time_limited = millisecs_limit.is_some();
        self.recursive_continue_count += 1;

        if !self.async_continue_active {
            self.async_continue_active = is_async_time_limited;
            if !self.can_continue() {
                self.recursive_continue_count -= 1;
                return Err(StoryError::InvalidOperation(
                    "Can't continue - should check canContinue before calling Continue".to_string(),
                ));
            }
            self.state.did_safe_exit = false;
            self.state.reset_output(None);
            if self.recursive_continue_count == 1 {
                self.state.variables_state.start_variable_observation();
            }
        } else if !is_async_time_limited {
            // A blocking continue finishes off a line an async continue
            // left in progress.
            self.async_continue_active = false;
        }

        let start_time = Instant::now();
        let mut output_stream_ends_in_newline = false;
        self.saw_lookahead_unsafe_function_after_newline = false;
        loop {
            match self.continue_single_step() {
                Ok(ends) => output_stream_ends_in_newline = ends,
                Err(fault) => {
                    self.add_error_internal(fault.message, false, fault.use_end_line_number);
                    break;
                }
            }
            if output_stream_ends_in_newline {
                break;
            }
            if self.async_continue_active {
                if let Some(limit) = millisecs_limit {
                    if start_time.elapsed().as_millis() > limit as u128 {
                        break;
                    }
                }
            }
            if !self.can_continue() {
                break;
            }
        }

        let mut changed_variables: Vec<String> = Vec::new();

        if output_stream_ends_in_newline || !self.can_continue() {
            if self.state_snapshot_at_last_newline.is_some() {
                self.restore_state_snapshot();
            }

            if !self.can_continue() {
                if self.state.current_flow.call_stack.can_pop_thread() {
                    self.add_error_internal(
                        "Thread available to pop, threads should always be flat by the end of evaluation?"
                            .to_string(),
                        false,
                        false,
                    );
                }

                if self.state.generated_choices().is_empty() && !self.state.did_safe_exit {
                    let message = if self.state.current_flow.call_stack.can_pop_type(Some(PushPopType::Tunnel)) {
                        "unexpectedly reached end of content. Do you need a '->->' to return from a tunnel?"
                    } else if self.state.current_flow.call_stack.can_pop_type(Some(PushPopType::Function)) {
                        "unexpectedly reached end of content. Do you need a '~ return'?"
                    } else if !self.state.current_flow.call_stack.can_pop() {
                        "ran out of content. Do you need a '-> DONE' or '-> END'?"
                    } else {
                        "unexpectedly reached end of content for unknown reason. Please debug compiler!"
                    };
                    self.add_error_internal(message.to_string(), false, false);
                }
            }

            self.state.did_safe_exit = false;
            self.saw_lookahead_unsafe_function_after_newline = false;

            if self.recursive_continue_count == 1 {
                changed_variables = self
                    .state
                    .variables_state
                    .complete_variable_observation(self.state.patch.as_ref());
            }
            self.async_continue_active = false;
        }

        self.recursive_continue_count -= 1;

        if self.state.has_error() || self.state.has_warning() {
            if self.on_error.is_some() {
                let errors = self.state.current_errors().to_vec();
                let warnings = self.state.current_warnings().to_vec();
                if let Some(handler) = self.on_error.as_mut() {
                    for message in &errors {
                        handler(message, ErrorType::Error);
                    }
                    for message in &warnings {
                        handler(message, ErrorType::Warning);
                    }
                }
                self.state.reset_errors();
            } else {
                let error_count = self.state.current_errors().len();
                let warning_count = self.state.current_warnings().len();
                let first_issue = self
                    .state
                    .current_errors()
                    .first()
                    .or_else(|| self.state.current_warnings().first())
                    .cloned()
                    .unwrap_or_default();
                let mut sb = String::from("Ink had ");
                if error_count > 0 {
                    sb.push_str(&format!(
                        "{} error{}",
                        error_count,
                        if error_count == 1 { "" } else { "s" }
                    ));
                    if warning_count > 0 {
                        sb.push_str(" and ");
                    }
                }
                if warning_count > 0 {
                    sb.push_str(&format!(
                        "{} warning{}",
                        warning_count,
                        if warning_count == 1 { "" } else { "s" }
                    ));
                }
                sb.push_str(
                    ". It is strongly suggested that you assign an error handler to story.onError. The first issue was: ",
                );
                sb.push_str(&first_issue);
                return Err(StoryError::Unhandled(sb));
            }
        }

        if !changed_variables.is_empty() {
            self.notify_variable_observers(changed_variables);
        }
        Ok(())
    }

    fn continue_single_step(&mut self) -> Result<bool, RuntimeFault> {
        self.step()?;

        if !self.can_continue() && !self.state.current_flow.call_stack.element_is_evaluate_from_game() {
            self.try_follow_default_invisible_choice()?;
        }

        if !self.state.in_string_evaluation() {
            if self.state_snapshot_at_last_newline.is_some() {
                let change = {
                    let snapshot = self
                        .state_snapshot_at_last_newline
                        .as_mut()
                        .ok_or_else(|| RuntimeFault::new("lost newline snapshot"))?;
                    let prev_text = snapshot.current_text();
                    let prev_tag_count = snapshot.current_tags().len();
                    let curr_text = self.state.current_text();
                    let curr_tag_count = self.state.current_tags().len();
                    calculate_newline_output_state_change(
                        &prev_text,
                        &curr_text,
                        prev_tag_count,
                        curr_tag_count,
                    )
                };

                if change == OutputStateChange::ExtendedBeyondNewline
                    || self.saw_lookahead_unsafe_function_after_newline
                {
                    // Lookahead went past the line (or hit an unsafe
                    // external): rewind to the newline and emit the line.
                    self.restore_state_snapshot();
                    return Ok(true);
                }
                if change == OutputStateChange::NewlineRemoved {
                    self.discard_snapshot();
                }
            }

            if self.state.output_stream_ends_in_newline() {
                if self.can_continue() {
                    if self.state_snapshot_at_last_newline.is_none() {
                        self.state_snapshot();
                    }
                } else {
                    self.discard_snapshot();
                }
            }
        }

        Ok(false)
    }

    // -- the step ---------------------------------------------------------

    fn step(&mut self) -> Result<(), RuntimeFault> {
        let mut should_add_to_stream = true;

        let mut pointer = self.state.current_pointer();
        if pointer.is_null() {
            return Ok(());
        }

        // Descend into containers, counting visits on the way down.
        while let Some(RuntimeObject::Container(container)) = pointer.resolve(&self.tree) {
            self.visit_container(container, true);
            if self.tree.content_len(container) == 0 {
                break;
            }
            pointer = Pointer::start_of(container);
        }
        self.state.set_current_pointer(pointer);

        let mut current_content_obj = pointer.resolve(&self.tree);
        let is_logic_or_flow_control =
            self.perform_logic_and_flow_control(current_content_obj.clone())?;

        // Flow control may have ended the story entirely.
        if self.state.current_pointer().is_null() {
            return Ok(());
        }
        if is_logic_or_flow_control {
            should_add_to_stream = false;
        }

        if let Some(RuntimeObject::ChoicePoint(choice_point)) = &current_content_obj {
            let choice_point = choice_point.clone();
            if let Some(choice) = self.process_choice(&choice_point)? {
                self.state.generated_choices_mut().push(choice);
            }
            current_content_obj = None;
            should_add_to_stream = false;
        }

        if matches!(current_content_obj, Some(RuntimeObject::Container(_))) {
            should_add_to_stream = false;
        }

        if should_add_to_stream {
            if let Some(obj) = &current_content_obj {
                let mut obj = obj.clone();
                // A variable pointer with an unresolved context captures
                // its context here, where the frame is known.
                let unresolved_pointer_name = match &obj {
                    RuntimeObject::Value(Value::VariablePointer { name, context_index: -1 }) => {
                        Some(name.clone())
                    }
                    _ => None,
                };
                if let Some(name) = unresolved_pointer_name {
                    let context_index =
                        self.state.current_flow.call_stack.context_for_variable_named(&name);
                    obj = RuntimeObject::Value(Value::VariablePointer { name, context_index });
                }

                if self.state.in_expression_evaluation() {
                    self.state.push_evaluation_stack(obj);
                } else {
                    self.state.push_to_output_stream(obj);
                }
            }
        }

        self.next_content()?;

        // Starting a thread happens after the pointer has moved past the
        // instruction, so the new thread resumes at the next object.
        if matches!(
            current_content_obj,
            Some(RuntimeObject::Command(CommandType::StartThread))
        ) {
            self.state.current_flow.call_stack.push_thread();
        }

        Ok(())
    }

    pub(crate) fn visit_container(&mut self, container: ContainerId, at_start: bool) {
        let (count_visits, count_turns, path) = {
            let node = self.tree.node(container);
            if node.counting_at_start_only && !at_start {
                return;
            }
            (
                node.visits_should_be_counted,
                node.turn_index_should_be_counted,
                node.path_string.clone(),
            )
        };
        if count_visits {
            self.state.increment_visit_count(&path);
        }
        if count_turns {
            self.state.record_turn_index_visit(&path);
        }
    }

    /// After a divert, count every ancestor container newly entered.
    pub(crate) fn visit_changed_containers_due_to_divert(&mut self) {
        let previous_pointer = self.state.previous_pointer();
        let pointer = self.state.current_pointer();
        if pointer.is_null() || pointer.index == -1 {
            return;
        }

        let mut previous_containers: Vec<ContainerId> = Vec::new();
        if !previous_pointer.is_null() {
            let mut ancestor = match previous_pointer.resolve(&self.tree) {
                Some(RuntimeObject::Container(id)) => Some(id),
                _ => previous_pointer.container,
            };
            while let Some(id) = ancestor {
                previous_containers.push(id);
                ancestor = self.tree.node(id).parent;
            }
        }

        if pointer.resolve(&self.tree).is_none() {
            return;
        }

        let mut current_ancestor = pointer.container;
        let mut child_is_first_content = pointer.index == 0;
        let mut all_children_entered_at_start = true;
        while let Some(ancestor) = current_ancestor {
            let (counting_at_start_only, has_content, index_in_parent, parent) = {
                let node = self.tree.node(ancestor);
                (
                    node.counting_at_start_only,
                    !node.content.is_empty(),
                    node.index_in_parent,
                    node.parent,
                )
            };
            if previous_containers.contains(&ancestor) && !counting_at_start_only {
                break;
            }

            let entering_at_start =
                has_content && child_is_first_content && all_children_entered_at_start;
            if !entering_at_start {
                all_children_entered_at_start = false;
            }
            self.visit_container(ancestor, entering_at_start);

            child_is_first_content = index_in_parent == Some(0);
            current_ancestor = parent;
        }
    }

    fn next_content(&mut self) -> Result<(), RuntimeFault> {
        self.state.set_previous_pointer(self.state.current_pointer());

        if !self.state.diverted_pointer.is_null() {
            let diverted = self.state.diverted_pointer;
            self.state.set_current_pointer(diverted);
            self.state.diverted_pointer = Pointer::NULL;
            self.visit_changed_containers_due_to_divert();
            if !self.state.current_pointer().is_null() {
                return Ok(());
            }
            // Diverted to nothing: fall through to normal advancement.
        }

        if !self.increment_content_pointer() {
            let mut did_pop = false;
            if self.state.current_flow.call_stack.can_pop_type(Some(PushPopType::Function)) {
                self.state.pop_call_stack(Some(PushPopType::Function))?;
                // An expression expected a return value; implicit void.
                if self.state.in_expression_evaluation() {
                    self.state.push_evaluation_stack(RuntimeObject::Void);
                }
                did_pop = true;
            } else if self.state.current_flow.call_stack.can_pop_thread() {
                self.state.current_flow.call_stack.pop_thread()?;
                did_pop = true;
            } else {
                self.state.try_exit_function_evaluation_from_game();
            }
            if did_pop && !self.state.current_pointer().is_null() {
                self.next_content()?;
            }
        }
        Ok(())
    }

    fn increment_content_pointer(&mut self) -> bool {
        let mut successful_increment = true;
        let mut pointer = self.state.current_pointer();
        let Some(mut container) = pointer.container else {
            return false;
        };
        pointer.index += 1;

        // Climb out of exhausted containers; named-only containers have no
        // position to climb to.
        while pointer.index as usize >= self.tree.content_len(container) {
            successful_increment = false;
            let node = self.tree.node(container);
            let Some(next_ancestor) = node.parent else { break };
            let Some(index_in_ancestor) = node.index_in_parent else { break };
            pointer = Pointer::new(Some(next_ancestor), index_in_ancestor as i32 + 1);
            container = next_ancestor;
            successful_increment = true;
        }

        if !successful_increment {
            pointer = Pointer::NULL;
        }
        self.state.set_current_pointer(pointer);
        successful_increment
    }

    // -- choices ----------------------------------------------------------

    /// The currently offered (visible) choices.
    pub fn current_choices(&mut self) -> Vec<Choice> {
        if self.state.can_continue() {
            return Vec::new();
        }
        let mut visible = Vec::new();
        let mut index = 0;
        for choice in self.state.generated_choices_mut().iter_mut() {
            if !choice.is_invisible_default {
                choice.index = index;
                index += 1;
                visible.push(choice.clone());
            }
        }
        visible
    }

    fn process_choice(&mut self, choice_point: &ChoicePoint) -> Result<Option<Choice>, RuntimeFault> {
        let mut show_choice = true;

        if choice_point.has_condition {
            let condition_value = self.state.pop_evaluation_stack();
            if !self.is_truthy_object(condition_value.as_ref())? {
                show_choice = false;
            }
        }

        let mut start_text = String::new();
        let mut choice_only_text = String::new();
        let mut tags: Vec<String> = Vec::new();

        if choice_point.has_choice_only_content {
            choice_only_text = self.pop_choice_string_and_tags(&mut tags)?;
        }
        if choice_point.has_start_content {
            start_text = self.pop_choice_string_and_tags(&mut tags)?;
        }

        let target = self.choice_target(choice_point);
        if choice_point.once_only {
            let visit_count = match target.0 {
                Some(container) => self.visit_count_for_container(container)?,
                None => 0,
            };
            if visit_count > 0 {
                show_choice = false;
            }
        }

        if !show_choice {
            return Ok(None);
        }

        let source_path = self
            .state
            .current_pointer()
            .path(&self.tree)
            .map(|p| p.components_string())
            .unwrap_or_default();
        let thread = self.state.current_flow.call_stack.fork_thread();
        tags.reverse();

        let text = format!("{}{}", start_text, choice_only_text)
            .trim_matches(|c| c == ' ' || c == '\t')
            .to_string();

        Ok(Some(Choice {
            text,
            index: 0,
            source_path,
            target_path: target.1,
            original_thread_index: thread.thread_index,
            thread_at_generation: Some(thread),
            is_invisible_default: choice_point.is_invisible_default,
            tags,
        }))
    }

    /// Resolve a choice point's target container and its absolute path.
    fn choice_target(&self, choice_point: &ChoicePoint) -> (Option<ContainerId>, Path) {
        let path = &choice_point.path_on_choice;
        let container = match self.state.current_pointer().container {
            Some(context) => self.tree.resolve_path_from(context, path).container(),
            None => None,
        };
        let absolute = match container {
            Some(id) => self.tree.node(id).path.clone(),
            None => path.clone(),
        };
        (container, absolute)
    }

    fn pop_choice_string_and_tags(&mut self, tags: &mut Vec<String>) -> Result<String, RuntimeFault> {
        let popped = self.state.pop_evaluation_stack();
        let Some(RuntimeObject::Value(Value::String(text))) = popped else {
            return Err(RuntimeFault::new("Expected string value for choice content"));
        };
        while let Some(RuntimeObject::Tag(_)) = self.state.peek_evaluation_stack() {
            if let Some(RuntimeObject::Tag(tag_text)) = self.state.pop_evaluation_stack() {
                tags.push(tag_text);
            }
        }
        Ok(text.text)
    }

    fn try_follow_default_invisible_choice(&mut self) -> Result<bool, RuntimeFault> {
        let all_choices = self.state.generated_choices();
        let invisible: Vec<Choice> = all_choices
            .iter()
            .filter(|c| c.is_invisible_default)
            .cloned()
            .collect();
        if invisible.is_empty() || all_choices.len() > invisible.len() {
            return Ok(false);
        }

        let choice = invisible.into_iter().next().ok_or_else(|| {
            RuntimeFault::new("invisible default choice disappeared")
        })?;
        let Some(thread) = choice.thread_at_generation.clone() else {
            return Err(RuntimeFault::new("choice has no generation thread"));
        };
        self.state.current_flow.call_stack.set_current_thread(thread);
        // Don't invalidate a live lookahead snapshot: keep working on a
        // fresh fork.
        if self.state_snapshot_at_last_newline.is_some() {
            let forked = self.state.current_flow.call_stack.fork_thread();
            self.state.current_flow.call_stack.set_current_thread(forked);
        }
        self.choose_path(&choice.target_path, false)?;
        Ok(true)
    }

    pub(crate) fn choose_path(&mut self, path: &Path, incrementing_turn_index: bool) -> Result<(), RuntimeFault> {
        let pointer = self.pointer_at_path_reporting(path)?;
        self.state.set_chosen_path(pointer, incrementing_turn_index);
        self.visit_changed_containers_due_to_divert();
        Ok(())
    }

    /// Resume execution from one of the currently offered choices.
    pub fn choose_choice_index(&mut self, choice_index: usize) -> Result<(), StoryError> {
        let choices = self.current_choices();
        let choice = choices
            .get(choice_index)
            .ok_or_else(|| StoryError::InvalidOperation("choice out of range".to_string()))?
            .clone();

        let Some(thread) = choice.thread_at_generation.clone() else {
            return Err(StoryError::InvalidOperation(
                "choice has no generation thread".to_string(),
            ));
        };
        self.state.current_flow.call_stack.set_current_thread(thread);
        self.choose_path(&choice.target_path, true)
            .map_err(|fault| StoryError::InvalidOperation(fault.message))
    }

    /// Jump directly to a knot or stitch by dotted path.
    pub fn choose_path_string(
        &mut self,
        path: &str,
        reset_callstack: bool,
        args: &[Value],
    ) -> Result<(), StoryError> {
        self.if_async_we_cant("call ChoosePathString right now")?;

        if reset_callstack {
            self.reset_callstack()?;
        } else if self.state.current_flow.call_stack.current_element().push_pop_type
            == PushPopType::Function
        {
            let mut func_detail = String::new();
            if let Some(container) = self
                .state
                .current_flow
                .call_stack
                .current_element()
                .current_pointer
                .container
            {
                func_detail = format!("({}) ", self.tree.node(container).path_string);
            }
            return Err(StoryError::InvalidOperation(format!(
                "Story was running a function {}when you called ChoosePathString({}) - this is almost certainly not what you want! Full stack trace: \n{}",
                func_detail,
                path,
                self.state.current_flow.call_stack.call_stack_trace(&self.tree)
            )));
        }

        self.state.pass_arguments_to_evaluation_stack(args)?;
        self.choose_path(&Path::from_components_string(path), true)
            .map_err(|fault| StoryError::InvalidOperation(fault.message))
    }

    // -- functions --------------------------------------------------------

    pub fn has_function(&self, function_name: &str) -> bool {
        self.knot_container_with_name(function_name).is_some()
    }

    /// Run an ink function outside the main flow, capturing its printed
    /// output separately from its return value.
    pub fn evaluate_function(
        &mut self,
        function_name: &str,
        args: &[Value],
    ) -> Result<FunctionResult, StoryError> {
        self.if_async_we_cant("evaluate a function")?;
        if function_name.trim().is_empty() {
            return Err(StoryError::InvalidOperation(
                "Function is empty or white space.".to_string(),
            ));
        }
        let func_container = self.knot_container_with_name(function_name).ok_or_else(|| {
            StoryError::InvalidOperation(format!("Function doesn't exist: '{}'", function_name))
        })?;

        let output_stream_before = self.state.output_stream().to_vec();
        self.state.reset_output(None);
        self.state.start_function_evaluation_from_game(func_container, args)?;

        let mut text_output = String::new();
        while self.can_continue() {
            text_output.push_str(&self.cont()?);
        }

        self.state.reset_output(Some(output_stream_before));
        let returned = self.state.complete_function_evaluation_from_game(&self.tree)?;
        Ok(FunctionResult { returned, output: text_output })
    }

    pub(crate) fn knot_container_with_name(&self, name: &str) -> Option<ContainerId> {
        self.tree.node(self.tree.root()).named_children.get(name).copied()
    }

    // -- state management -------------------------------------------------

    pub fn reset_state(&mut self) -> Result<(), StoryError> {
        self.if_async_we_cant("ResetState")?;
        self.state = StoryState::new(&self.tree);
        self.reset_globals()
    }

    pub fn reset_errors(&mut self) {
        self.state.reset_errors();
    }

    pub fn reset_callstack(&mut self) -> Result<(), StoryError> {
        self.if_async_we_cant("ResetCallstack")?;
        self.state.force_end();
        Ok(())
    }

    fn reset_globals(&mut self) -> Result<(), StoryError> {
        if self.knot_container_with_name("global decl").is_some() {
            let original_pointer = self.state.current_pointer();
            self.choose_path(&Path::from_components_string("global decl"), false)
                .map_err(|fault| StoryError::InvalidOperation(fault.message))?;
            self.continue_internal(None)?;
            self.state.set_current_pointer(original_pointer);
        }
        self.state.variables_state.snapshot_default_globals();
        Ok(())
    }

    pub fn switch_flow(&mut self, flow_name: &str) -> Result<(), StoryError> {
        self.if_async_we_cant("switch flow")?;
        if self.async_saving {
            return Err(StoryError::InvalidOperation(format!(
                "Story is already in background saving mode, can't switch flow to {}",
                flow_name
            )));
        }
        let tree = Arc::clone(&self.tree);
        self.state.switch_flow_internal(flow_name, &tree);
        Ok(())
    }

    pub fn remove_flow(&mut self, flow_name: &str) -> Result<(), StoryError> {
        let tree = Arc::clone(&self.tree);
        self.state.remove_flow_internal(flow_name, &tree)
    }

    pub fn switch_to_default_flow(&mut self) {
        let tree = Arc::clone(&self.tree);
        self.state.switch_to_default_flow_internal(&tree);
    }

    pub fn state_to_json(&self) -> String {
        self.state.to_json(&self.tree)
    }

    /// Serialize a state copy (e.g. one returned by
    /// `copy_state_for_background_thread_save`).
    pub fn json_for_state(&self, state: &StoryState) -> String {
        state.to_json(&self.tree)
    }

    pub fn load_state_json(&mut self, json_text: &str) -> Result<(), StoryError> {
        let tree = Arc::clone(&self.tree);
        let warnings = self.state.load_json(json_text, &tree)?;
        for message in warnings {
            self.warning(message);
        }
        Ok(())
    }

    // -- snapshots & background save --------------------------------------

    pub(crate) fn state_snapshot(&mut self) {
        let live = self.state.copy_and_start_patching();
        let snapshot = std::mem::replace(&mut self.state, live);
        self.state_snapshot_at_last_newline = Some(snapshot);
    }

    pub(crate) fn restore_state_snapshot(&mut self) {
        if let Some(snapshot) = self.state_snapshot_at_last_newline.take() {
            self.state = snapshot;
        }
        if !self.async_saving {
            self.state.apply_any_patch();
        }
    }

    pub(crate) fn discard_snapshot(&mut self) {
        if !self.async_saving {
            self.state.apply_any_patch();
        }
        self.state_snapshot_at_last_newline = None;
    }

    /// Hand out the current state for serialization (possibly on another
    /// thread) and keep executing against a patched copy. Call
    /// `background_save_complete` when serialization is done.
    pub fn copy_state_for_background_thread_save(&mut self) -> Result<StoryState, StoryError> {
        self.if_async_we_cant("start saving on a background thread")?;
        if self.async_saving {
            return Err(StoryError::InvalidOperation(
                "Story is already in background saving mode, can't call CopyStateForBackgroundThreadSave again!"
                    .to_string(),
            ));
        }
        let live = self.state.copy_and_start_patching();
        let state_to_save = std::mem::replace(&mut self.state, live);
        self.async_saving = true;
        Ok(state_to_save)
    }

    pub fn background_save_complete(&mut self) {
        if self.state_snapshot_at_last_newline.is_none() {
            self.state.apply_any_patch();
        }
        self.async_saving = false;
    }

    // -- variables & observers --------------------------------------------

    pub fn variable(&self, name: &str) -> Option<Value> {
        let obj = self.state.variables_state.get(
            name,
            self.state.patch.as_ref(),
            &self.state.current_flow.call_stack,
            &self.list_definitions,
        )?;
        obj.into_value()
    }

    pub fn set_variable(&mut self, name: &str, value: Value) -> Result<(), StoryError> {
        {
            let state = &mut self.state;
            state
                .variables_state
                .set(name, value, state.patch.as_mut())?;
        }
        let pending = self.state.variables_state.take_pending_notifications();
        self.notify_variable_observers(pending);
        Ok(())
    }

    /// Register an observer for a declared global variable. It fires once
    /// per `cont()` in which the variable changed, with the final value.
    pub fn observe_variable(
        &mut self,
        variable_name: &str,
        observer: impl FnMut(&str, &Value) + 'static,
    ) -> Result<ObserverId, StoryError> {
        self.if_async_we_cant("observe a new variable")?;
        if !self
            .state
            .variables_state
            .global_variable_exists_with_name(variable_name)
        {
            return Err(StoryError::InvalidOperation(format!(
                "Cannot observe variable '{}' because it wasn't declared in the ink story.",
                variable_name
            )));
        }
        self.next_observer_id += 1;
        let id = ObserverId(self.next_observer_id);
        self.variable_observers
            .entry(variable_name.to_string())
            .or_default()
            .push((id, Box::new(observer)));
        Ok(id)
    }

    pub fn remove_variable_observer(&mut self, id: ObserverId) -> Result<(), StoryError> {
        self.if_async_we_cant("remove a variable observer")?;
        for observers in self.variable_observers.values_mut() {
            observers.retain(|(observer_id, _)| *observer_id != id);
        }
        self.variable_observers.retain(|_, observers| !observers.is_empty());
        Ok(())
    }

    pub fn remove_observers_for_variable(&mut self, variable_name: &str) -> Result<(), StoryError> {
        self.if_async_we_cant("remove a variable observer")?;
        self.variable_observers.remove(variable_name);
        Ok(())
    }

    fn notify_variable_observers(&mut self, names: Vec<String>) {
        for name in names {
            if let Some(observers) = self.variable_observers.get_mut(&name) {
                let value = self.state.variables_state.get(
                    &name,
                    self.state.patch.as_ref(),
                    &self.state.current_flow.call_stack,
                    &self.list_definitions,
                );
                if let Some(RuntimeObject::Value(value)) = value {
                    for (_, observer) in observers.iter_mut() {
                        observer(&name, &value);
                    }
                }
            }
        }
    }

    // -- tags -------------------------------------------------------------

    pub fn global_tags(&self) -> Result<Vec<String>, StoryError> {
        self.tags_for_content_at_path("")
    }

    /// Tags at the very start of the knot (or the whole story for "").
    pub fn tags_for_content_at_path(&self, path: &str) -> Result<Vec<String>, StoryError> {
        let parsed = Path::from_components_string(path);
        let mut container = if parsed.is_empty() {
            self.tree.root()
        } else {
            self.tree
                .content_at_path(self.tree.root(), &parsed, 0, None)
                .container()
                .ok_or_else(|| {
                    StoryError::InvalidOperation(format!("Content at path not found: {}", path))
                })?
        };

        // Tags live in the first leaf run of the flow container.
        loop {
            match self.tree.node(container).content.first() {
                Some(RuntimeObject::Container(child)) => container = *child,
                _ => break,
            }
        }

        let mut tags = Vec::new();
        let mut in_tag = false;
        for obj in &self.tree.node(container).content {
            match obj {
                RuntimeObject::Command(CommandType::BeginTag) => in_tag = true,
                RuntimeObject::Command(CommandType::EndTag) => in_tag = false,
                RuntimeObject::Command(_) => {}
                RuntimeObject::Value(Value::String(text)) if in_tag => {
                    tags.push(text.text.clone());
                }
                _ if in_tag => {
                    return Err(StoryError::InvalidOperation(
                        "Tag contained non-text content. Only plain text is allowed when using globalTags or TagsAtContentPath. If you want to evaluate dynamic content, you need to use story.Continue()."
                            .to_string(),
                    ));
                }
                _ => break,
            }
        }
        Ok(tags)
    }

    // -- diagnostics ------------------------------------------------------

    pub fn build_string_of_hierarchy(&self) -> String {
        self.tree
            .build_string_of_hierarchy(self.tree.root(), self.state.current_pointer().container)
    }

    pub(crate) fn if_async_we_cant(&self, activity: &str) -> Result<(), StoryError> {
        if self.async_continue_active {
            return Err(StoryError::InvalidOperation(format!(
                "Can't {}. Story is in the middle of a ContinueAsync(). Make more ContinueAsync() calls or a single Continue() call beforehand.",
                activity
            )));
        }
        Ok(())
    }

    pub(crate) fn pointer_description(&self, pointer: Pointer) -> String {
        match pointer.container {
            Some(container) => format!(
                "Ink Pointer -> {} -- index {}",
                self.tree.node(container).path_string,
                pointer.index
            ),
            None => "Ink Pointer (null)".to_string(),
        }
    }

    pub(crate) fn warning(&mut self, message: String) {
        self.add_error_internal(message, true, false);
    }

    pub(crate) fn add_error_internal(&mut self, message: String, is_warning: bool, _use_end_line_number: bool) {
        let error_type_str = if is_warning { "WARNING" } else { "ERROR" };
        let pointer = self.state.current_pointer();
        let formatted = if !pointer.is_null() {
            format!(
                "RUNTIME {}: ({}): {}",
                error_type_str,
                self.pointer_description(pointer),
                message
            )
        } else {
            format!("RUNTIME {}: {}", error_type_str, message)
        };
        self.state.add_error(formatted, is_warning);
        if !is_warning {
            self.state.force_end();
        }
    }

    /// Resolve an absolute path to a pointer, warning on approximation and
    /// faulting when nothing at all was found.
    pub(crate) fn pointer_at_path_reporting(&mut self, path: &Path) -> Result<Pointer, RuntimeFault> {
        let (pointer, result) = self.tree.pointer_at_path(path);
        let path_length_used = match path.last_component() {
            Some(Component::Index(_)) => path.len().saturating_sub(1),
            _ => path.len(),
        };

        let found_root_only = matches!(result.obj, Some(RuntimeObject::Container(id)) if id == self.tree.root())
            && path_length_used > 0;
        if result.obj.is_none() || found_root_only {
            return Err(RuntimeFault::new(format!(
                "Failed to find content at path '{}', and no approximation of it was possible.",
                path
            )));
        }
        if result.approximate {
            let approximated_to = match result.obj {
                Some(RuntimeObject::Container(id)) => self.tree.node(id).path_string.clone(),
                _ => path.components_string(),
            };
            self.warning(format!(
                "Failed to find content at path '{}', so it was approximated to: '{}'.",
                path, approximated_to
            ));
        }
        Ok(pointer)
    }
}

fn calculate_newline_output_state_change(
    prev_text: &str,
    curr_text: &str,
    prev_tag_count: usize,
    curr_tag_count: usize,
) -> OutputStateChange {
    let prev: Vec<char> = prev_text.chars().collect();
    let curr: Vec<char> = curr_text.chars().collect();

    let newline_still_exists =
        curr.len() >= prev.len() && !prev.is_empty() && curr[prev.len() - 1] == '\n';
    if prev_tag_count == curr_tag_count && prev.len() == curr.len() && newline_still_exists {
        return OutputStateChange::NoChange;
    }
    if !newline_still_exists {
        return OutputStateChange::NewlineRemoved;
    }
    if curr_tag_count > prev_tag_count {
        return OutputStateChange::ExtendedBeyondNewline;
    }
    for c in &curr[prev.len()..] {
        if *c != ' ' && *c != '\t' {
            return OutputStateChange::ExtendedBeyondNewline;
        }
    }
    OutputStateChange::NoChange
}

#[cfg(test)]
mod tests;
