//! Logic & Flow Control
//!
//! The interpreter for everything that isn't plain content: diverts (with
//! their conditional, variable-target and external forms), the control
//! command set, variable reads and writes, and native operator calls.

use crate::runtime::container::ContainerId;
use crate::runtime::control_command::CommandType;
use crate::runtime::divert::{Divert, PushPopType};
use crate::runtime::ink_list::InkList;
use crate::runtime::object::RuntimeObject;
use crate::runtime::path::{Component, Path};
use crate::runtime::pointer::Pointer;
use crate::runtime::prng::Prng;
use crate::runtime::value::Value;
use crate::runtime::variable::{VariableAssignment, VariableReference};
use crate::story::errors::RuntimeFault;
use crate::story::Story;

impl Story {
    /// Handle diverts, control commands, variable access and native calls.
    /// Returns true when the object was consumed by flow control.
    pub(crate) fn perform_logic_and_flow_control(
        &mut self,
        content_obj: Option<RuntimeObject>,
    ) -> Result<bool, RuntimeFault> {
        let Some(content_obj) = content_obj else {
            return Ok(false);
        };

        match content_obj {
            RuntimeObject::Divert(divert) => self.perform_divert(&divert).map(|_| true),
            RuntimeObject::Command(command) => {
                self.execute_control_command(command)?;
                Ok(true)
            }
            RuntimeObject::VariableAssignment(var_ass) => {
                let assigned_value = self
                    .state
                    .pop_evaluation_stack()
                    .ok_or_else(|| RuntimeFault::new("Expected value for variable assignment"))?;
                self.assign_variable(&var_ass, assigned_value)?;
                Ok(true)
            }
            RuntimeObject::VariableReference(var_ref) => {
                let found_value = self.resolve_variable_reference(&var_ref)?;
                self.state.push_evaluation_stack(found_value);
                Ok(true)
            }
            RuntimeObject::NativeCall(func) => {
                let params = self
                    .state
                    .pop_evaluation_stack_n(func.number_of_parameters())?;
                let result = func.call(params, &self.list_definitions)?;
                self.state.push_evaluation_stack(result);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn perform_divert(&mut self, divert: &Divert) -> Result<(), RuntimeFault> {
        if divert.is_conditional {
            let condition_value = self.state.pop_evaluation_stack();
            // False conditions skip the divert entirely.
            if !self.is_truthy_object(condition_value.as_ref())? {
                return Ok(());
            }
        }

        if let Some(variable_name) = &divert.variable_divert_name {
            let contents = self.state.variables_state.get_variable_with_name(
                variable_name,
                -1,
                self.state.patch.as_ref(),
                &self.state.current_flow.call_stack,
                &self.list_definitions,
            );
            match contents {
                None => {
                    return Err(RuntimeFault::new(format!(
                        "Tried to divert using a target from a variable that could not be found ({})",
                        variable_name
                    )))
                }
                Some(RuntimeObject::Value(Value::DivertTarget(target_path))) => {
                    self.state.diverted_pointer = self.pointer_at_path_reporting(&target_path)?;
                }
                Some(other) => {
                    let mut message = format!(
                        "Tried to divert to a target from a variable, but the variable ({}) didn't contain a divert target, it ",
                        variable_name
                    );
                    if other == RuntimeObject::Value(Value::Int(0)) {
                        message.push_str("was empty/null (the value 0).");
                    } else {
                        message.push_str(&format!("contained '{}'.", other));
                    }
                    return Err(RuntimeFault::new(message));
                }
            }
        } else if divert.is_external {
            let name = divert.target_path_string().unwrap_or_default();
            self.call_external_function(&name, divert.external_args)?;
            return Ok(());
        } else {
            self.state.diverted_pointer = self.divert_target_pointer(divert);
        }

        if divert.pushes_to_stack {
            let output_length = self.state.output_stream().len();
            self.state
                .current_flow
                .call_stack
                .push(divert.stack_push_type, 0, output_length);
        }

        if self.state.diverted_pointer.is_null() && !divert.is_external {
            return Err(RuntimeFault::new(format!("Divert resolution failed: {}", divert)));
        }
        Ok(())
    }

    /// Resolve a divert's fixed target to a pointer, relative targets
    /// against the divert's own container.
    fn divert_target_pointer(&self, divert: &Divert) -> Pointer {
        let Some(path) = &divert.target_path else {
            return Pointer::NULL;
        };

        let (base, adjusted) = if path.is_relative() {
            let Some(context) = self.state.current_pointer().container else {
                return Pointer::NULL;
            };
            let mut adjusted = path.clone();
            if adjusted.head().map(|c| c.is_parent()).unwrap_or(false) {
                adjusted = adjusted.tail();
            }
            (context, adjusted)
        } else {
            (self.tree.root(), path.clone())
        };

        match adjusted.last_component() {
            Some(Component::Index(index)) => {
                let index = *index;
                let result =
                    self.tree
                        .content_at_path(base, &adjusted, 0, Some(adjusted.len().saturating_sub(1)));
                Pointer::new(result.container(), index)
            }
            _ => {
                let result = self.tree.content_at_path(base, &adjusted, 0, None);
                match result.container() {
                    Some(container) => Pointer::start_of(container),
                    None => Pointer::NULL,
                }
            }
        }
    }

    pub(crate) fn is_truthy_object(&self, obj: Option<&RuntimeObject>) -> Result<bool, RuntimeFault> {
        match obj {
            Some(RuntimeObject::Value(Value::DivertTarget(path))) => Err(RuntimeFault::new(format!(
                "Shouldn't use a divert target (to {}) as a conditional value. Did you intend a function call 'likeThis()' or a read count check 'likeThis'? (no arrows)",
                path
            ))),
            Some(RuntimeObject::Value(value)) => value.is_truthy(),
            _ => Ok(false),
        }
    }

    pub(crate) fn assign_variable(
        &mut self,
        var_ass: &VariableAssignment,
        value: RuntimeObject,
    ) -> Result<(), RuntimeFault> {
        let state = &mut self.state;
        state.variables_state.assign(
            var_ass,
            value,
            state.patch.as_mut(),
            &mut state.current_flow.call_stack,
            &self.list_definitions,
        )
    }

    fn resolve_variable_reference(
        &mut self,
        var_ref: &VariableReference,
    ) -> Result<RuntimeObject, RuntimeFault> {
        if let Some(path_for_count) = &var_ref.path_for_count {
            let container = self
                .state
                .current_pointer()
                .container
                .and_then(|context| self.tree.resolve_path_from(context, path_for_count).container());
            let Some(container) = container else {
                return Err(RuntimeFault::new(format!(
                    "Failed to find container for read count lookup at {}",
                    path_for_count
                )));
            };
            let count = self.visit_count_for_container(container)?;
            return Ok(RuntimeObject::Value(Value::Int(count)));
        }

        let name = var_ref.name.as_deref().unwrap_or_default();
        match self.state.variables_state.get_variable_with_name(
            name,
            -1,
            self.state.patch.as_ref(),
            &self.state.current_flow.call_stack,
            &self.list_definitions,
        ) {
            Some(value) => Ok(value),
            None => {
                self.warning(format!(
                    "Variable not found: '{}'. Using default value of 0 (false). This can happen with temporary variables if the declaration hasn't yet been hit. Globals are always given a default value on load if a value doesn't exist in the save state.",
                    name
                ));
                Ok(RuntimeObject::Value(Value::Int(0)))
            }
        }
    }

    /// Visit count lookup, requiring the container to have been compiled
    /// with visit counting enabled.
    pub(crate) fn visit_count_for_container(&self, container: ContainerId) -> Result<i32, RuntimeFault> {
        let node = self.tree.node(container);
        if !node.visits_should_be_counted {
            return Err(RuntimeFault::new(format!(
                "Read count for target ({}) unknown. The story may need to be compiled with countAllVisits flag (-c).",
                node.name.as_deref().unwrap_or(&node.path_string)
            )));
        }
        Ok(self.state.visit_count_for_path(&node.path_string))
    }

    fn execute_control_command(&mut self, command: CommandType) -> Result<(), RuntimeFault> {
        match command {
            CommandType::EvalStart => {
                if self.state.in_expression_evaluation() {
                    return Err(RuntimeFault::new("Already in expression evaluation?"));
                }
                self.state.set_in_expression_evaluation(true);
            }
            CommandType::EvalEnd => {
                if !self.state.in_expression_evaluation() {
                    return Err(RuntimeFault::new("Not in expression evaluation mode"));
                }
                self.state.set_in_expression_evaluation(false);
            }
            CommandType::EvalOutput => {
                if let Some(output) = self.state.pop_evaluation_stack() {
                    if !output.is_void() {
                        let text = RuntimeObject::Value(Value::string(output.to_string()));
                        self.state.push_to_output_stream(text);
                    }
                }
            }
            CommandType::NoOp => {}
            CommandType::Duplicate => {
                let top = self
                    .state
                    .peek_evaluation_stack()
                    .cloned()
                    .ok_or_else(|| RuntimeFault::new("Cannot duplicate an empty evaluation stack"))?;
                self.state.push_evaluation_stack(top);
            }
            CommandType::PopEvaluatedValue => {
                self.state.pop_evaluation_stack();
            }
            CommandType::PopFunction | CommandType::PopTunnel => {
                self.execute_pop_frame(command)?;
            }
            CommandType::BeginString => {
                self.state
                    .push_to_output_stream(RuntimeObject::Command(CommandType::BeginString));
                if !self.state.in_expression_evaluation() {
                    return Err(RuntimeFault::new(
                        "Expected to be in an expression when evaluating a string",
                    ));
                }
                self.state.set_in_expression_evaluation(false);
            }
            CommandType::BeginTag => {
                self.state
                    .push_to_output_stream(RuntimeObject::Command(CommandType::BeginTag));
            }
            CommandType::EndTag => self.execute_end_tag()?,
            CommandType::EndString => self.execute_end_string()?,
            CommandType::ChoiceCount => {
                let count = self.state.generated_choices().len() as i32;
                self.state.push_evaluation_stack(RuntimeObject::Value(Value::Int(count)));
            }
            CommandType::Turns => {
                let turns = self.state.current_turn_index + 1;
                self.state.push_evaluation_stack(RuntimeObject::Value(Value::Int(turns)));
            }
            CommandType::TurnsSince | CommandType::ReadCount => {
                self.execute_count_query(command)?;
            }
            CommandType::Random => self.execute_random()?,
            CommandType::SeedRandom => {
                let seed = self.state.pop_evaluation_stack();
                let Some(RuntimeObject::Value(Value::Int(seed))) = seed else {
                    return Err(RuntimeFault::new("Invalid value passed to SEED_RANDOM"));
                };
                self.state.story_seed = seed;
                self.state.previous_random = 0;
                self.state.push_evaluation_stack(RuntimeObject::Void);
            }
            CommandType::VisitIndex => {
                let container = self
                    .state
                    .current_pointer()
                    .container
                    .ok_or_else(|| RuntimeFault::new("No container for visit index"))?;
                let count = self.visit_count_for_container(container)? - 1;
                self.state.push_evaluation_stack(RuntimeObject::Value(Value::Int(count)));
            }
            CommandType::SequenceShuffleIndex => {
                let index = self.next_sequence_shuffle_index()?;
                self.state.push_evaluation_stack(RuntimeObject::Value(Value::Int(index)));
            }
            // Thread creation happens in the step loop, after the pointer
            // has advanced past this instruction.
            CommandType::StartThread => {}
            CommandType::Done => {
                if self.state.current_flow.call_stack.can_pop_thread() {
                    self.state.current_flow.call_stack.pop_thread()?;
                } else {
                    self.state.did_safe_exit = true;
                    self.state.set_current_pointer(Pointer::NULL);
                }
            }
            CommandType::End => self.state.force_end(),
            CommandType::ListFromInt => self.execute_list_from_int()?,
            CommandType::ListRange => self.execute_list_range()?,
            CommandType::ListRandom => self.execute_list_random()?,
        }
        Ok(())
    }

    fn execute_pop_frame(&mut self, command: CommandType) -> Result<(), RuntimeFault> {
        let pop_type = if command == CommandType::PopFunction {
            PushPopType::Function
        } else {
            PushPopType::Tunnel
        };

        // Tunnel returns can override their destination with `->-> target`.
        let mut override_tunnel_return_target: Option<Path> = None;
        if pop_type == PushPopType::Tunnel {
            match self.state.pop_evaluation_stack() {
                Some(RuntimeObject::Value(Value::DivertTarget(path))) => {
                    override_tunnel_return_target = Some(path);
                }
                Some(RuntimeObject::Void) | None => {}
                Some(_) => {
                    return Err(RuntimeFault::new("Expected void if ->-> doesn't override target"));
                }
            }
        }

        if self.state.try_exit_function_evaluation_from_game() {
            return Ok(());
        }

        let current_type = self.state.current_flow.call_stack.current_element().push_pop_type;
        if current_type != pop_type || !self.state.current_flow.call_stack.can_pop() {
            let name_of = |t: PushPopType| match t {
                PushPopType::Function => "function return statement (~ return)",
                _ => "tunnel onwards statement (->->)",
            };
            let expected = if !self.state.current_flow.call_stack.can_pop() {
                "end of flow (-> END or choice)"
            } else {
                name_of(current_type)
            };
            return Err(RuntimeFault::new(format!(
                "Found {}, when expected {}",
                name_of(pop_type),
                expected
            )));
        }

        self.state.pop_call_stack(None)?;
        if let Some(target) = override_tunnel_return_target {
            self.state.diverted_pointer = self.pointer_at_path_reporting(&target)?;
        }
        Ok(())
    }

    fn execute_end_string(&mut self) -> Result<(), RuntimeFault> {
        // Walk back to the matching BeginString, collecting the text and
        // rescuing any tags that were generated inside the string.
        let mut content_for_string: Vec<String> = Vec::new();
        let mut content_to_retain: Vec<RuntimeObject> = Vec::new();
        let mut output_count_consumed = 0;
        for obj in self.state.output_stream().iter().rev() {
            output_count_consumed += 1;
            match obj {
                RuntimeObject::Command(CommandType::BeginString) => break,
                RuntimeObject::Tag(_) => content_to_retain.push(obj.clone()),
                RuntimeObject::Value(Value::String(text)) => {
                    content_for_string.push(text.text.clone())
                }
                _ => {}
            }
        }
        self.state.pop_from_output_stream(output_count_consumed);

        for rescued_tag in content_to_retain {
            self.state.push_to_output_stream(rescued_tag);
        }

        content_for_string.reverse();
        let combined: String = content_for_string.concat();
        self.state.set_in_expression_evaluation(true);
        self.state
            .push_evaluation_stack(RuntimeObject::Value(Value::string(combined)));
        Ok(())
    }

    fn execute_end_tag(&mut self) -> Result<(), RuntimeFault> {
        if self.state.in_string_evaluation() {
            // A tag inside choice text collapses onto the evaluation stack
            // so choice processing can collect it.
            let mut content_for_tag: Vec<String> = Vec::new();
            let mut output_count_consumed = 0;
            for obj in self.state.output_stream().iter().rev() {
                output_count_consumed += 1;
                match obj {
                    RuntimeObject::Command(CommandType::BeginTag) => break,
                    RuntimeObject::Command(_) => {
                        return Err(RuntimeFault::new(
                            "Unexpected ControlCommand while extracting tag from choice",
                        ));
                    }
                    RuntimeObject::Value(Value::String(text)) => {
                        content_for_tag.push(text.text.clone())
                    }
                    _ => {}
                }
            }
            self.state.pop_from_output_stream(output_count_consumed);

            content_for_tag.reverse();
            let text = crate::state::story_state::clean_output_whitespace(&content_for_tag.concat());
            self.state.push_evaluation_stack(RuntimeObject::Tag(text));
        } else {
            self.state
                .push_to_output_stream(RuntimeObject::Command(CommandType::EndTag));
        }
        Ok(())
    }

    fn execute_count_query(&mut self, command: CommandType) -> Result<(), RuntimeFault> {
        let target = self.state.pop_evaluation_stack();
        let target_path = match target {
            Some(RuntimeObject::Value(Value::DivertTarget(path))) => path,
            other => {
                let mut extra_note = String::new();
                if matches!(other, Some(RuntimeObject::Value(Value::Int(_)))) {
                    extra_note = ". Did you accidentally pass a read count ('knot_name') instead of a target ('-> knot_name')?".to_string();
                }
                return Err(RuntimeFault::new(format!(
                    "TURNS_SINCE / READ_COUNT expected a divert target (knot, stitch, label name), but saw {}{}",
                    other.map(|o| o.to_string()).unwrap_or_else(|| "nothing".to_string()),
                    extra_note
                )));
            }
        };

        let container = self
            .tree
            .content_at_path(self.tree.root(), &target_path, 0, None)
            .correct_obj()
            .and_then(|obj| match obj {
                RuntimeObject::Container(id) => Some(*id),
                _ => None,
            });

        let count = match container {
            Some(container) => {
                if command == CommandType::TurnsSince {
                    let node = self.tree.node(container);
                    if !node.turn_index_should_be_counted {
                        let message = format!(
                            "TURNS_SINCE() for target ({}) unknown. The story may need to be compiled with countAllVisits flag (-c).",
                            node.name.as_deref().unwrap_or(&node.path_string)
                        );
                        self.warning(message);
                    }
                    let path = self.tree.node(container).path_string.clone();
                    self.state.turns_since_for_path(&path)
                } else {
                    self.visit_count_for_container(container)?
                }
            }
            None => {
                let default = if command == CommandType::TurnsSince { -1 } else { 0 };
                self.warning(format!(
                    "Failed to find container for {} lookup at {}",
                    command.wire_name(),
                    target_path
                ));
                default
            }
        };
        self.state.push_evaluation_stack(RuntimeObject::Value(Value::Int(count)));
        Ok(())
    }

    fn execute_random(&mut self) -> Result<(), RuntimeFault> {
        let max = self.state.pop_evaluation_stack();
        let min = self.state.pop_evaluation_stack();
        let Some(RuntimeObject::Value(Value::Int(min))) = min else {
            return Err(RuntimeFault::new("Invalid value for minimum parameter of RANDOM(min, max)"));
        };
        let Some(RuntimeObject::Value(Value::Int(max))) = max else {
            return Err(RuntimeFault::new("Invalid value for maximum parameter of RANDOM(min, max)"));
        };

        // The range is inclusive on both ends.
        let random_range = max as i64 - min as i64 + 1;
        if random_range <= 0 {
            return Err(RuntimeFault::new(format!(
                "RANDOM was called with minimum as {} and maximum as {}. The maximum must be larger",
                min, max
            )));
        }

        let result_seed = self.state.story_seed as i64 + self.state.previous_random as i64;
        let mut rng = Prng::new(result_seed);
        let next_random = rng.next();
        let chosen_value = (next_random % random_range) as i32 + min;
        self.state
            .push_evaluation_stack(RuntimeObject::Value(Value::Int(chosen_value)));
        self.state.previous_random = next_random as i32;
        Ok(())
    }

    fn execute_list_from_int(&mut self) -> Result<(), RuntimeFault> {
        let int_value = match self.state.pop_evaluation_stack() {
            Some(RuntimeObject::Value(Value::Int(i))) => i,
            _ => {
                return Err(RuntimeFault::new(
                    "Passed non-integer when creating a list element from a numerical value.",
                ))
            }
        };
        let list_name = match self.state.pop_evaluation_stack() {
            Some(RuntimeObject::Value(Value::String(s))) => s.text,
            _ => return Err(RuntimeFault::new("Expected list name for listInt")),
        };

        let Some(definition) = self.list_definitions.definition(&list_name) else {
            return Err(RuntimeFault::new(format!("Failed to find LIST called {}", list_name)));
        };
        let list = match definition.item_with_value(int_value) {
            Some(item) => InkList::from_single_item(item, int_value),
            None => InkList::new(),
        };
        self.state
            .push_evaluation_stack(RuntimeObject::Value(Value::List(list)));
        Ok(())
    }

    fn execute_list_range(&mut self) -> Result<(), RuntimeFault> {
        let max = self.state.pop_evaluation_stack();
        let min = self.state.pop_evaluation_stack();
        let target = self.state.pop_evaluation_stack();
        let Some(RuntimeObject::Value(Value::List(target_list))) = target else {
            return Err(RuntimeFault::new("Expected list, minimum and maximum for LIST_RANGE"));
        };
        if min.is_none() || max.is_none() {
            return Err(RuntimeFault::new("Expected list, minimum and maximum for LIST_RANGE"));
        }

        let bound = |obj: Option<RuntimeObject>, taking_min: bool, default: i32| match obj {
            Some(RuntimeObject::Value(Value::Int(i))) => i,
            Some(RuntimeObject::Value(Value::List(list))) => {
                let item = if taking_min { list.min_item() } else { list.max_item() };
                item.map(|(_, v)| v).unwrap_or(default)
            }
            _ => default,
        };
        let min_value = bound(min, true, 0);
        let max_value = bound(max, false, i32::MAX);

        let result = target_list.list_with_sub_range(min_value, max_value);
        self.state
            .push_evaluation_stack(RuntimeObject::Value(Value::List(result)));
        Ok(())
    }

    fn execute_list_random(&mut self) -> Result<(), RuntimeFault> {
        let Some(RuntimeObject::Value(Value::List(list))) = self.state.pop_evaluation_stack() else {
            return Err(RuntimeFault::new("Expected list for LIST_RANDOM"));
        };

        let new_list = if list.is_empty() {
            self.warning("LIST_RANDOM called on an empty list.".to_string());
            InkList::new()
        } else {
            let result_seed = self.state.story_seed as i64 + self.state.previous_random as i64;
            let mut rng = Prng::new(result_seed);
            let next_random = rng.next();
            let index = (next_random as usize) % list.len();
            let (item, value) = list
                .iter()
                .nth(index)
                .map(|(item, value)| (item.clone(), value))
                .ok_or_else(|| RuntimeFault::new("list entry vanished"))?;
            self.state.previous_random = next_random as i32;
            InkList::from_single_item(item, value)
        };

        self.state
            .push_evaluation_stack(RuntimeObject::Value(Value::List(new_list)));
        Ok(())
    }

    /// Deterministic shuffle for sequences: the k-th visit picks element
    /// `k mod N` of a permutation seeded from the container path, the loop
    /// count and the story seed.
    fn next_sequence_shuffle_index(&mut self) -> Result<i32, RuntimeFault> {
        let num_elements = match self.state.pop_evaluation_stack() {
            Some(RuntimeObject::Value(Value::Int(n))) => n,
            _ => {
                return Err(RuntimeFault::new(
                    "expected number of elements in sequence for shuffle index",
                ))
            }
        };
        let Some(seq_container) = self.state.current_pointer().container else {
            return Err(RuntimeFault::new("No container for sequence shuffle"));
        };
        let seq_count = match self.state.pop_evaluation_stack() {
            Some(RuntimeObject::Value(Value::Int(n))) => n,
            _ => return Err(RuntimeFault::new("expected sequence count for shuffle index")),
        };

        if num_elements <= 0 {
            return Err(RuntimeFault::new("expected positive element count for shuffle index"));
        }

        let loop_index = seq_count / num_elements;
        let iteration_index = seq_count % num_elements;

        // The hash must match other engine implementations so old saves
        // keep producing the same shuffles: a plain character-code sum.
        let path_string = &self.tree.node(seq_container).path_string;
        let sequence_hash: i64 = path_string.chars().map(|c| c as i64).sum();
        let random_seed = sequence_hash + loop_index as i64 + self.state.story_seed as i64;
        let mut rng = Prng::new(random_seed);

        let mut unpicked: Vec<i32> = (0..num_elements).collect();
        for i in 0..=iteration_index {
            let chosen = (rng.next() as usize) % unpicked.len();
            let chosen_index = unpicked.remove(chosen);
            if i == iteration_index {
                return Ok(chosen_index);
            }
        }
        Err(RuntimeFault::new("sequence shuffle failed to pick an element"))
    }
}
