//! External Functions
//!
//! Host-bound functions callable from ink via `EXTERNAL` declarations.
//! Binding happens before the first continue; a validation pass walks the
//! whole content tree and reports every missing binding at once. Functions
//! not marked lookahead-safe are deferred during newline lookahead so they
//! run at most once per produced line.

use std::collections::BTreeSet;

use crate::runtime::container::ContainerId;
use crate::runtime::divert::PushPopType;
use crate::runtime::object::RuntimeObject;
use crate::runtime::pointer::Pointer;
use crate::runtime::value::Value;
use crate::story::errors::{RuntimeFault, StoryError};
use crate::story::Story;

pub type ExternalFn = Box<dyn FnMut(&[Value]) -> Option<Value>>;

pub struct ExternalFunctionDef {
    pub function: ExternalFn,
    pub lookahead_safe: bool,
}

impl Story {
    /// Bind a host function. `lookahead_safe` means the function has no
    /// side effects and may be called speculatively during newline
    /// lookahead; unsafe functions are deferred and re-run on the real
    /// pass.
    pub fn bind_external_function(
        &mut self,
        func_name: &str,
        function: impl FnMut(&[Value]) -> Option<Value> + 'static,
        lookahead_safe: bool,
    ) -> Result<(), StoryError> {
        self.if_async_we_cant("bind an external function")?;
        if self.externals.contains_key(func_name) {
            return Err(StoryError::InvalidOperation(format!(
                "Function '{}' has already been bound.",
                func_name
            )));
        }
        self.externals.insert(
            func_name.to_string(),
            ExternalFunctionDef { function: Box::new(function), lookahead_safe },
        );
        Ok(())
    }

    pub fn unbind_external_function(&mut self, func_name: &str) -> Result<(), StoryError> {
        self.if_async_we_cant("unbind an external a function")?;
        if self.externals.remove(func_name).is_none() {
            return Err(StoryError::InvalidOperation(format!(
                "Function '{}' has not been bound.",
                func_name
            )));
        }
        Ok(())
    }

    /// Check that every external divert in the story has a binding (or an
    /// ink fallback, when fallbacks are enabled).
    pub fn validate_external_bindings(&mut self) -> Result<(), StoryError> {
        let mut missing: BTreeSet<String> = BTreeSet::new();
        self.collect_missing_externals(self.tree.root(), &mut missing);
        self.has_validated_externals = true;

        if missing.is_empty() {
            return Ok(());
        }
        let names: Vec<String> = missing.into_iter().collect();
        let message = format!(
            "Error: Missing function binding for external{}: '{}' {}",
            if names.len() > 1 { "s" } else { "" },
            names.join("', '"),
            if self.allow_external_function_fallbacks {
                ", and no fallback ink function found."
            } else {
                " (ink fallbacks disabled)"
            }
        );
        Err(StoryError::InvalidOperation(message))
    }

    fn collect_missing_externals(&self, container: ContainerId, missing: &mut BTreeSet<String>) {
        let node = self.tree.node(container);
        for obj in &node.content {
            match obj {
                RuntimeObject::Container(child) => {
                    // Named children are revisited through the name table.
                    if !self.tree.node(*child).has_valid_name() {
                        self.collect_missing_externals(*child, missing);
                    }
                }
                RuntimeObject::Divert(divert) if divert.is_external => {
                    let name = divert.target_path_string().unwrap_or_default();
                    if !self.externals.contains_key(&name) {
                        let fallback_found = self.allow_external_function_fallbacks
                            && self.knot_container_with_name(&name).is_some();
                        if !fallback_found {
                            missing.insert(name);
                        }
                    }
                }
                _ => {}
            }
        }
        for child in node.named_children.values() {
            self.collect_missing_externals(*child, missing);
        }
    }

    pub(crate) fn call_external_function(
        &mut self,
        func_name: &str,
        number_of_arguments: i32,
    ) -> Result<(), RuntimeFault> {
        let (found, lookahead_safe) = match self.externals.get(func_name) {
            Some(def) => (true, def.lookahead_safe),
            None => (false, true),
        };

        if found && !lookahead_safe && self.state.in_string_evaluation() {
            return Err(RuntimeFault::new(format!(
                "External function {} could not be called because 1) it wasn't marked as lookaheadSafe when BindExternalFunction was called and 2) the story is in the middle of string generation, either because choice text is being generated, or because you have ink like \"hello {{func()}}\". You can work around this by generating the result of your function into a temporary variable before the string or choice gets generated: ~ temp x = {}()",
                func_name, func_name
            )));
        }

        // During lookahead an unsafe external is skipped; the flag forces a
        // rollback so it runs exactly once on the definitive pass.
        if found && !lookahead_safe && self.state_snapshot_at_last_newline.is_some() {
            self.saw_lookahead_unsafe_function_after_newline = true;
            return Ok(());
        }

        if !found {
            if self.allow_external_function_fallbacks {
                let Some(fallback) = self.knot_container_with_name(func_name) else {
                    return Err(RuntimeFault::new(format!(
                        "Trying to call EXTERNAL function '{}' which has not been bound, and fallback ink function could not be found.",
                        func_name
                    )));
                };
                let output_length = self.state.output_stream().len();
                self.state
                    .current_flow
                    .call_stack
                    .push(PushPopType::Function, 0, output_length);
                self.state.diverted_pointer = Pointer::start_of(fallback);
                return Ok(());
            }
            return Err(RuntimeFault::new(format!(
                "Trying to call EXTERNAL function '{}' which has not been bound (and ink fallbacks disabled).",
                func_name
            )));
        }

        let mut args: Vec<Value> = Vec::with_capacity(number_of_arguments.max(0) as usize);
        for _ in 0..number_of_arguments {
            match self.state.pop_evaluation_stack() {
                Some(RuntimeObject::Value(value)) => args.push(value),
                _ => {
                    return Err(RuntimeFault::new(
                        "Expected value arguments for external function call",
                    ))
                }
            }
        }
        args.reverse();

        let result = match self.externals.get_mut(func_name) {
            Some(def) => (def.function)(&args),
            None => None,
        };

        let return_obj = match result {
            Some(value) => RuntimeObject::Value(value),
            None => RuntimeObject::Void,
        };
        self.state.push_evaluation_stack(return_obj);
        Ok(())
    }
}
