//! Variables State
//!
//! Global variables, the default-global snapshot taken after the story's
//! declaration pass, and the resolution rules that tie globals, per-frame
//! temporaries and variable pointers together. Changes are collected here
//! (batched during a continue, queued otherwise) and dispatched to
//! observers by the story facade.
//!
//! The global maps sit behind `Arc`s: a state snapshot or background-save
//! copy shares them copy-on-write while the live state writes through a
//! `StatePatch`.

use std::collections::HashSet;
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::{Map, Value as JsonValue};

use crate::json::{reader, writer};
use crate::runtime::container::ContentTree;
use crate::runtime::list_definition::ListDefinitionsOrigin;
use crate::runtime::object::RuntimeObject;
use crate::runtime::value::Value;
use crate::runtime::variable::VariableAssignment;
use crate::state::call_stack::CallStack;
use crate::state::state_patch::StatePatch;
use crate::story::errors::{RuntimeFault, StoryError};

/// Assigning an empty list keeps the origins of the list it replaces, so
/// `LIST_ALL` and friends still know where the variable came from.
pub fn retain_list_origins_for_assignment(old_value: &RuntimeObject, new_value: &mut RuntimeObject) {
    if let (
        RuntimeObject::Value(Value::List(old_list)),
        RuntimeObject::Value(Value::List(new_list)),
    ) = (old_value, new_value)
    {
        if new_list.is_empty() {
            new_list.set_initial_origin_names(old_list.origin_names());
        }
    }
}

#[derive(Debug, Clone)]
pub struct VariablesState {
    globals: Arc<IndexMap<String, RuntimeObject>>,
    default_globals: Arc<IndexMap<String, RuntimeObject>>,
    batch_observing: bool,
    changed_for_batch: HashSet<String>,
    /// Changes made outside a batch (host assignments), waiting for the
    /// story to notify observers.
    pending_notifications: Vec<String>,
}

impl VariablesState {
    pub fn new() -> VariablesState {
        VariablesState {
            globals: Arc::new(IndexMap::new()),
            default_globals: Arc::new(IndexMap::new()),
            batch_observing: false,
            changed_for_batch: HashSet::new(),
            pending_notifications: Vec::new(),
        }
    }

    pub fn global_variable_exists_with_name(&self, name: &str) -> bool {
        self.globals.contains_key(name) || self.default_globals.contains_key(name)
    }

    /// Capture the defaults once the global declaration container has run.
    pub fn snapshot_default_globals(&mut self) {
        self.default_globals = Arc::clone(&self.globals);
    }

    pub fn try_get_default_variable_value(&self, name: &str) -> Option<&RuntimeObject> {
        self.default_globals.get(name)
    }

    /// Host-facing read (context 0), following pointer chains.
    pub fn get(
        &self,
        name: &str,
        patch: Option<&StatePatch>,
        call_stack: &CallStack,
        defs: &ListDefinitionsOrigin,
    ) -> Option<RuntimeObject> {
        self.get_variable_with_name(name, -1, patch, call_stack, defs)
    }

    /// Host-facing write. The variable must have been declared in the story.
    pub fn set(
        &mut self,
        name: &str,
        value: Value,
        patch: Option<&mut StatePatch>,
    ) -> Result<(), StoryError> {
        if !self.default_globals.contains_key(name) {
            return Err(StoryError::InvalidOperation(format!(
                "Cannot assign to a variable ({}) that hasn't been declared in the story",
                name
            )));
        }
        self.set_global(name, RuntimeObject::Value(value), patch);
        Ok(())
    }

    pub fn get_variable_with_name(
        &self,
        name: &str,
        context_index: i32,
        patch: Option<&StatePatch>,
        call_stack: &CallStack,
        defs: &ListDefinitionsOrigin,
    ) -> Option<RuntimeObject> {
        let raw = self.get_raw_variable_with_name(name, context_index, patch, call_stack, defs)?;
        match raw {
            RuntimeObject::Value(Value::VariablePointer { name, context_index }) => {
                self.get_variable_with_name(&name, context_index, patch, call_stack, defs)
            }
            other => Some(other),
        }
    }

    pub fn get_raw_variable_with_name(
        &self,
        name: &str,
        context_index: i32,
        patch: Option<&StatePatch>,
        call_stack: &CallStack,
        defs: &ListDefinitionsOrigin,
    ) -> Option<RuntimeObject> {
        if context_index == 0 || context_index == -1 {
            if let Some(patch) = patch {
                if let Some(value) = patch.try_get_global(name) {
                    return Some(value.clone());
                }
            }
            if let Some(value) = self.globals.get(name) {
                return Some(value.clone());
            }
            if let Some(value) = self.default_globals.get(name) {
                return Some(value.clone());
            }
            if let Some(list) = defs.find_single_item_list_with_name(name) {
                return Some(RuntimeObject::Value(Value::List(list)));
            }
        }
        call_stack.get_temporary_variable_with_name(name, context_index)
    }

    /// Perform a variable assignment instruction, following any existing
    /// pointer chain to its eventual target.
    pub fn assign(
        &mut self,
        var_ass: &VariableAssignment,
        value: RuntimeObject,
        patch: Option<&mut StatePatch>,
        call_stack: &mut CallStack,
        defs: &ListDefinitionsOrigin,
    ) -> Result<(), RuntimeFault> {
        let mut name = var_ass.variable_name.clone();
        let mut context_index = -1;
        let mut set_global = if var_ass.is_new_declaration {
            var_ass.is_global
        } else {
            self.global_variable_exists_with_name(&name)
        };

        let mut value = value;
        if var_ass.is_new_declaration {
            // Declaring a pointer (ref parameter) pins down its context now.
            let pointer = match &value {
                RuntimeObject::Value(Value::VariablePointer { name, context_index }) => {
                    Some((name.clone(), *context_index))
                }
                _ => None,
            };
            if let Some((pointer_name, pointer_context)) = pointer {
                value = RuntimeObject::Value(self.resolve_variable_pointer(
                    &pointer_name,
                    pointer_context,
                    patch.as_deref(),
                    call_stack,
                    defs,
                ));
            }
        } else {
            // Assigning through pointers: chase the chain, rebinding
            // global-vs-local from the final pointer's context.
            loop {
                match self.get_raw_variable_with_name(
                    &name,
                    context_index,
                    patch.as_deref(),
                    call_stack,
                    defs,
                ) {
                    Some(RuntimeObject::Value(Value::VariablePointer {
                        name: pointer_name,
                        context_index: pointer_context,
                    })) => {
                        name = pointer_name;
                        context_index = pointer_context;
                        set_global = context_index == 0;
                    }
                    _ => break,
                }
            }
        }

        if set_global {
            self.set_global(&name, value, patch);
            Ok(())
        } else {
            call_stack.set_temporary_variable(&name, value, var_ass.is_new_declaration, context_index)
        }
    }

    pub fn set_global(
        &mut self,
        name: &str,
        value: RuntimeObject,
        patch: Option<&mut StatePatch>,
    ) {
        let mut value = value;
        let old_value = match &patch {
            Some(patch) => patch
                .try_get_global(name)
                .cloned()
                .or_else(|| self.globals.get(name).cloned()),
            None => self.globals.get(name).cloned(),
        };
        if let Some(old_value) = &old_value {
            retain_list_origins_for_assignment(old_value, &mut value);
        }

        match patch {
            Some(patch) => {
                patch.set_global(name, value);
                if self.batch_observing {
                    patch.add_changed_variable(name);
                } else {
                    self.pending_notifications.push(name.to_string());
                }
            }
            None => {
                Arc::make_mut(&mut self.globals).insert(name.to_string(), value);
                if self.batch_observing {
                    self.changed_for_batch.insert(name.to_string());
                } else {
                    self.pending_notifications.push(name.to_string());
                }
            }
        }
    }

    fn resolve_variable_pointer(
        &self,
        name: &str,
        context_index: i32,
        patch: Option<&StatePatch>,
        call_stack: &CallStack,
        defs: &ListDefinitionsOrigin,
    ) -> Value {
        let context_index = if context_index == -1 {
            self.get_context_index_of_variable_named(name, call_stack)
        } else {
            context_index
        };

        // A pointer to a pointer keeps the existing indirection.
        match self.get_raw_variable_with_name(name, context_index, patch, call_stack, defs) {
            Some(RuntimeObject::Value(pointer @ Value::VariablePointer { .. })) => pointer,
            _ => Value::VariablePointer { name: name.to_string(), context_index },
        }
    }

    fn get_context_index_of_variable_named(&self, name: &str, call_stack: &CallStack) -> i32 {
        if self.global_variable_exists_with_name(name) {
            0
        } else {
            call_stack.current_element_index() as i32
        }
    }

    // -- observation ------------------------------------------------------

    pub fn start_variable_observation(&mut self) {
        self.batch_observing = true;
        self.changed_for_batch.clear();
    }

    /// Finish a batch and return every name that changed, including changes
    /// that went through the given (still live) patch.
    pub fn complete_variable_observation(&mut self, patch: Option<&StatePatch>) -> Vec<String> {
        self.batch_observing = false;
        let mut changed: HashSet<String> = std::mem::take(&mut self.changed_for_batch);
        if let Some(patch) = patch {
            for name in &patch.changed_variables {
                changed.insert(name.clone());
            }
        }
        let mut names: Vec<String> = changed.into_iter().collect();
        names.sort();
        names
    }

    pub fn take_pending_notifications(&mut self) -> Vec<String> {
        std::mem::take(&mut self.pending_notifications)
    }

    /// Merge a patch created by `copy_and_start_patching` back in.
    pub fn apply_patch(&mut self, patch: StatePatch) {
        let globals = Arc::make_mut(&mut self.globals);
        for (name, value) in patch.globals {
            globals.insert(name, value);
        }
        for name in patch.changed_variables {
            self.changed_for_batch.insert(name);
        }
    }

    // -- serialization ----------------------------------------------------

    /// Write globals, omitting ones still equal to their default.
    pub fn write_json(&self, tree: &ContentTree) -> JsonValue {
        let mut obj = Map::new();
        for (name, value) in self.globals.iter() {
            if let Some(default) = self.default_globals.get(name) {
                if default == value {
                    continue;
                }
            }
            obj.insert(name.clone(), writer::write_runtime_object(tree, value));
        }
        JsonValue::Object(obj)
    }

    /// Load globals: declared variables take their saved value when present,
    /// else their default. Unknown saved names are dropped.
    pub fn load_json(&mut self, token: &JsonValue) -> Result<(), StoryError> {
        let obj = token
            .as_object()
            .ok_or_else(|| StoryError::BadJson("variablesState is not an object".to_string()))?;
        let mut globals = IndexMap::new();
        for (name, default_value) in self.default_globals.iter() {
            match obj.get(name) {
                Some(saved) => {
                    globals.insert(name.clone(), reader::state_token_to_object(saved)?);
                }
                None => {
                    globals.insert(name.clone(), default_value.clone());
                }
            }
        }
        self.globals = Arc::new(globals);
        Ok(())
    }
}

impl Default for VariablesState {
    fn default() -> VariablesState {
        VariablesState::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::container::ContentTree;

    fn empty_stack() -> CallStack {
        let mut tree = ContentTree::new();
        let root = tree.add_container();
        tree.seal();
        CallStack::new(root)
    }

    fn declared(names: &[(&str, i32)]) -> VariablesState {
        let mut vars = VariablesState::new();
        for (name, value) in names {
            vars.set_global(name, RuntimeObject::Value(Value::Int(*value)), None);
        }
        vars.snapshot_default_globals();
        // Declarations themselves aren't interesting notifications.
        vars.take_pending_notifications();
        vars
    }

    #[test]
    fn test_read_falls_back_to_default() {
        let vars = declared(&[("x", 5)]);
        let stack = empty_stack();
        let defs = ListDefinitionsOrigin::default();
        assert_eq!(
            vars.get("x", None, &stack, &defs),
            Some(RuntimeObject::Value(Value::Int(5)))
        );
        assert_eq!(vars.get("missing", None, &stack, &defs), None);
    }

    #[test]
    fn test_host_set_requires_declaration() {
        let mut vars = declared(&[("x", 5)]);
        assert!(vars.set("x", Value::Int(7), None).is_ok());
        assert!(vars.set("undeclared", Value::Int(7), None).is_err());
    }

    #[test]
    fn test_pointer_chain_resolution() {
        let mut vars = declared(&[("target", 1)]);
        let stack = empty_stack();
        let defs = ListDefinitionsOrigin::default();
        vars.set_global(
            "alias",
            RuntimeObject::Value(Value::VariablePointer {
                name: "target".to_string(),
                context_index: 0,
            }),
            None,
        );
        assert_eq!(
            vars.get("alias", None, &stack, &defs),
            Some(RuntimeObject::Value(Value::Int(1)))
        );
    }

    #[test]
    fn test_assignment_through_pointer_rebinds_global() {
        let mut vars = declared(&[("target", 1), ("alias", 0)]);
        let mut stack = empty_stack();
        let defs = ListDefinitionsOrigin::default();
        vars.set_global(
            "alias",
            RuntimeObject::Value(Value::VariablePointer {
                name: "target".to_string(),
                context_index: 0,
            }),
            None,
        );
        let assignment = VariableAssignment::new("alias", false, true);
        vars.assign(&assignment, RuntimeObject::Value(Value::Int(42)), None, &mut stack, &defs)
            .unwrap();
        assert_eq!(
            vars.get("target", None, &stack, &defs),
            Some(RuntimeObject::Value(Value::Int(42)))
        );
    }

    #[test]
    fn test_batch_observation_collects_changes() {
        let mut vars = declared(&[("x", 1), ("y", 2)]);
        vars.start_variable_observation();
        vars.set_global("x", RuntimeObject::Value(Value::Int(10)), None);
        vars.set_global("x", RuntimeObject::Value(Value::Int(11)), None);
        vars.set_global("y", RuntimeObject::Value(Value::Int(20)), None);
        let changed = vars.complete_variable_observation(None);
        assert_eq!(changed, vec!["x".to_string(), "y".to_string()]);
        // Outside a batch, changes queue as pending notifications.
        vars.set_global("x", RuntimeObject::Value(Value::Int(12)), None);
        assert_eq!(vars.take_pending_notifications(), vec!["x".to_string()]);
        assert!(vars.take_pending_notifications().is_empty());
    }

    #[test]
    fn test_patched_writes_do_not_touch_base() {
        let mut vars = declared(&[("x", 1)]);
        let stack = empty_stack();
        let defs = ListDefinitionsOrigin::default();
        let mut patch = StatePatch::default();

        vars.set_global("x", RuntimeObject::Value(Value::Int(99)), Some(&mut patch));
        // Patched read sees the new value; the base map still has the old.
        assert_eq!(
            vars.get("x", Some(&patch), &stack, &defs),
            Some(RuntimeObject::Value(Value::Int(99)))
        );
        assert_eq!(
            vars.get("x", None, &stack, &defs),
            Some(RuntimeObject::Value(Value::Int(1)))
        );

        vars.apply_patch(patch);
        assert_eq!(
            vars.get("x", None, &stack, &defs),
            Some(RuntimeObject::Value(Value::Int(99)))
        );
    }

    #[test]
    fn test_save_omits_defaults() {
        let mut vars = declared(&[("x", 1), ("y", 2)]);
        vars.set_global("y", RuntimeObject::Value(Value::Int(3)), None);
        let tree = ContentTree::new();
        let json = vars.write_json(&tree);
        let obj = json.as_object().unwrap();
        assert!(!obj.contains_key("x"));
        assert_eq!(obj.get("y"), Some(&serde_json::json!(3)));
    }

    #[test]
    fn test_load_restores_defaults_for_missing() {
        let mut vars = declared(&[("x", 1), ("y", 2)]);
        vars.load_json(&serde_json::json!({"y": 9, "stale": 4})).unwrap();
        let stack = empty_stack();
        let defs = ListDefinitionsOrigin::default();
        assert_eq!(vars.get("x", None, &stack, &defs), Some(RuntimeObject::Value(Value::Int(1))));
        assert_eq!(vars.get("y", None, &stack, &defs), Some(RuntimeObject::Value(Value::Int(9))));
        assert_eq!(vars.get("stale", None, &stack, &defs), None);
    }
}
