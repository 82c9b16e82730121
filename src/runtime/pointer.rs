//! Pointers
//!
//! A pointer addresses a position inside a container: `index == -1` means
//! the container itself, and an index past the end is the exhausted
//! sentinel. Pointers are tiny copyable values; all resolution goes through
//! the content tree.

use std::fmt;

use crate::runtime::container::{ContainerId, ContentTree};
use crate::runtime::object::RuntimeObject;
use crate::runtime::path::{Component, Path};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pointer {
    pub container: Option<ContainerId>,
    pub index: i32,
}

impl Pointer {
    pub const NULL: Pointer = Pointer { container: None, index: -1 };

    pub fn new(container: Option<ContainerId>, index: i32) -> Pointer {
        Pointer { container, index }
    }

    pub fn start_of(container: ContainerId) -> Pointer {
        Pointer { container: Some(container), index: 0 }
    }

    pub fn is_null(&self) -> bool {
        self.container.is_none()
    }

    pub fn resolve(&self, tree: &ContentTree) -> Option<RuntimeObject> {
        let container = self.container?;
        if self.index < 0 {
            return Some(RuntimeObject::Container(container));
        }
        let content = &tree.node(container).content;
        if content.is_empty() {
            return Some(RuntimeObject::Container(container));
        }
        content.get(self.index as usize).cloned()
    }

    pub fn path(&self, tree: &ContentTree) -> Option<Path> {
        let container = self.container?;
        let container_path = tree.node(container).path.clone();
        if self.index >= 0 {
            Some(container_path.path_by_appending_component(Component::Index(self.index)))
        } else {
            Some(container_path)
        }
    }
}

impl Default for Pointer {
    fn default() -> Pointer {
        Pointer::NULL
    }
}

impl fmt::Display for Pointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.container {
            None => write!(f, "Ink Pointer (null)"),
            Some(id) => write!(f, "Ink Pointer -> container #{} -- index {}", id.index(), self.index),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::value::Value;

    #[test]
    fn test_resolution() {
        let mut tree = ContentTree::new();
        let root = tree.add_container();
        tree.node_mut(root).content.push(RuntimeObject::Value(Value::string("a")));
        tree.node_mut(root).content.push(RuntimeObject::Value(Value::string("b")));
        tree.seal();

        let p = Pointer::start_of(root);
        assert_eq!(p.resolve(&tree).unwrap().as_string_value().unwrap().text, "a");

        let whole = Pointer::new(Some(root), -1);
        assert!(matches!(whole.resolve(&tree), Some(RuntimeObject::Container(_))));

        let past_end = Pointer::new(Some(root), 2);
        assert!(past_end.resolve(&tree).is_none());

        assert!(Pointer::NULL.resolve(&tree).is_none());
        assert!(Pointer::NULL.is_null());
    }

    #[test]
    fn test_path_appends_index() {
        let mut tree = ContentTree::new();
        let root = tree.add_container();
        let knot = tree.add_container();
        tree.node_mut(knot).name = Some("knot".to_string());
        tree.node_mut(root).content.push(RuntimeObject::Container(knot));
        tree.node_mut(root).named_children.insert("knot".to_string(), knot);
        tree.seal();

        let p = Pointer::new(Some(knot), 3);
        assert_eq!(p.path(&tree).unwrap().components_string(), "knot.3");
    }
}
