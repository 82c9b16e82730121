//! Content Tree
//!
//! Containers are the interior nodes of a compiled story: an ordered list
//! of child objects plus named children, with flags controlling visit and
//! turn counting. All containers live in a single arena owned by the story;
//! parent links and absolute paths are fixed when the tree is sealed after
//! loading, so lookups never need interior mutability.

use indexmap::IndexMap;

use crate::runtime::object::RuntimeObject;
use crate::runtime::path::{Component, Path};
use crate::runtime::value::StringValue;

pub const FLAG_VISITS: i32 = 0x1;
pub const FLAG_TURNS: i32 = 0x2;
pub const FLAG_COUNT_START_ONLY: i32 = 0x4;

/// Arena handle for a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContainerId(u32);

impl ContainerId {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

/// One container node in the arena.
#[derive(Debug, Clone, Default)]
pub struct ContainerNode {
    pub name: Option<String>,
    pub content: Vec<RuntimeObject>,
    /// Children addressable by name only (not part of `content`), plus any
    /// named children of `content` registered for path lookup.
    pub named_children: IndexMap<String, ContainerId>,
    pub visits_should_be_counted: bool,
    pub turn_index_should_be_counted: bool,
    pub counting_at_start_only: bool,
    /// Set when the tree is sealed.
    pub parent: Option<ContainerId>,
    /// Position in the parent's `content`; `None` for named-only children.
    pub index_in_parent: Option<usize>,
    pub path: Path,
    pub path_string: String,
}

impl ContainerNode {
    pub fn has_valid_name(&self) -> bool {
        self.name.as_deref().map(|n| !n.is_empty()).unwrap_or(false)
    }

    pub fn count_flags(&self) -> i32 {
        let mut flags = 0;
        if self.visits_should_be_counted {
            flags |= FLAG_VISITS;
        }
        if self.turn_index_should_be_counted {
            flags |= FLAG_TURNS;
        }
        if self.counting_at_start_only {
            flags |= FLAG_COUNT_START_ONLY;
        }
        // Start-only on its own influences nothing; don't serialize it.
        if flags == FLAG_COUNT_START_ONLY {
            0
        } else {
            flags
        }
    }

    pub fn set_count_flags(&mut self, flags: i32) {
        if flags & FLAG_VISITS != 0 {
            self.visits_should_be_counted = true;
        }
        if flags & FLAG_TURNS != 0 {
            self.turn_index_should_be_counted = true;
        }
        if flags & FLAG_COUNT_START_ONLY != 0 {
            self.counting_at_start_only = true;
        }
    }
}

/// Outcome of a path walk. When a component cannot be followed the search
/// stops but still reports the deepest object found, flagged `approximate`,
/// so callers can warn about stale save data instead of failing outright.
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub obj: Option<RuntimeObject>,
    pub approximate: bool,
}

impl SearchResult {
    pub fn correct_obj(&self) -> Option<&RuntimeObject> {
        if self.approximate {
            None
        } else {
            self.obj.as_ref()
        }
    }

    pub fn container(&self) -> Option<ContainerId> {
        match self.obj {
            Some(RuntimeObject::Container(id)) => Some(id),
            _ => None,
        }
    }
}

/// The container arena. Node 0 is the root.
#[derive(Debug, Clone, Default)]
pub struct ContentTree {
    nodes: Vec<ContainerNode>,
}

impl ContentTree {
    pub fn new() -> ContentTree {
        ContentTree::default()
    }

    pub fn add_container(&mut self) -> ContainerId {
        let id = ContainerId(self.nodes.len() as u32);
        self.nodes.push(ContainerNode::default());
        id
    }

    pub fn root(&self) -> ContainerId {
        ContainerId(0)
    }

    pub fn node(&self, id: ContainerId) -> &ContainerNode {
        &self.nodes[id.index()]
    }

    pub fn node_mut(&mut self, id: ContainerId) -> &mut ContainerNode {
        &mut self.nodes[id.index()]
    }

    pub fn content_len(&self, id: ContainerId) -> usize {
        self.node(id).content.len()
    }

    /// Fix parent links and absolute paths across the whole tree. Must be
    /// called once after loading; the tree is immutable afterwards.
    pub fn seal(&mut self) {
        if self.nodes.is_empty() {
            return;
        }
        let mut stack = vec![(self.root(), None::<ContainerId>, None::<usize>)];
        while let Some((id, parent, index_in_parent)) = stack.pop() {
            let path = match parent {
                None => Path::default(),
                Some(parent_id) => {
                    let parent_path = &self.node(parent_id).path;
                    let component = if self.node(id).has_valid_name() {
                        Component::Name(self.node(id).name.clone().unwrap_or_default())
                    } else {
                        Component::Index(index_in_parent.unwrap_or(0) as i32)
                    };
                    parent_path.path_by_appending_component(component)
                }
            };
            let path_string = path.components_string();
            {
                let node = self.node_mut(id);
                node.parent = parent;
                node.index_in_parent = index_in_parent;
                node.path = path;
                node.path_string = path_string;
            }

            let node = self.node(id);
            let mut children: Vec<(ContainerId, Option<usize>)> = Vec::new();
            for (i, obj) in node.content.iter().enumerate() {
                if let RuntimeObject::Container(child) = obj {
                    children.push((*child, Some(i)));
                }
            }
            let content_children: Vec<ContainerId> =
                children.iter().map(|(id, _)| *id).collect();
            for child in node.named_children.values() {
                if !content_children.contains(child) {
                    children.push((*child, None));
                }
            }
            for (child, index) in children {
                stack.push((child, Some(id), index));
            }
        }
    }

    pub fn content_with_path_component(
        &self,
        id: ContainerId,
        component: &Component,
    ) -> Option<RuntimeObject> {
        match component {
            Component::Index(i) => {
                let node = self.node(id);
                if *i >= 0 && (*i as usize) < node.content.len() {
                    Some(node.content[*i as usize].clone())
                } else {
                    None
                }
            }
            Component::Name(name) => {
                if component.is_parent() {
                    return self.node(id).parent.map(RuntimeObject::Container);
                }
                self.node(id)
                    .named_children
                    .get(name)
                    .map(|child| RuntimeObject::Container(*child))
            }
        }
    }

    /// Walk `path` starting from `from`, over the component range
    /// `[start, length)` (`length = None` means the whole path).
    pub fn content_at_path(
        &self,
        from: ContainerId,
        path: &Path,
        start: usize,
        length: Option<usize>,
    ) -> SearchResult {
        let length = length.unwrap_or(path.len());
        let mut result = SearchResult {
            obj: Some(RuntimeObject::Container(from)),
            approximate: false,
        };
        let mut current_container = Some(from);

        for i in start..length {
            let component = path.component(i);
            let Some(container) = current_container else {
                result.approximate = true;
                break;
            };
            let Some(found) = self.content_with_path_component(container, component) else {
                result.approximate = true;
                break;
            };
            let next_container = match &found {
                RuntimeObject::Container(id) => Some(*id),
                _ => None,
            };
            if i < length - 1 && next_container.is_none() {
                result.approximate = true;
                break;
            }
            result.obj = Some(found);
            current_container = next_container;
        }

        result
    }

    /// Resolve a path against a leaf object whose parent container is
    /// `context`. Relative leaf paths always begin with a parent component
    /// addressing that container.
    pub fn resolve_path_from(&self, context: ContainerId, path: &Path) -> SearchResult {
        if path.is_relative() {
            let mut path = path.clone();
            if path.head().map(|c| c.is_parent()).unwrap_or(false) {
                path = path.tail();
            }
            self.content_at_path(context, &path, 0, None)
        } else {
            self.content_at_path(self.root(), path, 0, None)
        }
    }

    /// Resolve an absolute path to a pointer. An index-final path addresses
    /// a position inside the second-to-last container; a name-final path
    /// addresses the start of the named container. The search result is
    /// returned so callers can warn about approximate matches.
    pub fn pointer_at_path(&self, path: &Path) -> (crate::runtime::pointer::Pointer, SearchResult) {
        use crate::runtime::pointer::Pointer;

        if path.is_empty() {
            return (Pointer::NULL, SearchResult { obj: None, approximate: false });
        }

        let mut pointer = Pointer::NULL;
        let result = match path.last_component() {
            Some(Component::Index(index)) => {
                let result = self.content_at_path(self.root(), path, 0, Some(path.len() - 1));
                pointer.container = result.container();
                pointer.index = *index;
                result
            }
            _ => {
                let result = self.content_at_path(self.root(), path, 0, None);
                pointer.container = result.container();
                pointer.index = -1;
                result
            }
        };
        (pointer, result)
    }

    /// Make a leaf path absolute using the container it lives in.
    pub fn absolute_path_from(&self, context: ContainerId, path: &Path) -> Path {
        if path.is_relative() {
            // A leaf's own path is its container path; relative paths hang
            // off the leaf, so prepend a synthetic index component for the
            // parent hop to consume.
            let own = self
                .node(context)
                .path
                .path_by_appending_component(Component::Index(0));
            own.path_by_appending_path(path)
        } else {
            path.clone()
        }
    }

    /// Debug dump of the tree, marking `pointed_obj`'s container.
    pub fn build_string_of_hierarchy(&self, id: ContainerId, pointed: Option<ContainerId>) -> String {
        let mut out = String::new();
        self.hierarchy_into(&mut out, id, 0, pointed);
        out
    }

    fn hierarchy_into(
        &self,
        out: &mut String,
        id: ContainerId,
        indentation: usize,
        pointed: Option<ContainerId>,
    ) {
        let pad = "    ".repeat(indentation);
        out.push_str(&pad);
        out.push('[');
        let node = self.node(id);
        if node.has_valid_name() {
            out.push_str(&format!(" ({})", node.name.as_deref().unwrap_or("")));
        }
        if pointed == Some(id) {
            out.push_str("  <---");
        }
        out.push('\n');

        for (i, obj) in node.content.iter().enumerate() {
            match obj {
                RuntimeObject::Container(child) => {
                    self.hierarchy_into(out, *child, indentation + 1, pointed);
                }
                RuntimeObject::Value(crate::runtime::value::Value::String(StringValue {
                    text,
                    ..
                })) => {
                    out.push_str(&"    ".repeat(indentation + 1));
                    out.push('"');
                    out.push_str(&text.replace('\n', "\\n"));
                    out.push('"');
                }
                other => {
                    out.push_str(&"    ".repeat(indentation + 1));
                    out.push_str(&other.to_string());
                }
            }
            if i != node.content.len() - 1 {
                out.push(',');
            }
            out.push('\n');
        }

        let named_only: Vec<ContainerId> = node
            .named_children
            .values()
            .filter(|child| self.node(**child).index_in_parent.is_none())
            .copied()
            .collect();
        if !named_only.is_empty() {
            out.push_str(&pad);
            out.push_str("-- named: --\n");
            for child in named_only {
                self.hierarchy_into(out, child, indentation + 1, pointed);
                out.push('\n');
            }
        }

        out.push_str(&pad);
        out.push(']');
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::value::Value;

    fn small_tree() -> (ContentTree, ContainerId, ContainerId) {
        // root: [ "hi", knot: [ "inner", sub: [] ] ]
        let mut tree = ContentTree::new();
        let root = tree.add_container();
        let knot = tree.add_container();
        let sub = tree.add_container();

        tree.node_mut(root)
            .content
            .push(RuntimeObject::Value(Value::string("hi")));
        tree.node_mut(root).named_children.insert("knot".to_string(), knot);

        tree.node_mut(knot).name = Some("knot".to_string());
        tree.node_mut(knot)
            .content
            .push(RuntimeObject::Value(Value::string("inner")));
        tree.node_mut(knot).content.push(RuntimeObject::Container(sub));
        tree.node_mut(knot).named_children.insert("sub".to_string(), sub);
        tree.node_mut(sub).name = Some("sub".to_string());

        tree.seal();
        (tree, root, knot)
    }

    #[test]
    fn test_seal_assigns_paths_and_parents() {
        let (tree, root, knot) = small_tree();
        assert_eq!(tree.node(root).path_string, "");
        assert_eq!(tree.node(knot).path_string, "knot");
        assert_eq!(tree.node(knot).parent, Some(root));
        let sub = tree.node(knot).named_children["sub"];
        assert_eq!(tree.node(sub).path_string, "knot.sub");
        assert_eq!(tree.node(sub).index_in_parent, Some(1));
    }

    #[test]
    fn test_content_at_path() {
        let (tree, root, knot) = small_tree();
        let path = Path::from_components_string("knot.0");
        let result = tree.content_at_path(root, &path, 0, None);
        assert!(!result.approximate);
        match result.obj {
            Some(RuntimeObject::Value(Value::String(s))) => assert_eq!(s.text, "inner"),
            other => panic!("unexpected result: {:?}", other),
        }

        let named = tree.content_at_path(root, &Path::from_components_string("knot.sub"), 0, None);
        assert_eq!(named.container(), Some(tree.node(knot).named_children["sub"]));
    }

    #[test]
    fn test_missing_path_is_approximate() {
        let (tree, root, knot) = small_tree();
        let result =
            tree.content_at_path(root, &Path::from_components_string("knot.missing"), 0, None);
        assert!(result.approximate);
        // Deepest found object is still reported.
        assert_eq!(result.container(), Some(knot));
        assert!(result.correct_obj().is_none());
    }

    #[test]
    fn test_relative_resolution_from_leaf() {
        let (tree, _, knot) = small_tree();
        let relative = Path::from_components_string(".^.sub");
        let result = tree.resolve_path_from(knot, &relative);
        assert!(!result.approximate);
        assert_eq!(result.container(), Some(tree.node(knot).named_children["sub"]));
    }

    #[test]
    fn test_count_flags_start_only_alone_collapses() {
        let mut node = ContainerNode::default();
        node.counting_at_start_only = true;
        assert_eq!(node.count_flags(), 0);
        node.visits_should_be_counted = true;
        assert_eq!(node.count_flags(), FLAG_VISITS | FLAG_COUNT_START_ONLY);
    }
}
