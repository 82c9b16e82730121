//! Hierarchical Paths
//!
//! Paths address nodes inside the content tree. A path is a sequence of
//! components, each either a child index or a named child, optionally
//! relative (leading `.` in string form). The component name `^` means
//! "parent" and is resolved during path arithmetic.

use std::fmt;

/// The component name that addresses a container's parent.
pub const PARENT_ID: &str = "^";

/// One step of a path: a child index or a named child.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Component {
    Index(i32),
    Name(String),
}

impl Component {
    pub fn is_index(&self) -> bool {
        matches!(self, Component::Index(_))
    }

    pub fn is_parent(&self) -> bool {
        matches!(self, Component::Name(name) if name == PARENT_ID)
    }

    pub fn to_parent() -> Component {
        Component::Name(PARENT_ID.to_string())
    }

    pub fn index(&self) -> Option<i32> {
        match self {
            Component::Index(i) => Some(*i),
            Component::Name(_) => None,
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            Component::Index(_) => None,
            Component::Name(name) => Some(name),
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Component::Index(i) => write!(f, "{}", i),
            Component::Name(name) => write!(f, "{}", name),
        }
    }
}

/// A path into the content tree, absolute (from the root) or relative.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Path {
    components: Vec<Component>,
    is_relative: bool,
}

impl Path {
    pub fn new(components: Vec<Component>, is_relative: bool) -> Path {
        Path { components, is_relative }
    }

    /// The empty relative path, addressing the object itself.
    pub fn self_path() -> Path {
        Path { components: Vec::new(), is_relative: true }
    }

    /// Parse the dotted string form. A leading `.` marks a relative path;
    /// integer components may carry a sign.
    pub fn from_components_string(text: &str) -> Path {
        let mut path = Path::default();
        if text.is_empty() {
            return path;
        }
        let mut body = text;
        if let Some(rest) = body.strip_prefix('.') {
            path.is_relative = true;
            body = rest;
        }
        for part in body.split('.') {
            if is_integer_component(part) {
                // "Infinity" survives from older writers as a terminal index.
                let index = part.trim_start_matches('+').parse::<i32>().unwrap_or(i32::MAX);
                path.components.push(Component::Index(index));
            } else {
                path.components.push(Component::Name(part.to_string()));
            }
        }
        path
    }

    pub fn is_relative(&self) -> bool {
        self.is_relative
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn component(&self, index: usize) -> &Component {
        &self.components[index]
    }

    pub fn components(&self) -> &[Component] {
        &self.components
    }

    pub fn head(&self) -> Option<&Component> {
        self.components.first()
    }

    /// Everything after the head; the self path when one component or fewer
    /// remains.
    pub fn tail(&self) -> Path {
        if self.components.len() >= 2 {
            Path::new(self.components[1..].to_vec(), false)
        } else {
            Path::self_path()
        }
    }

    pub fn last_component(&self) -> Option<&Component> {
        self.components.last()
    }

    pub fn contains_named_component(&self) -> bool {
        self.components.iter().any(|c| !c.is_index())
    }

    /// Append another path, resolving its leading parent components by
    /// popping trailing components off this one.
    pub fn path_by_appending_path(&self, to_append: &Path) -> Path {
        let upward_moves = to_append
            .components
            .iter()
            .take_while(|c| c.is_parent())
            .count();

        let mut components = Vec::with_capacity(
            self.components.len().saturating_sub(upward_moves) + to_append.components.len()
                - upward_moves,
        );
        let keep = self.components.len().saturating_sub(upward_moves);
        components.extend_from_slice(&self.components[..keep]);
        components.extend_from_slice(&to_append.components[upward_moves..]);
        Path::new(components, false)
    }

    pub fn path_by_appending_component(&self, component: Component) -> Path {
        let mut components = self.components.clone();
        components.push(component);
        Path::new(components, false)
    }

    /// The dotted string form, with a leading `.` when relative.
    pub fn components_string(&self) -> String {
        let joined = self
            .components
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(".");
        if self.is_relative {
            format!(".{}", joined)
        } else {
            joined
        }
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.components_string())
    }
}

fn is_integer_component(part: &str) -> bool {
    if part == "Infinity" {
        return true;
    }
    let digits = part.strip_prefix('-').or_else(|| part.strip_prefix('+')).unwrap_or(part);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_absolute_path() {
        let path = Path::from_components_string("knot.stitch.3");
        assert!(!path.is_relative());
        assert_eq!(path.len(), 3);
        assert_eq!(path.component(0), &Component::Name("knot".to_string()));
        assert_eq!(path.component(2), &Component::Index(3));
        assert_eq!(path.components_string(), "knot.stitch.3");
    }

    #[test]
    fn test_parse_relative_path() {
        let path = Path::from_components_string(".^.^.5");
        assert!(path.is_relative());
        assert_eq!(path.len(), 3);
        assert!(path.component(0).is_parent());
        assert_eq!(path.components_string(), ".^.^.5");
    }

    #[test]
    fn test_append_resolves_parent_components() {
        let base = Path::from_components_string("a.b.c");
        let relative = Path::from_components_string(".^.^.d");
        let joined = base.path_by_appending_path(&relative);
        assert_eq!(joined.components_string(), "a.d");
    }

    #[test]
    fn test_append_plain_path() {
        let base = Path::from_components_string("a.b");
        let other = Path::from_components_string("c.0");
        assert_eq!(base.path_by_appending_path(&other).components_string(), "a.b.c.0");
    }

    #[test]
    fn test_tail() {
        let path = Path::from_components_string("a.b.c");
        assert_eq!(path.tail().components_string(), "b.c");
        let single = Path::from_components_string("a");
        assert!(single.tail().is_relative());
        assert!(single.tail().is_empty());
    }

    #[test]
    fn test_equality() {
        let a = Path::from_components_string("x.1");
        let b = Path::from_components_string("x.1");
        let c = Path::from_components_string(".x.1");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
