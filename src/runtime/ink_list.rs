//! Ink Lists
//!
//! A list value is a set of (item, integer) pairs drawn from one or more
//! named list definitions (origins). Lists support the set algebra and
//! ordering operations exposed by the LIST_* builtins and the native
//! operators.

use std::fmt;

use indexmap::IndexMap;

use crate::runtime::list_definition::ListDefinitionsOrigin;

/// One entry of a list: `origin.item`. Either part may be missing while a
/// value is under construction or parsed from an older save.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct InkListItem {
    pub origin_name: Option<String>,
    pub item_name: Option<String>,
}

impl InkListItem {
    pub fn new(origin_name: Option<String>, item_name: Option<String>) -> InkListItem {
        InkListItem { origin_name, item_name }
    }

    /// Parse a `origin.item` full name; a bare name has no origin.
    pub fn from_full_name(full_name: &str) -> InkListItem {
        let mut parts = full_name.splitn(2, '.');
        let first = parts.next().unwrap_or("");
        match parts.next() {
            Some(item) => InkListItem {
                origin_name: Some(first.to_string()),
                item_name: Some(item.to_string()),
            },
            None => InkListItem {
                origin_name: Some(first.to_string()),
                item_name: None,
            },
        }
    }

    pub fn is_null(&self) -> bool {
        self.origin_name.is_none() && self.item_name.is_none()
    }

    pub fn full_name(&self) -> String {
        format!(
            "{}.{}",
            self.origin_name.as_deref().unwrap_or("?"),
            self.item_name.as_deref().unwrap_or("None")
        )
    }
}

impl fmt::Display for InkListItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.full_name())
    }
}

/// A set of list items with integer values, plus the names of the origin
/// definitions the items (or an empty list) were drawn from.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InkList {
    items: IndexMap<InkListItem, i32>,
    initial_origin_names: Vec<String>,
}

impl InkList {
    pub fn new() -> InkList {
        InkList::default()
    }

    pub fn from_single_item(item: InkListItem, value: i32) -> InkList {
        let mut list = InkList::new();
        list.items.insert(item, value);
        list
    }

    pub fn insert(&mut self, item: InkListItem, value: i32) {
        self.items.insert(item, value);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&InkListItem, i32)> {
        self.items.iter().map(|(k, v)| (k, *v))
    }

    pub fn contains_item(&self, item: &InkListItem) -> bool {
        self.items.contains_key(item)
    }

    pub fn contains_item_named(&self, item_name: &str) -> bool {
        self.items.keys().any(|k| k.item_name.as_deref() == Some(item_name))
    }

    /// Origin names of the current items, or the remembered initial origins
    /// for an empty list.
    pub fn origin_names(&self) -> Vec<String> {
        if !self.items.is_empty() {
            self.items
                .keys()
                .filter_map(|k| k.origin_name.clone())
                .collect()
        } else {
            self.initial_origin_names.clone()
        }
    }

    pub fn set_initial_origin_name(&mut self, origin_name: &str) {
        self.initial_origin_names = vec![origin_name.to_string()];
    }

    pub fn set_initial_origin_names(&mut self, origin_names: Vec<String>) {
        self.initial_origin_names = origin_names;
    }

    pub fn max_item(&self) -> Option<(&InkListItem, i32)> {
        self.items
            .iter()
            .fold(None, |best: Option<(&InkListItem, i32)>, (item, value)| match best {
                Some((_, best_value)) if *value <= best_value => best,
                _ => Some((item, *value)),
            })
    }

    pub fn min_item(&self) -> Option<(&InkListItem, i32)> {
        self.items
            .iter()
            .fold(None, |best: Option<(&InkListItem, i32)>, (item, value)| match best {
                Some((_, best_value)) if *value >= best_value => best,
                _ => Some((item, *value)),
            })
    }

    pub fn union(&self, other: &InkList) -> InkList {
        let mut result = self.clone();
        for (item, value) in other.iter() {
            result.items.insert(item.clone(), value);
        }
        result
    }

    pub fn intersect(&self, other: &InkList) -> InkList {
        let mut result = InkList::new();
        for (item, value) in self.iter() {
            if other.contains_item(item) {
                result.items.insert(item.clone(), value);
            }
        }
        result
    }

    pub fn without(&self, to_remove: &InkList) -> InkList {
        let mut result = self.clone();
        for item in to_remove.items.keys() {
            result.items.shift_remove(item);
        }
        result
    }

    /// True when every item of `other` is present here. Two empty operands
    /// never contain each other.
    pub fn contains_list(&self, other: &InkList) -> bool {
        if other.is_empty() || self.is_empty() {
            return false;
        }
        other.items.keys().all(|item| self.contains_item(item))
    }

    pub fn greater_than(&self, other: &InkList) -> bool {
        if self.is_empty() {
            return false;
        }
        if other.is_empty() {
            return true;
        }
        self.min_item().map(|(_, v)| v) > other.max_item().map(|(_, v)| v)
    }

    pub fn greater_than_or_equals(&self, other: &InkList) -> bool {
        if self.is_empty() {
            return false;
        }
        if other.is_empty() {
            return true;
        }
        let (self_min, self_max) = (self.min_item().map(|(_, v)| v), self.max_item().map(|(_, v)| v));
        let (other_min, other_max) = (other.min_item().map(|(_, v)| v), other.max_item().map(|(_, v)| v));
        self_min >= other_min && self_max >= other_max
    }

    pub fn less_than(&self, other: &InkList) -> bool {
        if other.is_empty() {
            return false;
        }
        if self.is_empty() {
            return true;
        }
        self.max_item().map(|(_, v)| v) < other.min_item().map(|(_, v)| v)
    }

    pub fn less_than_or_equals(&self, other: &InkList) -> bool {
        if other.is_empty() {
            return false;
        }
        if self.is_empty() {
            return true;
        }
        let (self_min, self_max) = (self.min_item().map(|(_, v)| v), self.max_item().map(|(_, v)| v));
        let (other_min, other_max) = (other.min_item().map(|(_, v)| v), other.max_item().map(|(_, v)| v));
        self_max <= other_max && self_min <= other_min
    }

    /// Key-set equality; values are implied by the origins.
    pub fn list_equals(&self, other: &InkList) -> bool {
        if self.len() != other.len() {
            return false;
        }
        self.items.keys().all(|item| other.contains_item(item))
    }

    pub fn max_as_list(&self) -> InkList {
        match self.max_item() {
            Some((item, value)) => InkList::from_single_item(item.clone(), value),
            None => InkList::new(),
        }
    }

    pub fn min_as_list(&self) -> InkList {
        match self.min_item() {
            Some((item, value)) => InkList::from_single_item(item.clone(), value),
            None => InkList::new(),
        }
    }

    /// Items present in the origin definitions but not in this list.
    pub fn inverse(&self, defs: &ListDefinitionsOrigin) -> InkList {
        let mut result = InkList::new();
        for origin_name in self.origin_names() {
            if let Some(def) = defs.definition(&origin_name) {
                for (item, value) in def.items() {
                    if !self.contains_item(&item) {
                        result.items.insert(item, value);
                    }
                }
            }
        }
        result
    }

    /// The union of the full origin definitions.
    pub fn all(&self, defs: &ListDefinitionsOrigin) -> InkList {
        let mut result = InkList::new();
        for origin_name in self.origin_names() {
            if let Some(def) = defs.definition(&origin_name) {
                for (item, value) in def.items() {
                    result.items.insert(item, value);
                }
            }
        }
        result
    }

    /// The sub-list whose item values fall in `[min_value, max_value]`,
    /// keeping this list's origins.
    pub fn list_with_sub_range(&self, min_value: i32, max_value: i32) -> InkList {
        if self.is_empty() {
            return InkList::new();
        }
        let mut result = InkList::new();
        result.set_initial_origin_names(self.origin_names());
        for (item, value) in self.ordered_items() {
            if value >= min_value && value <= max_value {
                result.items.insert(item, value);
            }
        }
        result
    }

    /// Items sorted by `(value, origin_name)`.
    pub fn ordered_items(&self) -> Vec<(InkListItem, i32)> {
        let mut ordered: Vec<(InkListItem, i32)> =
            self.items.iter().map(|(k, v)| (k.clone(), *v)).collect();
        ordered.sort_by(|a, b| {
            let a_key = (a.1, a.0.origin_name.as_deref().unwrap_or(""));
            let b_key = (b.1, b.0.origin_name.as_deref().unwrap_or(""));
            a_key.cmp(&b_key)
        });
        ordered
    }

    pub fn single_item(&self) -> Option<InkListItem> {
        self.ordered_items().into_iter().next().map(|(item, _)| item)
    }
}

impl fmt::Display for InkList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self
            .ordered_items()
            .into_iter()
            .map(|(item, _)| item.item_name.unwrap_or_default())
            .collect();
        write!(f, "{}", names.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::list_definition::ListDefinition;

    fn item(origin: &str, name: &str) -> InkListItem {
        InkListItem::new(Some(origin.to_string()), Some(name.to_string()))
    }

    fn abc() -> InkList {
        let mut list = InkList::new();
        list.insert(item("letters", "a"), 1);
        list.insert(item("letters", "b"), 2);
        list.insert(item("letters", "c"), 3);
        list
    }

    #[test]
    fn test_union_and_without() {
        let mut other = InkList::new();
        other.insert(item("letters", "c"), 3);
        other.insert(item("letters", "d"), 4);

        let union = abc().union(&other);
        assert_eq!(union.len(), 4);

        let without = abc().without(&other);
        assert_eq!(without.len(), 2);
        assert!(without.contains_item_named("a"));
        assert!(!without.contains_item_named("c"));
    }

    #[test]
    fn test_intersect() {
        let mut other = InkList::new();
        other.insert(item("letters", "b"), 2);
        other.insert(item("letters", "z"), 26);
        let intersection = abc().intersect(&other);
        assert_eq!(intersection.len(), 1);
        assert!(intersection.contains_item_named("b"));
    }

    #[test]
    fn test_ordering_comparisons() {
        let low = InkList::from_single_item(item("letters", "a"), 1);
        let high = InkList::from_single_item(item("letters", "z"), 26);
        assert!(high.greater_than(&low));
        assert!(low.less_than(&high));
        assert!(!low.greater_than(&high));
        assert!(low.less_than_or_equals(&low.clone()));
    }

    #[test]
    fn test_sub_range() {
        let sub = abc().list_with_sub_range(2, 3);
        assert_eq!(sub.len(), 2);
        assert!(!sub.contains_item_named("a"));
    }

    #[test]
    fn test_inverse() {
        let defs = ListDefinitionsOrigin::new(vec![ListDefinition::new(
            "letters",
            vec![
                ("a".to_string(), 1),
                ("b".to_string(), 2),
                ("c".to_string(), 3),
                ("d".to_string(), 4),
            ],
        )]);
        let list = InkList::from_single_item(item("letters", "b"), 2);
        let inverse = list.inverse(&defs);
        assert_eq!(inverse.len(), 3);
        assert!(inverse.contains_item_named("d"));
        assert!(!inverse.contains_item_named("b"));
    }

    #[test]
    fn test_display_orders_by_value() {
        let mut list = InkList::new();
        list.insert(item("letters", "c"), 3);
        list.insert(item("letters", "a"), 1);
        assert_eq!(list.to_string(), "a, c");
    }

    #[test]
    fn test_empty_list_keeps_initial_origins() {
        let mut list = InkList::new();
        list.set_initial_origin_name("letters");
        assert_eq!(list.origin_names(), vec!["letters".to_string()]);
    }
}
