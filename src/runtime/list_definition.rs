//! List Definitions
//!
//! The `listDefs` section of a story document declares named enumerations
//! (origins) mapping item names to integer values. `ListDefinitionsOrigin`
//! indexes them and resolves bare item names to single-item lists.

use std::collections::HashMap;

use indexmap::IndexMap;

use crate::runtime::ink_list::{InkList, InkListItem};

/// One named list definition: item name -> integer value.
#[derive(Debug, Clone)]
pub struct ListDefinition {
    name: String,
    items: IndexMap<String, i32>,
}

impl ListDefinition {
    pub fn new(name: &str, items: Vec<(String, i32)>) -> ListDefinition {
        ListDefinition {
            name: name.to_string(),
            items: items.into_iter().collect(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn items(&self) -> impl Iterator<Item = (InkListItem, i32)> + '_ {
        self.items.iter().map(|(item_name, value)| {
            (
                InkListItem::new(Some(self.name.clone()), Some(item_name.clone())),
                *value,
            )
        })
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, i32)> {
        self.items.iter().map(|(name, value)| (name.as_str(), *value))
    }

    pub fn value_for_item(&self, item: &InkListItem) -> i32 {
        item.item_name
            .as_deref()
            .and_then(|name| self.items.get(name).copied())
            .unwrap_or(0)
    }

    pub fn contains_item(&self, item: &InkListItem) -> bool {
        if item.origin_name.as_deref() != Some(self.name.as_str()) {
            return false;
        }
        item.item_name
            .as_deref()
            .map(|name| self.items.contains_key(name))
            .unwrap_or(false)
    }

    pub fn contains_item_with_name(&self, item_name: &str) -> bool {
        self.items.contains_key(item_name)
    }

    pub fn item_with_value(&self, value: i32) -> Option<InkListItem> {
        self.items.iter().find(|(_, v)| **v == value).map(|(name, _)| {
            InkListItem::new(Some(self.name.clone()), Some(name.clone()))
        })
    }
}

/// All list definitions of a story, with an unambiguous item-name cache so
/// that variable reads and list construction can resolve bare item names.
#[derive(Debug, Clone, Default)]
pub struct ListDefinitionsOrigin {
    lists: IndexMap<String, ListDefinition>,
    single_item_cache: HashMap<String, (InkListItem, i32)>,
}

impl ListDefinitionsOrigin {
    pub fn new(lists: Vec<ListDefinition>) -> ListDefinitionsOrigin {
        let mut origin = ListDefinitionsOrigin::default();
        for def in lists {
            for (item, value) in def.items() {
                let item_name = item.item_name.clone().unwrap_or_default();
                // Both spellings resolve; a later definition with the same
                // bare item name shadows the earlier one, like the original.
                origin
                    .single_item_cache
                    .insert(item_name, (item.clone(), value));
                origin
                    .single_item_cache
                    .insert(item.full_name(), (item, value));
            }
            origin.lists.insert(def.name().to_string(), def);
        }
        origin
    }

    pub fn lists(&self) -> impl Iterator<Item = &ListDefinition> {
        self.lists.values()
    }

    pub fn definition(&self, name: &str) -> Option<&ListDefinition> {
        self.lists.get(name)
    }

    /// A single-item list for a bare `item` or qualified `origin.item` name.
    pub fn find_single_item_list_with_name(&self, name: &str) -> Option<InkList> {
        self.single_item_cache
            .get(name)
            .map(|(item, value)| InkList::from_single_item(item.clone(), *value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn colours() -> ListDefinitionsOrigin {
        ListDefinitionsOrigin::new(vec![ListDefinition::new(
            "colours",
            vec![("red".to_string(), 1), ("green".to_string(), 2), ("blue".to_string(), 3)],
        )])
    }

    #[test]
    fn test_item_with_value() {
        let defs = colours();
        let def = defs.definition("colours").unwrap();
        let item = def.item_with_value(2).unwrap();
        assert_eq!(item.item_name.as_deref(), Some("green"));
        assert!(def.item_with_value(9).is_none());
    }

    #[test]
    fn test_single_item_lookup_by_both_spellings() {
        let defs = colours();
        let bare = defs.find_single_item_list_with_name("blue").unwrap();
        let qualified = defs.find_single_item_list_with_name("colours.blue").unwrap();
        assert!(bare.list_equals(&qualified));
        assert!(defs.find_single_item_list_with_name("colours.mauve").is_none());
    }

    #[test]
    fn test_value_for_item() {
        let defs = colours();
        let def = defs.definition("colours").unwrap();
        let item = InkListItem::new(Some("colours".to_string()), Some("red".to_string()));
        assert_eq!(def.value_for_item(&item), 1);
        assert!(def.contains_item(&item));
    }
}
