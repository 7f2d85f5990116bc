//! Entity key extraction and deduplication
//!
//! This is the only place entity ids are deduplicated. Every id it emits is
//! looked up exactly once by the enricher.

use std::collections::HashMap;

use crate::models::Item;

/// How display names are kept when the same id appears more than once
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NamePolicy {
    /// Keep the first name seen for each id
    #[default]
    FirstSeen,
    /// Keep every distinct name, in first-seen order
    AllDistinct,
}

impl std::str::FromStr for NamePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "first" | "first_seen" => Ok(Self::FirstSeen),
            "all" | "all_distinct" => Ok(Self::AllDistinct),
            other => Err(format!("expected 'first_seen' or 'all_distinct', got '{}'", other)),
        }
    }
}

/// Unique entity ids in first-insertion order, with their observed names
#[derive(Debug, Clone, Default)]
pub struct EntityIndex {
    ids: Vec<String>,
    names: HashMap<String, Vec<String>>,
}

impl EntityIndex {
    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.names.contains_key(id)
    }

    /// First recorded name for `id`
    pub fn name(&self, id: &str) -> Option<&str> {
        self.names.get(id).and_then(|n| n.first()).map(String::as_str)
    }

    /// Every recorded name for `id`
    pub fn names(&self, id: &str) -> &[String] {
        self.names.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    fn insert(&mut self, id: &str, name: Option<&str>, policy: NamePolicy) {
        if !self.names.contains_key(id) {
            self.ids.push(id.to_string());
            self.names.insert(id.to_string(), Vec::new());
        }

        let (Some(name), Some(names)) = (name, self.names.get_mut(id)) else {
            return;
        };
        match policy {
            // A later occurrence only fills the gap when the first had no name
            NamePolicy::FirstSeen if names.is_empty() => names.push(name.to_string()),
            NamePolicy::FirstSeen => {},
            NamePolicy::AllDistinct if !names.iter().any(|n| n == name) => {
                names.push(name.to_string())
            },
            NamePolicy::AllDistinct => {},
        }
    }
}

/// Walk every item once and collect its entity references by id
pub fn extract_keys(items: &[Item], policy: NamePolicy) -> EntityIndex {
    let mut index = EntityIndex::default();

    for item in items {
        for entity in &item.refs {
            index.insert(&entity.id, entity.name.as_deref(), policy);
        }
    }

    tracing::info!(
        items = items.len(),
        unique_entities = index.len(),
        "Extracted unique entity keys"
    );

    index
}
