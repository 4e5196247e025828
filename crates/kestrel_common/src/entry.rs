//! Directory entry: a DN plus attribute-typed values.
//!
//! Attribute types are case-insensitive (stored under a lowercase key, first
//! writer's casing preserved for display). Values keep insertion order;
//! duplicate values are rejected under normalized comparison. Entries handed
//! out of the store are `Arc` snapshots and are never mutated in place.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::dn::Dn;

/// Case-insensitive attribute identifier, normalized lowercase.
pub fn normalize_attr_name(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}

/// One attribute: display name plus its values in insertion order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attribute {
    name: String,
    values: Vec<String>,
}

impl Attribute {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            values: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn values(&self) -> &[String] {
        &self.values
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn contains(&self, value: &str) -> bool {
        let needle = value.trim().to_lowercase();
        self.values.iter().any(|v| v.trim().to_lowercase() == needle)
    }

    /// Append a value unless an equal one (case-insensitive, trimmed) is
    /// already present. Returns whether the value was added.
    pub fn push_value(&mut self, value: impl Into<String>) -> bool {
        let value = value.into();
        if self.contains(&value) {
            return false;
        }
        self.values.push(value);
        true
    }

    pub fn remove_value(&mut self, value: &str) -> bool {
        let needle = value.trim().to_lowercase();
        let before = self.values.len();
        self.values.retain(|v| v.trim().to_lowercase() != needle);
        self.values.len() != before
    }
}

/// A named record in the directory tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    dn: Dn,
    /// Keyed by normalized attribute name; BTreeMap for deterministic
    /// iteration order in serialization and scans.
    attrs: BTreeMap<String, Attribute>,
}

impl Entry {
    pub fn new(dn: Dn) -> Self {
        Self {
            dn,
            attrs: BTreeMap::new(),
        }
    }

    /// Builder-style helper for tests and import paths.
    pub fn with_attr(mut self, name: &str, values: &[&str]) -> Self {
        for v in values {
            self.add_value(name, *v);
        }
        self
    }

    pub fn dn(&self) -> &Dn {
        &self.dn
    }

    /// Replace the DN, keeping attributes. Used by the ModifyDN commit path.
    pub fn with_dn(mut self, dn: Dn) -> Self {
        self.dn = dn;
        self
    }

    pub fn attributes(&self) -> impl Iterator<Item = &Attribute> {
        self.attrs.values()
    }

    pub fn attribute_count(&self) -> usize {
        self.attrs.len()
    }

    pub fn get(&self, name: &str) -> Option<&Attribute> {
        self.attrs.get(&normalize_attr_name(name))
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        self.get(name).map(|a| !a.is_empty()).unwrap_or(false)
    }

    pub fn values(&self, name: &str) -> &[String] {
        self.get(name).map(Attribute::values).unwrap_or(&[])
    }

    pub fn add_value(&mut self, name: &str, value: impl Into<String>) -> bool {
        self.attrs
            .entry(normalize_attr_name(name))
            .or_insert_with(|| Attribute::new(name.trim()))
            .push_value(value)
    }

    /// Remove one value; drops the attribute when its last value goes.
    pub fn remove_value(&mut self, name: &str, value: &str) -> bool {
        let key = normalize_attr_name(name);
        let Some(attr) = self.attrs.get_mut(&key) else {
            return false;
        };
        let removed = attr.remove_value(value);
        if attr.is_empty() {
            self.attrs.remove(&key);
        }
        removed
    }

    pub fn remove_attribute(&mut self, name: &str) -> bool {
        self.attrs.remove(&normalize_attr_name(name)).is_some()
    }

    pub fn replace_values(&mut self, name: &str, values: Vec<String>) {
        let key = normalize_attr_name(name);
        if values.is_empty() {
            self.attrs.remove(&key);
            return;
        }
        let mut attr = Attribute::new(name.trim());
        for v in values {
            attr.push_value(v);
        }
        self.attrs.insert(key, attr);
    }

    /// Projection carrying attribute types but no values, for types-only
    /// searches and exports.
    pub fn types_only_view(&self) -> Entry {
        let mut view = Entry::new(self.dn.clone());
        for attr in self.attrs.values() {
            view.attrs
                .insert(normalize_attr_name(attr.name()), Attribute::new(attr.name()));
        }
        view
    }

    /// Derived object-class set, lowercased.
    pub fn object_classes(&self) -> BTreeSet<String> {
        self.values("objectclass")
            .iter()
            .map(|v| v.trim().to_ascii_lowercase())
            .collect()
    }
}

/// Attribute-for-attribute equality with multi-valued order ignored.
/// This is the round-trip contract for export followed by import.
impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        if self.dn != other.dn || self.attrs.len() != other.attrs.len() {
            return false;
        }
        self.attrs.iter().all(|(key, attr)| {
            other.attrs.get(key).is_some_and(|theirs| {
                let mut a: Vec<&String> = attr.values.iter().collect();
                let mut b: Vec<&String> = theirs.values.iter().collect();
                a.sort_unstable();
                b.sort_unstable();
                a == b
            })
        })
    }
}
impl Eq for Entry {}
