//! Selection policy: which entries and which attributes a scan or export
//! exposes.
//!
//! Entry inclusion evaluates in a fixed order — exclude-branches,
//! include-branches, exclude-filters, include-filters — with early return
//! at the first deciding rule. Both predicates are pure; calling them twice
//! with the same inputs yields the same answer.

use std::collections::BTreeSet;

use kestrel_common::config::{DereferencePolicy, SearchScope};
use kestrel_common::dn::Dn;
use kestrel_common::entry::{normalize_attr_name, Entry};
use kestrel_common::filter::Filter;
use kestrel_common::matching;
use kestrel_common::schema::SchemaProvider;

/// Operational attributes maintained by the server rather than the user.
/// Excluded when `include_operational_attributes` is off.
const OPERATIONAL_ATTRIBUTES: &[&str] = &[
    "creatorsname",
    "createtimestamp",
    "modifiersname",
    "modifytimestamp",
    "entryuuid",
    "subschemasubentry",
];

/// Per-request inclusion/exclusion rules. Constructed per request,
/// read-only during its use, discarded afterwards.
#[derive(Debug, Clone, Default)]
pub struct SelectionPolicy {
    /// Entries under any of these branches are rejected.
    pub exclude_branches: Vec<Dn>,
    /// When non-empty, only entries under one of these branches pass.
    pub include_branches: Vec<Dn>,
    /// Entries matching any of these are rejected. Checked in order.
    pub exclude_filters: Vec<Filter>,
    /// When non-empty, only entries matching one of these pass.
    pub include_filters: Vec<Filter>,
    /// Attribute types stripped from every exposed entry.
    pub exclude_attributes: BTreeSet<String>,
    /// When non-empty, the exhaustive set of exposed attribute types.
    pub include_attributes: BTreeSet<String>,
    /// Expose attribute types without values.
    pub types_only: bool,
    pub include_object_classes: bool,
    pub include_operational_attributes: bool,
    /// 0 = unlimited.
    pub size_limit: usize,
    /// 0 = unlimited.
    pub time_limit_ms: u64,
    pub deref: DereferencePolicy,
    pub scope: SearchScope,
}

impl SelectionPolicy {
    pub fn new() -> Self {
        Self {
            include_object_classes: true,
            include_operational_attributes: true,
            ..Self::default()
        }
    }

    pub fn exclude_branch(mut self, dn: Dn) -> Self {
        self.exclude_branches.push(dn);
        self
    }

    pub fn include_branch(mut self, dn: Dn) -> Self {
        self.include_branches.push(dn);
        self
    }

    pub fn exclude_filter(mut self, filter: Filter) -> Self {
        self.exclude_filters.push(filter);
        self
    }

    pub fn include_filter(mut self, filter: Filter) -> Self {
        self.include_filters.push(filter);
        self
    }

    pub fn exclude_attribute(mut self, name: &str) -> Self {
        self.exclude_attributes.insert(normalize_attr_name(name));
        self
    }

    pub fn include_attribute(mut self, name: &str) -> Self {
        self.include_attributes.insert(normalize_attr_name(name));
        self
    }

    /// Whether `entry` passes the branch and filter rules.
    pub fn includes_entry(&self, entry: &Entry, schema: &dyn SchemaProvider) -> bool {
        let dn = entry.dn();

        if self.exclude_branches.iter().any(|b| b.is_ancestor_of(dn)) {
            return false;
        }
        if !self.include_branches.is_empty()
            && !self.include_branches.iter().any(|b| b.is_ancestor_of(dn))
        {
            return false;
        }
        if self
            .exclude_filters
            .iter()
            .any(|f| matching::matches(f, entry, schema))
        {
            return false;
        }
        if !self.include_filters.is_empty()
            && !self
                .include_filters
                .iter()
                .any(|f| matching::matches(f, entry, schema))
        {
            return false;
        }
        true
    }

    /// Whether attribute `name` is exposed.
    pub fn includes_attribute(&self, name: &str) -> bool {
        let norm = normalize_attr_name(name);
        if norm == "objectclass" {
            return self.include_object_classes && !self.exclude_attributes.contains(&norm);
        }
        if !self.include_operational_attributes && OPERATIONAL_ATTRIBUTES.contains(&norm.as_str())
        {
            return false;
        }
        if self.exclude_attributes.contains(&norm) {
            return false;
        }
        if !self.include_attributes.is_empty() {
            return self.include_attributes.contains(&norm);
        }
        true
    }

    /// Apply the attribute rules (and types-only) to an entry, producing
    /// the exposed view.
    pub fn project(&self, entry: &Entry) -> Entry {
        let mut out = Entry::new(entry.dn().clone());
        for attr in entry.attributes() {
            if !self.includes_attribute(attr.name()) {
                continue;
            }
            for value in attr.values() {
                out.add_value(attr.name(), value.clone());
            }
        }
        if self.types_only {
            out.types_only_view()
        } else {
            out
        }
    }
}
