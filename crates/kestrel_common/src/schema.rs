//! Schema collaborator seam.
//!
//! The core never hard-codes matching semantics: attribute equality,
//! ordering, substring and approximate matching all route through a
//! `SchemaProvider`. `CoreSchema` is the default: case-insensitive,
//! whitespace-collapsed string semantics with numeric-aware ordering.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use crate::entry::Entry;

/// Pluggable matching rule for extensible-match filter leaves.
pub trait MatchingRule: Send + Sync {
    fn name(&self) -> &str;
    fn matches(&self, attribute_value: &str, assertion: &str) -> bool;
}

/// Attribute comparison semantics supplied to the filter evaluator and the
/// entry store. Implementations must be pure: same inputs, same answer.
pub trait SchemaProvider: Send + Sync {
    /// Equality under the attribute's matching semantics.
    fn equals(&self, attr: &str, a: &str, b: &str) -> bool;

    /// Ordering for >= / <= leaves. `None` means the values are not
    /// comparable under this attribute's syntax; the leaf then fails.
    fn compare(&self, attr: &str, a: &str, b: &str) -> Option<Ordering>;

    /// Substring match with optional initial/final anchors and ordered
    /// middle fragments.
    fn matches_substring(
        &self,
        attr: &str,
        value: &str,
        initial: Option<&str>,
        any: &[String],
        final_part: Option<&str>,
    ) -> bool;

    /// Approximate ("sounds like") match. The default schema treats this as
    /// equality with all whitespace stripped.
    fn approx_equals(&self, attr: &str, a: &str, b: &str) -> bool;

    /// Resolve an extensible-match rule by identifier.
    fn extensible_rule(&self, rule_id: &str) -> Option<Arc<dyn MatchingRule>>;

    /// Attribute-level pass/fail check invoked by the pipeline before a
    /// Modify commits. The core does not define schema policy; the default
    /// accepts everything.
    fn validate_entry(&self, _entry: &Entry) -> Result<(), String> {
        Ok(())
    }
}

/// Lowercase and collapse internal whitespace runs to a single space.
pub(crate) fn normalize_value(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut pending = false;
    for c in s.trim().chars() {
        if c.is_whitespace() {
            pending = true;
            continue;
        }
        if pending && !out.is_empty() {
            out.push(' ');
        }
        pending = false;
        for lc in c.to_lowercase() {
            out.push(lc);
        }
    }
    out
}

/// Default schema: case-insensitive string matching, numeric-aware ordering.
#[derive(Default)]
pub struct CoreSchema {
    rules: HashMap<String, Arc<dyn MatchingRule>>,
}

impl CoreSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an extensible matching rule under its identifier.
    pub fn with_rule(mut self, rule: Arc<dyn MatchingRule>) -> Self {
        self.rules.insert(rule.name().to_ascii_lowercase(), rule);
        self
    }
}

impl SchemaProvider for CoreSchema {
    fn equals(&self, _attr: &str, a: &str, b: &str) -> bool {
        normalize_value(a) == normalize_value(b)
    }

    fn compare(&self, _attr: &str, a: &str, b: &str) -> Option<Ordering> {
        // Numeric syntaxes compare numerically; everything else falls back
        // to normalized lexicographic order.
        if let (Ok(x), Ok(y)) = (a.trim().parse::<i64>(), b.trim().parse::<i64>()) {
            return Some(x.cmp(&y));
        }
        if let (Ok(x), Ok(y)) = (a.trim().parse::<f64>(), b.trim().parse::<f64>()) {
            return x.partial_cmp(&y);
        }
        Some(normalize_value(a).cmp(&normalize_value(b)))
    }

    fn matches_substring(
        &self,
        _attr: &str,
        value: &str,
        initial: Option<&str>,
        any: &[String],
        final_part: Option<&str>,
    ) -> bool {
        let haystack = normalize_value(value);
        let mut pos = 0;

        if let Some(prefix) = initial {
            let prefix = normalize_value(prefix);
            if !haystack.starts_with(&prefix) {
                return false;
            }
            pos = prefix.len();
        }

        for fragment in any {
            let fragment = normalize_value(fragment);
            match haystack[pos..].find(&fragment) {
                Some(found) => pos += found + fragment.len(),
                None => return false,
            }
        }

        if let Some(suffix) = final_part {
            let suffix = normalize_value(suffix);
            return haystack.len() >= pos + suffix.len() && haystack.ends_with(&suffix);
        }
        true
    }

    fn approx_equals(&self, _attr: &str, a: &str, b: &str) -> bool {
        let strip = |s: &str| {
            s.chars()
                .filter(|c| !c.is_whitespace())
                .flat_map(char::to_lowercase)
                .collect::<String>()
        };
        strip(a) == strip(b)
    }

    fn extensible_rule(&self, rule_id: &str) -> Option<Arc<dyn MatchingRule>> {
        self.rules.get(&rule_id.to_ascii_lowercase()).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_normalizes_case_and_whitespace() {
        let s = CoreSchema::new();
        assert!(s.equals("cn", "Bob  Smith", "bob smith"));
        assert!(!s.equals("cn", "Bob Smith", "Bob Smyth"));
    }

    #[test]
    fn compare_is_numeric_aware() {
        let s = CoreSchema::new();
        assert_eq!(s.compare("uidNumber", "9", "10"), Some(Ordering::Less));
        assert_eq!(s.compare("cn", "abc", "ABD"), Some(Ordering::Less));
    }

    #[test]
    fn substring_anchors_and_fragments() {
        let s = CoreSchema::new();
        // (cn=Bo*Sm*th)
        assert!(s.matches_substring("cn", "Bob Smith", Some("bo"), &["sm".into()], Some("th")));
        assert!(!s.matches_substring("cn", "Bob Smith", Some("ob"), &[], None));
        assert!(s.matches_substring("cn", "Bob Smith", None, &["b sm".into()], None));
        // Fragments must appear in order without overlap.
        assert!(!s.matches_substring("cn", "ab", None, &["b".into(), "a".into()], None));
    }

    #[test]
    fn approx_ignores_all_whitespace() {
        let s = CoreSchema::new();
        assert!(s.approx_equals("cn", "Bob Smith", "bobsmith"));
    }

    struct CaseExact;
    impl MatchingRule for CaseExact {
        fn name(&self) -> &str {
            "caseExactMatch"
        }
        fn matches(&self, attribute_value: &str, assertion: &str) -> bool {
            attribute_value == assertion
        }
    }

    #[test]
    fn extensible_rules_resolve_by_name() {
        let s = CoreSchema::new().with_rule(Arc::new(CaseExact));
        assert!(s.extensible_rule("caseexactmatch").is_some());
        assert!(s.extensible_rule("unknown").is_none());
    }
}
