//! Filter evaluation against a single entry.
//!
//! `matches` is pure and total for well-formed input: it never errors and
//! never mutates the entry or the filter. A leaf referencing an attribute
//! the entry does not carry evaluates to false. All value-level comparison
//! is delegated to the schema collaborator.

use crate::entry::Entry;
use crate::filter::Filter;
use crate::schema::SchemaProvider;

/// Evaluate `filter` against `entry`.
///
/// AND and OR evaluate children left-to-right and short-circuit; the empty
/// AND is true and the empty OR is false. Leaves use existential semantics:
/// the leaf succeeds if any of the attribute's values matches.
pub fn matches(filter: &Filter, entry: &Entry, schema: &dyn SchemaProvider) -> bool {
    match filter {
        Filter::And(children) => children.iter().all(|c| matches(c, entry, schema)),
        Filter::Or(children) => children.iter().any(|c| matches(c, entry, schema)),
        Filter::Not(child) => !matches(child, entry, schema),

        Filter::Presence { attr } => entry.has_attribute(attr),

        Filter::Equality { attr, value } => entry
            .values(attr)
            .iter()
            .any(|v| schema.equals(attr, v, value)),

        Filter::Substring {
            attr,
            initial,
            any,
            final_part,
        } => entry.values(attr).iter().any(|v| {
            schema.matches_substring(attr, v, initial.as_deref(), any, final_part.as_deref())
        }),

        Filter::GreaterOrEqual { attr, value } => entry
            .values(attr)
            .iter()
            .any(|v| schema.compare(attr, v, value).is_some_and(|o| o.is_ge())),

        Filter::LessOrEqual { attr, value } => entry
            .values(attr)
            .iter()
            .any(|v| schema.compare(attr, v, value).is_some_and(|o| o.is_le())),

        Filter::Approximate { attr, value } => entry
            .values(attr)
            .iter()
            .any(|v| schema.approx_equals(attr, v, value)),

        Filter::ExtensibleMatch { attr, rule, value } => {
            extensible_matches(entry, attr.as_deref(), rule.as_deref(), value, schema)
        }
    }
}

fn extensible_matches(
    entry: &Entry,
    attr: Option<&str>,
    rule: Option<&str>,
    value: &str,
    schema: &dyn SchemaProvider,
) -> bool {
    match rule {
        Some(rule_id) => {
            let Some(rule) = schema.extensible_rule(rule_id) else {
                tracing::debug!(rule = rule_id, "extensible match: unresolvable rule");
                return false;
            };
            match attr {
                Some(attr) => entry.values(attr).iter().any(|v| rule.matches(v, value)),
                // No attribute: the rule is applied across every attribute.
                None => entry
                    .attributes()
                    .any(|a| a.values().iter().any(|v| rule.matches(v, value))),
            }
        }
        // No rule: fall back to the attribute's equality semantics.
        None => match attr {
            Some(attr) => entry
                .values(attr)
                .iter()
                .any(|v| schema.equals(attr, v, value)),
            None => false,
        },
    }
}
