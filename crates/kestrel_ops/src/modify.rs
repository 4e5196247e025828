//! Value-level modifications applied by the Modify operation.
//!
//! The apply step computes a fresh entry from the current snapshot; the
//! commit step swaps it in with a compare-and-swap. Nothing here touches
//! the store.

use serde::{Deserialize, Serialize};

use kestrel_common::entry::Entry;
use kestrel_common::error::PipelineError;

/// One attribute-level change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Modification {
    /// Add values; adding a value the attribute already holds fails.
    AddValues { attr: String, values: Vec<String> },
    /// Delete specific values, or the whole attribute when `values` is
    /// empty. Deleting a value the attribute does not hold fails.
    DeleteValues { attr: String, values: Vec<String> },
    /// Replace the attribute's value set; an empty set removes the
    /// attribute. Always succeeds on a well-formed entry.
    Replace { attr: String, values: Vec<String> },
}

/// Compute the post-modification entry. Pure: the input snapshot is not
/// touched, and a failure leaves no observable effect.
pub fn apply_modifications(
    current: &Entry,
    mods: &[Modification],
) -> Result<Entry, PipelineError> {
    let mut next = current.clone();
    for m in mods {
        match m {
            Modification::AddValues { attr, values } => {
                for value in values {
                    if !next.add_value(attr, value.clone()) {
                        return Err(PipelineError::ModificationFailed(format!(
                            "attribute '{attr}' already holds value '{value}'"
                        )));
                    }
                }
            }
            Modification::DeleteValues { attr, values } => {
                if values.is_empty() {
                    if !next.remove_attribute(attr) {
                        return Err(PipelineError::ModificationFailed(format!(
                            "attribute '{attr}' does not exist"
                        )));
                    }
                } else {
                    for value in values {
                        if !next.remove_value(attr, value) {
                            return Err(PipelineError::ModificationFailed(format!(
                                "attribute '{attr}' does not hold value '{value}'"
                            )));
                        }
                    }
                }
            }
            Modification::Replace { attr, values } => {
                next.replace_values(attr, values.clone());
            }
        }
    }
    Ok(next)
}
