//! Field-level patches
//!
//! A [`Patch`] is what a turn wants to change, independent of the snapshot it
//! was computed against. The session manager re-applies the same patch on top
//! of a fresh snapshot after a version conflict, so applying must stay a pure
//! function of `(fields, patch)`.

use crate::store::Fields;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Change to a single field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "op", content = "value")]
pub enum FieldChange {
    /// Set the field to a value
    Set(serde_json::Value),
    /// Remove the field
    Remove,
}

/// Pending changes for one session, keyed by field name
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    changes: BTreeMap<String, FieldChange>,
}

impl Patch {
    /// Create an empty patch
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: set a field
    #[must_use]
    pub fn with(mut self, field: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.set(field, value);
        self
    }

    /// Builder: remove a field
    #[must_use]
    pub fn without(mut self, field: impl Into<String>) -> Self {
        self.remove(field);
        self
    }

    /// Set a field (a later change to the same field wins)
    pub fn set(&mut self, field: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.changes
            .insert(field.into(), FieldChange::Set(value.into()));
    }

    /// Remove a field
    pub fn remove(&mut self, field: impl Into<String>) {
        self.changes.insert(field.into(), FieldChange::Remove);
    }

    /// Fold another patch into this one; `other` wins per field
    pub fn merge(&mut self, other: Patch) {
        self.changes.extend(other.changes);
    }

    /// Apply to a field map
    pub fn apply_to(&self, fields: &mut Fields) {
        for (field, change) in &self.changes {
            match change {
                FieldChange::Set(value) => {
                    fields.insert(field.clone(), value.clone());
                }
                FieldChange::Remove => {
                    fields.remove(field);
                }
            }
        }
    }

    /// Return `fields` with this patch applied
    #[must_use]
    pub fn applied(&self, fields: &Fields) -> Fields {
        let mut merged = fields.clone();
        self.apply_to(&mut merged);
        merged
    }

    /// Whether there is nothing to write
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Number of touched fields
    #[must_use]
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Names of touched fields
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.changes.keys().map(String::as_str)
    }

    /// Look up the change for a field
    #[must_use]
    pub fn change(&self, field: &str) -> Option<&FieldChange> {
        self.changes.get(field)
    }
}

impl<K: Into<String>, V: Into<serde_json::Value>> FromIterator<(K, V)> for Patch {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut patch = Patch::new();
        for (k, v) in iter {
            patch.set(k, v);
        }
        patch
    }
}
