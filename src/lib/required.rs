//! Checklist of builder fields that must be supplied before finalizing.

use std::collections::BTreeSet;
use std::fmt::Display;

use crate::error::{ProvisionError, Result};

/// A builder field that can be made mandatory.
pub trait RequiredField: Copy + Ord + Display {}

impl<T: Copy + Ord + Display> RequiredField for T {}

#[derive(Debug, Clone)]
pub struct RequiredFieldSet<F: RequiredField> {
    required: BTreeSet<F>,
    satisfied: BTreeSet<F>,
}

impl<F: RequiredField> Default for RequiredFieldSet<F> {
    fn default() -> Self {
        RequiredFieldSet {
            required: BTreeSet::new(),
            satisfied: BTreeSet::new(),
        }
    }
}

impl<F: RequiredField> RequiredFieldSet<F> {
    pub fn new(fields: impl IntoIterator<Item = F>) -> Self {
        RequiredFieldSet {
            required: fields.into_iter().collect(),
            satisfied: BTreeSet::new(),
        }
    }

    pub fn require(&mut self, field: F) {
        self.required.insert(field);
    }

    /// Marks `field` as supplied. Marking a field nobody required is harmless.
    pub fn mark(&mut self, field: F) {
        self.satisfied.insert(field);
    }

    pub fn unmark(&mut self, field: F) {
        self.satisfied.remove(&field);
    }

    /// Required fields still unset, in field order.
    pub fn missing(&self) -> Vec<F> {
        self.required.difference(&self.satisfied).copied().collect()
    }

    pub fn verify(&self, target: &'static str) -> Result<()> {
        let missing = self.missing();
        if missing.is_empty() {
            return Ok(());
        }
        Err(ProvisionError::Configuration {
            target,
            missing: missing.iter().map(|f| f.to_string()).collect(),
        })
    }
}
