//! Active layer selection.
//!
//! The set is an immutable value: every toggle produces a new set that is
//! swapped in whole, so readers never observe a half-applied change.

use std::collections::BTreeSet;
use std::sync::Arc;

/// Immutable set of active provider ids, iterated in sorted order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LayerSet {
    layers: Arc<BTreeSet<String>>,
}

impl LayerSet {
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            layers: Arc::new(ids.into_iter().map(Into::into).collect()),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.layers.contains(id)
    }

    /// A new set with `id` enabled.
    pub fn with(&self, id: &str) -> Self {
        let mut next = (*self.layers).clone();
        next.insert(id.to_string());
        Self {
            layers: Arc::new(next),
        }
    }

    /// A new set with `id` disabled.
    pub fn without(&self, id: &str) -> Self {
        let mut next = (*self.layers).clone();
        next.remove(id);
        Self {
            layers: Arc::new(next),
        }
    }

    /// A new set with `id` flipped.
    pub fn toggled(&self, id: &str) -> Self {
        if self.contains(id) {
            self.without(id)
        } else {
            self.with(id)
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.layers.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toggle_produces_new_value() {
        let base = LayerSet::new(["nexrad"]);
        let next = base.toggled("gibs");

        assert!(!base.contains("gibs"));
        assert!(next.contains("gibs"));
        assert_eq!(next.iter().collect::<Vec<_>>(), vec!["gibs", "nexrad"]);
        assert_eq!(next.toggled("gibs"), base);
    }

    #[test]
    fn test_without_missing_is_noop() {
        let base = LayerSet::new(["nexrad"]);
        assert_eq!(base.without("mrms"), base);
        assert!(LayerSet::empty().is_empty());
    }
}
