//! The master transfer plan.
//!
//! Planners append [`Mapping`]s (source reference, destination reference,
//! artifact class) into a [`MappingSet`] deduplicated by source digest and
//! destination, so an image referenced by several bundles transfers once.

use std::collections::BTreeMap;

use airlift_core::{ImageKind, ImageReference};
use serde::{Deserialize, Serialize};

/// One planned transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mapping {
    pub source: ImageReference,
    pub destination: ImageReference,
    pub kind: ImageKind,
}

impl Mapping {
    pub fn new(source: ImageReference, destination: ImageReference, kind: ImageKind) -> Self {
        Mapping {
            source,
            destination,
            kind,
        }
    }

    // Dedup key: the source digest when pinned (content identity),
    // otherwise the exact source string, paired with the destination.
    fn key(&self) -> (String, String) {
        let src = self
            .source
            .digest
            .clone()
            .unwrap_or_else(|| self.source.exact());
        (src, self.destination.exact())
    }
}

/// Deduplicated, deterministically ordered collection of mappings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MappingSet {
    inner: BTreeMap<(String, String), Mapping>,
}

impl MappingSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a mapping; an existing entry with the same source digest and
    /// destination is kept (first planner wins).
    pub fn add(&mut self, mapping: Mapping) {
        self.inner.entry(mapping.key()).or_insert(mapping);
    }

    pub fn merge(&mut self, other: MappingSet) {
        for mapping in other.inner.into_values() {
            self.add(mapping);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Mapping> {
        self.inner.values()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn into_vec(self) -> Vec<Mapping> {
        self.inner.into_values().collect()
    }

    /// Mappings of one artifact class.
    pub fn of_kind(&self, kind: ImageKind) -> Vec<&Mapping> {
        self.inner.values().filter(|m| m.kind == kind).collect()
    }
}

impl FromIterator<Mapping> for MappingSet {
    fn from_iter<T: IntoIterator<Item = Mapping>>(iter: T) -> Self {
        let mut set = MappingSet::new();
        for m in iter {
            set.add(m);
        }
        set
    }
}
