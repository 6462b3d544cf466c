//! Blob/manifest association bookkeeping.
//!
//! Every mirrored image is recorded as an [`ImageAssociation`]: its top
//! manifest digest, child manifests (for manifest lists), layer digests,
//! the tag it was discovered under, and its on-disk path in the `v2/`
//! tree. The [`AssociationSet`] keyed by logical image name is what the
//! publish side replays to reconstruct pushes without consulting the
//! original source registry.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{MirrorError, Result};

/// Artifact class of a mirrored image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum ImageKind {
    #[default]
    Generic,
    OperatorCatalog,
    OperatorBundle,
    OperatorRelated,
    ReleasePayload,
    ReleaseContent,
    GraphData,
}

impl ImageKind {
    /// True for classes whose transfer failures abort the whole run.
    pub fn is_release(&self) -> bool {
        matches!(self, ImageKind::ReleasePayload | ImageKind::ReleaseContent)
    }
}

/// One mirrored image (or child manifest of a manifest list).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageAssociation {
    /// Logical key used in the set; source reference for top-level entries
    pub name: String,
    /// Relative on-disk path under `v2/<namespace>/<name>`
    pub path: String,
    /// Top-level manifest digest
    pub id: String,
    /// Child manifest digests when `id` names a manifest list
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub manifest_digests: Vec<String>,
    /// Layer blob digests
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub layer_digests: Vec<String>,
    /// Original tag the digest was discovered under
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag_symlink: Option<String>,
    #[serde(default)]
    pub kind: ImageKind,
}

/// A flattened association together with the image it belongs to, as
/// persisted inside metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssociationRecord {
    pub image: String,
    #[serde(flatten)]
    pub association: ImageAssociation,
}

/// Mapping from logical image name to its associations, keyed by
/// association name (the image itself plus one entry per child manifest).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssociationSet {
    inner: BTreeMap<String, BTreeMap<String, ImageAssociation>>,
}

impl AssociationSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an association under the given image name. The association's
    /// own name keys it within the image entry, so child manifests keyed by
    /// digest coexist with the top-level entry.
    pub fn add(&mut self, image: &str, assoc: ImageAssociation) {
        self.inner
            .entry(image.to_string())
            .or_default()
            .insert(assoc.name.clone(), assoc);
    }

    /// All associations recorded for an image, top-level entry first.
    pub fn search(&self, image: &str) -> Option<Vec<&ImageAssociation>> {
        self.inner.get(image).map(|m| {
            let mut values: Vec<&ImageAssociation> = m.values().collect();
            values.sort_by_key(|a| (a.name != image, a.name.clone()));
            values
        })
    }

    pub fn contains_key(&self, image: &str, key: &str) -> bool {
        self.inner
            .get(image)
            .map(|m| m.contains_key(key))
            .unwrap_or(false)
    }

    pub fn keys(&self) -> Vec<&str> {
        self.inner.keys().map(|k| k.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Merge another set into this one; colliding entries are replaced.
    pub fn merge(&mut self, other: AssociationSet) {
        for (image, assocs) in other.inner {
            let entry = self.inner.entry(image).or_default();
            for (name, assoc) in assocs {
                entry.insert(name, assoc);
            }
        }
    }

    /// Flatten into records for metadata persistence, keeping the image
    /// grouping alongside each association.
    pub fn flatten(&self) -> Vec<AssociationRecord> {
        self.inner
            .iter()
            .flat_map(|(image, assocs)| {
                assocs.values().map(|a| AssociationRecord {
                    image: image.clone(),
                    association: a.clone(),
                })
            })
            .collect()
    }

    /// Rebuild a set from flattened metadata records.
    pub fn from_flattened(records: Vec<AssociationRecord>) -> Result<AssociationSet> {
        let mut set = AssociationSet::new();
        for record in records {
            if record.association.id.is_empty() {
                return Err(MirrorError::InvalidComponent(format!(
                    "association {} has no manifest digest",
                    record.association.name
                )));
            }
            set.add(&record.image, record.association);
        }
        Ok(set)
    }

    /// Strip a path prefix from every association path. Used when the
    /// unarchived `v2/` tree lands under a different root than it was
    /// created with.
    pub fn update_paths(&mut self, old_prefix: &str) {
        for assocs in self.inner.values_mut() {
            for assoc in assocs.values_mut() {
                if let Some(stripped) = assoc.path.strip_prefix(old_prefix) {
                    assoc.path = stripped.trim_start_matches('/').to_string();
                }
            }
        }
    }

    /// Every distinct layer digest referenced by any association.
    pub fn layer_digests(&self) -> BTreeSet<&str> {
        self.inner
            .values()
            .flat_map(|m| m.values())
            .flat_map(|a| a.layer_digests.iter())
            .map(|d| d.as_str())
            .collect()
    }

    /// Verify internal consistency: every child manifest digest appears as
    /// an association of its image, every path is unique, and every layer
    /// digest is either on disk under `root` or in `past_blobs`.
    pub fn validate(&self, root: &Path, past_blobs: &BTreeSet<String>) -> Result<()> {
        let mut errs = Vec::new();
        let mut seen_paths: BTreeMap<&str, &str> = BTreeMap::new();

        for (image, assocs) in &self.inner {
            for assoc in assocs.values() {
                for digest in &assoc.manifest_digests {
                    if !assocs.contains_key(digest) {
                        errs.push(MirrorError::InvalidComponent(format!(
                            "image {image}: expected associations to have manifest {digest} but it was not found"
                        )));
                    }
                }
                for digest in &assoc.layer_digests {
                    let blob = root.join(&assoc.path).join("blobs").join(digest);
                    if !blob.is_file() && !past_blobs.contains(digest) {
                        errs.push(MirrorError::InvalidComponent(format!(
                            "image {image}: layer {digest} not found on disk or in prior runs"
                        )));
                    }
                }
                if assoc.name == *image {
                    if let Some(existing) = seen_paths.insert(assoc.path.as_str(), image) {
                        if existing != image {
                            errs.push(MirrorError::InvalidComponent(format!(
                                "path {} claimed by both {existing} and {image}",
                                assoc.path
                            )));
                        }
                    }
                }
            }
        }

        match MirrorError::aggregate(errs) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
