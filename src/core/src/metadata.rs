//! Persistent per-workspace mirror state.
//!
//! A workspace accumulates one [`PastMirror`] record per successful run,
//! with strictly increasing sequence numbers starting at 1. The publish
//! side uses the stored sequence to enforce archive ordering; a UUID
//! mismatch marks the start of a new workspace rather than an error.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::association::AssociationRecord;
use crate::error::{MirrorError, Result};

/// A blob seen in a prior run, with the repository it was first found in
/// so a later publish can fetch it from the mirror when the archive
/// omitted it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PastBlob {
    pub digest: String,
    /// `<namespace>/<name>` the blob was first associated with
    pub repository: String,
}

/// A manifest file recorded from a prior run, by path under `v2/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PastManifest {
    pub path: String,
}

/// Provenance of one mirrored operator catalog within a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CatalogProvenance {
    /// Catalog reference as declared in the configuration
    pub catalog: String,
    /// Digest the catalog resolved to during the run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pin: Option<String>,
    /// Fingerprint of the normalized include filter applied to the catalog
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_fingerprint: Option<String>,
}

/// One historical successful mirror run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PastMirror {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub associations: Vec<AssociationRecord>,
    #[serde(default)]
    pub blobs: Vec<PastBlob>,
    #[serde(default)]
    pub manifests: Vec<PastManifest>,
    #[serde(default)]
    pub operators: Vec<CatalogProvenance>,
}

/// Persistent workspace state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub uid: Uuid,
    /// When set, sequence checks are skipped and nothing is persisted
    #[serde(default)]
    pub single_use: bool,
    #[serde(default)]
    pub past_mirrors: Vec<PastMirror>,
}

impl Default for Metadata {
    fn default() -> Self {
        Self::new()
    }
}

impl Metadata {
    /// A fresh workspace identity with no history.
    pub fn new() -> Self {
        Metadata {
            uid: Uuid::new_v4(),
            single_use: false,
            past_mirrors: Vec::new(),
        }
    }

    /// Sequence of the most recent recorded run; 0 when none.
    pub fn latest_sequence(&self) -> u64 {
        self.past_mirrors.iter().map(|p| p.sequence).max().unwrap_or(0)
    }

    /// The most recent recorded run.
    pub fn latest(&self) -> Option<&PastMirror> {
        self.past_mirrors.iter().max_by_key(|p| p.sequence)
    }

    /// Append a completed run, enforcing the sequence invariant.
    pub fn record(&mut self, mut run: PastMirror) -> Result<()> {
        let expected = self.latest_sequence() + 1;
        if run.sequence == 0 {
            run.sequence = expected;
        } else if run.sequence != expected {
            return Err(MirrorError::Sequence {
                expected,
                got: run.sequence,
            });
        }
        self.past_mirrors.push(run);
        Ok(())
    }

    /// Every blob digest seen in any prior run.
    pub fn past_blob_digests(&self) -> BTreeSet<String> {
        self.past_mirrors
            .iter()
            .flat_map(|p| p.blobs.iter())
            .map(|b| b.digest.clone())
            .collect()
    }

    /// Every manifest path seen in any prior run.
    pub fn past_manifest_paths(&self) -> BTreeSet<String> {
        self.past_mirrors
            .iter()
            .flat_map(|p| p.manifests.iter())
            .map(|m| m.path.clone())
            .collect()
    }

    /// The repository a blob was first associated with, for fetching
    /// layers that prior runs already pushed to the mirror.
    pub fn find_blob_repository(&self, digest: &str) -> Option<&str> {
        self.past_mirrors
            .iter()
            .flat_map(|p| p.blobs.iter())
            .find(|b| b.digest == digest)
            .map(|b| b.repository.as_str())
    }

    /// Provenance recorded for a catalog in the most recent run.
    pub fn catalog_provenance(&self, catalog: &str) -> Option<&CatalogProvenance> {
        self.latest()
            .and_then(|run| run.operators.iter().find(|o| o.catalog == catalog))
    }

    /// Check an incoming imageset's metadata against this stored state.
    ///
    /// A UUID mismatch is a new workspace: the incoming set must restart
    /// at sequence 1. Otherwise the incoming latest sequence must be
    /// exactly one past the stored latest.
    pub fn check_incoming(&self, incoming: &Metadata) -> Result<()> {
        let incoming_seq = incoming.latest_sequence();
        if incoming.uid != self.uid {
            tracing::info!(
                stored = %self.uid,
                incoming = %incoming.uid,
                "workspace uuid changed, treating imageset as a new workspace"
            );
            if incoming_seq != 1 {
                return Err(MirrorError::Sequence {
                    expected: 1,
                    got: incoming_seq,
                });
            }
            return Ok(());
        }
        let expected = self.latest_sequence() + 1;
        if incoming_seq != expected {
            return Err(MirrorError::Sequence {
                expected,
                got: incoming_seq,
            });
        }
        Ok(())
    }
}
