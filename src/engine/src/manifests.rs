//! Cluster-side redirection manifests.
//!
//! ImageContentSourcePolicy documents redirect pulls from the original
//! registries to the mirror; CatalogSource documents point the operator
//! lifecycle manager at rebuilt catalog images. ICSP output is split
//! into multiple documents whenever one would exceed the byte limit.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;

use airlift_core::{ImageKind, ImageReference, MirrorError, Result};

use crate::plan::MappingSet;

/// Default ICSP YAML byte ceiling, matching the cluster resource cap.
pub const DEFAULT_ICSP_BYTE_LIMIT: usize = 250_000;

/// Grouping granularity for mirror rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IcspScope {
    Registry,
    Namespace,
    #[default]
    Repository,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Icsp {
    pub api_version: String,
    pub kind: String,
    pub metadata: IcspMetadata,
    pub spec: IcspSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IcspMetadata {
    pub name: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IcspSpec {
    pub repository_digest_mirrors: Vec<DigestMirror>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DigestMirror {
    pub source: String,
    pub mirrors: Vec<String>,
}

/// ICSP generator configured with a name stem, scope, and byte limit.
pub struct IcspGenerator {
    pub name: String,
    pub scope: IcspScope,
    pub byte_limit: usize,
    /// Set for operator catalogs so OLM picks the policy up
    pub catalog_labels: bool,
}

impl IcspGenerator {
    pub fn new(name: impl Into<String>) -> Self {
        IcspGenerator {
            name: name.into().replace('/', "-"),
            scope: IcspScope::Repository,
            byte_limit: DEFAULT_ICSP_BYTE_LIMIT,
            catalog_labels: false,
        }
    }

    /// Generate ICSP documents from the mapping set. Only digest-pinned
    /// destinations participate; tag-only mappings are logged and
    /// dropped. Documents are name-sorted and each serializes under the
    /// byte limit.
    pub fn generate(&self, mappings: &MappingSet) -> Result<Vec<Icsp>> {
        let mut scoped: BTreeMap<String, String> = BTreeMap::new();
        for mapping in mappings.iter() {
            if !mapping.destination.is_pinned() {
                tracing::warn!(
                    source = %mapping.source,
                    "no digest mapping available, skip writing to ImageContentSourcePolicy"
                );
                continue;
            }
            let (source, dest) = self.scoped_pair(&mapping.source, &mapping.destination);
            scoped.insert(source, dest);
        }

        let mut remaining: Vec<(String, String)> = scoped.into_iter().collect();
        let mut documents = Vec::new();
        let mut index = 0;

        while !remaining.is_empty() {
            let mut icsp = self.empty_doc(index);
            while let Some((source, mirror)) = remaining.first().cloned() {
                icsp.spec.repository_digest_mirrors.push(DigestMirror {
                    source: source.clone(),
                    mirrors: vec![mirror],
                });
                let serialized = serde_yaml::to_string(&icsp)?;
                if serialized.len() > self.byte_limit {
                    icsp.spec.repository_digest_mirrors.pop();
                    if icsp.spec.repository_digest_mirrors.is_empty() {
                        return Err(MirrorError::Config(format!(
                            "mirror for {source:?} cannot fit into any ImageContentSourcePolicy with byte limit {}",
                            self.byte_limit
                        )));
                    }
                    break;
                }
                remaining.remove(0);
            }
            documents.push(icsp);
            index += 1;
        }

        documents.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        Ok(documents)
    }

    fn empty_doc(&self, index: usize) -> Icsp {
        let mut labels = BTreeMap::new();
        if self.catalog_labels {
            labels.insert(
                "operators.openshift.org/catalog".to_string(),
                "true".to_string(),
            );
        }
        Icsp {
            api_version: "operator.openshift.io/v1alpha1".to_string(),
            kind: "ImageContentSourcePolicy".to_string(),
            metadata: IcspMetadata {
                name: format!("{}-{index}", self.name),
                labels,
            },
            spec: IcspSpec {
                repository_digest_mirrors: Vec::new(),
            },
        }
    }

    fn scoped_pair(&self, source: &ImageReference, dest: &ImageReference) -> (String, String) {
        match self.scope {
            IcspScope::Registry => (source.registry.clone(), dest.registry.clone()),
            IcspScope::Namespace if !source.namespace.is_empty() => (
                format!("{}/{}", source.registry, source.namespace),
                format!("{}/{}", dest.registry, dest.namespace),
            ),
            // Namespace-less sources degrade to repository scope.
            _ => (source.qualified_repository(), dest.qualified_repository()),
        }
    }
}

/// Write ICSP documents aggregated into one YAML stream.
pub fn write_icsps(dir: &Path, icsps: &[Icsp]) -> Result<Option<PathBuf>> {
    if icsps.is_empty() {
        tracing::debug!("no ImageContentSourcePolicy generated to write");
        return Ok(None);
    }
    let mut aggregated = String::new();
    for icsp in icsps {
        aggregated.push_str("---\n");
        aggregated.push_str(&serde_yaml::to_string(icsp)?);
    }
    std::fs::create_dir_all(dir)?;
    let path = dir.join("imageContentSourcePolicy.yaml");
    std::fs::write(&path, aggregated)?;
    tracing::info!(path = %path.display(), "wrote ImageContentSourcePolicy manifests");
    Ok(Some(path))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogSource {
    pub api_version: String,
    pub kind: String,
    pub metadata: CatalogSourceMetadata,
    pub spec: CatalogSourceSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CatalogSourceMetadata {
    pub name: String,
    pub namespace: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogSourceSpec {
    pub source_type: String,
    pub image: String,
}

/// Generate a CatalogSource for one rebuilt catalog. The tag form is
/// preferred over the digest so the cluster picks up catalog updates.
pub fn generate_catalog_source(name: &str, dest: &ImageReference) -> CatalogSource {
    let mut image = dest.clone();
    if image.tag.is_some() {
        image.digest = None;
    }
    CatalogSource {
        api_version: "operators.coreos.com/v1alpha1".to_string(),
        kind: "CatalogSource".to_string(),
        metadata: CatalogSourceMetadata {
            name: sanitize_name(name),
            namespace: "openshift-marketplace".to_string(),
        },
        spec: CatalogSourceSpec {
            source_type: "grpc".to_string(),
            image: image.exact(),
        },
    }
}

/// Write one CatalogSource YAML per catalog mapping in the set.
pub fn write_catalog_sources(dir: &Path, mappings: &MappingSet) -> Result<Vec<PathBuf>> {
    let mut written = Vec::new();
    for mapping in mappings.of_kind(ImageKind::OperatorCatalog) {
        let source = generate_catalog_source(&mapping.source.name, &mapping.destination);
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("catalogSource-{}.yaml", source.metadata.name));
        std::fs::write(&path, serde_yaml::to_string(&source)?)?;
        tracing::info!(path = %path.display(), "wrote CatalogSource manifest");
        written.push(path);
    }
    Ok(written)
}

// Resource names must be DNS-1123 compatible.
fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect::<String>()
        .trim_matches('-')
        .to_string()
}
