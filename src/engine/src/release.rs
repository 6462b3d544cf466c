//! Release payload planning.
//!
//! Turns declared release channels into a concrete set of payload images
//! by querying the upgrade graph, then expands pulled payloads into their
//! component images by reading the `image-references` manifest carried in
//! the payload's layers.

use std::io::Read;

use flate2::read::GzDecoder;
use semver::Version;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use airlift_core::config::ImageSetConfiguration;
use airlift_core::{ImageKind, ImageReference, MirrorError, Result, Transport};

use crate::cincinnati::GraphClient;
use crate::layout::FileLayout;
use crate::plan::{Mapping, MappingSet};

/// Payload path of the component-image manifest.
const IMAGE_REFERENCES_PATH: &str = "release-manifests/image-references";

/// Plans release payload transfers from the declared channels.
pub struct ReleasePlanner<'a> {
    graph: &'a dyn GraphClient,
}

impl<'a> ReleasePlanner<'a> {
    pub fn new(graph: &'a dyn GraphClient) -> Self {
        ReleasePlanner { graph }
    }

    /// Resolve every channel to its payload set and emit one mapping per
    /// payload into the file layout.
    pub async fn plan(
        &self,
        cfg: &ImageSetConfiguration,
        cancel: &CancellationToken,
    ) -> Result<MappingSet> {
        let mut mappings = MappingSet::new();
        let arches = cfg.mirror.platform.arches();

        for channel in &cfg.mirror.platform.channels {
            for arch in &arches {
                if cancel.is_cancelled() {
                    return Err(MirrorError::Cancelled);
                }
                let graph = self.graph.get_graph(&channel.name, arch).await?;

                let payloads: Vec<String> = if channel.min_version.is_empty()
                    || channel.max_version.is_empty()
                {
                    // No range declared: mirror the channel head.
                    graph
                        .head()
                        .map(|n| vec![n.payload.clone()])
                        .unwrap_or_default()
                } else {
                    let min = parse_version(&channel.name, &channel.min_version)?;
                    let max = parse_version(&channel.name, &channel.max_version)?;
                    graph
                        .walk(&channel.name, &min, &max)?
                        .into_iter()
                        .map(|n| n.payload.clone())
                        .collect()
                };

                if payloads.is_empty() {
                    tracing::warn!(channel = %channel.name, arch = %arch, "channel has no nodes");
                    continue;
                }

                for payload in payloads {
                    let source = ImageReference::parse(&payload)?;
                    let destination = to_file_destination(&source);
                    mappings.add(Mapping::new(source, destination, ImageKind::ReleasePayload));
                }
            }
        }
        Ok(mappings)
    }
}

fn parse_version(channel: &str, raw: &str) -> Result<Version> {
    Version::parse(raw).map_err(|e| MirrorError::Graph {
        channel: channel.to_string(),
        message: format!("version {raw}: {e}"),
    })
}

/// Destination inside the create-phase file layout, preserving namespace,
/// name, tag, and digest of the source.
pub fn to_file_destination(source: &ImageReference) -> ImageReference {
    ImageReference {
        transport: Transport::File,
        registry: String::new(),
        namespace: source.namespace.clone(),
        name: source.name.clone(),
        tag: source.tag.clone(),
        digest: source.digest.clone(),
        layout_path: None,
    }
}

#[derive(Deserialize)]
struct ImageStream {
    #[serde(default)]
    spec: ImageStreamSpec,
}

#[derive(Deserialize, Default)]
struct ImageStreamSpec {
    #[serde(default)]
    tags: Vec<ImageStreamTag>,
}

#[derive(Deserialize)]
struct ImageStreamTag {
    name: String,
    from: ImageStreamFrom,
}

#[derive(Deserialize)]
struct ImageStreamFrom {
    name: String,
}

/// Expand a pulled release payload into mappings for its component
/// images by locating `release-manifests/image-references` in its layers.
pub fn expand_release_content(
    layout: &FileLayout,
    payload: &ImageReference,
) -> Result<MappingSet> {
    let image_path = FileLayout::image_path(payload);
    let digest = match &payload.digest {
        Some(d) => d.clone(),
        None => layout.resolve_tag(&image_path, payload.tag.as_deref().unwrap_or("latest"))?,
    };

    let manifest: serde_json::Value =
        serde_json::from_slice(&layout.read_manifest(&image_path, &digest)?)?;
    let layers: Vec<String> = manifest
        .get("layers")
        .and_then(|l| l.as_array())
        .map(|l| {
            l.iter()
                .filter_map(|d| d.get("digest").and_then(|d| d.as_str()))
                .map(|d| d.to_string())
                .collect()
        })
        .unwrap_or_default();

    // The manifest list case: expand each child instead.
    if layers.is_empty() {
        if let Some(children) = manifest.get("manifests").and_then(|m| m.as_array()) {
            let mut all = MappingSet::new();
            for child in children {
                if let Some(child_digest) = child.get("digest").and_then(|d| d.as_str()) {
                    let child_ref = payload.pinned_to(child_digest);
                    all.merge(expand_release_content(layout, &child_ref)?);
                }
            }
            return Ok(all);
        }
    }

    // Scan layers last-to-first: release manifests live in late layers.
    for layer_digest in layers.iter().rev() {
        let blob = layout.read_blob(&image_path, layer_digest)?;
        if let Some(stream) = find_image_references(&blob)? {
            let mut mappings = MappingSet::new();
            for tag in stream.spec.tags {
                let source = ImageReference::parse(&tag.from.name)?;
                if !source.is_pinned() {
                    tracing::warn!(
                        component = %tag.name,
                        image = %tag.from.name,
                        "release component is not digest-addressed, skipping"
                    );
                    continue;
                }
                let destination = to_file_destination(&source);
                mappings.add(Mapping::new(source, destination, ImageKind::ReleaseContent));
            }
            return Ok(mappings);
        }
    }

    Err(MirrorError::InvalidComponent(format!(
        "payload {} carries no {IMAGE_REFERENCES_PATH}",
        payload.exact()
    )))
}

fn find_image_references(blob: &[u8]) -> Result<Option<ImageStream>> {
    // Layers may arrive gzipped or plain.
    let reader: Box<dyn Read> = if blob.starts_with(&[0x1f, 0x8b]) {
        Box::new(GzDecoder::new(blob))
    } else {
        Box::new(blob)
    };
    let mut archive = tar::Archive::new(reader);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.to_string_lossy().into_owned();
        if path.trim_start_matches("./").ends_with(IMAGE_REFERENCES_PATH) {
            let mut data = Vec::new();
            entry.read_to_end(&mut data)?;
            return Ok(Some(serde_json::from_slice(&data)?));
        }
    }
    Ok(None)
}
