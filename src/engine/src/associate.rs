//! Association building.
//!
//! After the executor lands images in the file layout, this walks each
//! mapping's manifests to record what was mirrored: top manifest, child
//! manifests of lists, and layer digests. Missing pieces become soft
//! errors the caller may log, since a blob can legitimately live only in
//! a prior run's set.

use airlift_core::{
    AssociationSet, ImageAssociation, ImageReference, MirrorError, Result,
};

use crate::layout::FileLayout;
use crate::mirror::{blob_digests_of, child_digests};
use crate::plan::Mapping;

/// Build associations for every mapping from the on-disk layout.
/// Returns the set alongside aggregated soft errors.
pub fn associate_image_layers(
    layout: &FileLayout,
    mappings: &[Mapping],
) -> (AssociationSet, Option<MirrorError>) {
    let mut set = AssociationSet::new();
    let mut errs = Vec::new();

    for mapping in mappings {
        match associate_one(layout, mapping) {
            Ok(assocs) => {
                let image = mapping.source.full();
                for assoc in assocs {
                    set.add(&image, assoc);
                }
            }
            Err(e) => errs.push(e),
        }
    }

    (set, MirrorError::aggregate(errs))
}

fn associate_one(layout: &FileLayout, mapping: &Mapping) -> Result<Vec<ImageAssociation>> {
    let source = &mapping.source;
    let image_path = FileLayout::image_path(&mapping.destination);

    let digest = resolve_digest(layout, source, &image_path)?;
    let body = layout.read_manifest(&image_path, &digest)?;
    let parsed: serde_json::Value = serde_json::from_slice(&body)?;

    let children = child_digests(&parsed);
    let mut assocs = Vec::new();

    if children.is_empty() {
        assocs.push(ImageAssociation {
            name: source.full(),
            path: image_path.clone(),
            id: digest,
            manifest_digests: Vec::new(),
            layer_digests: blob_digests_of(&body)?,
            tag_symlink: source.tag.clone(),
            kind: mapping.kind,
        });
        return Ok(assocs);
    }

    for child in &children {
        let child_body = layout.read_manifest(&image_path, child).map_err(|_| {
            MirrorError::InvalidComponent(format!(
                "image {}: child manifest {child} not found in layout",
                source.full()
            ))
        })?;
        assocs.push(ImageAssociation {
            name: child.clone(),
            path: image_path.clone(),
            id: child.clone(),
            manifest_digests: Vec::new(),
            layer_digests: blob_digests_of(&child_body)?,
            tag_symlink: None,
            kind: mapping.kind,
        });
    }
    assocs.push(ImageAssociation {
        name: source.full(),
        path: image_path,
        id: digest,
        manifest_digests: children,
        layer_digests: Vec::new(),
        tag_symlink: source.tag.clone(),
        kind: mapping.kind,
    });
    Ok(assocs)
}

fn resolve_digest(
    layout: &FileLayout,
    source: &ImageReference,
    image_path: &str,
) -> Result<String> {
    if let Some(digest) = &source.digest {
        return Ok(digest.clone());
    }
    let tag = source.tag.as_deref().ok_or_else(|| {
        MirrorError::NoMapping(format!(
            "image {} has neither tag nor digest",
            source.full()
        ))
    })?;
    layout.resolve_tag(image_path, tag).map_err(|_| {
        MirrorError::NoMapping(format!(
            "image {}: tag {tag} not present in layout",
            source.full()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use airlift_core::ImageKind;
    use crate::release::to_file_destination;
    use tempfile::TempDir;

    fn mapping(src: &str) -> Mapping {
        let source = ImageReference::parse(src).unwrap();
        let destination = to_file_destination(&source);
        Mapping::new(source, destination, ImageKind::Generic)
    }

    fn write_image(layout: &FileLayout, m: &Mapping, digest: &str, layers: &[&str]) {
        let image_path = FileLayout::image_path(&m.destination);
        let manifest = serde_json::json!({
            "config": {"digest": "sha256:cfg"},
            "layers": layers.iter().map(|l| serde_json::json!({"digest": l})).collect::<Vec<_>>(),
        });
        layout
            .write_manifest(
                &image_path,
                digest,
                m.source.tag.as_deref(),
                &serde_json::to_vec(&manifest).unwrap(),
            )
            .unwrap();
        for layer in layers {
            layout.write_blob(&image_path, layer, b"blob").unwrap();
        }
        layout.write_blob(&image_path, "sha256:cfg", b"cfg").unwrap();
    }

    #[test]
    fn test_associate_plain_manifest() {
        let tmp = TempDir::new().unwrap();
        let layout = FileLayout::new(tmp.path().join("src")).unwrap();
        let m = mapping("quay.io/example/foo:v1");
        write_image(&layout, &m, "sha256:top", &["sha256:l1"]);

        let (set, errs) = associate_image_layers(&layout, &[m.clone()]);
        assert!(errs.is_none());
        let assocs = set.search("quay.io/example/foo:v1").unwrap();
        assert_eq!(assocs.len(), 1);
        assert_eq!(assocs[0].id, "sha256:top");
        assert_eq!(assocs[0].tag_symlink.as_deref(), Some("v1"));
        assert_eq!(assocs[0].layer_digests, vec!["sha256:cfg", "sha256:l1"]);
        assert_eq!(assocs[0].path, "v2/example/foo");
    }

    #[test]
    fn test_associate_manifest_list() {
        let tmp = TempDir::new().unwrap();
        let layout = FileLayout::new(tmp.path().join("src")).unwrap();
        let m = mapping("quay.io/example/multi:v1");
        let image_path = FileLayout::image_path(&m.destination);

        let child = serde_json::json!({
            "config": {"digest": "sha256:ccfg"},
            "layers": [{"digest": "sha256:cl1"}],
        });
        layout
            .write_manifest(&image_path, "sha256:child", None, &serde_json::to_vec(&child).unwrap())
            .unwrap();
        let list = serde_json::json!({"manifests": [{"digest": "sha256:child"}]});
        layout
            .write_manifest(&image_path, "sha256:list", Some("v1"), &serde_json::to_vec(&list).unwrap())
            .unwrap();

        let (set, errs) = associate_image_layers(&layout, &[m]);
        assert!(errs.is_none());
        let assocs = set.search("quay.io/example/multi:v1").unwrap();
        assert_eq!(assocs.len(), 2);
        // Top-level entry references the child, which has its own entry.
        let top = assocs.iter().find(|a| a.id == "sha256:list").unwrap();
        assert_eq!(top.manifest_digests, vec!["sha256:child"]);
        assert!(set.contains_key("quay.io/example/multi:v1", "sha256:child"));
    }

    #[test]
    fn test_associate_missing_manifest_is_soft_error() {
        let tmp = TempDir::new().unwrap();
        let layout = FileLayout::new(tmp.path().join("src")).unwrap();
        let present = mapping("quay.io/example/ok:v1");
        write_image(&layout, &present, "sha256:ok", &[]);
        let missing = mapping("quay.io/example/gone:v1");

        let (set, errs) = associate_image_layers(&layout, &[present, missing]);
        assert_eq!(set.len(), 1);
        assert!(matches!(errs, Some(MirrorError::NoMapping(_))));
    }
}
