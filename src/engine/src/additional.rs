//! Additional-image planning.
//!
//! Enumerates `mirror.additionalImages` into generic mappings. Declaring
//! an image as both additional and blocked is a configuration conflict
//! surfaced before any transfer starts.

use airlift_core::config::ImageSetConfiguration;
use airlift_core::{ImageKind, ImageReference, MirrorError, Result};

use crate::mirror::is_blocked;
use crate::plan::{Mapping, MappingSet};
use crate::release::to_file_destination;

/// Plan transfers for every declared additional image.
pub fn plan_additional(cfg: &ImageSetConfiguration) -> Result<MappingSet> {
    let blocked: Vec<String> = cfg
        .mirror
        .blocked_images
        .iter()
        .map(|b| b.name.clone())
        .collect();

    let mut mappings = MappingSet::new();
    for img in &cfg.mirror.additional_images {
        let source = ImageReference::parse(&img.name)?;
        if is_blocked(&blocked, &source) {
            return Err(MirrorError::Config(format!(
                "additional image {} also specified as blocked, remove the image from one config field or the other",
                img.name
            )));
        }
        let destination = to_file_destination(&source);
        mappings.add(Mapping::new(source, destination, ImageKind::Generic));
    }
    Ok(mappings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use airlift_core::config::{AdditionalImage, BlockedImage};
    use airlift_core::Transport;

    fn cfg(additional: &[&str], blocked: &[&str]) -> ImageSetConfiguration {
        let mut cfg = ImageSetConfiguration::default();
        cfg.mirror.additional_images = additional
            .iter()
            .map(|n| AdditionalImage {
                name: n.to_string(),
                pull_secret: String::new(),
            })
            .collect();
        cfg.mirror.blocked_images = blocked
            .iter()
            .map(|n| BlockedImage {
                name: n.to_string(),
            })
            .collect();
        cfg
    }

    #[test]
    fn test_plan_additional() {
        let mappings =
            plan_additional(&cfg(&["quay.io/example/foo:v1", "quay.io/example/bar:v2"], &[]))
                .unwrap();
        assert_eq!(mappings.len(), 2);
        for m in mappings.iter() {
            assert_eq!(m.kind, ImageKind::Generic);
            assert_eq!(m.destination.transport, Transport::File);
        }
    }

    #[test]
    fn test_blocked_conflict_is_config_error() {
        let err = plan_additional(&cfg(
            &["quay.io/example/bad:v1"],
            &["quay.io/example/bad"],
        ))
        .unwrap_err();
        assert!(matches!(err, MirrorError::Config(_)));
        assert!(err
            .to_string()
            .contains("additional image quay.io/example/bad:v1 also specified as blocked"));
    }

    #[test]
    fn test_unrelated_blocked_entry_ignored() {
        let mappings = plan_additional(&cfg(
            &["quay.io/example/foo:v1"],
            &["quay.io/example/bad"],
        ))
        .unwrap();
        assert_eq!(mappings.len(), 1);
    }

    #[test]
    fn test_invalid_reference_rejected() {
        assert!(plan_additional(&cfg(&[""], &[])).is_err());
    }
}
