//! Catalog image pinning.
//!
//! Replaces every tagged bundle and related image in a declarative
//! config with its digest-addressed form so the mirrored catalog is
//! immutable. Failures are collected per image; one unresolvable image
//! does not abort pinning of the rest.

use async_trait::async_trait;

use airlift_core::{DeclarativeConfig, ImageReference, MirrorError, Result};

use crate::registry::RegistryClient;

/// Tag-to-digest resolution, injectable for tests.
#[async_trait]
pub trait ImageResolver: Send + Sync {
    async fn resolve(&self, reference: &ImageReference) -> Result<String>;
}

#[async_trait]
impl ImageResolver for RegistryClient {
    async fn resolve(&self, reference: &ImageReference) -> Result<String> {
        RegistryClient::resolve(self, reference).await
    }
}

/// Pin every image in the catalog in place. Returns the aggregated
/// resolution failures, if any.
pub async fn pin_images(dc: &mut DeclarativeConfig, resolver: &dyn ImageResolver) -> Result<()> {
    let mut errs = Vec::new();

    for bundle in &mut dc.bundles {
        match pin_one(&bundle.image, resolver).await {
            Ok(Some(pinned)) => bundle.image = pinned,
            Ok(None) => {
                if bundle.image.is_empty() {
                    tracing::warn!(bundle = %bundle.name, "bundle image tag not set");
                }
            }
            Err(e) => errs.push(e),
        }
        for related in &mut bundle.related_images {
            match pin_one(&related.image, resolver).await {
                Ok(Some(pinned)) => related.image = pinned,
                Ok(None) => {
                    if related.image.is_empty() {
                        tracing::warn!(bundle = %bundle.name, "related image tag not set");
                    }
                }
                Err(e) => errs.push(e),
            }
        }
    }

    match MirrorError::aggregate(errs) {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

// Returns the pinned form, None when the image is already pinned or has
// nothing to resolve from.
async fn pin_one(image: &str, resolver: &dyn ImageResolver) -> Result<Option<String>> {
    if image.is_empty() {
        return Ok(None);
    }
    let reference = ImageReference::parse(image)?;
    if reference.is_pinned() {
        return Ok(None);
    }
    if !reference.is_tagged() {
        tracing::warn!(image = %image, "image has neither tag nor digest, leaving unchanged");
        return Ok(None);
    }
    let digest = resolver.resolve(&reference).await?;
    Ok(Some(reference.pinned_to(&digest).exact()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::sample_bundle;
    use airlift_core::declcfg::RelatedImage;
    use std::collections::HashMap;

    struct MapResolver {
        digests: HashMap<String, String>,
    }

    #[async_trait]
    impl ImageResolver for MapResolver {
        async fn resolve(&self, reference: &ImageReference) -> Result<String> {
            self.digests
                .get(&reference.exact())
                .cloned()
                .ok_or_else(|| MirrorError::ManifestUnknown(reference.exact()))
        }
    }

    fn dc_with_images(bundle_image: &str, related: &str) -> DeclarativeConfig {
        let mut bundle = sample_bundle("pkg", "pkg.v1.0.0", "1.0.0");
        bundle.image = bundle_image.to_string();
        bundle.related_images = vec![RelatedImage {
            name: "operand".to_string(),
            image: related.to_string(),
        }];
        DeclarativeConfig {
            bundles: vec![bundle],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_pin_tagged_images() {
        let mut dc = dc_with_images("quay.io/pkg/bundle:v1", "quay.io/pkg/operand:v1");
        let resolver = MapResolver {
            digests: HashMap::from([
                ("quay.io/pkg/bundle:v1".to_string(), "sha256:aa".to_string()),
                ("quay.io/pkg/operand:v1".to_string(), "sha256:bb".to_string()),
            ]),
        };
        pin_images(&mut dc, &resolver).await.unwrap();
        assert_eq!(dc.bundles[0].image, "quay.io/pkg/bundle@sha256:aa");
        assert_eq!(dc.bundles[0].related_images[0].image, "quay.io/pkg/operand@sha256:bb");
    }

    #[tokio::test]
    async fn test_pin_skips_already_pinned() {
        let mut dc = dc_with_images("quay.io/pkg/bundle@sha256:aa", "quay.io/pkg/operand@sha256:bb");
        let resolver = MapResolver {
            digests: HashMap::new(),
        };
        pin_images(&mut dc, &resolver).await.unwrap();
        assert_eq!(dc.bundles[0].image, "quay.io/pkg/bundle@sha256:aa");
    }

    #[tokio::test]
    async fn test_pin_aggregates_failures() {
        let mut dc = dc_with_images("quay.io/pkg/bundle:v1", "quay.io/pkg/operand:v1");
        let resolver = MapResolver {
            // Only the related image resolves.
            digests: HashMap::from([(
                "quay.io/pkg/operand:v1".to_string(),
                "sha256:bb".to_string(),
            )]),
        };
        let err = pin_images(&mut dc, &resolver).await.unwrap_err();
        assert!(matches!(err, MirrorError::ManifestUnknown(_)));
        // The related image was still pinned despite the bundle failure.
        assert_eq!(dc.bundles[0].related_images[0].image, "quay.io/pkg/operand@sha256:bb");
    }

    #[tokio::test]
    async fn test_pin_empty_image_left_alone() {
        let mut dc = dc_with_images("", "");
        let resolver = MapResolver {
            digests: HashMap::new(),
        };
        pin_images(&mut dc, &resolver).await.unwrap();
        assert_eq!(dc.bundles[0].image, "");
    }
}
