//! Imageset configuration validation.
//!
//! Each rule is an independent check; all failures are reported together
//! so the user fixes the configuration in one pass.

use std::collections::HashSet;

use crate::config::{ImageSetConfiguration, Operator};
use crate::error::{MirrorError, Result};

type Check = fn(&ImageSetConfiguration) -> Result<()>;

const CHECKS: &[Check] = &[
    validate_release_channels,
    validate_operator_options,
    validate_include_filters,
    validate_target_catalogs,
    validate_storage,
];

/// Run every validation check, aggregating failures.
pub fn validate(cfg: &ImageSetConfiguration) -> Result<()> {
    let errs: Vec<MirrorError> = CHECKS
        .iter()
        .filter_map(|check| check(cfg).err())
        .collect();
    match MirrorError::aggregate(errs) {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn validate_release_channels(cfg: &ImageSetConfiguration) -> Result<()> {
    let mut seen = HashSet::new();
    for channel in &cfg.mirror.platform.channels {
        if !seen.insert(channel.name.as_str()) {
            return Err(MirrorError::Config(format!(
                "duplicate release channel {} found in configuration",
                channel.name
            )));
        }
    }
    Ok(())
}

fn validate_operator_options(cfg: &ImageSetConfiguration) -> Result<()> {
    for ctlg in &cfg.mirror.operators {
        if ctlg.full && !ctlg.include_config.is_empty() {
            return Err(MirrorError::Config(format!(
                "catalog {} cannot define an include filter when mirroring the full catalog",
                ctlg.catalog
            )));
        }
    }
    Ok(())
}

fn validate_include_filters(cfg: &ImageSetConfiguration) -> Result<()> {
    for ctlg in &cfg.mirror.operators {
        for pkg in &ctlg.include_config.packages {
            let has_versions = !pkg.min_version.is_empty()
                || !pkg.max_version.is_empty()
                || !pkg.channels.is_empty();
            if !pkg.bundles.is_empty() && (has_versions || !pkg.min_bundle.is_empty()) {
                return Err(MirrorError::Config(format!(
                    "catalog {} package {}: bundle selection cannot be combined with channel or version filters",
                    ctlg.catalog, pkg.name
                )));
            }
        }
    }
    Ok(())
}

fn validate_target_catalogs(cfg: &ImageSetConfiguration) -> Result<()> {
    for ctlg in &cfg.mirror.operators {
        if let Some(target) = &ctlg.target_catalog {
            if has_tag_or_digest(target) {
                return Err(MirrorError::Config(format!(
                    "targetCatalog {target} must not contain a tag or digest; use targetTag"
                )));
            }
        }
    }
    Ok(())
}

fn validate_storage(cfg: &ImageSetConfiguration) -> Result<()> {
    let storage = &cfg.storage_config;
    if storage.local.is_some() && storage.registry.is_some() {
        return Err(MirrorError::Config(
            "storageConfig must declare either local or registry, not both".to_string(),
        ));
    }
    Ok(())
}

// A targetCatalog is a bare repository path; a colon after the last slash
// (or an @) means a tag or digest snuck in.
fn has_tag_or_digest(target: &str) -> bool {
    if target.contains('@') {
        return true;
    }
    match target.rsplit_once('/') {
        Some((_, last)) => last.contains(':'),
        None => target.contains(':'),
    }
}

/// True when the catalog entry requests the heads-only mirror mode.
pub fn is_heads_only(ctlg: &Operator) -> bool {
    !ctlg.full
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IncludeConfig, IncludePackage, LocalStorage, RegistryStorage, ReleaseChannel};

    fn cfg_with_operator(op: Operator) -> ImageSetConfiguration {
        let mut cfg = ImageSetConfiguration::default();
        cfg.mirror.operators.push(op);
        cfg
    }

    #[test]
    fn test_empty_config_is_valid() {
        validate(&ImageSetConfiguration::default()).unwrap();
    }

    #[test]
    fn test_duplicate_channels_rejected() {
        let mut cfg = ImageSetConfiguration::default();
        for _ in 0..2 {
            cfg.mirror.platform.channels.push(ReleaseChannel {
                name: "stable-4.9".to_string(),
                ..Default::default()
            });
        }
        let err = validate(&cfg).unwrap_err();
        assert!(err.to_string().contains("duplicate release channel"));
    }

    #[test]
    fn test_full_with_filter_rejected() {
        let op = Operator {
            catalog: "quay.io/cat/index:v1".to_string(),
            full: true,
            include_config: IncludeConfig {
                packages: vec![IncludePackage {
                    name: "p".to_string(),
                    ..Default::default()
                }],
            },
            ..Default::default()
        };
        assert!(validate(&cfg_with_operator(op)).is_err());
    }

    #[test]
    fn test_heads_only_with_filter_allowed() {
        let op = Operator {
            catalog: "quay.io/cat/index:v1".to_string(),
            full: false,
            include_config: IncludeConfig {
                packages: vec![IncludePackage {
                    name: "p".to_string(),
                    min_version: "1.0.0".to_string(),
                    ..Default::default()
                }],
            },
            ..Default::default()
        };
        validate(&cfg_with_operator(op)).unwrap();
    }

    #[test]
    fn test_bundles_mixed_with_versions_rejected() {
        let op = Operator {
            catalog: "quay.io/cat/index:v1".to_string(),
            include_config: IncludeConfig {
                packages: vec![IncludePackage {
                    name: "p".to_string(),
                    bundles: vec!["p.v1.0.0".to_string()],
                    min_version: "1.0.0".to_string(),
                    ..Default::default()
                }],
            },
            ..Default::default()
        };
        let err = validate(&cfg_with_operator(op)).unwrap_err();
        assert!(err.to_string().contains("bundle selection"));
    }

    #[test]
    fn test_bundles_alone_allowed() {
        let op = Operator {
            catalog: "quay.io/cat/index:v1".to_string(),
            include_config: IncludeConfig {
                packages: vec![IncludePackage {
                    name: "p".to_string(),
                    bundles: vec!["p.v1.0.0".to_string()],
                    ..Default::default()
                }],
            },
            ..Default::default()
        };
        validate(&cfg_with_operator(op)).unwrap();
    }

    #[test]
    fn test_target_catalog_with_tag_rejected() {
        let op = Operator {
            catalog: "quay.io/cat/index:v1".to_string(),
            target_catalog: Some("mirrored/index:v2".to_string()),
            ..Default::default()
        };
        assert!(validate(&cfg_with_operator(op)).is_err());

        let op = Operator {
            catalog: "quay.io/cat/index:v1".to_string(),
            target_catalog: Some("mirrored/index@sha256:aa".to_string()),
            ..Default::default()
        };
        assert!(validate(&cfg_with_operator(op)).is_err());
    }

    #[test]
    fn test_target_catalog_with_port_allowed() {
        // A registry port is not a tag.
        let op = Operator {
            catalog: "quay.io/cat/index:v1".to_string(),
            target_catalog: Some("registry.local:5000/mirrored/index".to_string()),
            ..Default::default()
        };
        validate(&cfg_with_operator(op)).unwrap();
    }

    #[test]
    fn test_both_storage_backends_rejected() {
        let mut cfg = ImageSetConfiguration::default();
        cfg.storage_config.local = Some(LocalStorage {
            path: "/tmp/meta".into(),
        });
        cfg.storage_config.registry = Some(RegistryStorage {
            image_url: "registry.local/meta".to_string(),
            skip_tls: false,
        });
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn test_multiple_failures_aggregate() {
        let mut cfg = ImageSetConfiguration::default();
        for _ in 0..2 {
            cfg.mirror.platform.channels.push(ReleaseChannel {
                name: "dup".to_string(),
                ..Default::default()
            });
        }
        cfg.mirror.operators.push(Operator {
            catalog: "quay.io/cat/index:v1".to_string(),
            target_catalog: Some("bad:tag".to_string()),
            ..Default::default()
        });
        let err = validate(&cfg).unwrap_err();
        assert_eq!(err.leaves().len(), 2);
    }
}
