//! Imageset configuration model.
//!
//! The declarative input describing what to mirror: release channels,
//! operator catalogs with include filters, additional images, blocked
//! images, and the metadata storage backend.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level imageset configuration, loaded from YAML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ImageSetConfiguration {
    #[serde(default)]
    pub mirror: MirrorSpec,
    #[serde(default)]
    pub storage_config: StorageConfig,
    /// Archive chunk ceiling in GiB; unset means the built-in default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct MirrorSpec {
    #[serde(default)]
    pub platform: Platform,
    #[serde(default)]
    pub operators: Vec<Operator>,
    #[serde(default)]
    pub additional_images: Vec<AdditionalImage>,
    #[serde(default)]
    pub helm: Vec<HelmChart>,
    #[serde(default)]
    pub blocked_images: Vec<BlockedImage>,
    #[serde(default)]
    pub samples: Vec<Sample>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Platform {
    #[serde(default)]
    pub channels: Vec<ReleaseChannel>,
    #[serde(default)]
    pub architectures: Vec<String>,
    /// Mirror Cincinnati graph data alongside the release payloads
    #[serde(default)]
    pub graph: bool,
}

impl Platform {
    /// Declared architectures, defaulting to amd64.
    pub fn arches(&self) -> Vec<String> {
        if self.architectures.is_empty() {
            vec!["amd64".to_string()]
        } else {
            self.architectures.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseChannel {
    pub name: String,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub min_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub max_version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Operator {
    /// Catalog image reference
    pub catalog: String,
    /// Repository to rebuild the catalog under, instead of the source repo
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_catalog: Option<String>,
    /// Tag for the rebuilt catalog image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_tag: Option<String>,
    /// Mirror every bundle instead of channel heads only
    #[serde(default)]
    pub full: bool,
    #[serde(default, skip_serializing_if = "IncludeConfig::is_empty")]
    pub include_config: IncludeConfig,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pull_secret: String,
}

impl Operator {
    /// Repository path the rebuilt catalog is pushed under.
    pub fn target_name(&self, source_repository: &str) -> String {
        self.target_catalog
            .clone()
            .unwrap_or_else(|| source_repository.to_string())
    }
}

/// Filter narrowing a catalog to selected packages/channels/versions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct IncludeConfig {
    #[serde(default)]
    pub packages: Vec<IncludePackage>,
}

impl IncludeConfig {
    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct IncludePackage {
    pub name: String,
    #[serde(default)]
    pub channels: Vec<IncludeChannel>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub min_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub max_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub min_bundle: String,
    /// Explicit bundle names; exclusive with channel/version selection
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bundles: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct IncludeChannel {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub min_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub max_version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AdditionalImage {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pull_secret: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct BlockedImage {
    pub name: String,
}

/// Helm charts are staged through the archive untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct HelmChart {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
}

/// Accepted for compatibility; samples do not influence planning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Sample {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local: Option<LocalStorage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry: Option<RegistryStorage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct LocalStorage {
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStorage {
    #[serde(rename = "imageURL")]
    pub image_url: String,
    #[serde(rename = "skipTLS", default)]
    pub skip_tls: bool,
}

impl ImageSetConfiguration {
    /// Parse a configuration document from YAML text.
    pub fn from_yaml(text: &str) -> crate::error::Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
mirror:
  platform:
    channels:
      - name: stable-4.9
        minVersion: 4.9.10
        maxVersion: 4.9.15
    architectures: [amd64, arm64]
  operators:
    - catalog: registry.redhat.io/redhat/redhat-operator-index:v4.9
      includeConfig:
        packages:
          - name: elasticsearch-operator
            channels:
              - name: stable
                minVersion: 0.1.0
                maxVersion: 0.2.0
  additionalImages:
    - name: quay.io/example/foo:v1
  blockedImages:
    - name: quay.io/example/bad
storageConfig:
  registry:
    imageURL: registry.local:5000/metadata
    skipTLS: true
"#;

    #[test]
    fn test_parse_sample() {
        let cfg = ImageSetConfiguration::from_yaml(SAMPLE).unwrap();
        assert_eq!(cfg.mirror.platform.channels.len(), 1);
        assert_eq!(cfg.mirror.platform.channels[0].min_version, "4.9.10");
        assert_eq!(cfg.mirror.platform.arches(), vec!["amd64", "arm64"]);
        assert_eq!(cfg.mirror.operators.len(), 1);
        let pkg = &cfg.mirror.operators[0].include_config.packages[0];
        assert_eq!(pkg.channels[0].name, "stable");
        assert_eq!(cfg.mirror.additional_images[0].name, "quay.io/example/foo:v1");
        assert_eq!(cfg.mirror.blocked_images[0].name, "quay.io/example/bad");
        let reg = cfg.storage_config.registry.unwrap();
        assert_eq!(reg.image_url, "registry.local:5000/metadata");
        assert!(reg.skip_tls);
    }

    #[test]
    fn test_default_architecture() {
        let platform = Platform::default();
        assert_eq!(platform.arches(), vec!["amd64"]);
    }

    #[test]
    fn test_operator_target_name() {
        let mut op = Operator {
            catalog: "quay.io/cat/index:v1".to_string(),
            ..Default::default()
        };
        assert_eq!(op.target_name("cat/index"), "cat/index");
        op.target_catalog = Some("mirrored/index".to_string());
        assert_eq!(op.target_name("cat/index"), "mirrored/index");
    }

    #[test]
    fn test_empty_config_parses() {
        let cfg = ImageSetConfiguration::from_yaml("mirror: {}").unwrap();
        assert!(cfg.mirror.operators.is_empty());
        assert!(cfg.storage_config.local.is_none());
    }
}
