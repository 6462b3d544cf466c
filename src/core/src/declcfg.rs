//! File-based catalog (declarative config) model.
//!
//! A catalog is a directory tree of JSON/YAML records typed by their
//! `schema` field: `olm.package`, `olm.channel`, `olm.bundle`. Records
//! with unknown schemas are skipped by the loader so newer catalog
//! features do not break older mirrors.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{MirrorError, Result};

pub const SCHEMA_PACKAGE: &str = "olm.package";
pub const SCHEMA_CHANNEL: &str = "olm.channel";
pub const SCHEMA_BUNDLE: &str = "olm.bundle";

/// Property type carrying the bundle's package name and version.
pub const PROPERTY_PACKAGE: &str = "olm.package";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Package {
    pub schema: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub default_channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ChannelEntry {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub replaces: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skips: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub skip_range: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub schema: String,
    pub name: String,
    pub package: String,
    #[serde(default)]
    pub entries: Vec<ChannelEntry>,
}

impl Channel {
    /// The channel head: the entry no other entry replaces or skips.
    /// Falls back to the last entry for malformed edge sets.
    pub fn head(&self) -> Option<&ChannelEntry> {
        let replaced: Vec<&str> = self
            .entries
            .iter()
            .flat_map(|e| {
                std::iter::once(e.replaces.as_str()).chain(e.skips.iter().map(|s| s.as_str()))
            })
            .filter(|n| !n.is_empty())
            .collect();
        self.entries
            .iter()
            .find(|e| !replaced.contains(&e.name.as_str()))
            .or_else(|| self.entries.last())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RelatedImage {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    pub image: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Property {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Bundle {
    pub schema: String,
    pub name: String,
    pub package: String,
    pub image: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub properties: Vec<Property>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related_images: Vec<RelatedImage>,
}

impl Bundle {
    /// The bundle version declared in its `olm.package` property.
    pub fn version(&self) -> Option<semver::Version> {
        self.properties
            .iter()
            .find(|p| p.kind == PROPERTY_PACKAGE)
            .and_then(|p| p.value.get("version"))
            .and_then(|v| v.as_str())
            .and_then(|v| semver::Version::parse(v).ok())
    }
}

/// An ordered catalog: typed records grouped by schema.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DeclarativeConfig {
    #[serde(default)]
    pub packages: Vec<Package>,
    #[serde(default)]
    pub channels: Vec<Channel>,
    #[serde(default)]
    pub bundles: Vec<Bundle>,
}

impl DeclarativeConfig {
    pub fn is_empty(&self) -> bool {
        self.packages.is_empty() && self.channels.is_empty() && self.bundles.is_empty()
    }

    /// Load every catalog record found under `dir`, recursively.
    pub fn load_dir(dir: &Path) -> Result<DeclarativeConfig> {
        let mut dc = DeclarativeConfig::default();
        let mut stack = vec![dir.to_path_buf()];
        while let Some(current) = stack.pop() {
            let mut entries: Vec<_> = std::fs::read_dir(&current)?
                .collect::<std::io::Result<Vec<_>>>()?;
            entries.sort_by_key(|e| e.file_name());
            for entry in entries {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                    continue;
                }
                let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
                match ext {
                    "json" => dc.load_json(&path)?,
                    "yaml" | "yml" => dc.load_yaml(&path)?,
                    _ => {}
                }
            }
        }
        Ok(dc)
    }

    fn load_json(&mut self, path: &Path) -> Result<()> {
        let file = std::fs::File::open(path)?;
        let reader = std::io::BufReader::new(file);
        // Catalog files are streams of concatenated JSON objects.
        for value in serde_json::Deserializer::from_reader(reader).into_iter::<Value>() {
            let value = value.map_err(|e| {
                MirrorError::Serialization(format!("{}: {e}", path.display()))
            })?;
            self.push_record(value, path)?;
        }
        Ok(())
    }

    fn load_yaml(&mut self, path: &Path) -> Result<()> {
        let text = std::fs::read_to_string(path)?;
        for doc in serde_yaml::Deserializer::from_str(&text) {
            let value: Value = serde_json::Value::deserialize(doc).map_err(|e| {
                MirrorError::Serialization(format!("{}: {e}", path.display()))
            })?;
            if !value.is_null() {
                self.push_record(value, path)?;
            }
        }
        Ok(())
    }

    fn push_record(&mut self, value: Value, path: &Path) -> Result<()> {
        let schema = value.get("schema").and_then(|s| s.as_str()).unwrap_or("");
        let fail = |e: serde_json::Error| {
            MirrorError::Serialization(format!("{}: {e}", path.display()))
        };
        match schema {
            SCHEMA_PACKAGE => self.packages.push(serde_json::from_value(value).map_err(fail)?),
            SCHEMA_CHANNEL => self.channels.push(serde_json::from_value(value).map_err(fail)?),
            SCHEMA_BUNDLE => self.bundles.push(serde_json::from_value(value).map_err(fail)?),
            // Unknown schemas are skipped for forward compatibility.
            _ => {}
        }
        Ok(())
    }

    /// Write the catalog as a single `index.json` stream under `dir`,
    /// grouped per package in declaration order.
    pub fn write_json(&self, dir: &Path) -> Result<std::path::PathBuf> {
        std::fs::create_dir_all(dir)?;
        let index = dir.join("index.json");
        let mut out = std::io::BufWriter::new(std::fs::File::create(&index)?);

        let mut package_names: Vec<&str> = self.packages.iter().map(|p| p.name.as_str()).collect();
        for c in &self.channels {
            if !package_names.contains(&c.package.as_str()) {
                package_names.push(&c.package);
            }
        }
        for b in &self.bundles {
            if !package_names.contains(&b.package.as_str()) {
                package_names.push(&b.package);
            }
        }

        for name in package_names {
            for p in self.packages.iter().filter(|p| p.name == name) {
                writeln!(out, "{}", serde_json::to_string_pretty(p)?)?;
            }
            for c in self.channels.iter().filter(|c| c.package == name) {
                writeln!(out, "{}", serde_json::to_string_pretty(c)?)?;
            }
            for b in self.bundles.iter().filter(|b| b.package == name) {
                writeln!(out, "{}", serde_json::to_string_pretty(b)?)?;
            }
        }
        out.flush()?;
        Ok(index)
    }

    /// Merge `newer` into this catalog. Packages and bundles override
    /// older counterparts on key collision (name, or package+name);
    /// colliding channels merge entry-wise with the newer entry winning,
    /// so upgrade edges accumulate across catalog generations. Records
    /// unique to either side survive.
    pub fn merge(self, newer: DeclarativeConfig) -> DeclarativeConfig {
        let mut packages: BTreeMap<String, Package> = self
            .packages
            .into_iter()
            .map(|p| (p.name.clone(), p))
            .collect();
        for p in newer.packages {
            packages.insert(p.name.clone(), p);
        }

        let mut channels: BTreeMap<(String, String), Channel> = self
            .channels
            .into_iter()
            .map(|c| ((c.package.clone(), c.name.clone()), c))
            .collect();
        for c in newer.channels {
            match channels.get_mut(&(c.package.clone(), c.name.clone())) {
                // Colliding channels merge entry-wise, newer entry winning
                // on name collision; entries unique to either side survive.
                Some(existing) => {
                    for entry in c.entries {
                        match existing.entries.iter_mut().find(|e| e.name == entry.name) {
                            Some(slot) => *slot = entry,
                            None => existing.entries.push(entry),
                        }
                    }
                }
                None => {
                    channels.insert((c.package.clone(), c.name.clone()), c);
                }
            }
        }

        let mut bundles: BTreeMap<(String, String), Bundle> = self
            .bundles
            .into_iter()
            .map(|b| ((b.package.clone(), b.name.clone()), b))
            .collect();
        for b in newer.bundles {
            bundles.insert((b.package.clone(), b.name.clone()), b);
        }

        DeclarativeConfig {
            packages: packages.into_values().collect(),
            channels: channels.into_values().collect(),
            bundles: bundles.into_values().collect(),
        }
    }

    /// Every image referenced by the catalog: each bundle image plus its
    /// related images, deduplicated, empty strings dropped.
    pub fn referenced_images(&self) -> Vec<&str> {
        let mut images: Vec<&str> = Vec::new();
        for b in &self.bundles {
            if !b.image.is_empty() && !images.contains(&b.image.as_str()) {
                images.push(&b.image);
            }
            for ri in &b.related_images {
                if !ri.image.is_empty() && !images.contains(&ri.image.as_str()) {
                    images.push(&ri.image);
                }
            }
        }
        images
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    pub(crate) fn sample_bundle(package: &str, name: &str, version: &str) -> Bundle {
        Bundle {
            schema: SCHEMA_BUNDLE.to_string(),
            name: name.to_string(),
            package: package.to_string(),
            image: format!("quay.io/{package}/{name}"),
            properties: vec![Property {
                kind: PROPERTY_PACKAGE.to_string(),
                value: serde_json::json!({"packageName": package, "version": version}),
            }],
            related_images: vec![],
        }
    }

    fn sample_dc() -> DeclarativeConfig {
        DeclarativeConfig {
            packages: vec![Package {
                schema: SCHEMA_PACKAGE.to_string(),
                name: "etcd".to_string(),
                default_channel: "stable".to_string(),
                description: None,
            }],
            channels: vec![Channel {
                schema: SCHEMA_CHANNEL.to_string(),
                name: "stable".to_string(),
                package: "etcd".to_string(),
                entries: vec![
                    ChannelEntry {
                        name: "etcd.v0.9.0".to_string(),
                        ..Default::default()
                    },
                    ChannelEntry {
                        name: "etcd.v0.9.2".to_string(),
                        replaces: "etcd.v0.9.0".to_string(),
                        ..Default::default()
                    },
                ],
            }],
            bundles: vec![
                sample_bundle("etcd", "etcd.v0.9.0", "0.9.0"),
                sample_bundle("etcd", "etcd.v0.9.2", "0.9.2"),
            ],
        }
    }

    #[test]
    fn test_channel_head() {
        let dc = sample_dc();
        assert_eq!(dc.channels[0].head().unwrap().name, "etcd.v0.9.2");
    }

    #[test]
    fn test_channel_head_with_skips() {
        let channel = Channel {
            schema: SCHEMA_CHANNEL.to_string(),
            name: "stable".to_string(),
            package: "p".to_string(),
            entries: vec![
                ChannelEntry {
                    name: "p.v1".to_string(),
                    ..Default::default()
                },
                ChannelEntry {
                    name: "p.v3".to_string(),
                    replaces: "p.v1".to_string(),
                    skips: vec!["p.v2".to_string()],
                    ..Default::default()
                },
                ChannelEntry {
                    name: "p.v2".to_string(),
                    ..Default::default()
                },
            ],
        };
        assert_eq!(channel.head().unwrap().name, "p.v3");
    }

    #[test]
    fn test_bundle_version() {
        let b = sample_bundle("etcd", "etcd.v0.9.2", "0.9.2");
        assert_eq!(b.version().unwrap(), semver::Version::new(0, 9, 2));
        let no_props = Bundle {
            properties: vec![],
            ..b
        };
        assert!(no_props.version().is_none());
    }

    #[test]
    fn test_load_dir_json_stream() {
        let tmp = TempDir::new().unwrap();
        let mut content = String::new();
        content.push_str(&serde_json::to_string(&sample_dc().packages[0]).unwrap());
        content.push('\n');
        content.push_str(&serde_json::to_string(&sample_dc().channels[0]).unwrap());
        content.push('\n');
        content.push_str(&serde_json::to_string(&sample_dc().bundles[0]).unwrap());
        std::fs::write(tmp.path().join("index.json"), content).unwrap();

        let dc = DeclarativeConfig::load_dir(tmp.path()).unwrap();
        assert_eq!(dc.packages.len(), 1);
        assert_eq!(dc.channels.len(), 1);
        assert_eq!(dc.bundles.len(), 1);
    }

    #[test]
    fn test_load_dir_skips_unknown_schema() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join("index.json"),
            r#"{"schema":"olm.deprecations","message":"x"}"#,
        )
        .unwrap();
        let dc = DeclarativeConfig::load_dir(tmp.path()).unwrap();
        assert!(dc.is_empty());
    }

    #[test]
    fn test_load_dir_yaml() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join("catalog.yaml"),
            "schema: olm.package\nname: etcd\ndefaultChannel: stable\n",
        )
        .unwrap();
        let dc = DeclarativeConfig::load_dir(tmp.path()).unwrap();
        assert_eq!(dc.packages.len(), 1);
        assert_eq!(dc.packages[0].default_channel, "stable");
    }

    #[test]
    fn test_write_then_load_round_trip() {
        let tmp = TempDir::new().unwrap();
        let dc = sample_dc();
        dc.write_json(tmp.path()).unwrap();
        let back = DeclarativeConfig::load_dir(tmp.path()).unwrap();
        assert_eq!(back.packages, dc.packages);
        assert_eq!(back.channels, dc.channels);
        assert_eq!(back.bundles, dc.bundles);
    }

    #[test]
    fn test_merge_newer_overrides() {
        let old = sample_dc();
        let mut newer = DeclarativeConfig::default();
        newer.channels.push(Channel {
            schema: SCHEMA_CHANNEL.to_string(),
            name: "stable".to_string(),
            package: "etcd".to_string(),
            entries: vec![ChannelEntry {
                name: "etcd.v0.9.4".to_string(),
                replaces: "etcd.v0.9.2".to_string(),
                ..Default::default()
            }],
        });

        let merged = old.merge(newer);
        // One channel survives: the newer one.
        assert_eq!(merged.channels.len(), 1);
        assert_eq!(merged.channels[0].head().unwrap().name, "etcd.v0.9.4");
        // Untouched records survive from the old side.
        assert_eq!(merged.packages.len(), 1);
        assert_eq!(merged.bundles.len(), 2);
    }

    #[test]
    fn test_referenced_images_deduplicated() {
        let mut dc = sample_dc();
        dc.bundles[0].related_images.push(RelatedImage {
            name: "operand".to_string(),
            image: "quay.io/etcd/operand:v1".to_string(),
        });
        dc.bundles[1].related_images.push(RelatedImage {
            name: "operand".to_string(),
            image: "quay.io/etcd/operand:v1".to_string(),
        });
        let images = dc.referenced_images();
        assert_eq!(images.len(), 3);
    }
}
