//! Catalog include-filter normalization and application.
//!
//! The user-facing include config (per-package channels, min/max versions,
//! bundle names) is normalized into explicit ranges before use: a min and
//! max become the range `>=min <=max`, a lone min becomes a version list,
//! a lone max becomes `<=max`, and minBundle/bundles become an explicit
//! bundle list. The normalized form is also what the rebuild cache key is
//! fingerprinted from.

use md5::{Digest, Md5};
use semver::Version;
use serde::{Deserialize, Serialize};

use airlift_core::config::IncludeConfig;
use airlift_core::declcfg::DeclarativeConfig;
use airlift_core::{MirrorError, Result};

/// Normalized per-channel constraint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ChannelFilter {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub versions: Vec<Version>,
}

/// Normalized per-package constraint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PackageFilter {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub channels: Vec<ChannelFilter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub versions: Vec<Version>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bundles: Vec<String>,
}

/// Normalized catalog filter; empty means "full catalog".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CatalogFilter {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub packages: Vec<PackageFilter>,
}

impl CatalogFilter {
    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    /// Normalize an include config. Packages and channels are sorted by
    /// name so the fingerprint is independent of declaration order.
    pub fn from_include(include: &IncludeConfig) -> Result<CatalogFilter> {
        let mut packages = Vec::new();
        for (i, pkg) in include.packages.iter().enumerate() {
            if pkg.name.is_empty() {
                return Err(MirrorError::Config(format!("package {i} requires a name")));
            }
            let mut bundles = pkg.bundles.clone();
            if !pkg.min_bundle.is_empty() {
                bundles.push(pkg.min_bundle.clone());
            }

            let (range, versions) = normalize_bounds(&pkg.min_version, &pkg.max_version)?;

            let mut channels = Vec::new();
            for ch in &pkg.channels {
                let (range, versions) = normalize_bounds(&ch.min_version, &ch.max_version)?;
                channels.push(ChannelFilter {
                    name: ch.name.clone(),
                    range,
                    versions,
                });
            }
            channels.sort_by(|a, b| a.name.cmp(&b.name));

            packages.push(PackageFilter {
                name: pkg.name.clone(),
                channels,
                range,
                versions,
                bundles,
            });
        }
        packages.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(CatalogFilter { packages })
    }

    /// MD5 fingerprint of the canonical JSON form, used as the rebuild
    /// cache key. Cosmetic catalog options (target catalog/tag) are not
    /// part of the normalized form, so they cannot perturb the key.
    pub fn fingerprint(&self) -> Result<String> {
        let canonical = serde_json::to_vec(self)?;
        Ok(hex::encode(Md5::digest(&canonical)))
    }

    /// Apply the filter to a catalog, dropping packages, channels, and
    /// bundles not matched. An empty filter returns the catalog whole.
    pub fn apply(&self, dc: DeclarativeConfig) -> DeclarativeConfig {
        if self.is_empty() {
            return dc;
        }

        let mut out = DeclarativeConfig::default();
        for pkg_filter in &self.packages {
            let versions: std::collections::BTreeMap<&str, Option<Version>> = dc
                .bundles
                .iter()
                .filter(|b| b.package == pkg_filter.name)
                .map(|b| (b.name.as_str(), b.version()))
                .collect();

            out.packages.extend(
                dc.packages
                    .iter()
                    .filter(|p| p.name == pkg_filter.name)
                    .cloned(),
            );

            for channel in dc.channels.iter().filter(|c| c.package == pkg_filter.name) {
                let channel_filter = pkg_filter
                    .channels
                    .iter()
                    .find(|cf| cf.name == channel.name);
                if !pkg_filter.channels.is_empty() && channel_filter.is_none() {
                    continue;
                }

                let mut filtered = channel.clone();
                filtered.entries.retain(|entry| {
                    if !pkg_filter.bundles.is_empty() {
                        return pkg_filter.bundles.iter().any(|b| b == &entry.name);
                    }
                    let version = versions.get(entry.name.as_str()).cloned().flatten();
                    match channel_filter {
                        Some(cf) => matches_bounds(&version, &cf.range, &cf.versions)
                            && matches_bounds(&version, &pkg_filter.range, &pkg_filter.versions),
                        None => matches_bounds(&version, &pkg_filter.range, &pkg_filter.versions),
                    }
                });
                if !filtered.entries.is_empty() {
                    out.channels.push(filtered);
                }
            }

            out.bundles.extend(
                dc.bundles
                    .iter()
                    .filter(|b| {
                        b.package == pkg_filter.name
                            && out
                                .channels
                                .iter()
                                .any(|c| c.entries.iter().any(|e| e.name == b.name))
                    })
                    .cloned(),
            );
        }
        out
    }
}

// Bounds normalization: both set -> range, min only -> version list,
// max only -> max-bounded range.
fn normalize_bounds(min: &str, max: &str) -> Result<(Option<String>, Vec<Version>)> {
    let parse = |raw: &str| {
        Version::parse(raw)
            .map_err(|e| MirrorError::Config(format!("invalid version {raw}: {e}")))
    };
    match (min.is_empty(), max.is_empty()) {
        (true, true) => Ok((None, vec![])),
        (false, false) => {
            parse(min)?;
            parse(max)?;
            Ok((Some(format!(">={min} <={max}")), vec![]))
        }
        (false, true) => Ok((None, vec![parse(min)?])),
        (true, false) => {
            parse(max)?;
            Ok((Some(format!("<={max}")), vec![]))
        }
    }
}

fn parse_bounds(range: &str) -> (Option<Version>, Option<Version>) {
    let mut min = None;
    let mut max = None;
    for part in range.split_whitespace() {
        if let Some(v) = part.strip_prefix(">=") {
            min = Version::parse(v).ok();
        } else if let Some(v) = part.strip_prefix("<=") {
            max = Version::parse(v).ok();
        }
    }
    (min, max)
}

// A listed version acts as a lower bound: the include set runs from it
// up to the channel head.
fn matches_bounds(version: &Option<Version>, range: &Option<String>, versions: &[Version]) -> bool {
    if range.is_none() && versions.is_empty() {
        return true;
    }
    let Some(version) = version else {
        // Unversioned bundles cannot match a version constraint.
        return false;
    };
    if let Some(range) = range {
        let (min, max) = parse_bounds(range);
        let above = min.map(|m| *version >= m).unwrap_or(true);
        let below = max.map(|m| *version <= m).unwrap_or(true);
        return above && below;
    }
    versions.iter().min().map(|m| version >= m).unwrap_or(true)
}

/// Reduce a catalog to the head bundle of every channel (headsOnly mode).
pub fn retain_heads(dc: DeclarativeConfig) -> DeclarativeConfig {
    let mut out = DeclarativeConfig {
        packages: dc.packages.clone(),
        ..Default::default()
    };
    let mut kept: Vec<(String, String)> = Vec::new();
    for channel in &dc.channels {
        let Some(head) = channel.head().cloned() else {
            continue;
        };
        kept.push((channel.package.clone(), head.name.clone()));
        let mut slim = channel.clone();
        slim.entries = vec![head];
        out.channels.push(slim);
    }
    out.bundles = dc
        .bundles
        .into_iter()
        .filter(|b| kept.iter().any(|(p, n)| p == &b.package && n == &b.name))
        .collect();
    out
}
