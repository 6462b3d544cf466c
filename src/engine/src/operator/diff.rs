//! Catalog generation diff.
//!
//! Given the catalog rendered at the previous run's pinned digest and the
//! current catalog, produce the declarative config of everything new:
//! packages, channels, and bundles absent from the old catalog at the
//! same version, plus bundles whose upgrade-edge tail newly appears. The
//! result is ordered so that merging it over the old catalog overrides
//! colliding records.

use airlift_core::declcfg::{Channel, DeclarativeConfig};

/// Compute the incremental catalog between two generations.
pub fn diff(old: &DeclarativeConfig, new: &DeclarativeConfig) -> DeclarativeConfig {
    let mut out = DeclarativeConfig::default();

    for pkg in &new.packages {
        if !old.packages.iter().any(|p| p.name == pkg.name) {
            out.packages.push(pkg.clone());
        }
    }

    for channel in &new.channels {
        let old_channel = old
            .channels
            .iter()
            .find(|c| c.package == channel.package && c.name == channel.name);
        match old_channel {
            None => out.channels.push(channel.clone()),
            Some(old_channel) => {
                let fresh = fresh_entries(old_channel, channel);
                if !fresh.is_empty() {
                    let mut slim = channel.clone();
                    slim.entries = fresh;
                    out.channels.push(slim);
                }
            }
        }
    }

    for bundle in &new.bundles {
        let seen_before = old
            .bundles
            .iter()
            .any(|b| b.package == bundle.package && b.name == bundle.name);
        let referenced = out.channels.iter().any(|c| {
            c.package == bundle.package && c.entries.iter().any(|e| e.name == bundle.name)
        });
        if !seen_before || referenced {
            out.bundles.push(bundle.clone());
        }
    }

    out
}

// Entries of `new` that are not in `old`, plus entries whose upgrade edge
// (replaces) now points at a bundle that did not exist before.
fn fresh_entries(
    old: &Channel,
    new: &Channel,
) -> Vec<airlift_core::declcfg::ChannelEntry> {
    new.entries
        .iter()
        .filter(|entry| {
            let existed = old.entries.iter().any(|e| e == *entry);
            let tail_is_new = !entry.replaces.is_empty()
                && !old.entries.iter().any(|e| e.name == entry.replaces);
            !existed || tail_is_new
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use airlift_core::declcfg::{ChannelEntry, Package, SCHEMA_CHANNEL, SCHEMA_PACKAGE};
    use crate::testutil::sample_bundle;

    fn channel(package: &str, name: &str, entries: Vec<ChannelEntry>) -> Channel {
        Channel {
            schema: SCHEMA_CHANNEL.to_string(),
            name: name.to_string(),
            package: package.to_string(),
            entries,
        }
    }

    fn entry(name: &str, replaces: &str) -> ChannelEntry {
        ChannelEntry {
            name: name.to_string(),
            replaces: replaces.to_string(),
            ..Default::default()
        }
    }

    fn generation(versions: &[(&str, &str)]) -> DeclarativeConfig {
        DeclarativeConfig {
            packages: vec![Package {
                schema: SCHEMA_PACKAGE.to_string(),
                name: "pkg".to_string(),
                default_channel: "stable".to_string(),
                description: None,
            }],
            channels: vec![channel(
                "pkg",
                "stable",
                versions.iter().map(|(n, r)| entry(n, r)).collect(),
            )],
            bundles: versions
                .iter()
                .map(|(n, _)| sample_bundle("pkg", n, n.trim_start_matches("pkg.v")))
                .collect(),
        }
    }

    #[test]
    fn test_diff_empty_when_unchanged() {
        let old = generation(&[("pkg.v1.0.0", "")]);
        let new = old.clone();
        let d = diff(&old, &new);
        assert!(d.is_empty());
    }

    #[test]
    fn test_diff_new_bundle_version() {
        let old = generation(&[("pkg.v1.0.0", "")]);
        let new = generation(&[("pkg.v1.0.0", ""), ("pkg.v1.2.0", "pkg.v1.0.0")]);
        let d = diff(&old, &new);

        // Package already known; only the new channel entry and bundle.
        assert!(d.packages.is_empty());
        assert_eq!(d.channels.len(), 1);
        assert_eq!(d.channels[0].entries.len(), 1);
        assert_eq!(d.channels[0].entries[0].name, "pkg.v1.2.0");
        let names: Vec<&str> = d.bundles.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, vec!["pkg.v1.2.0"]);
    }

    #[test]
    fn test_diff_new_package_carried_whole() {
        let old = DeclarativeConfig::default();
        let new = generation(&[("pkg.v1.0.0", "")]);
        let d = diff(&old, &new);
        assert_eq!(d.packages.len(), 1);
        assert_eq!(d.channels.len(), 1);
        assert_eq!(d.bundles.len(), 1);
    }

    #[test]
    fn test_diff_new_edge_tail_includes_entry() {
        // The old channel knew v1.0.0 directly; the new channel rewires
        // v1.1.0 to replace a bundle the old channel never had.
        let old = generation(&[("pkg.v1.1.0", "pkg.v1.0.5")]);
        let mut new = generation(&[("pkg.v1.1.0", "pkg.v1.0.9")]);
        new.bundles.push(sample_bundle("pkg", "pkg.v1.0.9", "1.0.9"));
        let d = diff(&old, &new);
        assert!(d.channels[0].entries.iter().any(|e| e.name == "pkg.v1.1.0"));
    }

    #[test]
    fn test_diff_merge_overrides_channel_head() {
        let old = generation(&[("pkg.v1.0.0", "")]);
        let new = generation(&[("pkg.v1.0.0", ""), ("pkg.v2.0.0", "pkg.v1.0.0")]);
        let d = diff(&old, &new);
        let merged = old.merge(d);
        // Post-merge head reflects the new generation.
        assert_eq!(merged.channels[0].head().unwrap().name, "pkg.v2.0.0");
        assert_eq!(merged.bundles.len(), 2);
    }
}
