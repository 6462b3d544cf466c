//! Cincinnati upgrade-graph client and traversal.
//!
//! The graph service returns versioned nodes and directed upgrade edges
//! per (channel, architecture). The client is a trait so planner tests
//! inject canned graphs instead of talking HTTP.

use std::collections::{BTreeSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use semver::Version;
use serde::{Deserialize, Serialize};

use airlift_core::{MirrorError, Result};

/// Default upstream graph endpoint.
pub const DEFAULT_GRAPH_URL: &str = "https://api.openshift.com/api/upgrades_info/v1/graph";

/// Graph queries finish quickly or not at all; keep the timeout short.
const GRAPH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub version: Version,
    /// Release payload image reference, digest-addressed
    pub payload: String,
}

/// An upgrade graph: nodes and directed edges (from-index, to-index).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpgradeGraph {
    #[serde(default)]
    pub nodes: Vec<GraphNode>,
    #[serde(default)]
    pub edges: Vec<(usize, usize)>,
}

impl UpgradeGraph {
    fn index_of(&self, version: &Version) -> Option<usize> {
        self.nodes.iter().position(|n| &n.version == version)
    }

    /// The channel head: the highest version present.
    pub fn head(&self) -> Option<&GraphNode> {
        self.nodes.iter().max_by(|a, b| a.version.cmp(&b.version))
    }

    /// Nodes reachable by walking edges from `min` up to and including
    /// `max`. The start node itself is part of the result.
    pub fn walk(&self, channel: &str, min: &Version, max: &Version) -> Result<Vec<&GraphNode>> {
        let start = self.index_of(min).ok_or_else(|| MirrorError::Graph {
            channel: channel.to_string(),
            message: format!("version {min} not found in channel"),
        })?;
        if self.index_of(max).is_none() {
            return Err(MirrorError::Graph {
                channel: channel.to_string(),
                message: format!("version {max} not found in channel"),
            });
        }

        let mut reachable: BTreeSet<usize> = BTreeSet::new();
        let mut queue = VecDeque::from([start]);
        while let Some(current) = queue.pop_front() {
            if !reachable.insert(current) {
                continue;
            }
            for &(from, to) in &self.edges {
                if from == current && self.nodes[to].version <= *max && !reachable.contains(&to) {
                    queue.push_back(to);
                }
            }
        }

        let mut nodes: Vec<&GraphNode> = reachable.into_iter().map(|i| &self.nodes[i]).collect();
        nodes.sort_by(|a, b| a.version.cmp(&b.version));
        Ok(nodes)
    }
}

/// Injectable graph query client.
#[async_trait]
pub trait GraphClient: Send + Sync {
    async fn get_graph(&self, channel: &str, arch: &str) -> Result<UpgradeGraph>;
}

/// HTTP client against the Cincinnati endpoint.
pub struct CincinnatiClient {
    http: reqwest::Client,
    endpoint: String,
}

// Wire format: nodes carry string versions; edges are two-element arrays.
#[derive(Deserialize)]
struct WireGraph {
    #[serde(default)]
    nodes: Vec<WireNode>,
    #[serde(default)]
    edges: Vec<[usize; 2]>,
}

#[derive(Deserialize)]
struct WireNode {
    version: String,
    payload: String,
}

impl CincinnatiClient {
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(GRAPH_TIMEOUT)
            .build()
            .map_err(|e| MirrorError::Transient(e.to_string()))?;
        Ok(CincinnatiClient {
            http,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl GraphClient for CincinnatiClient {
    async fn get_graph(&self, channel: &str, arch: &str) -> Result<UpgradeGraph> {
        let graph_err = |message: String| MirrorError::Graph {
            channel: channel.to_string(),
            message,
        };

        let response = self
            .http
            .get(&self.endpoint)
            .query(&[("channel", channel), ("arch", arch)])
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    MirrorError::Transient(format!("graph query for {channel}: {e}"))
                } else {
                    graph_err(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            if status.is_server_error() {
                return Err(MirrorError::Transient(format!(
                    "graph query for {channel}: HTTP {status}"
                )));
            }
            return Err(graph_err(format!("HTTP {status}")));
        }

        let wire: WireGraph = response.json().await.map_err(|e| graph_err(e.to_string()))?;
        let mut graph = UpgradeGraph::default();
        for node in wire.nodes {
            let version = Version::parse(&node.version)
                .map_err(|e| graph_err(format!("node version {}: {e}", node.version)))?;
            graph.nodes.push(GraphNode {
                version,
                payload: node.payload,
            });
        }
        graph.edges = wire.edges.into_iter().map(|[a, b]| (a, b)).collect();
        Ok(graph)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn graph(versions: &[&str], edges: &[(usize, usize)]) -> UpgradeGraph {
        UpgradeGraph {
            nodes: versions
                .iter()
                .map(|v| GraphNode {
                    version: Version::parse(v).unwrap(),
                    payload: format!("quay.io/openshift/release@sha256:{}", v.replace('.', "")),
                })
                .collect(),
            edges: edges.to_vec(),
        }
    }

    #[test]
    fn test_head_is_highest_version() {
        let g = graph(&["4.9.1", "4.9.10", "4.9.2"], &[]);
        assert_eq!(g.head().unwrap().version, Version::parse("4.9.10").unwrap());
    }

    #[test]
    fn test_walk_linear_chain() {
        let g = graph(&["4.9.1", "4.9.2", "4.9.3"], &[(0, 1), (1, 2)]);
        let nodes = g
            .walk(
                "stable",
                &Version::parse("4.9.1").unwrap(),
                &Version::parse("4.9.3").unwrap(),
            )
            .unwrap();
        let versions: Vec<String> = nodes.iter().map(|n| n.version.to_string()).collect();
        assert_eq!(versions, vec!["4.9.1", "4.9.2", "4.9.3"]);
    }

    #[test]
    fn test_walk_respects_max() {
        let g = graph(&["4.9.1", "4.9.2", "4.9.3"], &[(0, 1), (1, 2)]);
        let nodes = g
            .walk(
                "stable",
                &Version::parse("4.9.1").unwrap(),
                &Version::parse("4.9.2").unwrap(),
            )
            .unwrap();
        assert_eq!(nodes.len(), 2);
    }

    #[test]
    fn test_walk_branching() {
        // 0 -> 1, 0 -> 2, 2 -> 3; node 1 is a dead end below max.
        let g = graph(
            &["4.9.1", "4.9.2", "4.9.5", "4.9.9"],
            &[(0, 1), (0, 2), (2, 3)],
        );
        let nodes = g
            .walk(
                "stable",
                &Version::parse("4.9.1").unwrap(),
                &Version::parse("4.9.9").unwrap(),
            )
            .unwrap();
        assert_eq!(nodes.len(), 4);
    }

    #[test]
    fn test_walk_unreachable_nodes_excluded() {
        let g = graph(&["4.9.1", "4.9.2", "4.9.3"], &[(1, 2)]);
        let nodes = g
            .walk(
                "stable",
                &Version::parse("4.9.1").unwrap(),
                &Version::parse("4.9.3").unwrap(),
            )
            .unwrap();
        // Only the start is reachable: no edges leave it.
        assert_eq!(nodes.len(), 1);
    }

    #[test]
    fn test_walk_missing_version_is_error() {
        let g = graph(&["4.9.1"], &[]);
        let err = g
            .walk(
                "stable",
                &Version::parse("4.8.0").unwrap(),
                &Version::parse("4.9.1").unwrap(),
            )
            .unwrap_err();
        assert!(matches!(err, MirrorError::Graph { .. }));
    }

    #[test]
    fn test_wire_format_parses() {
        let wire = r#"{"nodes":[{"version":"4.9.1","payload":"quay.io/p@sha256:aa"}],"edges":[[0,0]]}"#;
        let parsed: WireGraph = serde_json::from_str(wire).unwrap();
        assert_eq!(parsed.nodes.len(), 1);
        assert_eq!(parsed.edges, vec![[0, 0]]);
    }
}
